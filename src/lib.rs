//! Gateway client and outbound dispatcher for the QQ Open Platform bot
//! protocol.
//!
//! An [`Account`](config::Account) plus a [`HostServices`](config::HostServices)
//! implementation are enough to run a bot: build a [`gateway::GatewayFsm`]
//! from them and call [`gateway::GatewayFsm::start`] to get a running
//! connection that identifies, resumes across drops, and hands every inbound
//! message to the host's reply pipeline before sending the reply back out.
//!
//! The gateway speaks a Discord-derived op-code protocol over a TLS
//! WebSocket and a REST API for sending and uploading media. See
//! [`gateway`] for the connection state machine and [`dispatcher`] for the
//! outbound send path.

#![warn(missing_docs)]

pub mod config;
pub mod dispatcher;
pub mod error;
#[cfg(feature = "image-server")]
pub mod imgserver;
pub mod diagnostics;
pub mod gateway;
pub mod image;
pub mod inbound_queue;
pub mod intents;
pub mod media;
pub mod model;
pub mod msg_seq;
pub mod reconnect;
pub mod reply_limiter;
pub mod rest;
pub mod session_store;
pub mod target;
pub mod token;

pub use config::{Account, HostServices, PartialReply, SecretSource};
pub use error::{GatewayError, OutboundResult, Result};
pub use gateway::{GatewayFsm, GatewayHandle};
pub use target::{MediaSource, OutboundIntent, Target};
