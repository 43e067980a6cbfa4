//! On-disk persistence of per-account gateway session state.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// The fields persisted per account across process restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub last_seq: Option<u64>,
    pub last_connected_at: Option<chrono::DateTime<chrono::Utc>>,
    pub intent_level_index: usize,
    pub saved_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SessionState {
    pub fn is_resumable(&self) -> bool {
        self.session_id.is_some() && self.last_seq.is_some()
    }
}

/// Keyed-by-account persistence with a debounced/coalesced writer task, so
/// per-frame `lastSeq` updates don't fsync on every dispatch.
pub struct SessionStore {
    dir: PathBuf,
    pending: Arc<Mutex<Option<(String, SessionState)>>>,
}

const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(500);

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> SessionStore {
        SessionStore {
            dir: dir.into(),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    fn path_for(&self, account_id: &str) -> PathBuf {
        self.dir.join(format!("{account_id}.session.json"))
    }

    /// Load a previously persisted session, if any.
    pub async fn load(&self, account_id: &str) -> Option<SessionState> {
        let path = self.path_for(account_id);
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(%account_id, "corrupt session state, discarding: {err}");
                None
            }
        }
    }

    /// Write immediately — used for `READY`/`RESUMED`, which must always
    /// persist right away rather than waiting for the debounce window.
    pub async fn save_now(&self, account_id: &str, state: &SessionState) -> Result<()> {
        let mut state = state.clone();
        state.saved_at = Some(chrono::Utc::now());
        let path = self.path_for(account_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let bytes = serde_json::to_vec_pretty(&state)?;
        tokio::fs::write(&path, bytes).await?;
        debug!(%account_id, "session state saved");
        Ok(())
    }

    /// Schedule a debounced write for a `lastSeq` update: the latest value
    /// wins and at most one write happens per [`DEBOUNCE`] window.
    pub async fn save_lazy(self: &Arc<Self>, account_id: &str, state: SessionState) {
        let mut pending = self.pending.lock().await;
        let should_spawn = pending.is_none();
        *pending = Some((account_id.to_string(), state));
        drop(pending);

        if should_spawn {
            let store = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(DEBOUNCE).await;
                let taken = store.pending.lock().await.take();
                if let Some((account_id, state)) = taken {
                    if let Err(err) = store.save_now(&account_id, &state).await {
                        warn!(%account_id, "lazy session save failed: {err}");
                    }
                }
            });
        }
    }

    pub async fn clear(&self, account_id: &str) {
        let path = self.path_for(account_id);
        tokio::fs::remove_file(&path).await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("qqbot-session-test-{}", uuid_like()))
    }

    fn uuid_like() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64
    }

    #[tokio::test]
    async fn round_trips_session_state() {
        let dir = temp_dir();
        let store = SessionStore::new(&dir);
        let state = SessionState {
            session_id: Some("S1".into()),
            last_seq: Some(17),
            last_connected_at: Some(chrono::Utc::now()),
            intent_level_index: 0,
            saved_at: None,
        };
        store.save_now("acct-1", &state).await.unwrap();

        let loaded = store.load("acct-1").await.unwrap();
        assert_eq!(loaded.session_id.as_deref(), Some("S1"));
        assert_eq!(loaded.last_seq, Some(17));
        assert!(loaded.is_resumable());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = temp_dir();
        let store = SessionStore::new(&dir);
        assert!(store.load("never-written").await.is_none());
    }

    #[tokio::test]
    async fn lazy_save_coalesces_rapid_updates() {
        let dir = temp_dir();
        let store = Arc::new(SessionStore::new(&dir));

        for seq in 0..5u64 {
            store
                .save_lazy(
                    "acct-1",
                    SessionState {
                        session_id: Some("S1".into()),
                        last_seq: Some(seq),
                        last_connected_at: None,
                        intent_level_index: 0,
                        saved_at: None,
                    },
                )
                .await;
        }

        tokio::time::sleep(DEBOUNCE * 2).await;
        let loaded = store.load("acct-1").await.unwrap();
        assert_eq!(loaded.last_seq, Some(4));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
