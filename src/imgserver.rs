//! Optional local passthrough image cache (feature `image-server`), for
//! hosts that need a stable HTTP URL for an image resolved from a local
//! path rather than shipping it as a base64 data URL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::Mutex;
use tracing::{debug, info};

const ENTRY_TTL: Duration = Duration::from_secs(3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct Entry {
    bytes: Arc<Vec<u8>>,
    content_type: String,
    inserted_at: Instant,
}

/// In-memory cache keyed by an opaque id, served over HTTP so reply
/// pipelines can hand back a URL instead of embedding bytes inline.
/// Eviction is best-effort and time-based; there is no guarantee an id
/// stays servable past [`ENTRY_TTL`].
#[derive(Clone)]
pub struct ImageCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ImageCache {
    pub fn new() -> ImageCache {
        ImageCache { entries: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Insert bytes under `id`, overwriting any existing entry.
    pub async fn put(&self, id: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            id.into(),
            Entry {
                bytes: Arc::new(bytes),
                content_type: content_type.into(),
                inserted_at: Instant::now(),
            },
        );
    }

    async fn get(&self, id: &str) -> Option<(String, Arc<Vec<u8>>)> {
        let entries = self.entries.lock().await;
        entries.get(id).map(|e| (e.content_type.clone(), Arc::clone(&e.bytes)))
    }

    /// Spawn the background task that periodically drops entries older
    /// than [`ENTRY_TTL`]. Eviction is best-effort: a request racing a
    /// sweep may still see a 404 for an id that was valid a moment ago.
    pub fn spawn_sweeper(&self) {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let mut entries = entries.lock().await;
                let before = entries.len();
                entries.retain(|_, entry| entry.inserted_at.elapsed() < ENTRY_TTL);
                let evicted = before - entries.len();
                if evicted > 0 {
                    debug!(evicted, "image cache sweep evicted expired entries");
                }
            }
        });
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}

async fn serve_image(State(cache): State<ImageCache>, Path(id): Path<String>) -> Response {
    match cache.get(&id).await {
        Some((content_type, bytes)) => {
            ([(header::CONTENT_TYPE, content_type)], bytes.as_ref().clone()).into_response()
        }
        None => (StatusCode::NOT_FOUND, "image not found or expired").into_response(),
    }
}

/// Build the router for the passthrough cache; the host mounts and serves
/// it however it serves its other local HTTP surfaces.
pub fn router(cache: ImageCache) -> Router {
    cache.spawn_sweeper();
    Router::new()
        .route("/images/:id", get(serve_image))
        .with_state(cache)
}

/// Bind and serve the image cache on its own listener, for hosts that want
/// a standalone process rather than mounting [`router`] into a larger app.
pub async fn serve(cache: ImageCache, addr: std::net::SocketAddr) -> std::io::Result<()> {
    info!(%addr, "image cache listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(cache)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = ImageCache::new();
        cache.put("abc", "image/png", vec![1, 2, 3]).await;
        let (content_type, bytes) = cache.get("abc").await.unwrap();
        assert_eq!(content_type, "image/png");
        assert_eq!(*bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn missing_id_returns_none() {
        let cache = ImageCache::new();
        assert!(cache.get("missing").await.is_none());
    }
}
