//! In-memory index of active peer connections.
//!
//! Both maps (by stream and by user) live under one lock, so the two
//! indexes can never disagree. Peer connections are closed outside the
//! lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::Error;

/// Shared per-stream counters, written by the processor and read by the
/// listing endpoints.
#[derive(Debug, Default)]
pub struct StreamStats {
    pub frames_processed: AtomicU64,
    pub anomalies_detected: AtomicU64,
}

/// One live stream: peer connection plus its binding.
pub struct StreamHandle {
    pub stream_id: Uuid,
    pub user_id: Uuid,
    pub shop_id: Uuid,
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub pc: Arc<RTCPeerConnection>,
    pub stats: Arc<StreamStats>,
}

/// Listing view of a stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub stream_id: Uuid,
    pub shop_id: Uuid,
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub frames_processed: u64,
    pub anomalies_detected: u64,
}

impl From<&StreamHandle> for StreamInfo {
    fn from(handle: &StreamHandle) -> Self {
        Self {
            stream_id: handle.stream_id,
            shop_id: handle.shop_id,
            location: handle.location.clone(),
            created_at: handle.created_at,
            frames_processed: handle.stats.frames_processed.load(Ordering::Relaxed),
            anomalies_detected: handle.stats.anomalies_detected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct RegistryIndex {
    by_stream: HashMap<Uuid, Arc<StreamHandle>>,
    by_user: HashMap<Uuid, HashSet<Uuid>>,
}

#[derive(Default)]
pub struct StreamRegistry {
    index: Mutex<RegistryIndex>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. A stream id maps to at most one live handle.
    pub async fn add(&self, handle: Arc<StreamHandle>) -> Result<(), Error> {
        let mut index = self.index.lock().await;
        if index.by_stream.contains_key(&handle.stream_id) {
            return Err(Error::Internal(format!(
                "stream {} already registered",
                handle.stream_id
            )));
        }
        index
            .by_user
            .entry(handle.user_id)
            .or_default()
            .insert(handle.stream_id);
        info!(
            "[{}/{}] stream registered",
            handle.user_id, handle.stream_id
        );
        index.by_stream.insert(handle.stream_id, handle);
        Ok(())
    }

    /// Remove one stream from both indexes.
    pub async fn remove(&self, stream_id: Uuid) -> Option<Arc<StreamHandle>> {
        let mut index = self.index.lock().await;
        let handle = index.by_stream.remove(&stream_id)?;
        if let Some(streams) = index.by_user.get_mut(&handle.user_id) {
            streams.remove(&stream_id);
            if streams.is_empty() {
                index.by_user.remove(&handle.user_id);
            }
        }
        info!("[{}/{}] stream removed", handle.user_id, stream_id);
        Some(handle)
    }

    /// Remove every stream belonging to a user.
    pub async fn remove_all(&self, user_id: Uuid) -> Vec<Arc<StreamHandle>> {
        let mut index = self.index.lock().await;
        let stream_ids = index.by_user.remove(&user_id).unwrap_or_default();
        stream_ids
            .into_iter()
            .filter_map(|id| index.by_stream.remove(&id))
            .collect()
    }

    pub async fn get(&self, stream_id: Uuid) -> Option<Arc<StreamHandle>> {
        self.index.lock().await.by_stream.get(&stream_id).cloned()
    }

    /// All streams for a user, newest last.
    pub async fn list(&self, user_id: Uuid) -> Vec<StreamInfo> {
        let index = self.index.lock().await;
        let mut streams: Vec<StreamInfo> = index
            .by_user
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| index.by_stream.get(id))
            .map(|handle| StreamInfo::from(handle.as_ref()))
            .collect();
        streams.sort_by_key(|s| s.created_at);
        streams
    }

    pub async fn stream_count(&self) -> usize {
        self.index.lock().await.by_stream.len()
    }

    /// Remove a stream and close its peer connection.
    pub async fn teardown(&self, stream_id: Uuid) -> Result<(), Error> {
        let handle = self
            .remove(stream_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("stream {} not found", stream_id)))?;
        close_handle(&handle).await;
        Ok(())
    }

    /// Remove all of a user's streams and close each peer connection.
    /// Returns how many were closed.
    pub async fn teardown_user(&self, user_id: Uuid) -> usize {
        let handles = self.remove_all(user_id).await;
        let count = handles.len();
        for handle in handles {
            close_handle(&handle).await;
        }
        count
    }

    /// Tear down every registered stream (shutdown path).
    pub async fn teardown_all(&self) -> usize {
        let handles: Vec<Arc<StreamHandle>> = {
            let mut index = self.index.lock().await;
            index.by_user.clear();
            index.by_stream.drain().map(|(_, h)| h).collect()
        };
        let count = handles.len();
        for handle in handles {
            close_handle(&handle).await;
        }
        count
    }
}

async fn close_handle(handle: &StreamHandle) {
    if let Err(e) = handle.pc.close().await {
        warn!(
            "[{}/{}] error closing peer connection: {}",
            handle.user_id, handle.stream_id, e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    async fn handle(user_id: Uuid) -> Arc<StreamHandle> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        Arc::new(StreamHandle {
            stream_id: Uuid::new_v4(),
            user_id,
            shop_id: Uuid::new_v4(),
            location: "Entrance".to_string(),
            created_at: Utc::now(),
            pc: Arc::new(pc),
            stats: Arc::new(StreamStats::default()),
        })
    }

    #[tokio::test]
    async fn duplicate_stream_ids_are_rejected() {
        let registry = StreamRegistry::new();
        let user = Uuid::new_v4();
        let first = handle(user).await;
        registry.add(Arc::clone(&first)).await.unwrap();
        assert!(registry.add(first).await.is_err());
    }

    #[tokio::test]
    async fn list_reflects_adds_and_removes() {
        let registry = StreamRegistry::new();
        let user = Uuid::new_v4();

        let a = handle(user).await;
        let b = handle(user).await;
        registry.add(Arc::clone(&a)).await.unwrap();
        registry.add(Arc::clone(&b)).await.unwrap();
        assert_eq!(registry.list(user).await.len(), 2);

        registry.remove(a.stream_id).await.unwrap();
        let remaining = registry.list(user).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].stream_id, b.stream_id);
    }

    #[tokio::test]
    async fn remove_all_clears_both_indexes() {
        let registry = StreamRegistry::new();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        registry.add(handle(user).await).await.unwrap();
        registry.add(handle(user).await).await.unwrap();
        registry.add(handle(other).await).await.unwrap();

        let removed = registry.remove_all(user).await;
        assert_eq!(removed.len(), 2);
        assert!(registry.list(user).await.is_empty());
        assert_eq!(registry.stream_count().await, 1);
        assert_eq!(registry.list(other).await.len(), 1);
    }

    #[tokio::test]
    async fn teardown_unknown_stream_is_not_found() {
        let registry = StreamRegistry::new();
        let err = registry.teardown(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn teardown_user_closes_and_counts() {
        let registry = StreamRegistry::new();
        let user = Uuid::new_v4();
        registry.add(handle(user).await).await.unwrap();
        registry.add(handle(user).await).await.unwrap();

        assert_eq!(registry.teardown_user(user).await, 2);
        assert_eq!(registry.stream_count().await, 0);
    }
}
