//! Per-user alert channel hub.
//!
//! One persistent bidirectional channel per user, fanning in anomaly events
//! from all of that user's streams. The hub owns every write: producers
//! enqueue onto a bounded per-user mailbox, and a single writer task drains
//! it to the socket, so alerts and heartbeats are serialized and delivered
//! in submission order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::event::{AlertResult, ServerMessage};
use super::AlertSink;
use crate::error::Error;

/// Close code when a newer channel replaces this one.
pub const CLOSE_SUPERSEDED: u16 = 4000;
/// Close code when the peer stops answering heartbeats.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4001;
/// Close code for failed channel authentication.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

/// Outbound mailbox depth per user. Producers block when a burst fills it.
pub const MAILBOX_CAPACITY: usize = 32;

struct UserChannel {
    channel_id: Uuid,
    tx: mpsc::Sender<Message>,
    connected_at: DateTime<Utc>,
    last_heartbeat: Arc<StdMutex<DateTime<Utc>>>,
    heartbeat_task: JoinHandle<()>,
}

/// Observability snapshot for one user channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub user_id: Uuid,
    pub connected: bool,
    pub connected_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub last_heartbeat_at: DateTime<Utc>,
    pub seconds_since_heartbeat: i64,
}

pub struct AlertHub {
    channels: Mutex<HashMap<Uuid, UserChannel>>,
    ping_interval: Duration,
    heartbeat_timeout: Duration,
    external_sink: Option<Arc<dyn AlertSink>>,
}

impl AlertHub {
    pub fn new(external_sink: Option<Arc<dyn AlertSink>>) -> Arc<Self> {
        Self::with_timing(
            external_sink,
            Duration::from_secs(30),
            Duration::from_secs(60),
        )
    }

    pub fn with_timing(
        external_sink: Option<Arc<dyn AlertSink>>,
        ping_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            ping_interval,
            heartbeat_timeout,
            external_sink,
        })
    }

    /// Register a channel for a user, superseding any existing one, and
    /// start its heartbeat task. Returns the channel id the socket handler
    /// must use for detach.
    pub async fn attach(self: &Arc<Self>, user_id: Uuid, tx: mpsc::Sender<Message>) -> Uuid {
        let channel_id = Uuid::new_v4();
        let now = Utc::now();
        let last_heartbeat = Arc::new(StdMutex::new(now));

        let heartbeat_task = tokio::spawn(heartbeat_loop(
            Arc::downgrade(self),
            user_id,
            channel_id,
            tx.clone(),
            Arc::clone(&last_heartbeat),
            self.ping_interval,
            self.heartbeat_timeout,
        ));

        let replaced = {
            let mut channels = self.channels.lock().await;
            channels.insert(
                user_id,
                UserChannel {
                    channel_id,
                    tx,
                    connected_at: now,
                    last_heartbeat,
                    heartbeat_task,
                },
            )
        };

        if let Some(old) = replaced {
            info!("[hub] superseding channel for user {}", user_id);
            close_channel(&old, CLOSE_SUPERSEDED, "superseded").await;
        }

        let count = self.channels.lock().await.len();
        info!("[hub] channel attached for user {} ({} active)", user_id, count);
        channel_id
    }

    /// Remove a channel, but only if it is still the one identified by
    /// `channel_id` -- a disconnect observed on a superseded socket must not
    /// tear down its replacement.
    pub async fn detach(&self, user_id: Uuid, channel_id: Uuid) {
        let removed = {
            let mut channels = self.channels.lock().await;
            match channels.get(&user_id) {
                Some(current) if current.channel_id == channel_id => channels.remove(&user_id),
                _ => None,
            }
        };
        if let Some(channel) = removed {
            channel.heartbeat_task.abort();
            info!("[hub] channel detached for user {}", user_id);
        }
    }

    /// Record liveness from any inbound client frame.
    pub async fn touch(&self, user_id: Uuid) {
        let channels = self.channels.lock().await;
        if let Some(channel) = channels.get(&user_id) {
            *channel.last_heartbeat.lock().expect("heartbeat lock poisoned") = Utc::now();
        }
    }

    /// Enqueue a pong reply for an inbound ping.
    pub async fn send_pong(&self, user_id: Uuid) {
        if let Some(tx) = self.sender_for(user_id).await {
            let _ = tx.send(to_text(&ServerMessage::pong_now())).await;
        }
    }

    /// Push an anomaly alert to the user's channel, then forward a compact
    /// summary to the external sink when one is configured for the shop.
    /// Sends to users without an open channel are dropped.
    pub async fn send_alert(
        &self,
        user_id: Uuid,
        stream_id: Uuid,
        location: &str,
        result: AlertResult,
        annotated_jpeg: &[u8],
        external_target: Option<&str>,
    ) -> Result<(), Error> {
        let summary = format!(
            "Anomaly detected at {}: person {} ({} confidence, score {:.2})",
            location, result.person_id, result.confidence, result.score
        );

        let message = ServerMessage::AnomalyDetected {
            user_id,
            stream_id,
            result,
            annotated_frame: BASE64.encode(annotated_jpeg),
            frame_format: "jpeg".to_string(),
        };

        match self.sender_for(user_id).await {
            Some(tx) => {
                tx.send(to_text(&message))
                    .await
                    .map_err(|_| Error::Transport("alert channel closed".to_string()))?;
                debug!("[hub] alert delivered to user {} (stream {})", user_id, stream_id);
            }
            None => {
                debug!("[hub] no channel for user {}, alert dropped", user_id);
            }
        }

        // Secondary sink is best-effort and never blocks the primary path.
        if let (Some(sink), Some(target)) = (&self.external_sink, external_target) {
            if let Err(e) = sink.deliver(target, &summary).await {
                warn!("[hub] external sink delivery failed: {}", e);
            }
        }

        Ok(())
    }

    /// Close every channel with the given reason (shutdown path).
    pub async fn close_all(&self, reason: &'static str) {
        let drained: Vec<(Uuid, UserChannel)> = {
            let mut channels = self.channels.lock().await;
            channels.drain().collect()
        };
        for (user_id, channel) in drained {
            debug!("[hub] closing channel for user {}: {}", user_id, reason);
            close_channel(&channel, 1000, reason).await;
        }
    }

    pub async fn stats(&self, user_id: Uuid) -> Option<ChannelStats> {
        let channels = self.channels.lock().await;
        channels.get(&user_id).map(|c| snapshot(user_id, c))
    }

    pub async fn stats_all(&self) -> Vec<ChannelStats> {
        let channels = self.channels.lock().await;
        channels
            .iter()
            .map(|(user_id, c)| snapshot(*user_id, c))
            .collect()
    }

    async fn sender_for(&self, user_id: Uuid) -> Option<mpsc::Sender<Message>> {
        let channels = self.channels.lock().await;
        channels.get(&user_id).map(|c| c.tx.clone())
    }
}

fn snapshot(user_id: Uuid, channel: &UserChannel) -> ChannelStats {
    let now = Utc::now();
    let last_heartbeat = *channel
        .last_heartbeat
        .lock()
        .expect("heartbeat lock poisoned");
    ChannelStats {
        user_id,
        connected: true,
        connected_at: channel.connected_at,
        uptime_seconds: (now - channel.connected_at).num_seconds(),
        last_heartbeat_at: last_heartbeat,
        seconds_since_heartbeat: (now - last_heartbeat).num_seconds(),
    }
}

fn to_text(message: &ServerMessage) -> Message {
    Message::Text(serde_json::to_string(message).expect("server message serializes"))
}

async fn close_channel(channel: &UserChannel, code: u16, reason: &'static str) {
    channel.heartbeat_task.abort();
    let _ = channel
        .tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn heartbeat_loop(
    hub: Weak<AlertHub>,
    user_id: Uuid,
    channel_id: Uuid,
    tx: mpsc::Sender<Message>,
    last_heartbeat: Arc<StdMutex<DateTime<Utc>>>,
    ping_interval: Duration,
    heartbeat_timeout: Duration,
) {
    let mut interval = tokio::time::interval(ping_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        interval.tick().await;

        let silence = {
            let last = *last_heartbeat.lock().expect("heartbeat lock poisoned");
            (Utc::now() - last)
                .to_std()
                .unwrap_or(Duration::ZERO)
        };

        if silence >= heartbeat_timeout {
            warn!(
                "[hub] heartbeat timeout for user {} ({}s silent)",
                user_id,
                silence.as_secs()
            );
            let _ = tx
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_HEARTBEAT_TIMEOUT,
                    reason: "heartbeat_timeout".into(),
                })))
                .await;
            if let Some(hub) = hub.upgrade() {
                hub.detach(user_id, channel_id).await;
            }
            return;
        }

        if tx.send(to_text(&ServerMessage::ping_now())).await.is_err() {
            // Socket writer is gone; the receive loop handles detach.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{Bbox, Classification, ConfidenceBucket};

    fn alert_result() -> AlertResult {
        AlertResult::new(
            1,
            24,
            -3.2,
            Classification::Abnormal,
            ConfidenceBucket::High,
            Bbox::new(1.0, 2.0, 3.0, 4.0),
        )
    }

    fn channel() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(MAILBOX_CAPACITY)
    }

    #[tokio::test]
    async fn second_attach_supersedes_the_first() {
        let hub = AlertHub::new(None);
        let user = Uuid::new_v4();

        let (tx1, mut rx1) = channel();
        hub.attach(user, tx1).await;
        let first_stats = hub.stats(user).await.unwrap();

        let (tx2, _rx2) = channel();
        hub.attach(user, tx2).await;

        match rx1.recv().await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, CLOSE_SUPERSEDED);
                assert_eq!(frame.reason, "superseded");
            }
            other => panic!("expected close frame, got {:?}", other),
        }

        let all = hub.stats_all().await;
        assert_eq!(all.len(), 1);
        assert!(all[0].connected_at >= first_stats.connected_at);
    }

    #[tokio::test]
    async fn alerts_arrive_in_submission_order() {
        let hub = AlertHub::new(None);
        let user = Uuid::new_v4();
        let stream = Uuid::new_v4();
        let (tx, mut rx) = channel();
        hub.attach(user, tx).await;

        for frame_number in [1u64, 2, 3] {
            let mut result = alert_result();
            result.frame_number = frame_number;
            hub.send_alert(user, stream, "Entrance", result, b"jpeg", None)
                .await
                .unwrap();
        }

        for expected in [1u64, 2, 3] {
            let msg = rx.recv().await.expect("alert delivered");
            let Message::Text(text) = msg else {
                panic!("expected text frame");
            };
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], "anomaly_detected");
            assert_eq!(value["result"]["frame_number"], expected);
        }
    }

    #[tokio::test]
    async fn alert_to_absent_user_is_dropped() {
        let hub = AlertHub::new(None);
        let outcome = hub
            .send_alert(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "Entrance",
                alert_result(),
                b"jpeg",
                None,
            )
            .await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn stale_detach_leaves_the_new_channel_alone() {
        let hub = AlertHub::new(None);
        let user = Uuid::new_v4();

        let (tx1, _rx1) = channel();
        let first_id = hub.attach(user, tx1).await;
        let (tx2, _rx2) = channel();
        hub.attach(user, tx2).await;

        hub.detach(user, first_id).await;
        assert!(hub.stats(user).await.is_some());
    }

    #[tokio::test]
    async fn heartbeat_silence_closes_with_4001() {
        let hub = AlertHub::with_timing(
            None,
            Duration::from_millis(20),
            Duration::from_millis(60),
        );
        let user = Uuid::new_v4();
        let (tx, mut rx) = channel();
        hub.attach(user, tx).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let msg = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("close must arrive before the deadline")
                .expect("channel open");
            match msg {
                Message::Close(Some(frame)) => {
                    assert_eq!(frame.code, CLOSE_HEARTBEAT_TIMEOUT);
                    break;
                }
                Message::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    assert_eq!(value["type"], "ping");
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }

        // Eviction is visible through stats once detach lands.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hub.stats(user).await.is_none());
    }

    #[tokio::test]
    async fn touch_resets_the_heartbeat_clock() {
        let hub = AlertHub::new(None);
        let user = Uuid::new_v4();
        let (tx, _rx) = channel();
        hub.attach(user, tx).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        hub.touch(user).await;
        let stats = hub.stats(user).await.unwrap();
        assert!(stats.seconds_since_heartbeat <= 1);
    }
}
