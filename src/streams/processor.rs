//! Per-stream processing pipeline.
//!
//! One task per stream consumes decoded frames and runs
//! detect -> track -> buffer -> classify -> annotate. Every error inside
//! the per-frame pipeline is logged and swallowed; a bad frame never takes
//! the stream down.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use image::RgbImage;
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use crate::ai::annotate::{annotate_frame, encode_jpeg, PersonOverlay};
use crate::ai::{
    Classification, ConfidenceBucket, FrameBufferManager, ModelManager, PersonTracker,
    TrackedPerson,
};
use crate::ai::tracker::TrackerConfig;
use crate::error::Error;
use crate::messaging::{AlertHub, AlertResult};
use crate::recorder::{AnomalyRecorder, RecordRequest};
use crate::streams::StreamStats;

/// JPEG quality for the websocket alert payload. Evidence frames are
/// encoded separately by the recorder.
const ALERT_JPEG_QUALITY: u8 = 85;

const ANOMALY_TYPE: &str = "suspicious_behavior";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessorState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Everything a processor needs besides its own per-stream state.
pub struct ProcessorContext {
    pub stream_id: Uuid,
    pub user_id: Uuid,
    pub shop_id: Uuid,
    pub location: String,
    /// Telegram chat id of the shop, when configured.
    pub external_target: Option<String>,
    pub models: Arc<ModelManager>,
    pub hub: Arc<AlertHub>,
    pub recorder: Arc<AnomalyRecorder>,
    pub stats: Arc<StreamStats>,
}

pub struct StreamProcessor {
    ctx: ProcessorContext,
    tracker: PersonTracker,
    buffers: FrameBufferManager,
    state: ProcessorState,
    frame_count: u64,
}

struct ScoredPerson {
    person: TrackedPerson,
    score: f32,
    bucket: ConfidenceBucket,
}

impl StreamProcessor {
    pub fn new(ctx: ProcessorContext, tracker_config: TrackerConfig) -> Self {
        let sequence_length = ctx.models.sequence_length();
        Self {
            tracker: PersonTracker::new(tracker_config),
            buffers: FrameBufferManager::new(sequence_length),
            ctx,
            state: ProcessorState::Idle,
            frame_count: 0,
        }
    }

    /// Consume decoded frames until the decoder goes away. The watch
    /// channel only ever holds the newest frame, so falling behind means
    /// skipping frames, not queueing them.
    pub async fn run(mut self, mut frames: watch::Receiver<Option<Arc<RgbImage>>>) {
        self.state = ProcessorState::Running;
        info!(
            "[{}/{}] processor started (shop {})",
            self.ctx.user_id, self.ctx.stream_id, self.ctx.shop_id
        );

        while frames.changed().await.is_ok() {
            if self.state != ProcessorState::Running {
                break;
            }
            let frame = frames.borrow_and_update().clone();
            let Some(frame) = frame else { continue };

            if let Err(e) = self.process_frame(&frame).await {
                warn!(
                    "[{}/{}] frame {} dropped: {}",
                    self.ctx.user_id, self.ctx.stream_id, self.frame_count, e
                );
            }
        }

        self.state = ProcessorState::Stopping;
        let frames_processed = self.ctx.stats.frames_processed.load(Ordering::Relaxed);
        let anomalies = self.ctx.stats.anomalies_detected.load(Ordering::Relaxed);
        self.state = ProcessorState::Stopped;
        info!(
            "[{}/{}] processor stopped ({} frames, {} anomalies)",
            self.ctx.user_id, self.ctx.stream_id, frames_processed, anomalies
        );
    }

    async fn process_frame(&mut self, frame: &Arc<RgbImage>) -> Result<(), Error> {
        self.frame_count += 1;
        self.ctx
            .stats
            .frames_processed
            .fetch_add(1, Ordering::Relaxed);

        let detections = self.ctx.models.detect(Arc::clone(frame)).await?;

        // The tracker still runs on empty frames so absent tracks age out.
        let update = self
            .tracker
            .update(&detections, frame, &self.ctx.models)
            .await?;
        for person_id in &update.expired {
            self.buffers.remove(*person_id);
        }
        for person in &update.tracked {
            self.buffers.push(person.person_id, person.keypoints);
        }

        let abnormal = self.classify_ready(&update.tracked).await;
        if abnormal.is_empty() {
            return Ok(());
        }

        self.ctx
            .stats
            .anomalies_detected
            .fetch_add(abnormal.len() as u64, Ordering::Relaxed);

        let overlays = build_overlays(&update.tracked, &abnormal);
        let annotated = annotate_frame(frame, &overlays);
        let alert_jpeg = encode_jpeg(&annotated, ALERT_JPEG_QUALITY)?;
        let pose_snapshot = self.buffers.snapshot_all();

        for scored in &abnormal {
            info!(
                "[{}/{}] ANOMALY person {} score {:.3} ({:?})",
                self.ctx.user_id,
                self.ctx.stream_id,
                scored.person.person_id,
                scored.score,
                scored.bucket
            );

            let result = AlertResult::new(
                scored.person.person_id,
                self.frame_count,
                scored.score,
                Classification::Abnormal,
                scored.bucket,
                scored.person.bbox,
            );

            if let Err(e) = self
                .ctx
                .hub
                .send_alert(
                    self.ctx.user_id,
                    self.ctx.stream_id,
                    &self.ctx.location,
                    result.clone(),
                    &alert_jpeg,
                    self.ctx.external_target.as_deref(),
                )
                .await
            {
                warn!(
                    "[{}/{}] alert delivery failed: {}",
                    self.ctx.user_id, self.ctx.stream_id, e
                );
            }

            let request = RecordRequest {
                shop_id: self.ctx.shop_id,
                stream_id: self.ctx.stream_id,
                location: self.ctx.location.clone(),
                description: format!(
                    "Anomalous behavior detected (person {}, {} confidence)",
                    scored.person.person_id,
                    scored.bucket.as_str()
                ),
                anomaly_type: ANOMALY_TYPE.to_string(),
                result,
                bucket: scored.bucket,
                pose_dict: pose_snapshot.clone(),
                extra: json!({}),
            };
            // The alert already shipped on the websocket; a persistence
            // failure is logged and the stream keeps going.
            if let Err(e) = self.ctx.recorder.record(request, &annotated).await {
                log::error!(
                    "[{}/{}] anomaly persistence failed: {}",
                    self.ctx.user_id,
                    self.ctx.stream_id,
                    e
                );
            }
        }

        Ok(())
    }

    /// Score every person whose buffer holds a complete sequence; at most
    /// one classification per person per frame.
    async fn classify_ready(&self, tracked: &[TrackedPerson]) -> Vec<ScoredPerson> {
        let thresholds = self.ctx.models.thresholds();
        let mut abnormal = Vec::new();

        for person in tracked {
            let Some(sequence) = self.buffers.sequence(person.person_id) else {
                continue;
            };
            let score = match self.ctx.models.score_sequence(sequence).await {
                Ok(score) => score,
                Err(e) => {
                    warn!(
                        "[{}/{}] classification failed for person {}: {}",
                        self.ctx.user_id, self.ctx.stream_id, person.person_id, e
                    );
                    continue;
                }
            };

            debug!(
                "[{}/{}] person {} scored {:.3}",
                self.ctx.user_id, self.ctx.stream_id, person.person_id, score
            );

            if thresholds.classify(score) == Classification::Abnormal {
                abnormal.push(ScoredPerson {
                    person: person.clone(),
                    score,
                    bucket: thresholds.bucket(score),
                });
            }
        }

        abnormal
    }
}

/// Every tracked person gets a box; abnormal ones are red and carry the
/// score and bucket.
fn build_overlays(tracked: &[TrackedPerson], abnormal: &[ScoredPerson]) -> Vec<PersonOverlay> {
    tracked
        .iter()
        .map(|person| {
            let scored = abnormal
                .iter()
                .find(|s| s.person.person_id == person.person_id);
            PersonOverlay {
                person_id: person.person_id,
                bbox: person.bbox,
                abnormal: scored.is_some(),
                score: scored.map(|s| s.score),
                bucket: scored.map(|s| s.bucket),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{Bbox, PoseFrame};

    fn person(person_id: u32) -> TrackedPerson {
        TrackedPerson {
            person_id,
            bbox: Bbox::new(10.0, 10.0, 40.0, 80.0),
            keypoints: PoseFrame::zeroed(),
        }
    }

    #[test]
    fn overlays_mark_only_abnormal_persons() {
        let tracked = vec![person(1), person(2)];
        let abnormal = vec![ScoredPerson {
            person: person(2),
            score: -3.2,
            bucket: ConfidenceBucket::High,
        }];

        let overlays = build_overlays(&tracked, &abnormal);
        assert_eq!(overlays.len(), 2);

        let normal = overlays.iter().find(|o| o.person_id == 1).unwrap();
        assert!(!normal.abnormal);
        assert!(normal.score.is_none());

        let flagged = overlays.iter().find(|o| o.person_id == 2).unwrap();
        assert!(flagged.abnormal);
        assert_eq!(flagged.score, Some(-3.2));
        assert_eq!(flagged.bucket, Some(ConfidenceBucket::High));
    }
}
