//! Per-stream multi-person tracker.
//!
//! Associates detections with existing tracks greedily by IoU, assigns
//! monotonically increasing ids to newcomers, and ages out tracks that go
//! unmatched. It also hosts the pose-estimation call for each matched
//! detection, so downstream components only ever see `(id, bbox, pose)`.

use std::sync::Arc;

use image::RgbImage;

use super::model_manager::ModelManager;
use super::{Bbox, Detection, PoseFrame};
use crate::error::Error;

#[derive(Debug, Clone)]
struct Track {
    person_id: u32,
    last_bbox: Bbox,
    last_seen_frame: u64,
    missed_frames: u32,
}

/// One tracked person in the current frame.
#[derive(Debug, Clone)]
pub struct TrackedPerson {
    pub person_id: u32,
    pub bbox: Bbox,
    pub keypoints: PoseFrame,
}

/// Result of one tracker update.
#[derive(Debug, Default)]
pub struct TrackUpdate {
    pub tracked: Vec<TrackedPerson>,
    /// Ids whose tracks aged out this frame.
    pub expired: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub iou_threshold: f32,
    pub max_age: u32,
    pub min_confidence: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_age: 30,
            min_confidence: 0.45,
        }
    }
}

pub struct PersonTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
    frame_count: u64,
}

impl PersonTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
            frame_count: 0,
        }
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Associate detections with tracks and estimate a pose for each match.
    pub async fn update(
        &mut self,
        detections: &[Detection],
        frame: &Arc<RgbImage>,
        models: &ModelManager,
    ) -> Result<TrackUpdate, Error> {
        let assignments = self.assign(detections);
        let expired = self.age_out();

        let mut tracked = Vec::with_capacity(assignments.len());
        for (person_id, bbox) in assignments {
            let keypoints = models.pose_keypoints(Arc::clone(frame), bbox).await?;
            tracked.push(TrackedPerson {
                person_id,
                bbox,
                keypoints,
            });
        }

        Ok(TrackUpdate { tracked, expired })
    }

    /// Pure association step: greedy by descending detection confidence,
    /// IoU against each track's last bbox, equal-IoU ties to the lower
    /// person id. Unmatched confident detections open new tracks.
    fn assign(&mut self, detections: &[Detection]) -> Vec<(u32, Bbox)> {
        self.frame_count += 1;

        let mut order: Vec<usize> = (0..detections.len()).collect();
        order.sort_by(|&a, &b| {
            detections[b]
                .confidence
                .partial_cmp(&detections[a].confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut assignments = Vec::new();

        for det_idx in order {
            let det = &detections[det_idx];

            let mut best: Option<(usize, f32)> = None;
            for (t_idx, track) in self.tracks.iter().enumerate() {
                if matched_tracks[t_idx] {
                    continue;
                }
                let iou = track.last_bbox.iou(&det.bbox);
                if iou < self.config.iou_threshold {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((best_idx, best_iou)) => {
                        iou > best_iou
                            || (iou == best_iou
                                && track.person_id < self.tracks[best_idx].person_id)
                    }
                };
                if better {
                    best = Some((t_idx, iou));
                }
            }

            match best {
                Some((t_idx, _)) => {
                    matched_tracks[t_idx] = true;
                    let track = &mut self.tracks[t_idx];
                    track.last_bbox = det.bbox;
                    track.last_seen_frame = self.frame_count;
                    track.missed_frames = 0;
                    assignments.push((track.person_id, det.bbox));
                }
                None => {
                    if det.confidence >= self.config.min_confidence {
                        let person_id = self.next_id;
                        self.next_id += 1;
                        self.tracks.push(Track {
                            person_id,
                            last_bbox: det.bbox,
                            last_seen_frame: self.frame_count,
                            missed_frames: 0,
                        });
                        matched_tracks.push(true);
                        assignments.push((person_id, det.bbox));
                    }
                }
            }
        }

        assignments
    }

    /// Increment miss counters and drop tracks past `max_age`.
    fn age_out(&mut self) -> Vec<u32> {
        let frame = self.frame_count;
        for track in self.tracks.iter_mut() {
            if track.last_seen_frame != frame {
                track.missed_frames += 1;
            }
        }

        let max_age = self.config.max_age;
        let mut expired = Vec::new();
        self.tracks.retain(|t| {
            if t.missed_frames > max_age {
                expired.push(t.person_id);
                false
            } else {
                true
            }
        });
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Detection {
        Detection {
            bbox: Bbox::new(x, y, w, h),
            confidence: conf,
        }
    }

    fn tracker() -> PersonTracker {
        PersonTracker::new(TrackerConfig {
            iou_threshold: 0.3,
            max_age: 3,
            min_confidence: 0.45,
        })
    }

    #[test]
    fn ids_are_stable_across_frames() {
        let mut t = tracker();
        let first = t.assign(&[det(100.0, 100.0, 50.0, 120.0, 0.9)]);
        assert_eq!(first, vec![(1, Bbox::new(100.0, 100.0, 50.0, 120.0))]);

        // Slightly moved, well above the IoU threshold.
        let second = t.assign(&[det(105.0, 102.0, 50.0, 120.0, 0.85)]);
        assert_eq!(second[0].0, 1);
        assert_eq!(t.track_count(), 1);
    }

    #[test]
    fn zero_iou_detection_gets_a_fresh_id() {
        let mut t = tracker();
        t.assign(&[det(0.0, 0.0, 40.0, 80.0, 0.9)]);
        let next = t.assign(&[
            det(1.0, 1.0, 40.0, 80.0, 0.9),
            det(500.0, 300.0, 40.0, 80.0, 0.8),
        ]);

        let ids: Vec<u32> = next.iter().map(|(id, _)| *id).collect();
        assert!(ids.contains(&1), "existing id must be preserved");
        assert!(ids.contains(&2), "new detection must get the next id");
    }

    #[test]
    fn low_confidence_strays_do_not_open_tracks() {
        let mut t = tracker();
        let assigned = t.assign(&[det(0.0, 0.0, 40.0, 80.0, 0.3)]);
        assert!(assigned.is_empty());
        assert_eq!(t.track_count(), 0);
    }

    #[test]
    fn higher_confidence_detection_claims_the_contested_track() {
        let mut t = tracker();
        t.assign(&[det(0.0, 0.0, 40.0, 80.0, 0.9)]);

        // Both detections overlap track 1; the confident one wins it and
        // the other becomes a new person.
        let assigned = t.assign(&[
            det(2.0, 2.0, 40.0, 80.0, 0.6),
            det(0.0, 0.0, 40.0, 80.0, 0.95),
        ]);
        let winner = assigned
            .iter()
            .find(|(id, _)| *id == 1)
            .expect("track 1 must be matched");
        assert_eq!(winner.1, Bbox::new(0.0, 0.0, 40.0, 80.0));
    }

    #[test]
    fn tracks_age_out_after_max_age_misses() {
        let mut t = tracker();
        t.assign(&[det(0.0, 0.0, 40.0, 80.0, 0.9)]);

        for _ in 0..3 {
            t.assign(&[]);
            assert!(t.age_out().is_empty());
        }
        t.assign(&[]);
        let expired = t.age_out();
        assert_eq!(expired, vec![1]);
        assert_eq!(t.track_count(), 0);
    }

    #[test]
    fn reappearing_person_after_expiry_gets_a_new_id() {
        let mut t = tracker();
        t.assign(&[det(0.0, 0.0, 40.0, 80.0, 0.9)]);
        for _ in 0..5 {
            t.assign(&[]);
            t.age_out();
        }
        let assigned = t.assign(&[det(0.0, 0.0, 40.0, 80.0, 0.9)]);
        assert_eq!(assigned[0].0, 2);
    }
}
