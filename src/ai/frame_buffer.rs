//! Per-person pose sequence buffering.
//!
//! Keeps the last N pose frames for every tracked person. A sequence is
//! only handed out when the window is completely full, so the classifier
//! never sees a partial sequence.

use std::collections::HashMap;
use std::collections::VecDeque;

use super::PoseFrame;

pub struct FrameBufferManager {
    capacity: usize,
    buffers: HashMap<u32, VecDeque<PoseFrame>>,
}

impl FrameBufferManager {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "sequence length must be positive");
        Self {
            capacity,
            buffers: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a pose frame for a person, evicting the oldest at capacity.
    pub fn push(&mut self, person_id: u32, pose: PoseFrame) {
        let buffer = self
            .buffers
            .entry(person_id)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(pose);
    }

    /// The full N-length sequence for a person, oldest first, or `None`
    /// while the window is still filling.
    pub fn sequence(&self, person_id: u32) -> Option<Vec<PoseFrame>> {
        self.buffers
            .get(&person_id)
            .filter(|buffer| buffer.len() == self.capacity)
            .map(|buffer| buffer.iter().copied().collect())
    }

    /// Drop a person's buffer (track aged out).
    pub fn remove(&mut self, person_id: u32) {
        self.buffers.remove(&person_id);
    }

    /// Current buffered state for every person, for evidence preservation.
    pub fn snapshot_all(&self) -> HashMap<u32, Vec<PoseFrame>> {
        self.buffers
            .iter()
            .map(|(id, buffer)| (*id, buffer.iter().copied().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose(marker: f32) -> PoseFrame {
        let mut frame = PoseFrame::zeroed();
        frame.0[0] = [marker, marker, 1.0];
        frame
    }

    #[test]
    fn sequence_is_none_until_full() {
        let mut buffers = FrameBufferManager::new(24);
        for i in 0..23 {
            buffers.push(1, pose(i as f32));
        }
        assert!(buffers.sequence(1).is_none());

        buffers.push(1, pose(23.0));
        let seq = buffers.sequence(1).expect("full buffer yields a sequence");
        assert_eq!(seq.len(), 24);
        assert_eq!(seq[0], pose(0.0));
        assert_eq!(seq[23], pose(23.0));
    }

    #[test]
    fn eviction_keeps_length_at_capacity() {
        let mut buffers = FrameBufferManager::new(24);
        for i in 0..30 {
            buffers.push(7, pose(i as f32));
        }
        let seq = buffers.sequence(7).expect("buffer stays full");
        assert_eq!(seq.len(), 24);
        // Oldest entries were evicted; the window slid forward.
        assert_eq!(seq[0], pose(6.0));
        assert_eq!(seq[23], pose(29.0));
    }

    #[test]
    fn remove_drops_the_person() {
        let mut buffers = FrameBufferManager::new(4);
        for i in 0..4 {
            buffers.push(1, pose(i as f32));
        }
        buffers.remove(1);
        assert!(buffers.sequence(1).is_none());
        assert!(buffers.snapshot_all().is_empty());
    }

    #[test]
    fn snapshot_preserves_partial_buffers() {
        let mut buffers = FrameBufferManager::new(24);
        buffers.push(1, pose(1.0));
        buffers.push(2, pose(2.0));
        buffers.push(2, pose(3.0));

        let snapshot = buffers.snapshot_all();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&1].len(), 1);
        assert_eq!(snapshot[&2].len(), 2);
    }

    #[test]
    fn persons_buffer_independently() {
        let mut buffers = FrameBufferManager::new(2);
        buffers.push(1, pose(1.0));
        buffers.push(1, pose(2.0));
        buffers.push(2, pose(9.0));

        assert!(buffers.sequence(1).is_some());
        assert!(buffers.sequence(2).is_none());
    }
}
