//! Per-track sample queues between the session (writer) and the external
//! decode/render stage (reader). Single writer, single reader, guarded by a
//! plain mutex; close and clear are safe while the queue is full.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::AccessUnit;

/// Occupancy snapshot used for buffer budgeting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub bytes: u64,
    pub duration_us: u64,
    pub samples: usize,
}

#[derive(Default)]
struct Inner {
    samples: VecDeque<AccessUnit>,
    bytes: u64,
    duration_us: u64,
    closed: bool,
    /// Raw track-header and sub-sample boxes prepended to every dequeued
    /// subtitle sample; subtitle decoding needs that context alongside the
    /// bare sample bytes.
    subtitle_header: Option<Vec<u8>>,
}

pub struct SampleQueue {
    inner: Mutex<Inner>,
    max_bytes: u64,
    max_duration_us: u64,
}

impl SampleQueue {
    pub fn new(max_bytes: u64, max_duration_us: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_bytes,
            max_duration_us,
        }
    }

    /// Enqueues a sample. Returns false when the queue has been closed; a
    /// full queue still accepts (fullness only gates scheduling, it is not a
    /// hard capacity).
    pub fn push(&self, sample: AccessUnit) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        inner.bytes += sample.payload.len() as u64;
        inner.duration_us += sample.duration_us;
        inner.samples.push_back(sample);
        true
    }

    /// Dequeues the oldest sample. Subtitle samples get the stored raw
    /// header boxes prepended to their payload.
    pub fn pop(&self) -> Option<AccessUnit> {
        let mut inner = self.inner.lock().unwrap();
        let mut sample = inner.samples.pop_front()?;
        inner.bytes -= sample.payload.len() as u64;
        inner.duration_us = inner.duration_us.saturating_sub(sample.duration_us);
        if let Some(header) = &inner.subtitle_header {
            // Config units and the end-of-stream marker are not media
            // payloads and stay as pushed.
            if !sample.codec_config && !sample.end_of_stream {
                let mut payload = Vec::with_capacity(header.len() + sample.payload.len());
                payload.extend_from_slice(header);
                payload.append(&mut sample.payload);
                sample.payload = payload;
            }
        }
        Some(sample)
    }

    /// Drops all queued samples, keeping the queue usable.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.samples.clear();
        inner.bytes = 0;
        inner.duration_us = 0;
    }

    /// Closes the queue for writing and drops queued samples.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.samples.clear();
        inner.bytes = 0;
        inner.duration_us = 0;
    }

    /// Reopens a closed queue (after a seek, once state is consistent again).
    pub fn reopen(&self) {
        self.inner.lock().unwrap().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Full when either the byte or the duration budget is reached; such a
    /// queue is skipped by the download scheduler until drained.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.bytes >= self.max_bytes || inner.duration_us >= self.max_duration_us
    }

    pub fn occupancy(&self) -> Occupancy {
        let inner = self.inner.lock().unwrap();
        Occupancy {
            bytes: inner.bytes,
            duration_us: inner.duration_us,
            samples: inner.samples.len(),
        }
    }

    pub fn set_subtitle_header(&self, header: Option<Vec<u8>>) {
        self.inner.lock().unwrap().subtitle_header = header;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpd::TrackType;

    fn sample(bytes: usize, duration_us: u64) -> AccessUnit {
        AccessUnit {
            track: TrackType::Video,
            time_us: 0,
            duration_us,
            payload: vec![0xAA; bytes],
            codec_config: false,
            format_change: false,
            end_of_stream: false,
            error: false,
        }
    }

    #[test]
    fn occupancy_tracks_push_and_pop() {
        let queue = SampleQueue::new(1000, 1_000_000);
        assert!(queue.push(sample(100, 40_000)));
        assert!(queue.push(sample(200, 40_000)));
        assert_eq!(
            queue.occupancy(),
            Occupancy {
                bytes: 300,
                duration_us: 80_000,
                samples: 2
            }
        );
        assert_eq!(queue.pop().unwrap().payload.len(), 100);
        assert_eq!(queue.occupancy().bytes, 200);
    }

    #[test]
    fn full_by_bytes_or_duration() {
        let queue = SampleQueue::new(250, 1_000_000);
        queue.push(sample(100, 0));
        assert!(!queue.is_full());
        queue.push(sample(200, 0));
        assert!(queue.is_full());

        let queue = SampleQueue::new(u64::MAX, 100_000);
        queue.push(sample(1, 100_000));
        assert!(queue.is_full());
    }

    #[test]
    fn close_rejects_writes_and_drains() {
        let queue = SampleQueue::new(1000, 1_000_000);
        queue.push(sample(100, 0));
        queue.close();
        assert!(queue.pop().is_none());
        assert!(!queue.push(sample(1, 0)));
        queue.reopen();
        assert!(queue.push(sample(1, 0)));
    }

    #[test]
    fn subtitle_header_prepended_on_dequeue() {
        let queue = SampleQueue::new(1000, 1_000_000);
        queue.set_subtitle_header(Some(vec![1, 2, 3]));
        let mut s = sample(2, 0);
        s.track = TrackType::Subtitle;
        s.payload = vec![9, 9];
        queue.push(s);
        let out = queue.pop().unwrap();
        assert_eq!(out.payload, vec![1, 2, 3, 9, 9]);
    }

    #[test]
    fn end_of_stream_marker_stays_empty() {
        let queue = SampleQueue::new(1000, 1_000_000);
        queue.set_subtitle_header(Some(vec![1, 2, 3]));
        let mut marker = sample(0, 0);
        marker.track = TrackType::Subtitle;
        marker.end_of_stream = true;
        queue.push(marker);
        let out = queue.pop().unwrap();
        assert!(out.end_of_stream);
        assert!(out.payload.is_empty());
    }
}
