// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The picture sync gate.
//!
//! When the client returns an output buffer for reuse, the GPU may still be
//! reading it. A fence is inserted into the graphics command stream and the
//! picture is held here until the fence signals; only then may the buffer go
//! back to the engine. Fences are polled rather than waited on, because the
//! adapter is single-threaded and must not starve other client-thread work.

use std::time::Duration;
use std::time::Instant;

/// Poll cadence for fence status. 5 ms allows a few frames of decode-ahead
/// without adding noticeable reuse latency.
pub const SYNC_POLL_DELAY: Duration = Duration::from_millis(5);

/// A fence inserted into the graphics command stream when a picture was
/// returned. Dropped (destroying the underlying sync object) as soon as it
/// reports signaled.
pub trait PictureFence {
    fn is_signaled(&self) -> bool;
}

/// The graphics surface the adapter creates fences against. Stands in for
/// the display handle plus its fence-sync extension.
pub trait FenceFactory {
    /// Whether the surface supports fence sync at all. Checked once during
    /// initialization, before the adapter claims support.
    fn supports_fence_sync(&self) -> bool;

    fn create_fence(&self) -> anyhow::Result<Box<dyn PictureFence>>;
}

struct PendingSync {
    picture_buffer_id: i32,
    fence: Box<dyn PictureFence>,
    next_poll: Instant,
}

/// Holds one fence per in-flight reused picture and polls them at a fixed
/// cadence from the client thread.
#[derive(Default)]
pub struct PictureSyncGate {
    pending: Vec<PendingSync>,
}

impl PictureSyncGate {
    /// Starts gating `picture_buffer_id` behind `fence`. The fence is due
    /// for its first status check immediately; an already-signaled fence
    /// releases on the next [`poll`](Self::poll).
    pub fn defer(&mut self, picture_buffer_id: i32, fence: Box<dyn PictureFence>, now: Instant) {
        self.pending.push(PendingSync { picture_buffer_id, fence, next_poll: now });
    }

    /// Polls every fence whose poll deadline has passed. Returns the ids of
    /// pictures whose fences signaled, in the order they were deferred;
    /// unsignaled fences are re-armed one poll period out.
    pub fn poll(&mut self, now: Instant) -> Vec<i32> {
        let mut released = Vec::new();
        self.pending.retain_mut(|sync| {
            if now < sync.next_poll {
                return true;
            }
            if sync.fence.is_signaled() {
                released.push(sync.picture_buffer_id);
                false
            } else {
                sync.next_poll = now + SYNC_POLL_DELAY;
                true
            }
        });
        released
    }

    /// The earliest pending poll deadline, if any picture is gated.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|s| s.next_poll).min()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    struct ScriptedFence {
        polls_until_signaled: Rc<Cell<u32>>,
    }

    impl PictureFence for ScriptedFence {
        fn is_signaled(&self) -> bool {
            let left = self.polls_until_signaled.get();
            if left == 0 {
                true
            } else {
                self.polls_until_signaled.set(left - 1);
                false
            }
        }
    }

    #[test]
    fn fence_released_only_after_signal() {
        let polls = Rc::new(Cell::new(2));
        let mut gate = PictureSyncGate::default();
        let t0 = Instant::now();
        gate.defer(3, Box::new(ScriptedFence { polls_until_signaled: polls.clone() }), t0);

        // Immediate check, unsignaled; re-armed one period out.
        assert!(gate.poll(t0).is_empty());
        assert!(!gate.is_empty());
        assert_eq!(gate.next_deadline(), Some(t0 + SYNC_POLL_DELAY));

        // Second unsignaled poll.
        assert!(gate.poll(t0 + SYNC_POLL_DELAY).is_empty());

        // Third poll observes the signal.
        assert_eq!(gate.poll(t0 + 2 * SYNC_POLL_DELAY), vec![3]);
        assert!(gate.is_empty());
        assert_eq!(gate.next_deadline(), None);
    }

    #[test]
    fn release_order_matches_defer_order() {
        let mut gate = PictureSyncGate::default();
        let t0 = Instant::now();
        for id in [5, 1, 9] {
            gate.defer(id, Box::new(ScriptedFence { polls_until_signaled: Rc::new(Cell::new(0)) }), t0);
        }
        assert_eq!(gate.poll(t0 + SYNC_POLL_DELAY), vec![5, 1, 9]);
    }
}
