//! The engine's work queue: two bounded lanes consumed by one worker.
//!
//! The processing loop is fed from a priority pair of channels. Fresh
//! receptions and synthesized continuation frames (search probes, delivery
//! confirmations) go through the urgent lane; normal sends and re-queued
//! wait items go through the back of the normal lane. The worker receives
//! with a left-biased select; anything urgent is handled before anything
//! merely pending, and waits can never starve new arrivals.

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use embassy_time::Instant;

use crate::frame::Frame;

/// Compile-time depth of each lane. Doubles as the upper bound of the
/// runtime `queue_size` configuration, which governs admission accounting.
pub(crate) const WORK_QUEUE_DEPTH: usize = 64;

/// Where a work item is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkState {
    /// Needs a transmission attempt towards its next hop.
    ToSend,
    /// Arrived from the link, not yet dispatched.
    OnRecv,
    /// Transmission is parked until a route to the target is learned.
    WaitRoute,
    /// Originated unicast waiting for its delivery confirmation.
    WaitResponse,
}

/// One unit of work: a frame, its processing state, and the moment it
/// started waiting (meaningful for the two wait states).
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkItem {
    pub state: WorkState,
    pub waiting_since: Instant,
    pub frame: Frame,
}

impl WorkItem {
    pub fn new(state: WorkState, frame: Frame) -> Self {
        WorkItem {
            state,
            waiting_since: Instant::now(),
            frame,
        }
    }
}

type Lane = Channel<CriticalSectionRawMutex, WorkItem, WORK_QUEUE_DEPTH>;

/// Bounded two-lane FIFO with a priority receive.
pub(crate) struct WorkQueue {
    urgent: Lane,
    normal: Lane,
}

impl WorkQueue {
    pub const fn new() -> Self {
        WorkQueue {
            urgent: Channel::new(),
            normal: Channel::new(),
        }
    }

    /// Next item to process; urgent wins whenever both lanes are ready.
    pub async fn recv(&self) -> WorkItem {
        match select(self.urgent.receive(), self.normal.receive()).await {
            Either::First(item) | Either::Second(item) => item,
        }
    }

    /// Front-insertion discipline: the item is handled before everything in
    /// the normal lane. Returns the item back on overflow.
    pub fn push_front(&self, item: WorkItem) -> Result<(), WorkItem> {
        self.urgent.try_send(item).map_err(|err| match err {
            TrySendError::Full(item) => item,
        })
    }

    /// Normal back-insertion. Returns the item back on overflow.
    pub fn push_back(&self, item: WorkItem) -> Result<(), WorkItem> {
        self.normal.try_send(item).map_err(|err| match err {
            TrySendError::Full(item) => item,
        })
    }

    /// Items currently queued across both lanes.
    pub fn occupied(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }

    /// Free slots under the configured admission bound (not the lane depth).
    pub fn free_slots(&self, queue_size: usize) -> usize {
        queue_size.saturating_sub(self.occupied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameKind, MacAddr};

    fn probe(id: u32) -> Frame {
        Frame {
            message_id: id,
            target: MacAddr::BROADCAST,
            source: MacAddr::new([1, 2, 3, 4, 5, 6]),
            sender: MacAddr::new([1, 2, 3, 4, 5, 6]),
            kind: FrameKind::SearchRequest,
        }
    }

    #[test]
    fn urgent_lane_wins() {
        let queue = WorkQueue::new();
        queue.push_back(WorkItem::new(WorkState::ToSend, probe(1))).unwrap();
        queue.push_back(WorkItem::new(WorkState::ToSend, probe(2))).unwrap();
        queue.push_front(WorkItem::new(WorkState::OnRecv, probe(3))).unwrap();

        let order: Vec<u32> = (0..3)
            .map(|_| futures::executor::block_on(queue.recv()).frame.message_id)
            .collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn free_slot_accounting_uses_the_configured_bound() {
        let queue = WorkQueue::new();
        assert_eq!(queue.free_slots(8), 8);
        queue.push_back(WorkItem::new(WorkState::ToSend, probe(1))).unwrap();
        queue.push_front(WorkItem::new(WorkState::OnRecv, probe(2))).unwrap();
        assert_eq!(queue.occupied(), 2);
        assert_eq!(queue.free_slots(8), 6);
        assert_eq!(queue.free_slots(1), 0);
    }
}
