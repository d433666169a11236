//! Boundary between the engine and the host's radio glue.
//!
//! The engine never touches a NIC. Outbound it emits [`LinkCommand`]s on a
//! bounded channel the host drains against its real link primitive; inbound
//! the host feeds received datagrams into a [`LinkRx`] handle and reports
//! transmit completions through a [`SendCompletion`] handle. The same shape
//! works for hardware glue and for the in-process bus the integration tests
//! wire up.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, with_timeout};

use crate::frame::{Frame, MacAddr, WIRE_FRAME_LEN};
use crate::queue::{WorkItem, WorkQueue, WorkState};
use crate::tables::{SharedSeenIds, lock_seen};

/// Depth of the outbound command channel towards the radio glue.
pub const LINK_COMMAND_CHANNEL_SIZE: usize = 16;
/// Bounded channel carrying engine commands to the host's radio glue.
pub type LinkCommandQueue =
    Channel<CriticalSectionRawMutex, LinkCommand, LINK_COMMAND_CHANNEL_SIZE>;
/// Host-side end of the command channel.
pub type LinkCommandReceiver =
    Receiver<'static, CriticalSectionRawMutex, LinkCommand, LINK_COMMAND_CHANNEL_SIZE>;
/// Engine-side end of the command channel.
pub(crate) type LinkCommandSender =
    Sender<'static, CriticalSectionRawMutex, LinkCommand, LINK_COMMAND_CHANNEL_SIZE>;

/// How long the worker waits for the link to report on one transmission.
pub(crate) const SEND_COMPLETION_TIMEOUT: Duration = Duration::from_millis(50);

/// One instruction for the host's radio glue.
#[derive(Debug, Clone, Copy)]
pub enum LinkCommand {
    /// Register `peer` with the link before transmissions towards it.
    AddPeer(MacAddr),
    /// Unregister `peer`; always follows the transmissions it served.
    DelPeer(MacAddr),
    /// Put one wire frame on the air towards `peer`.
    Transmit {
        peer: MacAddr,
        frame: [u8; WIRE_FRAME_LEN],
    },
}

/// Link verdict on one transmission, reported by the host glue.
#[derive(Debug, Clone, Copy)]
pub struct SendReport {
    pub peer: MacAddr,
    pub delivered: bool,
}

/// Single-shot completion slot: the glue overwrites, the worker's bounded
/// wait consumes. Cleared before every transmit so a stale report from a
/// timed-out attempt cannot satisfy a later wait.
pub(crate) type CompletionSignal = Signal<CriticalSectionRawMutex, SendReport>;

/// What the worker learned from one transmit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Delivered,
    Failed,
    TimedOut,
}

/// Single-shot bounded wait on the completion slot.
pub(crate) async fn await_completion(signal: &CompletionSignal) -> SendOutcome {
    match with_timeout(SEND_COMPLETION_TIMEOUT, signal.wait()).await {
        Ok(report) if report.delivered => SendOutcome::Delivered,
        Ok(_) => SendOutcome::Failed,
        Err(_) => SendOutcome::TimedOut,
    }
}

/// Handle the host calls from its send-completion callback.
#[derive(Clone, Copy)]
pub struct SendCompletion {
    signal: &'static CompletionSignal,
}

impl SendCompletion {
    pub(crate) fn new(signal: &'static CompletionSignal) -> Self {
        SendCompletion { signal }
    }

    /// Reports the link's verdict on the transmission towards `peer`.
    pub fn report(&self, peer: MacAddr, delivered: bool) {
        self.signal.signal(SendReport { peer, delivered });
    }
}

/// Handle the host calls from its receive path with each raw datagram.
///
/// Performs frame admission before anything reaches the worker: exact-size
/// and format checks, mesh membership, queue headroom, and the seen-id dedup
/// window. Everything that fails is dropped silently; loss here is preferred
/// to head-of-line blocking of the processing loop.
#[derive(Clone)]
pub struct LinkRx {
    network_id: u32,
    queue_size: usize,
    queue: &'static WorkQueue,
    seen: SharedSeenIds,
}

impl LinkRx {
    pub(crate) fn new(
        network_id: u32,
        queue_size: usize,
        queue: &'static WorkQueue,
        seen: SharedSeenIds,
    ) -> Self {
        LinkRx {
            network_id,
            queue_size,
            queue,
            seen,
        }
    }

    /// Admits one received datagram. `src_mac` is the link-layer source of
    /// the delivery and becomes the frame's previous hop.
    pub fn deliver(&self, src_mac: MacAddr, bytes: &[u8]) {
        let frame = match Frame::decode(bytes, self.network_id, src_mac) {
            Ok(frame) => frame,
            Err(reason) => {
                log::debug!("dropping datagram from {src_mac}: {reason}");
                return;
            }
        };

        // Headroom check precedes the dedup insert: a frame dropped for
        // backpressure is not remembered, so its retransmission can still
        // be admitted.
        if self.queue.free_slots(self.queue_size) < self.queue_size.saturating_sub(2) {
            log::warn!(
                "work queue congested ({} queued), dropping frame {:08X} from {src_mac}",
                self.queue.occupied(),
                frame.message_id
            );
            return;
        }

        if !lock_seen(&self.seen).insert_if_new(frame.message_id) {
            log::debug!("duplicate frame {:08X} from {src_mac}", frame.message_id);
            return;
        }

        if self
            .queue
            .push_front(WorkItem::new(WorkState::OnRecv, frame))
            .is_err()
        {
            log::error!("urgent lane overflow, frame {:08X} lost", frame.message_id);
        }
    }
}

/// Everything the host's radio glue needs: the command stream to drain and
/// the two handles to call from its receive and send-completion paths.
pub struct LinkPort {
    pub commands: LinkCommandReceiver,
    pub rx: LinkRx,
    pub completion: SendCompletion,
}
