//! The message-processing engine: a single worker consuming the work queue.
//!
//! Every frame the mesh handles passes through here. The worker pulls one
//! work item at a time and dispatches on its state:
//!
//! - `ToSend`: resolve the next hop (broadcast for flooded kinds, the route
//!   table for routed kinds), transmit with bounded retries around the
//!   send-completion wait, and either report success upward, park the frame
//!   for its confirmation, or fall into route rediscovery.
//! - `OnRecv`: dispatch on the frame kind to deliver payloads to the host,
//!   answer search probes, collect confirmations, and re-queue whatever
//!   must be relayed onward.
//! - `WaitRoute` / `WaitResponse`: poll the route table or the confirmation
//!   window against the item's deadline, re-queueing until satisfied or
//!   timed out.
//!
//! The worker owns the route and confirmation tables outright and shares
//! only the seen-id window (under its mutex) with the receive path. It
//! suspends in exactly four places: the queue receive, the 50 ms completion
//! wait, the wait-state pacing timer, and the bounded enqueue towards the
//! radio glue.

use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Timer};

use crate::frame::{Frame, FrameKind, MacAddr, fresh_message_id};
use crate::link::{CompletionSignal, LinkCommand, LinkCommandSender, SendOutcome, await_completion};
use crate::queue::{WorkItem, WorkQueue, WorkState};
use crate::tables::{ConfirmedIds, RouteTable, SharedSeenIds, lock_seen};
use crate::{DeliveryStatus, EventSender, MeshEvent, ShutdownSignal};

/// Re-check cadence for parked wait items. Keeps the worker off a spin loop
/// while staying well inside the default waiting-time bound.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The worker half of an initialized mesh node. Spawn it via
/// [`engine_task`] or drive [`EngineRunner::run`] on any executor.
pub struct EngineRunner {
    pub(crate) self_mac: MacAddr,
    pub(crate) network_id: u32,
    pub(crate) max_waiting_time: Duration,
    pub(crate) link_attempts: u32,
    pub(crate) queue: &'static WorkQueue,
    pub(crate) seen: SharedSeenIds,
    pub(crate) routes: RouteTable,
    pub(crate) confirmed: ConfirmedIds,
    pub(crate) link_tx: LinkCommandSender,
    pub(crate) completion: &'static CompletionSignal,
    pub(crate) events: EventSender,
    pub(crate) shutdown: &'static ShutdownSignal,
}

impl EngineRunner {
    /// Consumes work items until the shutdown signal fires.
    pub async fn run(mut self) {
        log::info!("mesh engine up on {}", self.self_mac);
        loop {
            match select(self.shutdown.wait(), self.queue.recv()).await {
                Either::First(()) => break,
                Either::Second(item) => self.process(item).await,
            }
        }
        log::info!("mesh engine on {} stopped", self.self_mac);
    }

    async fn process(&mut self, item: WorkItem) {
        match item.state {
            WorkState::ToSend => self.handle_to_send(item).await,
            WorkState::OnRecv => self.handle_recv(item),
            WorkState::WaitRoute => self.handle_wait_route(item).await,
            WorkState::WaitResponse => self.handle_wait_response(item).await,
        }
    }

    /// One transmission attempt cycle: resolve next hop, put the frame on
    /// the air, and steer the item onward from the link's verdict.
    async fn handle_to_send(&mut self, item: WorkItem) {
        let frame = item.frame;

        let next_hop = if frame.kind.needs_route() {
            match self.routes.next_hop(frame.target) {
                Some(hop) => hop,
                None => {
                    self.start_discovery(frame);
                    return;
                }
            }
        } else {
            // Flooded kinds go out as link broadcasts. Recording our own id
            // first keeps the mesh's echo of this flood from re-entering.
            if frame.source == self.self_mac {
                lock_seen(&self.seen).insert(frame.message_id);
            }
            MacAddr::BROADCAST
        };

        if self.transmit(next_hop, &frame).await {
            if frame.source == self.self_mac {
                match frame.kind {
                    FrameKind::Broadcast(_) => self.emit(MeshEvent::SendStatus {
                        target: frame.target,
                        status: DeliveryStatus::Delivered,
                    }),
                    // Link-level success is not delivery; park for the
                    // end-to-end confirmation.
                    FrameKind::Unicast(_) => {
                        self.requeue_back(WorkItem::new(WorkState::WaitResponse, frame))
                    }
                    _ => {}
                }
            }
        } else if next_hop.is_broadcast() {
            log::debug!("broadcast of {:08X} failed at the link, dropped", frame.message_id);
        } else {
            // The cached next hop no longer answers. Forget it and go back
            // through discovery.
            log::debug!(
                "next hop {next_hop} for {} unreachable, invalidating route",
                frame.target
            );
            self.routes.invalidate(frame.target);
            self.start_discovery(frame);
        }
    }

    /// Parks `frame` until a route to its target shows up and floods a
    /// search probe for it. The probe jumps the queue so discovery starts
    /// before older pending work.
    fn start_discovery(&mut self, frame: Frame) {
        let probe = Frame {
            message_id: fresh_message_id(),
            target: frame.target,
            source: self.self_mac,
            sender: self.self_mac,
            kind: FrameKind::SearchRequest,
        };
        self.requeue_back(WorkItem::new(WorkState::WaitRoute, frame));
        self.requeue_front(WorkItem::new(WorkState::ToSend, probe));
        log::debug!("searching route to {} for frame {:08X}", frame.target, frame.message_id);
    }

    /// Registers the peer, transmits with bounded retries around the
    /// completion wait, and always unregisters before returning.
    async fn transmit(&mut self, peer: MacAddr, frame: &Frame) -> bool {
        let wire = frame.encode(self.network_id);
        self.link_tx.send(LinkCommand::AddPeer(peer)).await;

        let mut delivered = false;
        for attempt in 1..=self.link_attempts {
            self.completion.reset();
            self.link_tx
                .send(LinkCommand::Transmit { peer, frame: wire })
                .await;
            match await_completion(self.completion).await {
                SendOutcome::Delivered => {
                    delivered = true;
                    break;
                }
                outcome => log::debug!(
                    "transmit {:08X} to {peer}: {outcome:?} (attempt {attempt}/{})",
                    frame.message_id,
                    self.link_attempts
                ),
            }
        }

        self.link_tx.send(LinkCommand::DelPeer(peer)).await;
        delivered
    }

    /// Dispatches one admitted frame on its kind.
    fn handle_recv(&mut self, item: WorkItem) {
        let frame = item.frame;
        match frame.kind {
            FrameKind::Broadcast(payload) => {
                // Host first, mesh second: the local delivery must not
                // depend on the re-flood.
                self.emit(MeshEvent::Received {
                    source: frame.source,
                    payload: payload.as_slice().to_vec(),
                });
                self.requeue_back(WorkItem::new(WorkState::ToSend, frame));
            }
            FrameKind::Unicast(payload) => {
                if frame.target == self.self_mac {
                    self.emit(MeshEvent::Received {
                        source: frame.source,
                        payload: payload.as_slice().to_vec(),
                    });
                    let confirm = Frame {
                        message_id: fresh_message_id(),
                        target: frame.source,
                        source: self.self_mac,
                        sender: self.self_mac,
                        kind: FrameKind::DeliveryConfirm {
                            confirm_id: frame.message_id,
                        },
                    };
                    self.requeue_front(WorkItem::new(WorkState::ToSend, confirm));
                } else {
                    self.requeue_back(WorkItem::new(WorkState::ToSend, frame));
                }
            }
            FrameKind::DeliveryConfirm { confirm_id } => {
                if frame.target == self.self_mac {
                    self.confirmed.record(confirm_id);
                } else {
                    self.requeue_back(WorkItem::new(WorkState::ToSend, frame));
                }
            }
            FrameKind::SearchRequest => {
                // The probe's traversal reveals the reverse path: the
                // originator is reachable via whoever just handed it to us.
                self.routes.learn(frame.source, frame.sender);
                if frame.target == self.self_mac {
                    let response = Frame {
                        message_id: fresh_message_id(),
                        target: frame.source,
                        source: self.self_mac,
                        sender: self.self_mac,
                        kind: FrameKind::SearchResponse,
                    };
                    self.requeue_front(WorkItem::new(WorkState::ToSend, response));
                } else {
                    self.requeue_back(WorkItem::new(WorkState::ToSend, frame));
                }
            }
            FrameKind::SearchResponse => {
                self.routes.learn(frame.source, frame.sender);
                if frame.target != self.self_mac {
                    self.requeue_back(WorkItem::new(WorkState::ToSend, frame));
                }
            }
        }
    }

    async fn handle_wait_route(&mut self, item: WorkItem) {
        if self.routes.next_hop(item.frame.target).is_some() {
            self.requeue_front(WorkItem::new(WorkState::ToSend, item.frame));
            return;
        }
        if item.waiting_since.elapsed() > self.max_waiting_time {
            if item.frame.source == self.self_mac {
                self.emit(MeshEvent::SendStatus {
                    target: item.frame.target,
                    status: DeliveryStatus::Failed,
                });
            } else {
                log::debug!(
                    "no route to {} materialized, dropping relayed frame {:08X}",
                    item.frame.target,
                    item.frame.message_id
                );
            }
            return;
        }
        Timer::after(WAIT_POLL_INTERVAL).await;
        self.requeue_back(item);
    }

    async fn handle_wait_response(&mut self, item: WorkItem) {
        if self.confirmed.take(item.frame.message_id) {
            self.emit(MeshEvent::SendStatus {
                target: item.frame.target,
                status: DeliveryStatus::Delivered,
            });
            return;
        }
        // Only originated unicasts enter this state, so a timeout is always
        // reported to our own host.
        if item.waiting_since.elapsed() > self.max_waiting_time {
            self.emit(MeshEvent::SendStatus {
                target: item.frame.target,
                status: DeliveryStatus::Failed,
            });
            return;
        }
        Timer::after(WAIT_POLL_INTERVAL).await;
        self.requeue_back(item);
    }

    /// Non-blocking event emission; a host that stops draining loses events
    /// rather than stalling the mesh.
    fn emit(&self, event: MeshEvent) {
        if self.events.try_send(event).is_err() {
            log::warn!("host event queue full, event dropped");
        }
    }

    fn requeue_front(&self, item: WorkItem) {
        if self.queue.push_front(item).is_err() {
            log::error!("urgent lane overflow, frame {:08X} lost", item.frame.message_id);
        }
    }

    fn requeue_back(&self, item: WorkItem) {
        if self.queue.push_back(item).is_err() {
            log::error!("work queue overflow, frame {:08X} lost", item.frame.message_id);
        }
    }
}

/// Worker task for hosts running the crate's embassy executor setup.
#[embassy_executor::task]
pub async fn engine_task(runner: EngineRunner) {
    runner.run().await
}
