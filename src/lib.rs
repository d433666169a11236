//! # Meshwork - Mesh Overlay Engine
//!
//! A self-organizing mesh overlay on top of a single-hop, broadcast-capable,
//! 6-byte-addressed datagram link. Every node offers three services:
//!
//! - **Broadcast** to every reachable node, with duplicate re-flood
//!   suppression via a bounded window of seen message ids.
//! - **Reliable unicast** over reactive source routing: routes are
//!   discovered on demand by flooding a search probe, and delivery is
//!   confirmed end-to-end by an acknowledgement frame.
//! - **Store-and-forward relaying**: every node forwards traffic addressed
//!   elsewhere.
//!
//! ## Architecture Overview
//!
//! An initialized node splits into four parts ([`init`] returns all of
//! them):
//!
//! 1. **Engine worker** ([`EngineRunner`]): the single consumer of the work
//!    queue, running the whole protocol state machine. Spawn it on an
//!    Embassy executor via [`engine_task`], or drive its `run()` future on
//!    any executor.
//! 2. **Host handle** ([`MeshNetwork`]): synchronous `send` admission and
//!    cooperative `shutdown`.
//! 3. **Link port** ([`LinkPort`]): the command stream plus the receive and
//!    completion handles the host's radio glue wires to the real link.
//! 4. **Event stream** ([`EventReceiver`]): received payloads and delivery
//!    verdicts, consumed by the host at its own pace.
//!
//! ## Communication Channels
//!
//! All coordination is over bounded embassy-sync primitives: a two-lane
//! work queue feeding the worker, a command channel towards the radio glue,
//! a completion signal back from it, and the host event channel. Channel
//! storage is created once at [`init`] and intentionally leaked to satisfy
//! the `'static` lifetime the channel ends require; an engine lives for the
//! rest of the process (shutdown stops the worker, the few hundred bytes of
//! channel storage stay).
//!
//! ## Design Rationale
//!
//! The engine owns no radio and spawns no task by itself, so the same crate
//! drives real link glue on a target and an in-process bus in the test
//! harness. Memory is bounded everywhere: the queue lanes, the three
//! recency tables, and the event channel all evict or drop rather than
//! grow.

use std::fmt;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_sync::signal::Signal;
use embassy_time::Duration;
use serde::Deserialize;

mod engine;
mod frame;
mod link;
mod queue;
mod tables;

pub use engine::{EngineRunner, engine_task};
pub use frame::{LINK_MTU, MacAddr, PAYLOAD_CAP, WIRE_FRAME_LEN};
pub use link::{
    LINK_COMMAND_CHANNEL_SIZE, LinkCommand, LinkCommandQueue, LinkCommandReceiver, LinkPort,
    LinkRx, SendCompletion, SendReport,
};

use frame::{Frame, FrameKind, Payload, fresh_message_id};
use link::CompletionSignal;
use queue::{WORK_QUEUE_DEPTH, WorkItem, WorkQueue, WorkState};
use tables::{ConfirmedIds, RouteTable, shared_seen_ids};

/// Capacity of the host event channel (engine → host).
pub const EVENT_CHANNEL_SIZE: usize = 32;
/// Bounded channel delivering [`MeshEvent`]s to the embedding host.
pub type EventQueue = Channel<CriticalSectionRawMutex, MeshEvent, EVENT_CHANNEL_SIZE>;
/// Host-side end of the event channel.
pub type EventReceiver = Receiver<'static, CriticalSectionRawMutex, MeshEvent, EVENT_CHANNEL_SIZE>;
/// Engine-side end of the event channel.
pub(crate) type EventSender = Sender<'static, CriticalSectionRawMutex, MeshEvent, EVENT_CHANNEL_SIZE>;

/// Cooperative stop signal for the worker.
pub(crate) type ShutdownSignal = Signal<CriticalSectionRawMutex, ()>;

/// What a node tells its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A broadcast or unicast payload reached this node. Ownership of the
    /// buffer moves to the host.
    Received { source: MacAddr, payload: Vec<u8> },
    /// Final verdict on a locally originated send.
    SendStatus {
        target: MacAddr,
        status: DeliveryStatus,
    },
}

/// Outcome of a locally originated send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Broadcast left this node, or a unicast was confirmed end-to-end.
    Delivered,
    /// No route materialized or no confirmation arrived in time.
    Failed,
}

/// Engine configuration. All fields are validated by [`init`].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// 32-bit mesh discriminator; frames carrying any other value are
    /// dropped on admission. Must agree network-wide.
    pub network_id: u32,
    /// Admission bound over the work queue (4..=64). Also caps the window
    /// of pending delivery confirmations.
    pub queue_size: usize,
    /// Bound (ms) on route discovery and confirmation waits.
    pub max_waiting_time: u64,
    /// Capacity of the seen-message-id dedup window.
    pub id_vector_size: usize,
    /// Capacity of the learned-route table.
    pub route_vector_size: usize,
    /// Transmit attempts per next hop before the failure path runs.
    pub link_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network_id: 0xFAFB_FCFD,
            queue_size: 32,
            max_waiting_time: 1000,
            id_vector_size: 100,
            route_vector_size: 100,
            link_attempts: 3,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size < 4 || self.queue_size > WORK_QUEUE_DEPTH {
            return Err(ConfigError::QueueSize(self.queue_size));
        }
        if self.id_vector_size == 0 {
            return Err(ConfigError::IdVectorSize);
        }
        if self.route_vector_size == 0 {
            return Err(ConfigError::RouteVectorSize);
        }
        if self.link_attempts == 0 {
            return Err(ConfigError::LinkAttempts);
        }
        Ok(())
    }
}

/// Rejected configuration; nothing was allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// `queue_size` outside 4..=64.
    QueueSize(usize),
    /// `id_vector_size` must be at least 1.
    IdVectorSize,
    /// `route_vector_size` must be at least 1.
    RouteVectorSize,
    /// `link_attempts` must be at least 1.
    LinkAttempts,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::QueueSize(size) => {
                write!(f, "queue_size {size} outside 4..={WORK_QUEUE_DEPTH}")
            }
            ConfigError::IdVectorSize => write!(f, "id_vector_size must be at least 1"),
            ConfigError::RouteVectorSize => write!(f, "route_vector_size must be at least 1"),
            ConfigError::LinkAttempts => write!(f, "link_attempts must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Why a send was not admitted. Reported synchronously; nothing was queued
/// and no event will follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Empty payload.
    Empty,
    /// Payload over [`PAYLOAD_CAP`] bytes; the mesh does not fragment.
    TooLong(usize),
    /// Work queue over half full; try again once the mesh drains.
    Busy,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Empty => write!(f, "empty payload"),
            SendError::TooLong(len) => {
                write!(f, "payload of {len} bytes exceeds the {PAYLOAD_CAP}-byte cap")
            }
            SendError::Busy => write!(f, "work queue congested"),
        }
    }
}

impl std::error::Error for SendError {}

/// Everything [`init`] hands back: the host handle, the worker to spawn,
/// the link port for the radio glue, and the event stream.
pub struct MeshParts {
    pub network: MeshNetwork,
    pub runner: EngineRunner,
    pub link: LinkPort,
    pub events: EventReceiver,
}

/// Builds one mesh node. `local_mac` is this node's link address, read
/// from the link by the host after the configuration is settled.
pub fn init(config: Config, local_mac: MacAddr) -> Result<MeshParts, ConfigError> {
    config.validate()?;

    // INTENTIONAL LEAK: Box::leak provides the 'static lifetimes the
    // channel ends require. The storage lives until process exit; shutdown
    // only stops the worker.
    let work_queue: &'static WorkQueue = Box::leak(Box::new(WorkQueue::new()));
    let link_commands: &'static LinkCommandQueue = Box::leak(Box::new(Channel::new()));
    let events: &'static EventQueue = Box::leak(Box::new(Channel::new()));
    let completion: &'static CompletionSignal = Box::leak(Box::new(Signal::new()));
    let shutdown: &'static ShutdownSignal = Box::leak(Box::new(Signal::new()));

    let seen = shared_seen_ids(config.id_vector_size);

    let runner = EngineRunner {
        self_mac: local_mac,
        network_id: config.network_id,
        max_waiting_time: Duration::from_millis(config.max_waiting_time),
        link_attempts: config.link_attempts,
        queue: work_queue,
        seen: seen.clone(),
        routes: RouteTable::new(config.route_vector_size),
        confirmed: ConfirmedIds::new(config.queue_size),
        link_tx: link_commands.sender(),
        completion,
        events: events.sender(),
        shutdown,
    };

    let network = MeshNetwork {
        self_mac: local_mac,
        queue_size: config.queue_size,
        queue: work_queue,
        shutdown,
    };

    let link = LinkPort {
        commands: link_commands.receiver(),
        rx: LinkRx::new(config.network_id, config.queue_size, work_queue, seen),
        completion: SendCompletion::new(completion),
    };

    Ok(MeshParts {
        network,
        runner,
        link,
        events: events.receiver(),
    })
}

/// Host-facing handle of a running node. Cheap to clone and usable from
/// any thread; admission is synchronous, delivery is reported through the
/// event stream.
#[derive(Clone, Copy)]
pub struct MeshNetwork {
    self_mac: MacAddr,
    queue_size: usize,
    queue: &'static WorkQueue,
    shutdown: &'static ShutdownSignal,
}

impl MeshNetwork {
    /// This node's link address.
    pub fn local_mac(&self) -> MacAddr {
        self.self_mac
    }

    /// Queues one payload for the mesh. `None` (or the broadcast address)
    /// floods it to every reachable node; any other address sends a
    /// reliable unicast whose outcome arrives as a
    /// [`MeshEvent::SendStatus`].
    pub fn send(&self, target: Option<MacAddr>, payload: &[u8]) -> Result<(), SendError> {
        if payload.is_empty() {
            return Err(SendError::Empty);
        }
        if payload.len() > PAYLOAD_CAP {
            return Err(SendError::TooLong(payload.len()));
        }
        if self.queue.free_slots(self.queue_size) < self.queue_size / 2 {
            return Err(SendError::Busy);
        }

        let Some(data) = Payload::from_slice(payload) else {
            return Err(SendError::Empty);
        };
        let target = target.unwrap_or(MacAddr::BROADCAST);
        let kind = if target.is_broadcast() {
            FrameKind::Broadcast(data)
        } else {
            FrameKind::Unicast(data)
        };
        let frame = Frame {
            message_id: fresh_message_id(),
            target,
            source: self.self_mac,
            sender: self.self_mac,
            kind,
        };

        self.queue
            .push_back(WorkItem::new(WorkState::ToSend, frame))
            .map_err(|_| SendError::Busy)
    }

    /// Asks the worker to stop after the item in hand. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.signal(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELF: MacAddr = MacAddr::new([0xAA, 0, 0, 0, 0, 0x01]);
    const PEER: MacAddr = MacAddr::new([0xAA, 0, 0, 0, 0, 0x02]);

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_configs_are_rejected() {
        let undersized = Config {
            queue_size: 2,
            ..Config::default()
        };
        assert_eq!(undersized.validate(), Err(ConfigError::QueueSize(2)));

        let oversized = Config {
            queue_size: WORK_QUEUE_DEPTH + 1,
            ..Config::default()
        };
        assert!(oversized.validate().is_err());

        let no_dedup = Config {
            id_vector_size: 0,
            ..Config::default()
        };
        assert_eq!(no_dedup.validate(), Err(ConfigError::IdVectorSize));

        let no_routes = Config {
            route_vector_size: 0,
            ..Config::default()
        };
        assert_eq!(no_routes.validate(), Err(ConfigError::RouteVectorSize));

        let no_attempts = Config {
            link_attempts: 0,
            ..Config::default()
        };
        assert_eq!(no_attempts.validate(), Err(ConfigError::LinkAttempts));

        assert!(init(no_attempts, SELF).is_err());
    }

    #[test]
    fn config_loads_from_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "network_id": 305419896,
                "queue_size": 16,
                "max_waiting_time": 250,
                "id_vector_size": 50,
                "route_vector_size": 50,
                "link_attempts": 1
            }"#,
        )
        .unwrap();
        assert_eq!(config.network_id, 0x1234_5678);
        assert_eq!(config.queue_size, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn send_validates_payload_bounds() {
        let parts = init(Config::default(), SELF).unwrap();
        assert_eq!(parts.network.send(None, &[]), Err(SendError::Empty));
        assert_eq!(
            parts.network.send(None, &[0u8; PAYLOAD_CAP + 1]),
            Err(SendError::TooLong(PAYLOAD_CAP + 1))
        );
        assert_eq!(parts.network.send(None, &[0u8; PAYLOAD_CAP]), Ok(()));
    }

    #[test]
    fn send_none_and_broadcast_mac_are_equivalent() {
        let parts = init(Config::default(), SELF).unwrap();
        parts.network.send(None, b"a").unwrap();
        parts
            .network
            .send(Some(MacAddr::BROADCAST), b"b")
            .unwrap();

        for _ in 0..2 {
            let item = futures::executor::block_on(parts.network.queue.recv());
            assert_eq!(item.state, WorkState::ToSend);
            assert!(item.frame.target.is_broadcast());
            assert_eq!(item.frame.source, SELF);
            assert_ne!(item.frame.message_id, 0);
            assert!(matches!(item.frame.kind, FrameKind::Broadcast(_)));
        }
    }

    #[test]
    fn send_to_a_peer_queues_a_unicast() {
        let parts = init(Config::default(), SELF).unwrap();
        parts.network.send(Some(PEER), b"hello").unwrap();
        let item = futures::executor::block_on(parts.network.queue.recv());
        assert_eq!(item.frame.target, PEER);
        assert!(matches!(item.frame.kind, FrameKind::Unicast(_)));
    }

    #[test]
    fn send_backs_off_past_half_occupancy() {
        let config = Config {
            queue_size: 8,
            ..Config::default()
        };
        let parts = init(config, SELF).unwrap();

        // free >= 4 admits: five sends fill slots 8,7,6,5,4.
        for _ in 0..5 {
            parts.network.send(None, b"x").unwrap();
        }
        assert_eq!(parts.network.send(None, b"x"), Err(SendError::Busy));
    }
}
