//! Wire frame model and fixed-width codec.
//!
//! Every transmission on the link is exactly [`WIRE_FRAME_LEN`] bytes. The
//! five message kinds differ only in which fields carry meaning, so the
//! in-memory representation is a tagged union: payload-bearing kinds carry a
//! bounded [`Payload`], the delivery confirmation carries the id it
//! acknowledges, and the search pair carries nothing beyond the header.
//!
//! The previous-hop address is deliberately absent from the wire layout. It
//! is stamped by the receiver from the link callback's source address, so a
//! frame can never lie about where it just came from.

use std::fmt;

/// Maximum user payload per frame. Must agree network-wide; larger payloads
/// are rejected at admission, not fragmented.
pub const PAYLOAD_CAP: usize = 218;

/// Bytes of header that precede the payload on the wire:
/// kind (1) + network id (4) + message id (4) + confirm id (4) + target (6) + source (6).
const WIRE_HEADER_LEN: usize = 25;

/// Exact on-wire size of every frame: header, payload area, trailing length byte.
pub const WIRE_FRAME_LEN: usize = WIRE_HEADER_LEN + PAYLOAD_CAP + 1;

/// Smallest datagram the underlying link must carry in one piece.
pub const LINK_MTU: usize = 250;

const _: () = assert!(WIRE_FRAME_LEN <= LINK_MTU);

/// 6-byte link-layer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Reserved address that every node on the link receives.
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Bounded user payload: a fixed buffer plus the number of meaningful bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Payload {
    len: u8,
    bytes: [u8; PAYLOAD_CAP],
}

impl Payload {
    /// Copies `data` into a fresh payload. Fails on empty or oversize input.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.is_empty() || data.len() > PAYLOAD_CAP {
            return None;
        }
        let mut bytes = [0u8; PAYLOAD_CAP];
        bytes[..data.len()].copy_from_slice(data);
        Some(Payload {
            len: data.len() as u8,
            bytes,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.len)
    }
}

/// On-wire kind discriminants. Zero is reserved so an all-zero buffer can
/// never decode as a valid frame.
const KIND_BROADCAST: u8 = 1;
const KIND_UNICAST: u8 = 2;
const KIND_DELIVERY_CONFIRM: u8 = 3;
const KIND_SEARCH_REQUEST: u8 = 4;
const KIND_SEARCH_RESPONSE: u8 = 5;

/// The five message kinds and the fields that are meaningful for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Mesh-wide flood, delivered to every reachable host.
    Broadcast(Payload),
    /// Point-to-point data riding a discovered route.
    Unicast(Payload),
    /// End-to-end acknowledgement for the unicast with id `confirm_id`.
    DeliveryConfirm { confirm_id: u32 },
    /// Flooded route discovery probe for the frame's target.
    SearchRequest,
    /// Flooded reverse-path answer to a search request.
    SearchResponse,
}

impl FrameKind {
    fn discriminant(&self) -> u8 {
        match self {
            FrameKind::Broadcast(_) => KIND_BROADCAST,
            FrameKind::Unicast(_) => KIND_UNICAST,
            FrameKind::DeliveryConfirm { .. } => KIND_DELIVERY_CONFIRM,
            FrameKind::SearchRequest => KIND_SEARCH_REQUEST,
            FrameKind::SearchResponse => KIND_SEARCH_RESPONSE,
        }
    }

    /// Whether this kind travels hop-by-hop over a discovered route rather
    /// than as a link broadcast.
    pub fn needs_route(&self) -> bool {
        matches!(
            self,
            FrameKind::Unicast(_) | FrameKind::DeliveryConfirm { .. }
        )
    }
}

/// One mesh frame as it moves through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Frame {
    /// Per-frame unique non-zero identifier, used for flood dedup and
    /// acknowledgement matching.
    pub message_id: u32,
    /// Ultimate destination ([`MacAddr::BROADCAST`] for floods).
    pub target: MacAddr,
    /// Ultimate source.
    pub source: MacAddr,
    /// Previous hop. Stamped from the link on receive; never on the wire.
    pub sender: MacAddr,
    pub kind: FrameKind,
}

/// Why an inbound byte buffer was not admitted as a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameError {
    /// Datagram is not exactly [`WIRE_FRAME_LEN`] bytes.
    Length(usize),
    /// Frame belongs to a different mesh.
    ForeignNetwork(u32),
    /// Unknown kind discriminant.
    UnknownKind(u8),
    /// Payload length byte exceeds [`PAYLOAD_CAP`] or is zero for a
    /// payload-bearing kind.
    BadPayloadLen(u8),
    /// Message id zero is reserved as invalid.
    ZeroId,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Length(len) => write!(f, "datagram of {len} bytes, expected {WIRE_FRAME_LEN}"),
            FrameError::ForeignNetwork(id) => write!(f, "frame from foreign network {id:#010X}"),
            FrameError::UnknownKind(k) => write!(f, "unknown frame kind {k}"),
            FrameError::BadPayloadLen(len) => write!(f, "invalid payload length {len}"),
            FrameError::ZeroId => write!(f, "zero message id"),
        }
    }
}

impl std::error::Error for FrameError {}

impl Frame {
    /// Serializes the frame for the given mesh. Fields a kind does not use
    /// are written as zeroes so the wire image is fully determined.
    pub fn encode(&self, network_id: u32) -> [u8; WIRE_FRAME_LEN] {
        let mut buf = [0u8; WIRE_FRAME_LEN];
        buf[0] = self.kind.discriminant();
        buf[1..5].copy_from_slice(&network_id.to_le_bytes());
        buf[5..9].copy_from_slice(&self.message_id.to_le_bytes());
        let confirm_id = match self.kind {
            FrameKind::DeliveryConfirm { confirm_id } => confirm_id,
            _ => 0,
        };
        buf[9..13].copy_from_slice(&confirm_id.to_le_bytes());
        buf[13..19].copy_from_slice(&self.target.0);
        buf[19..25].copy_from_slice(&self.source.0);
        if let FrameKind::Broadcast(payload) | FrameKind::Unicast(payload) = &self.kind {
            let data = payload.as_slice();
            buf[WIRE_HEADER_LEN..WIRE_HEADER_LEN + data.len()].copy_from_slice(data);
            buf[WIRE_FRAME_LEN - 1] = data.len() as u8;
        }
        buf
    }

    /// Parses an inbound datagram, checking it against this mesh's id, and
    /// stamps `link_sender` as the previous hop.
    pub fn decode(bytes: &[u8], network_id: u32, link_sender: MacAddr) -> Result<Frame, FrameError> {
        if bytes.len() != WIRE_FRAME_LEN {
            return Err(FrameError::Length(bytes.len()));
        }
        let wire_network = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        if wire_network != network_id {
            return Err(FrameError::ForeignNetwork(wire_network));
        }
        let message_id = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        if message_id == 0 {
            return Err(FrameError::ZeroId);
        }
        let confirm_id = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
        let target = MacAddr([bytes[13], bytes[14], bytes[15], bytes[16], bytes[17], bytes[18]]);
        let source = MacAddr([bytes[19], bytes[20], bytes[21], bytes[22], bytes[23], bytes[24]]);
        let payload_len = bytes[WIRE_FRAME_LEN - 1];

        let payload = || {
            let len = payload_len as usize;
            if len == 0 || len > PAYLOAD_CAP {
                return Err(FrameError::BadPayloadLen(payload_len));
            }
            Payload::from_slice(&bytes[WIRE_HEADER_LEN..WIRE_HEADER_LEN + len])
                .ok_or(FrameError::BadPayloadLen(payload_len))
        };

        let kind = match bytes[0] {
            KIND_BROADCAST => FrameKind::Broadcast(payload()?),
            KIND_UNICAST => FrameKind::Unicast(payload()?),
            KIND_DELIVERY_CONFIRM => FrameKind::DeliveryConfirm { confirm_id },
            KIND_SEARCH_REQUEST => FrameKind::SearchRequest,
            KIND_SEARCH_RESPONSE => FrameKind::SearchResponse,
            other => return Err(FrameError::UnknownKind(other)),
        };

        Ok(Frame {
            message_id,
            target,
            source,
            sender: link_sender,
            kind,
        })
    }
}

/// Draws a fresh frame identifier: uniform over the non-zero 32-bit range.
pub(crate) fn fresh_message_id() -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != 0 {
            return id;
        }
    }
}
