//! Device slot table and per-endpoint transfer state.
//!
//! A slot owns 31 endpoint records. Endpoint 1 is the bidirectional control
//! endpoint; DCIs `2k`/`2k+1` are the OUT/IN halves of USB endpoint `k`. The
//! transfer rings themselves live in guest memory: an endpoint record holds
//! only a dequeue cursor (or, with primary streams enabled, the guest stream
//! context array pointer plus one cursor per stream).

use crate::{MemoryBus, SetupPacket};

use super::ring::RingCursor;
use super::transfer::Transfer;

pub const MAX_SLOTS: usize = 64;
/// Endpoint records per slot (DCI 1..=31).
pub const ENDPOINTS_PER_SLOT: usize = 32;

/// Primary-stream ceiling implied by HCCPARAMS1.MaxPSASize = 1.
pub const MAX_PRIMARY_STREAMS: u16 = 4;

const STREAM_CTX_SIZE: u64 = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Disabled,
    Enabled,
    Default,
    Addressed,
    Configured,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EpState {
    #[default]
    Disabled,
    Running,
    Halted,
    Stopped,
    Error,
}

impl EpState {
    /// Endpoint Context encoding of this state.
    pub fn context_value(self) -> u8 {
        match self {
            EpState::Disabled => super::context::EP_STATE_DISABLED,
            EpState::Running => super::context::EP_STATE_RUNNING,
            EpState::Halted => super::context::EP_STATE_HALTED,
            EpState::Stopped => super::context::EP_STATE_STOPPED,
            EpState::Error => super::context::EP_STATE_ERROR,
        }
    }
}

/// Ring state of one endpoint: either a single transfer ring or a primary
/// stream context array.
#[derive(Debug, Default)]
pub enum EndpointRing {
    #[default]
    None,
    Single(RingCursor),
    Streams {
        /// Guest address of the stream context array.
        ctx_base: u64,
        count: u16,
        /// Cursor per stream id; lazily seeded from the guest stream
        /// context on first use.
        cursors: Vec<Option<RingCursor>>,
    },
}

impl EndpointRing {
    /// The cursor for `stream_id` (0 on non-stream endpoints), reading the
    /// guest stream context when the stream has not been touched yet.
    pub fn cursor(&mut self, mem: &mut dyn MemoryBus, stream_id: u16) -> Option<RingCursor> {
        match self {
            EndpointRing::None => None,
            EndpointRing::Single(cursor) => {
                if stream_id != 0 {
                    return None;
                }
                Some(*cursor)
            }
            EndpointRing::Streams {
                ctx_base,
                count,
                cursors,
            } => {
                if stream_id == 0 || stream_id >= *count {
                    return None;
                }
                let slot = &mut cursors[stream_id as usize];
                if slot.is_none() {
                    let raw = mem.read_u64(*ctx_base + u64::from(stream_id) * STREAM_CTX_SIZE);
                    *slot = Some(RingCursor::from_trdp(raw & !0xe));
                }
                *slot
            }
        }
    }

    /// Store an updated cursor back (and, for streams, shadow it into the
    /// guest stream context).
    pub fn commit(&mut self, mem: &mut dyn MemoryBus, stream_id: u16, cursor: RingCursor) {
        match self {
            EndpointRing::None => {}
            EndpointRing::Single(current) => {
                if stream_id == 0 {
                    *current = cursor;
                }
            }
            EndpointRing::Streams {
                ctx_base,
                count,
                cursors,
            } => {
                if stream_id == 0 || stream_id >= *count {
                    return;
                }
                cursors[stream_id as usize] = Some(cursor);
                // SCT = 1: primary ring. Keep the guest stream context in
                // sync the way the device context TRDP is shadowed.
                let raw = cursor.to_trdp() | 0x2;
                mem.write_u64(*ctx_base + u64::from(stream_id) * STREAM_CTX_SIZE, raw);
            }
        }
    }
}

/// One endpoint record of a slot.
#[derive(Debug, Default)]
pub struct Endpoint {
    pub state: EpState,
    pub ep_type: u8,
    pub max_packet_size: u16,
    pub ring: EndpointRing,
    /// The single in-flight transfer, when one exists.
    pub xfer: Option<Transfer>,
    /// Setup packet captured for a control transaction whose later stages
    /// arrive on a separate doorbell.
    pub pending_setup: Option<SetupPacket>,
}

impl Endpoint {
    pub fn is_enabled(&self) -> bool {
        self.state != EpState::Disabled
    }

    /// Disabling releases the transfer state and zeroes the record.
    /// Idempotent.
    pub fn disable(&mut self) {
        *self = Endpoint::default();
    }
}

/// One entry of the slot table.
#[derive(Debug)]
pub struct DeviceSlot {
    pub state: SlotState,
    /// 1-based root-hub port the slot was addressed on (0 = unbound).
    pub port: u8,
    /// Guest device context base, from the DCBAA.
    pub dev_ctx: u64,
    /// Assigned USB device address.
    pub address: u8,
    pub endpoints: [Endpoint; ENDPOINTS_PER_SLOT],
}

impl DeviceSlot {
    pub fn new() -> Self {
        Self {
            state: SlotState::Enabled,
            port: 0,
            dev_ctx: 0,
            address: 0,
            endpoints: Default::default(),
        }
    }

    pub fn endpoint(&self, dci: u8) -> Option<&Endpoint> {
        if dci == 0 || dci as usize >= ENDPOINTS_PER_SLOT {
            return None;
        }
        Some(&self.endpoints[dci as usize])
    }

    pub fn endpoint_mut(&mut self, dci: u8) -> Option<&mut Endpoint> {
        if dci == 0 || dci as usize >= ENDPOINTS_PER_SLOT {
            return None;
        }
        Some(&mut self.endpoints[dci as usize])
    }

    /// The controller-local transfer ring cursor of an endpoint, when it has
    /// a plain (non-stream) ring.
    pub fn transfer_ring(&self, dci: u8) -> Option<RingCursor> {
        match self.endpoint(dci)?.ring {
            EndpointRing::Single(cursor) => Some(cursor),
            _ => None,
        }
    }
}

impl Default for DeviceSlot {
    fn default() -> Self {
        Self::new()
    }
}
