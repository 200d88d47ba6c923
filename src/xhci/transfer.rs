//! USB data transfers: the block ring a transfer ring decomposes into, and
//! the mapping from backend status to xHCI completion codes.
//!
//! A [`Transfer`] is built by walking an endpoint's transfer ring at doorbell
//! time. Each consumed TRB becomes one [`XferBlock`] carrying the guest TRB
//! address (for the later Transfer Event), a cycle-state snapshot and, for
//! data-stage TRBs, the payload buffer. OUT payloads are read from guest
//! memory when the block is appended; IN payloads are written back at
//! completion. At most one transfer is in flight per endpoint.

use crate::{dma_read, Direction, MemoryBus, SetupPacket, XferStatus};

use super::ring::RingCursor;
use super::trb::{CompletionCode, Trb, TrbType};

/// Upper bound on blocks a single transfer may carry.
pub const USB_MAX_XFER_BLOCKS: usize = 1024;

/// Immediate-data TRBs carry at most 8 bytes in the parameter field.
const IDT_MAX_LEN: usize = 8;

/// Life-cycle of a block within a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Appended by the ring walk, not yet seen by the backend.
    Free,
    /// Owned by the backend until its host-side I/O settles.
    Acquired,
    /// Fully processed; eligible for event emission and release.
    Handled,
}

#[derive(Debug)]
pub struct XferBlock {
    /// Guest address of the originating TRB.
    pub trb_addr: u64,
    /// Control word snapshot (type, IOC, ISP, ED, CH).
    pub ctrl: u32,
    /// Parameter snapshot (Event Data payload, immediate data).
    pub param: u64,
    /// Guest data buffer, when the TRB referenced one.
    pub gpa: Option<u64>,
    /// Requested byte count.
    pub blen: usize,
    /// Bytes actually transferred.
    pub bdone: usize,
    pub data: Vec<u8>,
    /// Consumer cycle state when the TRB was consumed.
    pub ccs: bool,
    pub stream_id: u16,
    pub state: BlockState,
}

impl XferBlock {
    pub fn trb_type(&self) -> TrbType {
        TrbType::from_raw(((self.ctrl >> 10) & 0x3f) as u8)
    }

    pub fn ioc(&self) -> bool {
        self.ctrl & Trb::CONTROL_IOC_BIT != 0
    }

    pub fn isp(&self) -> bool {
        self.ctrl & Trb::CONTROL_ISP_BIT != 0
    }

    /// Whether this block carries transfer payload (as opposed to setup,
    /// event-data or no-op bookkeeping).
    pub fn is_data(&self) -> bool {
        matches!(
            self.trb_type(),
            TrbType::Normal | TrbType::DataStage | TrbType::Isoch
        ) && self.blen > 0
    }

    pub fn residual(&self) -> usize {
        self.blen.saturating_sub(self.bdone)
    }
}

/// One USB transfer assembled from a transfer ring, in flight on exactly one
/// endpoint.
#[derive(Debug)]
pub struct Transfer {
    pub slot_id: u8,
    pub epid: u8,
    pub stream_id: u16,
    /// Captured device request of a control transfer's setup stage.
    pub ureq: Option<SetupPacket>,
    pub blocks: Vec<XferBlock>,
    /// First block not yet released by the completion routine; a retry
    /// resumes here.
    pub head: usize,
    pub status: XferStatus,
    /// Ring position after the walked TRBs; committed to the endpoint on
    /// completion so a NAKed transfer leaves the visible dequeue untouched.
    pub(crate) end_cursor: RingCursor,
    /// The backend has seen this transfer at least once.
    pub(crate) submitted: bool,
}

impl Transfer {
    pub(crate) fn new(slot_id: u8, epid: u8, stream_id: u16, end_cursor: RingCursor) -> Self {
        Self {
            slot_id,
            epid,
            stream_id,
            ureq: None,
            blocks: Vec::new(),
            head: 0,
            status: XferStatus::Success,
            end_cursor,
            submitted: false,
        }
    }

    pub fn setup(&self) -> Option<SetupPacket> {
        self.ureq
    }

    /// Transfer direction: control transfers follow the setup packet, other
    /// endpoints the doorbell target parity (odd DCI = IN).
    pub fn direction(&self) -> Direction {
        if self.epid == 1 {
            match self.ureq {
                Some(req) if req.is_device_to_host() => Direction::In,
                _ => Direction::Out,
            }
        } else if self.epid % 2 == 1 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Total payload bytes the unprocessed data blocks ask for.
    pub fn expected_len(&self) -> usize {
        self.blocks[self.head..]
            .iter()
            .filter(|b| b.state != BlockState::Handled && b.is_data())
            .map(|b| b.blen)
            .sum()
    }

    /// Scatter device-to-host payload across the unprocessed data blocks.
    /// Marks each filled block handled; returns the number of bytes placed.
    pub fn write_in(&mut self, src: &[u8]) -> usize {
        let mut off = 0;
        for block in &mut self.blocks[self.head..] {
            if block.state == BlockState::Handled || !block.is_data() {
                continue;
            }
            let take = (src.len() - off).min(block.blen);
            block.data = src[off..off + take].to_vec();
            block.bdone = take;
            block.state = BlockState::Handled;
            off += take;
            if off == src.len() {
                break;
            }
        }
        off
    }

    /// Gather the host-to-device payload of the unprocessed data blocks.
    pub fn read_out(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for block in &self.blocks[self.head..] {
            if block.state == BlockState::Handled || !block.is_data() {
                continue;
            }
            out.extend_from_slice(&block.data[..block.blen.min(block.data.len())]);
        }
        out
    }

    /// Record that the backend consumed `n` bytes of OUT payload, in block
    /// order. Marks consumed blocks handled.
    pub fn complete_out(&mut self, mut n: usize) {
        for block in &mut self.blocks[self.head..] {
            if block.state == BlockState::Handled || !block.is_data() {
                continue;
            }
            let take = n.min(block.blen);
            block.bdone = take;
            block.state = BlockState::Handled;
            n -= take;
        }
    }

    /// Mark every remaining unprocessed block handled (used after a
    /// synchronous backend completion, where zero-length and status blocks
    /// carry no payload to account for).
    pub(crate) fn finish_blocks(&mut self, full_for_out: bool) {
        for block in &mut self.blocks[self.head..] {
            if block.state == BlockState::Handled {
                continue;
            }
            if full_for_out && block.is_data() {
                block.bdone = block.blen;
            }
            block.state = BlockState::Handled;
        }
    }
}

/// Outcome of walking a transfer ring into a [`Transfer`].
#[derive(Debug)]
pub(crate) enum BuildOutcome {
    /// At least one TD is ready for submission.
    Ready(Transfer),
    /// Nothing owned on the ring.
    Empty,
    /// Malformed TRB; the endpoint should halt with the given code.
    Fault(u64, CompletionCode),
}

/// Walk `cursor` and decompose owned TRBs into transfer blocks, stopping at
/// the first interrupt-on-completion TRB or at the ring end.
pub(crate) fn build_transfer(
    mem: &mut dyn MemoryBus,
    cursor: &mut RingCursor,
    slot_id: u8,
    epid: u8,
    stream_id: u16,
    control_dir_hint: Option<SetupPacket>,
    step_budget: u32,
) -> BuildOutcome {
    use super::ring::RingPoll;

    let mut xfer = Transfer::new(slot_id, epid, stream_id, *cursor);
    xfer.ureq = control_dir_hint;

    let mut steps = 0u32;
    loop {
        steps += 1;
        if steps > step_budget {
            // A ring of chained Link TRBs never yields ownership back.
            return BuildOutcome::Fault(cursor.dequeue_ptr(), CompletionCode::TrbError);
        }
        if xfer.blocks.len() >= USB_MAX_XFER_BLOCKS {
            break;
        }
        let item = match cursor.poll_step(mem) {
            RingPoll::Ready(item) => item,
            RingPoll::NotReady => break,
            RingPoll::Err(_) => {
                return BuildOutcome::Fault(cursor.dequeue_ptr(), CompletionCode::TrbError)
            }
        };
        let trb = item.trb;
        let mut block = XferBlock {
            trb_addr: item.paddr,
            ctrl: trb.control,
            param: trb.parameter,
            gpa: None,
            blen: 0,
            bdone: 0,
            data: Vec::new(),
            ccs: cursor.cycle_state(),
            stream_id,
            state: BlockState::Free,
        };

        match trb.trb_type() {
            TrbType::SetupStage => {
                let len = (trb.status & Trb::STATUS_TRANSFER_LEN_MASK) as usize;
                if !trb.idt() || len != 8 {
                    return BuildOutcome::Fault(item.paddr, CompletionCode::TrbError);
                }
                xfer.ureq = Some(SetupPacket::from_bytes(trb.parameter.to_le_bytes()));
                block.state = BlockState::Handled;
            }
            TrbType::Normal | TrbType::DataStage | TrbType::Isoch => {
                if trb.trb_type() == TrbType::Normal && epid == 1 && xfer.ureq.is_none() {
                    // A bare Normal TRB on the control endpoint has no
                    // transaction to belong to.
                    return BuildOutcome::Fault(item.paddr, CompletionCode::TrbError);
                }
                let len = (trb.status & Trb::STATUS_TRANSFER_LEN_MASK) as usize;
                // Data Stage TRBs carry their own direction flag; everything
                // else follows the transfer direction.
                let is_out = if trb.trb_type() == TrbType::DataStage && xfer.ureq.is_none() {
                    trb.control & Trb::CONTROL_DIR_BIT == 0
                } else {
                    xfer.direction() == Direction::Out
                };
                block.blen = len;
                if trb.idt() {
                    let imm = trb.parameter.to_le_bytes();
                    let len = len.min(IDT_MAX_LEN);
                    block.blen = len;
                    block.data = imm[..len].to_vec();
                } else {
                    block.gpa = Some(trb.parameter);
                    if len > 0 && is_out {
                        let mut data = vec![0u8; len];
                        dma_read(mem, trb.parameter, &mut data);
                        block.data = data;
                    }
                }
            }
            TrbType::StatusStage => {
                // Zero-length handshake stage.
            }
            TrbType::Link => {
                // Sentinel for the crossed link: carries no data, but keeps
                // the TD's block sequence complete (and honors IOC on the
                // link itself). The cursor already applied toggle and jump.
                block.state = BlockState::Handled;
            }
            TrbType::EventData | TrbType::NoOp => {
                block.state = BlockState::Handled;
            }
            _ => {
                return BuildOutcome::Fault(item.paddr, CompletionCode::TrbError);
            }
        }

        let ioc = trb.ioc();
        xfer.blocks.push(block);
        xfer.end_cursor = *cursor;
        if ioc {
            break;
        }
    }

    if xfer.blocks.is_empty() {
        BuildOutcome::Empty
    } else {
        BuildOutcome::Ready(xfer)
    }
}

/// Map a backend transfer status to the xHCI completion code reported in
/// Transfer Events.
pub(crate) fn completion_code_for(status: XferStatus) -> CompletionCode {
    match status {
        XferStatus::Success => CompletionCode::Success,
        XferStatus::ShortXfer => CompletionCode::ShortPacket,
        XferStatus::Stall => CompletionCode::StallError,
        XferStatus::Timeout | XferStatus::IoError => CompletionCode::UsbTransactionError,
        XferStatus::BadBufSize => CompletionCode::BabbleDetectedError,
        // NAKed transfers complete later; no event is emitted for them.
        XferStatus::Nak => CompletionCode::Invalid,
    }
}
