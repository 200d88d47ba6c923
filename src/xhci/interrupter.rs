//! Interrupter register set and the event ring producer.
//!
//! One interrupter (MaxIntrs = 1), one event ring segment (ERST-MAX = 0).
//! ERSTBA/ERDP are written in dword halves by 32-bit guests, so the segment
//! entry is re-resolved lazily from the guest ERST the first time it is
//! needed after a register change. Producer state is only the enqueue index,
//! the producer cycle bit and the in-flight count; the ring itself lives in
//! guest memory.

use log::{debug, warn};

use crate::MemoryBus;

use super::trb::{CompletionCode, Trb, TRB_LEN};

pub const IMAN_IP: u32 = 1 << 0;
pub const IMAN_IE: u32 = 1 << 1;

/// Event Handler Busy bit of ERDP.
pub const ERDP_EHB: u64 = 1 << 3;
const ERDP_PTR_MASK: u64 = !0xf;

/// Why an event could not be written to the guest ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventRingError {
    /// The interrupter has no usable segment programmed; the event is lost.
    NotConfigured,
    /// The guest-visible structures are malformed; the caller latches
    /// USBSTS.HCE.
    HostControllerError,
    /// The ring is full; the event was dropped (an overflow Host Controller
    /// Event may have been produced in its place).
    Full,
}

#[derive(Debug)]
pub struct Interrupter {
    iman: u32,
    imod: u32,
    erstsz: u32,
    erstba: u64,
    erdp: u64,

    seg_base: u64,
    seg_size: u32,
    enq_idx: u32,
    producer_cycle: bool,
    in_flight: u32,
    /// ERSTSZ/ERSTBA changed since the segment entry was last read.
    dirty: bool,
}

impl Interrupter {
    pub fn new() -> Self {
        Self {
            iman: 0,
            imod: 0,
            erstsz: 0,
            erstba: 0,
            erdp: 0,
            seg_base: 0,
            seg_size: 0,
            enq_idx: 0,
            producer_cycle: true,
            in_flight: 0,
            dirty: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn iman(&self) -> u32 {
        self.iman
    }

    pub fn imod(&self) -> u32 {
        self.imod
    }

    pub fn erstsz(&self) -> u32 {
        self.erstsz
    }

    pub fn erstba(&self) -> u64 {
        self.erstba
    }

    pub fn erdp(&self) -> u64 {
        self.erdp
    }

    pub fn interrupt_pending(&self) -> bool {
        self.iman & IMAN_IP != 0
    }

    pub fn interrupt_enabled(&self) -> bool {
        self.iman & IMAN_IE != 0
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    pub fn producer_cycle(&self) -> bool {
        self.producer_cycle
    }

    pub(crate) fn set_interrupt_pending(&mut self, pending: bool) {
        if pending {
            self.iman |= IMAN_IP;
        } else {
            self.iman &= !IMAN_IP;
        }
    }

    /// IMAN write: IP is RW1C, IE is plain read-write.
    pub fn iman_write(&mut self, value: u32) {
        let mut iman = self.iman;
        if value & IMAN_IP != 0 {
            iman &= !IMAN_IP;
        }
        self.iman = (iman & IMAN_IP) | (value & IMAN_IE);
    }

    /// IMOD is stored for guest visibility; the model does not throttle
    /// interrupt delivery on it.
    pub fn imod_write(&mut self, value: u32) {
        self.imod = value;
    }

    pub fn erstsz_write(&mut self, value: u32) {
        // ERST-MAX = 0: a single segment is all the guest may program.
        self.erstsz = value & 0xffff;
        self.dirty = true;
    }

    pub fn erstba_write_lo(&mut self, value: u32) {
        self.erstba = (self.erstba & 0xffff_ffff_0000_0000) | u64::from(value & !0x3f);
        self.dirty = true;
    }

    pub fn erstba_write_hi(&mut self, value: u32) {
        self.erstba = (self.erstba & 0xffff_ffff) | (u64::from(value) << 32);
        self.dirty = true;
    }

    /// Re-read the single ERST entry after a register change.
    fn ensure_segment(&mut self, mem: &mut dyn MemoryBus) -> Result<(), EventRingError> {
        if !self.dirty {
            return if self.seg_size != 0 {
                Ok(())
            } else {
                Err(EventRingError::NotConfigured)
            };
        }
        self.seg_base = 0;
        self.seg_size = 0;
        if self.erstsz == 0 || self.erstba == 0 {
            return Err(EventRingError::NotConfigured);
        }
        let seg_base = mem.read_u64(self.erstba) & ERDP_PTR_MASK;
        let seg_size = mem.read_u32(self.erstba + 8) & 0xffff;
        if seg_base == 0 || seg_size == 0 {
            warn!(
                "xhci: malformed ERST entry at {:#x} (base {seg_base:#x}, size {seg_size})",
                self.erstba
            );
            return Err(EventRingError::HostControllerError);
        }
        self.seg_base = seg_base;
        self.seg_size = seg_size;
        self.enq_idx = 0;
        self.producer_cycle = true;
        self.in_flight = 0;
        self.dirty = false;
        debug!("xhci: event ring segment at {seg_base:#x}, {seg_size} TRBs");
        Ok(())
    }

    /// ERDP write: the guest advances its consumer pointer. Clears the
    /// busy/pending latch and recomputes the in-flight count.
    pub fn erdp_write(
        &mut self,
        mem: &mut dyn MemoryBus,
        value: u64,
    ) -> Result<(), EventRingError> {
        self.erdp = value & !ERDP_EHB;
        self.set_interrupt_pending(false);
        match self.ensure_segment(mem) {
            Ok(()) => {}
            Err(EventRingError::NotConfigured) => return Ok(()),
            Err(err) => return Err(err),
        }
        let ptr = value & ERDP_PTR_MASK;
        let seg_end = self.seg_base + (self.seg_size as u64) * TRB_LEN as u64;
        if ptr < self.seg_base || ptr >= seg_end {
            warn!("xhci: ERDP {ptr:#x} outside event ring segment");
            return Err(EventRingError::HostControllerError);
        }
        let erdp_idx = ((ptr - self.seg_base) / TRB_LEN as u64) as u32;
        self.in_flight = (self.enq_idx + self.seg_size - erdp_idx) % self.seg_size;
        Ok(())
    }

    /// Append an event TRB to the guest ring.
    ///
    /// Returns whether the caller should raise the interrupter. The producer
    /// cycle bit always overwrites the one in `trb`. When only the guard
    /// slot remains and the guest has not advanced ERDP, a synthetic Host
    /// Controller Event reporting the overflow is written instead and the
    /// original event is lost.
    pub fn insert_event(
        &mut self,
        mem: &mut dyn MemoryBus,
        trb: Trb,
        mut intr: bool,
    ) -> Result<bool, EventRingError> {
        self.ensure_segment(mem)?;
        if self.in_flight >= self.seg_size {
            return Err(EventRingError::Full);
        }

        let mut trb = trb;
        let mut overflow = false;
        if self.in_flight == self.seg_size - 1 {
            // Last free slot: report the overflow instead of the event.
            trb = Trb::host_controller_event(CompletionCode::EventRingFullError);
            intr = true;
            overflow = true;
            warn!("xhci: event ring full, dropping event");
        }

        trb.set_cycle(self.producer_cycle);
        trb.write_to(
            mem,
            self.seg_base + (self.enq_idx as u64) * TRB_LEN as u64,
        );

        self.in_flight += 1;
        self.enq_idx += 1;
        if self.enq_idx == self.seg_size {
            self.enq_idx = 0;
            self.producer_cycle = !self.producer_cycle;
        }

        if intr {
            self.erdp |= ERDP_EHB;
            self.set_interrupt_pending(true);
        }
        if overflow {
            Err(EventRingError::Full)
        } else {
            Ok(intr)
        }
    }
}

impl Default for Interrupter {
    fn default() -> Self {
        Self::new()
    }
}
