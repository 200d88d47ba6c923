//! Consumer-side ring cursor shared by the command ring and transfer rings.
//!
//! The guest produces TRBs; the controller consumes every TRB whose cycle bit
//! matches the cursor's cycle state. Link TRBs toggle the cycle state when
//! their Toggle Cycle flag is set and redirect the cursor. The two consumers
//! want different visibility: the command ring advances over links silently
//! ([`RingCursor::poll`]), while the transfer engine observes each crossed
//! link so it can append a sentinel block ([`RingCursor::poll_step`]). A
//! step budget bounds each poll so a malformed ring of chained Link TRBs
//! cannot wedge the controller.

use thiserror::Error;

use crate::MemoryBus;

use super::trb::{Trb, TrbType, TRB_LEN};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring walk exceeded its step budget")]
    StepBudgetExceeded,
}

/// A consumed TRB together with its guest address (needed later for event
/// TRB pointers).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingItem {
    pub paddr: u64,
    pub trb: Trb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingPoll {
    Ready(RingItem),
    NotReady,
    Err(RingError),
}

/// Dequeue pointer + consumer cycle state for one guest-resident ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingCursor {
    dequeue: u64,
    cycle: bool,
}

impl RingCursor {
    pub fn new(dequeue: u64, cycle: bool) -> Self {
        Self {
            dequeue: dequeue & !0xf,
            cycle,
        }
    }

    /// Build a cursor from a raw TR Dequeue Pointer field (bit 0 = DCS).
    pub fn from_trdp(raw: u64) -> Self {
        Self::new(raw & !0xf, raw & 1 != 0)
    }

    pub fn dequeue_ptr(&self) -> u64 {
        self.dequeue
    }

    pub fn cycle_state(&self) -> bool {
        self.cycle
    }

    /// Raw TR Dequeue Pointer encoding of this cursor.
    pub fn to_trdp(&self) -> u64 {
        self.dequeue | u64::from(self.cycle)
    }

    /// Consume the next owned TRB, Link TRBs included.
    ///
    /// On `Ready` the cursor has advanced past the returned TRB; for a Link
    /// TRB that means the toggle/jump effect has been applied and the item
    /// still names the link itself, so the caller can account for the
    /// crossing. On `NotReady` the cursor rests on the first TRB the
    /// consumer does not own.
    pub fn poll_step(&mut self, mem: &mut dyn MemoryBus) -> RingPoll {
        let trb = Trb::read_from(mem, self.dequeue);
        if trb.cycle() != self.cycle {
            return RingPoll::NotReady;
        }
        let item = RingItem {
            paddr: self.dequeue,
            trb,
        };
        if trb.trb_type() == TrbType::Link {
            if trb.link_toggle_cycle() {
                self.cycle = !self.cycle;
            }
            self.dequeue = trb.pointer();
        } else {
            self.dequeue += TRB_LEN as u64;
        }
        RingPoll::Ready(item)
    }

    /// Consume the next owned non-link TRB, advancing over Link TRBs
    /// silently.
    pub fn poll(&mut self, mem: &mut dyn MemoryBus, step_budget: u32) -> RingPoll {
        for _ in 0..step_budget {
            match self.poll_step(mem) {
                RingPoll::Ready(item) if item.trb.trb_type() == TrbType::Link => continue,
                other => return other,
            }
        }
        RingPoll::Err(RingError::StepBudgetExceeded)
    }
}
