//! Command ring consumer: doorbell 0 walks the ring and dispatches each
//! command, emitting one Command Completion Event per command.
//!
//! Handlers return the completion code by value; no command failure is
//! reported out-of-band.

use log::{debug, warn};

use crate::MemoryBus;

use super::context::{
    DeviceContext32, EndpointContext, InputContext32, SlotContext, CONTEXT_SIZE,
    EP_STATE_DISABLED, EP_STATE_RUNNING, SLOT_STATE_ADDRESSED, SLOT_STATE_CONFIGURED,
    SLOT_STATE_DEFAULT,
};
use super::regs;
use super::ring::{RingCursor, RingPoll};
use super::slots::{DeviceSlot, EndpointRing, EpState, SlotState, MAX_PRIMARY_STREAMS};
use super::transfer::BlockState;
use super::trb::{CompletionCode, Trb, TrbType};
use super::{XhciController, RING_STEP_BUDGET};

impl XhciController {
    /// Consume up to `budget` commands from the command ring. The stored
    /// CRCR tracks the dequeue so a later doorbell resumes where this one
    /// stopped.
    pub fn process_command_ring(&mut self, mem: &mut dyn MemoryBus, budget: u32) {
        if self.crcr & !0xf == 0 {
            debug!("xhci: doorbell 0 with no command ring programmed");
            return;
        }
        self.crr = true;
        let mut cursor = RingCursor::new(self.crcr & !0xf, self.crcr & 1 != 0);
        for _ in 0..budget {
            match cursor.poll(mem, RING_STEP_BUDGET) {
                RingPoll::NotReady => break,
                RingPoll::Err(err) => {
                    warn!("xhci: command ring walk failed: {err}");
                    self.usbsts |= regs::USBSTS_HCE;
                    break;
                }
                RingPoll::Ready(item) => {
                    let (code, slot_id) = self.execute_command(mem, &item.trb);
                    let event = Trb::command_completion_event(item.paddr, code, slot_id);
                    let _ = self.post_event(mem, event, true);
                }
            }
        }
        self.crcr = cursor.dequeue_ptr() | u64::from(cursor.cycle_state());
        self.crr = false;
    }

    fn execute_command(&mut self, mem: &mut dyn MemoryBus, trb: &Trb) -> (CompletionCode, u8) {
        match trb.trb_type() {
            TrbType::EnableSlotCommand => self.cmd_enable_slot(mem),
            TrbType::DisableSlotCommand => self.cmd_disable_slot(trb.slot_id()),
            TrbType::AddressDeviceCommand => self.cmd_address_device(mem, trb),
            TrbType::ConfigureEndpointCommand => self.cmd_configure_endpoint(mem, trb),
            TrbType::EvaluateContextCommand => self.cmd_evaluate_context(mem, trb),
            TrbType::ResetEndpointCommand => self.cmd_reset_endpoint(mem, trb),
            TrbType::StopEndpointCommand => self.cmd_stop_endpoint(mem, trb),
            TrbType::SetTrDequeuePointerCommand => self.cmd_set_tr_dequeue(mem, trb),
            TrbType::ResetDeviceCommand => self.cmd_reset_device(mem, trb),
            TrbType::NoOpCommand => (CompletionCode::Success, 0),
            other => {
                warn!("xhci: unhandled command TRB type {other:?}");
                (CompletionCode::TrbError, 0)
            }
        }
    }

    fn cmd_enable_slot(&mut self, mem: &mut dyn MemoryBus) -> (CompletionCode, u8) {
        for slot_id in 1..=regs::MAX_SLOTS {
            let entry = &mut self.slots[slot_id as usize];
            if entry.is_none() {
                *entry = Some(DeviceSlot::new());
                if self.dcbaap != 0 {
                    mem.write_u64(self.dcbaap + u64::from(slot_id) * 8, 0);
                }
                debug!("xhci: slot {slot_id} enabled");
                return (CompletionCode::Success, slot_id);
            }
        }
        (CompletionCode::NoSlotsAvailableError, 0)
    }

    fn cmd_disable_slot(&mut self, slot_id: u8) -> (CompletionCode, u8) {
        let Some(entry) = self.slots.get_mut(slot_id as usize) else {
            return (CompletionCode::TrbError, slot_id);
        };
        let Some(slot) = entry.take() else {
            return (CompletionCode::SlotNotEnabledError, slot_id);
        };
        let vport = slot.port;
        if vport != 0 {
            if let Some(dev) = self.hub.device_mut(vport) {
                dev.stop();
            }
        }
        // Pass-through bookkeeping: may move a suspend-cache entry to END.
        // The worker is signalled either way.
        self.hub.note_slot_disabled(vport);
        debug!("xhci: slot {slot_id} disabled");
        (CompletionCode::Success, slot_id)
    }

    fn cmd_address_device(&mut self, mem: &mut dyn MemoryBus, trb: &Trb) -> (CompletionCode, u8) {
        let slot_id = trb.slot_id();
        if self.slot_state(slot_id).is_none() {
            return (CompletionCode::SlotNotEnabledError, slot_id);
        }

        let input = InputContext32::new(trb.pointer());
        let icc = input.input_control(mem);
        // Address Device takes exactly the slot and EP0 contexts.
        if icc.drop_flags() != 0 || icc.add_flags() & 0x3 != 0x3 {
            return (CompletionCode::TrbError, slot_id);
        }
        let Ok(slot_ctx_in) = input.slot_context(mem) else {
            return (CompletionCode::TrbError, slot_id);
        };
        let Ok(ep0_in) = input.endpoint_context(mem, 1) else {
            return (CompletionCode::TrbError, slot_id);
        };

        let vport = slot_ctx_in.root_hub_port_number();
        if vport == 0 || vport > self.hub.port_count() {
            return (CompletionCode::TrbError, slot_id);
        }
        if self.hub.device_mut(vport).is_none() {
            // No device was ever bound to that root-hub port.
            return (CompletionCode::UsbTransactionError, slot_id);
        }
        if self.dcbaap == 0 {
            return (CompletionCode::ContextStateError, slot_id);
        }
        let dev_ctx = mem.read_u64(self.dcbaap + u64::from(slot_id) * 8) & !0x3f;
        if dev_ctx == 0 {
            return (CompletionCode::ParameterError, slot_id);
        }

        let bsr = trb.control & Trb::CONTROL_BSR_BIT != 0;
        let address = if bsr { 0 } else { slot_id };

        // Copy the input contexts into the guest device context, with the
        // output fields the command defines.
        let dc = DeviceContext32::new(dev_ctx);
        let mut slot_ctx = slot_ctx_in;
        slot_ctx.set_usb_device_address(address);
        slot_ctx.set_slot_state(if bsr {
            SLOT_STATE_DEFAULT
        } else {
            SLOT_STATE_ADDRESSED
        });
        let _ = dc.write_slot_context(mem, &slot_ctx);
        let mut ep0 = ep0_in;
        ep0.set_endpoint_state(EP_STATE_RUNNING);
        let _ = dc.write_endpoint_context(mem, 1, &ep0);

        let Some(slot) = self.slots.get_mut(slot_id as usize).and_then(|s| s.as_mut()) else {
            return (CompletionCode::SlotNotEnabledError, slot_id);
        };
        slot.state = if bsr {
            SlotState::Default
        } else {
            SlotState::Addressed
        };
        slot.port = vport;
        slot.dev_ctx = dev_ctx;
        slot.address = address;
        if let Some(ep) = slot.endpoint_mut(1) {
            ep.state = EpState::Running;
            ep.ep_type = ep0.ep_type();
            ep.max_packet_size = ep0.max_packet_size();
            ep.ring = EndpointRing::Single(RingCursor::new(
                ep0.tr_dequeue_pointer(),
                ep0.dcs(),
            ));
            ep.xfer = None;
            ep.pending_setup = None;
        }

        // The binding becomes EMULATED: the guest owns the device now.
        self.hub.note_slot_bound(vport);
        debug!("xhci: slot {slot_id} addressed on port {vport} (address {address})");
        (CompletionCode::Success, slot_id)
    }

    fn cmd_configure_endpoint(
        &mut self,
        mem: &mut dyn MemoryBus,
        trb: &Trb,
    ) -> (CompletionCode, u8) {
        let slot_id = trb.slot_id();
        let Some(slot) = self.slots.get(slot_id as usize).and_then(|s| s.as_ref()) else {
            return (CompletionCode::SlotNotEnabledError, slot_id);
        };
        if matches!(slot.state, SlotState::Enabled | SlotState::Disabled) || slot.dev_ctx == 0 {
            return (CompletionCode::ContextStateError, slot_id);
        }
        let dev_ctx = slot.dev_ctx;
        let vport = slot.port;
        let dc = DeviceContext32::new(dev_ctx);

        if trb.control & Trb::CONTROL_DC_BIT != 0 {
            // Deconfigure: stop the backend and drop every non-control
            // endpoint.
            if let Some(dev) = self.hub.device_mut(vport) {
                dev.stop();
            }
            for dci in 2..=31u8 {
                self.disable_endpoint(mem, slot_id, dci);
            }
            if let Some(slot) = self.slots.get_mut(slot_id as usize).and_then(|s| s.as_mut()) {
                slot.state = SlotState::Addressed;
            }
            update_slot_ctx(mem, dev_ctx, |ctx| ctx.set_slot_state(SLOT_STATE_ADDRESSED));
            return (CompletionCode::Success, slot_id);
        }

        let input = InputContext32::new(trb.pointer());
        let icc = input.input_control(mem);
        for dci in 2..=31u8 {
            if icc.drop_flags() & (1 << dci) != 0 {
                self.disable_endpoint(mem, slot_id, dci);
            }
            if icc.add_flags() & (1 << dci) != 0 {
                let Ok(ep_in) = input.endpoint_context(mem, dci) else {
                    return (CompletionCode::TrbError, slot_id);
                };
                let mut ep_out = ep_in;
                ep_out.set_endpoint_state(EP_STATE_RUNNING);
                let _ = dc.write_endpoint_context(mem, dci, &ep_out);

                let Some(ep) = self
                    .slots
                    .get_mut(slot_id as usize)
                    .and_then(|s| s.as_mut())
                    .and_then(|s| s.endpoint_mut(dci))
                else {
                    continue;
                };
                ep.state = EpState::Running;
                ep.ep_type = ep_in.ep_type();
                ep.max_packet_size = ep_in.max_packet_size();
                ep.xfer = None;
                ep.pending_setup = None;
                ep.ring = if ep_in.max_pstreams() > 0 {
                    // MaxPStreams is a guest-controlled 5-bit field; clamp
                    // the shift so a bogus context cannot overflow it.
                    let count = 1u16
                        .checked_shl(u32::from(ep_in.max_pstreams()) + 1)
                        .unwrap_or(u16::MAX)
                        .min(MAX_PRIMARY_STREAMS);
                    EndpointRing::Streams {
                        ctx_base: ep_in.tr_dequeue_pointer(),
                        count,
                        cursors: (0..count).map(|_| None).collect(),
                    }
                } else {
                    EndpointRing::Single(RingCursor::new(
                        ep_in.tr_dequeue_pointer(),
                        ep_in.dcs(),
                    ))
                };
            }
        }

        if let Some(slot) = self.slots.get_mut(slot_id as usize).and_then(|s| s.as_mut()) {
            slot.state = SlotState::Configured;
        }
        update_slot_ctx(mem, dev_ctx, |ctx| ctx.set_slot_state(SLOT_STATE_CONFIGURED));
        (CompletionCode::Success, slot_id)
    }

    fn cmd_evaluate_context(
        &mut self,
        mem: &mut dyn MemoryBus,
        trb: &Trb,
    ) -> (CompletionCode, u8) {
        let slot_id = trb.slot_id();
        let Some(slot) = self.slots.get(slot_id as usize).and_then(|s| s.as_ref()) else {
            return (CompletionCode::SlotNotEnabledError, slot_id);
        };
        if slot.dev_ctx == 0 {
            return (CompletionCode::ContextStateError, slot_id);
        }
        let dev_ctx = slot.dev_ctx;
        let dc = DeviceContext32::new(dev_ctx);
        let input = InputContext32::new(trb.pointer());
        let icc = input.input_control(mem);

        if icc.add_flags() & 0x1 != 0 {
            let Ok(slot_in) = input.slot_context(mem) else {
                return (CompletionCode::TrbError, slot_id);
            };
            update_slot_ctx(mem, dev_ctx, |ctx| {
                ctx.set_max_exit_latency(slot_in.max_exit_latency());
                ctx.set_interrupter_target(slot_in.interrupter_target());
            });
        }
        if icc.add_flags() & 0x2 != 0 {
            let Ok(ep0_in) = input.endpoint_context(mem, 1) else {
                return (CompletionCode::TrbError, slot_id);
            };
            let mut ep0 = match dc.endpoint_context(mem, 1) {
                Ok(ctx) => ctx,
                Err(_) => EndpointContext::default(),
            };
            ep0.set_max_packet_size(ep0_in.max_packet_size());
            let _ = dc.write_endpoint_context(mem, 1, &ep0);
            if let Some(ep) = self
                .slots
                .get_mut(slot_id as usize)
                .and_then(|s| s.as_mut())
                .and_then(|s| s.endpoint_mut(1))
            {
                ep.max_packet_size = ep0_in.max_packet_size();
            }
        }
        (CompletionCode::Success, slot_id)
    }

    fn cmd_reset_endpoint(&mut self, mem: &mut dyn MemoryBus, trb: &Trb) -> (CompletionCode, u8) {
        let slot_id = trb.slot_id();
        let dci = trb.endpoint_id();
        if self.slot_state(slot_id).is_none() {
            return (CompletionCode::SlotNotEnabledError, slot_id);
        }
        let Some(ep) = self.endpoint_mut(slot_id, dci) else {
            return (CompletionCode::TrbError, slot_id);
        };
        if !ep.is_enabled() {
            return (CompletionCode::EndpointNotEnabledError, slot_id);
        }
        if ep.state != EpState::Halted {
            return (CompletionCode::ContextStateError, slot_id);
        }
        // Back to stopped with the transfer state reset; the dequeue stays
        // at the snapshot the endpoint record carries, and the next doorbell
        // restarts the ring from there.
        ep.state = EpState::Stopped;
        ep.xfer = None;
        ep.pending_setup = None;
        self.shadow_endpoint_context(mem, slot_id, dci);
        (CompletionCode::Success, slot_id)
    }

    fn cmd_stop_endpoint(&mut self, mem: &mut dyn MemoryBus, trb: &Trb) -> (CompletionCode, u8) {
        let slot_id = trb.slot_id();
        let dci = trb.endpoint_id();
        if self.slot_state(slot_id).is_none() {
            return (CompletionCode::SlotNotEnabledError, slot_id);
        }
        let Some(ep) = self.endpoint_mut(slot_id, dci) else {
            return (CompletionCode::TrbError, slot_id);
        };
        if !ep.is_enabled() {
            return (CompletionCode::EndpointNotEnabledError, slot_id);
        }
        ep.state = EpState::Stopped;
        let stopped = ep.xfer.take();
        self.shadow_endpoint_context(mem, slot_id, dci);

        // Cancellation is best-effort: an in-flight transfer is abandoned
        // and reported with code Stopped.
        if let Some(xfer) = stopped {
            let (trb_addr, residual) = match xfer.blocks.get(xfer.head) {
                Some(block) if block.state != BlockState::Handled => {
                    let residual: usize =
                        xfer.blocks[xfer.head..].iter().map(|b| b.residual()).sum();
                    (block.trb_addr, residual as u32)
                }
                _ => (xfer.end_cursor.dequeue_ptr(), 0),
            };
            let event = Trb::transfer_event(
                trb_addr,
                residual,
                CompletionCode::Stopped,
                slot_id,
                dci,
            );
            let _ = self.post_event(mem, event, true);
        }
        (CompletionCode::Success, slot_id)
    }

    fn cmd_set_tr_dequeue(&mut self, mem: &mut dyn MemoryBus, trb: &Trb) -> (CompletionCode, u8) {
        let slot_id = trb.slot_id();
        let dci = trb.endpoint_id();
        let stream_id = trb.stream_id();
        if self.slot_state(slot_id).is_none() {
            return (CompletionCode::SlotNotEnabledError, slot_id);
        }
        let Some(ep) = self.endpoint_mut(slot_id, dci) else {
            return (CompletionCode::TrbError, slot_id);
        };
        if !ep.is_enabled() {
            return (CompletionCode::EndpointNotEnabledError, slot_id);
        }
        if !matches!(ep.state, EpState::Stopped | EpState::Error) {
            return (CompletionCode::ContextStateError, slot_id);
        }
        let cursor = RingCursor::new(trb.parameter & !0xf, trb.parameter & 1 != 0);
        if matches!(ep.ring, EndpointRing::Streams { .. }) {
            ep.ring.commit(mem, stream_id, cursor);
        } else {
            ep.ring = EndpointRing::Single(cursor);
        }
        ep.xfer = None;
        self.shadow_endpoint_context(mem, slot_id, dci);
        (CompletionCode::Success, slot_id)
    }

    fn cmd_reset_device(&mut self, mem: &mut dyn MemoryBus, trb: &Trb) -> (CompletionCode, u8) {
        let slot_id = trb.slot_id();
        let Some(slot) = self.slots.get(slot_id as usize).and_then(|s| s.as_ref()) else {
            return (CompletionCode::SlotNotEnabledError, slot_id);
        };
        let dev_ctx = slot.dev_ctx;
        let vport = slot.port;
        for dci in 2..=31u8 {
            self.disable_endpoint(mem, slot_id, dci);
        }
        if let Some(slot) = self.slots.get_mut(slot_id as usize).and_then(|s| s.as_mut()) {
            slot.state = SlotState::Default;
            slot.address = 0;
        }
        if dev_ctx != 0 {
            update_slot_ctx(mem, dev_ctx, |ctx| {
                ctx.set_slot_state(SLOT_STATE_DEFAULT);
                ctx.set_usb_device_address(0);
            });
        }
        if let Some(dev) = self.hub.device_mut(vport) {
            dev.reset();
        }
        (CompletionCode::Success, slot_id)
    }

    /// Disable an endpoint record and its guest context state. Idempotent.
    fn disable_endpoint(&mut self, mem: &mut dyn MemoryBus, slot_id: u8, dci: u8) {
        let Some(slot) = self.slots.get_mut(slot_id as usize).and_then(|s| s.as_mut()) else {
            return;
        };
        let dev_ctx = slot.dev_ctx;
        let Some(ep) = slot.endpoint_mut(dci) else {
            return;
        };
        if !ep.is_enabled() {
            return;
        }
        ep.disable();
        if dev_ctx != 0 {
            let paddr = dev_ctx + u64::from(dci) * CONTEXT_SIZE as u64;
            let mut ctx = EndpointContext::read_from(mem, paddr);
            ctx.set_endpoint_state(EP_STATE_DISABLED);
            ctx.write_to(mem, paddr);
        }
    }
}

fn update_slot_ctx(
    mem: &mut dyn MemoryBus,
    dev_ctx: u64,
    f: impl FnOnce(&mut SlotContext),
) {
    let mut ctx = SlotContext::read_from(mem, dev_ctx);
    f(&mut ctx);
    ctx.write_to(mem, dev_ctx);
}
