mod util;

use strato_usb::xhci::context::{
    DeviceContext32, EndpointContext, InputControlContext, InputContext32, SlotContext,
};
use strato_usb::xhci::trb::{CompletionCode, Trb, TrbType, TRB_LEN};
use strato_usb::xhci::{regs, XhciController};
use strato_usb::{
    Direction, MemoryBus, Transfer, UsbDeviceModel, UsbSpeed, XferStatus,
};

use util::{
    configure_event_ring, event_at, make_command_trb, ring_command_doorbell, xhci_set_run, Alloc,
    TestMemory,
};

#[derive(Debug, Default)]
struct AckDevice;

impl UsbDeviceModel for AckDevice {
    fn speed(&self) -> UsbSpeed {
        UsbSpeed::Full
    }

    fn handle_request(&mut self, _xfer: &mut Transfer) -> XferStatus {
        XferStatus::Success
    }

    fn handle_data(&mut self, _xfer: &mut Transfer, _dir: Direction, _ep: u8) -> XferStatus {
        XferStatus::Success
    }
}

struct Fixture {
    xhci: XhciController,
    mem: TestMemory,
    cmd_ring: u64,
    event_ring: u64,
    dev_ctx: u64,
    input_ctx: u64,
    next_event: u64,
    next_cmd: u64,
}

impl Fixture {
    /// Bring a controller to the point where slot 1 is addressed.
    fn addressed() -> Self {
        let mut mem = TestMemory::new(0x40_000);
        let mut alloc = Alloc::new(0x1000);
        let mut xhci = XhciController::new();
        let vport = xhci.attach_device(&mut mem, Box::new(AckDevice)).unwrap();

        let dcbaa = alloc.alloc(0x200, 0x40);
        let dev_ctx = alloc.alloc(0x400, 0x40);
        let cmd_ring = alloc.alloc(0x800, 0x40);
        let input_ctx = alloc.alloc(0x420, 0x40);
        let ep0_ring = alloc.alloc(0x100, 0x10);
        let erstba = alloc.alloc(0x40, 0x40);
        let event_ring = alloc.alloc(64 * TRB_LEN as u64, 0x10);

        configure_event_ring(&mut xhci, &mut mem, erstba, event_ring, 64);
        xhci.mmio_write(&mut mem, regs::REG_DCBAAP_LO, 4, dcbaa);
        xhci.mmio_write(&mut mem, regs::REG_CRCR_LO, 4, cmd_ring | 1);
        xhci_set_run(&mut xhci, &mut mem);

        let ic = InputContext32::new(input_ctx);
        let mut icc = InputControlContext::default();
        icc.set_add_flags(0b11);
        ic.write_input_control(&mut mem, &icc).unwrap();
        let mut slot = SlotContext::default();
        slot.set_root_hub_port_number(vport);
        ic.write_slot_context(&mut mem, &slot).unwrap();
        let mut ep0 = EndpointContext::default();
        ep0.set_ep_type(4);
        ep0.set_max_packet_size(64);
        ep0.set_tr_dequeue_pointer(ep0_ring, true);
        ic.write_endpoint_context(&mut mem, 1, &ep0).unwrap();
        MemoryBus::write_u64(&mut mem, dcbaa + 8, dev_ctx);

        make_command_trb(TrbType::EnableSlotCommand, true).write_to(&mut mem, cmd_ring);
        {
            let mut trb = Trb::new(input_ctx, 0, 0);
            trb.set_trb_type(TrbType::AddressDeviceCommand);
            trb.set_cycle(true);
            trb.set_slot_id(1);
            trb.write_to(&mut mem, cmd_ring + TRB_LEN as u64);
        }
        make_command_trb(TrbType::NoOpCommand, false)
            .write_to(&mut mem, cmd_ring + 2 * TRB_LEN as u64);
        ring_command_doorbell(&mut xhci, &mut mem);
        assert_eq!(
            event_at(&mut mem, event_ring, 1).completion_code_raw(),
            CompletionCode::Success.as_u8()
        );

        Fixture {
            xhci,
            mem,
            cmd_ring,
            event_ring,
            dev_ctx,
            input_ctx,
            next_event: 2,
            next_cmd: 2,
        }
    }

    /// Queue a single command TRB followed by a stop marker, ring, and
    /// return its completion event.
    fn run_command(&mut self, mut trb: Trb) -> Trb {
        let at = self.cmd_ring + self.next_cmd * TRB_LEN as u64;
        trb.set_cycle(true);
        trb.write_to(&mut self.mem, at);
        make_command_trb(TrbType::NoOpCommand, false)
            .write_to(&mut self.mem, at + TRB_LEN as u64);
        ring_command_doorbell(&mut self.xhci, &mut self.mem);
        self.next_cmd += 1;
        let ev = event_at(&mut self.mem, self.event_ring, self.next_event);
        self.next_event += 1;
        ev
    }
}

fn configure_ep_trb(input_ctx: u64, slot_id: u8) -> Trb {
    let mut trb = Trb::new(input_ctx, 0, 0);
    trb.set_trb_type(TrbType::ConfigureEndpointCommand);
    trb.set_slot_id(slot_id);
    trb
}

#[test]
fn configure_endpoint_adds_endpoint_and_marks_slot_configured() {
    let mut fx = Fixture::addressed();
    let ep_ring = 0x2_0000u64 - 0x100;

    // Input context: add EP1 OUT (DCI 2), bulk.
    let ic = InputContext32::new(fx.input_ctx);
    let mut icc = InputControlContext::default();
    icc.set_add_flags(1 << 2);
    ic.write_input_control(&mut fx.mem, &icc).unwrap();
    let mut ep = EndpointContext::default();
    ep.set_ep_type(2); // Bulk OUT
    ep.set_max_packet_size(512);
    ep.set_tr_dequeue_pointer(ep_ring, true);
    ic.write_endpoint_context(&mut fx.mem, 2, &ep).unwrap();

    let ev = fx.run_command(configure_ep_trb(fx.input_ctx, 1));
    assert_eq!(ev.completion_code_raw(), CompletionCode::Success.as_u8());

    let dc = DeviceContext32::new(fx.dev_ctx);
    assert_eq!(dc.slot_context(&mut fx.mem).slot_state(), 3, "Configured");
    let ep_out = dc.endpoint_context(&mut fx.mem, 2).unwrap();
    assert_eq!(ep_out.endpoint_state(), 1, "Running");
    assert_eq!(ep_out.tr_dequeue_pointer(), ep_ring);

    let slot = fx.xhci.slot_state(1).unwrap();
    let ring = slot.transfer_ring(2).expect("EP ring cursor installed");
    assert_eq!(ring.dequeue_ptr(), ep_ring);
}

#[test]
fn deconfigure_returns_slot_to_addressed_with_endpoints_disabled() {
    let mut fx = Fixture::addressed();
    let ep_ring = 0x2_0000u64 - 0x100;

    let ic = InputContext32::new(fx.input_ctx);
    let mut icc = InputControlContext::default();
    icc.set_add_flags(1 << 2);
    ic.write_input_control(&mut fx.mem, &icc).unwrap();
    let mut ep = EndpointContext::default();
    ep.set_ep_type(2);
    ep.set_max_packet_size(512);
    ep.set_tr_dequeue_pointer(ep_ring, true);
    ic.write_endpoint_context(&mut fx.mem, 2, &ep).unwrap();

    let ev = fx.run_command(configure_ep_trb(fx.input_ctx, 1));
    assert_eq!(ev.completion_code_raw(), CompletionCode::Success.as_u8());

    // Deconfigure (DC bit): back to Addressed, endpoints 2..31 disabled.
    let mut dcep = configure_ep_trb(fx.input_ctx, 1);
    dcep.control |= Trb::CONTROL_DC_BIT;
    let ev = fx.run_command(dcep);
    assert_eq!(ev.completion_code_raw(), CompletionCode::Success.as_u8());

    let dc = DeviceContext32::new(fx.dev_ctx);
    assert_eq!(dc.slot_context(&mut fx.mem).slot_state(), 2, "Addressed");
    let ep_out = dc.endpoint_context(&mut fx.mem, 2).unwrap();
    assert_eq!(ep_out.endpoint_state(), 0, "Disabled");

    let slot = fx.xhci.slot_state(1).unwrap();
    assert!(slot.transfer_ring(2).is_none(), "endpoint record released");
    assert!(slot.transfer_ring(1).is_some(), "EP0 survives deconfigure");
}

#[test]
fn drop_flag_disables_a_single_endpoint() {
    let mut fx = Fixture::addressed();
    let ep_ring = 0x2_0000u64 - 0x100;

    let ic = InputContext32::new(fx.input_ctx);
    let mut icc = InputControlContext::default();
    icc.set_add_flags((1 << 2) | (1 << 3));
    ic.write_input_control(&mut fx.mem, &icc).unwrap();
    let mut ep = EndpointContext::default();
    ep.set_ep_type(2);
    ep.set_max_packet_size(512);
    ep.set_tr_dequeue_pointer(ep_ring, true);
    ic.write_endpoint_context(&mut fx.mem, 2, &ep).unwrap();
    let mut ep_in = EndpointContext::default();
    ep_in.set_ep_type(6); // Bulk IN
    ep_in.set_max_packet_size(512);
    ep_in.set_tr_dequeue_pointer(ep_ring + 0x100, true);
    ic.write_endpoint_context(&mut fx.mem, 3, &ep_in).unwrap();

    let ev = fx.run_command(configure_ep_trb(fx.input_ctx, 1));
    assert_eq!(ev.completion_code_raw(), CompletionCode::Success.as_u8());

    // Second configure drops DCI 2 only.
    let mut icc = InputControlContext::default();
    icc.set_drop_flags(1 << 2);
    ic.write_input_control(&mut fx.mem, &icc).unwrap();
    let ev = fx.run_command(configure_ep_trb(fx.input_ctx, 1));
    assert_eq!(ev.completion_code_raw(), CompletionCode::Success.as_u8());

    let slot = fx.xhci.slot_state(1).unwrap();
    assert!(slot.transfer_ring(2).is_none());
    assert!(slot.transfer_ring(3).is_some());
}

#[test]
fn evaluate_context_updates_slot_fields_and_ep0_mps() {
    let mut fx = Fixture::addressed();

    let ic = InputContext32::new(fx.input_ctx);
    let mut icc = InputControlContext::default();
    icc.set_add_flags(0b11);
    ic.write_input_control(&mut fx.mem, &icc).unwrap();
    let mut slot_in = SlotContext::default();
    slot_in.set_max_exit_latency(1234);
    slot_in.set_interrupter_target(0);
    ic.write_slot_context(&mut fx.mem, &slot_in).unwrap();
    let mut ep0_in = EndpointContext::default();
    ep0_in.set_max_packet_size(8);
    ic.write_endpoint_context(&mut fx.mem, 1, &ep0_in).unwrap();

    let mut trb = Trb::new(fx.input_ctx, 0, 0);
    trb.set_trb_type(TrbType::EvaluateContextCommand);
    trb.set_slot_id(1);
    let ev = fx.run_command(trb);
    assert_eq!(ev.completion_code_raw(), CompletionCode::Success.as_u8());

    let dc = DeviceContext32::new(fx.dev_ctx);
    let slot_out = dc.slot_context(&mut fx.mem);
    assert_eq!(slot_out.max_exit_latency(), 1234);
    // The rest of the slot context is untouched.
    assert_eq!(slot_out.slot_state(), 2);
    let ep0_out = dc.endpoint_context(&mut fx.mem, 1).unwrap();
    assert_eq!(ep0_out.max_packet_size(), 8);
}
