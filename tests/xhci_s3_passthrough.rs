mod util;

use strato_usb::xhci::context::{
    EndpointContext, InputControlContext, InputContext32, SlotContext,
};
use strato_usb::xhci::trb::{CompletionCode, Trb, TrbType, TRB_LEN};
use strato_usb::xhci::{regs, XhciController, XhciConfig, PORTSC_CCS, PORTSC_CSC};
use strato_usb::{
    DeviceClass, DeviceInfo, Direction, MemoryBus, Transfer, UsbDeviceKind, UsbDeviceModel,
    UsbPath, UsbSpeed, XferStatus,
};

use util::{
    configure_event_ring, event_at, make_command_trb, ring_command_doorbell, xhci_set_run, Alloc,
    TestMemory,
};

#[derive(Debug, Default)]
struct PassthroughStub;

impl UsbDeviceModel for PassthroughStub {
    fn kind(&self) -> UsbDeviceKind {
        UsbDeviceKind::PortMapped
    }

    fn speed(&self) -> UsbSpeed {
        UsbSpeed::Super
    }

    fn handle_request(&mut self, _xfer: &mut Transfer) -> XferStatus {
        XferStatus::Success
    }

    fn handle_data(&mut self, _xfer: &mut Transfer, _dir: Direction, _ep: u8) -> XferStatus {
        XferStatus::Nak
    }
}

fn device_info(path: UsbPath) -> DeviceInfo {
    DeviceInfo {
        path,
        speed: UsbSpeed::Super,
        vendor_id: 0x1d6b,
        product_id: 0x0003,
        class: DeviceClass::Standard,
    }
}

fn portsc_off(vport: u8) -> u64 {
    regs::port::portsc_offset(vport - 1)
}

#[test]
fn connect_requires_whitelisted_path() {
    let mut mem = TestMemory::new(0x1000);
    let mut xhci = XhciController::new();
    let path = UsbPath::new(1, &[2]);

    assert!(xhci
        .connect_device(&mut mem, device_info(path), Some(Box::new(PassthroughStub)))
        .is_err());

    xhci.assign_path(path);
    let vport = xhci
        .connect_device(&mut mem, device_info(path), Some(Box::new(PassthroughStub)))
        .unwrap();
    assert!(vport >= 1 && vport <= regs::MAX_PORTS / 2, "SuperSpeed port");
    let portsc = xhci.mmio_read(&mut mem, portsc_off(vport), 4) as u32;
    assert_ne!(portsc & PORTSC_CCS, 0);
    assert_ne!(portsc & PORTSC_CSC, 0);
}

#[test]
fn external_hub_whitelists_downstream_paths() {
    let mut mem = TestMemory::new(0x1000);
    let mut xhci = XhciController::new();
    let hub_path = UsbPath::new(1, &[4]);
    xhci.assign_path(hub_path);

    let hub_info = DeviceInfo {
        class: DeviceClass::ExternalHub { ports: 4 },
        ..device_info(hub_path)
    };
    // The hub itself claims no virtual port.
    let vport = xhci.connect_device(&mut mem, hub_info, None).unwrap();
    assert_eq!(vport, 0);

    // A leaf behind hub port 3 can now connect.
    let leaf = hub_path.child(3).unwrap();
    let vport = xhci
        .connect_device(&mut mem, device_info(leaf), Some(Box::new(PassthroughStub)))
        .unwrap();
    assert_ne!(vport, 0);
}

#[test]
fn unaddressed_disconnect_clears_port_silently() {
    let mut mem = TestMemory::new(0x20_000);
    let mut xhci = XhciController::new();
    let ring_base = 0x2000;
    configure_event_ring(&mut xhci, &mut mem, 0x1000, ring_base, 8);

    let path = UsbPath::new(1, &[2]);
    xhci.assign_path(path);
    let vport = xhci
        .connect_device(&mut mem, device_info(path), Some(Box::new(PassthroughStub)))
        .unwrap();
    // Connect produced one event.
    assert_eq!(
        event_at(&mut mem, ring_base, 0).trb_type(),
        TrbType::PortStatusChangeEvent
    );

    xhci.disconnect_device(&mut mem, path);
    let portsc = xhci.mmio_read(&mut mem, portsc_off(vport), 4) as u32;
    assert_eq!(portsc & PORTSC_CCS, 0);
    // No second event: the guest never saw the device.
    assert_ne!(
        event_at(&mut mem, ring_base, 1).trb_type(),
        TrbType::PortStatusChangeEvent
    );

    // The path can connect again.
    let vport2 = xhci
        .connect_device(&mut mem, device_info(path), Some(Box::new(PassthroughStub)))
        .unwrap();
    assert_eq!(vport2, vport);
}

/// Bring a pass-through device to the EMULATED state (slot 1 addressed).
fn address_passthrough(
    xhci: &mut XhciController,
    mem: &mut TestMemory,
    alloc: &mut Alloc,
    vport: u8,
) -> (u64, u64) {
    let dcbaa = alloc.alloc(0x200, 0x40);
    let dev_ctx = alloc.alloc(0x400, 0x40);
    let cmd_ring = alloc.alloc(0x200, 0x40);
    let input_ctx = alloc.alloc(0x420, 0x40);
    let ep0_ring = alloc.alloc(0x100, 0x10);

    xhci.mmio_write(mem, regs::REG_DCBAAP_LO, 4, dcbaa);
    xhci.mmio_write(mem, regs::REG_CRCR_LO, 4, cmd_ring | 1);
    xhci_set_run(xhci, mem);

    let ic = InputContext32::new(input_ctx);
    let mut icc = InputControlContext::default();
    icc.set_add_flags(0b11);
    ic.write_input_control(mem, &icc).unwrap();
    let mut slot = SlotContext::default();
    slot.set_root_hub_port_number(vport);
    ic.write_slot_context(mem, &slot).unwrap();
    let mut ep0 = EndpointContext::default();
    ep0.set_ep_type(4);
    ep0.set_max_packet_size(512);
    ep0.set_tr_dequeue_pointer(ep0_ring, true);
    ic.write_endpoint_context(mem, 1, &ep0).unwrap();
    MemoryBus::write_u64(mem, dcbaa + 8, dev_ctx);

    make_command_trb(TrbType::EnableSlotCommand, true).write_to(mem, cmd_ring);
    {
        let mut trb = Trb::new(input_ctx, 0, 0);
        trb.set_trb_type(TrbType::AddressDeviceCommand);
        trb.set_cycle(true);
        trb.set_slot_id(1);
        trb.write_to(mem, cmd_ring + TRB_LEN as u64);
    }
    make_command_trb(TrbType::NoOpCommand, false).write_to(mem, cmd_ring + 2 * TRB_LEN as u64);
    ring_command_doorbell(xhci, mem);

    (cmd_ring, dev_ctx)
}

#[test]
fn s3_cycle_reuses_virtual_port_and_replays_connect_after_disable_slot() {
    let mut mem = TestMemory::new(0x40_000);
    let mut alloc = Alloc::new(0x1000);
    let path = UsbPath::new(1, &[2]);
    let mut xhci = XhciController::with_config(
        XhciConfig {
            passthrough: vec![path],
            ..XhciConfig::default()
        },
        None,
    )
    .unwrap();

    let erstba = alloc.alloc(0x40, 0x40);
    let event_ring = alloc.alloc(32 * TRB_LEN as u64, 0x10);
    configure_event_ring(&mut xhci, &mut mem, erstba, event_ring, 32);

    let vport = xhci
        .connect_device(&mut mem, device_info(path), Some(Box::new(PassthroughStub)))
        .unwrap();
    let (cmd_ring, _dev_ctx) = address_passthrough(&mut xhci, &mut mem, &mut alloc, vport);
    // Events so far: connect (0), enable slot (1), address device (2).
    assert_eq!(
        event_at(&mut mem, event_ring, 2).completion_code_raw(),
        CompletionCode::Success.as_u8()
    );

    // Guest initiates save state.
    let usbcmd = xhci.mmio_read(&mut mem, regs::REG_USBCMD, 4);
    xhci.mmio_write(
        &mut mem,
        regs::REG_USBCMD,
        4,
        usbcmd | u64::from(regs::op::USBCMD_CSS),
    );
    let portsc = xhci.mmio_read(&mut mem, portsc_off(vport), 4) as u32;
    assert_eq!(portsc & PORTSC_CCS, 0, "PORTSC re-initialized at save");

    // Host-side disconnect during S3 is invisible to the guest.
    xhci.disconnect_device(&mut mem, path);
    assert_ne!(
        event_at(&mut mem, event_ring, 3).trb_type(),
        TrbType::PortStatusChangeEvent,
        "interim disconnect is suppressed"
    );

    // Reconnect after resume: the cached virtual port is re-used and the
    // announcement still deferred.
    let vport2 = xhci
        .connect_device(&mut mem, device_info(path), Some(Box::new(PassthroughStub)))
        .unwrap();
    assert_eq!(vport2, vport, "cached vport re-used");
    assert_ne!(
        event_at(&mut mem, event_ring, 3).trb_type(),
        TrbType::PortStatusChangeEvent
    );

    // Guest resumes and disables the stale slot.
    {
        let mut trb = make_command_trb(TrbType::DisableSlotCommand, true);
        trb.set_slot_id(1);
        trb.write_to(&mut mem, cmd_ring + 2 * TRB_LEN as u64);
    }
    make_command_trb(TrbType::NoOpCommand, false)
        .write_to(&mut mem, cmd_ring + 3 * TRB_LEN as u64);
    ring_command_doorbell(&mut xhci, &mut mem);
    assert_eq!(
        event_at(&mut mem, event_ring, 3).completion_code_raw(),
        CompletionCode::Success.as_u8()
    );

    // Disable-Slot moved the cache entry to END and signalled the worker.
    assert!(xhci.take_worker_signal());
    assert!(xhci.vbdp_service(&mut mem), "worker replays the connect");

    let ev = event_at(&mut mem, event_ring, 4);
    assert_eq!(ev.trb_type(), TrbType::PortStatusChangeEvent);
    let port_id = ((ev.parameter >> regs::PSC_EVENT_PORT_ID_SHIFT) & 0xff) as u8;
    assert_eq!(port_id, vport);

    let portsc = xhci.mmio_read(&mut mem, portsc_off(vport), 4) as u32;
    assert_ne!(portsc & PORTSC_CCS, 0);
    assert_ne!(portsc & PORTSC_CSC, 0);
    assert_eq!(
        (portsc & regs::PORTSC_SPEED_MASK) >> regs::PORTSC_SPEED_SHIFT,
        u32::from(regs::PSIV_SUPER_SPEED),
        "speed reflects the reconnected device"
    );

    // One replay only.
    assert!(!xhci.vbdp_service(&mut mem));
}

#[test]
fn addressed_disconnect_raises_event_and_leaves_slot_teardown_to_guest() {
    let mut mem = TestMemory::new(0x40_000);
    let mut alloc = Alloc::new(0x1000);
    let path = UsbPath::new(1, &[5]);
    let mut xhci = XhciController::new();
    xhci.assign_path(path);

    let erstba = alloc.alloc(0x40, 0x40);
    let event_ring = alloc.alloc(32 * TRB_LEN as u64, 0x10);
    configure_event_ring(&mut xhci, &mut mem, erstba, event_ring, 32);

    let vport = xhci
        .connect_device(&mut mem, device_info(path), Some(Box::new(PassthroughStub)))
        .unwrap();
    let (_cmd_ring, _dev_ctx) = address_passthrough(&mut xhci, &mut mem, &mut alloc, vport);

    xhci.disconnect_device(&mut mem, path);

    let ev = event_at(&mut mem, event_ring, 3);
    assert_eq!(ev.trb_type(), TrbType::PortStatusChangeEvent);
    let portsc = xhci.mmio_read(&mut mem, portsc_off(vport), 4) as u32;
    assert_eq!(portsc & PORTSC_CCS, 0);
    assert_ne!(portsc & PORTSC_CSC, 0);
    assert_eq!(
        (portsc & regs::PORTSC_PLS_MASK) >> regs::PORTSC_PLS_SHIFT,
        regs::PLS_RX_DETECT
    );

    // The slot still exists until the guest disables it.
    assert!(xhci.slot_state(1).is_some());
}
