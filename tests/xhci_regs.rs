mod util;

use strato_usb::xhci::{regs, XhciController};

use util::{ManualClock, TestMemory};

#[test]
fn caplength_and_hciversion_are_stable() {
    let mut xhci = XhciController::new();
    let mut mem = TestMemory::new(0x1000);

    let caplength = xhci.mmio_read(&mut mem, regs::cap::CAPLENGTH as u64, 1) as u8;
    let hciversion = xhci.mmio_read(&mut mem, regs::cap::HCIVERSION as u64, 2) as u16;

    assert_eq!(caplength, regs::CAPLENGTH_VALUE);
    assert_eq!(hciversion, regs::HCIVERSION_VALUE);

    // Read again; values must be deterministic.
    assert_eq!(
        caplength,
        xhci.mmio_read(&mut mem, regs::cap::CAPLENGTH as u64, 1) as u8
    );
    assert_eq!(
        hciversion,
        xhci.mmio_read(&mut mem, regs::cap::HCIVERSION as u64, 2) as u16
    );
}

#[test]
fn hcsparams_advertise_slots_interrupters_and_ports() {
    let mut xhci = XhciController::new();
    let mut mem = TestMemory::new(0x1000);

    let hcsparams1 = xhci.mmio_read(&mut mem, regs::cap::HCSPARAMS1 as u64, 4) as u32;
    assert_eq!(hcsparams1 & 0xff, u32::from(regs::MAX_SLOTS));
    assert_eq!((hcsparams1 >> 8) & 0x7ff, u32::from(regs::MAX_INTRS));
    assert_eq!(hcsparams1 >> 24, u32::from(regs::MAX_PORTS));

    // Single-segment ERST (ERST-MAX = 0), IST = 4.
    let hcsparams2 = xhci.mmio_read(&mut mem, regs::cap::HCSPARAMS2 as u64, 4) as u32;
    assert_eq!((hcsparams2 >> 4) & 0xf, 0);
    assert_eq!(hcsparams2 & 0xf, 4);

    let hccparams1 = xhci.mmio_read(&mut mem, regs::cap::HCCPARAMS1 as u64, 4) as u32;
    assert_eq!(
        hccparams1 & regs::HCCPARAMS1_CSZ_64B,
        0,
        "the model uses 32-byte contexts"
    );
    assert_ne!(hccparams1 >> 16, 0, "xECP must point at the extended caps");
}

#[test]
fn dboff_and_rtsoff_are_aligned_and_inside_the_bar() {
    let mut xhci = XhciController::new();
    let mut mem = TestMemory::new(0x1000);

    let dboff = xhci.mmio_read(&mut mem, regs::cap::DBOFF as u64, 4);
    let rtsoff = xhci.mmio_read(&mut mem, regs::cap::RTSOFF as u64, 4);

    assert_ne!(dboff, 0);
    assert_eq!(dboff & 0x3, 0, "DBOFF must be dword-aligned");
    assert_ne!(rtsoff, 0);
    assert_eq!(rtsoff & 0x1f, 0, "RTSOFF must be 32-byte aligned");
    assert!(dboff < u64::from(XhciController::MMIO_SIZE));
    assert!(rtsoff < u64::from(XhciController::MMIO_SIZE));
    // Port register block (20 ports) sits between the operational registers
    // and the doorbell array.
    assert!(dboff >= regs::PORT_REGS_BASE + 20 * 0x10);
}

#[test]
fn run_stop_toggles_halted_bit() {
    let mut xhci = XhciController::new();
    let mut mem = TestMemory::new(0x1000);

    assert_ne!(
        xhci.mmio_read(&mut mem, regs::REG_USBSTS, 4) as u32 & regs::op::USBSTS_HCH,
        0,
        "controller should start halted"
    );

    xhci.mmio_write(&mut mem, regs::REG_USBCMD, 4, u64::from(regs::USBCMD_RUN));
    assert_eq!(
        xhci.mmio_read(&mut mem, regs::REG_USBSTS, 4) as u32 & regs::op::USBSTS_HCH,
        0
    );

    xhci.mmio_write(&mut mem, regs::REG_USBCMD, 4, 0);
    assert_ne!(
        xhci.mmio_read(&mut mem, regs::REG_USBSTS, 4) as u32 & regs::op::USBSTS_HCH,
        0
    );
}

#[test]
fn hcrst_clears_operational_state() {
    let mut xhci = XhciController::new();
    let mut mem = TestMemory::new(0x2000);

    // Dirty some state.
    xhci.mmio_write(&mut mem, regs::REG_CRCR_LO, 4, 0x1000 | 1);
    xhci.mmio_write(&mut mem, regs::REG_CRCR_HI, 4, 0);
    xhci.mmio_write(&mut mem, regs::REG_DCBAAP_LO, 4, 0x200);
    xhci.mmio_write(&mut mem, regs::REG_DCBAAP_HI, 4, 0);
    xhci.mmio_write(&mut mem, regs::REG_CONFIG, 4, 5);
    assert_ne!(xhci.mmio_read(&mut mem, regs::REG_CRCR_LO, 8), 0);

    xhci.mmio_write(&mut mem, regs::REG_USBCMD, 4, u64::from(regs::USBCMD_HCRST));

    let usbcmd = xhci.mmio_read(&mut mem, regs::REG_USBCMD, 4) as u32;
    assert_eq!(
        usbcmd & (regs::USBCMD_RUN | regs::USBCMD_HCRST),
        0,
        "HCRST self-clears and leaves the controller stopped"
    );
    assert_ne!(
        xhci.mmio_read(&mut mem, regs::REG_USBSTS, 4) as u32 & regs::op::USBSTS_HCH,
        0
    );
    assert_eq!(xhci.mmio_read(&mut mem, regs::REG_CRCR_LO, 8), 0);
    assert_eq!(xhci.mmio_read(&mut mem, regs::REG_DCBAAP_LO, 8), 0);
    assert_eq!(xhci.mmio_read(&mut mem, regs::REG_CONFIG, 4), 0);
    assert_eq!(xhci.mmio_read(&mut mem, regs::REG_MFINDEX, 4), 0);
}

#[test]
fn mfindex_counts_microframes_while_running() {
    let mut xhci = XhciController::new();
    let mut mem = TestMemory::new(0x1000);
    let clock = ManualClock::new();
    xhci.set_time_source(Box::new(clock.clone()));

    // Halted: no accumulation.
    clock.advance(10_000);
    assert_eq!(
        xhci.mmio_read(&mut mem, regs::REG_MFINDEX, 4) as u32 & regs::runtime::MFINDEX_MASK,
        0
    );

    xhci.mmio_write(&mut mem, regs::REG_USBCMD, 4, u64::from(regs::USBCMD_RUN));

    // 1000 us = 8 microframes of 125 us.
    clock.advance(1000);
    assert_eq!(
        xhci.mmio_read(&mut mem, regs::REG_MFINDEX, 4) as u32 & regs::runtime::MFINDEX_MASK,
        8
    );

    // The 14-bit counter wraps: 2^14 * 125 us later it reads the same.
    clock.advance((1 << 14) * 125);
    assert_eq!(
        xhci.mmio_read(&mut mem, regs::REG_MFINDEX, 4) as u32 & regs::runtime::MFINDEX_MASK,
        8
    );
}

#[test]
fn capability_writes_are_discarded() {
    let mut xhci = XhciController::new();
    let mut mem = TestMemory::new(0x1000);

    let before = xhci.mmio_read(&mut mem, regs::cap::HCSPARAMS1 as u64, 4);
    xhci.mmio_write(&mut mem, regs::cap::HCSPARAMS1 as u64, 4, 0xdead_beef);
    assert_eq!(xhci.mmio_read(&mut mem, regs::cap::HCSPARAMS1 as u64, 4), before);
}

#[test]
fn unsupported_offsets_read_zero() {
    let mut xhci = XhciController::new();
    let mut mem = TestMemory::new(0x1000);

    // Reserved hole between the operational registers and the port sets.
    let v = xhci.mmio_read(&mut mem, regs::OP_BASE + 0x100, 4);
    assert_eq!(v, 0);
}
