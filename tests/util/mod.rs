#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strato_usb::xhci::interrupter::IMAN_IE;
use strato_usb::xhci::regs;
use strato_usb::xhci::trb::{Trb, TrbType, TRB_LEN};
use strato_usb::xhci::XhciController;
use strato_usb::{MemoryBus, TimeSource};

/// Flat guest memory backing for ring and context DMA.
pub struct TestMemory {
    pub data: Vec<u8>,
}

impl TestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) {
        let addr = addr as usize;
        buf.copy_from_slice(&self.data[addr..addr + buf.len()]);
    }

    pub fn write(&mut self, addr: u64, buf: &[u8]) {
        let addr = addr as usize;
        self.data[addr..addr + buf.len()].copy_from_slice(buf);
    }
}

impl MemoryBus for TestMemory {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) {
        let addr = paddr as usize;
        buf.copy_from_slice(&self.data[addr..addr + buf.len()]);
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        let addr = paddr as usize;
        self.data[addr..addr + buf.len()].copy_from_slice(buf);
    }
}

/// Bump allocator handing out guest-physical ranges.
#[derive(Default)]
pub struct Alloc {
    next: u64,
}

impl Alloc {
    pub fn new(base: u64) -> Self {
        Self { next: base }
    }

    pub fn alloc(&mut self, size: u64, align: u64) -> u64 {
        let align = align.max(1);
        let mask = align - 1;
        let aligned = (self.next + mask) & !mask;
        self.next = aligned + size;
        aligned
    }
}

/// Manually advanced microsecond clock shared with the controller.
#[derive(Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_micros(&mut self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

pub fn write_erst_entry(mem: &mut TestMemory, erstba: u64, seg_base: u64, seg_size_trbs: u32) {
    MemoryBus::write_u64(mem, erstba, seg_base);
    MemoryBus::write_u32(mem, erstba + 8, seg_size_trbs);
    MemoryBus::write_u32(mem, erstba + 12, 0);
}

/// Program interrupter 0 with a single-segment event ring and enable both
/// interrupt gates (USBCMD.INTE and IMAN.IE).
pub fn configure_event_ring(
    ctrl: &mut XhciController,
    mem: &mut TestMemory,
    erstba: u64,
    ring_base: u64,
    ring_size_trbs: u32,
) {
    write_erst_entry(mem, erstba, ring_base, ring_size_trbs);

    ctrl.mmio_write(mem, regs::REG_INTR0_ERSTSZ, 4, 1);
    ctrl.mmio_write(mem, regs::REG_INTR0_ERSTBA_LO, 4, erstba & 0xffff_ffff);
    ctrl.mmio_write(mem, regs::REG_INTR0_ERSTBA_HI, 4, erstba >> 32);
    ctrl.mmio_write(mem, regs::REG_INTR0_ERDP_LO, 4, ring_base & 0xffff_ffff);
    ctrl.mmio_write(mem, regs::REG_INTR0_ERDP_HI, 4, ring_base >> 32);
    ctrl.mmio_write(mem, regs::REG_INTR0_IMAN, 4, u64::from(IMAN_IE));

    let usbcmd = ctrl.mmio_read(mem, regs::REG_USBCMD, 4);
    ctrl.mmio_write(
        mem,
        regs::REG_USBCMD,
        4,
        usbcmd | u64::from(regs::op::USBCMD_INTE),
    );
}

/// Set USBCMD.RUN (preserving the other command bits) so doorbells are
/// accepted.
pub fn xhci_set_run(ctrl: &mut XhciController, mem: &mut TestMemory) {
    let usbcmd = ctrl.mmio_read(mem, regs::REG_USBCMD, 4);
    ctrl.mmio_write(
        mem,
        regs::REG_USBCMD,
        4,
        usbcmd | u64::from(regs::USBCMD_RUN),
    );
}

/// Read the `index`-th event TRB of the ring at `ring_base`.
pub fn event_at(mem: &mut TestMemory, ring_base: u64, index: u64) -> Trb {
    Trb::read_from(mem, ring_base + index * TRB_LEN as u64)
}

pub fn make_command_trb(ty: TrbType, cycle: bool) -> Trb {
    let mut trb = Trb::default();
    trb.set_trb_type(ty);
    trb.set_cycle(cycle);
    trb
}

pub fn make_link_trb(target: u64, cycle: bool, toggle_cycle: bool) -> Trb {
    let mut trb = Trb::new(target, 0, 0);
    trb.set_trb_type(TrbType::Link);
    trb.set_cycle(cycle);
    trb.set_link_toggle_cycle(toggle_cycle);
    trb
}

pub fn make_normal_trb(buf_ptr: u64, len: u32, cycle: bool, ioc: bool) -> Trb {
    let mut trb = Trb::new(buf_ptr, len & Trb::STATUS_TRANSFER_LEN_MASK, 0);
    trb.set_trb_type(TrbType::Normal);
    trb.set_cycle(cycle);
    if ioc {
        trb.control |= Trb::CONTROL_IOC_BIT;
    }
    trb
}

/// Ring a device slot doorbell through MMIO.
pub fn ring_endpoint_doorbell(
    ctrl: &mut XhciController,
    mem: &mut TestMemory,
    slot_id: u8,
    endpoint_id: u8,
) {
    let dboff = ctrl.mmio_read(mem, regs::cap::DBOFF as u64, 4);
    let doorbell = dboff + u64::from(slot_id) * 4;
    ctrl.mmio_write(mem, doorbell, 4, u64::from(endpoint_id));
}

/// Ring doorbell 0 (command ring).
pub fn ring_command_doorbell(ctrl: &mut XhciController, mem: &mut TestMemory) {
    let dboff = ctrl.mmio_read(mem, regs::cap::DBOFF as u64, 4);
    ctrl.mmio_write(mem, dboff, 4, 0);
}

/// Write a running endpoint context into a guest device context.
pub fn write_endpoint_context(
    mem: &mut TestMemory,
    dev_ctx: u64,
    endpoint_id: u8,
    ep_type_raw: u8,
    max_packet_size: u16,
    ring_base: u64,
    dcs: bool,
) {
    let base = dev_ctx + u64::from(endpoint_id) * 0x20;
    // Endpoint state: running.
    MemoryBus::write_u32(mem, base, 1);
    MemoryBus::write_u32(
        mem,
        base + 4,
        ((ep_type_raw as u32) << 3) | (u32::from(max_packet_size) << 16),
    );
    let trdp_raw = (ring_base & !0x0f) | u64::from(dcs);
    MemoryBus::write_u64(mem, base + 8, trdp_raw);
}
