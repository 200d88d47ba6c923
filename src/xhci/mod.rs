//! The xHCI host controller state machine.
//!
//! [`XhciController`] owns the register file, the slot table, the root hub
//! and the single interrupter. Every entry point takes `&mut self` plus the
//! guest [`MemoryBus`] and runs to completion without blocking; the
//! threading shell around it lives in [`device`].

pub mod command_ring;
pub mod context;
pub mod device;
pub mod extcaps;
pub mod interrupter;
pub mod ports;
pub mod regs;
pub mod ring;
pub mod slots;
pub mod transfer;
pub mod trb;

use std::sync::Arc;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::{
    dma_write, DeviceInfo, Direction, IrqPin, MemoryBus, MonotonicClock, TimeSource,
    UsbDeviceModel, UsbPath, XferStatus,
};

use extcaps::{ExtCapProfile, ExtCaps, RoleSwitchSink};
use interrupter::{EventRingError, Interrupter};
use ports::{PortError, RootHub};
use slots::{DeviceSlot, EpState, SlotState};
use transfer::{build_transfer, completion_code_for, BlockState, BuildOutcome, Transfer};
use trb::{CompletionCode, Trb, TrbType};

pub use regs::{
    PORTSC_CCS, PORTSC_CSC, PORTSC_PEC, PORTSC_PED, PORTSC_PLC, PORTSC_PP, PORTSC_PR, PORTSC_PRC,
    PORTSC_WRC,
};

/// Steps a single ring walk may take before the controller declares the ring
/// malformed.
pub const RING_STEP_BUDGET: u32 = 1024;
/// Commands consumed per doorbell-0 ring.
const CMD_BUDGET: u32 = 256;

/// Result of a transfer-completion notification from a device backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyResult {
    /// Nothing to report to the guest.
    None,
    /// Events were queued and the interrupter raised.
    Interrupt,
    /// The slot or endpoint named by the notification does not exist.
    Error,
}

/// Construction-time configuration. Invalid configuration is fatal: the
/// device never joins the bus.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct XhciConfig {
    /// Root-hub port count; the low half is USB3.
    pub port_count: u8,
    pub profile: ExtCapProfile,
    /// Physical paths whitelisted for pass-through.
    pub passthrough: Vec<UsbPath>,
}

impl Default for XhciConfig {
    fn default() -> Self {
        Self {
            port_count: regs::MAX_PORTS,
            profile: ExtCapProfile::Default,
            passthrough: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("port count {0} not in 1..=20")]
    InvalidPortCount(u8),
    #[error("pass-through path listed twice: {0:?}")]
    DuplicatePath(UsbPath),
}

pub struct XhciController {
    usbcmd: u32,
    usbsts: u32,
    dnctrl: u32,
    config_reg: u32,
    crcr: u64,
    crr: bool,
    dcbaap: u64,

    intr: Interrupter,
    hub: RootHub,
    slots: Vec<Option<DeviceSlot>>,
    extcaps: ExtCaps,

    clock: Box<dyn TimeSource>,
    mf_accum_micros: u64,
    mf_last_micros: u64,

    irq_pin: Option<Arc<dyn IrqPin>>,
    irq_level: bool,
}

impl XhciController {
    /// Size of the MMIO BAR window.
    pub const MMIO_SIZE: u32 = 0x800;

    pub fn new() -> Self {
        Self::from_config(XhciConfig::default(), None)
    }

    pub fn with_port_count(port_count: u8) -> Self {
        let port_count = port_count.clamp(1, regs::MAX_PORTS);
        Self::from_config(
            XhciConfig {
                port_count,
                ..XhciConfig::default()
            },
            None,
        )
    }

    /// Build a controller from validated configuration.
    pub fn with_config(
        config: XhciConfig,
        sink: Option<RoleSwitchSink>,
    ) -> Result<Self, ConfigError> {
        if config.port_count == 0 || config.port_count > regs::MAX_PORTS {
            return Err(ConfigError::InvalidPortCount(config.port_count));
        }
        for (i, path) in config.passthrough.iter().enumerate() {
            if config.passthrough[..i].contains(path) {
                return Err(ConfigError::DuplicatePath(*path));
            }
        }
        Ok(Self::from_config(config, sink))
    }

    fn from_config(config: XhciConfig, sink: Option<RoleSwitchSink>) -> Self {
        let port_count = config.port_count;
        let usb3_count = port_count / 2;
        let usb2_count = port_count - usb3_count;
        let extcaps = ExtCaps::new(
            config.profile,
            (1, usb3_count),
            (usb3_count + 1, usb2_count),
            sink,
        );
        let mut hub = RootHub::new(port_count);
        for path in config.passthrough {
            hub.assign_path(path);
        }
        let mut slots = Vec::with_capacity(regs::MAX_SLOTS as usize + 1);
        slots.resize_with(regs::MAX_SLOTS as usize + 1, || None);
        Self {
            usbcmd: 0,
            usbsts: regs::op::USBSTS_HCH,
            dnctrl: 0,
            config_reg: 0,
            crcr: 0,
            crr: false,
            dcbaap: 0,
            intr: Interrupter::new(),
            hub,
            slots,
            extcaps,
            clock: Box::new(MonotonicClock::new()),
            mf_accum_micros: 0,
            mf_last_micros: 0,
            irq_pin: None,
            irq_level: false,
        }
    }

    pub fn set_irq_pin(&mut self, pin: Arc<dyn IrqPin>) {
        self.irq_pin = Some(pin);
    }

    pub fn set_time_source(&mut self, clock: Box<dyn TimeSource>) {
        self.clock = clock;
        self.mf_last_micros = self.clock.now_micros();
    }

    pub fn irq_level(&self) -> bool {
        self.irq_level
    }

    pub fn interrupter0(&self) -> &Interrupter {
        &self.intr
    }

    pub fn running(&self) -> bool {
        self.usbsts & regs::op::USBSTS_HCH == 0
    }

    pub fn dcbaap(&self) -> u64 {
        self.dcbaap
    }

    pub fn set_dcbaap(&mut self, dcbaap: u64) {
        self.dcbaap = dcbaap;
    }

    /// Seed the command ring the way a CRCR write does.
    pub fn set_command_ring(&mut self, base: u64, cycle: bool) {
        self.crcr = (base & !0xf) | u64::from(cycle);
    }

    pub fn slot_state(&self, slot_id: u8) -> Option<&DeviceSlot> {
        self.slots.get(slot_id as usize)?.as_ref()
    }

    pub fn port_count(&self) -> u8 {
        self.hub.port_count()
    }

    pub fn portsc(&self, vport: u8) -> u32 {
        self.hub.portsc(vport)
    }

    pub fn drdcfg(&self) -> Option<(u32, u32)> {
        self.extcaps.drdcfg()
    }

    // ---- hot-plug surface -------------------------------------------------

    /// Attach a fully-emulated device to a free port of its speed class.
    pub fn attach_device(
        &mut self,
        mem: &mut dyn MemoryBus,
        dev: Box<dyn UsbDeviceModel>,
    ) -> Result<u8, PortError> {
        let (vport, event) = self.hub.attach_emulated(dev)?;
        self.post_port_event(mem, event);
        Ok(vport)
    }

    /// Whitelist a physical path for pass-through.
    pub fn assign_path(&mut self, path: UsbPath) {
        self.hub.assign_path(path);
    }

    /// Hot-plug arrival of a physical device. `dev` is the pass-through
    /// backend the monitor glue constructed for it.
    pub fn connect_device(
        &mut self,
        mem: &mut dyn MemoryBus,
        info: DeviceInfo,
        dev: Option<Box<dyn UsbDeviceModel>>,
    ) -> Result<u8, PortError> {
        let (vport, event) = self.hub.connect(info, dev)?;
        if let Some(event) = event {
            self.post_port_event(mem, event);
        }
        Ok(vport)
    }

    /// Hot-plug removal.
    pub fn disconnect_device(&mut self, mem: &mut dyn MemoryBus, path: UsbPath) {
        if let Some(event) = self.hub.disconnect(path) {
            self.post_port_event(mem, event);
        }
    }

    /// Transfer-completion notification from an asynchronous backend.
    pub fn notify_transfer(
        &mut self,
        mem: &mut dyn MemoryBus,
        slot_id: u8,
        epid: u8,
    ) -> NotifyResult {
        let Some(slot) = self.slots.get_mut(slot_id as usize).and_then(|s| s.as_mut()) else {
            return NotifyResult::Error;
        };
        let Some(ep) = slot.endpoint_mut(epid) else {
            return NotifyResult::Error;
        };
        if !ep.is_enabled() {
            return NotifyResult::Error;
        }
        let vport = slot.port;
        match slot.endpoint_mut(epid).and_then(|ep| ep.xfer.take()) {
            Some(xfer) => match self.submit_xfer(mem, vport, xfer) {
                true => NotifyResult::Interrupt,
                false => NotifyResult::None,
            },
            // Nothing in flight: treat the notify as a poll for freshly
            // queued TRBs.
            None => {
                if self.doorbell_transfer(mem, slot_id, epid, 0) {
                    NotifyResult::Interrupt
                } else {
                    NotifyResult::None
                }
            }
        }
    }

    /// Unconditional interrupter assertion.
    pub fn raise_interrupt(&mut self) {
        self.intr.set_interrupt_pending(true);
        self.usbsts |= regs::USBSTS_EINT;
        self.update_irq();
    }

    /// Whether the S3 worker has been signalled since the last call.
    pub fn take_worker_signal(&mut self) -> bool {
        self.hub.take_worker_signal()
    }

    /// One pass of the S3 worker: replay a cached connect for a device that
    /// survived the host-side suspend. Returns whether work was done.
    pub fn vbdp_service(&mut self, mem: &mut dyn MemoryBus) -> bool {
        match self.hub.vbdp_service_one() {
            Some(vport) => {
                self.post_port_event(mem, Trb::port_status_change_event(vport));
                true
            }
            None => false,
        }
    }

    // ---- event ring glue --------------------------------------------------

    /// Append an event to the guest event ring, raising the interrupter when
    /// `intr` is set.
    pub fn post_event(
        &mut self,
        mem: &mut dyn MemoryBus,
        trb: Trb,
        intr: bool,
    ) -> Result<(), EventRingError> {
        match self.intr.insert_event(mem, trb, intr) {
            Ok(raised) => {
                if raised {
                    self.usbsts |= regs::USBSTS_EINT;
                }
                self.update_irq();
                Ok(())
            }
            Err(EventRingError::Full) => {
                // The overflow path forces an interrupt so the guest learns
                // the ring wedged.
                self.usbsts |= regs::USBSTS_EINT;
                self.update_irq();
                Err(EventRingError::Full)
            }
            Err(EventRingError::HostControllerError) => {
                self.usbsts |= regs::USBSTS_HCE;
                Err(EventRingError::HostControllerError)
            }
            Err(EventRingError::NotConfigured) => {
                debug!("xhci: event dropped, event ring not configured");
                Err(EventRingError::NotConfigured)
            }
        }
    }

    fn post_port_event(&mut self, mem: &mut dyn MemoryBus, trb: Trb) {
        self.usbsts |= regs::USBSTS_PCD;
        let _ = self.post_event(mem, trb, true);
    }

    fn update_irq(&mut self) {
        let level = self.usbcmd & regs::op::USBCMD_INTE != 0
            && self.intr.interrupt_enabled()
            && self.intr.interrupt_pending();
        if level != self.irq_level {
            self.irq_level = level;
            if let Some(pin) = &self.irq_pin {
                if level {
                    pin.assert();
                } else {
                    pin.deassert();
                }
            }
        }
    }

    // ---- MMIO -------------------------------------------------------------

    pub fn mmio_read(&mut self, mem: &mut dyn MemoryBus, offset: u64, size: u8) -> u64 {
        let value = match size {
            8 => {
                let lo = self.read32(mem, offset) as u64;
                let hi = self.read32(mem, offset + 4) as u64;
                lo | (hi << 32)
            }
            4 => self.read32(mem, offset) as u64,
            2 | 1 => {
                let dword = self.read32(mem, offset & !3) as u64;
                let shift = (offset & 3) * 8;
                let mask = if size == 1 { 0xff } else { 0xffff };
                (dword >> shift) & mask
            }
            _ => 0,
        };
        trace!("xhci: mmio read {offset:#x}/{size} -> {value:#x}");
        value
    }

    pub fn mmio_read_u32(&mut self, mem: &mut dyn MemoryBus, offset: u64) -> u32 {
        self.mmio_read(mem, offset, 4) as u32
    }

    pub fn mmio_write(&mut self, mem: &mut dyn MemoryBus, offset: u64, size: u8, value: u64) {
        trace!("xhci: mmio write {offset:#x}/{size} <- {value:#x}");
        match size {
            8 => {
                self.write32(mem, offset, value as u32);
                self.write32(mem, offset + 4, (value >> 32) as u32);
            }
            4 => self.write32(mem, offset, value as u32),
            2 | 1 => {
                // Sub-dword writes merge into the containing register.
                let aligned = offset & !3;
                let shift = (offset & 3) * 8;
                let mask: u32 = if size == 1 { 0xff } else { 0xffff };
                let current = self.read32(mem, aligned);
                let merged =
                    (current & !(mask << shift)) | (((value as u32) & mask) << shift);
                self.write32(mem, aligned, merged);
            }
            _ => {}
        }
    }

    fn read32(&mut self, _mem: &mut dyn MemoryBus, offset: u64) -> u32 {
        match offset {
            0x00 => (regs::CAPLENGTH_VALUE as u32) | ((regs::HCIVERSION_VALUE as u32) << 16),
            o if o == regs::cap::HCSPARAMS1 as u64 => {
                ((self.hub.port_count() as u32) << 24)
                    | ((regs::MAX_INTRS as u32) << 8)
                    | regs::MAX_SLOTS as u32
            }
            o if o == regs::cap::HCSPARAMS2 as u64 => regs::HCSPARAMS2_VALUE,
            o if o == regs::cap::HCSPARAMS3 as u64 => regs::HCSPARAMS3_VALUE,
            o if o == regs::cap::HCCPARAMS1 as u64 => regs::HCCPARAMS1_VALUE,
            o if o == regs::cap::DBOFF as u64 => regs::DBOFF_VALUE,
            o if o == regs::cap::RTSOFF as u64 => regs::RTSOFF_VALUE,
            o if o == regs::cap::HCCPARAMS2 as u64 => regs::HCCPARAMS2_VALUE,
            o if (regs::OP_BASE..regs::PORT_REGS_BASE).contains(&o) => {
                self.op_read((o - regs::OP_BASE) as u32)
            }
            o if (regs::PORT_REGS_BASE..regs::DBOFF_VALUE as u64).contains(&o) => {
                self.port_read(o - regs::PORT_REGS_BASE)
            }
            o if (regs::DBOFF_VALUE as u64..regs::RTSOFF_VALUE as u64).contains(&o) => {
                // Doorbells are write-only.
                0
            }
            o if (regs::RTSOFF_VALUE as u64..regs::EXT_CAPS_BASE).contains(&o) => {
                self.runtime_read(o - regs::RTSOFF_VALUE as u64)
            }
            o if (regs::EXT_CAPS_BASE..regs::REGS_END).contains(&o) => {
                self.extcaps.read(o - regs::EXT_CAPS_BASE)
            }
            _ => 0,
        }
    }

    fn op_read(&mut self, offset: u32) -> u32 {
        match offset {
            o if o == regs::op::USBCMD => self.usbcmd,
            o if o == regs::op::USBSTS => self.usbsts,
            o if o == regs::op::PAGESIZE => 1, // 4 KiB pages
            o if o == regs::op::DNCTRL => self.dnctrl,
            o if o == regs::op::CRCR => {
                (self.crcr as u32 & !0xf) | if self.crr { regs::op::CRCR_CRR as u32 } else { 0 }
            }
            o if o == regs::op::CRCR + 4 => (self.crcr >> 32) as u32,
            o if o == regs::op::DCBAAP => self.dcbaap as u32,
            o if o == regs::op::DCBAAP + 4 => (self.dcbaap >> 32) as u32,
            o if o == regs::op::CONFIG => self.config_reg,
            _ => 0,
        }
    }

    fn port_read(&self, rel: u64) -> u32 {
        let index = (rel / regs::PORT_REGS_STRIDE) as u8;
        let vport = index + 1;
        let Some(port) = self.hub.regs(vport) else {
            return 0;
        };
        match rel % regs::PORT_REGS_STRIDE {
            0x0 => port.portsc,
            0x4 => port.portpmsc,
            0x8 => port.portli,
            _ => 0,
        }
    }

    fn runtime_read(&mut self, rel: u64) -> u32 {
        match rel as u32 {
            o if o == regs::runtime::MFINDEX => self.mfindex(),
            o if o == regs::runtime::IR0_IMAN => self.intr.iman(),
            o if o == regs::runtime::IR0_IMOD => self.intr.imod(),
            o if o == regs::runtime::IR0_ERSTSZ => self.intr.erstsz(),
            o if o == regs::runtime::IR0_ERSTBA => self.intr.erstba() as u32,
            o if o == regs::runtime::IR0_ERSTBA + 4 => (self.intr.erstba() >> 32) as u32,
            o if o == regs::runtime::IR0_ERDP => self.intr.erdp() as u32,
            o if o == regs::runtime::IR0_ERDP + 4 => (self.intr.erdp() >> 32) as u32,
            _ => 0,
        }
    }

    fn write32(&mut self, mem: &mut dyn MemoryBus, offset: u64, value: u32) {
        match offset {
            o if o < regs::OP_BASE => {
                warn!("xhci: write to read-only capability register {o:#x} discarded");
            }
            o if (regs::OP_BASE..regs::PORT_REGS_BASE).contains(&o) => {
                self.op_write(mem, (o - regs::OP_BASE) as u32, value)
            }
            o if (regs::PORT_REGS_BASE..regs::DBOFF_VALUE as u64).contains(&o) => {
                self.port_write(mem, o - regs::PORT_REGS_BASE, value)
            }
            o if (regs::DBOFF_VALUE as u64..regs::RTSOFF_VALUE as u64).contains(&o) => {
                let index = ((o - regs::DBOFF_VALUE as u64) / 4) as u32;
                self.doorbell_write(mem, index, value);
            }
            o if (regs::RTSOFF_VALUE as u64..regs::EXT_CAPS_BASE).contains(&o) => {
                self.runtime_write(mem, o - regs::RTSOFF_VALUE as u64, value)
            }
            o if (regs::EXT_CAPS_BASE..regs::REGS_END).contains(&o) => {
                self.extcaps.write(o - regs::EXT_CAPS_BASE, value)
            }
            o => {
                debug!("xhci: write to unimplemented register {o:#x} ignored");
            }
        }
    }

    fn op_write(&mut self, mem: &mut dyn MemoryBus, offset: u32, value: u32) {
        match offset {
            o if o == regs::op::USBCMD => self.usbcmd_write(value),
            o if o == regs::op::USBSTS => self.usbsts_write(value),
            o if o == regs::op::DNCTRL => self.dnctrl = value,
            o if o == regs::op::CRCR => self.crcr_write_lo(value),
            o if o == regs::op::CRCR + 4 => self.crcr_write_hi(value),
            o if o == regs::op::DCBAAP => {
                self.dcbaap = (self.dcbaap & 0xffff_ffff_0000_0000) | u64::from(value & !0x3f);
            }
            o if o == regs::op::DCBAAP + 4 => {
                self.dcbaap = (self.dcbaap & 0xffff_ffff) | (u64::from(value) << 32);
            }
            o if o == regs::op::CONFIG => self.config_reg = value & 0xff,
            o => {
                debug!("xhci: write to operational register {o:#x} ignored");
            }
        }
    }

    fn usbcmd_write(&mut self, value: u32) {
        if value & regs::op::USBCMD_HCRST != 0 {
            debug!("xhci: host controller reset");
            self.controller_reset();
            return;
        }

        let was_running = self.running();
        self.usbcmd = value
            & (regs::op::USBCMD_RUN_STOP | regs::op::USBCMD_INTE | regs::op::USBCMD_HSEE);

        if value & regs::op::USBCMD_RUN_STOP != 0 {
            if !was_running {
                self.mf_last_micros = self.clock.now_micros();
            }
            self.usbsts &= !regs::op::USBSTS_HCH;
        } else {
            self.usbsts |= regs::op::USBSTS_HCH;
            self.crr = false;
        }

        // Save/restore state complete immediately: the controller keeps no
        // host-side state the guest could lose. Save additionally parks
        // every pass-through binding in the suspend cache.
        if value & regs::op::USBCMD_CSS != 0 {
            debug!("xhci: guest save state, caching pass-through bindings");
            self.hub.s3_save();
        }

        self.update_irq();
    }

    fn usbsts_write(&mut self, value: u32) {
        // RW1C bits; HCH/CNR are status, HCE is sticky.
        let w1c = regs::op::USBSTS_EINT
            | regs::op::USBSTS_PCD
            | regs::op::USBSTS_SSS
            | regs::op::USBSTS_RSS
            | regs::op::USBSTS_SRE;
        self.usbsts &= !(value & w1c);
        if value & regs::op::USBSTS_EINT != 0 {
            self.intr.set_interrupt_pending(false);
        }
        self.update_irq();
    }

    fn crcr_write_lo(&mut self, value: u32) {
        if self.crr {
            warn!("xhci: CRCR write while command ring running ignored");
            return;
        }
        if value & (regs::op::CRCR_CS | regs::op::CRCR_CA) as u32 != 0 {
            debug!("xhci: command stop/abort not implemented, ring is never left running");
        }
        self.crcr = (self.crcr & 0xffff_ffff_0000_0000)
            | u64::from(value & !((regs::op::CRCR_CS | regs::op::CRCR_CA | regs::op::CRCR_CRR) as u32));
    }

    fn crcr_write_hi(&mut self, value: u32) {
        if self.crr {
            warn!("xhci: CRCR write while command ring running ignored");
            return;
        }
        self.crcr = (self.crcr & 0xffff_ffff) | (u64::from(value) << 32);
    }

    fn port_write(&mut self, mem: &mut dyn MemoryBus, rel: u64, value: u32) {
        let index = (rel / regs::PORT_REGS_STRIDE) as u8;
        let vport = index + 1;
        match rel % regs::PORT_REGS_STRIDE {
            0x0 => {
                let events = self.hub.portsc_write(vport, value);
                for event in events {
                    self.post_port_event(mem, event);
                }
            }
            0x4 => {
                if let Some(port) = self.hub.regs_mut(vport) {
                    port.portpmsc = value;
                }
            }
            _ => {}
        }
    }

    fn runtime_write(&mut self, mem: &mut dyn MemoryBus, rel: u64, value: u32) {
        match rel as u32 {
            o if o == regs::runtime::IR0_IMAN => {
                self.intr.iman_write(value);
                self.update_irq();
            }
            o if o == regs::runtime::IR0_IMOD => self.intr.imod_write(value),
            o if o == regs::runtime::IR0_ERSTSZ => self.intr.erstsz_write(value),
            o if o == regs::runtime::IR0_ERSTBA => self.intr.erstba_write_lo(value),
            o if o == regs::runtime::IR0_ERSTBA + 4 => self.intr.erstba_write_hi(value),
            o if o == regs::runtime::IR0_ERDP => {
                let erdp = (self.intr.erdp() & 0xffff_ffff_0000_0000) | u64::from(value);
                if self.intr.erdp_write(mem, erdp).is_err() {
                    self.usbsts |= regs::USBSTS_HCE;
                }
                self.update_irq();
            }
            o if o == regs::runtime::IR0_ERDP + 4 => {
                let erdp = (self.intr.erdp() & 0xffff_ffff) | (u64::from(value) << 32);
                if self.intr.erdp_write(mem, erdp).is_err() {
                    self.usbsts |= regs::USBSTS_HCE;
                }
                self.update_irq();
            }
            o => {
                debug!("xhci: write to runtime register {o:#x} ignored");
            }
        }
    }

    fn mfindex(&mut self) -> u32 {
        let now = self.clock.now_micros();
        if self.running() {
            self.mf_accum_micros += now.saturating_sub(self.mf_last_micros);
        }
        self.mf_last_micros = now;
        ((self.mf_accum_micros / 125) as u32) & regs::runtime::MFINDEX_MASK
    }

    /// HCRST: every slot disabled, event ring indices reset (producer cycle
    /// back to 1), CRCR cleared, controller halted.
    fn controller_reset(&mut self) {
        self.usbcmd = 0;
        self.usbsts = regs::op::USBSTS_HCH;
        self.dnctrl = 0;
        self.config_reg = 0;
        self.crcr = 0;
        self.crr = false;
        self.dcbaap = 0;
        self.intr.reset();
        self.mf_accum_micros = 0;
        self.mf_last_micros = self.clock.now_micros();
        for slot in &mut self.slots {
            *slot = None;
        }
        self.hub.controller_reset();
        self.update_irq();
    }

    // ---- doorbells and the transfer engine --------------------------------

    fn doorbell_write(&mut self, mem: &mut dyn MemoryBus, index: u32, value: u32) {
        if !self.running() {
            debug!("xhci: doorbell {index} ignored while halted");
            return;
        }
        if index == 0 {
            self.process_command_ring(mem, CMD_BUDGET);
            return;
        }
        if index > regs::MAX_SLOTS as u32 {
            return;
        }
        let target = (value & 0xff) as u8;
        let stream_id = (value >> 16) as u16;
        self.doorbell_transfer(mem, index as u8, target, stream_id);
    }

    /// Convenience doorbell entry for embedders and tests.
    pub fn ring_doorbell(&mut self, mem: &mut dyn MemoryBus, slot_id: u8, target: u8) {
        if slot_id == 0 {
            self.doorbell_write(mem, 0, 0);
        } else {
            self.doorbell_write(mem, slot_id as u32, target as u32);
        }
    }

    /// Walk the endpoint's transfer ring and hand the assembled transfer to
    /// the device backend. Returns whether any event was posted.
    fn doorbell_transfer(
        &mut self,
        mem: &mut dyn MemoryBus,
        slot_id: u8,
        epid: u8,
        stream_id: u16,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(slot_id as usize).and_then(|s| s.as_mut()) else {
            debug!("xhci: doorbell for unknown slot {slot_id}");
            return false;
        };
        if matches!(slot.state, SlotState::Disabled | SlotState::Enabled) {
            debug!("xhci: doorbell for unaddressed slot {slot_id}");
            return false;
        }
        let vport = slot.port;
        let Some(ep) = slot.endpoint_mut(epid) else {
            return false;
        };
        match ep.state {
            EpState::Disabled | EpState::Halted | EpState::Error => {
                debug!("xhci: doorbell for slot {slot_id} ep {epid} in {:?}", ep.state);
                return false;
            }
            // Ringing the doorbell restarts a stopped endpoint.
            EpState::Stopped => ep.state = EpState::Running,
            EpState::Running => {}
        }

        // Retry path: an outstanding transfer is re-issued once instead of
        // walking the ring again.
        if let Some(xfer) = ep.xfer.take() {
            return self.submit_xfer(mem, vport, xfer);
        }

        let pending_setup = ep.pending_setup;
        let Some(mut cursor) = ep.ring.cursor(mem, stream_id) else {
            debug!("xhci: no transfer ring for slot {slot_id} ep {epid} stream {stream_id}");
            return false;
        };
        match build_transfer(
            mem,
            &mut cursor,
            slot_id,
            epid,
            stream_id,
            pending_setup,
            RING_STEP_BUDGET,
        ) {
            BuildOutcome::Empty => false,
            BuildOutcome::Fault(trb_addr, code) => {
                warn!("xhci: malformed TRB at {trb_addr:#x} on slot {slot_id} ep {epid}");
                if let Some(ep) = self.endpoint_mut(slot_id, epid) {
                    ep.state = EpState::Halted;
                }
                self.shadow_endpoint_context(mem, slot_id, epid);
                let event = Trb::transfer_event(trb_addr, 0, code, slot_id, epid);
                let _ = self.post_event(mem, event, true);
                true
            }
            BuildOutcome::Ready(xfer) => self.submit_xfer(mem, vport, xfer),
        }
    }

    /// Submit to the backend and complete unless the backend NAKed.
    fn submit_xfer(&mut self, mem: &mut dyn MemoryBus, vport: u8, mut xfer: Transfer) -> bool {
        let slot_id = xfer.slot_id;
        let epid = xfer.epid;
        let status = match self.hub.take_device(vport) {
            Some(mut dev) => {
                let status = if epid == 1 {
                    dev.handle_request(&mut xfer)
                } else {
                    let dir = xfer.direction();
                    dev.handle_data(&mut xfer, dir, epid / 2)
                };
                self.hub.put_device(vport, dev);
                status
            }
            None => {
                warn!("xhci: no device behind port {vport} for slot {slot_id}");
                XferStatus::IoError
            }
        };
        xfer.submitted = true;

        if status == XferStatus::Nak {
            // Deferred: keep the transfer pending; the visible dequeue stays
            // at the TD start until it really completes.
            if let Some(ep) = self.endpoint_mut(slot_id, epid) {
                ep.xfer = Some(xfer);
            }
            return false;
        }
        xfer.status = status;
        self.complete_xfer(mem, xfer)
    }

    /// Map the backend status, account the processed blocks, write IN data
    /// to guest memory and emit the Transfer Events the TD asked for.
    fn complete_xfer(&mut self, mem: &mut dyn MemoryBus, mut xfer: Transfer) -> bool {
        let slot_id = xfer.slot_id;
        let epid = xfer.epid;
        let stream_id = xfer.stream_id;
        let code = completion_code_for(xfer.status);
        let dir = xfer.direction();

        // Settle the block ring: a synchronous completion handles every
        // remaining block; a full OUT success implies all bytes were taken.
        let full_out = dir == Direction::Out && xfer.status == XferStatus::Success;
        xfer.finish_blocks(full_out);

        let mut events = Vec::new();
        let mut edtla: u32 = 0;
        let mut td_residual: usize = 0;
        let mut head = xfer.head;
        for block in &xfer.blocks[xfer.head..] {
            if block.state != BlockState::Handled {
                break;
            }
            head += 1;
            if dir == Direction::In && block.bdone > 0 {
                if let Some(gpa) = block.gpa {
                    dma_write(mem, gpa, &block.data[..block.bdone.min(block.data.len())]);
                }
            }
            edtla = edtla.wrapping_add(block.bdone as u32);
            td_residual += block.residual();

            let notify =
                block.ioc() || (code == CompletionCode::ShortPacket && block.isp());
            if block.trb_type() == TrbType::EventData {
                if notify {
                    let mut event =
                        Trb::transfer_event(block.param, edtla & 0xf_ffff, code, slot_id, epid);
                    event.control |= Trb::CONTROL_ED_BIT;
                    events.push(event);
                }
                edtla = 0;
                td_residual = 0;
            } else if notify {
                let event = Trb::transfer_event(
                    block.trb_addr,
                    td_residual as u32,
                    code,
                    slot_id,
                    epid,
                );
                events.push(event);
                td_residual = 0;
            }
        }
        xfer.head = head;

        // Commit ring progress and endpoint state.
        let halt = code == CompletionCode::StallError;
        let end_cursor = xfer.end_cursor;
        let had_status_stage = xfer
            .blocks
            .iter()
            .any(|b| b.trb_type() == TrbType::StatusStage);
        let ureq = xfer.ureq;
        if let Some(ep) = self.endpoint_mut(slot_id, epid) {
            if halt {
                ep.state = EpState::Halted;
            }
            ep.ring.commit(mem, stream_id, end_cursor);
            ep.pending_setup = if had_status_stage { None } else { ureq };
        }
        self.shadow_endpoint_context(mem, slot_id, epid);

        let count = events.len();
        for (i, event) in events.into_iter().enumerate() {
            // One interrupt per completion batch.
            let _ = self.post_event(mem, event, i + 1 == count);
        }
        count > 0
    }

    fn endpoint_mut(&mut self, slot_id: u8, epid: u8) -> Option<&mut slots::Endpoint> {
        self.slots
            .get_mut(slot_id as usize)?
            .as_mut()?
            .endpoint_mut(epid)
    }

    /// Shadow the controller-local endpoint state and dequeue pointer into
    /// the guest device context.
    pub(crate) fn shadow_endpoint_context(
        &mut self,
        mem: &mut dyn MemoryBus,
        slot_id: u8,
        epid: u8,
    ) {
        let Some(slot) = self.slots.get(slot_id as usize).and_then(|s| s.as_ref()) else {
            return;
        };
        if slot.dev_ctx == 0 {
            return;
        }
        let Some(ep) = slot.endpoint(epid) else {
            return;
        };
        let paddr = slot.dev_ctx + (epid as u64) * context::CONTEXT_SIZE as u64;
        let mut ctx = context::EndpointContext::read_from(mem, paddr);
        ctx.set_endpoint_state(ep.state.context_value());
        if let slots::EndpointRing::Single(cursor) = &ep.ring {
            ctx.set_tr_dequeue_pointer(cursor.dequeue_ptr(), cursor.cycle_state());
        }
        ctx.write_to(mem, paddr);
    }
}

impl Default for XhciController {
    fn default() -> Self {
        Self::new()
    }
}
