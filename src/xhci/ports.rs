//! Root-hub ports, the virtual-port binding table for pass-through devices,
//! and the S3 suspend cache.
//!
//! A physical device is identified by its stable `(bus, path)` tuple; the
//! guest only ever sees a virtual port number. The `native` table carries the
//! binding state machine (FREE → ASSIGNED → CONNECTED → EMULATED); the `vbdp`
//! cache hides a host-side disconnect/reconnect across a guest S3 cycle so
//! the guest resumes against the same virtual port.

use log::{debug, warn};
use thiserror::Error;

use crate::{DeviceClass, DeviceInfo, UsbDeviceModel, UsbPath, UsbSpeed};

use super::regs::{
    PLS_POLLING, PLS_RX_DETECT, PLS_U0, PLS_U3, PORTSC_CCS, PORTSC_CHANGE_BITS, PORTSC_CSC,
    PORTSC_LWS, PORTSC_PEC, PORTSC_PED, PORTSC_PLC, PORTSC_PLS_MASK, PORTSC_PLS_SHIFT, PORTSC_PP,
    PORTSC_PR, PORTSC_PRC, PORTSC_SPEED_MASK, PORTSC_SPEED_SHIFT, PORTSC_WCE, PORTSC_WDE,
    PORTSC_WOE, PORTSC_WPR, PORTSC_WRC,
};
use super::trb::Trb;

/// Upper bound on simultaneously suspended pass-through devices.
const VBDP_MAX: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("physical path is not whitelisted for pass-through")]
    NotAssigned,
    #[error("no free virtual port for the device's speed class")]
    NoFreePort,
    #[error("port index out of range")]
    InvalidPort,
}

/// Binding state of one whitelisted physical path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VportState {
    Free,
    Assigned,
    Connected,
    Emulated,
}

#[derive(Debug)]
pub struct NativePort {
    pub path: UsbPath,
    pub state: VportState,
    /// Allocated virtual port while CONNECTED/EMULATED (1-based, 0 = none).
    pub vport: u8,
    pub info: Option<DeviceInfo>,
}

/// S3 suspend cache entry state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VbdpState {
    Start,
    End,
}

#[derive(Debug)]
pub struct VbdpEntry {
    pub path: UsbPath,
    pub vport: u8,
    pub state: VbdpState,
}

/// Per-port register file (one 16-byte register set each).
#[derive(Clone, Copy, Debug, Default)]
pub struct PortRegs {
    pub portsc: u32,
    pub portpmsc: u32,
    pub portli: u32,
}

pub struct Port {
    pub regs: PortRegs,
    pub device: Option<Box<dyn UsbDeviceModel>>,
}

impl Port {
    fn new() -> Self {
        Self {
            regs: PortRegs {
                // Ports are powered out of reset; the model does not
                // implement per-port power switching.
                portsc: PORTSC_PP | (PLS_RX_DETECT << PORTSC_PLS_SHIFT),
                ..Default::default()
            },
            device: None,
        }
    }

    fn reinit(&mut self) {
        self.regs = PortRegs {
            portsc: PORTSC_PP | (PLS_RX_DETECT << PORTSC_PLS_SHIFT),
            ..Default::default()
        };
        self.device = None;
    }
}

pub struct RootHub {
    ports: Vec<Port>,
    native: Vec<NativePort>,
    vbdp: Vec<VbdpEntry>,
    /// Set when the S3 worker should scan the vbdp cache.
    worker_signal: bool,
}

impl RootHub {
    pub fn new(port_count: u8) -> Self {
        let ports = (0..port_count).map(|_| Port::new()).collect();
        Self {
            ports,
            native: Vec::new(),
            vbdp: Vec::new(),
            worker_signal: false,
        }
    }

    pub fn port_count(&self) -> u8 {
        self.ports.len() as u8
    }

    /// Virtual ports reserved for USB3 devices: the low half.
    fn usb3_range(&self) -> std::ops::RangeInclusive<u8> {
        1..=self.port_count() / 2
    }

    fn usb2_range(&self) -> std::ops::RangeInclusive<u8> {
        self.port_count() / 2 + 1..=self.port_count()
    }

    pub fn is_usb3_port(&self, vport: u8) -> bool {
        self.usb3_range().contains(&vport)
    }

    fn port(&self, vport: u8) -> Option<&Port> {
        if vport == 0 {
            return None;
        }
        self.ports.get(vport as usize - 1)
    }

    fn port_mut(&mut self, vport: u8) -> Option<&mut Port> {
        if vport == 0 {
            return None;
        }
        self.ports.get_mut(vport as usize - 1)
    }

    pub fn portsc(&self, vport: u8) -> u32 {
        self.port(vport).map(|p| p.regs.portsc).unwrap_or(0)
    }

    pub fn regs(&self, vport: u8) -> Option<&PortRegs> {
        self.port(vport).map(|p| &p.regs)
    }

    pub fn regs_mut(&mut self, vport: u8) -> Option<&mut PortRegs> {
        self.port_mut(vport).map(|p| &mut p.regs)
    }

    pub fn device_mut(&mut self, vport: u8) -> Option<&mut Box<dyn UsbDeviceModel>> {
        self.port_mut(vport)?.device.as_mut()
    }

    /// Temporarily take a port's device so the caller can hand both the
    /// device and this hub to the transfer engine.
    pub fn take_device(&mut self, vport: u8) -> Option<Box<dyn UsbDeviceModel>> {
        self.port_mut(vport)?.device.take()
    }

    pub fn put_device(&mut self, vport: u8, dev: Box<dyn UsbDeviceModel>) {
        if let Some(port) = self.port_mut(vport) {
            port.device = Some(dev);
        }
    }

    pub fn device_speed(&self, vport: u8) -> Option<UsbSpeed> {
        self.port(vport)?.device.as_ref().map(|d| d.speed())
    }

    /// Whitelist a physical path for pass-through (FREE → ASSIGNED).
    pub fn assign_path(&mut self, path: UsbPath) {
        if self.native.iter().any(|n| n.path == path) {
            return;
        }
        self.native.push(NativePort {
            path,
            state: VportState::Assigned,
            vport: 0,
            info: None,
        });
    }

    pub fn native_state(&self, path: &UsbPath) -> Option<VportState> {
        self.native.iter().find(|n| n.path == *path).map(|n| n.state)
    }

    pub fn vbdp_entries(&self) -> &[VbdpEntry] {
        &self.vbdp
    }

    fn vbdp_find(&mut self, path: &UsbPath, state: VbdpState) -> Option<&mut VbdpEntry> {
        self.vbdp
            .iter_mut()
            .find(|e| e.path == *path && e.state == state)
    }

    /// Attach a fully-emulated device directly to a free virtual port of the
    /// matching speed class. Used for built-in class emulators which have no
    /// physical path.
    pub fn attach_emulated(
        &mut self,
        dev: Box<dyn UsbDeviceModel>,
    ) -> Result<(u8, Trb), PortError> {
        let speed = dev.speed();
        let vport = self.alloc_vport(speed)?;
        self.plug(vport, speed, dev);
        Ok((vport, Trb::port_status_change_event(vport)))
    }

    /// Hot-plug arrival of a physical device.
    ///
    /// Returns the virtual port plus the port-status-change event to post,
    /// if any: the event is suppressed when the arrival is the tail end of a
    /// guest S3 cycle (the worker announces it after the guest's
    /// Disable-Slot).
    pub fn connect(
        &mut self,
        info: DeviceInfo,
        dev: Option<Box<dyn UsbDeviceModel>>,
    ) -> Result<(u8, Option<Trb>), PortError> {
        if let DeviceClass::ExternalHub { ports } = info.class {
            // Hubs are not emulated: whitelist each downstream path so leaf
            // devices can bind when they arrive.
            for i in 1..=ports {
                if let Some(child) = info.path.child(i) {
                    self.assign_path(child);
                }
            }
            debug!("xhci: external hub at {:?}, {} ports assigned", info.path, ports);
            return Ok((0, None));
        }

        let idx = self
            .native
            .iter()
            .position(|n| n.path == info.path && n.state == VportState::Assigned)
            .ok_or(PortError::NotAssigned)?;

        // A START entry means the guest never saw this device leave: re-use
        // the cached virtual port and stay quiet until the worker runs.
        let cached = self.vbdp_find(&info.path, VbdpState::Start).map(|e| e.vport);
        let (vport, event) = match cached {
            Some(vport) => (vport, None),
            None => {
                let vport = self.alloc_vport(info.speed)?;
                (vport, Some(Trb::port_status_change_event(vport)))
            }
        };

        if let Some(dev) = dev {
            self.plug(vport, info.speed, dev);
        } else {
            self.plug_regs_only(vport, info.speed);
        }
        let native = &mut self.native[idx];
        native.state = VportState::Connected;
        native.vport = vport;
        native.info = Some(info);
        debug!("xhci: device {:?} connected on vport {vport}", info.path);
        Ok((vport, event))
    }

    /// Hot-plug removal.
    pub fn disconnect(&mut self, path: UsbPath) -> Option<Trb> {
        // Symmetric external-hub handling: forget whitelisted downstream
        // paths that never attached.
        self.native
            .retain(|n| !(n.state == VportState::Assigned && is_child_of(&n.path, &path)));

        // During a guest S3 cycle the disconnect is invisible to the guest.
        if self.vbdp_find(&path, VbdpState::Start).is_some() {
            debug!("xhci: disconnect of {path:?} suppressed during S3");
            return None;
        }

        let native = self.native.iter_mut().find(|n| n.path == path)?;
        let vport = native.vport;
        let state = native.state;
        native.state = VportState::Assigned;
        native.vport = 0;
        native.info = None;

        let port = self.port_mut(vport)?;
        port.device = None;
        match state {
            VportState::Connected => {
                // The guest never addressed it; retract silently.
                port.regs.portsc &=
                    !(PORTSC_CCS | PORTSC_PED | PORTSC_SPEED_MASK | PORTSC_PLS_MASK);
                port.regs.portsc |= PLS_RX_DETECT << PORTSC_PLS_SHIFT;
                None
            }
            VportState::Emulated => {
                port.regs.portsc &= !(PORTSC_CCS | PORTSC_PED | PORTSC_PLS_MASK);
                port.regs.portsc |= PORTSC_CSC | (PLS_RX_DETECT << PORTSC_PLS_SHIFT);
                // Slot teardown is the guest's job via Disable Slot.
                Some(Trb::port_status_change_event(vport))
            }
            _ => None,
        }
    }

    /// Port reset (cold or warm). Ends with the port enabled
    /// at the bound device's speed.
    pub fn reset_port(&mut self, vport: u8, warm: bool) -> Option<Trb> {
        let usb3 = self.is_usb3_port(vport);
        let speed = self.device_speed(vport);
        let port = self.port_mut(vport)?;
        if port.regs.portsc & PORTSC_CCS == 0 {
            debug!("xhci: reset of empty port {vport} ignored");
            return None;
        }
        if let Some(dev) = port.device.as_mut() {
            dev.reset();
        }
        let mut portsc = port.regs.portsc;
        portsc &= !(PORTSC_PR | PORTSC_WPR | PORTSC_PLS_MASK | PORTSC_SPEED_MASK);
        portsc |= PORTSC_PED | PORTSC_PRC | (PLS_U0 << PORTSC_PLS_SHIFT);
        if let Some(speed) = speed {
            portsc |= (speed.psiv() as u32) << PORTSC_SPEED_SHIFT;
        }
        if warm && usb3 {
            portsc |= PORTSC_WRC;
        }
        port.regs.portsc = portsc;
        Some(Trb::port_status_change_event(vport))
    }

    /// PORTSC write. Change bits are write-1-to-clear; PR/WPR trigger a
    /// reset; PLS writes are honored only with LWS set; everything else of
    /// the incoming value is a command, not a stored bit.
    pub fn portsc_write(&mut self, vport: u8, value: u32) -> Vec<Trb> {
        let mut events = Vec::new();
        let Some(port) = self.port_mut(vport) else {
            return events;
        };

        port.regs.portsc &= !(value & PORTSC_CHANGE_BITS);

        // Wake-on bits are plain read-write.
        let wake = PORTSC_WCE | PORTSC_WDE | PORTSC_WOE;
        port.regs.portsc = (port.regs.portsc & !wake) | (value & wake);

        if value & PORTSC_PP == 0 && port.regs.portsc & PORTSC_PP != 0 {
            warn!("xhci: write clearing PORTSC.PP on port {vport} ignored");
        }

        if value & (PORTSC_PR | PORTSC_WPR) != 0 {
            if let Some(ev) = self.reset_port(vport, value & PORTSC_WPR != 0) {
                events.push(ev);
            }
            return events;
        }

        if value & PORTSC_LWS != 0 {
            let target = (value & PORTSC_PLS_MASK) >> PORTSC_PLS_SHIFT;
            let port = match self.port_mut(vport) {
                Some(p) => p,
                None => return events,
            };
            let current = (port.regs.portsc & PORTSC_PLS_MASK) >> PORTSC_PLS_SHIFT;
            match target {
                PLS_U3 => {
                    port.regs.portsc =
                        (port.regs.portsc & !PORTSC_PLS_MASK) | (PLS_U3 << PORTSC_PLS_SHIFT);
                }
                PLS_U0 => {
                    port.regs.portsc =
                        (port.regs.portsc & !PORTSC_PLS_MASK) | (PLS_U0 << PORTSC_PLS_SHIFT);
                    if current != PLS_U0 {
                        port.regs.portsc |= PORTSC_PLC;
                        events.push(Trb::port_status_change_event(vport));
                    }
                }
                other => {
                    debug!("xhci: unsupported PLS target {other} on port {vport}");
                }
            }
        } else if value & PORTSC_PED != 0 {
            // PED is write-1-to-disable.
            let port = match self.port_mut(vport) {
                Some(p) => p,
                None => return events,
            };
            if port.regs.portsc & PORTSC_PED != 0 {
                port.regs.portsc &= !PORTSC_PED;
                port.regs.portsc |= PORTSC_PEC;
                events.push(Trb::port_status_change_event(vport));
            }
        }

        events
    }

    /// Guest-initiated save state (USBCMD.CSS): stash every emulated
    /// pass-through binding in the suspend cache and return its ports to
    /// ASSIGNED, so the host-side disconnect that follows stays invisible.
    pub fn s3_save(&mut self) {
        let mut suspended = Vec::new();
        for native in &mut self.native {
            if native.state != VportState::Emulated {
                continue;
            }
            suspended.push((native.path, native.vport));
            native.state = VportState::Assigned;
            native.vport = 0;
            native.info = None;
        }
        for (path, vport) in suspended {
            if self.vbdp.len() >= VBDP_MAX {
                warn!("xhci: suspend cache full, dropping {path:?}");
                continue;
            }
            if let Some(port) = self.port_mut(vport) {
                port.reinit();
            }
            debug!("xhci: S3 save caches {path:?} on vport {vport}");
            self.vbdp.push(VbdpEntry {
                path,
                vport,
                state: VbdpState::Start,
            });
        }
    }

    /// CONNECTED → EMULATED when the guest addresses a device on `vport`.
    pub fn note_slot_bound(&mut self, vport: u8) {
        if let Some(native) = self.native.iter_mut().find(|n| n.vport == vport) {
            native.state = VportState::Emulated;
        }
    }

    /// Guest Disable-Slot bookkeeping for the slot bound to `vport`.
    ///
    /// Moves a matching START suspend-cache entry to END. Always signals the
    /// worker: even without a binding it may have deferred work to retry.
    pub fn note_slot_disabled(&mut self, vport: u8) {
        if vport != 0 {
            if let Some(entry) = self
                .vbdp
                .iter_mut()
                .find(|e| e.vport == vport && e.state == VbdpState::Start)
            {
                entry.state = VbdpState::End;
                debug!("xhci: vbdp entry for vport {vport} ready for replay");
            } else if let Some(native) = self.native.iter_mut().find(|n| n.vport == vport) {
                // The guest released a pass-through device: the port shows
                // empty until the next hot-plug arrival.
                native.state = VportState::Assigned;
                native.vport = 0;
                native.info = None;
                if let Some(port) = self.port_mut(vport) {
                    port.device = None;
                    port.regs.portsc &=
                        !(PORTSC_CSC | PORTSC_CCS | PORTSC_PED | PORTSC_PP | PORTSC_SPEED_MASK);
                }
            }
        }
        self.worker_signal = true;
    }

    /// One worker pass over the suspend cache: pick an END entry, drop it,
    /// and if the device has reappeared return the virtual port to
    /// re-announce to the guest.
    pub fn vbdp_service_one(&mut self) -> Option<u8> {
        let idx = self.vbdp.iter().position(|e| e.state == VbdpState::End)?;
        let entry = self.vbdp.swap_remove(idx);
        let reconnected = self
            .native
            .iter()
            .any(|n| n.path == entry.path && n.state == VportState::Connected);
        if reconnected {
            debug!("xhci: re-announcing vport {} after S3", entry.vport);
            Some(entry.vport)
        } else {
            None
        }
    }

    pub fn take_worker_signal(&mut self) -> bool {
        std::mem::take(&mut self.worker_signal)
    }

    /// Host controller reset: every port register set returns to its
    /// power-on value. Attached devices and pass-through bindings survive;
    /// their ports report a fresh connect for the guest to re-enumerate.
    pub fn controller_reset(&mut self) {
        for port in &mut self.ports {
            let device = port.device.take();
            port.reinit();
            if let Some(dev) = device {
                // Attached devices survive; their ports report connected.
                port.regs.portsc |= PORTSC_CCS
                    | PORTSC_CSC
                    | ((dev.speed().psiv() as u32) << PORTSC_SPEED_SHIFT);
                port.regs.portsc = (port.regs.portsc & !PORTSC_PLS_MASK)
                    | (PLS_POLLING << PORTSC_PLS_SHIFT);
                port.device = Some(dev);
            }
        }
    }

    fn alloc_vport(&mut self, speed: UsbSpeed) -> Result<u8, PortError> {
        let range = if speed.is_usb3() {
            self.usb3_range()
        } else {
            self.usb2_range()
        };
        for vport in range {
            let in_use = self.ports[vport as usize - 1].regs.portsc & PORTSC_CCS != 0
                || self.native.iter().any(|n| n.vport == vport)
                || self.vbdp.iter().any(|e| e.vport == vport);
            if !in_use {
                return Ok(vport);
            }
        }
        Err(PortError::NoFreePort)
    }

    fn plug(&mut self, vport: u8, speed: UsbSpeed, dev: Box<dyn UsbDeviceModel>) {
        self.plug_regs_only(vport, speed);
        if let Some(port) = self.port_mut(vport) {
            port.device = Some(dev);
        }
    }

    fn plug_regs_only(&mut self, vport: u8, speed: UsbSpeed) {
        if let Some(port) = self.port_mut(vport) {
            port.regs.portsc = PORTSC_PP
                | PORTSC_CCS
                | PORTSC_CSC
                | ((speed.psiv() as u32) << PORTSC_SPEED_SHIFT)
                | (PLS_POLLING << PORTSC_PLS_SHIFT);
        }
    }
}

fn is_child_of(child: &UsbPath, parent: &UsbPath) -> bool {
    child.bus == parent.bus
        && child.depth == parent.depth + 1
        && child.path[..parent.depth as usize] == parent.path[..parent.depth as usize]
}
