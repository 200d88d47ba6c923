//! Extended-capability window: Supported Protocol capabilities for the USB2
//! and USB3 port ranges, plus the optional vendor Dual-Role-Device
//! capability.
//!
//! The window is a small dword array generated at construction; reads index
//! it directly. The only writable cells are the two DRD configuration
//! registers, whose mode changes are forwarded to a host-side role-switch
//! sink.

use std::io::Write;

use log::{debug, warn};

use super::regs::{
    EXT_CAP_ID_DRD, EXT_CAP_ID_SUPPORTED_PROTOCOL, PROTOCOL_NAME_USB, PSIV_FULL_SPEED,
    PSIV_HIGH_SPEED, PSIV_LOW_SPEED, PSIV_SUPER_SPEED, USB_REVISION_2_0, USB_REVISION_3_0,
};

/// Which capability list the controller presents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
pub enum ExtCapProfile {
    /// USB2 + USB3 Supported Protocol capabilities.
    #[default]
    Default,
    /// Default profile plus the vendor Dual-Role-Device capability.
    DualRole,
}

/// Host-side sink receiving role-switch requests from DRD register writes.
pub type RoleSwitchSink = Box<dyn Write + Send>;

fn psi_dword(psiv: u8, psie: u8, mantissa: u32) -> u32 {
    (psiv as u32) | ((psie as u32) << 4) | (mantissa << 16)
}

struct Drd {
    cfg0_idx: usize,
    cfg1_idx: usize,
    sink: Option<RoleSwitchSink>,
}

pub struct ExtCaps {
    dwords: Vec<u32>,
    drd: Option<Drd>,
}

impl ExtCaps {
    /// Build the window. `usb3_ports`/`usb2_ports` are `(offset, count)`
    /// pairs of 1-based compatible port ranges.
    pub fn new(
        profile: ExtCapProfile,
        usb3_ports: (u8, u8),
        usb2_ports: (u8, u8),
        sink: Option<RoleSwitchSink>,
    ) -> Self {
        let mut dwords = Vec::new();
        let mut fixups: Vec<usize> = Vec::new();

        // USB2 Supported Protocol: LS + FS + HS speed descriptors.
        if usb2_ports.1 > 0 {
            fixups.push(dwords.len());
            dwords.push(
                (EXT_CAP_ID_SUPPORTED_PROTOCOL as u32) | ((USB_REVISION_2_0 as u32) << 16),
            );
            dwords.push(PROTOCOL_NAME_USB);
            dwords.push((usb2_ports.0 as u32) | ((usb2_ports.1 as u32) << 8));
            dwords.push(3 | (4 << 16));
            dwords.push(psi_dword(PSIV_FULL_SPEED, 2, 12)); // 12 Mb/s
            dwords.push(psi_dword(PSIV_LOW_SPEED, 1, 1500)); // 1500 Kb/s
            dwords.push(psi_dword(PSIV_HIGH_SPEED, 2, 480)); // 480 Mb/s
        }

        // USB3 Supported Protocol: one SuperSpeed descriptor.
        if usb3_ports.1 > 0 {
            fixups.push(dwords.len());
            dwords.push(
                (EXT_CAP_ID_SUPPORTED_PROTOCOL as u32) | ((USB_REVISION_3_0 as u32) << 16),
            );
            dwords.push(PROTOCOL_NAME_USB);
            dwords.push((usb3_ports.0 as u32) | ((usb3_ports.1 as u32) << 8));
            dwords.push(1 | (4 << 16));
            dwords.push(psi_dword(PSIV_SUPER_SPEED, 3, 5)); // 5 Gb/s
        }

        let mut drd = None;
        if profile == ExtCapProfile::DualRole {
            fixups.push(dwords.len());
            dwords.push(EXT_CAP_ID_DRD as u32);
            let cfg0_idx = dwords.len();
            dwords.push(0);
            let cfg1_idx = dwords.len();
            dwords.push(0);
            drd = Some(Drd {
                cfg0_idx,
                cfg1_idx,
                sink,
            });
        }

        // Chain the capability headers: the next-pointer field (bits 15:8)
        // is the dword distance to the following capability.
        for pair in fixups.windows(2) {
            let (this, next) = (pair[0], pair[1]);
            dwords[this] |= (((next - this) as u32) & 0xff) << 8;
        }

        Self { dwords, drd }
    }

    /// Size of the populated window in bytes.
    pub fn len_bytes(&self) -> u64 {
        (self.dwords.len() * 4) as u64
    }

    /// Dword-aligned read; offsets beyond the populated window read zero.
    pub fn read(&self, offset: u64) -> u32 {
        let idx = (offset / 4) as usize;
        self.dwords.get(idx).copied().unwrap_or(0)
    }

    /// Only the DRD configuration registers accept writes; everything else
    /// in the window is read-only.
    pub fn write(&mut self, offset: u64, value: u32) {
        let idx = (offset / 4) as usize;
        let Some(drd) = self.drd.as_mut() else {
            warn!("xhci: write to read-only extended capability at {offset:#x}");
            return;
        };
        if idx != drd.cfg0_idx && idx != drd.cfg1_idx {
            warn!("xhci: write to read-only extended capability at {offset:#x}");
            return;
        }
        let old = self.dwords[idx];
        self.dwords[idx] = value;
        if idx == drd.cfg0_idx && old != value {
            // Bit 0 selects the role; tell the host side so it can flip the
            // mux.
            let role: &[u8] = if value & 1 != 0 { b"device\n" } else { b"host\n" };
            debug!("xhci: DRD role switch, drdcfg0 {old:#x} -> {value:#x}");
            if let Some(sink) = drd.sink.as_mut() {
                if let Err(err) = sink.write_all(role).and_then(|_| sink.flush()) {
                    warn!("xhci: role-switch sink write failed: {err}");
                }
            }
        }
    }

    pub fn drdcfg(&self) -> Option<(u32, u32)> {
        self.drd
            .as_ref()
            .map(|d| (self.dwords[d.cfg0_idx], self.dwords[d.cfg1_idx]))
    }
}
