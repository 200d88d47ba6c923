//! User-space xHCI (USB 3.0) host-controller device model.
//!
//! The crate models a standards-conformant xHCI controller that a VMM can
//! expose to a guest behind a PCI shim. The guest-facing surface is the MMIO
//! register file plus DMA into guest memory; the host-facing surface is a
//! narrow device-backend trait ([`UsbDeviceModel`]), a hot-plug callback
//! surface and an interrupt hook ([`IrqPin`]).
//!
//! [`xhci::XhciController`] is a plain state machine: every entry point takes
//! `&mut self` plus a [`MemoryBus`] and never blocks. [`xhci::XhciDevice`]
//! wraps a controller in the device-wide lock and owns the S3/hot-plug worker
//! thread for embedding in a multi-threaded VMM.

pub mod xhci;

use std::time::Instant;

/// Bound on the USB topology depth used to identify a physical device.
pub const USB_MAX_TIERS: usize = 7;

/// Guest physical memory access for ring and context DMA.
///
/// This is the crate's address-space gateway: the hosting VMM supplies the
/// GPA-to-host translation behind these two methods. Implementations may
/// assume each call stays within one 4 KiB guest page; the core chunks every
/// larger access (see [`dma_read`] / [`dma_write`]).
pub trait MemoryBus {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]);
    fn write_physical(&mut self, paddr: u64, buf: &[u8]);

    fn read_u32(&mut self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_physical(paddr, &value.to_le_bytes());
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_physical(paddr, &value.to_le_bytes());
    }
}

const PAGE_SIZE: u64 = 4096;

/// Read `buf.len()` bytes from guest memory, splitting the access at 4 KiB
/// page boundaries so no single gateway call crosses a translation window.
pub(crate) fn dma_read(mem: &mut dyn MemoryBus, mut paddr: u64, mut buf: &mut [u8]) {
    while !buf.is_empty() {
        let window = (PAGE_SIZE - (paddr % PAGE_SIZE)) as usize;
        let chunk = window.min(buf.len());
        let (head, tail) = buf.split_at_mut(chunk);
        mem.read_physical(paddr, head);
        paddr += chunk as u64;
        buf = tail;
    }
}

/// Write `buf` to guest memory with the same per-page splitting as
/// [`dma_read`].
pub(crate) fn dma_write(mem: &mut dyn MemoryBus, mut paddr: u64, mut buf: &[u8]) {
    while !buf.is_empty() {
        let window = (PAGE_SIZE - (paddr % PAGE_SIZE)) as usize;
        let chunk = window.min(buf.len());
        mem.write_physical(paddr, &buf[..chunk]);
        paddr += chunk as u64;
        buf = &buf[chunk..];
    }
}

/// The 8-byte USB device request that starts every control transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.bm_request_type;
        bytes[1] = self.b_request;
        bytes[2..4].copy_from_slice(&self.w_value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.w_index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.w_length.to_le_bytes());
        bytes
    }

    pub fn is_device_to_host(&self) -> bool {
        self.bm_request_type & 0x80 != 0
    }
}

/// USB bus speed of an attached device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
}

impl UsbSpeed {
    /// Protocol Speed ID as reported in PORTSC.PS and the slot context.
    pub fn psiv(self) -> u8 {
        match self {
            UsbSpeed::Full => 1,
            UsbSpeed::Low => 2,
            UsbSpeed::High => 3,
            UsbSpeed::Super => 4,
        }
    }

    pub fn is_usb3(self) -> bool {
        matches!(self, UsbSpeed::Super)
    }
}

/// Transfer direction for non-control endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// Status a device backend reports for a submitted transfer.
///
/// `Nak` means the backend did not consume the transfer: either no data is
/// available yet (emulated interrupt endpoints) or host-side I/O is still in
/// flight (port-mapped backends). The transfer stays pending on the endpoint
/// and is re-submitted on the next doorbell or notify.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum XferStatus {
    #[default]
    Success,
    ShortXfer,
    Stall,
    Timeout,
    IoError,
    BadBufSize,
    Nak,
}

/// How a backend is realized on the host side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbDeviceKind {
    /// Fully emulated in-process; completions are always synchronous.
    Emulated,
    /// Bridges to a physical USB device; completions may arrive later via
    /// the notify callback.
    PortMapped,
}

/// Identity of a physical USB device on the host: bus number plus the port
/// path from the root hub down. This tuple is stable across re-enumeration
/// and is what the pass-through whitelist and the S3 suspend cache key on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize)]
pub struct UsbPath {
    pub bus: u8,
    pub depth: u8,
    pub path: [u8; USB_MAX_TIERS],
}

impl UsbPath {
    pub fn new(bus: u8, ports: &[u8]) -> Self {
        let mut path = [0u8; USB_MAX_TIERS];
        let depth = ports.len().min(USB_MAX_TIERS);
        path[..depth].copy_from_slice(&ports[..depth]);
        Self {
            bus,
            depth: depth as u8,
            path,
        }
    }

    /// The path of a device behind port `port` of the hub at `self`, or
    /// `None` once the tier bound is exceeded.
    pub fn child(&self, port: u8) -> Option<UsbPath> {
        let depth = self.depth as usize;
        if depth >= USB_MAX_TIERS {
            return None;
        }
        let mut path = self.path;
        path[depth] = port;
        Some(UsbPath {
            bus: self.bus,
            depth: self.depth + 1,
            path,
        })
    }
}

/// What kind of physical device a hot-plug arrival describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceClass {
    Standard,
    /// External hubs are not emulated; their downstream paths are whitelisted
    /// so leaf devices behind them can attach.
    ExternalHub { ports: u8 },
}

/// Hot-plug arrival descriptor handed to the port manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: UsbPath,
    pub speed: UsbSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: DeviceClass,
}

/// The narrow interface between the transfer engine and a USB device backend.
///
/// Construction and teardown are `new`/`Drop`; the hooks here mirror the
/// runtime entry points: `reset` on port reset, `handle_request` for control
/// transfers on endpoint 1, `handle_data` for everything else, `stop` when
/// the slot is deconfigured.
pub trait UsbDeviceModel: Send {
    fn kind(&self) -> UsbDeviceKind {
        UsbDeviceKind::Emulated
    }

    fn speed(&self) -> UsbSpeed {
        UsbSpeed::Full
    }

    /// bcdUSB of the modelled device.
    fn usb_version(&self) -> u16 {
        0x0200
    }

    fn reset(&mut self) {}

    /// Control-transfer entry. The transfer carries the setup packet plus
    /// data/status stage blocks.
    fn handle_request(&mut self, xfer: &mut Transfer) -> XferStatus;

    /// Bulk/interrupt/isochronous entry. `ep` is the USB endpoint number
    /// (1..=15), direction derived from the doorbell target.
    fn handle_data(&mut self, xfer: &mut Transfer, dir: Direction, ep: u8) -> XferStatus;

    /// Called when the guest deconfigures the device. Outstanding host I/O
    /// should be abandoned; the next submission starts clean.
    fn stop(&mut self) {}
}

/// Platform interrupt hook. The PCI shim maps this onto MSI or the legacy
/// pin; the core only ever toggles the level.
pub trait IrqPin: Send + Sync {
    fn assert(&self);
    fn deassert(&self) {}
}

/// Monotonic microsecond source used to synthesize MFINDEX.
pub trait TimeSource: Send {
    fn now_micros(&mut self) -> u64;
}

/// Default [`TimeSource`] backed by [`Instant`].
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now_micros(&mut self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

pub use xhci::transfer::{Transfer, XferBlock, USB_MAX_XFER_BLOCKS};
