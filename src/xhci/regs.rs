//! Register offsets, layout constants and bit definitions for the MMIO BAR.
//!
//! The window layout is fixed at build time:
//!
//! ```text
//! [0x000, 0x020)  capability registers
//! [0x020, 0x420)  operational registers
//! [0x420, 0x560)  port register sets (20 ports x 16 bytes)
//! [0x560, 0x664)  doorbell array (slot 0 + 64 device slots)
//! [0x680, 0x6c0)  runtime registers (MFINDEX + interrupter 0)
//! [0x6c0, 0x700)  extended capabilities
//! ```

/// CAPLENGTH: operational registers start here.
pub const CAPLENGTH_VALUE: u8 = 0x20;
pub const CAPLENGTH_BYTES: u32 = CAPLENGTH_VALUE as u32;
pub const HCIVERSION_VALUE: u16 = 0x0100;

pub const MAX_SLOTS: u8 = 64;
pub const MAX_INTRS: u8 = 1;
/// Root-hub port count. The low half is USB3, the high half USB2.
pub const MAX_PORTS: u8 = 20;

pub const OP_BASE: u64 = CAPLENGTH_VALUE as u64;
pub const PORT_REGS_BASE: u64 = OP_BASE + 0x400;
pub const PORT_REGS_STRIDE: u64 = 0x10;

/// Doorbell array directly follows the port register block (dword aligned).
pub const DBOFF_VALUE: u32 = (PORT_REGS_BASE + MAX_PORTS as u64 * PORT_REGS_STRIDE) as u32;
pub const DB_COUNT: u32 = MAX_SLOTS as u32 + 1;

/// Runtime registers follow the doorbell array, 32-byte aligned.
pub const RTSOFF_VALUE: u32 = (DBOFF_VALUE + DB_COUNT * 4 + 0x1f) & !0x1f;

/// Extended capabilities follow the runtime block (MFINDEX + one
/// interrupter register set).
pub const EXT_CAPS_BASE: u64 = RTSOFF_VALUE as u64 + 0x40;
pub const EXT_CAPS_SIZE: u64 = 0x40;

pub const REGS_END: u64 = EXT_CAPS_BASE + EXT_CAPS_SIZE;

pub mod cap {
    pub const CAPLENGTH: u32 = 0x00;
    pub const HCIVERSION: u32 = 0x02;
    pub const HCSPARAMS1: u32 = 0x04;
    pub const HCSPARAMS2: u32 = 0x08;
    pub const HCSPARAMS3: u32 = 0x0c;
    pub const HCCPARAMS1: u32 = 0x10;
    pub const DBOFF: u32 = 0x14;
    pub const RTSOFF: u32 = 0x18;
    pub const HCCPARAMS2: u32 = 0x1c;
}

pub mod op {
    pub const USBCMD: u32 = 0x00;
    pub const USBSTS: u32 = 0x04;
    pub const PAGESIZE: u32 = 0x08;
    pub const DNCTRL: u32 = 0x14;
    pub const CRCR: u32 = 0x18;
    pub const DCBAAP: u32 = 0x30;
    pub const CONFIG: u32 = 0x38;

    pub const USBCMD_RUN_STOP: u32 = 1 << 0;
    pub const USBCMD_HCRST: u32 = 1 << 1;
    pub const USBCMD_INTE: u32 = 1 << 2;
    pub const USBCMD_HSEE: u32 = 1 << 3;
    /// Controller Save State: entry into guest S3.
    pub const USBCMD_CSS: u32 = 1 << 8;
    /// Controller Restore State: exit from guest S3.
    pub const USBCMD_CRS: u32 = 1 << 9;

    pub const USBSTS_HCH: u32 = 1 << 0;
    pub const USBSTS_HSE: u32 = 1 << 2;
    pub const USBSTS_EINT: u32 = 1 << 3;
    pub const USBSTS_PCD: u32 = 1 << 4;
    pub const USBSTS_SSS: u32 = 1 << 8;
    pub const USBSTS_RSS: u32 = 1 << 9;
    pub const USBSTS_SRE: u32 = 1 << 10;
    pub const USBSTS_CNR: u32 = 1 << 11;
    pub const USBSTS_HCE: u32 = 1 << 12;

    pub const CRCR_RCS: u64 = 1 << 0;
    pub const CRCR_CS: u64 = 1 << 1;
    pub const CRCR_CA: u64 = 1 << 2;
    pub const CRCR_CRR: u64 = 1 << 3;
    pub const CRCR_PTR_MASK: u64 = !0x3f;
}

pub mod runtime {
    pub const MFINDEX: u32 = 0x00;
    pub const MFINDEX_MASK: u32 = 0x3fff;
    pub const IR0: u32 = 0x20;
    pub const IR0_IMAN: u32 = IR0;
    pub const IR0_IMOD: u32 = IR0 + 0x04;
    pub const IR0_ERSTSZ: u32 = IR0 + 0x08;
    pub const IR0_ERSTBA: u32 = IR0 + 0x10;
    pub const IR0_ERDP: u32 = IR0 + 0x18;
}

pub mod port {
    use super::{PORT_REGS_BASE, PORT_REGS_STRIDE};

    /// BAR offset of PORTSC for the zero-based port index.
    pub fn portsc_offset(index: u8) -> u64 {
        PORT_REGS_BASE + u64::from(index) * PORT_REGS_STRIDE
    }
}

// Flat aliases for the most commonly used absolute offsets.
pub const REG_USBCMD: u64 = OP_BASE + op::USBCMD as u64;
pub const REG_USBSTS: u64 = OP_BASE + op::USBSTS as u64;
pub const REG_CRCR_LO: u64 = OP_BASE + op::CRCR as u64;
pub const REG_CRCR_HI: u64 = OP_BASE + op::CRCR as u64 + 4;
pub const REG_DCBAAP_LO: u64 = OP_BASE + op::DCBAAP as u64;
pub const REG_DCBAAP_HI: u64 = OP_BASE + op::DCBAAP as u64 + 4;
pub const REG_CONFIG: u64 = OP_BASE + op::CONFIG as u64;
pub const REG_MFINDEX: u64 = RTSOFF_VALUE as u64 + runtime::MFINDEX as u64;
pub const REG_INTR0_IMAN: u64 = RTSOFF_VALUE as u64 + runtime::IR0_IMAN as u64;
pub const REG_INTR0_IMOD: u64 = RTSOFF_VALUE as u64 + runtime::IR0_IMOD as u64;
pub const REG_INTR0_ERSTSZ: u64 = RTSOFF_VALUE as u64 + runtime::IR0_ERSTSZ as u64;
pub const REG_INTR0_ERSTBA_LO: u64 = RTSOFF_VALUE as u64 + runtime::IR0_ERSTBA as u64;
pub const REG_INTR0_ERSTBA_HI: u64 = RTSOFF_VALUE as u64 + runtime::IR0_ERSTBA as u64 + 4;
pub const REG_INTR0_ERDP_LO: u64 = RTSOFF_VALUE as u64 + runtime::IR0_ERDP as u64;
pub const REG_INTR0_ERDP_HI: u64 = RTSOFF_VALUE as u64 + runtime::IR0_ERDP as u64 + 4;

pub const USBCMD_RUN: u32 = op::USBCMD_RUN_STOP;
pub const USBCMD_HCRST: u32 = op::USBCMD_HCRST;
pub const USBSTS_EINT: u32 = op::USBSTS_EINT;
pub const USBSTS_HCE: u32 = op::USBSTS_HCE;
pub const USBSTS_PCD: u32 = op::USBSTS_PCD;

// HCSPARAMS1: MaxPorts | MaxIntrs | MaxSlots.
pub const HCSPARAMS1_VALUE: u32 =
    ((MAX_PORTS as u32) << 24) | ((MAX_INTRS as u32) << 8) | MAX_SLOTS as u32;
// HCSPARAMS2: ERST-MAX = 0 (single segment), IST = 4 microframes.
pub const HCSPARAMS2_VALUE: u32 = 0x4;
pub const HCSPARAMS3_VALUE: u32 = 0;

pub const HCCPARAMS1_AC64: u32 = 1 << 0;
pub const HCCPARAMS1_CSZ_64B: u32 = 1 << 2;
pub const HCCPARAMS1_NSS: u32 = 1 << 7;
pub const HCCPARAMS1_SPC: u32 = 1 << 9;
// MaxPSASize = 1: primary streams only, at most 4 stream contexts.
pub const HCCPARAMS1_MAXPSA: u32 = 1 << 12;
pub const HCCPARAMS1_VALUE: u32 = HCCPARAMS1_AC64
    | HCCPARAMS1_NSS
    | HCCPARAMS1_SPC
    | HCCPARAMS1_MAXPSA
    | (((EXT_CAPS_BASE as u32) / 4) << 16);

pub const HCCPARAMS2_U3C: u32 = 1 << 0;
pub const HCCPARAMS2_LEC: u32 = 1 << 4;
pub const HCCPARAMS2_VALUE: u32 = HCCPARAMS2_U3C | HCCPARAMS2_LEC;

// PORTSC bits.
pub const PORTSC_CCS: u32 = 1 << 0;
pub const PORTSC_PED: u32 = 1 << 1;
pub const PORTSC_OCA: u32 = 1 << 3;
pub const PORTSC_PR: u32 = 1 << 4;
pub const PORTSC_PLS_SHIFT: u32 = 5;
pub const PORTSC_PLS_MASK: u32 = 0xf << PORTSC_PLS_SHIFT;
pub const PORTSC_PP: u32 = 1 << 9;
pub const PORTSC_SPEED_SHIFT: u32 = 10;
pub const PORTSC_SPEED_MASK: u32 = 0xf << PORTSC_SPEED_SHIFT;
pub const PORTSC_PIC_MASK: u32 = 0x3 << 14;
pub const PORTSC_LWS: u32 = 1 << 16;
pub const PORTSC_CSC: u32 = 1 << 17;
pub const PORTSC_PEC: u32 = 1 << 18;
pub const PORTSC_WRC: u32 = 1 << 19;
pub const PORTSC_OCC: u32 = 1 << 20;
pub const PORTSC_PRC: u32 = 1 << 21;
pub const PORTSC_PLC: u32 = 1 << 22;
pub const PORTSC_CEC: u32 = 1 << 23;
pub const PORTSC_CAS: u32 = 1 << 24;
pub const PORTSC_WCE: u32 = 1 << 25;
pub const PORTSC_WDE: u32 = 1 << 26;
pub const PORTSC_WOE: u32 = 1 << 27;
pub const PORTSC_DR: u32 = 1 << 30;
pub const PORTSC_WPR: u32 = 1u32 << 31;

/// All write-1-to-clear change bits of PORTSC.
pub const PORTSC_CHANGE_BITS: u32 =
    PORTSC_CSC | PORTSC_PEC | PORTSC_WRC | PORTSC_OCC | PORTSC_PRC | PORTSC_PLC | PORTSC_CEC;

// Port Link State encodings.
pub const PLS_U0: u32 = 0;
pub const PLS_U3: u32 = 3;
pub const PLS_DISABLED: u32 = 4;
pub const PLS_RX_DETECT: u32 = 5;
pub const PLS_POLLING: u32 = 7;

// Protocol Speed IDs.
pub const PSIV_FULL_SPEED: u8 = 1;
pub const PSIV_LOW_SPEED: u8 = 2;
pub const PSIV_HIGH_SPEED: u8 = 3;
pub const PSIV_SUPER_SPEED: u8 = 4;

// Port Status Change Event TRB: port id lives in parameter bits 31:24.
pub const PSC_EVENT_PORT_ID_SHIFT: u32 = 24;

// Extended capability ids.
pub const EXT_CAP_ID_SUPPORTED_PROTOCOL: u8 = 2;
/// Vendor-defined Dual-Role-Device configuration capability.
pub const EXT_CAP_ID_DRD: u8 = 0xc0;

pub const USB_REVISION_2_0: u16 = 0x0200;
pub const USB_REVISION_3_0: u16 = 0x0300;
/// "USB " in the protocol name string dword.
pub const PROTOCOL_NAME_USB: u32 = 0x2042_5355;
pub const PROTOCOL_NAME_USB2: u32 = PROTOCOL_NAME_USB;
pub const PROTOCOL_NAME_USB3: u32 = PROTOCOL_NAME_USB;

