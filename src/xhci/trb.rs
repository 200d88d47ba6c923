//! Transfer Request Block: the 16-byte unit of communication on every ring.

use crate::MemoryBus;

pub const TRB_LEN: usize = 16;

/// TRB type field (control word bits 15:10).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TrbType {
    Reserved = 0,
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Isoch = 5,
    Link = 6,
    EventData = 7,
    NoOp = 8,
    EnableSlotCommand = 9,
    DisableSlotCommand = 10,
    AddressDeviceCommand = 11,
    ConfigureEndpointCommand = 12,
    EvaluateContextCommand = 13,
    ResetEndpointCommand = 14,
    StopEndpointCommand = 15,
    SetTrDequeuePointerCommand = 16,
    ResetDeviceCommand = 17,
    NoOpCommand = 23,
    TransferEvent = 32,
    CommandCompletionEvent = 33,
    PortStatusChangeEvent = 34,
    BandwidthRequestEvent = 35,
    DoorbellEvent = 36,
    HostControllerEvent = 37,
    DeviceNotificationEvent = 38,
    MfindexWrapEvent = 39,
    /// Catch-all for type values the model does not interpret.
    Unknown = 0xff,
}

impl TrbType {
    pub fn from_raw(raw: u8) -> TrbType {
        match raw {
            0 => TrbType::Reserved,
            1 => TrbType::Normal,
            2 => TrbType::SetupStage,
            3 => TrbType::DataStage,
            4 => TrbType::StatusStage,
            5 => TrbType::Isoch,
            6 => TrbType::Link,
            7 => TrbType::EventData,
            8 => TrbType::NoOp,
            9 => TrbType::EnableSlotCommand,
            10 => TrbType::DisableSlotCommand,
            11 => TrbType::AddressDeviceCommand,
            12 => TrbType::ConfigureEndpointCommand,
            13 => TrbType::EvaluateContextCommand,
            14 => TrbType::ResetEndpointCommand,
            15 => TrbType::StopEndpointCommand,
            16 => TrbType::SetTrDequeuePointerCommand,
            17 => TrbType::ResetDeviceCommand,
            23 => TrbType::NoOpCommand,
            32 => TrbType::TransferEvent,
            33 => TrbType::CommandCompletionEvent,
            34 => TrbType::PortStatusChangeEvent,
            35 => TrbType::BandwidthRequestEvent,
            36 => TrbType::DoorbellEvent,
            37 => TrbType::HostControllerEvent,
            38 => TrbType::DeviceNotificationEvent,
            39 => TrbType::MfindexWrapEvent,
            _ => TrbType::Unknown,
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }
}

/// xHCI completion codes carried in event TRBs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionCode {
    Invalid = 0,
    Success = 1,
    DataBufferError = 2,
    BabbleDetectedError = 3,
    UsbTransactionError = 4,
    TrbError = 5,
    StallError = 6,
    ResourceError = 7,
    NoSlotsAvailableError = 9,
    SlotNotEnabledError = 11,
    EndpointNotEnabledError = 12,
    ShortPacket = 13,
    ParameterError = 17,
    ContextStateError = 19,
    EventRingFullError = 21,
    IncompatibleDeviceError = 22,
    CommandRingStopped = 24,
    CommandAborted = 25,
    Stopped = 26,
    Undefined = 33,
}

impl CompletionCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A raw TRB: 64-bit parameter, 32-bit status, 32-bit control.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Trb {
    pub parameter: u64,
    pub status: u32,
    pub control: u32,
}

impl Trb {
    pub const CONTROL_CYCLE_BIT: u32 = 1 << 0;
    /// Toggle Cycle on Link TRBs; Evaluate Next TRB elsewhere.
    pub const CONTROL_TC_BIT: u32 = 1 << 1;
    pub const CONTROL_ISP_BIT: u32 = 1 << 2;
    pub const CONTROL_CHAIN_BIT: u32 = 1 << 4;
    pub const CONTROL_IOC_BIT: u32 = 1 << 5;
    pub const CONTROL_IDT_BIT: u32 = 1 << 6;
    /// Event Data flag in Transfer Event TRBs; Block Set Address Request in
    /// Address Device commands.
    pub const CONTROL_ED_BIT: u32 = 1 << 2;
    pub const CONTROL_BSR_BIT: u32 = 1 << 9;
    /// Deconfigure flag in Configure Endpoint commands.
    pub const CONTROL_DC_BIT: u32 = 1 << 9;
    /// Direction of a Data/Status Stage TRB (1 = IN).
    pub const CONTROL_DIR_BIT: u32 = 1 << 16;

    pub const STATUS_TRANSFER_LEN_MASK: u32 = 0x1ffff;
    pub const STATUS_EVENT_LEN_MASK: u32 = 0x00ff_ffff;

    const TYPE_SHIFT: u32 = 10;
    const TYPE_MASK: u32 = 0x3f << Self::TYPE_SHIFT;

    pub fn new(parameter: u64, status: u32, control: u32) -> Self {
        Self {
            parameter,
            status,
            control,
        }
    }

    pub fn cycle(&self) -> bool {
        self.control & Self::CONTROL_CYCLE_BIT != 0
    }

    pub fn set_cycle(&mut self, cycle: bool) {
        if cycle {
            self.control |= Self::CONTROL_CYCLE_BIT;
        } else {
            self.control &= !Self::CONTROL_CYCLE_BIT;
        }
    }

    pub fn trb_type_raw(&self) -> u8 {
        ((self.control & Self::TYPE_MASK) >> Self::TYPE_SHIFT) as u8
    }

    pub fn trb_type(&self) -> TrbType {
        TrbType::from_raw(self.trb_type_raw())
    }

    pub fn set_trb_type(&mut self, ty: TrbType) {
        self.control =
            (self.control & !Self::TYPE_MASK) | ((ty.raw() as u32) << Self::TYPE_SHIFT);
    }

    pub fn link_toggle_cycle(&self) -> bool {
        self.control & Self::CONTROL_TC_BIT != 0
    }

    pub fn set_link_toggle_cycle(&mut self, tc: bool) {
        if tc {
            self.control |= Self::CONTROL_TC_BIT;
        } else {
            self.control &= !Self::CONTROL_TC_BIT;
        }
    }

    pub fn chain(&self) -> bool {
        self.control & Self::CONTROL_CHAIN_BIT != 0
    }

    pub fn ioc(&self) -> bool {
        self.control & Self::CONTROL_IOC_BIT != 0
    }

    pub fn isp(&self) -> bool {
        self.control & Self::CONTROL_ISP_BIT != 0
    }

    pub fn idt(&self) -> bool {
        self.control & Self::CONTROL_IDT_BIT != 0
    }

    /// Slot id: control word bits 31:24 (commands and events).
    pub fn slot_id(&self) -> u8 {
        (self.control >> 24) as u8
    }

    pub fn set_slot_id(&mut self, slot_id: u8) {
        self.control = (self.control & 0x00ff_ffff) | ((slot_id as u32) << 24);
    }

    /// Endpoint id (DCI): control word bits 20:16.
    pub fn endpoint_id(&self) -> u8 {
        ((self.control >> 16) & 0x1f) as u8
    }

    pub fn set_endpoint_id(&mut self, endpoint_id: u8) {
        self.control = (self.control & !(0x1f << 16)) | (((endpoint_id as u32) & 0x1f) << 16);
    }

    /// Stream id of a transfer TRB: status word bits 31:16 is the
    /// interrupter target; the doorbell carries the stream id instead. For
    /// Set TR Dequeue Pointer commands the stream id is status bits 31:16.
    pub fn stream_id(&self) -> u16 {
        (self.status >> 16) as u16
    }

    pub fn completion_code_raw(&self) -> u8 {
        (self.status >> 24) as u8
    }

    pub fn set_completion_code(&mut self, code: CompletionCode) {
        self.status = (self.status & Self::STATUS_EVENT_LEN_MASK) | ((code.as_u8() as u32) << 24);
    }

    /// The parameter with the low control bits masked off, as used for ring
    /// pointers.
    pub fn pointer(&self) -> u64 {
        self.parameter & !0xf
    }

    pub fn dword0(&self) -> u32 {
        self.parameter as u32
    }

    pub fn to_bytes(&self) -> [u8; TRB_LEN] {
        let mut bytes = [0u8; TRB_LEN];
        bytes[0..8].copy_from_slice(&self.parameter.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.status.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.control.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; TRB_LEN]) -> Self {
        Self {
            parameter: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            status: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            control: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        }
    }

    pub fn read_from(mem: &mut dyn MemoryBus, paddr: u64) -> Self {
        let mut bytes = [0u8; TRB_LEN];
        mem.read_physical(paddr, &mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn write_to(&self, mem: &mut dyn MemoryBus, paddr: u64) {
        mem.write_physical(paddr, &self.to_bytes());
    }

    /// Command Completion Event for the command TRB at `cmd_trb_addr`.
    pub fn command_completion_event(cmd_trb_addr: u64, code: CompletionCode, slot_id: u8) -> Self {
        let mut trb = Trb::new(cmd_trb_addr, 0, 0);
        trb.set_trb_type(TrbType::CommandCompletionEvent);
        trb.set_completion_code(code);
        trb.set_slot_id(slot_id);
        trb
    }

    /// Port Status Change Event for the 1-based port id.
    pub fn port_status_change_event(port_id: u8) -> Self {
        let mut trb = Trb::new((port_id as u64) << 24, 0, 0);
        trb.set_trb_type(TrbType::PortStatusChangeEvent);
        trb.set_completion_code(CompletionCode::Success);
        trb
    }

    /// Transfer Event. `residual` is the untransferred byte count of the
    /// completing TD.
    pub fn transfer_event(
        trb_addr: u64,
        residual: u32,
        code: CompletionCode,
        slot_id: u8,
        endpoint_id: u8,
    ) -> Self {
        let mut trb = Trb::new(trb_addr, residual & Self::STATUS_EVENT_LEN_MASK, 0);
        trb.set_trb_type(TrbType::TransferEvent);
        trb.set_completion_code(code);
        trb.set_slot_id(slot_id);
        trb.set_endpoint_id(endpoint_id);
        trb
    }

    /// Host Controller Event used to report controller-internal errors such
    /// as event ring overflow.
    pub fn host_controller_event(code: CompletionCode) -> Self {
        let mut trb = Trb::new(0, 0, 0);
        trb.set_trb_type(TrbType::HostControllerEvent);
        trb.set_completion_code(code);
        trb
    }
}
