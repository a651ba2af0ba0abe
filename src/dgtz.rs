//! Vendor codes and constants of the CAEN digitizer library.
//!
//! The numeric values match `CAENDigitizerType.h`, so the same enums are handed
//! straight to the FFI layer and understood by the simulator.

use serde::Deserialize;
use std::fmt;

/// Acquisition control register; bit 6 selects the external clock.
pub const ACQ_CONTROL_REGISTER: u32 = 0x8100;
pub const EXTERNAL_CLOCK_BIT: u32 = 1 << 6;

/// Largest channel count a single board exposes through the library.
pub const MAX_CHANNELS: usize = 64;

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum DgtzErrorCode {
    Success = 0,
    CommError = -1,
    GenericError = -2,
    InvalidParam = -3,
    InvalidLinkType = -4,
    InvalidHandle = -5,
    MaxDevicesError = -6,
    BadBoardType = -7,
    BadInterruptLev = -8,
    BadEventNumber = -9,
    ReadDeviceRegisterFail = -10,
    WriteDeviceRegisterFail = -11,
    InvalidChannelNumber = -13,
    ChannelBusy = -14,
    FpioModeInvalid = -15,
    WrongAcqMode = -16,
    FunctionNotAllowed = -17,
    Timeout = -18,
    InvalidBuffer = -19,
    EventNotFound = -20,
    InvalidEvent = -21,
    OutOfMemory = -22,
    CalibrationError = -23,
    DigitizerNotFound = -24,
    DigitizerAlreadyOpen = -25,
    DigitizerNotReady = -26,
    InterruptNotConfigured = -27,
    DigitizerMemoryCorrupted = -28,
    DppFirmwareNotSupported = -29,
    InvalidLicense = -30,
    InvalidDigitizerStatus = -31,
    UnsupportedTrace = -32,
    InvalidProbe = -33,
    UnsupportedBaseAddress = -34,
    NotYetImplemented = -99,
    Unknown = 1,
}

impl From<i32> for DgtzErrorCode {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Success,
            -1 => Self::CommError,
            -2 => Self::GenericError,
            -3 => Self::InvalidParam,
            -4 => Self::InvalidLinkType,
            -5 => Self::InvalidHandle,
            -6 => Self::MaxDevicesError,
            -7 => Self::BadBoardType,
            -8 => Self::BadInterruptLev,
            -9 => Self::BadEventNumber,
            -10 => Self::ReadDeviceRegisterFail,
            -11 => Self::WriteDeviceRegisterFail,
            -13 => Self::InvalidChannelNumber,
            -14 => Self::ChannelBusy,
            -15 => Self::FpioModeInvalid,
            -16 => Self::WrongAcqMode,
            -17 => Self::FunctionNotAllowed,
            -18 => Self::Timeout,
            -19 => Self::InvalidBuffer,
            -20 => Self::EventNotFound,
            -21 => Self::InvalidEvent,
            -22 => Self::OutOfMemory,
            -23 => Self::CalibrationError,
            -24 => Self::DigitizerNotFound,
            -25 => Self::DigitizerAlreadyOpen,
            -26 => Self::DigitizerNotReady,
            -27 => Self::InterruptNotConfigured,
            -28 => Self::DigitizerMemoryCorrupted,
            -29 => Self::DppFirmwareNotSupported,
            -30 => Self::InvalidLicense,
            -31 => Self::InvalidDigitizerStatus,
            -32 => Self::UnsupportedTrace,
            -33 => Self::InvalidProbe,
            -34 => Self::UnsupportedBaseAddress,
            -99 => Self::NotYetImplemented,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for DgtzErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectionType {
    Usb = 0,
    OpticalLink = 1,
}

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AcqMode {
    SwControlled = 0,
    SInControlled = 1,
    FirstTrgControlled = 2,
}

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoLevel {
    Nim = 0,
    Ttl = 1,
}

/// What a trigger source does once it fires.
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TriggerAction {
    Disabled = 0,
    AcqOnly = 1,
    ExtOutOnly = 2,
    AcqAndExtOut = 3,
}

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadMode {
    SlaveTerminatedMblt = 0,
}

/// Input pulse polarity of a channel.
#[repr(i32)]
#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PulsePolarity {
    #[default]
    Positive = 0,
    Negative = 1,
}

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TriggerPolarity {
    Rising = 0,
    Falling = 1,
}

impl TryFrom<i64> for TriggerPolarity {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Rising),
            1 => Ok(Self::Falling),
            other => Err(other),
        }
    }
}
