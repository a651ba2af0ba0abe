//! The hardware capability consumed by the acquisition core.
//!
//! Every digitizer back end (the vendor library behind the `caen` feature, the
//! simulator used by tests and `--simulate`) implements [`Digitizer`]. The
//! methods map one-to-one onto vendor library calls; all of them block until the
//! device answers.

use crate::dgtz::{
    AcqMode, ConnectionType, DgtzErrorCode, IoLevel, PulsePolarity, ReadMode, TriggerAction,
    TriggerPolarity,
};
use crate::DecodedEvent;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareError {
    #[error("{call} failed: {code}")]
    Call {
        call: &'static str,
        code: DgtzErrorCode,
    },
    #[error("no digitizer session is configured")]
    NotConfigured,
}

impl HardwareError {
    pub fn code(&self) -> DgtzErrorCode {
        match self {
            HardwareError::Call { code, .. } => *code,
            HardwareError::NotConfigured => DgtzErrorCode::InvalidHandle,
        }
    }
}

pub type HwResult<T> = Result<T, HardwareError>;

/// Turn a raw vendor return value into a `Result`.
pub fn check(call: &'static str, ret: i32) -> HwResult<()> {
    match DgtzErrorCode::from(ret) {
        DgtzErrorCode::Success => Ok(()),
        code => Err(HardwareError::Call { call, code }),
    }
}

/// Static description of a board, as reported after opening it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardInfo {
    pub model_name: String,
    pub model: u32,
    pub channels: u32,
    pub form_factor: u32,
    pub family_code: u32,
    pub roc_firmware: String,
    pub amc_firmware: String,
    pub serial_number: u32,
    pub adc_bits: u32,
    pub license: String,
}

pub trait Digitizer {
    fn open(
        &mut self,
        link: ConnectionType,
        link_num: u32,
        conet_node: u32,
        base_address: u32,
    ) -> HwResult<()>;
    fn close(&mut self) -> HwResult<()>;
    fn reset(&mut self) -> HwResult<()>;
    fn board_info(&mut self) -> HwResult<BoardInfo>;

    fn read_register(&mut self, address: u32) -> HwResult<u32>;
    fn write_register(&mut self, address: u32, value: u32) -> HwResult<()>;

    fn set_record_length(&mut self, samples: u32) -> HwResult<()>;
    /// Post-trigger window as a percentage of the record length.
    fn set_post_trigger_size(&mut self, percent: u32) -> HwResult<()>;
    fn set_max_events_per_transfer(&mut self, events: u32) -> HwResult<()>;
    fn set_acquisition_mode(&mut self, mode: AcqMode) -> HwResult<()>;
    fn set_io_level(&mut self, level: IoLevel) -> HwResult<()>;

    fn set_channel_dc_offset(&mut self, channel: u32, offset: u16) -> HwResult<()>;
    fn set_channel_pulse_polarity(&mut self, channel: u32, polarity: PulsePolarity)
        -> HwResult<()>;
    fn set_channel_enable_mask(&mut self, mask: u32) -> HwResult<()>;

    fn set_channel_self_trigger(&mut self, action: TriggerAction, mask: u32) -> HwResult<()>;
    fn set_trigger_polarity(&mut self, channel: u32, polarity: TriggerPolarity) -> HwResult<()>;
    fn set_channel_trigger_threshold(&mut self, channel: u32, threshold: u32) -> HwResult<()>;
    fn set_sw_trigger_mode(&mut self, action: TriggerAction) -> HwResult<()>;
    fn set_ext_trigger_input_mode(&mut self, action: TriggerAction) -> HwResult<()>;

    /// Size in bytes the device needs for one readout with the current settings.
    fn readout_buffer_size(&mut self) -> HwResult<usize>;

    fn start_acquisition(&mut self) -> HwResult<()>;
    fn stop_acquisition(&mut self) -> HwResult<()>;
    fn send_sw_trigger(&mut self) -> HwResult<()>;

    /// Move buffered events into `buffer`, returning the number of bytes written.
    fn read_data(&mut self, mode: ReadMode, buffer: &mut [u8]) -> HwResult<usize>;
    /// Count the events contained in a readout.
    fn num_events(&mut self, data: &[u8]) -> HwResult<u32>;
    /// Decode event `index` of a readout into `event`.
    fn decode_event(&mut self, data: &[u8], index: u32, event: &mut DecodedEvent)
        -> HwResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_maps_success_and_failure() {
        assert_eq!(check("CAEN_DGTZ_Reset", 0), Ok(()));
        let err = check("CAEN_DGTZ_Reset", -1).unwrap_err();
        assert_eq!(err.code(), DgtzErrorCode::CommError);
        assert_eq!(err.to_string(), "CAEN_DGTZ_Reset failed: CommError (-1)");
    }
}
