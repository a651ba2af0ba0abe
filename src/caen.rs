//! [`Digitizer`] on top of the vendor `CAENDigitizer` library.
//!
//! Only built with the `caen` feature; the library and its headers must be
//! installed where the linker finds them.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use crate::dgtz::{
    AcqMode, ConnectionType, DgtzErrorCode, IoLevel, PulsePolarity, ReadMode, TriggerAction,
    TriggerPolarity, MAX_CHANNELS,
};
use crate::hardware::check;
use crate::{BoardInfo, DecodedEvent, Digitizer, HardwareError, HwResult};
use libc::{c_char, c_int, c_void};
use log::debug;
use std::ptr;

const MAX_LICENSE_LENGTH: usize = 17;

#[repr(C)]
struct CAEN_DGTZ_BoardInfo_t {
    ModelName: [c_char; 12],
    Model: u32,
    Channels: u32,
    FormFactor: u32,
    FamilyCode: u32,
    ROC_FirmwareRel: [c_char; 20],
    AMC_FirmwareRel: [c_char; 40],
    SerialNumber: u32,
    MezzanineSerNum: [[c_char; 8]; 4],
    PCB_Revision: u32,
    ADC_NBits: u32,
    SAMCorrectionDataLoaded: u32,
    CommHandle: c_int,
    VMEHandle: c_int,
    License: [c_char; MAX_LICENSE_LENGTH],
}

#[repr(C)]
#[derive(Default)]
struct CAEN_DGTZ_EventInfo_t {
    EventSize: u32,
    BoardId: u32,
    Pattern: u32,
    ChannelMask: u32,
    EventCounter: u32,
    TriggerTimeTag: u32,
}

#[repr(C)]
struct CAEN_DGTZ_UINT16_EVENT_t {
    ChSize: [u32; MAX_CHANNELS],
    DataChannel: [*mut u16; MAX_CHANNELS],
}

#[link(name = "CAENDigitizer")]
extern "C" {
    fn CAEN_DGTZ_OpenDigitizer(
        link_type: c_int,
        link_num: c_int,
        conet_node: c_int,
        vme_base_address: u32,
        handle: *mut c_int,
    ) -> c_int;
    fn CAEN_DGTZ_CloseDigitizer(handle: c_int) -> c_int;
    fn CAEN_DGTZ_Reset(handle: c_int) -> c_int;
    fn CAEN_DGTZ_GetInfo(handle: c_int, info: *mut CAEN_DGTZ_BoardInfo_t) -> c_int;
    fn CAEN_DGTZ_ReadRegister(handle: c_int, address: u32, data: *mut u32) -> c_int;
    fn CAEN_DGTZ_WriteRegister(handle: c_int, address: u32, data: u32) -> c_int;
    fn CAEN_DGTZ_SetRecordLength(handle: c_int, size: u32) -> c_int;
    fn CAEN_DGTZ_SetPostTriggerSize(handle: c_int, percent: u32) -> c_int;
    fn CAEN_DGTZ_SetMaxNumEventsBLT(handle: c_int, num_events: u32) -> c_int;
    fn CAEN_DGTZ_SetAcquisitionMode(handle: c_int, mode: c_int) -> c_int;
    fn CAEN_DGTZ_SetIOLevel(handle: c_int, level: c_int) -> c_int;
    fn CAEN_DGTZ_SetChannelDCOffset(handle: c_int, channel: u32, value: u32) -> c_int;
    fn CAEN_DGTZ_SetChannelPulsePolarity(handle: c_int, channel: u32, polarity: c_int) -> c_int;
    fn CAEN_DGTZ_SetChannelEnableMask(handle: c_int, mask: u32) -> c_int;
    fn CAEN_DGTZ_SetChannelSelfTrigger(handle: c_int, mode: c_int, channel_mask: u32) -> c_int;
    fn CAEN_DGTZ_SetTriggerPolarity(handle: c_int, channel: u32, polarity: c_int) -> c_int;
    fn CAEN_DGTZ_SetChannelTriggerThreshold(handle: c_int, channel: u32, value: u32) -> c_int;
    fn CAEN_DGTZ_SetSWTriggerMode(handle: c_int, mode: c_int) -> c_int;
    fn CAEN_DGTZ_SetExtTriggerInputMode(handle: c_int, mode: c_int) -> c_int;
    fn CAEN_DGTZ_MallocReadoutBuffer(
        handle: c_int,
        buffer: *mut *mut c_char,
        size: *mut u32,
    ) -> c_int;
    fn CAEN_DGTZ_FreeReadoutBuffer(buffer: *mut *mut c_char) -> c_int;
    fn CAEN_DGTZ_SWStartAcquisition(handle: c_int) -> c_int;
    fn CAEN_DGTZ_SWStopAcquisition(handle: c_int) -> c_int;
    fn CAEN_DGTZ_SendSWtrigger(handle: c_int) -> c_int;
    fn CAEN_DGTZ_ReadData(
        handle: c_int,
        mode: c_int,
        buffer: *mut c_char,
        buffer_size: *mut u32,
    ) -> c_int;
    fn CAEN_DGTZ_GetNumEvents(
        handle: c_int,
        buffer: *mut c_char,
        buffer_size: u32,
        num_events: *mut u32,
    ) -> c_int;
    fn CAEN_DGTZ_GetEventInfo(
        handle: c_int,
        buffer: *mut c_char,
        buffer_size: u32,
        num_event: i32,
        event_info: *mut CAEN_DGTZ_EventInfo_t,
        event_ptr: *mut *mut c_char,
    ) -> c_int;
    fn CAEN_DGTZ_DecodeEvent(handle: c_int, event_ptr: *mut c_char, event: *mut *mut c_void)
        -> c_int;
    fn CAEN_DGTZ_AllocateEvent(handle: c_int, event: *mut *mut c_void) -> c_int;
    fn CAEN_DGTZ_FreeEvent(handle: c_int, event: *mut *mut c_void) -> c_int;
}

fn c_string(raw: &[c_char]) -> String {
    let bytes: Vec<u8> = raw.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

fn buffer_len(call: &'static str, len: usize) -> HwResult<u32> {
    u32::try_from(len).map_err(|_| HardwareError::Call {
        call,
        code: DgtzErrorCode::InvalidBuffer,
    })
}

/// A board reached through the vendor library.
#[derive(Debug, Default)]
pub struct CaenDigitizer {
    handle: Option<c_int>,
    /// Library-owned decode target, allocated on first use.
    event: Option<*mut c_void>,
}

impl CaenDigitizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, call: &'static str) -> HwResult<c_int> {
        self.handle.ok_or(HardwareError::Call {
            call,
            code: DgtzErrorCode::InvalidHandle,
        })
    }

    fn free_event(&mut self, handle: c_int) {
        if let Some(mut event) = self.event.take() {
            let res = unsafe { CAEN_DGTZ_FreeEvent(handle, &mut event) };
            if let Err(e) = check("CAEN_DGTZ_FreeEvent", res) {
                debug!("{}", e);
            }
        }
    }

    fn decode_target(&mut self, handle: c_int) -> HwResult<*mut c_void> {
        if let Some(event) = self.event {
            return Ok(event);
        }
        let mut event: *mut c_void = ptr::null_mut();
        let res = unsafe { CAEN_DGTZ_AllocateEvent(handle, &mut event) };
        check("CAEN_DGTZ_AllocateEvent", res)?;
        self.event = Some(event);
        Ok(event)
    }
}

impl Drop for CaenDigitizer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.free_event(handle);
            unsafe {
                CAEN_DGTZ_CloseDigitizer(handle);
            }
        }
    }
}

impl Digitizer for CaenDigitizer {
    fn open(
        &mut self,
        link: ConnectionType,
        link_num: u32,
        conet_node: u32,
        base_address: u32,
    ) -> HwResult<()> {
        if self.handle.is_some() {
            return Err(HardwareError::Call {
                call: "CAEN_DGTZ_OpenDigitizer",
                code: DgtzErrorCode::DigitizerAlreadyOpen,
            });
        }
        let mut handle: c_int = 0;
        let res = unsafe {
            CAEN_DGTZ_OpenDigitizer(
                link as c_int,
                link_num as c_int,
                conet_node as c_int,
                base_address,
                &mut handle,
            )
        };
        check("CAEN_DGTZ_OpenDigitizer", res)?;
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_CloseDigitizer")?;
        self.free_event(handle);
        self.handle = None;
        let res = unsafe { CAEN_DGTZ_CloseDigitizer(handle) };
        check("CAEN_DGTZ_CloseDigitizer", res)
    }

    fn reset(&mut self) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_Reset")?;
        check("CAEN_DGTZ_Reset", unsafe { CAEN_DGTZ_Reset(handle) })
    }

    fn board_info(&mut self) -> HwResult<BoardInfo> {
        let handle = self.handle("CAEN_DGTZ_GetInfo")?;
        let mut info = std::mem::MaybeUninit::<CAEN_DGTZ_BoardInfo_t>::zeroed();
        let res = unsafe { CAEN_DGTZ_GetInfo(handle, info.as_mut_ptr()) };
        check("CAEN_DGTZ_GetInfo", res)?;
        let info = unsafe { info.assume_init() };
        Ok(BoardInfo {
            model_name: c_string(&info.ModelName),
            model: info.Model,
            channels: info.Channels,
            form_factor: info.FormFactor,
            family_code: info.FamilyCode,
            roc_firmware: c_string(&info.ROC_FirmwareRel),
            amc_firmware: c_string(&info.AMC_FirmwareRel),
            serial_number: info.SerialNumber,
            adc_bits: info.ADC_NBits,
            license: c_string(&info.License),
        })
    }

    fn read_register(&mut self, address: u32) -> HwResult<u32> {
        let handle = self.handle("CAEN_DGTZ_ReadRegister")?;
        let mut value = 0u32;
        let res = unsafe { CAEN_DGTZ_ReadRegister(handle, address, &mut value) };
        check("CAEN_DGTZ_ReadRegister", res)?;
        Ok(value)
    }

    fn write_register(&mut self, address: u32, value: u32) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_WriteRegister")?;
        let res = unsafe { CAEN_DGTZ_WriteRegister(handle, address, value) };
        check("CAEN_DGTZ_WriteRegister", res)
    }

    fn set_record_length(&mut self, samples: u32) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetRecordLength")?;
        let res = unsafe { CAEN_DGTZ_SetRecordLength(handle, samples) };
        check("CAEN_DGTZ_SetRecordLength", res)
    }

    fn set_post_trigger_size(&mut self, percent: u32) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetPostTriggerSize")?;
        let res = unsafe { CAEN_DGTZ_SetPostTriggerSize(handle, percent) };
        check("CAEN_DGTZ_SetPostTriggerSize", res)
    }

    fn set_max_events_per_transfer(&mut self, events: u32) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetMaxNumEventsBLT")?;
        let res = unsafe { CAEN_DGTZ_SetMaxNumEventsBLT(handle, events) };
        check("CAEN_DGTZ_SetMaxNumEventsBLT", res)
    }

    fn set_acquisition_mode(&mut self, mode: AcqMode) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetAcquisitionMode")?;
        let res = unsafe { CAEN_DGTZ_SetAcquisitionMode(handle, mode as c_int) };
        check("CAEN_DGTZ_SetAcquisitionMode", res)
    }

    fn set_io_level(&mut self, level: IoLevel) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetIOLevel")?;
        let res = unsafe { CAEN_DGTZ_SetIOLevel(handle, level as c_int) };
        check("CAEN_DGTZ_SetIOLevel", res)
    }

    fn set_channel_dc_offset(&mut self, channel: u32, offset: u16) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetChannelDCOffset")?;
        let res = unsafe { CAEN_DGTZ_SetChannelDCOffset(handle, channel, offset as u32) };
        check("CAEN_DGTZ_SetChannelDCOffset", res)
    }

    fn set_channel_pulse_polarity(
        &mut self,
        channel: u32,
        polarity: PulsePolarity,
    ) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetChannelPulsePolarity")?;
        let res =
            unsafe { CAEN_DGTZ_SetChannelPulsePolarity(handle, channel, polarity as c_int) };
        check("CAEN_DGTZ_SetChannelPulsePolarity", res)
    }

    fn set_channel_enable_mask(&mut self, mask: u32) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetChannelEnableMask")?;
        let res = unsafe { CAEN_DGTZ_SetChannelEnableMask(handle, mask) };
        check("CAEN_DGTZ_SetChannelEnableMask", res)
    }

    fn set_channel_self_trigger(&mut self, action: TriggerAction, mask: u32) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetChannelSelfTrigger")?;
        let res = unsafe { CAEN_DGTZ_SetChannelSelfTrigger(handle, action as c_int, mask) };
        check("CAEN_DGTZ_SetChannelSelfTrigger", res)
    }

    fn set_trigger_polarity(&mut self, channel: u32, polarity: TriggerPolarity) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetTriggerPolarity")?;
        let res = unsafe { CAEN_DGTZ_SetTriggerPolarity(handle, channel, polarity as c_int) };
        check("CAEN_DGTZ_SetTriggerPolarity", res)
    }

    fn set_channel_trigger_threshold(&mut self, channel: u32, threshold: u32) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetChannelTriggerThreshold")?;
        let res = unsafe { CAEN_DGTZ_SetChannelTriggerThreshold(handle, channel, threshold) };
        check("CAEN_DGTZ_SetChannelTriggerThreshold", res)
    }

    fn set_sw_trigger_mode(&mut self, action: TriggerAction) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetSWTriggerMode")?;
        let res = unsafe { CAEN_DGTZ_SetSWTriggerMode(handle, action as c_int) };
        check("CAEN_DGTZ_SetSWTriggerMode", res)
    }

    fn set_ext_trigger_input_mode(&mut self, action: TriggerAction) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SetExtTriggerInputMode")?;
        let res = unsafe { CAEN_DGTZ_SetExtTriggerInputMode(handle, action as c_int) };
        check("CAEN_DGTZ_SetExtTriggerInputMode", res)
    }

    /// Asks the library for a readout buffer to learn its size, then frees it.
    fn readout_buffer_size(&mut self) -> HwResult<usize> {
        let handle = self.handle("CAEN_DGTZ_MallocReadoutBuffer")?;
        let mut buffer: *mut c_char = ptr::null_mut();
        let mut size = 0u32;
        let res = unsafe { CAEN_DGTZ_MallocReadoutBuffer(handle, &mut buffer, &mut size) };
        check("CAEN_DGTZ_MallocReadoutBuffer", res)?;
        let res = unsafe { CAEN_DGTZ_FreeReadoutBuffer(&mut buffer) };
        check("CAEN_DGTZ_FreeReadoutBuffer", res)?;
        Ok(size as usize)
    }

    fn start_acquisition(&mut self) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SWStartAcquisition")?;
        let res = unsafe { CAEN_DGTZ_SWStartAcquisition(handle) };
        check("CAEN_DGTZ_SWStartAcquisition", res)
    }

    fn stop_acquisition(&mut self) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SWStopAcquisition")?;
        let res = unsafe { CAEN_DGTZ_SWStopAcquisition(handle) };
        check("CAEN_DGTZ_SWStopAcquisition", res)
    }

    fn send_sw_trigger(&mut self) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_SendSWtrigger")?;
        let res = unsafe { CAEN_DGTZ_SendSWtrigger(handle) };
        check("CAEN_DGTZ_SendSWtrigger", res)
    }

    fn read_data(&mut self, mode: ReadMode, buffer: &mut [u8]) -> HwResult<usize> {
        let handle = self.handle("CAEN_DGTZ_ReadData")?;
        let mut size = 0u32;
        let res = unsafe {
            CAEN_DGTZ_ReadData(
                handle,
                mode as c_int,
                buffer.as_mut_ptr() as *mut c_char,
                &mut size,
            )
        };
        check("CAEN_DGTZ_ReadData", res)?;
        Ok((size as usize).min(buffer.len()))
    }

    fn num_events(&mut self, data: &[u8]) -> HwResult<u32> {
        let handle = self.handle("CAEN_DGTZ_GetNumEvents")?;
        let len = buffer_len("CAEN_DGTZ_GetNumEvents", data.len())?;
        let mut n = 0u32;
        // the library takes a mutable pointer but only reads the buffer
        let res = unsafe {
            CAEN_DGTZ_GetNumEvents(handle, data.as_ptr() as *mut c_char, len, &mut n)
        };
        check("CAEN_DGTZ_GetNumEvents", res)?;
        Ok(n)
    }

    fn decode_event(
        &mut self,
        data: &[u8],
        index: u32,
        event: &mut DecodedEvent,
    ) -> HwResult<()> {
        let handle = self.handle("CAEN_DGTZ_GetEventInfo")?;
        let len = buffer_len("CAEN_DGTZ_GetEventInfo", data.len())?;
        let mut info = CAEN_DGTZ_EventInfo_t::default();
        let mut event_ptr: *mut c_char = ptr::null_mut();
        let res = unsafe {
            CAEN_DGTZ_GetEventInfo(
                handle,
                data.as_ptr() as *mut c_char,
                len,
                index as i32,
                &mut info,
                &mut event_ptr,
            )
        };
        check("CAEN_DGTZ_GetEventInfo", res)?;

        let mut target = self.decode_target(handle)?;
        let res = unsafe { CAEN_DGTZ_DecodeEvent(handle, event_ptr, &mut target) };
        check("CAEN_DGTZ_DecodeEvent", res)?;

        event.event_counter = info.EventCounter;
        event.trigger_time_tag = info.TriggerTimeTag;
        event.board_id = info.BoardId;

        let decoded = unsafe { &*(target as *const CAEN_DGTZ_UINT16_EVENT_t) };
        for ch in 0..MAX_CHANNELS {
            if info.ChannelMask & (1u32.checked_shl(ch as u32).unwrap_or(0)) == 0 {
                continue;
            }
            let n = decoded.ChSize[ch] as usize;
            let src = decoded.DataChannel[ch];
            if n == 0 || src.is_null() {
                return Err(HardwareError::Call {
                    call: "CAEN_DGTZ_DecodeEvent",
                    code: DgtzErrorCode::InvalidEvent,
                });
            }
            let samples = unsafe { std::slice::from_raw_parts(src, n) };
            let row = event
                .waveform_mut(ch as u32, n)
                .ok_or(HardwareError::Call {
                    call: "CAEN_DGTZ_DecodeEvent",
                    code: DgtzErrorCode::InvalidChannelNumber,
                })?;
            row.copy_from_slice(samples);
        }
        Ok(())
    }
}
