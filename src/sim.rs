//! Software stand-in for a CAEN waveform digitizer.
//!
//! `SimDigitizer` keeps the state a real board would (registers, enable mask,
//! trigger sources, acquisition state), packs events into the readout buffer in
//! the standard CAEN event format and decodes them back. Every call is recorded so
//! tests can check exactly what the controller asked of the hardware, and any call
//! can be made to fail with a chosen error code.

use crate::dgtz::{
    AcqMode, ConnectionType, DgtzErrorCode, IoLevel, PulsePolarity, ReadMode, TriggerAction,
    TriggerPolarity,
};
use crate::{BoardInfo, DecodedEvent, Digitizer, HardwareError, HwResult};
use log::trace;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

const HEADER_WORDS: usize = 4;
const HEADER_TAG: u32 = 0xA;
/// Clock ticks per trigger time tag count; 8 ns at 125 MHz.
const TTAG_STEP: u32 = 1250;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Open,
    Close,
    Reset,
    BoardInfo,
    ReadRegister(u32),
    WriteRegister(u32, u32),
    SetRecordLength(u32),
    SetPostTriggerSize(u32),
    SetMaxEventsPerTransfer(u32),
    SetAcquisitionMode(AcqMode),
    SetIoLevel(IoLevel),
    SetChannelDcOffset(u32, u16),
    SetChannelPulsePolarity(u32, PulsePolarity),
    SetChannelEnableMask(u32),
    SetChannelSelfTrigger(TriggerAction, u32),
    SetTriggerPolarity(u32, TriggerPolarity),
    SetChannelTriggerThreshold(u32, u32),
    SetSwTriggerMode(TriggerAction),
    SetExtTriggerInputMode(TriggerAction),
    ReadoutBufferSize,
    StartAcquisition,
    StopAcquisition,
    SendSwTrigger,
    ReadData,
    NumEvents,
    DecodeEvent(u32),
}

/// How the simulator fills waveforms.
#[derive(Debug, Clone)]
pub enum SampleSource {
    /// Uniform noise around a baseline with an occasional negative pulse.
    Noise { baseline: u16, spread: u16 },
    /// Sample `j` of event `n` is `n + j`; handy for ordering checks.
    Ramp,
    /// Event `n` carries `patterns[n % len]` on every channel, padded with zeros.
    Pattern(Vec<Vec<u16>>),
}

impl Default for SampleSource {
    fn default() -> Self {
        SampleSource::Noise {
            baseline: 8192,
            spread: 12,
        }
    }
}

#[derive(Debug)]
pub struct SimDigitizer {
    board: BoardInfo,
    open: bool,
    running: bool,
    power_on_registers: HashMap<u32, u32>,
    registers: HashMap<u32, u32>,
    record_length: u32,
    max_events: u32,
    enable_mask: u32,
    self_trigger_mask: u32,
    thresholds: BTreeMap<u32, u32>,
    sw_trigger: TriggerAction,
    ext_trigger: TriggerAction,
    pending_triggers: u32,
    events_per_transfer: Option<u32>,
    batches: VecDeque<u32>,
    corrupt: BTreeSet<u32>,
    dropped_channels: HashMap<u32, u32>,
    failures: HashMap<&'static str, DgtzErrorCode>,
    event_counter: u32,
    trigger_time_tag: u32,
    source: SampleSource,
    rng: StdRng,
    calls: Vec<Call>,
}

impl Default for SimDigitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDigitizer {
    pub fn new() -> Self {
        Self {
            board: BoardInfo {
                model_name: "DT5730".to_string(),
                model: 5730,
                channels: 8,
                form_factor: 2,
                family_code: 11,
                roc_firmware: "04.25 - Build 1234".to_string(),
                amc_firmware: "00.03 - Build 5678".to_string(),
                serial_number: 1042,
                adc_bits: 14,
                license: "SIMULATED".to_string(),
            },
            open: false,
            running: false,
            power_on_registers: HashMap::new(),
            registers: HashMap::new(),
            record_length: 0,
            max_events: 1,
            enable_mask: 0,
            self_trigger_mask: 0,
            thresholds: BTreeMap::new(),
            sw_trigger: TriggerAction::Disabled,
            ext_trigger: TriggerAction::Disabled,
            pending_triggers: 0,
            events_per_transfer: None,
            batches: VecDeque::new(),
            corrupt: BTreeSet::new(),
            dropped_channels: HashMap::new(),
            failures: HashMap::new(),
            event_counter: 0,
            trigger_time_tag: 0,
            source: SampleSource::default(),
            rng: StdRng::seed_from_u64(0),
            calls: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: SampleSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Value a register takes at power-on and after every reset.
    pub fn with_register(mut self, address: u32, value: u32) -> Self {
        self.power_on_registers.insert(address, value);
        self.registers.insert(address, value);
        self
    }

    /// Make every readout return `events` events, regardless of triggers.
    pub fn with_events_per_transfer(mut self, events: u32) -> Self {
        self.events_per_transfer = Some(events);
        self
    }

    /// Event counts for the next readouts, consumed in order before any other rule.
    pub fn with_batches(mut self, batches: impl IntoIterator<Item = u32>) -> Self {
        self.batches.extend(batches);
        self
    }

    /// Emit the event with this counter with a broken header.
    pub fn corrupt_event(mut self, event_counter: u32) -> Self {
        self.corrupt.insert(event_counter);
        self
    }

    /// Emit the event with this counter without `channel`, although it is enabled.
    pub fn drop_channel(mut self, event_counter: u32, channel: u32) -> Self {
        *self.dropped_channels.entry(event_counter).or_default() |= 1 << channel;
        self
    }

    /// Make the named call fail with `code` from now on.
    pub fn fail_on(mut self, call: &'static str, code: DgtzErrorCode) -> Self {
        self.failures.insert(call, code);
        self
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn register(&self, address: u32) -> u32 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    pub fn enable_mask(&self) -> u32 {
        self.enable_mask
    }

    pub fn self_trigger_mask(&self) -> u32 {
        self.self_trigger_mask
    }

    pub fn thresholds(&self) -> &BTreeMap<u32, u32> {
        &self.thresholds
    }

    pub fn sw_trigger_mode(&self) -> TriggerAction {
        self.sw_trigger
    }

    pub fn ext_trigger_mode(&self) -> TriggerAction {
        self.ext_trigger
    }

    /// Log the call, then fail it if the device is closed or a failure was injected.
    fn record(&mut self, name: &'static str, call: Call) -> HwResult<()> {
        trace!("sim: {:?}", call);
        let needs_open = !matches!(call, Call::Open);
        self.calls.push(call);
        if let Some(&code) = self.failures.get(name) {
            return Err(HardwareError::Call { call: name, code });
        }
        if needs_open && !self.open {
            return Err(HardwareError::Call {
                call: name,
                code: DgtzErrorCode::InvalidHandle,
            });
        }
        Ok(())
    }

    /// Words one event occupies with the current record length and channel mask.
    fn event_words(&self) -> usize {
        self.words_for(self.enable_mask)
    }

    fn words_for(&self, mask: u32) -> usize {
        HEADER_WORDS + mask.count_ones() as usize * (self.record_length as usize).div_ceil(2)
    }

    fn events_due(&mut self) -> u32 {
        if let Some(n) = self.batches.pop_front() {
            return n;
        }
        if let Some(n) = self.events_per_transfer {
            return n;
        }
        if self.sw_trigger == TriggerAction::AcqOnly {
            return std::mem::take(&mut self.pending_triggers);
        }
        self.max_events
    }

    fn sample(&mut self, counter: u32, index: usize) -> u16 {
        match &self.source {
            SampleSource::Noise { baseline, spread } => {
                let (baseline, spread) = (*baseline, *spread);
                let low = baseline.saturating_sub(spread);
                let high = baseline.saturating_add(spread);
                let noise = self.rng.random_range(low..=high);
                // a pulse a quarter of the way into the record
                let start = self.record_length as usize / 4;
                if index >= start && index < start + 8 && counter % 3 == 0 {
                    noise.saturating_sub(1500)
                } else {
                    noise
                }
            }
            SampleSource::Ramp => (counter as usize + index) as u16,
            SampleSource::Pattern(patterns) => {
                if patterns.is_empty() {
                    return 0;
                }
                let pattern = &patterns[counter as usize % patterns.len()];
                pattern.get(index).copied().unwrap_or(0)
            }
        }
    }

    fn pack_event(&mut self, out: &mut Vec<u32>) {
        let counter = self.event_counter;
        self.event_counter = (self.event_counter + 1) & 0x00FF_FFFF;
        self.trigger_time_tag = self.trigger_time_tag.wrapping_add(TTAG_STEP) & 0x7FFF_FFFF;

        let tag = if self.corrupt.contains(&counter) {
            0
        } else {
            HEADER_TAG
        };
        let dropped = self.dropped_channels.get(&counter).copied().unwrap_or(0);
        let mask = self.enable_mask & !dropped;
        let size = self.words_for(mask) as u32;
        out.push(tag << 28 | size);
        out.push((mask & 0xFF) | (self.board.serial_number & 0x1F) << 27);
        out.push((mask >> 8 & 0xFF) << 24 | counter);
        out.push(self.trigger_time_tag);

        let n = self.record_length as usize;
        for ch in 0..32 {
            if mask & (1 << ch) == 0 {
                continue;
            }
            for j in (0..n).step_by(2) {
                let lo = self.sample(counter, j) as u32;
                let hi = if j + 1 < n {
                    self.sample(counter, j + 1) as u32
                } else {
                    0
                };
                out.push(hi << 16 | lo);
            }
        }
    }
}

fn word(data: &[u8], index: usize) -> Option<u32> {
    let bytes = data.get(index * 4..index * 4 + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Word offsets of the events in a readout.
fn event_offsets(data: &[u8]) -> Vec<usize> {
    let total = data.len() / 4;
    let mut offsets = Vec::new();
    let mut offset = 0;
    while offset + HEADER_WORDS <= total {
        let Some(header) = word(data, offset) else {
            break;
        };
        let size = (header & 0x0FFF_FFFF) as usize;
        if size < HEADER_WORDS || offset + size > total {
            break;
        }
        offsets.push(offset);
        offset += size;
    }
    offsets
}

impl Digitizer for SimDigitizer {
    fn open(
        &mut self,
        _link: ConnectionType,
        _link_num: u32,
        _conet_node: u32,
        _base_address: u32,
    ) -> HwResult<()> {
        self.record("open", Call::Open)?;
        if self.open {
            return Err(HardwareError::Call {
                call: "open",
                code: DgtzErrorCode::DigitizerAlreadyOpen,
            });
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> HwResult<()> {
        self.record("close", Call::Close)?;
        self.open = false;
        self.running = false;
        Ok(())
    }

    fn reset(&mut self) -> HwResult<()> {
        self.record("reset", Call::Reset)?;
        self.running = false;
        self.registers = self.power_on_registers.clone();
        self.record_length = 0;
        self.max_events = 1;
        self.enable_mask = 0;
        self.self_trigger_mask = 0;
        self.thresholds.clear();
        self.sw_trigger = TriggerAction::Disabled;
        self.ext_trigger = TriggerAction::Disabled;
        self.pending_triggers = 0;
        Ok(())
    }

    fn board_info(&mut self) -> HwResult<BoardInfo> {
        self.record("board_info", Call::BoardInfo)?;
        Ok(self.board.clone())
    }

    fn read_register(&mut self, address: u32) -> HwResult<u32> {
        self.record("read_register", Call::ReadRegister(address))?;
        Ok(self.register(address))
    }

    fn write_register(&mut self, address: u32, value: u32) -> HwResult<()> {
        self.record("write_register", Call::WriteRegister(address, value))?;
        self.registers.insert(address, value);
        Ok(())
    }

    fn set_record_length(&mut self, samples: u32) -> HwResult<()> {
        self.record("set_record_length", Call::SetRecordLength(samples))?;
        self.record_length = samples;
        Ok(())
    }

    fn set_post_trigger_size(&mut self, percent: u32) -> HwResult<()> {
        self.record("set_post_trigger_size", Call::SetPostTriggerSize(percent))?;
        if percent > 100 {
            return Err(HardwareError::Call {
                call: "set_post_trigger_size",
                code: DgtzErrorCode::InvalidParam,
            });
        }
        Ok(())
    }

    fn set_max_events_per_transfer(&mut self, events: u32) -> HwResult<()> {
        self.record(
            "set_max_events_per_transfer",
            Call::SetMaxEventsPerTransfer(events),
        )?;
        self.max_events = events;
        Ok(())
    }

    fn set_acquisition_mode(&mut self, mode: AcqMode) -> HwResult<()> {
        self.record("set_acquisition_mode", Call::SetAcquisitionMode(mode))
    }

    fn set_io_level(&mut self, level: IoLevel) -> HwResult<()> {
        self.record("set_io_level", Call::SetIoLevel(level))
    }

    fn set_channel_dc_offset(&mut self, channel: u32, offset: u16) -> HwResult<()> {
        self.record(
            "set_channel_dc_offset",
            Call::SetChannelDcOffset(channel, offset),
        )?;
        self.check_channel("set_channel_dc_offset", channel)
    }

    fn set_channel_pulse_polarity(
        &mut self,
        channel: u32,
        polarity: PulsePolarity,
    ) -> HwResult<()> {
        self.record(
            "set_channel_pulse_polarity",
            Call::SetChannelPulsePolarity(channel, polarity),
        )?;
        self.check_channel("set_channel_pulse_polarity", channel)
    }

    fn set_channel_enable_mask(&mut self, mask: u32) -> HwResult<()> {
        self.record("set_channel_enable_mask", Call::SetChannelEnableMask(mask))?;
        let available = 1u32
            .checked_shl(self.board.channels)
            .map_or(u32::MAX, |bit| bit - 1);
        self.enable_mask = mask & available;
        Ok(())
    }

    fn set_channel_self_trigger(&mut self, action: TriggerAction, mask: u32) -> HwResult<()> {
        self.record(
            "set_channel_self_trigger",
            Call::SetChannelSelfTrigger(action, mask),
        )?;
        self.self_trigger_mask = if action == TriggerAction::Disabled {
            0
        } else {
            mask
        };
        Ok(())
    }

    fn set_trigger_polarity(&mut self, channel: u32, polarity: TriggerPolarity) -> HwResult<()> {
        self.record(
            "set_trigger_polarity",
            Call::SetTriggerPolarity(channel, polarity),
        )?;
        self.check_channel("set_trigger_polarity", channel)
    }

    fn set_channel_trigger_threshold(&mut self, channel: u32, threshold: u32) -> HwResult<()> {
        self.record(
            "set_channel_trigger_threshold",
            Call::SetChannelTriggerThreshold(channel, threshold),
        )?;
        self.check_channel("set_channel_trigger_threshold", channel)?;
        self.thresholds.insert(channel, threshold);
        Ok(())
    }

    fn set_sw_trigger_mode(&mut self, action: TriggerAction) -> HwResult<()> {
        self.record("set_sw_trigger_mode", Call::SetSwTriggerMode(action))?;
        self.sw_trigger = action;
        Ok(())
    }

    fn set_ext_trigger_input_mode(&mut self, action: TriggerAction) -> HwResult<()> {
        self.record(
            "set_ext_trigger_input_mode",
            Call::SetExtTriggerInputMode(action),
        )?;
        self.ext_trigger = action;
        Ok(())
    }

    fn readout_buffer_size(&mut self) -> HwResult<usize> {
        self.record("readout_buffer_size", Call::ReadoutBufferSize)?;
        Ok(self.event_words() * 4 * self.max_events.max(1) as usize)
    }

    fn start_acquisition(&mut self) -> HwResult<()> {
        self.record("start_acquisition", Call::StartAcquisition)?;
        self.running = true;
        Ok(())
    }

    fn stop_acquisition(&mut self) -> HwResult<()> {
        self.record("stop_acquisition", Call::StopAcquisition)?;
        self.running = false;
        Ok(())
    }

    fn send_sw_trigger(&mut self) -> HwResult<()> {
        self.record("send_sw_trigger", Call::SendSwTrigger)?;
        if self.running && self.sw_trigger == TriggerAction::AcqOnly {
            self.pending_triggers += 1;
        }
        Ok(())
    }

    fn read_data(&mut self, _mode: ReadMode, buffer: &mut [u8]) -> HwResult<usize> {
        self.record("read_data", Call::ReadData)?;
        if !self.running {
            return Ok(0);
        }
        let event_bytes = self.event_words() * 4;
        let fits = (buffer.len() / event_bytes) as u32;
        let n = self.events_due().min(self.max_events).min(fits);

        let mut words = Vec::with_capacity(n as usize * self.event_words());
        for _ in 0..n {
            self.pack_event(&mut words);
        }
        for (chunk, w) in buffer.chunks_exact_mut(4).zip(&words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        Ok(words.len() * 4)
    }

    fn num_events(&mut self, data: &[u8]) -> HwResult<u32> {
        self.record("num_events", Call::NumEvents)?;
        Ok(event_offsets(data).len() as u32)
    }

    fn decode_event(
        &mut self,
        data: &[u8],
        index: u32,
        event: &mut DecodedEvent,
    ) -> HwResult<()> {
        self.record("decode_event", Call::DecodeEvent(index))?;
        let bad = |code| HardwareError::Call {
            call: "decode_event",
            code,
        };

        let offsets = event_offsets(data);
        let &offset = offsets
            .get(index as usize)
            .ok_or(bad(DgtzErrorCode::EventNotFound))?;
        let header = word(data, offset).ok_or(bad(DgtzErrorCode::InvalidEvent))?;
        if header >> 28 != HEADER_TAG {
            return Err(bad(DgtzErrorCode::InvalidEvent));
        }
        let size = (header & 0x0FFF_FFFF) as usize;
        let w1 = word(data, offset + 1).ok_or(bad(DgtzErrorCode::InvalidEvent))?;
        let w2 = word(data, offset + 2).ok_or(bad(DgtzErrorCode::InvalidEvent))?;
        let w3 = word(data, offset + 3).ok_or(bad(DgtzErrorCode::InvalidEvent))?;

        let mask = (w1 & 0xFF) | (w2 >> 24) << 8;
        event.board_id = w1 >> 27;
        event.event_counter = w2 & 0x00FF_FFFF;
        event.trigger_time_tag = w3;

        let n_channels = mask.count_ones() as usize;
        if n_channels == 0 {
            return Ok(());
        }
        let words_per_channel = (size - HEADER_WORDS) / n_channels;
        let n_samples = words_per_channel * 2;
        let mut next = offset + HEADER_WORDS;
        for ch in 0..16 {
            if mask & (1 << ch) == 0 {
                continue;
            }
            let samples = event
                .waveform_mut(ch, n_samples)
                .ok_or(bad(DgtzErrorCode::InvalidChannelNumber))?;
            for pair in samples.chunks_mut(2) {
                let w = word(data, next).ok_or(bad(DgtzErrorCode::InvalidEvent))?;
                next += 1;
                pair[0] = (w & 0xFFFF) as u16;
                if let Some(hi) = pair.get_mut(1) {
                    *hi = (w >> 16) as u16;
                }
            }
        }
        Ok(())
    }
}

impl SimDigitizer {
    fn check_channel(&self, call: &'static str, channel: u32) -> HwResult<()> {
        if channel < self.board.channels {
            Ok(())
        } else {
            Err(HardwareError::Call {
                call,
                code: DgtzErrorCode::InvalidChannelNumber,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed(record_length: u32, mask: u32) -> SimDigitizer {
        let mut sim = SimDigitizer::new().with_source(SampleSource::Ramp);
        sim.open(ConnectionType::Usb, 0, 0, 0).unwrap();
        sim.reset().unwrap();
        sim.set_record_length(record_length).unwrap();
        sim.set_max_events_per_transfer(4).unwrap();
        sim.set_channel_enable_mask(mask).unwrap();
        sim
    }

    #[test]
    fn readout_decodes_back_to_generated_samples() {
        let mut sim = armed(6, 0b1001).with_batches([2]);
        sim.start_acquisition().unwrap();
        let mut buffer = vec![0u8; sim.readout_buffer_size().unwrap()];
        let bytes = sim
            .read_data(ReadMode::SlaveTerminatedMblt, &mut buffer)
            .unwrap();
        assert_eq!(bytes, 2 * (4 + 2 * 3) * 4);
        assert_eq!(sim.num_events(&buffer[..bytes]).unwrap(), 2);

        let mut event = DecodedEvent::new(8, 6);
        sim.decode_event(&buffer[..bytes], 1, &mut event).unwrap();
        assert_eq!(event.event_counter, 1);
        assert_eq!(event.channels().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(event.waveform(3), Some(&[1, 2, 3, 4, 5, 6][..]));
    }

    #[test]
    fn software_triggers_drive_event_count() {
        let mut sim = armed(4, 0b1);
        sim.set_sw_trigger_mode(TriggerAction::AcqOnly).unwrap();
        sim.start_acquisition().unwrap();
        sim.send_sw_trigger().unwrap();
        sim.send_sw_trigger().unwrap();

        let mut buffer = vec![0u8; sim.readout_buffer_size().unwrap()];
        let bytes = sim
            .read_data(ReadMode::SlaveTerminatedMblt, &mut buffer)
            .unwrap();
        assert_eq!(sim.num_events(&buffer[..bytes]).unwrap(), 2);
        let bytes = sim
            .read_data(ReadMode::SlaveTerminatedMblt, &mut buffer)
            .unwrap();
        assert_eq!(bytes, 0);
    }

    #[test]
    fn calls_on_closed_device_fail() {
        let mut sim = SimDigitizer::new();
        let err = sim.reset().unwrap_err();
        assert_eq!(err.code(), DgtzErrorCode::InvalidHandle);
    }

    #[test]
    fn noise_stays_near_baseline() {
        let mut sim = SimDigitizer::new().with_seed(7);
        sim.open(ConnectionType::Usb, 0, 0, 0).unwrap();
        sim.record_length = 64;
        for j in 0..64 {
            let s = sim.sample(1, j);
            assert!((8180..=8204).contains(&s), "sample {j} = {s}");
        }
    }
}
