use crate::dgtz::{
    AcqMode, ConnectionType, IoLevel, ReadMode, TriggerAction, ACQ_CONTROL_REGISTER,
    EXTERNAL_CLOCK_BIT,
};
use crate::{
    digitizer_params, AcquisitionSettings, BoardInfo, DecodedEvent, Digitizer, DgtzErrorCode,
    HardwareError, HwResult, TriggerMode,
};
use log::{debug, error, info, log_enabled, warn, Level};

/// Contents of the readout buffer after one transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawBatch {
    pub event_count: u32,
    pub byte_size: usize,
}

/// State of an open, configured board. Only the controller holds one.
#[derive(Debug)]
pub struct DeviceSession {
    pub board: BoardInfo,
    pub enable_mask: u32,
    pub trigger_mode: TriggerMode,
    pub record_length: u32,
    buffer: Option<Vec<u8>>,
    batch: RawBatch,
    running: bool,
}

impl DeviceSession {
    pub fn batch(&self) -> RawBatch {
        self.batch
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }
}

/// Owns the digitizer from configuration to teardown.
///
/// The readout buffer belongs to the session and is handed to the hardware for
/// each transfer; decoded events borrow from it only through [`crate::EventStream`].
/// Dropping the controller releases the session.
pub struct DigitizerController<D: Digitizer> {
    hw: D,
    session: Option<DeviceSession>,
}

impl<D: Digitizer> DigitizerController<D> {
    pub fn new(hw: D) -> Self {
        Self { hw, session: None }
    }

    pub fn hardware(&self) -> &D {
        &self.hw
    }

    pub fn session(&self) -> Option<&DeviceSession> {
        self.session.as_ref()
    }

    pub fn is_configured(&self) -> bool {
        self.session.is_some()
    }

    pub fn buffer_allocated(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.buffer.is_some())
    }

    pub fn is_running(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.running)
    }

    pub fn trigger_mode(&self) -> Option<TriggerMode> {
        self.session.as_ref().map(|s| s.trigger_mode)
    }

    /// Open the board and program it from `settings`.
    ///
    /// Any previous session is released first. The first failing call aborts the
    /// sequence; the device is closed again before the error is returned.
    pub fn configure(&mut self, settings: &AcquisitionSettings) -> HwResult<()> {
        self.release();

        info!("Opening communication with digitizer");
        self.hw.open(ConnectionType::Usb, 0, 0, 0)?;

        match self.program(settings) {
            Ok(session) => {
                info!(
                    "Digitizer configured: mask {:#x}, {} trigger, {} byte readout buffer",
                    session.enable_mask,
                    session.trigger_mode,
                    session.buffer_len()
                );
                let n_channels = session.board.channels;
                self.session = Some(session);
                if log_enabled!(Level::Debug) {
                    digitizer_params::log_registers(&mut self.hw, n_channels);
                }
                Ok(())
            }
            Err(e) => {
                error!("Configuring digitizer failed: {}", e);
                if let Err(close_err) = self.hw.close() {
                    warn!("Closing digitizer after failed configuration: {}", close_err);
                }
                Err(e)
            }
        }
    }

    fn program(&mut self, settings: &AcquisitionSettings) -> HwResult<DeviceSession> {
        self.hw.reset()?;
        let board = self.hw.board_info()?;
        digitizer_params::log_board_info(&board);

        self.apply_clock_source(settings.use_external_clock)?;

        self.hw.set_record_length(settings.samples_per_trigger)?;
        self.hw
            .set_post_trigger_size(post_trigger_percent(settings.post_trigger_fraction))?;
        self.hw
            .set_max_events_per_transfer(settings.max_events_per_transfer)?;
        self.hw.set_acquisition_mode(AcqMode::SwControlled)?;
        // front panel inputs take TTL signals
        self.hw.set_io_level(IoLevel::Ttl)?;

        let mut mask = 0u32;
        for ch in &settings.channels {
            self.hw.set_channel_dc_offset(ch.channel, ch.dc_offset)?;
            self.hw.set_channel_pulse_polarity(ch.channel, ch.polarity)?;
            mask |= 1 << ch.channel;
        }
        self.hw.set_channel_enable_mask(mask)?;

        self.apply_trigger_mode(settings, mask)?;

        let size = self.hw.readout_buffer_size()?;
        debug!("Allocating {} byte readout buffer", size);

        Ok(DeviceSession {
            board,
            enable_mask: mask,
            trigger_mode: settings.trigger_mode,
            record_length: settings.samples_per_trigger,
            buffer: Some(vec![0u8; size]),
            batch: RawBatch::default(),
            running: false,
        })
    }

    /// Flip the clock source bit only when it differs; toggling it needlessly can
    /// upset a running acquisition.
    fn apply_clock_source(&mut self, use_external_clock: bool) -> HwResult<()> {
        let current = self.hw.read_register(ACQ_CONTROL_REGISTER)?;
        let is_external = current & EXTERNAL_CLOCK_BIT != 0;
        if is_external == use_external_clock {
            debug!(
                "Clock source already {}, leaving register {:#06x} alone",
                if is_external { "external" } else { "internal" },
                ACQ_CONTROL_REGISTER
            );
            return Ok(());
        }
        let value = if use_external_clock {
            current | EXTERNAL_CLOCK_BIT
        } else {
            current & !EXTERNAL_CLOCK_BIT
        };
        info!("Writing clock source register: {:#x} -> {:#x}", current, value);
        self.hw.write_register(ACQ_CONTROL_REGISTER, value)
    }

    fn apply_trigger_mode(&mut self, settings: &AcquisitionSettings, mask: u32) -> HwResult<()> {
        match settings.trigger_mode {
            TriggerMode::Continuous => {}
            TriggerMode::SelfTrigger => {
                self.hw
                    .set_channel_self_trigger(TriggerAction::AcqOnly, mask)?;
                for ch in &settings.channels {
                    self.hw
                        .set_trigger_polarity(ch.channel, settings.trigger_polarity)?;
                    if ch.trigger_source {
                        self.hw.set_channel_trigger_threshold(
                            ch.channel,
                            settings.trigger_threshold,
                        )?;
                    }
                }
            }
            TriggerMode::SoftwareTrigger => {
                self.hw.set_sw_trigger_mode(TriggerAction::AcqOnly)?;
            }
            TriggerMode::ExternalTrigger => {
                self.hw.set_ext_trigger_input_mode(TriggerAction::AcqOnly)?;
            }
        }
        Ok(())
    }

    pub fn start(&mut self) -> HwResult<()> {
        let session = self.session.as_mut().ok_or(HardwareError::NotConfigured)?;
        if session.running {
            return Ok(());
        }
        self.hw.start_acquisition()?;
        session.running = true;
        info!("Data acquisition started");
        Ok(())
    }

    /// Stopping a session that never started, or no session at all, does nothing.
    pub fn stop(&mut self) -> HwResult<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if !session.running {
            return Ok(());
        }
        self.hw.stop_acquisition()?;
        session.running = false;
        info!("Data acquisition stopped");
        Ok(())
    }

    /// Send a software trigger; ignored unless the session runs in software
    /// trigger mode.
    pub fn issue_software_trigger(&mut self) -> HwResult<()> {
        let session = self.session.as_ref().ok_or(HardwareError::NotConfigured)?;
        if session.trigger_mode != TriggerMode::SoftwareTrigger {
            debug!(
                "Ignoring software trigger in {} mode",
                session.trigger_mode
            );
            return Ok(());
        }
        self.hw.send_sw_trigger()
    }

    /// Read one batch into the session buffer, overwriting the previous one.
    pub fn transfer(&mut self) -> HwResult<RawBatch> {
        let session = self.session.as_mut().ok_or(HardwareError::NotConfigured)?;
        let buffer = session.buffer.as_mut().ok_or(HardwareError::NotConfigured)?;
        session.batch = RawBatch::default();

        let byte_size = self
            .hw
            .read_data(ReadMode::SlaveTerminatedMblt, buffer)?;
        let event_count = if byte_size == 0 {
            0
        } else {
            self.hw.num_events(&buffer[..byte_size])?
        };
        session.batch = RawBatch {
            event_count,
            byte_size,
        };
        Ok(session.batch)
    }

    /// Decode event `index` of the current batch into `event`.
    pub fn decode(&mut self, index: u32, event: &mut DecodedEvent) -> HwResult<()> {
        let session = self.session.as_ref().ok_or(HardwareError::NotConfigured)?;
        let buffer = session.buffer.as_ref().ok_or(HardwareError::NotConfigured)?;
        if index >= session.batch.event_count {
            return Err(HardwareError::Call {
                call: "decode_event",
                code: DgtzErrorCode::BadEventNumber,
            });
        }
        self.hw
            .decode_event(&buffer[..session.batch.byte_size], index, event)
    }

    /// Tear the session down: stop, free the buffer, close the device.
    ///
    /// Each step runs even when an earlier one failed; failures are only logged.
    /// Calling it without a session does nothing.
    pub fn release(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if session.running {
            if let Err(e) = self.hw.stop_acquisition() {
                warn!("Stopping acquisition during teardown failed: {}", e);
            }
        }
        if let Some(buffer) = session.buffer.take() {
            debug!("Freeing {} byte readout buffer", buffer.len());
        }
        match self.hw.close() {
            Ok(()) => info!("Digitizer closed"),
            Err(e) => warn!("Closing digitizer failed: {}", e),
        }
    }
}

impl<D: Digitizer> Drop for DigitizerController<D> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Post-trigger fraction as the whole percentage the hardware expects.
///
/// Rounds to the nearest percent instead of truncating: `0.29 * 100.0` is
/// `28.999999999999996` in floating point, and truncation would program 28.
/// Values outside `0.0..=1.0` are clamped.
pub fn post_trigger_percent(fraction: f64) -> u32 {
    (fraction * 100.0).round().clamp(0.0, 100.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Call;
    use crate::{ChannelSetting, PulsePolarity, SimDigitizer, TriggerPolarity};

    fn settings(mode: TriggerMode) -> AcquisitionSettings {
        AcquisitionSettings {
            sampling_rate: 250.0,
            samples_per_trigger: 32,
            post_trigger_fraction: 0.29,
            max_events_per_transfer: 10,
            trigger_mode: mode,
            trigger_polarity: TriggerPolarity::Falling,
            trigger_threshold: 8100,
            acquisition_offset: 0x1000,
            number_of_boards: 1,
            use_external_clock: false,
            channels: vec![
                ChannelSetting {
                    channel: 0,
                    dc_offset: 0x1000,
                    polarity: PulsePolarity::Positive,
                    trigger_source: true,
                },
                ChannelSetting {
                    channel: 2,
                    dc_offset: 0x2000,
                    polarity: PulsePolarity::Negative,
                    trigger_source: false,
                },
            ],
        }
    }

    fn trigger_calls(calls: &[Call]) -> Vec<Call> {
        calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::SetChannelSelfTrigger(..)
                        | Call::SetTriggerPolarity(..)
                        | Call::SetChannelTriggerThreshold(..)
                        | Call::SetSwTriggerMode(_)
                        | Call::SetExtTriggerInputMode(_)
                )
            })
            .cloned()
            .collect()
    }

    #[test]
    fn configure_programs_board_in_order() {
        let mut controller = DigitizerController::new(SimDigitizer::new());
        controller.configure(&settings(TriggerMode::Continuous)).unwrap();

        assert_eq!(
            controller.hardware().calls(),
            &[
                Call::Open,
                Call::Reset,
                Call::BoardInfo,
                Call::ReadRegister(ACQ_CONTROL_REGISTER),
                Call::SetRecordLength(32),
                Call::SetPostTriggerSize(29),
                Call::SetMaxEventsPerTransfer(10),
                Call::SetAcquisitionMode(AcqMode::SwControlled),
                Call::SetIoLevel(IoLevel::Ttl),
                Call::SetChannelDcOffset(0, 0x1000),
                Call::SetChannelPulsePolarity(0, PulsePolarity::Positive),
                Call::SetChannelDcOffset(2, 0x2000),
                Call::SetChannelPulsePolarity(2, PulsePolarity::Negative),
                Call::SetChannelEnableMask(0b101),
                Call::ReadoutBufferSize,
            ]
        );
        let session = controller.session().unwrap();
        assert_eq!(session.enable_mask, 0b101);
        assert!(session.buffer_len() > 0);
        assert!(!controller.is_running());
    }

    #[test]
    fn clock_register_untouched_when_already_matching() {
        let sim = SimDigitizer::new().with_register(ACQ_CONTROL_REGISTER, 0x0000_0040);
        let mut controller = DigitizerController::new(sim);
        let mut external = settings(TriggerMode::Continuous);
        external.use_external_clock = true;
        controller.configure(&external).unwrap();

        let writes = controller
            .hardware()
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::WriteRegister(..)))
            .count();
        assert_eq!(writes, 0);
    }

    #[test]
    fn clock_register_bit_six_is_flipped_when_different() {
        let sim = SimDigitizer::new().with_register(ACQ_CONTROL_REGISTER, 0x0000_0004);
        let mut controller = DigitizerController::new(sim);
        let mut external = settings(TriggerMode::Continuous);
        external.use_external_clock = true;
        controller.configure(&external).unwrap();
        assert!(controller
            .hardware()
            .calls()
            .contains(&Call::WriteRegister(ACQ_CONTROL_REGISTER, 0x0000_0044)));

        let sim = SimDigitizer::new().with_register(ACQ_CONTROL_REGISTER, 0x0000_0044);
        let mut controller = DigitizerController::new(sim);
        controller.configure(&settings(TriggerMode::Continuous)).unwrap();
        assert!(controller
            .hardware()
            .calls()
            .contains(&Call::WriteRegister(ACQ_CONTROL_REGISTER, 0x0000_0004)));
    }

    #[test]
    fn each_trigger_mode_runs_only_its_branch() {
        let cases = [
            (TriggerMode::Continuous, vec![]),
            (
                TriggerMode::SelfTrigger,
                vec![
                    Call::SetChannelSelfTrigger(TriggerAction::AcqOnly, 0b101),
                    Call::SetTriggerPolarity(0, TriggerPolarity::Falling),
                    Call::SetChannelTriggerThreshold(0, 8100),
                    Call::SetTriggerPolarity(2, TriggerPolarity::Falling),
                ],
            ),
            (
                TriggerMode::SoftwareTrigger,
                vec![Call::SetSwTriggerMode(TriggerAction::AcqOnly)],
            ),
            (
                TriggerMode::ExternalTrigger,
                vec![Call::SetExtTriggerInputMode(TriggerAction::AcqOnly)],
            ),
        ];
        for (mode, expected) in cases {
            let mut controller = DigitizerController::new(SimDigitizer::new());
            controller.configure(&settings(mode)).unwrap();
            assert_eq!(
                trigger_calls(controller.hardware().calls()),
                expected,
                "{mode}"
            );
            assert_eq!(controller.trigger_mode(), Some(mode));
        }
    }

    #[test]
    fn self_trigger_state_does_not_leak_into_next_session() {
        let mut controller = DigitizerController::new(SimDigitizer::new());
        controller.configure(&settings(TriggerMode::SelfTrigger)).unwrap();
        assert_eq!(controller.hardware().thresholds().get(&0), Some(&8100));

        controller
            .configure(&settings(TriggerMode::ExternalTrigger))
            .unwrap();
        let hw = controller.hardware();
        assert!(hw.thresholds().is_empty());
        assert_eq!(hw.self_trigger_mask(), 0);
        assert_eq!(hw.ext_trigger_mode(), TriggerAction::AcqOnly);
        assert_eq!(hw.sw_trigger_mode(), TriggerAction::Disabled);

        let second_session = hw
            .calls()
            .iter()
            .rposition(|c| *c == Call::Open)
            .unwrap();
        assert!(trigger_calls(&hw.calls()[second_session..])
            .iter()
            .all(|c| matches!(c, Call::SetExtTriggerInputMode(_))));
    }

    #[test]
    fn release_without_start_frees_everything() {
        let mut controller = DigitizerController::new(SimDigitizer::new());
        controller.configure(&settings(TriggerMode::SoftwareTrigger)).unwrap();
        assert!(controller.buffer_allocated());

        controller.stop().unwrap();
        controller.release();
        assert!(!controller.buffer_allocated());
        assert!(!controller.is_configured());
        assert!(!controller.hardware().is_open());
        assert!(!controller
            .hardware()
            .calls()
            .contains(&Call::StopAcquisition));

        // a second teardown is a no-op
        let n = controller.hardware().calls().len();
        controller.release();
        assert_eq!(controller.hardware().calls().len(), n);
    }

    #[test]
    fn failed_configuration_closes_device() {
        let sim = SimDigitizer::new().fail_on("set_channel_enable_mask", DgtzErrorCode::CommError);
        let mut controller = DigitizerController::new(sim);
        let err = controller
            .configure(&settings(TriggerMode::Continuous))
            .unwrap_err();

        assert_eq!(
            err,
            HardwareError::Call {
                call: "set_channel_enable_mask",
                code: DgtzErrorCode::CommError
            }
        );
        let hw = controller.hardware();
        assert!(!hw.is_open());
        assert!(!controller.buffer_allocated());
        // nothing after the failing call was attempted
        assert!(!hw.calls().contains(&Call::ReadoutBufferSize));
        assert_eq!(hw.calls().last(), Some(&Call::Close));
    }

    #[test]
    fn teardown_continues_when_stop_fails() {
        let sim = SimDigitizer::new().fail_on("stop_acquisition", DgtzErrorCode::CommError);
        let mut controller = DigitizerController::new(sim);
        controller.configure(&settings(TriggerMode::Continuous)).unwrap();
        controller.start().unwrap();
        assert!(controller.stop().is_err());

        controller.release();
        assert!(!controller.hardware().is_open());
        assert!(!controller.buffer_allocated());
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let mut controller = DigitizerController::new(SimDigitizer::new());
        assert_eq!(controller.stop(), Ok(()));
        assert_eq!(controller.start(), Err(HardwareError::NotConfigured));

        controller.configure(&settings(TriggerMode::Continuous)).unwrap();
        controller.stop().unwrap();
        controller.start().unwrap();
        controller.start().unwrap();
        controller.stop().unwrap();
        controller.stop().unwrap();

        let calls = controller.hardware().calls();
        let starts = calls.iter().filter(|c| **c == Call::StartAcquisition).count();
        let stops = calls.iter().filter(|c| **c == Call::StopAcquisition).count();
        assert_eq!((starts, stops), (1, 1));
    }

    #[test]
    fn software_trigger_is_mode_gated() {
        let mut controller = DigitizerController::new(SimDigitizer::new());
        controller.configure(&settings(TriggerMode::ExternalTrigger)).unwrap();
        controller.issue_software_trigger().unwrap();
        assert!(!controller.hardware().calls().contains(&Call::SendSwTrigger));

        controller.configure(&settings(TriggerMode::SoftwareTrigger)).unwrap();
        controller.issue_software_trigger().unwrap();
        assert!(controller.hardware().calls().contains(&Call::SendSwTrigger));
    }

    #[test]
    fn post_trigger_fraction_becomes_percentage() {
        assert_eq!(post_trigger_percent(0.0), 0);
        assert_eq!(post_trigger_percent(0.29), 29);
        assert_eq!(post_trigger_percent(0.5), 50);
        assert_eq!(post_trigger_percent(1.0), 100);
    }
}
