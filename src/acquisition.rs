//! The acquisition loop: trigger, transfer, decode, write, until the event budget
//! is spent.
//!
//! Everything runs on the calling thread and every hardware call blocks. There is
//! no software timeout on a transfer: with an external trigger source that stays
//! silent, [`AcquisitionLoop::run`] waits until the process is terminated.

use crate::{
    Digitizer, DigitizerController, EventStream, HardwareError, Monitor, Settings, TriggerMode,
    WaveformSink,
};
use log::{debug, error, info, warn};
use std::{
    collections::BTreeSet,
    fmt,
    io::{self, Write},
    time::{Duration, Instant},
};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("hardware error: {0}")]
    Hardware(#[from] HardwareError),
    #[error("output stream error: {0}")]
    Io(#[from] io::Error),
}

/// What to acquire and what to keep.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    /// Number of successfully decoded events after which the run ends.
    pub budget: u64,
    pub persist_channels: BTreeSet<u32>,
    pub downsample: usize,
}

impl RunPlan {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            budget: settings.acquisition.max_events_per_transfer as u64,
            persist_channels: settings.output.persist_channels.clone(),
            downsample: settings.output.waveform_downsample,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Events decoded and written.
    pub processed: u64,
    /// Events seen, including the ones that failed to decode.
    pub observed: u64,
    pub skipped: u64,
    pub transfers: u64,
    pub bytes_written: u64,
    pub started: OffsetDateTime,
    pub elapsed: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let started = self
            .started
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.started.to_string());
        write!(
            f,
            "Number of Events: {} ({} observed, {} skipped) in {} transfers, {} bytes written; started {}, took {:.1} s",
            self.processed,
            self.observed,
            self.skipped,
            self.transfers,
            self.bytes_written,
            started,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Drives a configured controller until the budget is spent or something fails.
///
/// However `run` ends, acquisition is stopped, the controller's session released
/// and the sink flushed and closed before it returns. After a failed run the
/// output stream is dropped; after a successful one it is kept for
/// [`AcquisitionLoop::finish`].
pub struct AcquisitionLoop<D: Digitizer, W: Write> {
    controller: DigitizerController<D>,
    stream: EventStream,
    sink: Option<WaveformSink<W>>,
    output: Option<W>,
    plan: RunPlan,
}

impl<D: Digitizer, W: Write> AcquisitionLoop<D, W> {
    /// `controller` must already be configured.
    pub fn new(
        controller: DigitizerController<D>,
        sink: WaveformSink<W>,
        plan: RunPlan,
    ) -> Result<Self, HardwareError> {
        let stream = EventStream::for_controller(&controller)?;
        Ok(Self {
            controller,
            stream,
            sink: Some(sink),
            output: None,
            plan,
        })
    }

    pub fn controller(&self) -> &DigitizerController<D> {
        &self.controller
    }

    /// Whether the output stream is still open.
    pub fn is_output_open(&self) -> bool {
        self.sink.is_some() || self.output.is_some()
    }

    pub fn run(&mut self, monitor: &mut dyn Monitor) -> Result<RunSummary, AcquisitionError> {
        let started = OffsetDateTime::now_utc();
        let clock = Instant::now();
        let mut processed = 0u64;

        let result = self.acquire(monitor, &mut processed);

        if let Err(e) = self.controller.stop() {
            warn!("Stopping acquisition failed: {}", e);
        }
        self.controller.release();

        let bytes_written = self.sink.as_ref().map_or(0, WaveformSink::bytes_written);
        let closed = match self.sink.take() {
            Some(sink) => sink.finish().map(Some),
            None => Ok(None),
        };
        let result = match (result, closed) {
            (Ok(()), Ok(output)) => {
                self.output = output;
                Ok(())
            }
            (Ok(()), Err(e)) => Err(AcquisitionError::from(e)),
            (Err(e), Err(close_err)) => {
                warn!("Flushing output after failure: {}", close_err);
                Err(e)
            }
            // the output stream was dropped above, which closes it
            (Err(e), Ok(_)) => Err(e),
        };
        if let Err(e) = result {
            error!("Acquisition aborted after {} events: {}", processed, e);
            return Err(e);
        }

        let skipped = self.stream.skipped();
        let summary = RunSummary {
            processed,
            observed: processed + skipped,
            skipped,
            transfers: self.stream.transfers(),
            bytes_written,
            started,
            elapsed: clock.elapsed(),
        };
        monitor.on_finish(&summary);
        Ok(summary)
    }

    fn acquire(
        &mut self,
        monitor: &mut dyn Monitor,
        processed: &mut u64,
    ) -> Result<(), AcquisitionError> {
        let mode = self
            .controller
            .trigger_mode()
            .ok_or(HardwareError::NotConfigured)?;
        let sink = self.sink.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "output stream already closed")
        })?;
        self.controller.start()?;
        monitor.on_start(mode, self.plan.budget);

        while *processed < self.plan.budget {
            if mode == TriggerMode::SoftwareTrigger {
                self.controller.issue_software_trigger()?;
            }

            self.stream.transfer(&mut self.controller)?;
            if let Some(batch) = self.controller.session().map(|s| s.batch()) {
                monitor.on_transfer(batch);
            }

            while *processed < self.plan.budget {
                let event = match self.stream.decode_next(&mut self.controller) {
                    Some(event) => event,
                    None => break,
                };
                let means = sink.write(event, &self.plan.persist_channels, self.plan.downsample)?;
                *processed += 1;
                monitor.on_event(event, means);
            }
        }
        if self.stream.remaining() > 0 {
            debug!(
                "Budget reached with {} events left in the last transfer",
                self.stream.remaining()
            );
        }
        info!("Event budget of {} reached", self.plan.budget);
        Ok(())
    }

    /// Hand back the output stream of a successful run.
    pub fn finish(self) -> Option<W> {
        self.output
    }
}
