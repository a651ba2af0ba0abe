use crate::dgtz::MAX_CHANNELS;
use crate::{Digitizer, DigitizerController, HardwareError, HwResult};
use log::{debug, warn};
use ndarray::{s, Array2};

/// One decoded trigger.
///
/// Waveforms live in a contiguous `(n_channels, capacity)` array indexed by
/// channel number; `n_samples` holds how much of each row the device filled.
/// The storage is reused from event to event, so a channel is only valid when its
/// bit is set in the channel mask.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub event_counter: u32,
    pub trigger_time_tag: u32,
    pub board_id: u32,
    channel_mask: u64,
    waveform_data: Array2<u16>,
    n_samples: Vec<usize>,
}

impl DecodedEvent {
    /// Create an empty event.
    ///
    /// # Arguments
    ///
    /// * `n_channels` - Number of channels the board exposes.
    /// * `waveform_len` - Initial number of samples reserved per channel.
    pub fn new(n_channels: usize, waveform_len: usize) -> Self {
        Self {
            event_counter: 0,
            trigger_time_tag: 0,
            board_id: 0,
            channel_mask: 0,
            waveform_data: Array2::<u16>::zeros((n_channels, waveform_len)),
            n_samples: vec![0; n_channels],
        }
    }

    pub fn n_channels(&self) -> usize {
        self.waveform_data.nrows()
    }

    pub fn capacity(&self) -> usize {
        self.waveform_data.ncols()
    }

    pub fn channel_mask(&self) -> u64 {
        self.channel_mask
    }

    /// Channels carrying data, ascending.
    pub fn channels(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.n_channels() as u32).filter(|&ch| self.has_channel(ch))
    }

    pub fn has_channel(&self, channel: u32) -> bool {
        channel < 64 && self.channel_mask & (1u64 << channel) != 0
    }

    pub fn clear(&mut self) {
        self.event_counter = 0;
        self.trigger_time_tag = 0;
        self.board_id = 0;
        self.channel_mask = 0;
        self.n_samples.iter_mut().for_each(|n| *n = 0);
    }

    pub fn waveform(&self, channel: u32) -> Option<&[u16]> {
        if !self.has_channel(channel) {
            return None;
        }
        let ch = channel as usize;
        let n = *self.n_samples.get(ch)?;
        let cols = self.capacity();
        self.waveform_data
            .as_slice()?
            .get(ch * cols..ch * cols + n)
    }

    /// Hand out the row for `channel`, sized to `n_samples`, and mark it valid.
    ///
    /// Storage grows (keeping the rows already written) when the device reports
    /// more samples than currently reserved.
    pub fn waveform_mut(&mut self, channel: u32, n_samples: usize) -> Option<&mut [u16]> {
        let ch = channel as usize;
        if ch >= self.n_channels() || ch >= 64 {
            return None;
        }
        if n_samples > self.capacity() {
            let cols = self.capacity();
            debug!("Growing event storage from {} to {} samples", cols, n_samples);
            let mut grown = Array2::<u16>::zeros((self.n_channels(), n_samples));
            grown.slice_mut(s![.., ..cols]).assign(&self.waveform_data);
            self.waveform_data = grown;
        }
        self.n_samples[ch] = n_samples;
        self.channel_mask |= 1u64 << channel;
        let cols = self.capacity();
        self.waveform_data
            .as_slice_mut()?
            .get_mut(ch * cols..ch * cols + n_samples)
    }
}

/// Lazily decodes the events of the controller's current readout, one at a time.
///
/// The stream owns a single [`DecodedEvent`] and lends it out; the borrow ends at
/// the next call, so nothing downstream can hold on to a decoded event across a
/// transfer. The controller is only borrowed for the duration of each call.
#[derive(Debug)]
pub struct EventStream {
    event: DecodedEvent,
    cursor: u32,
    available: u32,
    skipped: u64,
    transfers: u64,
}

impl EventStream {
    pub fn new(event: DecodedEvent) -> Self {
        Self {
            event,
            cursor: 0,
            available: 0,
            skipped: 0,
            transfers: 0,
        }
    }

    /// Size the event storage after the configured session.
    pub fn for_controller<D: Digitizer>(controller: &DigitizerController<D>) -> HwResult<Self> {
        let session = controller.session().ok_or(HardwareError::NotConfigured)?;
        // decoded waveforms are indexed over the library's full channel range
        Ok(Self::new(DecodedEvent::new(
            MAX_CHANNELS,
            session.record_length as usize,
        )))
    }

    /// Pull one readout into the controller's buffer.
    ///
    /// Events left over from the previous readout are dropped. Zero events is a
    /// normal answer when nothing has triggered yet.
    pub fn transfer<D: Digitizer>(
        &mut self,
        controller: &mut DigitizerController<D>,
    ) -> HwResult<u32> {
        if self.remaining() > 0 {
            debug!("Discarding {} undecoded events", self.remaining());
        }
        self.cursor = 0;
        self.available = 0;
        let batch = controller.transfer()?;
        self.available = batch.event_count;
        self.transfers += 1;
        Ok(batch.event_count)
    }

    /// Decode the next event of the current readout.
    ///
    /// Events that fail to decode, or that lack a channel the session enabled, are
    /// logged, counted in [`EventStream::skipped`] and passed over. `None` means the
    /// readout is exhausted.
    pub fn decode_next<D: Digitizer>(
        &mut self,
        controller: &mut DigitizerController<D>,
    ) -> Option<&DecodedEvent> {
        let enabled = controller.session().map_or(0, |s| u64::from(s.enable_mask));
        while self.cursor < self.available {
            let index = self.cursor;
            self.cursor += 1;
            self.event.clear();
            match controller.decode(index, &mut self.event) {
                Ok(()) => {
                    let missing = enabled & !self.event.channel_mask();
                    if missing == 0 {
                        return Some(&self.event);
                    }
                    warn!(
                        "Skipping event {} of readout: no data for channel mask {:#x}",
                        self.event.event_counter, missing
                    );
                    self.skipped += 1;
                }
                Err(e) => {
                    warn!("Skipping event {} of readout: {}", index, e);
                    self.skipped += 1;
                }
            }
        }
        None
    }

    pub fn remaining(&self) -> u32 {
        self.available - self.cursor
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn transfers(&self) -> u64 {
        self.transfers
    }
}
