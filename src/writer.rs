use crate::DecodedEvent;
use std::{
    collections::BTreeSet,
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

/// Downsampled mean of one channel of one event, for operator feedback only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelMean {
    pub channel: u32,
    /// `None` when the waveform is shorter than the stride.
    pub mean: Option<f64>,
}

/// Mean of every `stride`-th sample, divided by `samples.len() / stride`.
///
/// The divisor is the truncated quotient, not the number of samples summed, so
/// a stride that does not divide the length gives a slightly larger value.
pub fn downsampled_mean(samples: &[u16], stride: usize) -> Option<f64> {
    let stride = stride.max(1);
    let sum: u64 = samples.iter().step_by(stride).map(|&s| s as u64).sum();
    mean_of(sum, samples.len(), stride)
}

fn mean_of(sum: u64, n_samples: usize, stride: usize) -> Option<f64> {
    let count = n_samples / stride;
    (count > 0).then(|| sum as f64 / count as f64)
}

/// Appends raw waveforms to an output stream.
///
/// Each (event, channel) pair becomes `n` little-endian `u16` samples with no
/// header or separator; channels go out in ascending order. A failed write leaves
/// the stream in an unknown state, so callers must stop on the first error.
pub struct WaveformSink<W: Write> {
    out: W,
    scratch: Vec<u8>,
    means: Vec<ChannelMean>,
    bytes_written: u64,
    records: u64,
}

impl WaveformSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> WaveformSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            scratch: Vec::new(),
            means: Vec::new(),
            bytes_written: 0,
            records: 0,
        }
    }

    /// Write the `channels` of `event` and return their downsampled means.
    pub fn write(
        &mut self,
        event: &DecodedEvent,
        channels: &BTreeSet<u32>,
        downsample: usize,
    ) -> io::Result<&[ChannelMean]> {
        let stride = downsample.max(1);
        self.means.clear();
        for &channel in channels {
            let samples = event.waveform(channel).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "event {} carries no waveform for channel {}",
                        event.event_counter, channel
                    ),
                )
            })?;

            self.scratch.clear();
            self.scratch.reserve(samples.len() * 2);
            let mut sum = 0u64;
            for (j, &sample) in samples.iter().enumerate() {
                self.scratch.extend_from_slice(&sample.to_le_bytes());
                if j % stride == 0 {
                    sum += sample as u64;
                }
            }
            self.out.write_all(&self.scratch)?;
            self.bytes_written += self.scratch.len() as u64;
            self.records += 1;

            self.means.push(ChannelMean {
                channel,
                mean: mean_of(sum, samples.len(), stride),
            });
        }
        Ok(&self.means)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Number of (event, channel) records written.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    /// Flush and hand back the underlying stream.
    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(counter: u32, channels: &[(u32, &[u16])]) -> DecodedEvent {
        let mut event = DecodedEvent::new(8, 4);
        event.event_counter = counter;
        for &(ch, samples) in channels {
            event
                .waveform_mut(ch, samples.len())
                .unwrap()
                .copy_from_slice(samples);
        }
        event
    }

    fn as_u16(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn two_events_stream_in_event_order() {
        let persist = BTreeSet::from([1]);
        let mut sink = WaveformSink::new(Vec::new());
        sink.write(&event(0, &[(1, &[1, 2, 3, 4])]), &persist, 1)
            .unwrap();
        sink.write(&event(1, &[(1, &[5, 6, 7, 8])]), &persist, 1)
            .unwrap();

        let bytes = sink.finish().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..4], &[1, 0, 2, 0]);
        assert_eq!(as_u16(&bytes), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn channels_are_written_in_ascending_order() {
        let persist = BTreeSet::from([5, 0]);
        let mut sink = WaveformSink::new(Vec::new());
        let ev = event(0, &[(5, &[50, 51]), (0, &[1, 2]), (3, &[30, 31])]);
        let means = sink.write(&ev, &persist, 1).unwrap().to_vec();

        assert_eq!(
            means.iter().map(|m| m.channel).collect::<Vec<_>>(),
            vec![0, 5]
        );
        assert_eq!(sink.records(), 2);
        assert_eq!(as_u16(sink.get_ref()), vec![1, 2, 50, 51]);
    }

    #[test]
    fn large_samples_are_little_endian() {
        let persist = BTreeSet::from([0]);
        let mut sink = WaveformSink::new(Vec::new());
        sink.write(&event(0, &[(0, &[0x1234, 0xBEEF])]), &persist, 1)
            .unwrap();
        assert_eq!(sink.get_ref().as_slice(), &[0x34, 0x12, 0xEF, 0xBE]);
        assert_eq!(sink.bytes_written(), 4);
    }

    #[test]
    fn mean_with_unit_stride_is_plain_average() {
        let samples: Vec<u16> = (0..100).collect();
        assert_eq!(downsampled_mean(&samples, 1), Some(49.5));
    }

    #[test]
    fn mean_divides_by_truncated_sample_count() {
        // indices 0, 7, ..., 98 are summed (15 samples) but the divisor is 100 / 7 = 14
        let samples: Vec<u16> = (0..100).collect();
        let expected = (0..100).step_by(7).sum::<u64>() as f64 / 14.0;
        assert_eq!(expected, 52.5);
        assert_eq!(downsampled_mean(&samples, 7), Some(expected));
    }

    #[test]
    fn sink_reports_same_mean_as_helper() {
        let samples: Vec<u16> = (0..100).map(|i| 1000 + (i * 37 % 101) as u16).collect();
        let mut ev = DecodedEvent::new(2, 100);
        ev.waveform_mut(0, 100).unwrap().copy_from_slice(&samples);

        let mut sink = WaveformSink::new(Vec::new());
        let means = sink.write(&ev, &BTreeSet::from([0]), 7).unwrap();
        assert_eq!(means[0].mean, downsampled_mean(&samples, 7));
        // persisted data is never downsampled
        assert_eq!(sink.bytes_written(), 200);
    }

    #[test]
    fn stride_longer_than_waveform_has_no_mean() {
        assert_eq!(downsampled_mean(&[1, 2, 3], 4), None);
    }

    #[test]
    fn missing_channel_is_an_error() {
        let mut sink = WaveformSink::new(Vec::new());
        let err = sink
            .write(&event(3, &[(0, &[1])]), &BTreeSet::from([2]), 1)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_errors_propagate() {
        let mut sink = WaveformSink::new(FailingWriter);
        let err = sink
            .write(&event(0, &[(0, &[1, 2])]), &BTreeSet::from([0]), 1)
            .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(sink.records(), 0);
    }

    #[test]
    fn creates_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.dat");
        let mut sink = WaveformSink::create(&path).unwrap();
        sink.write(&event(0, &[(0, &[9, 10])]), &BTreeSet::from([0]), 2)
            .unwrap();
        sink.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![9, 0, 10, 0]);
    }
}
