use crate::{ChannelMean, DecodedEvent, RawBatch, RunSummary, TriggerMode};
use crossterm::{
    cursor::MoveToColumn,
    queue,
    style::Print,
    terminal::{Clear, ClearType},
};
use log::{debug, info};
use std::{
    collections::VecDeque,
    fmt::Write as _,
    io::Write,
    time::{Duration, Instant},
};

/// Receives progress from the acquisition loop.
///
/// All methods default to doing nothing, so an implementation only picks the
/// hooks it cares about. Monitors never influence the acquisition itself.
pub trait Monitor {
    fn on_start(&mut self, _mode: TriggerMode, _budget: u64) {}
    fn on_transfer(&mut self, _batch: RawBatch) {}
    fn on_event(&mut self, _event: &DecodedEvent, _means: &[ChannelMean]) {}
    fn on_finish(&mut self, _summary: &RunSummary) {}
}

/// Does nothing.
impl Monitor for () {}

impl<A: Monitor, B: Monitor> Monitor for (A, B) {
    fn on_start(&mut self, mode: TriggerMode, budget: u64) {
        self.0.on_start(mode, budget);
        self.1.on_start(mode, budget);
    }

    fn on_transfer(&mut self, batch: RawBatch) {
        self.0.on_transfer(batch);
        self.1.on_transfer(batch);
    }

    fn on_event(&mut self, event: &DecodedEvent, means: &[ChannelMean]) {
        self.0.on_event(event, means);
        self.1.on_event(event, means);
    }

    fn on_finish(&mut self, summary: &RunSummary) {
        self.0.on_finish(summary);
        self.1.on_finish(summary);
    }
}

/// Reports through the `log` facade.
///
/// At verbosity 0 only the start and the final summary are logged; from 1 on every
/// event is reported with its counter and the downsampled mean ADU per channel.
#[derive(Debug, Clone, Copy)]
pub struct LogMonitor {
    pub verbose: u8,
}

impl LogMonitor {
    pub fn new(verbose: u8) -> Self {
        Self { verbose }
    }
}

impl Monitor for LogMonitor {
    fn on_start(&mut self, mode: TriggerMode, budget: u64) {
        info!("Acquiring {} events in {} mode", budget, mode);
    }

    fn on_transfer(&mut self, batch: RawBatch) {
        debug!(
            "Transferred {} events ({} bytes)",
            batch.event_count, batch.byte_size
        );
    }

    fn on_event(&mut self, event: &DecodedEvent, means: &[ChannelMean]) {
        if self.verbose == 0 {
            return;
        }
        let mut line = format!("EventCounter: {}\tMean ADU", event.event_counter);
        for m in means {
            match m.mean {
                Some(mean) => {
                    let _ = write!(line, "\tChannel {}: {:.2}", m.channel, mean);
                }
                None => {
                    let _ = write!(line, "\tChannel {}: n/a", m.channel);
                }
            }
        }
        info!("{}", line);
    }

    fn on_finish(&mut self, summary: &RunSummary) {
        info!("{}", summary);
    }
}

/// Running totals with an all-time count and a sliding 1 s window rate.
#[derive(Debug)]
pub struct Counter {
    /// All-time total bytes
    pub total_size: usize,
    /// All-time number of events
    pub n_events: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    events: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_size: 0,
            n_events: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            events: VecDeque::new(),
            bytes_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average rate since t_begin, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_size as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Rate over the sliding window, in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Events per second over the sliding window.
    pub fn event_rate(&self) -> f64 {
        self.events.len() as f64 / self.window.as_secs_f64().max(1e-6)
    }

    /// Record an event of `size` bytes.
    pub fn increment(&mut self, size: usize) {
        self.increment_at(Instant::now(), size);
    }

    fn increment_at(&mut self, now: Instant, size: usize) {
        self.total_size += size;
        self.n_events += 1;

        self.events.push_back((now, size));
        self.bytes_in_window += size;

        // evict entries older than the window
        while let Some(&(ts, sz)) = self.events.front() {
            if now.duration_since(ts) > self.window {
                self.events.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total_size = 0;
        self.n_events = 0;
        self.t_begin = Instant::now();
        self.events.clear();
        self.bytes_in_window = 0;
    }
}

/// Single, in-place terminal line with elapsed time, events and data rate,
/// redrawn at most once per `interval`.
pub struct StatusLine<W: Write> {
    out: W,
    counter: Counter,
    budget: u64,
    last_draw: Option<Instant>,
    interval: Duration,
}

impl<W: Write> StatusLine<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            counter: Counter::new(),
            budget: 0,
            last_draw: None,
            interval: Duration::from_secs(1),
        }
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    fn draw(&mut self) {
        let text = format!(
            "Time (s): {}\tEvents: {}/{}\tEvent rate (Hz): {:.1}\tReadout rate (MB/s): {:.2}",
            self.counter.t_begin.elapsed().as_secs(),
            self.counter.n_events,
            self.budget,
            self.counter.event_rate(),
            self.counter.rate(),
        );
        let drawn = queue!(
            self.out,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(text)
        )
        .and_then(|_| self.out.flush());
        if let Err(e) = drawn {
            debug!("Status line not drawn: {}", e);
        }
        self.last_draw = Some(Instant::now());
    }
}

impl<W: Write> Monitor for StatusLine<W> {
    fn on_start(&mut self, _mode: TriggerMode, budget: u64) {
        self.budget = budget;
        self.counter.reset();
        self.draw();
    }

    fn on_event(&mut self, event: &DecodedEvent, means: &[ChannelMean]) {
        let bytes: usize = means
            .iter()
            .filter_map(|m| event.waveform(m.channel))
            .map(|w| w.len() * 2)
            .sum();
        self.counter.increment(bytes);
        if self
            .last_draw
            .map_or(true, |t| t.elapsed() >= self.interval)
        {
            self.draw();
        }
    }

    fn on_finish(&mut self, _summary: &RunSummary) {
        self.draw();
        let finished = writeln!(
            self.out,
            "\nAverage readout rate (MB/s): {:.2}",
            self.counter.average_rate()
        )
        .and_then(|_| self.out.flush());
        if let Err(e) = finished {
            debug!("Status line not finished: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_window_evicts_old_entries() {
        let mut counter = Counter::new();
        let t0 = Instant::now();
        counter.increment_at(t0, 100);
        counter.increment_at(t0 + Duration::from_millis(500), 200);
        assert_eq!(counter.bytes_in_window, 300);

        counter.increment_at(t0 + Duration::from_millis(1200), 50);
        assert_eq!(counter.n_events, 3);
        assert_eq!(counter.total_size, 350);
        assert_eq!(counter.bytes_in_window, 250);
        assert_eq!(counter.events.len(), 2);
    }

    #[test]
    fn status_line_counts_persisted_bytes() {
        let mut event = DecodedEvent::new(2, 4);
        event.waveform_mut(1, 4).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        let means = [ChannelMean {
            channel: 1,
            mean: Some(2.5),
        }];

        let mut status = StatusLine::new(Vec::new());
        status.on_start(TriggerMode::Continuous, 10);
        status.on_event(&event, &means);
        status.on_event(&event, &means);
        assert_eq!(status.counter().n_events, 2);
        assert_eq!(status.counter().total_size, 16);

        let text = String::from_utf8_lossy(&status.out).to_string();
        assert!(text.contains("Events: 0/10"));
    }

    #[test]
    fn average_rate_covers_the_whole_run() {
        let mut counter = Counter::new();
        counter.t_begin = Instant::now() - Duration::from_secs(2);
        counter.increment(2 * 1024 * 1024);
        let rate = counter.average_rate();
        assert!(rate > 0.9 && rate <= 1.0, "rate was {}", rate);

        counter.reset();
        assert_eq!(counter.average_rate(), 0.0);
    }

    #[test]
    fn status_line_ends_with_average_rate() {
        let mut status = StatusLine::new(Vec::new());
        status.on_start(TriggerMode::Continuous, 1);
        status.on_event(&DecodedEvent::new(1, 4), &[]);
        status.on_finish(&RunSummary {
            processed: 1,
            observed: 1,
            skipped: 0,
            transfers: 1,
            bytes_written: 0,
            started: time::OffsetDateTime::now_utc(),
            elapsed: Duration::from_millis(1),
        });

        let text = String::from_utf8_lossy(&status.out).to_string();
        assert!(text.contains("Average readout rate (MB/s): "));
        assert!(text.ends_with('\n'));
    }

    #[derive(Default)]
    struct Tally {
        starts: usize,
        events: usize,
    }

    impl Monitor for Tally {
        fn on_start(&mut self, _mode: TriggerMode, _budget: u64) {
            self.starts += 1;
        }

        fn on_event(&mut self, _event: &DecodedEvent, _means: &[ChannelMean]) {
            self.events += 1;
        }
    }

    #[test]
    fn pair_forwards_to_both() {
        let mut pair = (Tally::default(), Tally::default());
        let event = DecodedEvent::new(1, 1);
        pair.on_start(TriggerMode::SoftwareTrigger, 1);
        pair.on_event(&event, &[]);
        assert_eq!((pair.0.starts, pair.0.events), (1, 1));
        assert_eq!((pair.1.starts, pair.1.events), (1, 1));
    }
}
