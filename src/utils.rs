use crate::{Conf, DaqError, TriggerEdge, TriggerLogic, N_CHANNELS};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use time::{macros::format_description, OffsetDateTime};

/// A helper structure to track statistics, with both
/// *all-time* counters and a *sliding 1 s window* rate.
#[derive(Debug)]
pub struct Counter {
    /// All-time total bytes
    pub total_size: usize,
    /// All-time number of events
    pub n_events: usize,
    /// Events thrown away because the master re-armed while being read
    pub n_spurious: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    // --- sliding window fields ---
    window: Duration,
    events: VecDeque<Instant>,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_size: 0,
            n_events: 0,
            n_spurious: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            events: VecDeque::new(),
        }
    }
}

impl Counter {
    /// Create a new Counter with a 1 s sliding window.
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average event rate since t_begin, in Hz
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.n_events as f64 / secs
    }

    /// Event rate over the last `window` duration, in Hz
    pub fn rate(&self) -> f64 {
        self.events.len() as f64 / self.window.as_secs_f64()
    }

    /// Record an event of `size` bytes.
    pub fn increment(&mut self, size: usize) {
        let now = Instant::now();
        self.total_size += size;
        self.n_events += 1;

        self.events.push_back(now);
        while let Some(&ts) = self.events.front() {
            if now.duration_since(ts) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn spurious(&mut self) {
        self.n_spurious += 1;
    }

    /// Reset both all-time counters and the sliding window.
    pub fn reset(&mut self) {
        self.total_size = 0;
        self.n_events = 0;
        self.n_spurious = 0;
        self.t_begin = Instant::now();
        self.events.clear();
    }
}

/// Cooperative stop request shared between the acquisition loop and
/// whoever may want to end it (signal handler, tests).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Route Ctrl-C to `token`. The handler only flips the flag.
///
/// Can be installed once per process.
pub fn cancel_on_sigint(token: &CancelToken) -> Result<(), DaqError> {
    let token = token.clone();
    ctrlc::set_handler(move || token.cancel()).map_err(|e| DaqError::Signal(e.to_string()))
}

/// Self-describing file name for a run started at `start`, e.g.
/// `2017-02-15_16h43m45s345678_5000MSPS_-050mV-0950mV_060000psDelay_Rise_AND_CH1-BYPASS_CH2-0050mV_CH3-0050mV_CH4-BYPASS_EXT-F_00000050-Events_00000005-Seconds.dat`
pub fn output_filename(config: &Conf, start: OffsetDateTime) -> String {
    let board = &config.board_settings;
    let trigger = &config.trigger_settings;
    let run = &config.run_settings;

    let date = start
        .format(format_description!(
            "[year]-[month]-[day]_[hour]h[minute]m[second]s"
        ))
        .unwrap_or_default();
    let mut name = format!("{date}{:06}", start.microsecond());

    name.push_str(&format!("_{}MSPS", (board.sample_speed * 1000.0).round() as i64));
    name.push_str(&format!(
        "_{:04}mV-{:04}mV",
        ((board.range_center - 0.5) * 1000.0).round() as i64,
        ((board.range_center + 0.5) * 1000.0).round() as i64
    ));
    name.push_str(&format!("_{:06}psDelay", (trigger.delay_ns * 1000.0).round() as i64));
    name.push_str(match trigger.edge {
        TriggerEdge::Rise => "_Rise",
        TriggerEdge::Fall => "_Fall",
    });
    name.push_str(match trigger.logic {
        TriggerLogic::And => "_AND",
        TriggerLogic::Or => "__OR",
    });
    for ch in 0..N_CHANNELS {
        if trigger.sources[ch] {
            name.push_str(&format!(
                "_CH{}-{:04}mV",
                ch + 1,
                (trigger.levels[ch] * 1000.0).round() as i64
            ));
        } else {
            name.push_str(&format!("_CH{}-BYPASS", ch + 1));
        }
    }
    name.push_str(if trigger.sources[N_CHANNELS] {
        "_EXT-T"
    } else {
        "_EXT-F"
    });
    name.push_str(&format!("_{:08}-Events", run.max_events));
    name.push_str(&format!("_{:08}-Seconds", run.max_time));
    name.push_str(".dat");
    name
}
