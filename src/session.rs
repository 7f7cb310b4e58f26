//! The acquisition loop.
//!
//! One cycle: arm the chain (slaves first, master last), wait for the master
//! to drop its busy flag, read every board, write the event. The run ends on
//! the event limit, the time limit or a cancel request, whichever comes first.

use crate::{
    read_time_calibration, Board, BoardChain, CancelToken, Conf, Counter, DaqError, Event,
    EventEncoder, EventWriter, Timestamp, WaveformReader,
};
use log::{debug, info, warn};
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

/// Time source of the loop, swappable for a simulated clock.
pub trait Clock {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;
    /// Wall-clock time stamped into event headers.
    fn timestamp(&self) -> Timestamp;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn timestamp(&self) -> Timestamp {
        Timestamp::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub max_events: u32,
    pub max_time: Duration,
    pub first_serial: u32,
    pub poll_interval: Duration,
    /// Input range center in volts.
    pub range_center: f64,
}

impl From<&Conf> for SessionSettings {
    fn from(conf: &Conf) -> Self {
        Self {
            max_events: conf.run_settings.max_events,
            max_time: conf.max_time(),
            first_serial: conf.run_settings.first_serial,
            poll_interval: conf.poll_interval(),
            range_center: conf.board_settings.range_center,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxEvents,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub events: u32,
    pub spurious: usize,
    pub bytes: u64,
    pub elapsed: Duration,
    pub reason: StopReason,
}

enum Readout {
    Complete,
    Spurious,
}

/// Owns everything a run touches: the board chain, the output stream, the
/// event buffers and the counters. Dropping the session closes the boards.
pub struct AcquisitionSession<B: Board, W: Write, C: Clock> {
    chain: BoardChain<B>,
    writer: EventWriter<W>,
    reader: WaveformReader,
    event: Event,
    settings: SessionSettings,
    clock: C,
    cancel: CancelToken,
    counter: Counter,
}

impl<B: Board, W: Write, C: Clock> AcquisitionSession<B, W, C> {
    /// Read the chain's time calibration and prepare the encoder for its topology.
    pub fn new(
        mut chain: BoardChain<B>,
        out: W,
        settings: SessionSettings,
        clock: C,
        cancel: CancelToken,
    ) -> Result<Self, DaqError> {
        let calibration = read_time_calibration(chain.boards_mut())?;
        let encoder = EventEncoder::new(chain.len(), settings.first_serial)
            .with_calibration(calibration);
        let event = Event::new(chain.serials(), settings.range_center);
        Ok(Self {
            chain,
            writer: EventWriter::new(out, encoder),
            reader: WaveformReader::new(),
            event,
            settings,
            clock,
            cancel,
            counter: Counter::new(),
        })
    }

    /// Acquire until a stop condition fires. Every record in the output is
    /// complete whatever the reason for stopping; errors abort the run.
    pub fn run(&mut self) -> Result<RunSummary, DaqError> {
        let start = self.clock.now();
        info!(
            "Starting acquisition: {} board(s), up to {} events or {:?}",
            self.chain.len(),
            self.settings.max_events,
            self.settings.max_time
        );

        self.counter.reset();
        let outcome = self.acquire(start);
        // flush on every exit path, errors included
        let flushed = self.writer.flush();
        let (written, reason) = outcome?;
        flushed?;

        let summary = RunSummary {
            events: written,
            spurious: self.counter.n_spurious,
            bytes: self.writer.bytes_written,
            elapsed: self.clock.now() - start,
            reason,
        };
        info!(
            "Program finished after {} events and {:.1} s ({:?}), average rate {:.1} Hz",
            summary.events,
            summary.elapsed.as_secs_f64(),
            summary.reason,
            self.counter.average_rate()
        );
        Ok(summary)
    }

    fn acquire(&mut self, start: Duration) -> Result<(u32, StopReason), DaqError> {
        let mut serial = self.settings.first_serial;
        let mut written = 0u32;
        let mut last_report = Instant::now();

        let reason = loop {
            if written >= self.settings.max_events {
                break StopReason::MaxEvents;
            }
            if let Some(reason) = self.stop_requested(start) {
                break reason;
            }

            self.arm()?;
            debug!("Waiting for trigger...");
            if let Some(reason) = self.wait_for_trigger(start)? {
                break reason;
            }

            match self.read_chain()? {
                Readout::Spurious => {
                    // no retry cap, a noisy trigger can keep this slot busy
                    // until the deadline
                    self.counter.spurious();
                    warn!("Fake trigger during readout of event #{serial}, retrying");
                    continue;
                }
                Readout::Complete => {}
            }

            self.event.serial = serial;
            let size = self.writer.append_event(&self.event)?;
            self.counter.increment(size);
            debug!("Event #{serial} read successfully");
            serial += 1;
            written += 1;

            if last_report.elapsed() >= Duration::from_secs(1) {
                info!(
                    "Events: {}\tRate: {:.1} Hz\tSpurious: {}",
                    self.counter.n_events,
                    self.counter.rate(),
                    self.counter.n_spurious
                );
                last_report = Instant::now();
            }
        };
        Ok((written, reason))
    }

    /// Hand back the output stream; the chain is closed.
    pub fn into_output(self) -> W {
        let Self { chain, writer, .. } = self;
        drop(chain);
        writer.into_inner()
    }

    fn stop_requested(&self, start: Duration) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if self.clock.now() - start >= self.settings.max_time {
            Some(StopReason::Timeout)
        } else {
            None
        }
    }

    /// The master starts last so that all slaves are already sampling when
    /// its domino wave begins.
    fn arm(&mut self) -> Result<(), DaqError> {
        for board in self.chain.boards_mut().iter_mut().rev() {
            board.start_domino()?;
        }
        Ok(())
    }

    fn wait_for_trigger(&mut self, start: Duration) -> Result<Option<StopReason>, DaqError> {
        while self.chain.master_mut().is_busy()? {
            if let Some(reason) = self.stop_requested(start) {
                return Ok(Some(reason));
            }
            if !self.settings.poll_interval.is_zero() {
                self.clock.sleep(self.settings.poll_interval);
            }
        }
        Ok(None)
    }

    /// Read all boards in chain order. A master that is busy again before
    /// the last board was read means the trigger was fake.
    fn read_chain(&mut self) -> Result<Readout, DaqError> {
        for index in 0..self.chain.len() {
            if self.chain.master_mut().is_busy()? {
                return Ok(Readout::Spurious);
            }
            if index == 0 {
                self.event.timestamp = self.clock.timestamp();
            }
            let board = &mut self.chain.boards_mut()[index];
            self.reader.read(board, index, &mut self.event)?;
        }
        Ok(Readout::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{shared_log, Call, ManualClock, MockBoard};
    use crate::{EventDecoder, Record};

    fn settings(max_events: u32, max_time: u64) -> SessionSettings {
        SessionSettings {
            max_events,
            max_time: Duration::from_secs(max_time),
            first_serial: 1,
            poll_interval: Duration::from_millis(250),
            range_center: 0.45,
        }
    }

    fn session(
        boards: Vec<MockBoard>,
        settings: SessionSettings,
        clock: ManualClock,
        cancel: CancelToken,
    ) -> AcquisitionSession<MockBoard, Vec<u8>, ManualClock> {
        let chain = BoardChain::new(boards).unwrap();
        AcquisitionSession::new(chain, Vec::new(), settings, clock, cancel).unwrap()
    }

    fn decode(bytes: &[u8]) -> Vec<Record> {
        EventDecoder::new(bytes).map(|r| r.unwrap()).collect()
    }

    fn event_serials(records: &[Record]) -> Vec<u32> {
        records
            .iter()
            .filter_map(|r| match r {
                Record::Event(e) => Some(e.serial),
                Record::TimeCalibration(_) => None,
            })
            .collect()
    }

    #[test]
    fn boards_are_armed_in_reverse_order() {
        let log = shared_log();
        let boards = vec![
            MockBoard::new(20).with_log(&log),
            MockBoard::new(10).with_log(&log),
            MockBoard::new(30).with_log(&log),
        ];
        let mut s = session(boards, settings(2, 60), ManualClock::new(), CancelToken::new());
        s.run().unwrap();

        let armed: Vec<u16> = log
            .borrow()
            .iter()
            .filter(|(_, c)| *c == Call::StartDomino)
            .map(|(serial, _)| *serial)
            .collect();
        assert_eq!(armed, vec![30, 20, 10, 30, 20, 10]);
    }

    #[test]
    fn stops_at_event_limit() {
        let mut s = session(
            vec![MockBoard::new(1), MockBoard::new(2)],
            settings(3, 60),
            ManualClock::new(),
            CancelToken::new(),
        );
        let summary = s.run().unwrap();
        assert_eq!(summary.reason, StopReason::MaxEvents);
        assert_eq!(summary.events, 3);

        let bytes = s.into_output();
        assert_eq!(summary.bytes, bytes.len() as u64);
        let records = decode(&bytes);
        assert!(matches!(records[0], Record::TimeCalibration(_)));
        assert_eq!(event_serials(&records), vec![1, 2, 3]);
    }

    #[test]
    fn spurious_trigger_is_retried_without_output() {
        let log = shared_log();
        // wait: idle at once; readout: board 0 ok, then busy before board 1
        let master = MockBoard::new(1)
            .with_log(&log)
            .with_busy_script([false, false, true]);
        let slave = MockBoard::new(2).with_log(&log);
        let mut s = session(
            vec![master, slave],
            settings(2, 60),
            ManualClock::new(),
            CancelToken::new(),
        );
        let summary = s.run().unwrap();
        assert_eq!(summary.events, 2);
        assert_eq!(summary.spurious, 1);

        // the slave of the spurious cycle was never read
        let slave_transfers = log
            .borrow()
            .iter()
            .filter(|(serial, c)| *serial == 2 && *c == Call::TransferWaves)
            .count();
        assert_eq!(slave_transfers, 2);

        let records = decode(&s.into_output());
        assert_eq!(records.len(), 3);
        assert_eq!(event_serials(&records), vec![1, 2]);
    }

    #[test]
    fn timeout_while_waiting_stops_exactly_at_limit() {
        let clock = ManualClock::new();
        let master = MockBoard::new(1).always_busy();
        let mut s = session(vec![master], settings(10, 5), clock.clone(), CancelToken::new());
        let summary = s.run().unwrap();
        assert_eq!(summary.reason, StopReason::Timeout);
        assert_eq!(summary.events, 0);
        assert_eq!(summary.elapsed, Duration::from_secs(5));
        assert_eq!(clock.now(), Duration::from_secs(5));
        assert!(s.into_output().is_empty());
    }

    #[test]
    fn timeout_between_events() {
        let clock = ManualClock::new();
        // one second passes per arming of the master
        let master = MockBoard::new(1).with_clock_step(&clock, Duration::from_secs(1));
        let mut s = session(vec![master], settings(100, 5), clock.clone(), CancelToken::new());
        let summary = s.run().unwrap();
        assert_eq!(summary.reason, StopReason::Timeout);
        assert_eq!(summary.elapsed, Duration::from_secs(5));
        assert_eq!(summary.events, 5);
        assert_eq!(event_serials(&decode(&s.into_output())), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn endless_fake_triggers_end_at_time_limit() {
        let clock = ManualClock::new();
        // every trigger is followed by the master going busy during readout
        let script = [false, true].repeat(50);
        let master = MockBoard::new(1)
            .with_busy_script(script)
            .with_clock_step(&clock, Duration::from_secs(1));
        let mut s = session(vec![master], settings(10, 5), clock, CancelToken::new());
        let summary = s.run().unwrap();
        assert_eq!(summary.reason, StopReason::Timeout);
        assert_eq!(summary.events, 0);
        assert_eq!(summary.spurious, 5);
        assert_eq!(summary.elapsed, Duration::from_secs(5));
        assert!(s.into_output().is_empty());
    }

    #[test]
    fn event_limit_wins_when_reached_first() {
        let clock = ManualClock::new();
        let master = MockBoard::new(1).with_clock_step(&clock, Duration::from_secs(1));
        let mut s = session(vec![master], settings(5, 5), clock, CancelToken::new());
        let summary = s.run().unwrap();
        assert_eq!(summary.reason, StopReason::MaxEvents);
        assert_eq!(summary.events, 5);
    }

    #[test]
    fn cancellation_leaves_complete_records() {
        let cancel = CancelToken::new();
        let master = MockBoard::new(1).cancel_on_arm(&cancel, 4);
        let mut s = session(
            vec![master, MockBoard::new(2)],
            settings(100, 60),
            ManualClock::new(),
            cancel,
        );
        let summary = s.run().unwrap();
        assert_eq!(summary.reason, StopReason::Cancelled);
        assert_eq!(summary.events, 3);

        let bytes = s.into_output();
        let mut decoder = EventDecoder::new(&bytes);
        let records: Vec<Record> = decoder.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(decoder.position(), bytes.len());
        assert_eq!(event_serials(&records), vec![1, 2, 3]);
    }

    #[test]
    fn cancelled_before_start_writes_nothing() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let log = shared_log();
        let mut s = session(
            vec![MockBoard::new(1).with_log(&log)],
            settings(10, 60),
            ManualClock::new(),
            cancel,
        );
        assert_eq!(s.run().unwrap().reason, StopReason::Cancelled);
        assert!(!log.borrow().iter().any(|(_, c)| *c == Call::StartDomino));
        assert!(s.into_output().is_empty());
    }

    #[test]
    fn chain_is_closed_after_run() {
        let log = shared_log();
        let mut s = session(
            vec![MockBoard::new(1).with_log(&log), MockBoard::new(2).with_log(&log)],
            settings(1, 60),
            ManualClock::new(),
            CancelToken::new(),
        );
        s.run().unwrap();
        s.into_output();
        let closed = log.borrow().iter().filter(|(_, c)| *c == Call::Close).count();
        assert_eq!(closed, 2);
    }

    #[test]
    fn board_fault_aborts_run() {
        let mut s = session(
            vec![MockBoard::new(1).failing_transfer()],
            settings(3, 60),
            ManualClock::new(),
            CancelToken::new(),
        );
        assert!(matches!(s.run(), Err(DaqError::Board(_))));
        assert!(s.into_output().is_empty());
    }
}
