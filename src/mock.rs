//! Scriptable board and clock for unit tests.

use crate::{Board, CancelToken, Clock, DaqError, Timestamp, N_BINS};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Init,
    SetRefclk(bool),
    SetFrequency(f64),
    SetInputRange(f64),
    EnableTrigger(bool, bool),
    TransparentMode(bool),
    TriggerLevel(u8, f64),
    TriggerSource(u16),
    TriggerPolarity(bool),
    TriggerDelay(f64),
    StartDomino,
    TransferWaves,
    Close,
}

/// Calls of several boards in the order they happened, tagged with the serial.
pub type SharedLog = Rc<RefCell<Vec<(u16, Call)>>>;

pub fn shared_log() -> SharedLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// Simulated time that only moves when someone sleeps or a board ticks it.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<Duration>>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, step: Duration) {
        self.0.set(self.0.get() + step);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.0.get()
    }

    fn timestamp(&self) -> Timestamp {
        let ms = self.0.get().as_millis();
        Timestamp {
            year: 2024,
            month: 1,
            day: 1,
            second: (ms / 1000 % 60) as u16,
            millisecond: (ms % 1000) as u16,
            ..Default::default()
        }
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Debug)]
pub struct MockBoard {
    serial: u16,
    board_type: u8,
    firmware: u32,
    depth: usize,
    cascading: u8,
    scaler: u32,
    stop_cell: u16,
    calls: Vec<Call>,
    log: Option<SharedLog>,
    busy: VecDeque<bool>,
    always_busy: bool,
    clock_step: Option<(ManualClock, Duration)>,
    cancel_on_arm: Option<(CancelToken, usize)>,
    armed: usize,
    fail_transfer: bool,
}

impl MockBoard {
    /// A V4 board with firmware new enough for the clock chain and no
    /// reference clock on its scaler.
    pub fn new(serial: u16) -> Self {
        Self {
            serial,
            board_type: 9,
            firmware: 30000,
            depth: N_BINS,
            cascading: 1,
            scaler: 0,
            stop_cell: 0,
            calls: Vec::new(),
            log: None,
            busy: VecDeque::new(),
            always_busy: false,
            clock_step: None,
            cancel_on_arm: None,
            armed: 0,
            fail_transfer: false,
        }
    }

    pub fn with_log(mut self, log: &SharedLog) -> Self {
        self.log = Some(Rc::clone(log));
        self
    }

    pub fn with_board_type(mut self, board_type: u8) -> Self {
        self.board_type = board_type;
        self
    }

    pub fn with_firmware(mut self, firmware: u32) -> Self {
        self.firmware = firmware;
        self
    }

    pub fn with_scaler(mut self, rate: u32) -> Self {
        self.scaler = rate;
        self
    }

    pub fn with_stop_cell(mut self, cell: u16) -> Self {
        self.stop_cell = cell;
        self
    }

    pub fn with_cascading(mut self) -> Self {
        self.depth = 2 * N_BINS;
        self.cascading = 2;
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Answers of successive `is_busy` calls; not busy once exhausted.
    pub fn with_busy_script(mut self, script: impl IntoIterator<Item = bool>) -> Self {
        self.busy = script.into_iter().collect();
        self
    }

    pub fn always_busy(mut self) -> Self {
        self.always_busy = true;
        self
    }

    /// Advance `clock` by `step` every time the board is armed.
    pub fn with_clock_step(mut self, clock: &ManualClock, step: Duration) -> Self {
        self.clock_step = Some((clock.clone(), step));
        self
    }

    /// On the `nth` arming, cancel `token` and never trigger again.
    pub fn cancel_on_arm(mut self, token: &CancelToken, nth: usize) -> Self {
        self.cancel_on_arm = Some((token.clone(), nth));
        self
    }

    pub fn failing_transfer(mut self) -> Self {
        self.fail_transfer = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.clone()
    }

    /// What `decode_wave` delivers for `chip_channel` at a depth of `len` bins.
    pub fn wave(chip_channel: u8, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i % 97) as f32 * 0.5 - 20.0 + chip_channel as f32 * 3.0)
            .collect()
    }

    /// What `get_time` delivers for `chip_channel` stopped at `trigger_cell`.
    pub fn times(chip_channel: u8, trigger_cell: u16, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 + trigger_cell as f32 * 0.01) * 0.2 + chip_channel as f32 * 1000.0)
            .collect()
    }

    /// What `time_calibration` delivers for `chip_channel`.
    pub fn tcal(chip_channel: u8) -> Vec<f32> {
        (0..N_BINS)
            .map(|i| 0.2 + (i % 13) as f32 * 0.001 + chip_channel as f32 * 0.0001)
            .collect()
    }

    fn record(&mut self, call: Call) {
        if let Some(log) = &self.log {
            log.borrow_mut().push((self.serial, call.clone()));
        }
        self.calls.push(call);
    }
}

impl Board for MockBoard {
    fn serial_number(&self) -> u16 {
        self.serial
    }

    fn firmware_version(&self) -> u32 {
        self.firmware
    }

    fn board_type(&self) -> u8 {
        self.board_type
    }

    fn channel_depth(&self) -> usize {
        self.depth
    }

    fn channel_cascading(&self) -> u8 {
        self.cascading
    }

    fn init(&mut self) -> Result<(), DaqError> {
        self.record(Call::Init);
        Ok(())
    }

    fn scaler(&mut self, _input: u8) -> Result<u32, DaqError> {
        Ok(self.scaler)
    }

    fn set_refclk(&mut self, external: bool) -> Result<(), DaqError> {
        self.record(Call::SetRefclk(external));
        Ok(())
    }

    fn set_frequency(&mut self, gsps: f64, _wait: bool) -> Result<(), DaqError> {
        self.record(Call::SetFrequency(gsps));
        Ok(())
    }

    fn set_input_range(&mut self, center: f64) -> Result<(), DaqError> {
        self.record(Call::SetInputRange(center));
        Ok(())
    }

    fn enable_trigger(&mut self, hardware: bool, analog: bool) -> Result<(), DaqError> {
        self.record(Call::EnableTrigger(hardware, analog));
        Ok(())
    }

    fn set_transparent_mode(&mut self, on: bool) -> Result<(), DaqError> {
        self.record(Call::TransparentMode(on));
        Ok(())
    }

    fn set_individual_trigger_level(&mut self, channel: u8, volts: f64) -> Result<(), DaqError> {
        self.record(Call::TriggerLevel(channel, volts));
        Ok(())
    }

    fn set_trigger_source(&mut self, mask: u16) -> Result<(), DaqError> {
        self.record(Call::TriggerSource(mask));
        Ok(())
    }

    fn set_trigger_polarity(&mut self, falling: bool) -> Result<(), DaqError> {
        self.record(Call::TriggerPolarity(falling));
        Ok(())
    }

    fn set_trigger_delay_ns(&mut self, delay: f64) -> Result<(), DaqError> {
        self.record(Call::TriggerDelay(delay));
        Ok(())
    }

    fn start_domino(&mut self) -> Result<(), DaqError> {
        self.record(Call::StartDomino);
        self.armed += 1;
        if let Some((clock, step)) = &self.clock_step {
            clock.advance(*step);
        }
        if let Some((token, nth)) = &self.cancel_on_arm {
            if self.armed == *nth {
                token.cancel();
                self.always_busy = true;
            }
        }
        Ok(())
    }

    fn is_busy(&mut self) -> Result<bool, DaqError> {
        if self.always_busy {
            return Ok(true);
        }
        Ok(self.busy.pop_front().unwrap_or(false))
    }

    fn transfer_waves(&mut self, raw: &mut Vec<u8>) -> Result<(), DaqError> {
        self.record(Call::TransferWaves);
        if self.fail_transfer {
            return Err(DaqError::Board(format!("board #{} stopped responding", self.serial)));
        }
        raw.clear();
        raw.resize(16, 0);
        Ok(())
    }

    fn stop_cell(&mut self) -> Result<u16, DaqError> {
        Ok(self.stop_cell)
    }

    fn stop_wsr(&mut self) -> Result<u8, DaqError> {
        Ok(0)
    }

    fn decode_wave(
        &mut self,
        _raw: &[u8],
        chip_channel: u8,
        _trigger_cell: u16,
        _write_sr: u8,
        out: &mut [f32],
    ) -> Result<(), DaqError> {
        out.copy_from_slice(&Self::wave(chip_channel, out.len()));
        Ok(())
    }

    fn get_time(
        &mut self,
        chip_channel: u8,
        trigger_cell: u16,
        out: &mut [f32],
    ) -> Result<(), DaqError> {
        out.copy_from_slice(&Self::times(chip_channel, trigger_cell, out.len()));
        Ok(())
    }

    fn time_calibration(&mut self, chip_channel: u8, out: &mut [f32]) -> Result<(), DaqError> {
        out.copy_from_slice(&Self::tcal(chip_channel));
        Ok(())
    }

    fn close(&mut self) -> Result<(), DaqError> {
        self.record(Call::Close);
        Ok(())
    }
}
