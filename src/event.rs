use crate::{N_BINS, N_CHANNELS};
use ndarray::Array3;
use time::OffsetDateTime;

/// Wall-clock time of an event, as stored in the event header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub year: u16,
    pub month: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub millisecond: u16,
}

impl Timestamp {
    /// Local time, or UTC when the local offset cannot be determined.
    pub fn now() -> Self {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        Self::from(now)
    }
}

impl From<OffsetDateTime> for Timestamp {
    fn from(dt: OffsetDateTime) -> Self {
        Self {
            year: dt.year() as u16,
            month: u8::from(dt.month()) as u16,
            day: dt.day() as u16,
            hour: dt.hour() as u16,
            minute: dt.minute() as u16,
            second: dt.second() as u16,
            millisecond: dt.millisecond(),
        }
    }
}

/// One acquisition cycle across the whole chain.
///
/// The session keeps a single `Event` and overwrites it every cycle, nothing
/// is retained once it has been encoded.
#[derive(Debug, Clone)]
pub struct Event {
    pub serial: u32,
    pub timestamp: Timestamp,
    /// Input range center in volts.
    pub range_center: f64,
    pub board_serials: Vec<u16>,
    /// Stop cell of every board.
    pub trigger_cells: Vec<u16>,
    pub write_srs: Vec<u8>,
    /// Calibrated voltages in mV, shape (boards, channels, bins).
    pub waveforms: Array3<f32>,
    /// Sample times in ns, same shape as `waveforms`.
    pub times: Array3<f32>,
}

impl Event {
    /// Create an event for a chain with the given board serials.
    ///
    /// # Arguments
    ///
    /// * `board_serials` - Serial numbers in chain order.
    /// * `range_center` - Input range center in volts.
    pub fn new(board_serials: Vec<u16>, range_center: f64) -> Self {
        let n_boards = board_serials.len();
        Self {
            serial: 0,
            timestamp: Timestamp::default(),
            range_center,
            board_serials,
            trigger_cells: vec![0; n_boards],
            write_srs: vec![0; n_boards],
            waveforms: Array3::zeros((n_boards, N_CHANNELS, N_BINS)),
            times: Array3::zeros((n_boards, N_CHANNELS, N_BINS)),
        }
    }
}

/// Time calibration of the chain: per board and channel the effective width
/// of every bin in ns.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationBlock {
    pub board_serials: Vec<u16>,
    /// Shape (boards, channels, bins).
    pub bin_widths: Array3<f32>,
}

impl CalibrationBlock {
    pub fn new(board_serials: Vec<u16>) -> Self {
        let n_boards = board_serials.len();
        Self {
            board_serials,
            bin_widths: Array3::zeros((n_boards, N_CHANNELS, N_BINS)),
        }
    }
}
