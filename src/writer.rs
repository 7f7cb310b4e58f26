//! Binary event file encoder.
//!
//! Little-endian, append-only, with ASCII tags in front of every section:
//!
//! ```text
//! "TIME"                                        once, before the first event
//!   per board:   "B#" u16 serial
//!     per channel: "C001".."C004" 1024 x f32 bin width (ns)
//! "EHDR" u32 serial, u16 year month day hour minute second millisecond,
//!        i16 input range center (mV)
//!   per board:   "B#" u16 serial, "T#" u16 trigger cell
//!     per channel: "C001".."C004" 1024 x u16 sample
//! ```
//!
//! A sample `u` maps to `(u / 65535 - 0.5 + range) V`, so 0 is the bottom and
//! 65535 the top of the 1 V input window.

use crate::{CalibrationBlock, DaqError, Event, N_BINS, N_CHANNELS};
use ndarray::s;
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub const TIME_TAG: &[u8; 4] = b"TIME";
pub const EVENT_TAG: &[u8; 4] = b"EHDR";
pub const BOARD_TAG: &[u8; 2] = b"B#";
pub const TRIGGER_CELL_TAG: &[u8; 2] = b"T#";

/// Tag for channel `ch` counting from 0, written as `C001` for the first channel.
pub fn channel_tag(ch: usize) -> [u8; 4] {
    let n = ch + 1;
    [
        b'C',
        b'0' + (n / 100 % 10) as u8,
        b'0' + (n / 10 % 10) as u8,
        b'0' + (n % 10) as u8,
    ]
}

/// Bytes of the time calibration block.
pub fn calibration_block_len(n_boards: usize, n_channels: usize, n_bins: usize) -> usize {
    4 + n_boards * (4 + n_channels * (4 + n_bins * 4))
}

/// Bytes of one event record.
pub fn event_record_len(n_boards: usize, n_channels: usize, n_bins: usize) -> usize {
    24 + n_boards * (8 + n_channels * (4 + n_bins * 2))
}

/// Scale a voltage in mV to the 16 bit window around `range_center` (V).
pub fn encode_sample(millivolts: f32, range_center: f64) -> u16 {
    let scaled = ((millivolts as f64 / 1000.0 - range_center) + 0.5) * 65535.0;
    scaled.round().clamp(0.0, 65535.0) as u16
}

/// Range center as stored in the event header, in mV.
pub fn encode_range(range_center: f64) -> i16 {
    (range_center * 1000.0).round() as i16
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Serializes events of a fixed chain topology into a reusable buffer.
///
/// The buffer is sized once from (boards, channels, bins); a record whose
/// length disagrees with that topology is refused and nothing is written.
#[derive(Debug)]
pub struct EventEncoder {
    n_boards: usize,
    first_serial: u32,
    calibration: Option<CalibrationBlock>,
    buffer: Vec<u8>,
}

impl EventEncoder {
    pub fn new(n_boards: usize, first_serial: u32) -> Self {
        let capacity = calibration_block_len(n_boards, N_CHANNELS, N_BINS)
            + event_record_len(n_boards, N_CHANNELS, N_BINS);
        Self {
            n_boards,
            first_serial,
            calibration: None,
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Emit `calibration` in front of the event whose serial equals the first serial.
    pub fn with_calibration(mut self, calibration: CalibrationBlock) -> Self {
        self.calibration = Some(calibration);
        self
    }

    /// Bytes the record for `serial` will take.
    pub fn record_len(&self, serial: u32) -> usize {
        let mut len = event_record_len(self.n_boards, N_CHANNELS, N_BINS);
        if self.emits_calibration(serial) {
            len += calibration_block_len(self.n_boards, N_CHANNELS, N_BINS);
        }
        len
    }

    fn emits_calibration(&self, serial: u32) -> bool {
        serial == self.first_serial && self.calibration.is_some()
    }

    /// Serialize `event` (and the calibration block if due) into the internal
    /// buffer and return it.
    pub fn encode(&mut self, event: &Event) -> Result<&[u8], DaqError> {
        let expected = self.record_len(event.serial);
        self.buffer.clear();

        if self.emits_calibration(event.serial) {
            if let Some(calibration) = &self.calibration {
                encode_calibration(&mut self.buffer, calibration);
            }
        }
        encode_event(&mut self.buffer, event);

        if self.buffer.len() != expected {
            return Err(DaqError::EncodingMismatch {
                expected,
                actual: self.buffer.len(),
            });
        }
        Ok(&self.buffer)
    }
}

fn encode_calibration(buf: &mut Vec<u8>, calibration: &CalibrationBlock) {
    buf.extend_from_slice(TIME_TAG);
    for (b, &serial) in calibration.board_serials.iter().enumerate() {
        buf.extend_from_slice(BOARD_TAG);
        put_u16(buf, serial);
        for ch in 0..calibration.bin_widths.dim().1 {
            buf.extend_from_slice(&channel_tag(ch));
            for &width in calibration.bin_widths.slice(s![b, ch, ..]) {
                buf.extend_from_slice(&width.to_le_bytes());
            }
        }
    }
}

fn encode_event(buf: &mut Vec<u8>, event: &Event) {
    let ts = &event.timestamp;
    buf.extend_from_slice(EVENT_TAG);
    buf.extend_from_slice(&event.serial.to_le_bytes());
    for field in [
        ts.year,
        ts.month,
        ts.day,
        ts.hour,
        ts.minute,
        ts.second,
        ts.millisecond,
    ] {
        put_u16(buf, field);
    }
    buf.extend_from_slice(&encode_range(event.range_center).to_le_bytes());

    for (b, &serial) in event.board_serials.iter().enumerate() {
        buf.extend_from_slice(BOARD_TAG);
        put_u16(buf, serial);
        buf.extend_from_slice(TRIGGER_CELL_TAG);
        put_u16(buf, event.trigger_cells[b]);
        for ch in 0..event.waveforms.dim().1 {
            buf.extend_from_slice(&channel_tag(ch));
            for &mv in event.waveforms.slice(s![b, ch, ..]) {
                put_u16(buf, encode_sample(mv, event.range_center));
            }
        }
    }
}

/// Appends encoded events to an output stream, one write per record.
pub struct EventWriter<W: Write> {
    out: W,
    encoder: EventEncoder,
    pub records: usize,
    pub bytes_written: u64,
}

impl EventWriter<File> {
    pub fn create(path: &Path, encoder: EventEncoder) -> Result<Self, DaqError> {
        let file = File::create(path)?;
        Ok(Self::new(file, encoder))
    }
}

impl<W: Write> EventWriter<W> {
    pub fn new(out: W, encoder: EventEncoder) -> Self {
        Self {
            out,
            encoder,
            records: 0,
            bytes_written: 0,
        }
    }

    /// Encode and write one event, returning the number of bytes written.
    pub fn append_event(&mut self, event: &Event) -> Result<usize, DaqError> {
        let record = self.encoder.encode(event)?;
        self.out.write_all(record)?;
        self.records += 1;
        self.bytes_written += record.len() as u64;
        Ok(record.len())
    }

    pub fn flush(&mut self) -> Result<(), DaqError> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
