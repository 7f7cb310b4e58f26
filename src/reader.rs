//! Tag-driven decoder for the event file format written by [`crate::EventWriter`].

use crate::{DecodeError, Timestamp, BOARD_TAG, EVENT_TAG, N_BINS, TIME_TAG, TRIGGER_CELL_TAG};

/// Inverse of [`crate::encode_sample`]: 16 bit sample to mV.
pub fn to_millivolts(sample: u16, range_center: f64) -> f32 {
    ((sample as f64 / 65535.0 - 0.5 + range_center) * 1000.0) as f32
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCalibration {
    /// Channel number as tagged, counting from 1.
    pub channel: u16,
    pub bin_widths: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardCalibration {
    pub serial: u16,
    pub channels: Vec<ChannelCalibration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    /// Channel number as tagged, counting from 1.
    pub channel: u16,
    pub samples: Vec<u16>,
}

impl ChannelRecord {
    pub fn millivolts(&self, range_center: f64) -> Vec<f32> {
        self.samples
            .iter()
            .map(|&s| to_millivolts(s, range_center))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardRecord {
    pub serial: u16,
    pub trigger_cell: u16,
    pub channels: Vec<ChannelRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub serial: u32,
    pub timestamp: Timestamp,
    /// Input range center in mV.
    pub range_mv: i16,
    pub boards: Vec<BoardRecord>,
}

impl EventRecord {
    pub fn range_center(&self) -> f64 {
        self.range_mv as f64 / 1000.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    TimeCalibration(Vec<BoardCalibration>),
    Event(EventRecord),
}

/// Iterates over the records of an in-memory data file.
///
/// Stops after the first error.
pub struct EventDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> EventDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            failed: false,
        }
    }

    /// Byte offset of the next record.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.bytes.len() - self.pos;
        if available < n {
            return Err(DecodeError::StreamTooShort {
                pos: self.bytes.len(),
                needed: n - available,
            });
        }
        let bytes: &'a [u8] = self.bytes;
        let slice = &bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn peek_is(&self, tag: &[u8]) -> bool {
        self.bytes[self.pos..].starts_with(tag)
    }

    fn peek_channel(&self) -> bool {
        matches!(
            self.bytes.get(self.pos..self.pos + 4),
            Some([b'C', d0, d1, d2]) if d0.is_ascii_digit() && d1.is_ascii_digit() && d2.is_ascii_digit()
        )
    }

    fn expect_tag(&mut self, tag: &[u8]) -> Result<(), DecodeError> {
        let pos = self.pos;
        let found = self.take(tag.len())?;
        if found != tag {
            return Err(DecodeError::UnexpectedTag {
                pos,
                found: found.to_vec(),
            });
        }
        Ok(())
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn channel(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(4)?;
        Ok(b[1..]
            .iter()
            .fold(0u16, |n, d| n * 10 + (d - b'0') as u16))
    }

    fn calibration(&mut self) -> Result<Vec<BoardCalibration>, DecodeError> {
        self.expect_tag(TIME_TAG)?;
        let mut boards = Vec::new();
        while self.peek_is(BOARD_TAG) {
            self.pos += BOARD_TAG.len();
            let serial = self.u16()?;
            let mut channels = Vec::new();
            while self.peek_channel() {
                let channel = self.channel()?;
                let bin_widths = self
                    .take(4 * N_BINS)?
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                channels.push(ChannelCalibration {
                    channel,
                    bin_widths,
                });
            }
            boards.push(BoardCalibration { serial, channels });
        }
        Ok(boards)
    }

    fn event(&mut self) -> Result<EventRecord, DecodeError> {
        self.expect_tag(EVENT_TAG)?;
        let serial = self.u32()?;
        let timestamp = Timestamp {
            year: self.u16()?,
            month: self.u16()?,
            day: self.u16()?,
            hour: self.u16()?,
            minute: self.u16()?,
            second: self.u16()?,
            millisecond: self.u16()?,
        };
        let range_mv = self.u16()? as i16;

        let mut boards = Vec::new();
        while self.peek_is(BOARD_TAG) {
            self.pos += BOARD_TAG.len();
            let serial = self.u16()?;
            self.expect_tag(TRIGGER_CELL_TAG)?;
            let trigger_cell = self.u16()?;
            let mut channels = Vec::new();
            while self.peek_channel() {
                let channel = self.channel()?;
                let samples = self
                    .take(2 * N_BINS)?
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                channels.push(ChannelRecord { channel, samples });
            }
            boards.push(BoardRecord {
                serial,
                trigger_cell,
                channels,
            });
        }
        Ok(EventRecord {
            serial,
            timestamp,
            range_mv,
            boards,
        })
    }

    fn record(&mut self) -> Result<Record, DecodeError> {
        if self.peek_is(TIME_TAG) {
            self.calibration().map(Record::TimeCalibration)
        } else if self.peek_is(EVENT_TAG) {
            self.event().map(Record::Event)
        } else {
            let end = (self.pos + 4).min(self.bytes.len());
            Err(DecodeError::UnexpectedTag {
                pos: self.pos,
                found: self.bytes[self.pos..end].to_vec(),
            })
        }
    }
}

impl Iterator for EventDecoder<'_> {
    type Item = Result<Record, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.bytes.len() {
            return None;
        }
        let record = self.record();
        self.failed = record.is_err();
        Some(record)
    }
}
