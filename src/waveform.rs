//! Pulling waveforms off a board and conditioning them.

use crate::{Board, CalibrationBlock, DaqError, Event, N_BINS, N_CHANNELS};
use ndarray::{s, ArrayView1};

/// Output bin `j` is the mean of input bins `2j` and `2j + 1`.
///
/// Used when two DRS channels are cascaded and deliver 2048 bins.
pub fn cascade_average(input: &[f32], output: &mut [f32]) {
    assert_eq!(input.len(), 2 * output.len());
    for (out, pair) in output.iter_mut().zip(input.chunks_exact(2)) {
        *out = (pair[0] + pair[1]) / 2.0;
    }
}

/// Replace the first two bins, which follow the stop cell and are noisy,
/// by a linear extrapolation of bins 2 and 3.
pub fn extrapolate_leading(wave: &mut [f32]) {
    wave[1] = 2.0 * wave[2] - wave[3];
    wave[0] = 2.0 * wave[1] - wave[2];
}

/// Bring `depth` bins down to [`N_BINS`], averaging pairs for cascaded depth.
fn reduce_depth(input: &[f32], output: &mut [f32]) -> Result<(), DaqError> {
    match input.len() {
        N_BINS => output.copy_from_slice(input),
        n if n == 2 * N_BINS => cascade_average(input, output),
        n => return Err(DaqError::Board(format!("unsupported channel depth {n}"))),
    }
    Ok(())
}

/// Reads one board into the session's event buffers.
///
/// Owns the raw transfer buffer and the per-channel scratch space so nothing
/// is allocated per event.
#[derive(Debug, Default)]
pub struct WaveformReader {
    raw: Vec<u8>,
    scratch: Vec<f32>,
    reduced: Vec<f32>,
}

impl WaveformReader {
    pub fn new() -> Self {
        Self {
            raw: Vec::new(),
            scratch: vec![0.0; 2 * N_BINS],
            reduced: vec![0.0; N_BINS],
        }
    }

    /// Transfer and decode all channels of `board` into row `index` of `event`.
    pub fn read<B: Board>(
        &mut self,
        board: &mut B,
        index: usize,
        event: &mut Event,
    ) -> Result<(), DaqError> {
        board.transfer_waves(&mut self.raw)?;
        let trigger_cell = board.stop_cell()?;
        let write_sr = board.stop_wsr()?;
        event.trigger_cells[index] = trigger_cell;
        event.write_srs[index] = write_sr;

        let depth = board.channel_depth();
        let cascaded = board.channel_cascading() == 2;
        if depth > self.scratch.len() {
            return Err(DaqError::Board(format!("unsupported channel depth {depth}")));
        }

        for ch in 0..N_CHANNELS {
            // cascaded boards expose one chip channel per input, otherwise
            // inputs sit on every other chip channel
            let (chip_channel, wsr) = if cascaded {
                (ch as u8, write_sr)
            } else {
                (2 * ch as u8, 0)
            };

            // timing is calibrated on the even chip channels in both modes
            let scratch = &mut self.scratch[..depth];
            board.get_time(2 * ch as u8, trigger_cell, scratch)?;
            reduce_depth(scratch, &mut self.reduced)?;
            event
                .times
                .slice_mut(s![index, ch, ..])
                .assign(&ArrayView1::from(&self.reduced[..]));

            board.decode_wave(&self.raw, chip_channel, trigger_cell, wsr, scratch)?;
            reduce_depth(scratch, &mut self.reduced)?;
            extrapolate_leading(&mut self.reduced);
            event
                .waveforms
                .slice_mut(s![index, ch, ..])
                .assign(&ArrayView1::from(&self.reduced[..]));
        }
        Ok(())
    }
}

/// Collect the time calibration of every board in the chain.
///
/// The board reports one width per cell; cascaded boards get the mean of two
/// neighbouring cells per output bin, wrapping at the end of the ring.
pub fn read_time_calibration<B: Board>(boards: &mut [B]) -> Result<CalibrationBlock, DaqError> {
    let mut block = CalibrationBlock::new(boards.iter().map(|b| b.serial_number()).collect());
    let mut tcal = vec![0f32; N_BINS];
    for (index, board) in boards.iter_mut().enumerate() {
        let cascaded = board.channel_depth() == 2 * N_BINS;
        for ch in 0..N_CHANNELS {
            board.time_calibration(2 * ch as u8, &mut tcal)?;
            let mut row = block.bin_widths.slice_mut(s![index, ch, ..]);
            for (j, width) in row.iter_mut().enumerate() {
                *width = if cascaded {
                    (tcal[(2 * j) % N_BINS] + tcal[(2 * j + 1) % N_BINS]) / 2.0
                } else {
                    tcal[j]
                };
            }
        }
    }
    Ok(block)
}
