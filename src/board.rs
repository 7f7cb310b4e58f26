//! The hardware collaborator: what the acquisition needs from a DRS4 board.
//!
//! USB access, firmware communication and the voltage/timing calibration live
//! in the vendor library; implementations of [`Board`] wrap it. The crate
//! ships a simulated backend in [`crate::sim`].

use crate::{
    configure_trigger, sample_window_ns, BoardSettings, DaqError, TriggerSpec,
    MIN_TRIGGER_BOARD_TYPE,
};
use log::{info, warn};

/// Analog input channels per board.
pub const N_CHANNELS: usize = 4;
/// Bins per channel in the output stream.
pub const N_BINS: usize = 1024;

/// Slaves can follow the master's reference clock from this firmware on.
pub const REFCLK_MIN_FIRMWARE: u32 = 21260;
/// Scaler input that counts the external reference clock.
pub const REFCLK_SCALER: u8 = 5;
/// Scaler rate above which the external clock is considered connected.
pub const REFCLK_MIN_RATE: u32 = 300_000;

/// One DRS4 evaluation board.
///
/// All calls block until the board has answered.
pub trait Board {
    fn serial_number(&self) -> u16;
    fn firmware_version(&self) -> u32;
    /// Board generation; 8 and up are V4 boards and later.
    fn board_type(&self) -> u8;
    /// Bins per channel the board delivers, 2048 when channels are cascaded.
    fn channel_depth(&self) -> usize;
    /// Number of DRS channels cascaded per input, 1 or 2.
    fn channel_cascading(&self) -> u8;

    fn init(&mut self) -> Result<(), DaqError>;
    fn scaler(&mut self, input: u8) -> Result<u32, DaqError>;
    fn set_refclk(&mut self, external: bool) -> Result<(), DaqError>;
    /// Sampling speed in GS/s; `wait` blocks until the PLL has locked.
    fn set_frequency(&mut self, gsps: f64, wait: bool) -> Result<(), DaqError>;
    fn set_input_range(&mut self, center: f64) -> Result<(), DaqError>;

    fn enable_trigger(&mut self, hardware: bool, analog: bool) -> Result<(), DaqError>;
    fn set_transparent_mode(&mut self, on: bool) -> Result<(), DaqError>;
    /// `channel` counts from 1.
    fn set_individual_trigger_level(&mut self, channel: u8, volts: f64) -> Result<(), DaqError>;
    fn set_trigger_source(&mut self, mask: u16) -> Result<(), DaqError>;
    fn set_trigger_polarity(&mut self, falling: bool) -> Result<(), DaqError>;
    fn set_trigger_delay_ns(&mut self, delay: f64) -> Result<(), DaqError>;

    fn start_domino(&mut self) -> Result<(), DaqError>;
    /// True while the domino wave runs, i.e. no trigger has arrived yet.
    fn is_busy(&mut self) -> Result<bool, DaqError>;

    /// Copy the raw sample memory of all chip channels into `raw`.
    fn transfer_waves(&mut self, raw: &mut Vec<u8>) -> Result<(), DaqError>;
    fn stop_cell(&mut self) -> Result<u16, DaqError>;
    fn stop_wsr(&mut self) -> Result<u8, DaqError>;
    /// Decode chip channel `chip_channel` of `raw` into calibrated millivolts,
    /// rotated so that `out[0]` is the first sample after the stop cell.
    fn decode_wave(
        &mut self,
        raw: &[u8],
        chip_channel: u8,
        trigger_cell: u16,
        write_sr: u8,
        out: &mut [f32],
    ) -> Result<(), DaqError>;
    /// Sample times in ns for a waveform that stopped at `trigger_cell`.
    fn get_time(&mut self, chip_channel: u8, trigger_cell: u16, out: &mut [f32])
        -> Result<(), DaqError>;
    /// Per-cell effective bin widths in ns, indexed by cell (1024 values).
    fn time_calibration(&mut self, chip_channel: u8, out: &mut [f32]) -> Result<(), DaqError>;

    /// Release the hardware connection.
    fn close(&mut self) -> Result<(), DaqError> {
        Ok(())
    }
}

/// Enumerates the boards attached to the host.
pub trait BoardDiscovery {
    type Board: Board;

    fn discover(&mut self) -> Result<Vec<Self::Board>, DaqError>;
}

/// Daisy chain of boards ordered by serial number. Index 0 is the master
/// which gates the trigger for the whole chain.
///
/// Dropping the chain closes every board.
#[derive(Debug)]
pub struct BoardChain<B: Board> {
    boards: Vec<B>,
}

impl<B: Board> BoardChain<B> {
    pub fn new(mut boards: Vec<B>) -> Result<Self, DaqError> {
        if boards.is_empty() {
            return Err(DaqError::NoBoards);
        }
        boards.sort_by_key(|b| b.serial_number());
        Ok(Self { boards })
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    pub fn master_mut(&mut self) -> &mut B {
        &mut self.boards[0]
    }

    pub fn boards(&self) -> &[B] {
        &self.boards
    }

    pub fn boards_mut(&mut self) -> &mut [B] {
        &mut self.boards
    }

    pub fn serials(&self) -> Vec<u16> {
        self.boards.iter().map(|b| b.serial_number()).collect()
    }
}

impl<B: Board> Drop for BoardChain<B> {
    fn drop(&mut self) {
        for board in &mut self.boards {
            if let Err(e) = board.close() {
                warn!("Closing board #{}: {e}", board.serial_number());
            }
        }
    }
}

pub fn log_board_info<B: Board>(boards: &[B]) {
    for board in boards {
        info!(
            "Found DRS4 evaluation board, serial #{}, firmware revision {}, board type {}",
            board.serial_number(),
            board.firmware_version(),
            board.board_type()
        );
    }
}

/// Bring up a freshly discovered set of boards and build the chain.
///
/// Boards that cannot trigger are closed and dropped before anything is
/// configured, so the master and slave roles follow the final chain order.
/// The run only fails when no board is left.
pub fn configure_chain<B: Board>(
    boards: Vec<B>,
    settings: &BoardSettings,
    trigger: &TriggerSpec,
) -> Result<BoardChain<B>, DaqError> {
    let window = sample_window_ns(settings.sample_speed);
    trigger.validate(window)?;

    if boards.is_empty() {
        return Err(DaqError::NoBoards);
    }
    log_board_info(&boards);

    let (usable, rejected): (Vec<B>, Vec<B>) = boards
        .into_iter()
        .partition(|b| b.board_type() >= MIN_TRIGGER_BOARD_TYPE);
    let mut last_rejection = None;
    for mut board in rejected {
        let err = DaqError::IncompatibleBoard {
            serial: board.serial_number(),
            board_type: board.board_type(),
        };
        warn!("Skipping board: {err}");
        if let Err(e) = board.close() {
            warn!("Closing board #{}: {e}", board.serial_number());
        }
        last_rejection = Some(err);
    }
    if usable.is_empty() {
        return Err(last_rejection.unwrap_or(DaqError::NoBoards));
    }

    let mut chain = BoardChain::new(usable)?;
    for (i, board) in chain.boards.iter_mut().enumerate() {
        board.init()?;

        // slaves follow the master's clock when the clock chain is connected
        if i > 0
            && board.firmware_version() >= REFCLK_MIN_FIRMWARE
            && board.scaler(REFCLK_SCALER)? > REFCLK_MIN_RATE
        {
            info!("Board #{}: using external reference clock", board.serial_number());
            board.set_refclk(true)?;
        }

        board.set_frequency(settings.sample_speed, true)?;
        board.set_input_range(settings.range_center)?;
        configure_trigger(board, trigger, window)?;
    }
    Ok(chain)
}
