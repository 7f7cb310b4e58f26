//! Trigger configuration of a single board.

use crate::{Board, DaqError, TriggerEdge, TriggerLogic, TriggerSettings, N_BINS, N_CHANNELS};
use log::debug;

/// Four analog channels plus the external trigger input.
pub const N_SOURCES: usize = N_CHANNELS + 1;

/// Boards older than the V4 evaluation board cannot trigger in hardware.
pub const MIN_TRIGGER_BOARD_TYPE: u8 = 8;

/// Bit offset of the AND sources in the source register.
const AND_SHIFT: usize = 8;

/// Length of the sample window in ns for a sampling speed in GS/s.
pub fn sample_window_ns(sample_speed: f64) -> f64 {
    N_BINS as f64 / sample_speed
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerSpec {
    pub edge: TriggerEdge,
    pub logic: TriggerLogic,
    pub sources: [bool; N_SOURCES],
    pub levels: [f64; N_CHANNELS],
    pub delay_ns: f64,
}

impl From<&TriggerSettings> for TriggerSpec {
    fn from(settings: &TriggerSettings) -> Self {
        Self {
            edge: settings.edge,
            logic: settings.logic,
            sources: settings.sources,
            levels: settings.levels,
            delay_ns: settings.delay_ns,
        }
    }
}

impl TriggerSpec {
    /// Source register value. OR sources occupy bits 0..5, AND sources bits 8..13.
    pub fn source_mask(&self) -> u16 {
        let shift = match self.logic {
            TriggerLogic::Or => 0,
            TriggerLogic::And => AND_SHIFT,
        };
        self.sources
            .iter()
            .enumerate()
            .filter(|(_, &enabled)| enabled)
            .fold(0u16, |mask, (i, _)| mask | (1 << (i + shift)))
    }

    /// The delay register counts back from the end of the window.
    pub fn hardware_delay_ns(&self, sample_window: f64) -> f64 {
        sample_window - self.delay_ns
    }

    pub fn validate(&self, sample_window: f64) -> Result<(), DaqError> {
        if (0.0..=sample_window).contains(&self.delay_ns) {
            Ok(())
        } else {
            Err(DaqError::InvalidConfig(format!(
                "trigger delay {} ns outside the {sample_window} ns sample window",
                self.delay_ns
            )))
        }
    }
}

/// Program `board` with `spec`.
///
/// Pre-V4 boards are rejected with [`DaqError::IncompatibleBoard`] before any
/// setter is called, so the caller can drop that board and carry on.
pub fn configure_trigger<B: Board>(
    board: &mut B,
    spec: &TriggerSpec,
    sample_window: f64,
) -> Result<(), DaqError> {
    let board_type = board.board_type();
    if board_type < MIN_TRIGGER_BOARD_TYPE {
        return Err(DaqError::IncompatibleBoard {
            serial: board.serial_number(),
            board_type,
        });
    }
    spec.validate(sample_window)?;

    board.enable_trigger(true, false)?;
    // OR logic only combines sources correctly in transparent mode
    board.set_transparent_mode(true)?;

    for (i, &level) in spec.levels.iter().enumerate() {
        board.set_individual_trigger_level(i as u8 + 1, level)?;
    }

    let mask = spec.source_mask();
    let delay = spec.hardware_delay_ns(sample_window);
    board.set_trigger_source(mask)?;
    board.set_trigger_polarity(spec.edge == TriggerEdge::Fall)?;
    board.set_trigger_delay_ns(delay)?;

    debug!(
        "Board #{}: trigger source {:#06x}, {:?} edge, hardware delay {:.1} ns",
        board.serial_number(),
        mask,
        spec.edge,
        delay
    );
    Ok(())
}
