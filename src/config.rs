use crate::{sample_window_ns, DaqError, N_SOURCES, N_CHANNELS};
use confique::Config;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub board_settings: BoardSettings,
    #[config(nested)]
    pub trigger_settings: TriggerSettings,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    /// Number of events after which the run ends.
    #[config(default = 50, env = "DRS4_MAX_EVENTS")]
    pub max_events: u32,
    /// Wall-clock limit of the run in seconds.
    #[config(default = 5, env = "DRS4_MAX_TIME")]
    pub max_time: u64,
    #[config(default = ".", env = "DRS4_OUTPUT_DIR")]
    pub output_dir: String,
    /// Serial number of the first event; the time calibration block is
    /// written in front of it.
    #[config(default = 1)]
    pub first_serial: u32,
    /// Pause between busy polls of the master board, 0 spins.
    #[config(default = 100)]
    pub poll_interval_us: u64,
    #[config(default = false, env = "DRS4_SIMULATE")]
    pub simulate: bool,
    #[config(default = 1)]
    pub sim_boards: usize,
}

#[derive(Config, Debug, Clone)]
pub struct BoardSettings {
    /// Sampling speed in GS/s.
    #[config(default = 5.0)]
    pub sample_speed: f64,
    /// Center of the 1 V input window in volts (0.45 gives -0.05 V to 0.95 V).
    #[config(default = 0.45)]
    pub range_center: f64,
}

#[derive(Config, Debug, Clone)]
pub struct TriggerSettings {
    #[config(default = "Rise")]
    pub edge: TriggerEdge,
    #[config(default = "And")]
    pub logic: TriggerLogic,
    /// CH1, CH2, CH3, CH4, EXT
    #[config(default = [false, true, true, false, false])]
    pub sources: [bool; N_SOURCES],
    /// Per-channel thresholds in volts.
    #[config(default = [0.05, 0.05, 0.05, 0.05])]
    pub levels: [f64; N_CHANNELS],
    /// Trigger delay in ns, measured from the start of the sample window.
    #[config(default = 60.0)]
    pub delay_ns: f64,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerEdge {
    Fall,
    Rise,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerLogic {
    And,
    Or,
}

impl Conf {
    /// Layered load: environment, then the TOML file (skipped when absent),
    /// then defaults.
    pub fn load(path: &Path) -> Result<Self, DaqError> {
        let conf = Conf::builder()
            .env()
            .file(path)
            .load()
            .map_err(|e| DaqError::InvalidConfig(e.to_string()))?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<(), DaqError> {
        let run = &self.run_settings;
        let board = &self.board_settings;
        let trigger = &self.trigger_settings;

        if run.max_events == 0 {
            return Err(DaqError::InvalidConfig("max_events must be positive".into()));
        }
        if run.sim_boards == 0 {
            return Err(DaqError::InvalidConfig("sim_boards must be positive".into()));
        }
        if !(board.sample_speed.is_finite() && board.sample_speed > 0.0) {
            return Err(DaqError::InvalidConfig(format!(
                "sample_speed {} GS/s is not a positive rate",
                board.sample_speed
            )));
        }
        if !(-0.5..=0.5).contains(&board.range_center) {
            return Err(DaqError::InvalidConfig(format!(
                "range_center {} V outside -0.5..=0.5",
                board.range_center
            )));
        }
        if let Some(level) = trigger.levels.iter().find(|l| !l.is_finite()) {
            return Err(DaqError::InvalidConfig(format!("trigger level {level} is not finite")));
        }
        let window = sample_window_ns(board.sample_speed);
        if !(0.0..=window).contains(&trigger.delay_ns) {
            return Err(DaqError::InvalidConfig(format!(
                "trigger delay {} ns outside the {window} ns sample window",
                trigger.delay_ns
            )));
        }
        Ok(())
    }

    pub fn max_time(&self) -> Duration {
        Duration::from_secs(self.run_settings.max_time)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.run_settings.poll_interval_us)
    }
}
