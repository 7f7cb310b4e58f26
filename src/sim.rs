//! Software stand-in for a chain of DRS4 boards.
//!
//! Each board produces a pulse on every channel on top of gaussian-ish noise,
//! going towards the side of the input window with more headroom. It triggers
//! after a random number of busy polls and now and then re-arms itself while
//! being read, like a noisy hardware trigger would.

use crate::{Board, BoardDiscovery, DaqError, N_BINS, N_CHANNELS};
use log::debug;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

/// Chip channels per DRS4 chip; inputs sit on the even ones.
const CHIP_CHANNELS: usize = 2 * N_CHANNELS;
const FULL_SCALE: f64 = 65535.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimParams {
    /// Upper bound on the busy polls before a trigger arrives.
    pub max_busy_polls: u32,
    /// Chance that the master reports busy again during readout.
    pub spurious_rate: f64,
    /// RMS noise in mV.
    pub noise_mv: f32,
    /// Pulse amplitude range in mV, limited to the headroom of the window.
    pub amplitude_mv: (f32, f32),
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            max_busy_polls: 20,
            spurious_rate: 0.01,
            noise_mv: 2.0,
            amplitude_mv: (50.0, 400.0),
        }
    }
}

#[derive(Debug)]
pub struct SimBoard {
    serial: u16,
    params: SimParams,
    rng: StdRng,
    gsps: f64,
    range_center: f64,
    trigger_delay_ns: f64,
    armed: bool,
    busy_polls: u32,
    stop_cell: u16,
    /// Effective width of every cell in ns, per chip channel.
    bin_widths: Vec<Vec<f32>>,
}

impl SimBoard {
    pub fn new(serial: u16, params: SimParams, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed ^ u64::from(serial));
        // cell-to-cell spread of a few percent, fixed per board
        let bin_widths = (0..CHIP_CHANNELS)
            .map(|_| (0..N_BINS).map(|_| rng.random_range(0.97..1.03)).collect())
            .collect();
        Self {
            serial,
            params,
            rng,
            gsps: 5.0,
            range_center: 0.0,
            trigger_delay_ns: 0.0,
            armed: false,
            busy_polls: 0,
            stop_cell: 0,
            bin_widths,
        }
    }

    fn nominal_width(&self) -> f32 {
        (1.0 / self.gsps) as f32
    }

    fn noise(&mut self) -> f32 {
        // sum of uniforms, close enough to a gaussian for test data
        let sum: f32 = (0..4).map(|_| self.rng.random_range(-1.0f32..1.0)).sum();
        sum * self.params.noise_mv * 0.866
    }

    fn to_adc(&self, millivolts: f32) -> u16 {
        let scaled = ((millivolts as f64 / 1000.0 - self.range_center) + 0.5) * FULL_SCALE;
        scaled.round().clamp(0.0, FULL_SCALE) as u16
    }

    fn to_millivolts(&self, adc: u16) -> f32 {
        ((adc as f64 / FULL_SCALE - 0.5 + self.range_center) * 1000.0) as f32
    }

    /// Pulse sign and the largest amplitude that fits the input window.
    /// Negative pulses for windows centered at or below 0 V.
    fn pulse_direction(&self) -> (f32, f32) {
        let center_mv = (self.range_center * 1000.0) as f32;
        if center_mv <= 0.0 {
            (-1.0, 500.0 - center_mv)
        } else {
            (1.0, 500.0 + center_mv)
        }
    }

    /// Bin where the pulse peaks: the trigger sits `delay` before the end
    /// of the window, counted back from the stop cell.
    fn pulse_bin(&self) -> f32 {
        let window = N_BINS as f64 / self.gsps;
        ((window - self.trigger_delay_ns) * self.gsps).clamp(0.0, N_BINS as f64 - 1.0) as f32
    }
}

impl Board for SimBoard {
    fn serial_number(&self) -> u16 {
        self.serial
    }

    fn firmware_version(&self) -> u32 {
        30000
    }

    fn board_type(&self) -> u8 {
        9
    }

    fn channel_depth(&self) -> usize {
        N_BINS
    }

    fn channel_cascading(&self) -> u8 {
        1
    }

    fn init(&mut self) -> Result<(), DaqError> {
        debug!("sim board #{}: init", self.serial);
        Ok(())
    }

    fn scaler(&mut self, _input: u8) -> Result<u32, DaqError> {
        Ok(0)
    }

    fn set_refclk(&mut self, external: bool) -> Result<(), DaqError> {
        debug!("sim board #{}: external reference clock {external}", self.serial);
        Ok(())
    }

    fn set_frequency(&mut self, gsps: f64, _wait: bool) -> Result<(), DaqError> {
        if gsps <= 0.0 {
            return Err(DaqError::Board(format!("invalid sampling speed {gsps} GS/s")));
        }
        self.gsps = gsps;
        Ok(())
    }

    fn set_input_range(&mut self, center: f64) -> Result<(), DaqError> {
        self.range_center = center;
        Ok(())
    }

    fn enable_trigger(&mut self, _hardware: bool, _analog: bool) -> Result<(), DaqError> {
        Ok(())
    }

    fn set_transparent_mode(&mut self, _on: bool) -> Result<(), DaqError> {
        Ok(())
    }

    fn set_individual_trigger_level(&mut self, _channel: u8, _volts: f64) -> Result<(), DaqError> {
        Ok(())
    }

    fn set_trigger_source(&mut self, _mask: u16) -> Result<(), DaqError> {
        Ok(())
    }

    fn set_trigger_polarity(&mut self, _falling: bool) -> Result<(), DaqError> {
        Ok(())
    }

    fn set_trigger_delay_ns(&mut self, delay: f64) -> Result<(), DaqError> {
        self.trigger_delay_ns = delay;
        Ok(())
    }

    fn start_domino(&mut self) -> Result<(), DaqError> {
        self.armed = true;
        self.busy_polls = self.rng.random_range(0..=self.params.max_busy_polls);
        Ok(())
    }

    fn is_busy(&mut self) -> Result<bool, DaqError> {
        if self.armed {
            if self.busy_polls > 0 {
                self.busy_polls -= 1;
                return Ok(true);
            }
            self.armed = false;
            self.stop_cell = self.rng.random_range(0..N_BINS as u16);
            return Ok(false);
        }
        Ok(self.rng.random_bool(self.params.spurious_rate))
    }

    /// Raw memory holds one u16 ADC word per cell for each chip channel.
    fn transfer_waves(&mut self, raw: &mut Vec<u8>) -> Result<(), DaqError> {
        raw.clear();
        raw.reserve(CHIP_CHANNELS * N_BINS * 2);
        let peak = self.pulse_bin();
        let (sign, headroom) = self.pulse_direction();
        // keep the peak plus noise inside the window
        let limit = (headroom * 0.9).max(0.0);
        let (lo, hi) = self.params.amplitude_mv;
        let (lo, hi) = (lo.min(limit), hi.min(limit));
        for _ in 0..CHIP_CHANNELS {
            let amplitude = sign * self.rng.random_range(lo..=hi);
            let jitter = self.rng.random_range(-5.0f32..5.0);
            for i in 0..N_BINS {
                let x = i as f32 - (peak + jitter);
                let pulse = if x >= 0.0 {
                    // fast rise, slower exponential tail
                    amplitude * (1.0 - (-x / 2.0).exp()) * (-x / 40.0).exp()
                } else {
                    0.0
                };
                let mv = pulse + self.noise();
                raw.extend_from_slice(&self.to_adc(mv).to_le_bytes());
            }
        }
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
        raw: &[u8],
        chip_channel: u8,
        _trigger_cell: u16,
        _write_sr: u8,
        out: &mut [f32],
    ) -> Result<(), DaqError> {
        let start = chip_channel as usize * N_BINS * 2;
        let words = raw
            .get(start..start + out.len() * 2)
            .ok_or_else(|| DaqError::Board(format!("no data for chip channel {chip_channel}")))?;
        for (v, word) in out.iter_mut().zip(words.chunks_exact(2)) {
            *v = self.to_millivolts(u16::from_le_bytes([word[0], word[1]]));
        }
        Ok(())
    }

    fn get_time(
        &mut self,
        chip_channel: u8,
        trigger_cell: u16,
        out: &mut [f32],
    ) -> Result<(), DaqError> {
        let widths = self
            .bin_widths
            .get(chip_channel as usize)
            .ok_or_else(|| DaqError::Board(format!("no chip channel {chip_channel}")))?;
        let nominal = self.nominal_width();
        let mut t = 0.0;
        for (i, time) in out.iter_mut().enumerate() {
            *time = t;
            t += widths[(trigger_cell as usize + i) % N_BINS] * nominal;
        }
        Ok(())
    }

    fn time_calibration(&mut self, chip_channel: u8, out: &mut [f32]) -> Result<(), DaqError> {
        let nominal = self.nominal_width();
        let widths = self
            .bin_widths
            .get(chip_channel as usize)
            .ok_or_else(|| DaqError::Board(format!("no chip channel {chip_channel}")))?;
        for (w, cell) in out.iter_mut().zip(widths) {
            *w = cell * nominal;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DaqError> {
        debug!("sim board #{}: closed", self.serial);
        Ok(())
    }
}

/// Hands out `n_boards` simulated boards in a shuffled order, as USB
/// enumeration would.
#[derive(Debug, Clone)]
pub struct SimDiscovery {
    pub n_boards: usize,
    pub params: SimParams,
    pub seed: u64,
}

impl SimDiscovery {
    pub fn new(n_boards: usize) -> Self {
        Self {
            n_boards,
            params: SimParams::default(),
            seed: 0x0d54,
        }
    }
}

impl BoardDiscovery for SimDiscovery {
    type Board = SimBoard;

    fn discover(&mut self) -> Result<Vec<SimBoard>, DaqError> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut serials: Vec<u16> = (0..self.n_boards as u16).map(|i| 2800 + i * 7).collect();
        serials.shuffle(&mut rng);
        Ok(serials
            .into_iter()
            .map(|serial| SimBoard::new(serial, self.params, self.seed))
            .collect())
    }
}
