use crate::ConfigError;
use serde::Deserialize;
use std::fmt;

/// Multiplier/divisor pair of the FPGA clock synthesizer.
///
/// With the 100 MHz board reference the SPI state machine runs at
/// `100 MHz * M / D / 2`, and one amplifier sample per channel takes
/// 2800 of those cycles (35 SPI commands of 80 cycles each). The PLL only
/// locks for `2 <= M <= 256`, `1 <= D <= 256` and `0.05 <= M/D <= 3.33`, so the
/// pairs come from a fixed table rather than being solved for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PllParams {
    m: u16,
    d: u16,
}

impl PllParams {
    const fn new(m: u16, d: u16) -> Self {
        Self { m, d }
    }

    pub fn multiplier(&self) -> u16 {
        self.m
    }

    pub fn divisor(&self) -> u16 {
        self.d
    }

    /// Wire-in word for the PLL register, M in the high byte.
    ///
    /// Only M = 256 would overflow the byte, and no table entry uses it.
    pub fn register_word(&self) -> u32 {
        256 * u32::from(self.m) + u32::from(self.d)
    }

    /// SPI state machine clock in Hz.
    pub fn clock_hz(&self) -> f64 {
        100.0e6 * f64::from(self.m) / f64::from(self.d) / 2.0
    }
}

/// Per-channel amplifier sample rates the firmware can be clocked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "u32")]
pub enum SampleRate {
    Hz1000,
    Hz1250,
    Hz1500,
    Hz2000,
    Hz2500,
    Hz3000,
    Hz3330,
    Hz4000,
    Hz5000,
    Hz6250,
    Hz8000,
    Hz10000,
    Hz12500,
    Hz15000,
    Hz20000,
    Hz25000,
    Hz30000,
}

impl SampleRate {
    pub const ALL: [SampleRate; 17] = [
        Self::Hz1000,
        Self::Hz1250,
        Self::Hz1500,
        Self::Hz2000,
        Self::Hz2500,
        Self::Hz3000,
        Self::Hz3330,
        Self::Hz4000,
        Self::Hz5000,
        Self::Hz6250,
        Self::Hz8000,
        Self::Hz10000,
        Self::Hz12500,
        Self::Hz15000,
        Self::Hz20000,
        Self::Hz25000,
        Self::Hz30000,
    ];

    pub fn hz(&self) -> u32 {
        match self {
            Self::Hz1000 => 1000,
            Self::Hz1250 => 1250,
            Self::Hz1500 => 1500,
            Self::Hz2000 => 2000,
            Self::Hz2500 => 2500,
            Self::Hz3000 => 3000,
            Self::Hz3330 => 3330,
            Self::Hz4000 => 4000,
            Self::Hz5000 => 5000,
            Self::Hz6250 => 6250,
            Self::Hz8000 => 8000,
            Self::Hz10000 => 10000,
            Self::Hz12500 => 12500,
            Self::Hz15000 => 15000,
            Self::Hz20000 => 20000,
            Self::Hz25000 => 25000,
            Self::Hz30000 => 30000,
        }
    }

    //   M    D     clkout     per-channel rate
    //   7  125    2.80 MHz      1.00 kS/s
    //   7  100    3.50 MHz      1.25 kS/s
    //  21  250    4.20 MHz      1.50 kS/s
    //  14  125    5.60 MHz      2.00 kS/s
    //  35  250    7.00 MHz      2.50 kS/s
    //  21  125    8.40 MHz      3.00 kS/s
    //  14   75    9.33 MHz      3.33 kS/s
    //  28  125   11.20 MHz      4.00 kS/s
    //   7   25   14.00 MHz      5.00 kS/s
    //   7   20   17.50 MHz      6.25 kS/s
    // 112  250   22.40 MHz      8.00 kS/s
    //  14   25   28.00 MHz     10.00 kS/s
    //   7   10   35.00 MHz     12.50 kS/s
    //  21   25   42.00 MHz     15.00 kS/s
    //  28   25   56.00 MHz     20.00 kS/s
    //  35   25   70.00 MHz     25.00 kS/s
    //  42   25   84.00 MHz     30.00 kS/s
    pub fn pll_params(&self) -> PllParams {
        match self {
            Self::Hz1000 => PllParams::new(7, 125),
            Self::Hz1250 => PllParams::new(7, 100),
            Self::Hz1500 => PllParams::new(21, 250),
            Self::Hz2000 => PllParams::new(14, 125),
            Self::Hz2500 => PllParams::new(35, 250),
            Self::Hz3000 => PllParams::new(21, 125),
            Self::Hz3330 => PllParams::new(14, 75),
            Self::Hz4000 => PllParams::new(28, 125),
            Self::Hz5000 => PllParams::new(7, 25),
            Self::Hz6250 => PllParams::new(7, 20),
            Self::Hz8000 => PllParams::new(112, 250),
            Self::Hz10000 => PllParams::new(14, 25),
            Self::Hz12500 => PllParams::new(7, 10),
            Self::Hz15000 => PllParams::new(21, 25),
            Self::Hz20000 => PllParams::new(28, 25),
            Self::Hz25000 => PllParams::new(35, 25),
            Self::Hz30000 => PllParams::new(42, 25),
        }
    }
}

impl TryFrom<u32> for SampleRate {
    type Error = ConfigError;

    fn try_from(hz: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|rate| rate.hz() == hz)
            .ok_or(ConfigError::UnsupportedRate(hz))
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.hz())
    }
}

/// PLL parameters for a per-channel rate given in Hz.
pub fn lookup(rate_hz: u32) -> Result<PllParams, ConfigError> {
    SampleRate::try_from(rate_hz).map(|rate| rate.pll_params())
}
