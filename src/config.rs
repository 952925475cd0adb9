use crate::{
    registers::{MAX_CABLE_DELAY, MAX_DATA_STREAMS},
    BlockGeometry, ConfigError, SampleRate, CHANNELS_PER_STREAM,
};
use confique::Config;
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf, time::Duration};

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub device: DeviceSettings,
    #[config(nested)]
    pub run: RunSettings,
}

#[derive(Config, Debug, Clone)]
pub struct DeviceSettings {
    /// Per-channel amplifier sample rate in Hz, one of the rates the PLL table
    /// covers.
    #[config(env = "RHYTHM_SAMPLE_RATE", default = 30000)]
    pub sample_rate: SampleRate,
    /// USB data streams to enable, 0 to 8.
    #[config(env = "RHYTHM_NUM_DATA_STREAMS", default = 1)]
    pub num_data_streams: usize,
    /// Amplifier channels per stream.
    #[config(default = 32)]
    pub num_channels: usize,
    /// Stream regardless of whether the host is reading.
    #[config(default = false)]
    pub continuous_mode: bool,
    /// Data blocks per capture.
    #[config(default = 100)]
    pub capture_duration: u32,
    /// MISO sampling delay per SPI port in clock steps, e.g. `{ A = 5 }`.
    pub cable_delay: Option<HashMap<Port, i32>>,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    /// Number of captures to perform.
    #[config(env = "RHYTHM_RUNS", default = 1)]
    pub runs: usize,
    /// Give up on a capture the board still reports running after this long.
    #[config(default = 5000)]
    pub capture_timeout_ms: u64,
    /// Pause between busy polls. Zero spins.
    #[config(default = 0)]
    pub poll_interval_us: u64,
    pub log_file: Option<PathBuf>,
}

impl RunSettings {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

/// SPI port a cable plugs into. Each port carries two data sources.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Port {
    #[serde(alias = "PortA")]
    A,
    #[serde(alias = "PortB")]
    B,
    #[serde(alias = "PortC")]
    C,
    #[serde(alias = "PortD")]
    D,
}

impl Port {
    pub const ALL: [Port; 4] = [Port::A, Port::B, Port::C, Port::D];

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Cable delays are clamped rather than rejected.
pub fn clamp_cable_delay(delay: i32) -> u32 {
    delay.clamp(0, MAX_CABLE_DELAY) as u32
}

/// Validated board configuration, the snapshot both the register encoder and
/// the frame decoder work from.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub sample_rate: SampleRate,
    pub num_data_streams: usize,
    pub num_channels: usize,
    pub cable_delay: HashMap<Port, i32>,
    pub continuous_mode: bool,
    pub capture_duration_blocks: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::Hz30000,
            num_data_streams: 1,
            num_channels: CHANNELS_PER_STREAM,
            cable_delay: HashMap::new(),
            continuous_mode: false,
            capture_duration_blocks: 100,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_data_streams > MAX_DATA_STREAMS {
            return Err(ConfigError::StreamCount(self.num_data_streams));
        }
        if self.num_channels != CHANNELS_PER_STREAM {
            return Err(ConfigError::ChannelCount(self.num_channels));
        }
        Ok(())
    }

    pub fn geometry(&self) -> BlockGeometry {
        BlockGeometry::new(self.num_data_streams, self.num_channels)
    }
}

impl TryFrom<&DeviceSettings> for DeviceConfig {
    type Error = ConfigError;

    fn try_from(settings: &DeviceSettings) -> Result<Self, Self::Error> {
        let config = Self {
            sample_rate: settings.sample_rate,
            num_data_streams: settings.num_data_streams,
            num_channels: settings.num_channels,
            cable_delay: settings.cable_delay.clone().unwrap_or_default(),
            continuous_mode: settings.continuous_mode,
            capture_duration_blocks: settings.capture_duration,
        };
        config.validate()?;
        Ok(config)
    }
}
