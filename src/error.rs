use crate::{DecodeError, FrontPanelError};
use std::time::Duration;

/// Rejected configuration intents. Raised before anything is written to the
/// board.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported sample rate {0} Hz")]
    UnsupportedRate(u32),
    #[error("data stream index {0} out of range (0..8)")]
    StreamIndex(usize),
    #[error("data source {0} out of range (0..8)")]
    DataSource(u8),
    #[error("{0} data streams requested, the board has 8")]
    StreamCount(usize),
    #[error("{0} channels per stream requested, the frame layout carries 32")]
    ChannelCount(usize),
    #[error("capture of {0} blocks exceeds the 32-bit step counter")]
    CaptureLength(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("front panel transport error: {0}")]
    Transport(#[from] FrontPanelError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("capture of {block_count} blocks still running after {timeout:?}")]
    CaptureTimeout {
        timeout: Duration,
        block_count: usize,
    },
    #[error("acquisition is {found}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },
    #[error("pipe read returned {actual} of {expected} bytes")]
    ShortRead { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
