/// Status codes returned by the FrontPanel host library. Zero is success and
/// never appears as an error.
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
pub enum FrontPanelError {
    #[error("operation failed")]
    Failed = -1,
    #[error("timeout")]
    Timeout = -2,
    #[error("FPGA DONE pin not high after configuration")]
    DoneNotHigh = -3,
    #[error("transfer error")]
    TransferError = -4,
    #[error("communication error")]
    CommunicationError = -5,
    #[error("invalid bitstream")]
    InvalidBitstream = -6,
    #[error("file error")]
    FileError = -7,
    #[error("device not open")]
    DeviceNotOpen = -8,
    #[error("invalid endpoint")]
    InvalidEndpoint = -9,
    #[error("invalid block size")]
    InvalidBlockSize = -10,
    #[error("I2C restricted address")]
    I2CRestrictedAddress = -11,
    #[error("I2C bit error")]
    I2CBitError = -12,
    #[error("I2C NACK")]
    I2CNack = -13,
    #[error("I2C unknown status")]
    I2CUnknownStatus = -14,
    #[error("unsupported feature")]
    UnsupportedFeature = -15,
    #[error("FIFO underflow")]
    FifoUnderflow = -16,
    #[error("FIFO overflow")]
    FifoOverflow = -17,
    #[error("data alignment error")]
    DataAlignmentError = -18,
    #[error("invalid reset profile")]
    InvalidResetProfile = -19,
    #[error("invalid parameter")]
    InvalidParameter = -20,
    #[error("unknown error")]
    Unknown = 1,
}

impl From<i32> for FrontPanelError {
    fn from(value: i32) -> Self {
        match value {
            -1 => Self::Failed,
            -2 => Self::Timeout,
            -3 => Self::DoneNotHigh,
            -4 => Self::TransferError,
            -5 => Self::CommunicationError,
            -6 => Self::InvalidBitstream,
            -7 => Self::FileError,
            -8 => Self::DeviceNotOpen,
            -9 => Self::InvalidEndpoint,
            -10 => Self::InvalidBlockSize,
            -11 => Self::I2CRestrictedAddress,
            -12 => Self::I2CBitError,
            -13 => Self::I2CNack,
            -14 => Self::I2CUnknownStatus,
            -15 => Self::UnsupportedFeature,
            -16 => Self::FifoUnderflow,
            -17 => Self::FifoOverflow,
            -18 => Self::DataAlignmentError,
            -19 => Self::InvalidResetProfile,
            -20 => Self::InvalidParameter,
            _ => Self::Unknown,
        }
    }
}

/// Maps a raw library return code, so native bindings can `?` straight
/// through it.
pub fn check(code: i32) -> Result<(), FrontPanelError> {
    match code {
        0 => Ok(()),
        _ => Err(FrontPanelError::from(code)),
    }
}

/// Register and pipe access to an FPGA running the Rhythm firmware.
///
/// This is the only thing the codec needs from the USB side: device
/// discovery and bitstream loading happen before a transport is handed over.
/// Wire-in writes are staged until [`commit_writes`](Self::commit_writes);
/// wire-out reads see the snapshot taken by the last
/// [`refresh_reads`](Self::refresh_reads).
pub trait FrontPanel {
    /// Stage `value` into the bits of wire-in `address` selected by `mask`.
    fn write_register(&mut self, address: u8, value: u32, mask: u32)
        -> Result<(), FrontPanelError>;

    /// Send all staged wire-in values to the device.
    fn commit_writes(&mut self) -> Result<(), FrontPanelError>;

    fn read_register(&mut self, address: u8) -> Result<u32, FrontPanelError>;

    fn refresh_reads(&mut self) -> Result<(), FrontPanelError>;

    fn pulse_trigger(&mut self, address: u8, bit: u8) -> Result<(), FrontPanelError>;

    fn refresh_triggers(&mut self) -> Result<(), FrontPanelError>;

    fn is_triggered(&mut self, address: u8, bit: u8) -> Result<bool, FrontPanelError>;

    /// Returns the number of bytes accepted by the device.
    fn write_pipe(&mut self, address: u8, data: &[u8]) -> Result<usize, FrontPanelError>;

    /// Fills `data` from the pipe and returns the number of bytes transferred.
    fn read_pipe(&mut self, address: u8, data: &mut [u8]) -> Result<usize, FrontPanelError>;
}

impl<F: FrontPanel + ?Sized> FrontPanel for &mut F {
    fn write_register(
        &mut self,
        address: u8,
        value: u32,
        mask: u32,
    ) -> Result<(), FrontPanelError> {
        (**self).write_register(address, value, mask)
    }

    fn commit_writes(&mut self) -> Result<(), FrontPanelError> {
        (**self).commit_writes()
    }

    fn read_register(&mut self, address: u8) -> Result<u32, FrontPanelError> {
        (**self).read_register(address)
    }

    fn refresh_reads(&mut self) -> Result<(), FrontPanelError> {
        (**self).refresh_reads()
    }

    fn pulse_trigger(&mut self, address: u8, bit: u8) -> Result<(), FrontPanelError> {
        (**self).pulse_trigger(address, bit)
    }

    fn refresh_triggers(&mut self) -> Result<(), FrontPanelError> {
        (**self).refresh_triggers()
    }

    fn is_triggered(&mut self, address: u8, bit: u8) -> Result<bool, FrontPanelError> {
        (**self).is_triggered(address, bit)
    }

    fn write_pipe(&mut self, address: u8, data: &[u8]) -> Result<usize, FrontPanelError> {
        (**self).write_pipe(address, data)
    }

    fn read_pipe(&mut self, address: u8, data: &mut [u8]) -> Result<usize, FrontPanelError> {
        (**self).read_pipe(address, data)
    }
}
