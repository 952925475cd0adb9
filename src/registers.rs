//! Endpoint addresses of the Rhythm FPGA firmware.
//!
//! Wire-ins (0x00..0x1F) are host-writable configuration words, wire-outs
//! (0x20..0x3F) are status words refreshed on demand, trigger-ins (0x40..0x5F)
//! are one-shot pulses and 0xA0 is the bulk pipe carrying sample data.
//! Multi-field wire-ins are described by [`RegisterField`] so every write goes
//! out as a (value, mask) pair and neighbouring fields are left alone.

/// [0] board reset, [1] continuous run mode
pub const WIRE_IN_RESET_RUN: u8 = 0x00;
/// [15:0] low half of the capture length in time steps
pub const WIRE_IN_MAX_TIME_STEP_LSB: u8 = 0x01;
/// [15:0] high half of the capture length in time steps
pub const WIRE_IN_MAX_TIME_STEP_MSB: u8 = 0x02;
/// [15:8] PLL multiplier M, [7:0] PLL divisor D
pub const WIRE_IN_DATA_FREQ_PLL: u8 = 0x03;
/// [3:0] port A, [7:4] port B, [11:8] port C, [15:12] port D MISO delay
pub const WIRE_IN_MISO_DELAY: u8 = 0x04;
/// [0] USB FIFO reset. Bit 4 is the cipher demo mode flag, never touched here.
pub const WIRE_IN_BUFFER_RESET: u8 = 0x10;
/// [7:0] front panel LEDs
pub const WIRE_IN_LEDS: u8 = 0x11;
/// [15:0] data sources for streams 0-3, four bits each
pub const WIRE_IN_DATA_STREAM_SEL_1234: u8 = 0x12;
/// [15:0] data sources for streams 4-7, four bits each
pub const WIRE_IN_DATA_STREAM_SEL_5678: u8 = 0x13;
/// [7:0] one enable bit per data stream
pub const WIRE_IN_DATA_STREAM_EN: u8 = 0x14;

/// [15:0] low half of the FIFO fill level in 16-bit words
pub const WIRE_OUT_NUM_WORDS_LSB: u8 = 0x20;
/// [15:0] high half of the FIFO fill level in 16-bit words
pub const WIRE_OUT_NUM_WORDS_MSB: u8 = 0x21;
/// non-zero while the SPI state machine is running a capture
pub const WIRE_OUT_SPI_RUNNING: u8 = 0x22;

/// [0] load new M/D into the PLL and restart channel timing
pub const TRIG_IN_DCM_PROG: u8 = 0x40;
/// [0] start a timed SPI acquisition
pub const TRIG_IN_SPI_START: u8 = 0x41;

pub const PIPE_OUT_DATA: u8 = 0xA0;

/// Number of physical SPI data sources (A1, A2, B1 ... D2) and USB data streams.
pub const MAX_DATA_STREAMS: usize = 8;

pub const MAX_CABLE_DELAY: i32 = 15;

/// A contiguous bit field inside a wire-in register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterField {
    pub address: u8,
    pub offset: u32,
    pub width: u32,
}

impl RegisterField {
    pub const fn new(address: u8, offset: u32, width: u32) -> Self {
        Self {
            address,
            offset,
            width,
        }
    }

    pub const fn mask(&self) -> u32 {
        ((1u32 << self.width) - 1) << self.offset
    }

    /// Value and mask to hand to the transport. Bits of `value` wider than the
    /// field are dropped.
    pub const fn encode(&self, value: u32) -> (u32, u32) {
        ((value << self.offset) & self.mask(), self.mask())
    }

    pub const fn decode(&self, register: u32) -> u32 {
        (register & self.mask()) >> self.offset
    }
}

pub const BOARD_RESET: RegisterField = RegisterField::new(WIRE_IN_RESET_RUN, 0, 1);
pub const CONTINUOUS_RUN: RegisterField = RegisterField::new(WIRE_IN_RESET_RUN, 1, 1);
pub const BUFFER_RESET: RegisterField = RegisterField::new(WIRE_IN_BUFFER_RESET, 0, 1);
pub const LEDS: RegisterField = RegisterField::new(WIRE_IN_LEDS, 0, 8);

/// Full-width 16-bit wire-in.
pub const fn word(address: u8) -> RegisterField {
    RegisterField::new(address, 0, 16)
}

/// Enable bit of one data stream.
pub const fn stream_enable(stream: usize) -> RegisterField {
    RegisterField::new(WIRE_IN_DATA_STREAM_EN, stream as u32, 1)
}

/// Routing field of one data stream. Four 4-bit fields fit per register, so
/// streams 4-7 spill into the second routing register.
pub const fn stream_source(stream: usize) -> RegisterField {
    let bit = (stream * 4) as u32;
    RegisterField::new(
        WIRE_IN_DATA_STREAM_SEL_1234 + (bit / 16) as u8,
        bit % 16,
        4,
    )
}
