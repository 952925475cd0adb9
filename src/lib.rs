//! Register codec and data-block decoder for the Rhythm FPGA interface of
//! RHD2000 amplifier boards.
//!
//! A [`Board`] owns a [`FrontPanel`] transport and the [`DeviceConfig`] the
//! board was programmed with. Configuration calls become masked wire-in writes,
//! [`Board::capture`] runs a timed acquisition and [`decode_blocks`] turns the
//! pipe contents into [`DataBlock`]s.

mod acquisition;
mod board;
mod config;
mod decoder;
mod error;
mod frontpanel;
pub mod registers;
mod sample_rate;
pub mod sim;
mod utils;

pub use acquisition::*;
pub use board::*;
pub use config::*;
pub use decoder::*;
pub use error::*;
pub use frontpanel::*;
pub use sample_rate::*;
pub use utils::*;
