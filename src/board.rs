use crate::{
    clamp_cable_delay,
    registers::{
        self, RegisterField, MAX_DATA_STREAMS, TRIG_IN_DCM_PROG, WIRE_IN_DATA_FREQ_PLL,
        WIRE_IN_MAX_TIME_STEP_LSB, WIRE_IN_MAX_TIME_STEP_MSB, WIRE_IN_MISO_DELAY,
        WIRE_OUT_NUM_WORDS_LSB, WIRE_OUT_NUM_WORDS_MSB,
    },
    CaptureOptions, CaptureState, ConfigError, DeviceConfig, FrontPanel, Port, Result,
    SampleRate,
};
use log::{debug, info, warn};
use std::collections::HashMap;

/// LED sequence flashed after a USB buffer reset.
const RESET_LIGHT_PULSE: [u8; 3] = [0xff, 0x00, 0xff];

/// One session with a Rhythm board.
///
/// Owns the transport and the configuration snapshot the board was last
/// programmed with. Every setter validates its arguments, writes the affected
/// wire-ins as (value, mask) pairs, commits them and then updates the
/// snapshot, so the decoder always sees the layout the board is producing.
#[derive(Debug)]
pub struct Board<F: FrontPanel> {
    pub(crate) fp: F,
    pub(crate) config: DeviceConfig,
    pub(crate) state: CaptureState,
    pub(crate) options: CaptureOptions,
    enabled_streams: u8,
}

impl<F: FrontPanel> Board<F> {
    /// Flushes the board's USB buffer and programs it with `config`.
    pub fn open(fp: F, config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        let mut board = Self {
            fp,
            config,
            state: CaptureState::Idle,
            options: CaptureOptions::default(),
            enabled_streams: 0,
        };
        board.reset_buffer()?;
        board.apply_config()?;
        Ok(board)
    }

    /// Writes the whole configuration snapshot to the board.
    ///
    /// Stream `i` is fed from data source `i`. The sample rate goes out before
    /// the cable delays, which are counted in periods of the new clock.
    pub fn apply_config(&mut self) -> Result<()> {
        let config = self.config.clone();
        info!(
            "Configuring board: {}, {} streams x {} channels, continuous: {}",
            config.sample_rate, config.num_data_streams, config.num_channels, config.continuous_mode
        );
        for stream in 0..MAX_DATA_STREAMS {
            if stream < config.num_data_streams {
                self.enable_data_stream(stream)?;
                self.set_data_source(stream, stream as u8)?;
            } else {
                self.disable_data_stream(stream)?;
            }
        }
        self.set_continuous_run_mode(config.continuous_mode)?;
        self.set_sample_frequency(config.sample_rate)?;
        self.set_cable_delay(&config.cable_delay)?;
        Ok(())
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn transport(&self) -> &F {
        &self.fp
    }

    pub fn transport_mut(&mut self) -> &mut F {
        &mut self.fp
    }

    pub fn into_inner(self) -> F {
        self.fp
    }

    fn stage(&mut self, field: RegisterField, value: u32) -> Result<()> {
        let (value, mask) = field.encode(value);
        debug!(
            "wire-in 0x{:02x} <- 0x{:04x} (mask 0x{:04x})",
            field.address, value, mask
        );
        self.fp.write_register(field.address, value, mask)?;
        Ok(())
    }

    fn write_field(&mut self, field: RegisterField, value: u32) -> Result<()> {
        self.stage(field, value)?;
        self.fp.commit_writes()?;
        Ok(())
    }

    /// Asserts a reset bit and releases it again, committing each edge.
    fn pulse_bit(&mut self, field: RegisterField) -> Result<()> {
        self.write_field(field, 1)?;
        self.write_field(field, 0)
    }

    fn trigger(&mut self, address: u8, bit: u8) -> Result<()> {
        debug!("trigger-in 0x{:02x} bit {}", address, bit);
        self.fp.pulse_trigger(address, bit)?;
        Ok(())
    }

    fn check_stream(stream: usize) -> Result<()> {
        if stream >= MAX_DATA_STREAMS {
            return Err(ConfigError::StreamIndex(stream).into());
        }
        Ok(())
    }

    fn sync_stream_count(&mut self) {
        self.config.num_data_streams = self.enabled_streams.count_ones() as usize;
    }

    pub fn enable_data_stream(&mut self, stream: usize) -> Result<()> {
        Self::check_stream(stream)?;
        self.write_field(registers::stream_enable(stream), 1)?;
        self.enabled_streams |= 1 << stream;
        self.sync_stream_count();
        Ok(())
    }

    pub fn disable_data_stream(&mut self, stream: usize) -> Result<()> {
        Self::check_stream(stream)?;
        self.write_field(registers::stream_enable(stream), 0)?;
        self.enabled_streams &= !(1 << stream);
        self.sync_stream_count();
        Ok(())
    }

    /// Routes SPI data source `source` (0 = A1, 1 = A2, 2 = B1 ... 7 = D2) to
    /// USB data stream `stream`.
    pub fn set_data_source(&mut self, stream: usize, source: u8) -> Result<()> {
        Self::check_stream(stream)?;
        if usize::from(source) >= MAX_DATA_STREAMS {
            return Err(ConfigError::DataSource(source).into());
        }
        self.write_field(registers::stream_source(stream), u32::from(source))
    }

    /// Reprograms the PLL for `rate` and restarts per-channel timing.
    pub fn set_sample_frequency(&mut self, rate: SampleRate) -> Result<()> {
        let pll = rate.pll_params();
        info!(
            "Sample rate {} (M = {}, D = {})",
            rate,
            pll.multiplier(),
            pll.divisor()
        );
        self.write_field(registers::word(WIRE_IN_DATA_FREQ_PLL), pll.register_word())?;
        self.trigger(TRIG_IN_DCM_PROG, 0)?;
        self.config.sample_rate = rate;
        Ok(())
    }

    /// Sets the MISO sampling delay of each listed port, in clock steps of
    /// 1/2800 of a sample period. Ports missing from `delays` keep their
    /// current setting.
    pub fn set_cable_delay(&mut self, delays: &HashMap<Port, i32>) -> Result<()> {
        for port in Port::ALL {
            let Some(&delay) = delays.get(&port) else {
                continue;
            };
            let steps = clamp_cable_delay(delay);
            if steps as i32 != delay {
                warn!("Cable delay {} for port {:?} clamped to {}", delay, port, steps);
            }
            let field = RegisterField::new(WIRE_IN_MISO_DELAY, 4 * port.index() as u32, 4);
            self.write_field(field, steps)?;
            self.config.cable_delay.insert(port, steps as i32);
        }
        Ok(())
    }

    pub fn set_continuous_run_mode(&mut self, enabled: bool) -> Result<()> {
        self.write_field(registers::CONTINUOUS_RUN, u32::from(enabled))?;
        self.config.continuous_mode = enabled;
        Ok(())
    }

    /// Sets how many time steps a triggered capture runs for.
    pub fn set_max_time_step(&mut self, steps: u32) -> Result<()> {
        self.stage(registers::word(WIRE_IN_MAX_TIME_STEP_LSB), steps & 0x0000_ffff)?;
        self.stage(registers::word(WIRE_IN_MAX_TIME_STEP_MSB), steps >> 16)?;
        self.fp.commit_writes()?;
        Ok(())
    }

    /// Flushes the board's USB FIFO.
    pub fn reset_buffer(&mut self) -> Result<()> {
        debug!("Resetting USB buffer");
        self.pulse_bit(registers::BUFFER_RESET)?;
        for leds in RESET_LIGHT_PULSE {
            self.set_leds(leds)?;
        }
        self.set_leds(0)
    }

    /// Resets the acquisition state machine. The firmware clears its auxiliary
    /// command RAM and FIFO and falls back to 30 kS/s.
    pub fn reset_board(&mut self) -> Result<()> {
        info!("Resetting board");
        self.pulse_bit(registers::BOARD_RESET)?;
        self.config.sample_rate = SampleRate::Hz30000;
        Ok(())
    }

    pub fn set_leds(&mut self, leds: u8) -> Result<()> {
        self.write_field(registers::LEDS, u32::from(leds))
    }

    /// 16-bit words waiting in the board's USB FIFO.
    pub fn num_words_in_fifo(&mut self) -> Result<u32> {
        self.fp.refresh_reads()?;
        let msb = self.fp.read_register(WIRE_OUT_NUM_WORDS_MSB)?;
        let lsb = self.fp.read_register(WIRE_OUT_NUM_WORDS_LSB)?;
        Ok((msb << 16) | (lsb & 0xffff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registers::{
            TRIG_IN_SPI_START, WIRE_IN_BUFFER_RESET, WIRE_IN_DATA_STREAM_EN,
            WIRE_IN_DATA_STREAM_SEL_1234, WIRE_IN_DATA_STREAM_SEL_5678, WIRE_IN_LEDS,
            WIRE_IN_RESET_RUN,
        },
        sim::{SimulatedBoard, WireWrite},
        Error,
    };

    fn open(config: DeviceConfig) -> Board<SimulatedBoard> {
        let mut board = Board::open(SimulatedBoard::default(), config).unwrap();
        board.transport_mut().clear_log();
        board
    }

    fn write(address: u8, value: u32, mask: u32) -> WireWrite {
        WireWrite {
            address,
            value,
            mask,
        }
    }

    #[test]
    fn open_programs_the_board() {
        let config = DeviceConfig {
            num_data_streams: 2,
            cable_delay: HashMap::from([(Port::B, 3)]),
            continuous_mode: true,
            ..Default::default()
        };
        let board = Board::open(SimulatedBoard::default(), config.clone()).unwrap();
        let sim = board.transport();

        assert_eq!(sim.wire_in(WIRE_IN_DATA_STREAM_EN), 0x03);
        assert_eq!(sim.wire_in(WIRE_IN_DATA_STREAM_SEL_1234), 0x0010);
        assert_eq!(sim.wire_in(WIRE_IN_RESET_RUN), 0x02);
        assert_eq!(sim.wire_in(WIRE_IN_DATA_FREQ_PLL), 42 * 256 + 25);
        assert_eq!(sim.wire_in(WIRE_IN_MISO_DELAY), 0x0030);
        assert_eq!(sim.wire_in(WIRE_IN_LEDS), 0);
        assert_eq!(sim.triggers(), &[(TRIG_IN_DCM_PROG, 0)]);
        assert_eq!(board.config(), &config);

        // the buffer reset comes first
        assert_eq!(sim.writes()[0], write(WIRE_IN_BUFFER_RESET, 1, 1));
        assert_eq!(sim.writes()[1], write(WIRE_IN_BUFFER_RESET, 0, 1));
    }

    #[test]
    fn open_rejects_bad_config() {
        let config = DeviceConfig {
            num_data_streams: 9,
            ..Default::default()
        };
        let err = Board::open(SimulatedBoard::default(), config).unwrap_err();
        assert!(matches!(err, Error::Configuration(ConfigError::StreamCount(9))));
    }

    #[test]
    fn stream_enable_touches_one_bit() {
        let mut board = open(DeviceConfig::default());
        board.enable_data_stream(5).unwrap();
        board.enable_data_stream(2).unwrap();
        board.disable_data_stream(0).unwrap();

        let sim = board.transport();
        assert_eq!(
            sim.writes(),
            &[
                write(WIRE_IN_DATA_STREAM_EN, 0x20, 0x20),
                write(WIRE_IN_DATA_STREAM_EN, 0x04, 0x04),
                write(WIRE_IN_DATA_STREAM_EN, 0x00, 0x01),
            ]
        );
        assert_eq!(sim.commits(), 3);
        assert_eq!(sim.wire_in(WIRE_IN_DATA_STREAM_EN), 0x24);
        assert_eq!(board.config().num_data_streams, 2);
    }

    #[test]
    fn data_source_preserves_other_streams() {
        let mut board = open(DeviceConfig::default());
        board.set_data_source(5, 6).unwrap();
        board.set_data_source(1, 3).unwrap();
        board.set_data_source(4, 7).unwrap();

        let sim = board.transport();
        assert_eq!(
            sim.writes(),
            &[
                write(WIRE_IN_DATA_STREAM_SEL_5678, 0x0060, 0x00f0),
                write(WIRE_IN_DATA_STREAM_SEL_1234, 0x0030, 0x00f0),
                write(WIRE_IN_DATA_STREAM_SEL_5678, 0x0007, 0x000f),
            ]
        );
        assert_eq!(sim.wire_in(WIRE_IN_DATA_STREAM_SEL_5678), 0x0067);
        assert_eq!(sim.wire_in(WIRE_IN_DATA_STREAM_SEL_1234) & 0x00f0, 0x0030);
    }

    #[test]
    fn out_of_range_indices_write_nothing() {
        let mut board = open(DeviceConfig::default());
        assert!(matches!(
            board.enable_data_stream(8),
            Err(Error::Configuration(ConfigError::StreamIndex(8)))
        ));
        assert!(matches!(
            board.set_data_source(9, 0),
            Err(Error::Configuration(ConfigError::StreamIndex(9)))
        ));
        assert!(matches!(
            board.set_data_source(0, 8),
            Err(Error::Configuration(ConfigError::DataSource(8)))
        ));
        assert!(board.transport().writes().is_empty());
        assert_eq!(board.transport().commits(), 0);
    }

    #[test]
    fn sample_frequency_writes_pll_then_triggers() {
        let mut board = open(DeviceConfig::default());
        board.set_sample_frequency(SampleRate::Hz1000).unwrap();

        let sim = board.transport();
        assert_eq!(
            sim.writes(),
            &[write(WIRE_IN_DATA_FREQ_PLL, 7 * 256 + 125, 0xffff)]
        );
        assert_eq!(sim.commits(), 1);
        assert_eq!(sim.triggers(), &[(TRIG_IN_DCM_PROG, 0)]);
        assert_eq!(board.config().sample_rate, SampleRate::Hz1000);
    }

    #[test]
    fn cable_delay_fields_and_clamping() {
        let mut board = open(DeviceConfig::default());
        board
            .set_cable_delay(&HashMap::from([(Port::D, 20), (Port::A, 5), (Port::C, -1)]))
            .unwrap();

        let sim = board.transport();
        assert_eq!(
            sim.writes(),
            &[
                write(WIRE_IN_MISO_DELAY, 0x0005, 0x000f),
                write(WIRE_IN_MISO_DELAY, 0x0000, 0x0f00),
                write(WIRE_IN_MISO_DELAY, 0xf000, 0xf000),
            ]
        );
        assert_eq!(sim.commits(), 3);
        assert_eq!(sim.wire_in(WIRE_IN_MISO_DELAY), 0xf005);
        assert_eq!(board.config().cable_delay[&Port::D], 15);
        assert_eq!(board.config().cable_delay[&Port::C], 0);

        board.set_cable_delay(&HashMap::from([(Port::B, 9)])).unwrap();
        assert_eq!(board.transport().wire_in(WIRE_IN_MISO_DELAY), 0xf095);
    }

    #[test]
    fn continuous_mode_bit() {
        let mut board = open(DeviceConfig::default());
        board.set_continuous_run_mode(true).unwrap();
        assert_eq!(board.transport().wire_in(WIRE_IN_RESET_RUN), 0x02);
        board.set_continuous_run_mode(false).unwrap();
        assert_eq!(board.transport().wire_in(WIRE_IN_RESET_RUN), 0x00);
        assert_eq!(
            board.transport().writes(),
            &[
                write(WIRE_IN_RESET_RUN, 0x02, 0x02),
                write(WIRE_IN_RESET_RUN, 0x00, 0x02)
            ]
        );
    }

    #[test]
    fn max_time_step_splits_halves() {
        let mut board = open(DeviceConfig::default());
        board.set_max_time_step(0x0012_3456).unwrap();

        let sim = board.transport();
        assert_eq!(
            sim.writes(),
            &[
                write(WIRE_IN_MAX_TIME_STEP_LSB, 0x3456, 0xffff),
                write(WIRE_IN_MAX_TIME_STEP_MSB, 0x0012, 0xffff),
            ]
        );
        assert_eq!(sim.commits(), 1);
    }

    #[test]
    fn reset_board_pulses_bit_zero() {
        let mut board = open(DeviceConfig::default());
        board.set_continuous_run_mode(true).unwrap();
        board.set_sample_frequency(SampleRate::Hz5000).unwrap();
        board.transport_mut().clear_log();

        board.reset_board().unwrap();
        let sim = board.transport();
        assert_eq!(
            sim.writes(),
            &[
                write(WIRE_IN_RESET_RUN, 1, 1),
                write(WIRE_IN_RESET_RUN, 0, 1)
            ]
        );
        assert_eq!(sim.commits(), 2);
        // continuous mode bit survives the pulse
        assert_eq!(sim.wire_in(WIRE_IN_RESET_RUN), 0x02);
        assert_eq!(board.config().sample_rate, SampleRate::Hz30000);
    }

    #[test]
    fn fifo_word_count() {
        let mut board = open(DeviceConfig::default());
        board.set_max_time_step(1000).unwrap();
        board.transport_mut().pulse_trigger(TRIG_IN_SPI_START, 0).unwrap();
        while board.transport_mut().refresh_reads().is_ok()
            && board
                .transport_mut()
                .read_register(registers::WIRE_OUT_SPI_RUNNING)
                .unwrap()
                != 0
        {}
        // 1000 blocks of 104 bytes
        assert_eq!(board.num_words_in_fifo().unwrap(), 52_000);
    }
}
