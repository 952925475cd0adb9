//! In-memory stand-in for a Rhythm board.
//!
//! [`SimulatedBoard`] implements [`FrontPanel`] with the same staging and
//! masking rules as the real wire-ins, records every write and trigger, and
//! answers a timed capture with well-formed data blocks. It backs the unit
//! tests and lets the CLI run without hardware.

use crate::{
    registers::{
        self, PIPE_OUT_DATA, TRIG_IN_SPI_START, WIRE_IN_DATA_STREAM_EN,
        WIRE_IN_MAX_TIME_STEP_LSB, WIRE_IN_MAX_TIME_STEP_MSB, WIRE_OUT_NUM_WORDS_LSB,
        WIRE_OUT_NUM_WORDS_MSB, WIRE_OUT_SPI_RUNNING,
    },
    BlockGeometry, DataBlock, FrontPanel, FrontPanelError, AUX_CHANNELS, CHANNELS_PER_STREAM,
    MAGIC, TIMESTAMP_BYTES,
};
use log::trace;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashSet;

const WIRE_COUNT: usize = 0x20;
const WIRE_OUT_BASE: u8 = 0x20;

/// Serialises `block` in the layout the firmware streams over the pipe.
pub fn encode_block(block: &DataBlock, out: &mut Vec<u8>) {
    let geometry = block.geometry();
    let n = geometry.num_data_streams;
    out.reserve(geometry.block_size_bytes());

    out.extend_from_slice(&MAGIC.to_le_bytes());
    let timestamp = block.timestamp.to_le_bytes();
    out.extend_from_slice(&timestamp[..TIMESTAMP_BYTES]);
    for aux in 0..AUX_CHANNELS {
        for stream in 0..n {
            out.extend_from_slice(&block.auxiliary[[stream, aux]].to_le_bytes());
        }
    }
    for channel in 0..geometry.num_channels {
        for stream in 0..n {
            out.extend_from_slice(&block.amplifier[[stream, channel]].to_le_bytes());
        }
    }
    out.resize(out.len() + 2 * n, 0);
    for adc in block.adc {
        out.extend_from_slice(&adc.to_le_bytes());
    }
    out.extend_from_slice(&block.ttl_in.to_le_bytes());
    out.extend_from_slice(&block.ttl_out.to_le_bytes());
}

/// Content of generated blocks. Both variants are a pure function of the
/// sample index, so a test can rebuild what the board sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyntheticPattern {
    /// Every field encodes its own coordinates.
    Counting,
    /// Amplifier noise around mid-scale, seeded per sample.
    Noise { seed: u64 },
}

impl SyntheticPattern {
    /// Amplifier word of the counting pattern: stream in bits 12-14, channel in
    /// bits 6-10, low six bits of the sample index below.
    pub fn counting_amplifier(sample: usize, stream: usize, channel: usize) -> u16 {
        ((stream << 12) | (channel << 6) | (sample & 0x3f)) as u16
    }

    pub fn counting_auxiliary(sample: usize, stream: usize, aux: usize) -> u16 {
        (((aux + 1) << 12) | (stream << 8) | (sample & 0xff)) as u16
    }

    pub fn counting_adc(sample: usize, adc: usize) -> u16 {
        ((adc << 8) | (sample & 0xff)) as u16
    }

    pub fn block(&self, sample: usize, geometry: BlockGeometry) -> DataBlock {
        let mut block = DataBlock::zeros(geometry);
        // only 16 timestamp bits survive the trip through the decoder
        block.timestamp = (sample & 0xffff) as u32;
        block.ttl_in = sample as u16;
        block.ttl_out = !(sample as u16);

        match *self {
            Self::Counting => {
                for ((stream, channel), word) in block.amplifier.indexed_iter_mut() {
                    *word = Self::counting_amplifier(sample, stream, channel);
                }
                for ((stream, aux), word) in block.auxiliary.indexed_iter_mut() {
                    *word = Self::counting_auxiliary(sample, stream, aux);
                }
                for (adc, word) in block.adc.iter_mut().enumerate() {
                    *word = Self::counting_adc(sample, adc);
                }
            }
            Self::Noise { seed } => {
                let mix = (sample as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
                let mut rng = StdRng::seed_from_u64(seed ^ mix);
                for word in block.amplifier.iter_mut() {
                    *word = 32768u16.wrapping_add_signed(rng.random_range(-512..=512));
                }
                for word in block.auxiliary.iter_mut() {
                    *word = rng.random();
                }
                for word in block.adc.iter_mut() {
                    *word = rng.random_range(0..4096);
                }
            }
        }
        block
    }
}

/// A masked wire-in write as the transport received it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireWrite {
    pub address: u8,
    pub value: u32,
    pub mask: u32,
}

#[derive(Debug)]
pub struct SimulatedBoard {
    staged: [u32; WIRE_COUNT],
    committed: [u32; WIRE_COUNT],
    wire_outs: [u32; WIRE_COUNT],
    writes: Vec<WireWrite>,
    triggers: Vec<(u8, u8)>,
    commits: usize,
    raised: HashSet<(u8, u8)>,
    latched: HashSet<(u8, u8)>,
    pipe_in: Vec<u8>,
    pattern: SyntheticPattern,
    busy_polls: usize,
    busy_remaining: Option<usize>,
    stalled: bool,
    pending_steps: u64,
    fifo_bytes: usize,
    next_sample: usize,
    corrupt_at: Option<usize>,
    pipe_limit: Option<usize>,
    fail_next: Option<FrontPanelError>,
}

impl SimulatedBoard {
    pub fn new(pattern: SyntheticPattern) -> Self {
        Self {
            staged: [0; WIRE_COUNT],
            committed: [0; WIRE_COUNT],
            wire_outs: [0; WIRE_COUNT],
            writes: Vec::new(),
            triggers: Vec::new(),
            commits: 0,
            raised: HashSet::new(),
            latched: HashSet::new(),
            pipe_in: Vec::new(),
            pattern,
            busy_polls: 3,
            busy_remaining: None,
            stalled: false,
            pending_steps: 0,
            fifo_bytes: 0,
            next_sample: 0,
            corrupt_at: None,
            pipe_limit: None,
            fail_next: None,
        }
    }

    /// Number of status refreshes that still report a running capture.
    pub fn with_busy_polls(mut self, polls: usize) -> Self {
        self.busy_polls = polls;
        self
    }

    /// Captures never finish.
    pub fn stall(&mut self) {
        self.stalled = true;
    }

    /// Flips a header byte of the block with this absolute sample index.
    pub fn corrupt_header_at(&mut self, sample: usize) {
        self.corrupt_at = Some(sample);
    }

    /// Caps the bytes a single pipe read returns.
    pub fn limit_pipe(&mut self, bytes: usize) {
        self.pipe_limit = Some(bytes);
    }

    /// The next transport call fails with `error`.
    pub fn fail_next(&mut self, error: FrontPanelError) {
        self.fail_next = Some(error);
    }

    pub fn raise_trigger_out(&mut self, address: u8, bit: u8) {
        self.raised.insert((address, bit));
    }

    pub fn pattern(&self) -> SyntheticPattern {
        self.pattern
    }

    /// Committed value of a wire-in.
    pub fn wire_in(&self, address: u8) -> u32 {
        self.committed[usize::from(address) % WIRE_COUNT]
    }

    pub fn writes(&self) -> &[WireWrite] {
        &self.writes
    }

    pub fn triggers(&self) -> &[(u8, u8)] {
        &self.triggers
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn pipe_in(&self) -> &[u8] {
        &self.pipe_in
    }

    pub fn clear_log(&mut self) {
        self.writes.clear();
        self.triggers.clear();
        self.commits = 0;
    }

    fn check_failure(&mut self) -> Result<(), FrontPanelError> {
        match self.fail_next.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn num_data_streams(&self) -> usize {
        (self.committed[usize::from(WIRE_IN_DATA_STREAM_EN)] & 0xff).count_ones() as usize
    }

    fn geometry(&self) -> BlockGeometry {
        BlockGeometry::new(self.num_data_streams(), CHANNELS_PER_STREAM)
    }

    fn start_capture(&mut self) {
        let lsb = self.committed[usize::from(WIRE_IN_MAX_TIME_STEP_LSB)] & 0xffff;
        let msb = self.committed[usize::from(WIRE_IN_MAX_TIME_STEP_MSB)] & 0xffff;
        self.pending_steps = u64::from((msb << 16) | lsb);
        self.busy_remaining = Some(self.busy_polls);
    }

    fn finish_capture(&mut self) {
        self.busy_remaining = None;
        self.fifo_bytes += self.pending_steps as usize * self.geometry().block_size_bytes();
        self.pending_steps = 0;
    }
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new(SyntheticPattern::Counting)
    }
}

impl FrontPanel for SimulatedBoard {
    fn write_register(
        &mut self,
        address: u8,
        value: u32,
        mask: u32,
    ) -> Result<(), FrontPanelError> {
        self.check_failure()?;
        if address >= WIRE_OUT_BASE {
            return Err(FrontPanelError::InvalidEndpoint);
        }
        let wire = &mut self.staged[usize::from(address)];
        *wire = (*wire & !mask) | (value & mask);
        self.writes.push(WireWrite {
            address,
            value,
            mask,
        });
        Ok(())
    }

    fn commit_writes(&mut self) -> Result<(), FrontPanelError> {
        self.check_failure()?;
        self.committed = self.staged;
        self.commits += 1;
        if registers::BOARD_RESET.decode(self.committed[0]) != 0 {
            self.next_sample = 0;
            self.fifo_bytes = 0;
            self.busy_remaining = None;
        }
        let buffer_reset = self.committed[usize::from(registers::WIRE_IN_BUFFER_RESET)];
        if registers::BUFFER_RESET.decode(buffer_reset) != 0 {
            self.fifo_bytes = 0;
        }
        Ok(())
    }

    fn read_register(&mut self, address: u8) -> Result<u32, FrontPanelError> {
        self.check_failure()?;
        match address {
            0x00..=0x1f => Ok(self.committed[usize::from(address)]),
            0x20..=0x3f => Ok(self.wire_outs[usize::from(address - WIRE_OUT_BASE)]),
            _ => Err(FrontPanelError::InvalidEndpoint),
        }
    }

    fn refresh_reads(&mut self) -> Result<(), FrontPanelError> {
        self.check_failure()?;
        if let Some(remaining) = self.busy_remaining {
            if self.stalled {
                trace!("Simulated capture stalled");
            } else if remaining == 0 {
                self.finish_capture();
            } else {
                self.busy_remaining = Some(remaining - 1);
            }
        }
        let words = (self.fifo_bytes / 2) as u32;
        let out = |address: u8| usize::from(address - WIRE_OUT_BASE);
        self.wire_outs[out(WIRE_OUT_SPI_RUNNING)] = u32::from(self.busy_remaining.is_some());
        self.wire_outs[out(WIRE_OUT_NUM_WORDS_LSB)] = words & 0xffff;
        self.wire_outs[out(WIRE_OUT_NUM_WORDS_MSB)] = words >> 16;
        Ok(())
    }

    fn pulse_trigger(&mut self, address: u8, bit: u8) -> Result<(), FrontPanelError> {
        self.check_failure()?;
        if !(0x40..0x60).contains(&address) || bit > 31 {
            return Err(FrontPanelError::InvalidEndpoint);
        }
        self.triggers.push((address, bit));
        if (address, bit) == (TRIG_IN_SPI_START, 0) {
            self.start_capture();
        }
        Ok(())
    }

    fn refresh_triggers(&mut self) -> Result<(), FrontPanelError> {
        self.check_failure()?;
        self.latched = std::mem::take(&mut self.raised);
        Ok(())
    }

    fn is_triggered(&mut self, address: u8, bit: u8) -> Result<bool, FrontPanelError> {
        self.check_failure()?;
        Ok(self.latched.contains(&(address, bit)))
    }

    fn write_pipe(&mut self, address: u8, data: &[u8]) -> Result<usize, FrontPanelError> {
        self.check_failure()?;
        if !(0x80..0xa0).contains(&address) {
            return Err(FrontPanelError::InvalidEndpoint);
        }
        self.pipe_in.extend_from_slice(data);
        Ok(data.len())
    }

    fn read_pipe(&mut self, address: u8, data: &mut [u8]) -> Result<usize, FrontPanelError> {
        self.check_failure()?;
        if address != PIPE_OUT_DATA {
            return Err(FrontPanelError::InvalidEndpoint);
        }
        let geometry = self.geometry();
        let block_size = geometry.block_size_bytes();
        let available = self
            .pipe_limit
            .map_or(self.fifo_bytes, |limit| limit.min(self.fifo_bytes));
        let blocks = data.len().min(available) / block_size;

        let mut bytes = Vec::with_capacity(blocks * block_size);
        for _ in 0..blocks {
            let start = bytes.len();
            encode_block(&self.pattern.block(self.next_sample, geometry), &mut bytes);
            if self.corrupt_at == Some(self.next_sample) {
                bytes[start] ^= 0xff;
            }
            self.next_sample += 1;
        }
        data[..bytes.len()].copy_from_slice(&bytes);
        self.fifo_bytes -= bytes.len();
        Ok(bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_writes_stage_until_commit() {
        let mut board = SimulatedBoard::default();
        board.write_register(0x12, 0xabcd, 0x00f0).unwrap();
        assert_eq!(board.wire_in(0x12), 0);
        board.commit_writes().unwrap();
        assert_eq!(board.wire_in(0x12), 0x00c0);
        board.write_register(0x12, 0x0003, 0x000f).unwrap();
        board.commit_writes().unwrap();
        assert_eq!(board.wire_in(0x12), 0x00c3);
    }

    #[test]
    fn capture_fills_fifo() {
        let mut board = SimulatedBoard::default().with_busy_polls(1);
        board.write_register(WIRE_IN_DATA_STREAM_EN, 0x03, 0xff).unwrap();
        board.write_register(WIRE_IN_MAX_TIME_STEP_LSB, 4, 0xffff).unwrap();
        board.commit_writes().unwrap();
        board.pulse_trigger(TRIG_IN_SPI_START, 0).unwrap();

        board.refresh_reads().unwrap();
        assert_eq!(board.read_register(WIRE_OUT_SPI_RUNNING).unwrap(), 1);
        board.refresh_reads().unwrap();
        assert_eq!(board.read_register(WIRE_OUT_SPI_RUNNING).unwrap(), 0);
        assert_eq!(board.read_register(WIRE_OUT_NUM_WORDS_LSB).unwrap(), 4 * 176 / 2);
    }

    #[test]
    fn trigger_outs_latch_on_refresh() {
        let mut board = SimulatedBoard::default();
        board.raise_trigger_out(0x60, 1);
        assert!(!board.is_triggered(0x60, 1).unwrap());
        board.refresh_triggers().unwrap();
        assert!(board.is_triggered(0x60, 1).unwrap());
        board.refresh_triggers().unwrap();
        assert!(!board.is_triggered(0x60, 1).unwrap());
    }

    #[test]
    fn injected_failure_is_one_shot() {
        let mut board = SimulatedBoard::default();
        board.fail_next(FrontPanelError::CommunicationError);
        assert_eq!(board.commit_writes(), Err(FrontPanelError::CommunicationError));
        assert_eq!(board.commit_writes(), Ok(()));
    }

    #[test]
    fn bad_endpoints() {
        let mut board = SimulatedBoard::default();
        assert_eq!(
            board.write_register(0x22, 1, 1),
            Err(FrontPanelError::InvalidEndpoint)
        );
        assert_eq!(
            board.read_pipe(0xa1, &mut [0; 16]),
            Err(FrontPanelError::InvalidEndpoint)
        );
        assert_eq!(board.write_pipe(0x80, &[1, 2, 3]), Ok(3));
        assert_eq!(board.pipe_in(), &[1, 2, 3]);
    }

    #[test]
    fn noise_pattern_is_reproducible() {
        let geometry = BlockGeometry::new(2, CHANNELS_PER_STREAM);
        let pattern = SyntheticPattern::Noise { seed: 7 };
        assert_eq!(pattern.block(5, geometry), pattern.block(5, geometry));
        assert_ne!(pattern.block(5, geometry), pattern.block(6, geometry));
        let block = pattern.block(5, geometry);
        assert!(block.amplifier.iter().all(|&w| (32256..=33280).contains(&w)));
    }
}
