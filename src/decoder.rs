use log::warn;
use ndarray::{Array2, Array3};

/// Sync word that opens every data block, little-endian on the wire.
pub const MAGIC: u64 = 0xC691_1999_2702_1942;

pub const HEADER_BYTES: usize = 8;
/// Space reserved for the timestamp. Only the low two bytes are interpreted.
pub const TIMESTAMP_BYTES: usize = 4;
/// Auxiliary command slots per stream.
pub const AUX_CHANNELS: usize = 3;
pub const BOARD_ADC_CHANNELS: usize = 8;
/// Amplifier channels per stream the frame layout is built around.
pub const CHANNELS_PER_STREAM: usize = 32;

/// Size in bytes of one data block (one sample across all streams).
pub fn data_block_size_bytes(num_data_streams: usize) -> usize {
    // 4 magic words, 2 timestamp words, 36 words per stream (32 amplifier,
    // 3 auxiliary, 1 filler), 8 ADC words, TTL in and out
    2 * (4 + 2 + num_data_streams * 36 + 8 + 2)
}

pub fn check_header(header: &[u8; HEADER_BYTES]) -> bool {
    u64::from_le_bytes(*header) == MAGIC
}

/// Scale of one amplifier LSB in microvolts.
pub const AMPLIFIER_UV_PER_LSB: f64 = 0.195;

/// Converts an offset-binary amplifier word to microvolts.
pub fn amplifier_microvolts(word: u16) -> f64 {
    AMPLIFIER_UV_PER_LSB * (f64::from(word) - 32768.0)
}

/// Stream and channel counts that fix the byte layout of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockGeometry {
    pub num_data_streams: usize,
    pub num_channels: usize,
}

impl BlockGeometry {
    pub fn new(num_data_streams: usize, num_channels: usize) -> Self {
        Self {
            num_data_streams,
            num_channels,
        }
    }

    /// Bytes the decoder consumes per block. Equal to
    /// [`data_block_size_bytes`] when `num_channels` is 32. Saturates at
    /// `usize::MAX` for layouts no buffer could hold.
    pub fn block_size_bytes(&self) -> usize {
        self.checked_block_size_bytes().unwrap_or(usize::MAX)
    }

    pub fn checked_block_size_bytes(&self) -> Option<usize> {
        let per_stream = self.num_channels.checked_add(AUX_CHANNELS + 1)?;
        let words = per_stream
            .checked_mul(self.num_data_streams)?
            .checked_add(BOARD_ADC_CHANNELS + 2)?;
        words
            .checked_mul(2)?
            .checked_add(HEADER_BYTES + TIMESTAMP_BYTES)
    }

    /// Bytes taken by `block_count` blocks, `None` if that overflows.
    pub fn capture_size_bytes(&self, block_count: usize) -> Option<usize> {
        self.checked_block_size_bytes()?.checked_mul(block_count)
    }
}

/// One sample of every active stream, as decoded from a single block.
#[derive(Clone, Debug, PartialEq)]
pub struct DataBlock {
    pub timestamp: u32,
    /// `[stream][aux_channel]`
    pub auxiliary: Array2<u16>,
    /// `[stream][channel]`
    pub amplifier: Array2<u16>,
    pub adc: [u16; BOARD_ADC_CHANNELS],
    pub ttl_in: u16,
    pub ttl_out: u16,
}

impl DataBlock {
    pub fn zeros(geometry: BlockGeometry) -> Self {
        let n = geometry.num_data_streams;
        Self {
            timestamp: 0,
            auxiliary: Array2::zeros((n, AUX_CHANNELS)),
            amplifier: Array2::zeros((n, geometry.num_channels)),
            adc: [0; BOARD_ADC_CHANNELS],
            ttl_in: 0,
            ttl_out: 0,
        }
    }

    pub fn geometry(&self) -> BlockGeometry {
        let (num_data_streams, num_channels) = self.amplifier.dim();
        BlockGeometry::new(num_data_streams, num_channels)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The block at `sample_index` did not start with the magic word. The
    /// blocks before it are kept in `decoded`.
    #[error("frame sync lost at sample {sample_index}, header bytes {observed:02x?}")]
    FrameSync {
        sample_index: usize,
        observed: [u8; HEADER_BYTES],
        decoded: Vec<DataBlock>,
    },
    #[error("buffer holds {actual} bytes, {expected} needed")]
    Truncated { expected: usize, actual: usize },
    /// `block_count` blocks of this geometry do not fit in the address space.
    #[error("{block_count} blocks of {geometry:?} overflow the buffer size")]
    Oversized {
        block_count: usize,
        geometry: BlockGeometry,
    },
}

impl DecodeError {
    /// Blocks successfully decoded before the failure.
    pub fn decoded(&self) -> &[DataBlock] {
        match self {
            Self::FrameSync { decoded, .. } => decoded,
            Self::Truncated { .. } | Self::Oversized { .. } => &[],
        }
    }

    pub fn into_decoded(self) -> Vec<DataBlock> {
        match self {
            Self::FrameSync { decoded, .. } => decoded,
            Self::Truncated { .. } | Self::Oversized { .. } => Vec::new(),
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn word(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn skip(&mut self, bytes: usize) {
        self.pos += bytes;
    }
}

/// Decodes `block_count` consecutive blocks from `buffer`.
///
/// Decoding stops at the first block whose header is not the magic word; there
/// is no attempt to find the next one. The returned error carries the blocks
/// decoded up to that point.
pub fn decode_blocks(
    buffer: &[u8],
    block_count: usize,
    num_data_streams: usize,
    num_channels: usize,
) -> Result<Vec<DataBlock>, DecodeError> {
    let geometry = BlockGeometry::new(num_data_streams, num_channels);
    let block_size = geometry.block_size_bytes();
    let expected = geometry
        .capture_size_bytes(block_count)
        .ok_or(DecodeError::Oversized {
            block_count,
            geometry,
        })?;
    if buffer.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: buffer.len(),
        });
    }

    let mut cursor = Cursor::new(buffer);
    let mut blocks = Vec::with_capacity(block_count);
    for sample_index in 0..block_count {
        let start = cursor.pos;
        let header = cursor.take::<HEADER_BYTES>();
        if !check_header(&header) {
            warn!(
                "Header mismatch at sample {} (byte offset {}): {:02x?}",
                sample_index, start, header
            );
            return Err(DecodeError::FrameSync {
                sample_index,
                observed: header,
                decoded: blocks,
            });
        }
        let block = decode_body(&mut cursor, geometry);
        debug_assert_eq!(cursor.pos - start, block_size);
        blocks.push(block);
    }

    Ok(blocks)
}

fn decode_body(cursor: &mut Cursor<'_>, geometry: BlockGeometry) -> DataBlock {
    let n = geometry.num_data_streams;
    let mut block = DataBlock::zeros(geometry);

    // Two bytes are read, the other two reserved bytes are stepped over.
    block.timestamp = u32::from(cursor.word());
    cursor.skip(TIMESTAMP_BYTES - 2);

    for aux in 0..AUX_CHANNELS {
        for stream in 0..n {
            block.auxiliary[[stream, aux]] = cursor.word();
        }
    }

    // Streams are interleaved per channel position.
    for channel in 0..geometry.num_channels {
        for stream in 0..n {
            block.amplifier[[stream, channel]] = cursor.word();
        }
    }

    // filler word per stream
    cursor.skip(2 * n);

    for adc in block.adc.iter_mut() {
        *adc = cursor.word();
    }
    block.ttl_in = cursor.word();
    block.ttl_out = cursor.word();

    block
}

/// Owned capture bytes together with the layout they were captured with.
#[derive(Debug, Clone)]
pub struct RawBuffer {
    bytes: Vec<u8>,
    block_count: usize,
    geometry: BlockGeometry,
}

impl RawBuffer {
    pub fn new(bytes: Vec<u8>, block_count: usize, geometry: BlockGeometry) -> Self {
        Self {
            bytes,
            block_count,
            geometry,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn geometry(&self) -> BlockGeometry {
        self.geometry
    }

    pub fn decode(self) -> Result<Vec<DataBlock>, DecodeError> {
        decode_blocks(
            &self.bytes,
            self.block_count,
            self.geometry.num_data_streams,
            self.geometry.num_channels,
        )
    }
}

/// Stacks amplifier samples as `[stream][channel][sample]`.
pub fn amplifier_array(blocks: &[DataBlock]) -> Array3<u16> {
    let (streams, channels) = blocks.first().map_or((0, 0), |b| b.amplifier.dim());
    Array3::from_shape_fn((streams, channels, blocks.len()), |(s, c, i)| {
        blocks[i].amplifier[[s, c]]
    })
}

/// Stacks auxiliary results as `[stream][aux_channel][sample]`.
pub fn auxiliary_array(blocks: &[DataBlock]) -> Array3<u16> {
    let streams = blocks.first().map_or(0, |b| b.auxiliary.nrows());
    Array3::from_shape_fn((streams, AUX_CHANNELS, blocks.len()), |(s, a, i)| {
        blocks[i].auxiliary[[s, a]]
    })
}

/// Stacks board ADC samples as `[adc_channel][sample]`.
pub fn adc_array(blocks: &[DataBlock]) -> Array2<u16> {
    Array2::from_shape_fn((BOARD_ADC_CHANNELS, blocks.len()), |(a, i)| blocks[i].adc[a])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{encode_block, SyntheticPattern};

    fn encode_all(blocks: &[DataBlock]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for block in blocks {
            encode_block(block, &mut bytes);
        }
        bytes
    }

    #[test]
    fn header_accepts_only_magic() {
        let magic = MAGIC.to_le_bytes();
        assert!(check_header(&magic));
        for bit in 0..64 {
            let flipped = (MAGIC ^ (1u64 << bit)).to_le_bytes();
            assert!(!check_header(&flipped), "bit {bit}");
        }
        assert!(!check_header(&MAGIC.to_be_bytes()));
        assert_eq!(magic, [0x42, 0x19, 0x02, 0x27, 0x99, 0x19, 0x91, 0xc6]);
    }

    #[test]
    fn block_size_formula() {
        assert_eq!(data_block_size_bytes(0), 32);
        assert_eq!(data_block_size_bytes(1), 104);
        assert_eq!(data_block_size_bytes(2), 176);
        assert_eq!(data_block_size_bytes(8), 608);
        for n in 0..8 {
            assert!(data_block_size_bytes(n + 1) > data_block_size_bytes(n));
        }
    }

    #[test]
    fn geometry_matches_formula_at_32_channels() {
        for n in 0..=8 {
            assert_eq!(
                BlockGeometry::new(n, CHANNELS_PER_STREAM).block_size_bytes(),
                data_block_size_bytes(n)
            );
        }
        assert_eq!(BlockGeometry::new(2, 16).block_size_bytes(), 176 - 64);
    }

    #[test]
    fn round_trip_multi_stream() {
        let geometry = BlockGeometry::new(3, CHANNELS_PER_STREAM);
        let pattern = SyntheticPattern::Counting;
        let blocks: Vec<DataBlock> = (0..4).map(|i| pattern.block(i, geometry)).collect();
        let bytes = encode_all(&blocks);
        assert_eq!(bytes.len(), 4 * data_block_size_bytes(3));

        let decoded = decode_blocks(&bytes, 4, 3, CHANNELS_PER_STREAM).unwrap();
        assert_eq!(decoded, blocks);

        let amplifier = amplifier_array(&decoded);
        assert_eq!(amplifier.dim(), (3, 32, 4));
        for stream in 0..3 {
            for channel in 0..32 {
                for sample in 0..4 {
                    assert_eq!(
                        amplifier[[stream, channel, sample]],
                        SyntheticPattern::counting_amplifier(sample, stream, channel)
                    );
                }
            }
        }
    }

    #[test]
    fn amplifier_words_interleave_streams() {
        let geometry = BlockGeometry::new(2, 2);
        let mut block = DataBlock::zeros(geometry);
        block.amplifier = Array2::from_shape_vec((2, 2), vec![10, 11, 20, 21]).unwrap();
        let mut bytes = Vec::new();
        encode_block(&block, &mut bytes);

        // header, timestamp, 6 aux words, then channel 0 of streams 0 and 1
        let amp = HEADER_BYTES + TIMESTAMP_BYTES + 2 * AUX_CHANNELS * 2;
        let words: Vec<u16> = bytes[amp..amp + 8]
            .chunks(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
            .collect();
        assert_eq!(words, [10, 20, 11, 21]);
    }

    #[test]
    fn timestamp_uses_low_two_bytes() {
        let geometry = BlockGeometry::new(1, CHANNELS_PER_STREAM);
        let mut block = DataBlock::zeros(geometry);
        block.timestamp = 0x1234;
        let mut bytes = Vec::new();
        encode_block(&block, &mut bytes);
        bytes[HEADER_BYTES + 2] = 0xff;
        bytes[HEADER_BYTES + 3] = 0xff;

        let decoded = decode_blocks(&bytes, 1, 1, CHANNELS_PER_STREAM).unwrap();
        assert_eq!(decoded[0].timestamp, 0x1234);
    }

    #[test]
    fn frame_sync_error_keeps_earlier_blocks() {
        let geometry = BlockGeometry::new(2, CHANNELS_PER_STREAM);
        let pattern = SyntheticPattern::Counting;
        let blocks: Vec<DataBlock> = (0..5).map(|i| pattern.block(i, geometry)).collect();
        let mut bytes = encode_all(&blocks);
        let corrupt = 3 * data_block_size_bytes(2);
        bytes[corrupt + 5] ^= 0x01;

        let err = decode_blocks(&bytes, 5, 2, CHANNELS_PER_STREAM).unwrap_err();
        match &err {
            DecodeError::FrameSync {
                sample_index,
                observed,
                ..
            } => {
                assert_eq!(*sample_index, 3);
                assert_eq!(observed[..], bytes[corrupt..corrupt + 8]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.decoded(), &blocks[..3]);
        assert_eq!(err.into_decoded().len(), 3);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let geometry = BlockGeometry::new(2, CHANNELS_PER_STREAM);
        let bytes = encode_all(&[SyntheticPattern::Counting.block(0, geometry)]);
        let err = decode_blocks(&bytes[..100], 1, 2, CHANNELS_PER_STREAM).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Truncated {
                expected: 176,
                actual: 100
            }
        ));
        assert!(err.decoded().is_empty());
    }

    #[test]
    fn oversized_requests_are_errors() {
        let huge = usize::MAX / 100;
        let err = decode_blocks(&[0u8; 16], huge, 8, CHANNELS_PER_STREAM).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Oversized {
                block_count,
                geometry: BlockGeometry {
                    num_data_streams: 8,
                    ..
                },
            } if block_count == huge
        ));
        assert!(err.decoded().is_empty());

        let err = decode_blocks(&[0u8; 16], 1, 2, usize::MAX / 2).unwrap_err();
        assert!(matches!(err, DecodeError::Oversized { block_count: 1, .. }));

        let wide = BlockGeometry::new(usize::MAX, 1);
        assert_eq!(wide.checked_block_size_bytes(), None);
        assert_eq!(wide.block_size_bytes(), usize::MAX);
        assert_eq!(
            BlockGeometry::new(2, CHANNELS_PER_STREAM).capture_size_bytes(10),
            Some(1760)
        );
    }

    #[test]
    fn microvolts() {
        assert_eq!(amplifier_microvolts(32768), 0.0);
        assert!((amplifier_microvolts(32769) - 0.195).abs() < 1e-12);
        assert!((amplifier_microvolts(0) + 6389.76).abs() < 1e-9);
    }

    #[test]
    fn stacking_empty() {
        assert_eq!(amplifier_array(&[]).dim(), (0, 0, 0));
        assert_eq!(adc_array(&[]).dim(), (BOARD_ADC_CHANNELS, 0));
    }
}
