use crate::{
    data_block_size_bytes,
    registers::{PIPE_OUT_DATA, TRIG_IN_SPI_START, WIRE_OUT_SPI_RUNNING},
    Board, ConfigError, DataBlock, Error, FrontPanel, RawBuffer, Result,
};
use log::{debug, info, trace, warn};
use std::{
    thread,
    time::{Duration, Instant},
};

/// Where a board is in its capture cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    /// Timer loaded, trigger not yet fired.
    Armed { block_count: usize },
    /// Trigger fired, waiting for the board to go quiet.
    Running { block_count: usize },
    /// Capture finished, data waiting in the FIFO.
    Draining { block_count: usize },
}

impl CaptureState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Armed { .. } => "armed",
            Self::Running { .. } => "running",
            Self::Draining { .. } => "draining",
        }
    }
}

/// Bounds on the busy poll that waits for a capture to finish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureOptions {
    pub timeout: Duration,
    /// Sleep between polls. Zero spins.
    pub poll_interval: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::ZERO,
        }
    }
}

impl<F: FrontPanel> Board<F> {
    pub fn capture_state(&self) -> CaptureState {
        self.state
    }

    pub fn capture_options(&self) -> CaptureOptions {
        self.options
    }

    pub fn set_capture_options(&mut self, options: CaptureOptions) {
        self.options = options;
    }

    /// Runs a timed capture of `block_count` data blocks and waits for the
    /// board to finish it.
    ///
    /// On any error the board is left as it is, no reset is attempted.
    pub fn start_capture(&mut self, block_count: usize) -> Result<()> {
        if self.state != CaptureState::Idle {
            return Err(Error::InvalidState {
                expected: CaptureState::Idle.name(),
                found: self.state.name(),
            });
        }
        let steps =
            u32::try_from(block_count).map_err(|_| ConfigError::CaptureLength(block_count))?;

        let result = self.run_capture(block_count, steps);
        if result.is_err() {
            self.state = CaptureState::Idle;
        }
        result
    }

    fn run_capture(&mut self, block_count: usize, steps: u32) -> Result<()> {
        debug!(
            "Capturing {} blocks ({} bytes)",
            block_count,
            data_block_size_bytes(self.config.num_data_streams) * block_count
        );
        self.set_max_time_step(steps)?;
        self.state = CaptureState::Armed { block_count };

        self.set_leds(0xff)?;
        self.fp.pulse_trigger(TRIG_IN_SPI_START, 0)?;
        self.state = CaptureState::Running { block_count };

        self.wait_while_running(block_count)?;
        self.state = CaptureState::Draining { block_count };
        Ok(())
    }

    fn wait_while_running(&mut self, block_count: usize) -> Result<()> {
        let started = Instant::now();
        let mut polls: u64 = 0;
        loop {
            self.fp.refresh_reads()?;
            if self.fp.read_register(WIRE_OUT_SPI_RUNNING)? == 0 {
                debug!("Capture done after {} polls, {:?}", polls, started.elapsed());
                return Ok(());
            }
            polls += 1;
            trace!("Board busy, poll {}", polls);

            if started.elapsed() >= self.options.timeout {
                warn!(
                    "Capture of {} blocks still running after {:?} ({} polls)",
                    block_count, self.options.timeout, polls
                );
                return Err(Error::CaptureTimeout {
                    timeout: self.options.timeout,
                    block_count,
                });
            }
            if self.options.poll_interval.is_zero() {
                std::hint::spin_loop();
            } else {
                thread::sleep(self.options.poll_interval);
            }
        }
    }

    /// Drains a finished capture from the data pipe.
    pub fn read_buffer(&mut self) -> Result<RawBuffer> {
        let CaptureState::Draining { block_count } = self.state else {
            return Err(Error::InvalidState {
                expected: "draining",
                found: self.state.name(),
            });
        };
        self.state = CaptureState::Idle;

        let geometry = self.config.geometry();
        let expected = data_block_size_bytes(geometry.num_data_streams) * block_count;
        let mut bytes = vec![0u8; expected];
        // LEDs go off whether or not the read succeeded
        let read = self.fp.read_pipe(PIPE_OUT_DATA, &mut bytes);
        let leds = self.set_leds(0);
        let actual = read?;
        leds?;
        if actual != expected {
            return Err(Error::ShortRead { expected, actual });
        }
        Ok(RawBuffer::new(bytes, block_count, geometry))
    }

    /// Captures and decodes `block_count` data blocks.
    pub fn capture(&mut self, block_count: usize) -> Result<Vec<DataBlock>> {
        self.start_capture(block_count)?;
        let raw = self.read_buffer()?;
        let blocks = raw.decode()?;
        info!(
            "Captured {} blocks across {} streams",
            blocks.len(),
            self.config.num_data_streams
        );
        Ok(blocks)
    }
}
