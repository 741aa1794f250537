//! Sensor signal sources.
//!
//! The hardware driver is feature-gated so the agent still builds and runs
//! its tests on machines without a Raspberry Pi GPIO header.

use crate::config::DetectorConfig;
use crate::error::{AgentError, Result};
use std::collections::VecDeque;

/// Reading reported for a lit digital input.
pub const DIGITAL_HIGH: u16 = 1023;

/// Reading reported for a dark digital input.
pub const DIGITAL_LOW: u16 = 0;

/// Something that can be sampled for the current light intensity.
pub trait SignalSource: Send {
    /// Read the current intensity.
    fn read_signal(&mut self) -> Result<u16>;
}

#[cfg(feature = "gpio")]
mod raspberry_pi {
    use super::*;
    use rppal::gpio::{Gpio, InputPin, Level};

    /// Photo sensor comparator wired to a Raspberry Pi input pin.
    pub struct GpioSource {
        pin: InputPin,
    }

    impl GpioSource {
        /// Claim the configured input pin.
        pub fn new(config: &DetectorConfig) -> Result<Self> {
            let gpio = Gpio::new().map_err(|e| {
                AgentError::sensor_error(format!("Failed to initialize GPIO: {}", e))
            })?;

            let pin = gpio.get(config.pin).map_err(|e| {
                AgentError::sensor_error(format!("Failed to access pin {}: {}", config.pin, e))
            })?;

            let pin = if config.pull_up {
                pin.into_input_pullup()
            } else {
                pin.into_input()
            };

            Ok(Self { pin })
        }
    }

    impl SignalSource for GpioSource {
        fn read_signal(&mut self) -> Result<u16> {
            Ok(match self.pin.read() {
                Level::High => DIGITAL_HIGH,
                Level::Low => DIGITAL_LOW,
            })
        }
    }
}

#[cfg(not(feature = "gpio"))]
mod mock {
    use super::*;

    /// Stand-in for systems without GPIO support.
    pub struct MockSource {
        pin: u8,
    }

    impl MockSource {
        pub fn new(config: &DetectorConfig) -> Result<Self> {
            Ok(Self { pin: config.pin })
        }
    }

    impl SignalSource for MockSource {
        fn read_signal(&mut self) -> Result<u16> {
            Err(AgentError::sensor_error(format!(
                "GPIO not available on this system (attempted to read pin {})",
                self.pin
            )))
        }
    }
}

// Re-export the appropriate signal source
#[cfg(feature = "gpio")]
pub use raspberry_pi::GpioSource as DefaultSignalSource;

#[cfg(not(feature = "gpio"))]
pub use mock::MockSource as DefaultSignalSource;

/// Plays back a fixed sequence of readings, then holds a fill level.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    samples: VecDeque<u16>,
    fill: u16,
}

impl ReplaySource {
    /// Replay `samples`, then keep returning `fill`.
    pub fn new(samples: impl IntoIterator<Item = u16>, fill: u16) -> Self {
        Self {
            samples: samples.into_iter().collect(),
            fill,
        }
    }

    /// A train of `count` square blinks, each `on` samples lit followed by
    /// `off` samples dark.
    pub fn blinks(count: usize, on: usize, off: usize) -> Self {
        let mut samples = Vec::with_capacity(count * (on + off));
        for _ in 0..count {
            samples.extend(std::iter::repeat(DIGITAL_HIGH).take(on));
            samples.extend(std::iter::repeat(DIGITAL_LOW).take(off));
        }
        Self::new(samples, DIGITAL_LOW)
    }

    /// Whether all recorded samples have been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples left to replay.
    pub fn remaining(&self) -> usize {
        self.samples.len()
    }
}

impl SignalSource for ReplaySource {
    fn read_signal(&mut self) -> Result<u16> {
        Ok(self.samples.pop_front().unwrap_or(self.fill))
    }
}
