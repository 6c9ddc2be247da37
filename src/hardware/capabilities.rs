//! Hardware Capabilities
//!
//! Devices implement the small capability traits they actually support instead
//! of one monolithic driver interface:
//!
//! - every device implements `Instrument` (connect, disconnect, parameter snapshot)
//! - a delay stage adds `Movable`
//! - a lock-in amplifier adds `ChannelReader`
//! - the fast-scan digitizer implements `FrameSource`
//!
//! The sweep path binds to these traits when the plan is built, so nothing is
//! dispatched by method name at run time.
//!
//! The async traits return `anyhow::Result`; drivers attach context and the
//! sweep worker converts failures into `DaqError` at the step boundary.
//! `FrameSource` is blocking instead, because it is driven from the
//! producer's own thread at hardware rate.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn park<T: Movable + Instrument>(stage: &T) -> Result<()> {
//!     stage.connect().await?;
//!     stage.move_abs(0.0).await?;
//!     stage.disconnect().await
//! }
//! ```

use crate::data::sink::SinkValue;
use crate::error::DaqError;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Current parameter values of a device, keyed by parameter name.
pub type ParameterSnapshot = BTreeMap<String, SinkValue>;

/// Capability: Lifecycle
///
/// Every registered device can be connected, disconnected and asked for a
/// snapshot of its current parameters (written to the `settings` region of an
/// output sink).
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Open the connection to the device.
    async fn connect(&self) -> Result<()>;

    /// Close the connection to the device.
    ///
    /// Devices without an explicit teardown report
    /// [`DaqError::CapabilityMissing`], which hard-stop ignores.
    async fn disconnect(&self) -> Result<()> {
        Err(DaqError::CapabilityMissing("disconnect".into()).into())
    }

    /// Current parameter values.
    async fn snapshot(&self) -> Result<ParameterSnapshot>;
}

/// Capability: Motion Control
///
/// Devices that can move to positions (delay stages, actuators).
///
/// # Contract
/// - Positions are in device-native units
/// - `move_abs` returns once the target is reached
/// - `position` is optional; devices without readback report
///   [`DaqError::ReadbackUnavailable`] and callers fall back to the target
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Read back the current position
    ///
    /// # Default Implementation
    /// Returns an error indicating readback is not supported.
    async fn position(&self) -> Result<f64> {
        Err(DaqError::ReadbackUnavailable("position readback not supported".into()).into())
    }

    /// Stop motion immediately
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        Err(DaqError::CapabilityMissing("stop".into()).into())
    }
}

/// Capability: Channel Readout
///
/// Lock-in amplifiers and similar devices returning one value per named
/// channel.
#[async_trait]
pub trait ChannelReader: Send + Sync {
    /// Read the given channels once.
    ///
    /// # Returns
    /// One value per requested channel. Unknown channels are an error.
    async fn read_channels(&self, channels: &[String]) -> Result<BTreeMap<String, f64>>;
}

/// Capability: Continuous Frame Acquisition (blocking)
///
/// A frame is `n_samples` interleaved `(shaker position, signal)` pairs, so
/// its length is `2 * n_samples`. With dark control enabled consecutive pairs
/// alternate between pumped and unpumped.
pub trait FrameSource: Send {
    /// Acquire one frame, blocking for as long as the hardware needs.
    fn acquire(&mut self, n_samples: usize, dark_control: bool) -> Result<Vec<f64>>;

    /// Acquire `integration` frames and return their element-wise mean.
    fn single_shot(
        &mut self,
        n_samples: usize,
        dark_control: bool,
        integration: usize,
    ) -> Result<Vec<f64>> {
        let integration = integration.max(1);
        let mut sum = self.acquire(n_samples, dark_control)?;
        for _ in 1..integration {
            let frame = self.acquire(n_samples, dark_control)?;
            if frame.len() != sum.len() {
                anyhow::bail!(
                    "frame length changed during integration ({} != {})",
                    frame.len(),
                    sum.len()
                );
            }
            sum.iter_mut().zip(frame).for_each(|(s, x)| *s += x);
        }
        sum.iter_mut().for_each(|s| *s /= integration as f64);
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(f64);

    impl FrameSource for Counter {
        fn acquire(&mut self, n_samples: usize, _dark_control: bool) -> Result<Vec<f64>> {
            self.0 += 1.0;
            Ok(vec![self.0; 2 * n_samples])
        }
    }

    struct Bare;

    #[async_trait]
    impl Movable for Bare {
        async fn move_abs(&self, _position: f64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn single_shot_averages_integrated_frames() {
        let mut source = Counter(0.0);
        let frame = source.single_shot(3, false, 4).unwrap();
        assert_eq!(frame.len(), 6);
        // mean of 1, 2, 3, 4
        assert!(frame.iter().all(|&v| (v - 2.5).abs() < 1e-12));
    }

    #[tokio::test]
    async fn default_readback_is_recoverable() {
        let err = Bare.position().await.unwrap_err();
        let err = DaqError::from_hardware(err);
        assert!(matches!(err, DaqError::ReadbackUnavailable(_)));
        assert!(err.is_recoverable());
    }
}
