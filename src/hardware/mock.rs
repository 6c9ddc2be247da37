//! Mock Hardware Implementations
//!
//! Simulated devices for tests and the CLI demo. Async mocks use
//! `tokio::time::sleep`; the frame source is blocking and sleeps the producer
//! thread, like a real digitizer would.
//!
//! # Available Mocks
//!
//! - `MockStage` - delay stage with timing, a move counter and switchable readback
//! - `MockLockIn` - lock-in amplifier returning deterministic channel values
//! - `MockCryostat` - a plain parameter device (temperature setter)
//! - `SimulatedAutocorrelator` - fast-scan frame source whose peak tracks a `MockStage`

use crate::data::sink::SinkValue;
use crate::error::DaqError;
use crate::hardware::capabilities::{
    ChannelReader, FrameSource, Instrument, Movable, ParameterSnapshot,
};
use crate::hardware::handle::{InstrumentHandle, Setter};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

// =============================================================================
// MockStage - Simulated Delay Stage
// =============================================================================

/// Mock delay stage with realistic timing
///
/// Positions are in stage units (ps of delay for the simulated setup). Motion
/// takes `distance / speed` seconds.
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockStage::with_speed(1e9);
/// stage.move_abs(10.0).await?;
/// assert_eq!(stage.position().await?, 10.0);
/// ```
pub struct MockStage {
    position: RwLock<f64>,
    speed: f64,
    moves: AtomicUsize,
    connected: AtomicBool,
    readback_available: AtomicBool,
}

impl MockStage {
    /// New stage at position 0.0 moving 10 units/sec
    pub fn new() -> Self {
        Self::with_speed(10.0)
    }

    /// New stage at position 0.0 with a custom speed (units/sec)
    pub fn with_speed(speed: f64) -> Self {
        Self {
            position: RwLock::new(0.0),
            speed,
            moves: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            readback_available: AtomicBool::new(true),
        }
    }

    /// Handle exposing motion control and `move_absolute`
    pub fn handle(self: &Arc<Self>) -> InstrumentHandle {
        InstrumentHandle::new(self.clone()).with_stage(self.clone())
    }

    /// Position without going through the async capability
    pub fn current_position(&self) -> f64 {
        *self.position.read()
    }

    /// Number of completed `move_abs` calls
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    /// Whether `connect` was called more recently than `disconnect`
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Make `position()` fail, as a stage without an encoder would.
    pub fn set_readback_available(&self, available: bool) {
        self.readback_available.store(available, Ordering::SeqCst);
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Movable for MockStage {
    async fn move_abs(&self, target: f64) -> Result<()> {
        if !target.is_finite() {
            bail!("MockStage: refusing to move to {target}");
        }
        let current = self.current_position();
        let delay_ms = ((target - current).abs() / self.speed * 1000.0) as u64;
        debug!(from = current, to = target, delay_ms, "MockStage moving");

        sleep(Duration::from_millis(delay_ms)).await;

        *self.position.write() = target;
        self.moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        if !self.readback_available.load(Ordering::SeqCst) {
            return Err(DaqError::ReadbackUnavailable("MockStage encoder disabled".into()).into());
        }
        Ok(self.current_position())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Instrument for MockStage {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn snapshot(&self) -> Result<ParameterSnapshot> {
        Ok(BTreeMap::from([
            ("position".to_string(), SinkValue::Float(self.current_position())),
            ("speed".to_string(), SinkValue::Float(self.speed)),
            ("model".to_string(), SinkValue::Text("MockStage".to_string())),
        ]))
    }
}

// =============================================================================
// MockLockIn - Simulated Lock-in Amplifier
// =============================================================================

/// Mock lock-in amplifier
///
/// Channels `X`, `Y`, `R` and `Theta` are available. When built with
/// [`MockLockIn::tracking`] the signal is a pump-probe style exponential decay
/// of the stage position; otherwise `X` counts the reads.
pub struct MockLockIn {
    stage: Option<Arc<MockStage>>,
    sensitivity: RwLock<f64>,
    time_constant: RwLock<f64>,
    reads: AtomicUsize,
    connects: AtomicUsize,
    connected: AtomicBool,
}

impl MockLockIn {
    /// Lock-in whose `X` is the read counter
    pub fn new() -> Self {
        Self {
            stage: None,
            sensitivity: RwLock::new(1.0),
            time_constant: RwLock::new(0.1),
            reads: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
        }
    }

    /// Lock-in whose signal follows the position of `stage`
    pub fn tracking(stage: Arc<MockStage>) -> Self {
        Self {
            stage: Some(stage),
            ..Self::new()
        }
    }

    /// Handle exposing channel readout plus sensitivity/time-constant setters
    pub fn handle(self: &Arc<Self>) -> InstrumentHandle {
        let sens = self.clone();
        let tc = self.clone();
        InstrumentHandle::new(self.clone())
            .with_reader(self.clone())
            .with_setter(
                "set_sensitivity",
                Setter::new(move |value| {
                    let sens = sens.clone();
                    async move {
                        *sens.sensitivity.write() = value;
                        Ok(())
                    }
                }),
            )
            .with_setter(
                "set_time_constant",
                Setter::new(move |value| {
                    let tc = tc.clone();
                    async move {
                        if value <= 0.0 {
                            bail!("time constant must be positive, got {value}");
                        }
                        *tc.time_constant.write() = value;
                        Ok(())
                    }
                }),
            )
    }

    /// Number of `read_channels` calls
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `connect` calls
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Whether `connect` was called more recently than `disconnect`
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Current sensitivity setting
    pub fn sensitivity(&self) -> f64 {
        *self.sensitivity.read()
    }

    fn signal(&self, count: usize) -> (f64, f64) {
        match &self.stage {
            Some(stage) => {
                let t = stage.current_position();
                let x = if t < 0.0 { 0.0 } else { (-t / 1.5).exp() };
                (x, 0.1 * x)
            }
            None => (count as f64, -(count as f64)),
        }
    }
}

impl Default for MockLockIn {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelReader for MockLockIn {
    async fn read_channels(&self, channels: &[String]) -> Result<BTreeMap<String, f64>> {
        let count = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        let (x, y) = self.signal(count);
        let gain = 1.0 / *self.sensitivity.read();
        channels
            .iter()
            .map(|channel| {
                let value = match channel.as_str() {
                    "X" => x * gain,
                    "Y" => y * gain,
                    "R" => x.hypot(y) * gain,
                    "Theta" => y.atan2(x),
                    other => bail!("MockLockIn: unknown channel '{other}'"),
                };
                Ok((channel.clone(), value))
            })
            .collect()
    }
}

#[async_trait]
impl Instrument for MockLockIn {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn snapshot(&self) -> Result<ParameterSnapshot> {
        Ok(BTreeMap::from([
            ("sensitivity".to_string(), SinkValue::Float(self.sensitivity())),
            (
                "time_constant".to_string(),
                SinkValue::Float(*self.time_constant.read()),
            ),
            ("model".to_string(), SinkValue::Text("MockLockIn".to_string())),
        ]))
    }
}

// =============================================================================
// MockCryostat - Simulated Parameter Device
// =============================================================================

/// How `MockCryostat::disconnect` behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectBehavior {
    /// Disconnects cleanly
    Succeed,
    /// Reports that it has no disconnect
    Unsupported,
    /// Fails with an instrument error
    Fail,
}

/// Mock temperature controller with a single setter
pub struct MockCryostat {
    temperature: RwLock<f64>,
    history: Mutex<Vec<f64>>,
    disconnect_behavior: RwLock<DisconnectBehavior>,
    disconnect_attempts: AtomicUsize,
    connected: AtomicBool,
}

impl MockCryostat {
    /// Cryostat at 300 K
    pub fn new() -> Self {
        Self {
            temperature: RwLock::new(300.0),
            history: Mutex::new(Vec::new()),
            disconnect_behavior: RwLock::new(DisconnectBehavior::Succeed),
            disconnect_attempts: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
        }
    }

    /// Handle exposing `set_temperature`
    pub fn handle(self: &Arc<Self>) -> InstrumentHandle {
        let device = self.clone();
        InstrumentHandle::new(self.clone()).with_setter(
            "set_temperature",
            Setter::new(move |kelvin| {
                let device = device.clone();
                async move { device.set_temperature(kelvin) }
            }),
        )
    }

    fn set_temperature(&self, kelvin: f64) -> Result<()> {
        if kelvin < 0.0 {
            bail!("MockCryostat: negative temperature {kelvin} K");
        }
        *self.temperature.write() = kelvin;
        self.history.lock().push(kelvin);
        Ok(())
    }

    /// Every value passed to `set_temperature`, in call order
    pub fn setpoint_history(&self) -> Vec<f64> {
        self.history.lock().clone()
    }

    /// Number of `set_temperature` calls
    pub fn set_count(&self) -> usize {
        self.history.lock().len()
    }

    /// Choose how the next disconnects behave
    pub fn set_disconnect_behavior(&self, behavior: DisconnectBehavior) {
        *self.disconnect_behavior.write() = behavior;
    }

    /// Number of `disconnect` calls, successful or not
    pub fn disconnect_attempts(&self) -> usize {
        self.disconnect_attempts.load(Ordering::SeqCst)
    }

    /// Whether `connect` was called more recently than a successful `disconnect`
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Default for MockCryostat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Instrument for MockCryostat {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_attempts.fetch_add(1, Ordering::SeqCst);
        match *self.disconnect_behavior.read() {
            DisconnectBehavior::Succeed => {
                self.connected.store(false, Ordering::SeqCst);
                Ok(())
            }
            DisconnectBehavior::Unsupported => {
                Err(DaqError::CapabilityMissing("disconnect".into()).into())
            }
            DisconnectBehavior::Fail => bail!("MockCryostat: controller not responding"),
        }
    }

    async fn snapshot(&self) -> Result<ParameterSnapshot> {
        Ok(BTreeMap::from([
            (
                "temperature".to_string(),
                SinkValue::Float(*self.temperature.read()),
            ),
            ("unit".to_string(), SinkValue::Text("K".to_string())),
        ]))
    }
}

// =============================================================================
// SimulatedAutocorrelator - Fast-scan Frame Source
// =============================================================================

/// Parameters of the simulated fast-scan setup
#[derive(Debug, Clone)]
pub struct AutocorrelatorParams {
    /// Position signal per shaker step
    pub position_step: f64,
    /// True delay per shaker step (ps)
    pub ps_per_step: f64,
    /// Shaker sweeps between `-amplitude_steps` and `+amplitude_steps`
    pub amplitude_steps: i64,
    /// Gaussian width of the autocorrelation (ps)
    pub sigma_ps: f64,
    /// Peak height
    pub peak: f64,
    /// Uniform noise amplitude (0 disables noise)
    pub noise: f64,
    /// Time spent generating one frame
    pub frame_period: Duration,
}

impl Default for AutocorrelatorParams {
    fn default() -> Self {
        Self {
            position_step: 0.000152,
            ps_per_step: 0.05,
            amplitude_steps: 200,
            sigma_ps: 0.25,
            peak: 1.0,
            noise: 0.0,
            frame_period: Duration::from_millis(2),
        }
    }
}

/// Frame source producing a Gaussian autocorrelation trace.
///
/// The shaker runs a triangle wave over its full amplitude. The peak sits at
/// the delay given by the attached stage's position, so moving the stage
/// shifts the peak like a real delay line.
pub struct SimulatedAutocorrelator {
    params: AutocorrelatorParams,
    stage: Option<Arc<MockStage>>,
    rng: StdRng,
    phase: usize,
    frames: usize,
}

impl SimulatedAutocorrelator {
    /// Source with a fixed peak at zero delay
    pub fn new(params: AutocorrelatorParams) -> Self {
        Self {
            params,
            stage: None,
            rng: StdRng::seed_from_u64(0x5eed),
            phase: 0,
            frames: 0,
        }
    }

    /// Source whose peak follows `stage`
    pub fn with_stage(params: AutocorrelatorParams, stage: Arc<MockStage>) -> Self {
        Self {
            stage: Some(stage),
            ..Self::new(params)
        }
    }

    /// Frames produced so far
    pub fn frame_count(&self) -> usize {
        self.frames
    }

    fn shaker_step(&self, phase: usize) -> i64 {
        let n = self.params.amplitude_steps.max(1);
        let m = (phase % (4 * n as usize)) as i64;
        if m < 2 * n {
            m - n
        } else {
            3 * n - m
        }
    }

    fn noise(&mut self) -> f64 {
        if self.params.noise > 0.0 {
            self.rng.gen_range(-self.params.noise..self.params.noise)
        } else {
            0.0
        }
    }
}

impl FrameSource for SimulatedAutocorrelator {
    fn acquire(&mut self, n_samples: usize, dark_control: bool) -> Result<Vec<f64>> {
        if n_samples == 0 {
            bail!("SimulatedAutocorrelator: n_samples must be positive");
        }
        let center = self.stage.as_ref().map_or(0.0, |s| s.current_position());
        let mut frame = Vec::with_capacity(2 * n_samples);

        for i in 0..n_samples {
            let step = self.shaker_step(self.phase);
            self.phase += 1;

            let delay = step as f64 * self.params.ps_per_step;
            let pumped = !dark_control || i % 2 == 0;
            let signal = if pumped {
                let z = (delay - center) / self.params.sigma_ps;
                self.params.peak * (-0.5 * z * z).exp()
            } else {
                0.0
            };
            let jitter = self.noise() * 0.1 * self.params.position_step;
            frame.push(step as f64 * self.params.position_step + jitter);
            let noise = self.noise();
            frame.push(signal + noise);
        }

        std::thread::sleep(self.params.frame_period);
        self.frames += 1;
        Ok(frame)
    }
}
