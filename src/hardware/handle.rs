//! Instrument handles: a registered device plus the capabilities it exposes.
//!
//! A handle is built once, when the device is registered. Named setters are
//! captured as delegates at that point, so a sweep dimension that names
//! `"set_temperature"` resolves to a closure when the plan is built and never
//! looks the name up again while the sweep runs.

use crate::hardware::capabilities::{ChannelReader, Instrument, Movable};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Setter name registered automatically for devices with motion control.
pub const MOVE_ABSOLUTE: &str = "move_absolute";

type SetterFn = dyn Fn(f64) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A captured single-value setter.
#[derive(Clone)]
pub struct Setter(Arc<SetterFn>);

impl Setter {
    /// Wrap an async closure taking the new value.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(f64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Arc::new(move |value| f(value).boxed()))
    }

    /// Apply `value` on the device.
    pub async fn call(&self, value: f64) -> anyhow::Result<()> {
        (self.0)(value).await
    }
}

impl fmt::Debug for Setter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Setter(..)")
    }
}

/// Roles a scan type can require from the registered instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstrumentRole {
    /// Something implementing [`Movable`]
    DelayStage,
    /// Something implementing [`ChannelReader`]
    LockIn,
}

impl fmt::Display for InstrumentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentRole::DelayStage => write!(f, "delay_stage"),
            InstrumentRole::LockIn => write!(f, "lockin"),
        }
    }
}

/// Capability-typed proxy for one device.
///
/// Cloning is cheap; the coordinator owns the registry and the sweep worker
/// receives clones.
#[derive(Clone)]
pub struct InstrumentHandle {
    device: Arc<dyn Instrument>,
    setters: BTreeMap<String, Setter>,
    stage: Option<Arc<dyn Movable>>,
    reader: Option<Arc<dyn ChannelReader>>,
}

impl InstrumentHandle {
    /// Handle with lifecycle only; add capabilities with the `with_*` methods.
    pub fn new(device: Arc<dyn Instrument>) -> Self {
        Self {
            device,
            setters: BTreeMap::new(),
            stage: None,
            reader: None,
        }
    }

    /// Register a named setter.
    pub fn with_setter(mut self, method: impl Into<String>, setter: Setter) -> Self {
        self.setters.insert(method.into(), setter);
        self
    }

    /// Attach motion control. Also registers the `move_absolute` setter.
    pub fn with_stage(mut self, stage: Arc<dyn Movable>) -> Self {
        let target = stage.clone();
        self.setters.insert(
            MOVE_ABSOLUTE.to_string(),
            Setter::new(move |position| {
                let target = target.clone();
                async move { target.move_abs(position).await }
            }),
        );
        self.stage = Some(stage);
        self
    }

    /// Attach channel readout.
    pub fn with_reader(mut self, reader: Arc<dyn ChannelReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Lifecycle and snapshot interface
    pub fn device(&self) -> &Arc<dyn Instrument> {
        &self.device
    }

    /// Resolve a setter by name.
    pub fn setter(&self, method: &str) -> Option<Setter> {
        self.setters.get(method).cloned()
    }

    /// Names of all registered setters, sorted.
    pub fn setter_names(&self) -> Vec<&str> {
        self.setters.keys().map(String::as_str).collect()
    }

    /// Motion control, if any
    pub fn stage(&self) -> Option<&Arc<dyn Movable>> {
        self.stage.as_ref()
    }

    /// Channel readout, if any
    pub fn reader(&self) -> Option<&Arc<dyn ChannelReader>> {
        self.reader.as_ref()
    }

    /// Whether the handle can fill `role`.
    pub fn provides(&self, role: InstrumentRole) -> bool {
        match role {
            InstrumentRole::DelayStage => self.stage.is_some(),
            InstrumentRole::LockIn => self.reader.is_some(),
        }
    }

    /// Roles this handle can fill
    pub fn roles(&self) -> Vec<InstrumentRole> {
        [InstrumentRole::DelayStage, InstrumentRole::LockIn]
            .into_iter()
            .filter(|role| self.provides(*role))
            .collect()
    }
}

impl fmt::Debug for InstrumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentHandle")
            .field("setters", &self.setter_names())
            .field("roles", &self.roles())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCryostat, MockStage};

    #[tokio::test]
    async fn stage_handle_exposes_move_setter() {
        let stage = Arc::new(MockStage::with_speed(1e9));
        let handle = stage.handle();

        assert!(handle.provides(InstrumentRole::DelayStage));
        assert!(!handle.provides(InstrumentRole::LockIn));

        let setter = handle.setter(MOVE_ABSOLUTE).unwrap();
        setter.call(2.5).await.unwrap();
        assert_eq!(stage.current_position(), 2.5);
    }

    #[test]
    fn unknown_setter_does_not_resolve() {
        let handle = Arc::new(MockCryostat::new()).handle();
        assert!(handle.setter("set_temperature").is_some());
        assert!(handle.setter("set_pressure").is_none());
        assert!(handle.roles().is_empty());
    }
}
