use crate::consts::Raw;
use crate::error::DriverError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Controller-side access to one physical pin.
///
/// A driver instance is exclusively owned by the registry for the lifetime
/// of a registration and all calls to it are serialized in request order.
/// Raw polarity for switch-like inputs: raw `0` means pressed, nonzero
/// means released.
#[async_trait]
pub trait PinDriver: Send {
    /// Driver name used in logs.
    fn name(&self) -> &str;

    /// Prepare the pin and return its current raw value. Defaults to a
    /// plain `read`.
    async fn setup(&mut self) -> Result<Raw, DriverError> {
        self.read().await
    }

    /// Current raw value of the pin.
    async fn read(&mut self) -> Result<Raw, DriverError>;

    /// Drive the pin to `raw`.
    async fn write(&mut self, raw: Raw) -> Result<(), DriverError>;

    /// Free the underlying resource. Called once when the registration is
    /// removed; the last written value is left in place.
    async fn release(&mut self) {}
}

/// Creates drivers for registered pins. Never consulted by dummy
/// registries.
pub trait DriverBank: Send + Sync + 'static {
    /// Pin type names this bank serves, published as `pinTypes`.
    fn types(&self) -> Vec<String>;

    /// Driver for `index` of `pin_type`, or `None` when the type is not
    /// provided by this bank.
    fn create(&self, index: &str, pin_type: &str) -> Option<Box<dyn PinDriver>>;
}

#[derive(Default)]
struct EmulatedState {
    value: Raw,
    writes: Vec<Raw>,
    fail_next: Option<DriverError>,
    released: bool,
}

/// In-memory pin driver backing the simulator and tests. Clones share the
/// same pin state, so a handle kept outside the registry observes every
/// write the registry performs.
#[derive(Clone)]
pub struct EmulatedPin {
    name: String,
    state: Arc<Mutex<EmulatedState>>,
}

impl EmulatedPin {
    pub fn new(name: &str, value: Raw) -> Self {
        EmulatedPin {
            name: name.to_string(),
            state: Arc::new(Mutex::new(EmulatedState {
                value,
                ..EmulatedState::default()
            })),
        }
    }

    pub fn value(&self) -> Raw {
        self.state.lock().unwrap().value
    }

    /// Change the value behind the registry's back, as external hardware
    /// would. The registry only notices on its next read.
    pub fn set_value(&self, raw: Raw) {
        self.state.lock().unwrap().value = raw;
    }

    /// Every raw value written so far, in order.
    pub fn writes(&self) -> Vec<Raw> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn released(&self) -> bool {
        self.state.lock().unwrap().released
    }

    /// Make the next read or write fail with `err`.
    pub fn fail_next(&self, err: DriverError) {
        self.state.lock().unwrap().fail_next = Some(err);
    }
}

#[async_trait]
impl PinDriver for EmulatedPin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self) -> Result<Raw, DriverError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        Ok(state.value)
    }

    async fn write(&mut self, raw: Raw) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        state.value = raw;
        state.writes.push(raw);
        Ok(())
    }

    async fn release(&mut self) {
        self.state.lock().unwrap().released = true;
    }
}

/// Driver bank handing out emulated pins, one per index, created on first
/// use.
pub struct EmulatedBank {
    types: Vec<String>,
    pins: Mutex<HashMap<String, EmulatedPin>>,
}

impl EmulatedBank {
    pub fn new(types: &[&str]) -> Self {
        EmulatedBank {
            types: types.iter().map(|t| t.to_string()).collect(),
            pins: Mutex::new(HashMap::new()),
        }
    }

    /// Shared state of the pin at `index`, creating it at raw 0 if it was
    /// never touched.
    pub fn pin(&self, index: &str) -> EmulatedPin {
        let mut pins = self.pins.lock().unwrap();
        pins.entry(index.to_string())
            .or_insert_with(|| EmulatedPin::new(index, 0))
            .clone()
    }
}

impl DriverBank for EmulatedBank {
    fn types(&self) -> Vec<String> {
        self.types.clone()
    }

    fn create(&self, index: &str, pin_type: &str) -> Option<Box<dyn PinDriver>> {
        if !self.types.iter().any(|t| t == pin_type) {
            return None;
        }
        Some(Box::new(self.pin(index)))
    }
}
