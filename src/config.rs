use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;

/// Capability of one (pin index, pin type) pair, declared by the
/// controller configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PinCapability {
    /// PWM resolution used as the dimming quantization. Absent for plain
    /// binary pins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
}

/// Available pins with their capabilities: index -> type -> capability.
pub type PinCaps = HashMap<String, HashMap<String, PinCapability>>;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Pin type names the controller provides.
    pub types: Vec<String>,
    pub pins: PinCaps,
    /// Dummy controllers synthesize values and never touch drivers.
    #[serde(default)]
    pub dummy: bool,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Controller entries keyed by name, in name order.
    #[serde(flatten)]
    pub controllers: BTreeMap<String, ControllerConfig>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(filename: P) -> anyhow::Result<Self> {
        let handle = File::open(filename)?;
        let data: Config = serde_yaml::from_reader(handle)?;

        Ok(data)
    }
}
