use crate::config::PinCapability;
use crate::consts::Raw;
use crate::message::{PinFlavour, Value};
use serde::Serialize;
use std::collections::HashMap;

/// Wall-clock timestamp in milliseconds, the `at` of every published
/// change.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Published state of one pin. `None` means cleared or never set.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PinState {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub pin_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flavour: Option<PinFlavour>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caps: Option<PinCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dummy: Option<bool>,
    /// Last observed raw driver value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Raw>,
    /// Last logical value; meaning depends on the flavour.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<i64>,
    /// Target logical value of an in-flight dim transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aim: Option<f64>,
    /// Target raw value of an in-flight dim transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raim: Option<Raw>,
    /// Planned transition duration in ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
}

impl PinState {
    /// Drop everything tied to the registration, keeping the last
    /// observed raw/value/at as a historical record.
    pub fn clear_registration(&mut self) {
        self.pin_type = None;
        self.flavour = None;
        self.caption = None;
        self.entry = None;
        self.caps = None;
        self.confirm = None;
        self.dummy = None;
        self.aim = None;
        self.raim = None;
        self.time = None;
    }

    /// Clear any in-flight transition markers.
    pub fn clear_aim(&mut self) {
        self.aim = None;
        self.raim = None;
        self.time = None;
    }
}

/// State of one controller entry as published through the registry's
/// watch channel.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EntryState {
    #[serde(rename = "pinTypes")]
    pub pin_types: Vec<String>,
    pub pins: HashMap<String, PinState>,
}

impl EntryState {
    pub fn pin_mut(&mut self, index: &str) -> &mut PinState {
        self.pins.entry(index.to_string()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clearing_registration_retains_history() {
        let mut pin = PinState {
            pin_type: Some("dout".into()),
            flavour: Some(PinFlavour::Light),
            caps: Some(PinCapability { steps: Some(100) }),
            confirm: Some(true),
            raw: Some(25),
            value: Some(Value::Level(0.5)),
            at: Some(1234),
            aim: Some(1.0),
            raim: Some(100),
            time: Some(500),
            ..PinState::default()
        };

        pin.clear_registration();

        assert_eq!(pin.pin_type, None);
        assert_eq!(pin.caps, None);
        assert_eq!(pin.aim, None);
        assert_eq!(pin.raw, Some(25));
        assert_eq!(pin.value, Some(Value::Level(0.5)));
        assert_eq!(pin.at, Some(1234));
    }

    #[test]
    fn snapshot_serializes_sparse() {
        let mut state = EntryState {
            pin_types: vec!["din".into()],
            ..EntryState::default()
        };
        state.pin_mut("4").raw = Some(1);

        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"pinTypes":["din"],"pins":{"4":{"raw":1}}}"#);
    }
}
