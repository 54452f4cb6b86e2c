use crate::config::PinCapability;
use crate::consts::Raw;
use serde::{Deserialize, Serialize};

/// Behaviour layered on the base pin response socket.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinFlavour {
    /// Raw passthrough, digital inputs and outputs.
    #[default]
    Plain,
    /// Digital output with optional two-phase confirmation.
    Dout,
    /// Tri-state output accepting -1/0/1.
    Tri,
    /// Press/release/tap/hold gesture detection.
    Switch,
    /// Smooth dimming of a PWM channel.
    Light,
    /// Rising-edge counter.
    Counter,
}

/// Debounced state of a switch pin.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchPhase {
    Pressed,
    Released,
}

/// Logical pin value. The meaning depends on the flavour: raw passthrough
/// for digital pins, a 0..1 level for lights, an edge count for counters
/// and the gesture phase for switches.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Raw(Raw),
    Level(f64),
    Count(u64),
    Phase(SwitchPhase),
}

/// The `registerPin` command payload. Unused optional fields are simply
/// left at their defaults; flavours pick the ones they understand.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegisterRequest {
    /// Pin index on the controller, e.g. "4" or "ch1".
    pub index: String,
    /// Pin type name, resolved against the registry's driver bank.
    #[serde(rename = "type")]
    pub pin_type: String,
    pub flavour: PinFlavour,
    /// Caption shown in state listings.
    pub caption: Option<String>,
    /// Identifier of the consuming entry.
    pub entry: Option<String>,
    /// Switch: debounce window in ms.
    pub debounce: Option<u64>,
    /// Switch: repeated-tap window in ms.
    pub tap: Option<u64>,
    /// Switch: hold timeout in ms.
    pub hold: Option<u64>,
    /// Dout: writes must carry `confirmed: true`.
    pub confirm: bool,
    /// Tri: drive the pin to this value right after setup.
    pub write: Option<Raw>,
    /// Counter: shortest interval between client updates in ms.
    pub throttle: Option<u64>,
    /// Accepted for wire compatibility; not interpreted.
    pub cease: Option<u64>,
}

impl RegisterRequest {
    pub fn new(index: &str, pin_type: &str) -> Self {
        RegisterRequest {
            index: index.to_string(),
            pin_type: pin_type.to_string(),
            ..RegisterRequest::default()
        }
    }
}

/// Value carried by a write request before flavour-specific coercion.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WriteValue {
    #[default]
    Null,
    Bool(bool),
    Num(f64),
    Text(String),
}

/// Payload of a `write` sent over an open pin link.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteRequest {
    pub value: WriteValue,
    /// Light: milliseconds per full 0..1 sweep; triggers dimming.
    pub speed: Option<u64>,
    /// Dout two-phase acknowledgement.
    pub confirmed: bool,
}

impl WriteRequest {
    pub fn bool(on: bool) -> Self {
        WriteRequest {
            value: WriteValue::Bool(on),
            ..WriteRequest::default()
        }
    }

    pub fn num(value: f64) -> Self {
        WriteRequest {
            value: WriteValue::Num(value),
            ..WriteRequest::default()
        }
    }

    pub fn dim(value: f64, speed: u64) -> Self {
        WriteRequest {
            value: WriteValue::Num(value),
            speed: Some(speed),
            ..WriteRequest::default()
        }
    }
}

/// Initial response delivered to the client when its registration opens.
#[derive(Clone, Debug, Serialize)]
pub struct OpenInfo {
    pub value: Value,
    pub at: i64,
    pub caps: PinCapability,
    pub confirm: bool,
}

/// Events delivered to the client side of a pin link.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase", tag = "event")]
pub enum LinkEvent {
    /// Value change. `aim`/`time` describe an in-flight dim transition.
    Update {
        value: Value,
        at: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        aim: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        time: Option<u64>,
    },
    Press {
        at: i64,
    },
    Release {
        at: i64,
    },
    Tap {
        at: i64,
        count: u32,
    },
    Hold {
        at: i64,
    },
    /// The response socket is gone; no further events follow.
    Closed,
    /// Terminal failure; the registration was torn down.
    Error {
        reason: String,
    },
}
