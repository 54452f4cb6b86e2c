// Shared constants and aliases for the pin subsystem.

/// Raw driver-level pin value. Binary pins use 0/1, tri-state outputs
/// -1/0/1, PWM channels 0..=steps.
///
/// Polarity for switch-like inputs: raw `0` means pressed, any nonzero
/// value means released.
pub type Raw = i32;

// Well-known pin type names. Controllers may define more; these are the
// ones flavour dispatch cares about.
pub const TYPE_DIN: &str = "din";
pub const TYPE_DOUT: &str = "dout";
pub const TYPE_PWM: &str = "pwm";

/// Gesture and dimming defaults in milliseconds, applied when the
/// registration request leaves them out.
pub const SWITCH_DEBOUNCE_MS: u64 = 50;
pub const SWITCH_TAP_MS: u64 = 800;
pub const SWITCH_HOLD_MS: u64 = 1000;
pub const COUNTER_THROTTLE_MS: u64 = 1000;
pub const LIGHT_DIM_SPEED_MS: u64 = 5000;
/// Level a light is switched to when toggled on without an explicit value.
pub const LIGHT_DEFAULT_ON: f64 = 0.2;

/// Shortest dimming tick. Bounds the driver write rate.
pub const DIM_TICK_FLOOR_MS: u64 = 10;

// Channel capacities.
pub const COMMAND_QUEUE: usize = 64;
pub const LINK_QUEUE: usize = 64;
pub const IO_QUEUE: usize = 16;

/// Software version
pub const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const HUB_NAME: &str = "pin-hub";
