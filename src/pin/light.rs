//! Light flavour: drives a stepped output toward a logical 0..1 level,
//! optionally interpolated over time, using a square-law transform so the
//! perceived brightness changes about linearly.

use super::{FlavourState, IoJob, PinCx, Registration, Timer, TimerKind, WriteCtx};
use crate::consts::{self, Raw};
use crate::error::PinError;
use crate::message::{LinkEvent, Value, WriteRequest, WriteValue};
use crate::pin::registry::WriteReply;
use crate::state::now_ms;
use std::time::{Duration, Instant};

/// Logical level to raw steps. Results inside the bottom snap zone
/// collapse to 0, inside the top zone to full scale, avoiding dead bands
/// at the extremes of cheap PWM hardware.
pub fn to_raw(value: f64, steps: u32) -> Raw {
    let steps_f = steps as f64;
    let raw = (value * value * steps_f).floor();
    if raw < steps_f * 0.002 {
        0
    } else if raw > steps_f * 0.990 {
        steps as Raw
    } else {
        raw as Raw
    }
}

/// Raw steps back to a logical level.
pub fn to_logical(raw: Raw, steps: u32) -> f64 {
    if raw <= 0 {
        return 0.0;
    }
    (raw as f64 / steps as f64).sqrt()
}

/// An in-flight timed transition.
#[derive(Clone, Copy)]
pub(crate) struct Dim {
    pub from_value: f64,
    pub target_value: f64,
    pub target_raw: Raw,
    pub started: Instant,
    pub time_ms: u64,
    /// Last raw value handed to the driver.
    pub last_raw: Raw,
}

pub(crate) struct Light {
    pub steps: u32,
    /// Current logical level bookkeeping; tracks interpolation during a
    /// dim.
    pub value: f64,
    pub dim: Option<Dim>,
    pub timer: Timer,
}

impl Light {
    pub fn new(steps: u32) -> Self {
        Light {
            steps,
            value: 0.0,
            dim: None,
            timer: Timer::new(),
        }
    }
}

fn coerce(value: &WriteValue, current: f64) -> Result<f64, PinError> {
    match value {
        WriteValue::Bool(true) => Ok(1.0),
        WriteValue::Bool(false) => Ok(0.0),
        WriteValue::Text(text) if text == "true" || text == "on" => Ok(1.0),
        WriteValue::Text(text) if text == "false" || text == "off" => Ok(0.0),
        WriteValue::Text(text) if text == "stop" => Ok(current),
        WriteValue::Num(n) if n.is_finite() && (0.0..=1.0).contains(n) => Ok(*n),
        _ => Err(PinError::invalid_args("expecting a level between 0 and 1")),
    }
}

enum Plan {
    Reject(PinError),
    /// Target quantizes to the current raw value; only the logical
    /// bookkeeping moves.
    Touch { value: f64 },
    Immediate { value: f64, raw: Raw },
    Dim {
        from: f64,
        target: f64,
        target_raw: Raw,
        time: u64,
    },
}

/// Client write. Any in-flight dim is cancelled first; the request
/// resolves once the new transition is scheduled, not when it finishes.
pub(crate) fn write(reg: &mut Registration, cx: &PinCx<'_>, req: WriteRequest, reply: WriteReply) {
    let current_raw = reg.raw.unwrap_or(0);
    let plan = {
        let FlavourState::Light(light) = &mut reg.flavour else {
            return;
        };
        light.timer.cancel();
        light.dim = None;
        match coerce(&req.value, light.value) {
            Err(err) => Plan::Reject(err),
            Ok(target) => {
                let target_raw = to_raw(target, light.steps);
                if target_raw == current_raw {
                    light.value = target;
                    Plan::Touch { value: target }
                } else {
                    let time = match req.speed {
                        Some(speed) => {
                            ((target - light.value).abs() * speed as f64).floor() as u64
                        }
                        None => 0,
                    };
                    if time > 0 {
                        let from = light.value;
                        light.dim = Some(Dim {
                            from_value: from,
                            target_value: target,
                            target_raw,
                            started: Instant::now(),
                            time_ms: time,
                            last_raw: current_raw,
                        });
                        let tick = (time / light.steps as u64).max(consts::DIM_TICK_FLOOR_MS);
                        light
                            .timer
                            .every(cx, TimerKind::DimTick, Duration::from_millis(tick));
                        Plan::Dim {
                            from,
                            target,
                            target_raw,
                            time,
                        }
                    } else {
                        light.value = target;
                        Plan::Immediate {
                            value: target,
                            raw: target_raw,
                        }
                    }
                }
            }
        }
    };

    let at = now_ms();
    match plan {
        Plan::Reject(err) => {
            let _ = reply.send(Err(err));
        }
        Plan::Touch { value } => {
            cx.patch(move |pin| {
                pin.value = Some(Value::Level(value));
                pin.at = Some(at);
                pin.clear_aim();
            });
            // The raw value did not move, but the client still tracks the
            // logical level.
            reg.link.send(LinkEvent::Update {
                value: Value::Level(value),
                at,
                aim: None,
                time: None,
            });
            let _ = reply.send(Ok(()));
        }
        Plan::Immediate { value, raw } => {
            reg.raw = Some(raw);
            cx.patch(move |pin| {
                pin.raw = Some(raw);
                pin.value = Some(Value::Level(value));
                pin.at = Some(at);
                pin.clear_aim();
            });
            reg.link.send(LinkEvent::Update {
                value: Value::Level(value),
                at,
                aim: None,
                time: None,
            });
            if !reg.dummy {
                reg.enqueue_io(IoJob::Write {
                    raw,
                    ctx: WriteCtx::Background,
                });
            }
            let _ = reply.send(Ok(()));
        }
        Plan::Dim {
            from,
            target,
            target_raw,
            time,
        } => {
            cx.patch(move |pin| {
                pin.raw = Some(current_raw);
                pin.value = Some(Value::Level(from));
                pin.at = Some(at);
                pin.aim = Some(target);
                pin.raim = Some(target_raw);
                pin.time = Some(time);
            });
            reg.link.send(LinkEvent::Update {
                value: Value::Level(from),
                at,
                aim: Some(target),
                time: Some(time),
            });
            let _ = reply.send(Ok(()));
        }
    }
}

enum Step {
    Skip,
    Write(Raw),
    Done {
        value: f64,
        raw: Raw,
        write: Option<Raw>,
    },
}

/// Periodic dimming step: interpolate the logical level over elapsed
/// time, write the driver only when the quantized raw moved, publish the
/// final state once the transition converged.
pub(crate) fn tick(reg: &mut Registration, cx: &PinCx<'_>, seq: u64) {
    let step = {
        let FlavourState::Light(light) = &mut reg.flavour else {
            return;
        };
        if !light.timer.matches(seq) {
            Step::Skip
        } else if let Some(mut dim) = light.dim {
            let elapsed = dim.started.elapsed().as_millis() as u64;
            if elapsed >= dim.time_ms {
                light.timer.cancel();
                light.dim = None;
                light.value = dim.target_value;
                let write = (dim.last_raw != dim.target_raw).then_some(dim.target_raw);
                Step::Done {
                    value: dim.target_value,
                    raw: dim.target_raw,
                    write,
                }
            } else {
                let frac = elapsed as f64 / dim.time_ms as f64;
                let value = dim.from_value + (dim.target_value - dim.from_value) * frac;
                let raw = to_raw(value, light.steps);
                light.value = value;
                if raw == dim.last_raw {
                    Step::Skip
                } else if raw == dim.target_raw {
                    // Quantization reached the target early.
                    light.timer.cancel();
                    light.dim = None;
                    light.value = dim.target_value;
                    Step::Done {
                        value: dim.target_value,
                        raw: dim.target_raw,
                        write: Some(dim.target_raw),
                    }
                } else {
                    dim.last_raw = raw;
                    light.dim = Some(dim);
                    Step::Write(raw)
                }
            }
        } else {
            light.timer.cancel();
            Step::Skip
        }
    };

    let at = now_ms();
    match step {
        Step::Skip => {}
        Step::Write(raw) => {
            reg.raw = Some(raw);
            if !reg.dummy {
                reg.enqueue_io(IoJob::Write {
                    raw,
                    ctx: WriteCtx::Background,
                });
            }
        }
        Step::Done { value, raw, write } => {
            reg.raw = Some(raw);
            cx.patch(move |pin| {
                pin.raw = Some(raw);
                pin.value = Some(Value::Level(value));
                pin.at = Some(at);
                pin.clear_aim();
            });
            reg.link.send(LinkEvent::Update {
                value: Value::Level(value),
                at,
                aim: None,
                time: None,
            });
            if let Some(raw) = write {
                if !reg.dummy {
                    reg.enqueue_io(IoJob::Write {
                        raw,
                        ctx: WriteCtx::Background,
                    });
                }
            }
        }
    }
}

/// Raw change observed on the physical side, e.g. another controller
/// moved the channel. An in-flight dim keeps running.
pub(crate) fn update(reg: &mut Registration, cx: &PinCx<'_>, raw: Raw) {
    let value = {
        let FlavourState::Light(light) = &mut reg.flavour else {
            return;
        };
        light.value = to_logical(raw, light.steps);
        light.value
    };
    let at = now_ms();
    reg.raw = Some(raw);
    cx.patch(move |pin| {
        pin.raw = Some(raw);
        pin.value = Some(Value::Level(value));
        pin.at = Some(at);
        pin.clear_aim();
    });
    reg.link.send(LinkEvent::Update {
        value: Value::Level(value),
        at,
        aim: None,
        time: None,
    });
}
