//! Convenience wrappers over a raw pin link, tracking the last delivered
//! value so entry logic can consult it between events.

use crate::error::PinError;
use crate::link::PinLink;
use crate::message::{LinkEvent, OpenInfo, SwitchPhase, Value, WriteRequest};
use tracing::warn;

/// Pin link client for value-bearing flavours. Gesture events are not
/// expected on these links and are skipped if they appear.
pub struct ValueClient {
    link: PinLink,
    value: Value,
    at: i64,
    aim: Option<f64>,
    time: Option<u64>,
    synced: bool,
}

impl ValueClient {
    pub fn new(link: PinLink, info: &OpenInfo) -> Self {
        ValueClient {
            link,
            value: info.value,
            at: info.at,
            aim: None,
            time: None,
            synced: true,
        }
    }

    pub fn index(&self) -> &str {
        self.link.index()
    }

    /// Last delivered value.
    pub fn value(&self) -> Value {
        self.value
    }

    /// Millisecond timestamp of the last delivered value.
    pub fn at(&self) -> i64 {
        self.at
    }

    /// Target of an in-flight dim transition, if one is running.
    pub fn aim(&self) -> Option<f64> {
        self.aim
    }

    pub fn time(&self) -> Option<u64> {
        self.time
    }

    /// The link is still delivering events.
    pub fn synced(&self) -> bool {
        self.synced
    }

    /// Wait for the next value change. `None` once the link is gone; the
    /// last value stays readable but is no longer updated.
    pub async fn changed(&mut self) -> Option<Value> {
        loop {
            match self.link.recv().await {
                Some(LinkEvent::Update {
                    value,
                    at,
                    aim,
                    time,
                }) => {
                    self.value = value;
                    self.at = at;
                    self.aim = aim;
                    self.time = time;
                    return Some(value);
                }
                Some(LinkEvent::Error { reason }) => {
                    warn!("Pin link {} failed: {}", self.link.index(), reason);
                    self.synced = false;
                    return None;
                }
                Some(LinkEvent::Closed) | None => {
                    self.synced = false;
                    return None;
                }
                Some(_) => continue,
            }
        }
    }

    pub async fn write(&self, req: WriteRequest) -> Result<(), PinError> {
        self.link.write(req).await
    }

    pub async fn close(self) {
        self.link.close().await;
    }
}

/// A single settled switch gesture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gesture {
    Press { at: i64 },
    Release { at: i64 },
    Tap { at: i64, count: u32 },
    Hold { at: i64 },
}

/// Pin link client for switch pins, folding the event stream into the
/// current pressed/released phase.
pub struct SwitchClient {
    link: PinLink,
    phase: SwitchPhase,
    synced: bool,
}

impl SwitchClient {
    pub fn new(link: PinLink, info: &OpenInfo) -> Self {
        let phase = match info.value {
            Value::Phase(phase) => phase,
            _ => SwitchPhase::Released,
        };
        SwitchClient {
            link,
            phase,
            synced: true,
        }
    }

    pub fn index(&self) -> &str {
        self.link.index()
    }

    pub fn phase(&self) -> SwitchPhase {
        self.phase
    }

    pub fn synced(&self) -> bool {
        self.synced
    }

    /// Wait for the next gesture. `None` once the link is gone.
    pub async fn gesture(&mut self) -> Option<Gesture> {
        loop {
            match self.link.recv().await {
                Some(LinkEvent::Press { at }) => {
                    self.phase = SwitchPhase::Pressed;
                    return Some(Gesture::Press { at });
                }
                Some(LinkEvent::Release { at }) => {
                    self.phase = SwitchPhase::Released;
                    return Some(Gesture::Release { at });
                }
                Some(LinkEvent::Tap { at, count }) => return Some(Gesture::Tap { at, count }),
                Some(LinkEvent::Hold { at }) => return Some(Gesture::Hold { at }),
                Some(LinkEvent::Error { reason }) => {
                    warn!("Pin link {} failed: {}", self.link.index(), reason);
                    self.synced = false;
                    return None;
                }
                Some(LinkEvent::Closed) | None => {
                    self.synced = false;
                    return None;
                }
                Some(LinkEvent::Update { .. }) => continue,
            }
        }
    }

    pub async fn close(self) {
        self.link.close().await;
    }
}
