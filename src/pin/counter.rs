//! Counter flavour: a digital input counting rising edges, with client
//! updates throttled so a fast pulse train does not flood the link.

use super::{FlavourState, PinCx, Registration, Timer, TimerKind};
use crate::consts::{self, Raw};
use crate::message::{LinkEvent, RegisterRequest, Value};
use crate::state::now_ms;
use std::time::Duration;

pub(crate) struct Counter {
    pub throttle_ms: u64,
    pub count: u64,
    pub prev_raw: Raw,
    /// Edges arrived inside the throttle window; send a trailing update.
    pub pending: bool,
    pub flush: Timer,
}

impl Counter {
    pub fn new(req: &RegisterRequest) -> Self {
        Counter {
            throttle_ms: req.throttle.unwrap_or(consts::COUNTER_THROTTLE_MS),
            count: 0,
            prev_raw: 0,
            pending: false,
            flush: Timer::new(),
        }
    }
}

/// Raw change: count rising edges. Entry state is patched on every edge,
/// the client sees at most one update per throttle window plus a
/// trailing one carrying the latest count.
pub(crate) fn update(reg: &mut Registration, cx: &PinCx<'_>, raw: Raw) {
    let now = now_ms();
    let Registration { flavour, link, .. } = reg;
    let FlavourState::Counter(counter) = flavour else {
        return;
    };

    let edge = counter.prev_raw == 0 && raw != 0;
    counter.prev_raw = raw;
    if edge {
        counter.count += 1;
        if counter.flush.armed() {
            counter.pending = true;
        } else {
            link.send(LinkEvent::Update {
                value: Value::Count(counter.count),
                at: now,
                aim: None,
                time: None,
            });
            counter
                .flush
                .once(cx, TimerKind::Flush, Duration::from_millis(counter.throttle_ms));
        }
    }

    let count = counter.count;
    reg.raw = Some(raw);
    cx.patch(move |pin| {
        pin.raw = Some(raw);
        pin.at = Some(now);
        if edge {
            pin.value = Some(Value::Count(count));
        }
    });
}

/// Throttle window expired: deliver the trailing update if edges arrived
/// meanwhile, keeping the window armed while the train continues.
pub(crate) fn flushed(reg: &mut Registration, cx: &PinCx<'_>, seq: u64) {
    let Registration { flavour, link, .. } = reg;
    let FlavourState::Counter(counter) = flavour else {
        return;
    };
    if !counter.flush.take_fired(seq) {
        return;
    }
    if counter.pending {
        counter.pending = false;
        link.send(LinkEvent::Update {
            value: Value::Count(counter.count),
            at: now_ms(),
            aim: None,
            time: None,
        });
        counter
            .flush
            .once(cx, TimerKind::Flush, Duration::from_millis(counter.throttle_ms));
    }
}
