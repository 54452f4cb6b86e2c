pub mod counter;
pub mod light;
pub mod registry;
pub mod switch;

use crate::config::PinCapability;
use crate::consts::{self, Raw};
use crate::driver::PinDriver;
use crate::error::{DriverError, PinError};
use crate::link::{Link, PinLink};
use crate::message::{
    LinkEvent, OpenInfo, PinFlavour, RegisterRequest, SwitchPhase, Value, WriteRequest, WriteValue,
};
use crate::state::{now_ms, EntryState};
use counter::Counter;
use light::Light;
use registry::{Command, OpenReply, WriteReply};
use std::time::Duration;
use switch::Switch;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Registry context handed into pin logic: the command queue timers and
/// I/O completions report back on, and the entry-state publisher.
pub(crate) struct PinCx<'a> {
    commands: &'a mpsc::Sender<Command>,
    state: &'a watch::Sender<EntryState>,
    index: String,
    gen: u64,
}

impl<'a> PinCx<'a> {
    pub fn new(
        commands: &'a mpsc::Sender<Command>,
        state: &'a watch::Sender<EntryState>,
        index: String,
        gen: u64,
    ) -> Self {
        PinCx {
            commands,
            state,
            index,
            gen,
        }
    }

    pub fn commands(&self) -> &mpsc::Sender<Command> {
        self.commands
    }

    /// Publish a sparse patch of this pin's published state.
    pub fn patch(&self, apply: impl FnOnce(&mut crate::state::PinState)) {
        self.state
            .send_modify(|entry| apply(entry.pin_mut(&self.index)));
    }

    fn fire(&self, kind: TimerKind, seq: u64) -> TimerFire {
        TimerFire {
            commands: self.commands.clone(),
            index: self.index.clone(),
            gen: self.gen,
            kind,
            seq,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Trailing debounce window of a switch expired.
    Debounce,
    /// Switch held past the hold timeout.
    Hold,
    /// Periodic dimming step.
    DimTick,
    /// Counter throttle window expired.
    Flush,
}

/// Everything a timer task needs to report an expiry to the registry.
struct TimerFire {
    commands: mpsc::Sender<Command>,
    index: String,
    gen: u64,
    kind: TimerKind,
    seq: u64,
}

impl TimerFire {
    async fn send(&self) -> bool {
        self.commands
            .send(Command::Timer {
                index: self.index.clone(),
                gen: self.gen,
                kind: self.kind,
                seq: self.seq,
            })
            .await
            .is_ok()
    }
}

/// One schedulable timer owned by a pin state machine. Expiries travel
/// through the registry queue, so every fire carries the sequence number
/// it was armed with; a stale fire no longer matches and is dropped.
pub(crate) struct Timer {
    seq: u64,
    armed: bool,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new() -> Self {
        Timer {
            seq: 0,
            armed: false,
            task: None,
        }
    }

    pub fn armed(&self) -> bool {
        self.armed
    }

    /// Arm a one-shot. Cancels whatever was scheduled before.
    pub fn once(&mut self, cx: &PinCx<'_>, kind: TimerKind, after: Duration) {
        self.cancel();
        self.seq += 1;
        self.armed = true;
        let fire = cx.fire(kind, self.seq);
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            fire.send().await;
        }));
    }

    /// Arm a repeating tick. Cancels whatever was scheduled before.
    pub fn every(&mut self, cx: &PinCx<'_>, kind: TimerKind, period: Duration) {
        self.cancel();
        self.seq += 1;
        self.armed = true;
        let fire = cx.fire(kind, self.seq);
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if !fire.send().await {
                    break;
                }
            }
        }));
    }

    /// Consume a one-shot expiry. False means the fire was stale.
    pub fn take_fired(&mut self, seq: u64) -> bool {
        if self.armed && self.seq == seq {
            self.armed = false;
            self.task = None;
            true
        } else {
            false
        }
    }

    /// Is a repeating expiry still the active schedule?
    pub fn matches(&self, seq: u64) -> bool {
        self.armed && self.seq == seq
    }

    pub fn cancel(&mut self) {
        self.armed = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Work for the pin's driver task.
pub(crate) enum IoJob {
    Setup,
    Read,
    Write { raw: Raw, ctx: WriteCtx },
}

/// Who asked for a driver write, and who gets told about the outcome.
pub(crate) enum WriteCtx {
    /// A client write request awaiting completion.
    Client(WriteReply),
    /// The post-setup drive of a tri pin's requested initial value.
    Setup,
    /// Dimming steps and other writes nobody waits for.
    Background,
}

impl WriteCtx {
    pub fn resolve(self, result: Result<(), PinError>) {
        if let WriteCtx::Client(reply) = self {
            let _ = reply.send(result);
        }
    }
}

/// Completion of a driver call, reported back through the registry queue.
pub(crate) enum IoDone {
    Setup(Result<Raw, DriverError>),
    Read(Result<Raw, DriverError>),
    Write {
        raw: Raw,
        ctx: WriteCtx,
        result: Result<(), DriverError>,
    },
}

/// Sending half of the pin's driver task queue. Dropping it closes the
/// queue; the task finishes the backlog, releases the driver and exits.
pub(crate) struct IoQueue {
    jobs: mpsc::Sender<IoJob>,
}

impl IoQueue {
    fn push(&self, job: IoJob) -> Result<(), IoJob> {
        self.jobs.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(job) => job,
            mpsc::error::TrySendError::Closed(job) => job,
        })
    }
}

/// Run the driver of one registration on its own task, serializing all
/// calls in request order.
pub(crate) fn spawn_io(
    index: String,
    gen: u64,
    mut driver: Box<dyn PinDriver>,
    commands: mpsc::Sender<Command>,
) -> IoQueue {
    let (tx, mut rx) = mpsc::channel(consts::IO_QUEUE);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let done = match job {
                IoJob::Setup => IoDone::Setup(driver.setup().await),
                IoJob::Read => IoDone::Read(driver.read().await),
                IoJob::Write { raw, ctx } => IoDone::Write {
                    raw,
                    ctx,
                    result: driver.write(raw).await,
                },
            };
            let notice = Command::Io {
                index: index.clone(),
                gen,
                done,
            };
            if commands.send(notice).await.is_err() {
                break;
            }
        }
        driver.release().await;
        debug!("Driver task for pin {} finished", index);
    });
    IoQueue { jobs: tx }
}

/// Link establishment progress of a registration.
pub(crate) enum Phase {
    /// Setup is in flight; the register call is still waiting.
    SettingUp(PendingOpen),
    Open,
}

pub(crate) struct PendingOpen {
    pub reply: OpenReply,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Per-flavour state, dispatched explicitly. A light on a plain digital
/// output degrades to dout behaviour at build time.
pub(crate) enum FlavourState {
    Plain,
    Dout,
    Tri,
    Switch(Switch),
    Light(Light),
    Counter(Counter),
}

impl FlavourState {
    pub fn build(req: &RegisterRequest, caps: &PinCapability) -> Result<FlavourState, PinError> {
        match req.flavour {
            PinFlavour::Plain => Ok(FlavourState::Plain),
            PinFlavour::Dout => Ok(FlavourState::Dout),
            PinFlavour::Tri => Ok(FlavourState::Tri),
            PinFlavour::Switch => Ok(FlavourState::Switch(Switch::new(req))),
            PinFlavour::Counter => Ok(FlavourState::Counter(Counter::new(req))),
            PinFlavour::Light => {
                if req.pin_type == consts::TYPE_DOUT {
                    // On/off light without dimming.
                    return Ok(FlavourState::Dout);
                }
                match caps.steps {
                    Some(steps) if steps >= 1 => Ok(FlavourState::Light(Light::new(steps))),
                    _ => Err(PinError::invalid_args(format!(
                        "pin {} has no steps capability for dimming",
                        req.index
                    ))),
                }
            }
        }
    }

    /// Behaviour actually in effect, used for dispatch.
    pub fn kind(&self) -> PinFlavour {
        match self {
            FlavourState::Plain => PinFlavour::Plain,
            FlavourState::Dout => PinFlavour::Dout,
            FlavourState::Tri => PinFlavour::Tri,
            FlavourState::Switch(_) => PinFlavour::Switch,
            FlavourState::Light(_) => PinFlavour::Light,
            FlavourState::Counter(_) => PinFlavour::Counter,
        }
    }

    /// Raw value a dummy registration starts with. Switches start
    /// released, tri pins at their requested initial value.
    pub fn dummy_raw(&self, setup_write: Option<Raw>) -> Raw {
        match self {
            FlavourState::Switch(_) => 1,
            FlavourState::Tri => setup_write.unwrap_or(0),
            _ => 0,
        }
    }

    /// Fold the setup raw value into the flavour bookkeeping.
    pub fn note_setup(&mut self, raw: Raw) {
        match self {
            FlavourState::Switch(sw) => {
                sw.phase = if raw == 0 {
                    SwitchPhase::Pressed
                } else {
                    SwitchPhase::Released
                };
            }
            FlavourState::Light(light) => {
                light.value = light::to_logical(raw, light.steps);
            }
            FlavourState::Counter(counter) => counter.prev_raw = raw,
            _ => {}
        }
    }

    /// Current logical value; `raw` is only consulted by passthrough
    /// flavours.
    pub fn value_of(&self, raw: Raw) -> Value {
        match self {
            FlavourState::Switch(sw) => Value::Phase(sw.phase),
            FlavourState::Light(light) => Value::Level(light.value),
            FlavourState::Counter(counter) => Value::Count(counter.count),
            _ => Value::Raw(raw),
        }
    }

    pub fn cancel_timers(&mut self) {
        match self {
            FlavourState::Switch(sw) => {
                sw.debounce.cancel();
                sw.hold.cancel();
            }
            FlavourState::Light(light) => {
                light.timer.cancel();
                light.dim = None;
            }
            FlavourState::Counter(counter) => counter.flush.cancel(),
            _ => {}
        }
    }
}

/// Should the registry keep the registration after an I/O completion?
pub(crate) enum IoOutcome {
    Keep,
    Remove,
}

/// One active pin link on the controller side: last raw value, flavour
/// state machine, the response socket and the driver task queue.
pub(crate) struct Registration {
    pub index: String,
    pub gen: u64,
    pub pin_type: String,
    pub flavour_name: PinFlavour,
    pub caps: PinCapability,
    pub confirm: bool,
    pub dummy: bool,
    pub caption: Option<String>,
    pub entry: Option<String>,
    pub setup_write: Option<Raw>,
    pub raw: Option<Raw>,
    pub link: Link,
    pub io: Option<IoQueue>,
    pub phase: Phase,
    pub flavour: FlavourState,
}

impl Registration {
    pub fn new(
        req: RegisterRequest,
        gen: u64,
        caps: PinCapability,
        flavour: FlavourState,
        link: Link,
        dummy: bool,
        phase: Phase,
    ) -> Self {
        Registration {
            index: req.index,
            gen,
            pin_type: req.pin_type,
            flavour_name: req.flavour,
            caps,
            confirm: req.confirm,
            dummy,
            caption: req.caption,
            entry: req.entry,
            setup_write: req.write,
            raw: None,
            link,
            io: None,
            phase,
            flavour,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.phase, Phase::Open)
    }

    pub fn link_failed(&self) -> bool {
        self.link.failed()
    }

    /// Setup finished: record the raw value, publish the descriptive
    /// state and hand the open link back to the registering caller.
    pub fn finish_open(&mut self, cx: &PinCx<'_>, raw: Raw) {
        let at = now_ms();
        self.raw = Some(raw);
        self.flavour.note_setup(raw);
        let value = self.flavour.value_of(raw);

        let Phase::SettingUp(pending) = std::mem::replace(&mut self.phase, Phase::Open) else {
            return;
        };

        let pin_type = self.pin_type.clone();
        let flavour = self.flavour_name;
        let caption = self.caption.clone();
        let entry = self.entry.clone();
        let caps = self.caps.clone();
        let confirm = self.confirm;
        let dummy = self.dummy;
        cx.patch(move |pin| {
            pin.pin_type = Some(pin_type);
            pin.flavour = Some(flavour);
            pin.caption = caption;
            pin.entry = entry;
            pin.caps = Some(caps);
            pin.confirm = confirm.then_some(true);
            pin.dummy = dummy.then_some(true);
            pin.raw = Some(raw);
            pin.value = Some(value);
            pin.at = Some(at);
        });

        self.link.open();
        let link = PinLink::new(
            self.index.clone(),
            self.gen,
            pending.events,
            cx.commands().clone(),
        );
        let info = OpenInfo {
            value,
            at,
            caps: self.caps.clone(),
            confirm: self.confirm,
        };
        let _ = pending.reply.send(Ok((link, info)));
        debug!("Pin {} opened with raw {}", self.index, raw);
    }

    /// Setup failed: reject the registering caller.
    pub fn fail_open(&mut self, err: PinError) {
        if let Phase::SettingUp(pending) = std::mem::replace(&mut self.phase, Phase::Open) {
            let _ = pending.reply.send(Err(err));
        }
    }

    /// A raw value change observed on the physical side.
    pub fn on_update(&mut self, cx: &PinCx<'_>, raw: Raw) {
        match self.flavour.kind() {
            PinFlavour::Switch => switch::update(self, cx, raw),
            PinFlavour::Light => light::update(self, cx, raw),
            PinFlavour::Counter => counter::update(self, cx, raw),
            _ => self.base_update(cx, raw),
        }
    }

    /// Publish the raw change to entry state and, when the link is still
    /// up, to the client. State visibility never depends on the link.
    pub fn base_update(&mut self, cx: &PinCx<'_>, raw: Raw) {
        let at = now_ms();
        self.raw = Some(raw);
        let value = self.flavour.value_of(raw);
        cx.patch(move |pin| {
            pin.raw = Some(raw);
            pin.value = Some(value);
            pin.at = Some(at);
        });
        self.link.send(LinkEvent::Update {
            value,
            at,
            aim: None,
            time: None,
        });
    }

    /// A client write request.
    pub fn on_write(&mut self, cx: &PinCx<'_>, req: WriteRequest, reply: WriteReply) {
        if self.confirm && !req.confirmed {
            let _ = reply.send(Err(PinError::invalid_args(format!(
                "pin {} requires a confirmed write",
                self.index
            ))));
            return;
        }
        match self.flavour.kind() {
            PinFlavour::Switch | PinFlavour::Counter => {
                let _ = reply.send(Err(PinError::invalid_args(format!(
                    "pin {} is input only",
                    self.index
                ))));
            }
            PinFlavour::Light => light::write(self, cx, req, reply),
            PinFlavour::Tri => match tri_raw(&req.value) {
                Ok(raw) => self.apply_write(cx, raw, WriteCtx::Client(reply)),
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            _ => match binary_raw(&req.value) {
                Ok(raw) => self.apply_write(cx, raw, WriteCtx::Client(reply)),
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
        }
    }

    /// Drive the pin to `raw`. Dummy registrations apply the change
    /// directly; driver-backed ones go through the driver task.
    pub(crate) fn apply_write(&mut self, cx: &PinCx<'_>, raw: Raw, ctx: WriteCtx) {
        if self.dummy {
            self.on_update(cx, raw);
            ctx.resolve(Ok(()));
            return;
        }
        self.enqueue_io(IoJob::Write { raw, ctx });
    }

    pub(crate) fn enqueue_io(&mut self, job: IoJob) {
        let Some(io) = &self.io else {
            if let IoJob::Write {
                ctx: WriteCtx::Client(reply),
                ..
            } = job
            {
                let _ = reply.send(Err(PinError::Driver(DriverError::Unavailable(
                    "no driver attached".into(),
                ))));
            }
            return;
        };
        if let Err(job) = io.push(job) {
            match job {
                IoJob::Write {
                    ctx: WriteCtx::Client(reply),
                    ..
                } => {
                    let _ = reply.send(Err(PinError::Driver(DriverError::Busy)));
                }
                IoJob::Write { .. } => {
                    debug!("Pin {} driver queue full, dropping write", self.index);
                }
                IoJob::Setup | IoJob::Read => {
                    debug!("Pin {} driver queue full, dropping read", self.index);
                }
            }
        }
    }

    pub fn on_timer(&mut self, cx: &PinCx<'_>, kind: TimerKind, seq: u64) {
        match kind {
            TimerKind::Debounce => switch::debounced(self, cx, seq),
            TimerKind::Hold => switch::held(self, seq),
            TimerKind::DimTick => light::tick(self, cx, seq),
            TimerKind::Flush => counter::flushed(self, cx, seq),
        }
    }

    pub fn on_io(&mut self, cx: &PinCx<'_>, done: IoDone) -> IoOutcome {
        match done {
            IoDone::Setup(Ok(raw)) => {
                if matches!(self.flavour, FlavourState::Tri) {
                    if let Some(want) = self.setup_write {
                        if want != raw {
                            self.enqueue_io(IoJob::Write {
                                raw: want,
                                ctx: WriteCtx::Setup,
                            });
                            return IoOutcome::Keep;
                        }
                    }
                }
                self.finish_open(cx, raw);
                IoOutcome::Keep
            }
            IoDone::Setup(Err(err)) => {
                warn!("Setting up pin {} failed: {}", self.index, err);
                self.fail_open(PinError::Driver(err));
                IoOutcome::Remove
            }
            IoDone::Read(Ok(raw)) => {
                self.on_update(cx, raw);
                IoOutcome::Keep
            }
            IoDone::Read(Err(err)) => {
                warn!("Reading pin {} failed: {}", self.index, err);
                IoOutcome::Keep
            }
            IoDone::Write {
                ctx: WriteCtx::Setup,
                raw,
                result,
            } => match result {
                Ok(()) => {
                    self.finish_open(cx, raw);
                    IoOutcome::Keep
                }
                Err(err) => {
                    warn!("Initial write to pin {} failed: {}", self.index, err);
                    self.fail_open(PinError::Driver(err));
                    IoOutcome::Remove
                }
            },
            IoDone::Write { ctx, raw, result } => {
                match result {
                    Ok(()) => {
                        if matches!(ctx, WriteCtx::Client(_)) {
                            self.on_update(cx, raw);
                        }
                        ctx.resolve(Ok(()));
                    }
                    Err(err) => {
                        debug!("Writing pin {} failed: {}", self.index, err);
                        ctx.resolve(Err(PinError::Driver(err)));
                    }
                }
                IoOutcome::Keep
            }
        }
    }

    /// Tear down everything the registration owns. The driver task gets
    /// a closed queue, finishes its backlog and releases the pin.
    pub fn cleanup(&mut self) {
        self.flavour.cancel_timers();
        if self.link.failed() {
            self.link.error(&PinError::LinkClosed);
        } else {
            self.link.close();
        }
        self.io = None;
    }
}

/// Coerce a dout write payload into a raw value.
fn binary_raw(value: &WriteValue) -> Result<Raw, PinError> {
    match value {
        WriteValue::Bool(true) => Ok(1),
        WriteValue::Bool(false) => Ok(0),
        WriteValue::Num(n) if *n == 0.0 => Ok(0),
        WriteValue::Num(n) if *n == 1.0 => Ok(1),
        _ => Err(PinError::invalid_args("expecting true, false, 0 or 1")),
    }
}

/// Coerce a tri-state write payload into a raw value.
fn tri_raw(value: &WriteValue) -> Result<Raw, PinError> {
    match value {
        WriteValue::Null => Ok(0),
        WriteValue::Bool(true) => Ok(1),
        WriteValue::Bool(false) => Ok(-1),
        WriteValue::Num(n) if *n == -1.0 || *n == 0.0 || *n == 1.0 => Ok(*n as Raw),
        _ => Err(PinError::invalid_args(
            "expecting true, false, null, -1, 0 or 1",
        )),
    }
}
