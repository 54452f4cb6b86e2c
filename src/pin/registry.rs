//! Pin registry: gatekeeper and directory for all pin links of one
//! controller entry. Runs as a single task; driver completions and timer
//! expiries come back through the same command queue, tagged with the
//! registration generation so leftovers of a removed pin are ignored.

use super::{
    spawn_io, FlavourState, IoDone, IoJob, IoOutcome, PendingOpen, Phase, PinCx, Registration,
    TimerKind,
};
use crate::config::{ControllerConfig, PinCaps};
use crate::consts::{self, Raw};
use crate::driver::DriverBank;
use crate::error::PinError;
use crate::link::{Link, PinLink};
use crate::message::{OpenInfo, RegisterRequest, WriteRequest};
use crate::state::EntryState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

pub(crate) type OpenReply = oneshot::Sender<Result<(PinLink, OpenInfo), PinError>>;
pub(crate) type WriteReply = oneshot::Sender<Result<(), PinError>>;

/// Everything the registry task reacts to.
pub(crate) enum Command {
    Register {
        req: RegisterRequest,
        reply: OpenReply,
    },
    Write {
        index: String,
        gen: u64,
        req: WriteRequest,
        reply: WriteReply,
    },
    /// Inject a raw value as if the driver had produced it.
    Emulate {
        index: String,
        value: Raw,
    },
    ReadAll,
    Unregister {
        index: String,
        gen: u64,
    },
    Timer {
        index: String,
        gen: u64,
        kind: TimerKind,
        seq: u64,
    },
    Io {
        index: String,
        gen: u64,
        done: IoDone,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running registry task. Dropping the handle shuts the
/// registry down, force-closing every active registration.
pub struct PinRegistry {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<EntryState>,
}

impl PinRegistry {
    /// Start the registry task for one controller entry.
    pub fn start(name: &str, config: &ControllerConfig, bank: Arc<dyn DriverBank>) -> PinRegistry {
        let (tx, rx) = mpsc::channel(consts::COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(EntryState {
            pin_types: config.types.clone(),
            pins: HashMap::new(),
        });
        let registry = Registry {
            name: name.to_string(),
            types: config.types.clone(),
            caps: config.pins.clone(),
            dummy: config.dummy,
            bank,
            pins: HashMap::new(),
            state: state_tx,
            tx: tx.clone(),
            next_gen: 0,
        };
        tokio::spawn(registry.run(rx));
        PinRegistry {
            commands: tx,
            state: state_rx,
        }
    }

    /// Register a pin and wait for its link to open. The response carries
    /// the client side of the link plus the pin's capability and initial
    /// value.
    pub async fn register(&self, req: RegisterRequest) -> Result<(PinLink, OpenInfo), PinError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Register { req, reply: tx })
            .await
            .map_err(|_| PinError::RegistryClosed)?;
        rx.await.map_err(|_| PinError::RegistryClosed)?
    }

    /// Feed a raw value into a pin's update path, bypassing the driver.
    pub async fn emulate(&self, index: &str, value: Raw) -> Result<(), PinError> {
        self.commands
            .send(Command::Emulate {
                index: index.to_string(),
                value,
            })
            .await
            .map_err(|_| PinError::RegistryClosed)
    }

    /// Refresh every driver-backed pin by reading its current value.
    pub async fn read_all(&self) -> Result<(), PinError> {
        self.commands
            .send(Command::ReadAll)
            .await
            .map_err(|_| PinError::RegistryClosed)
    }

    /// Snapshot of the published entry state.
    pub fn state(&self) -> EntryState {
        self.state.borrow().clone()
    }

    /// Subscription to entry state changes.
    pub fn watch_state(&self) -> watch::Receiver<EntryState> {
        self.state.clone()
    }

    /// Stop the registry, closing all registrations, and wait for it.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { done: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

impl Drop for PinRegistry {
    fn drop(&mut self) {
        let (tx, _) = oneshot::channel();
        let _ = self.commands.try_send(Command::Shutdown { done: tx });
    }
}

struct Registry {
    name: String,
    types: Vec<String>,
    caps: PinCaps,
    dummy: bool,
    bank: Arc<dyn DriverBank>,
    pins: HashMap<String, Registration>,
    state: watch::Sender<EntryState>,
    tx: mpsc::Sender<Command>,
    next_gen: u64,
}

impl Registry {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!("Pin registry {} started", self.name);
        while let Some(command) = rx.recv().await {
            match command {
                Command::Register { req, reply } => self.register(req, reply),
                Command::Write {
                    index,
                    gen,
                    req,
                    reply,
                } => self.write(index, gen, req, reply),
                Command::Emulate { index, value } => self.emulate(index, value),
                Command::ReadAll => self.read_all(),
                Command::Unregister { index, gen } => self.remove(&index, gen),
                Command::Timer {
                    index,
                    gen,
                    kind,
                    seq,
                } => self.timer(&index, gen, kind, seq),
                Command::Io { index, gen, done } => self.io(&index, gen, done),
                Command::Shutdown { done } => {
                    self.close_all();
                    let _ = done.send(());
                    break;
                }
            }
        }
        debug!("Pin registry {} stopped", self.name);
    }

    /// Registration gate. Failures reject the caller and change nothing.
    fn validate(&self, req: &RegisterRequest) -> Result<crate::config::PinCapability, PinError> {
        if req.index.is_empty() {
            return Err(PinError::invalid_args("missing pin index"));
        }
        if self.pins.contains_key(&req.index) {
            return Err(PinError::AlreadyRegistered(req.index.clone()));
        }
        let Some(row) = self.caps.get(&req.index) else {
            return Err(PinError::PinNotFound(req.index.clone()));
        };
        let Some(caps) = row.get(&req.pin_type) else {
            return Err(PinError::CapsNotFound(
                req.index.clone(),
                req.pin_type.clone(),
            ));
        };
        if !self.types.iter().any(|t| t == &req.pin_type) {
            return Err(PinError::UnknownType(req.pin_type.clone()));
        }
        Ok(caps.clone())
    }

    fn register(&mut self, req: RegisterRequest, reply: OpenReply) {
        let caps = match self.validate(&req) {
            Ok(caps) => caps,
            Err(err) => {
                debug!("Rejecting registration of pin {}: {}", req.index, err);
                let _ = reply.send(Err(err));
                return;
            }
        };
        let flavour = match FlavourState::build(&req, &caps) {
            Ok(flavour) => flavour,
            Err(err) => {
                debug!("Rejecting registration of pin {}: {}", req.index, err);
                let _ = reply.send(Err(err));
                return;
            }
        };
        let driver = if self.dummy {
            None
        } else {
            match self.bank.create(&req.index, &req.pin_type) {
                Some(driver) => Some(driver),
                None => {
                    let _ = reply.send(Err(PinError::UnknownType(req.pin_type.clone())));
                    return;
                }
            }
        };

        self.next_gen += 1;
        let gen = self.next_gen;
        let (link, events) = Link::pair();
        let mut reg = Registration::new(
            req,
            gen,
            caps,
            flavour,
            link,
            self.dummy,
            Phase::SettingUp(PendingOpen { reply, events }),
        );
        let index = reg.index.clone();
        info!(
            "Registering pin {} ({}, {:?}) on {}",
            index, reg.pin_type, reg.flavour_name, self.name
        );

        // The slot is taken from here on, so a duplicate registration
        // arriving during setup is already rejected.
        match driver {
            Some(driver) => {
                debug!("Pin {} uses driver {}", index, driver.name());
                reg.io = Some(spawn_io(index.clone(), gen, driver, self.tx.clone()));
                reg.enqueue_io(IoJob::Setup);
                self.pins.insert(index, reg);
            }
            None => {
                let raw = reg.flavour.dummy_raw(reg.setup_write);
                self.pins.insert(index.clone(), reg);
                let cx = PinCx::new(&self.tx, &self.state, index.clone(), gen);
                if let Some(reg) = self.pins.get_mut(&index) {
                    reg.finish_open(&cx, raw);
                }
            }
        }
    }

    fn write(&mut self, index: String, gen: u64, req: WriteRequest, reply: WriteReply) {
        let Some(reg) = self.pins.get_mut(&index) else {
            let _ = reply.send(Err(PinError::PinNotFound(index)));
            return;
        };
        if reg.gen != gen {
            let _ = reply.send(Err(PinError::LinkClosed));
            return;
        }
        let cx = PinCx::new(&self.tx, &self.state, index.clone(), gen);
        reg.on_write(&cx, req, reply);
        if reg.link_failed() {
            self.remove(&index, gen);
        }
    }

    fn emulate(&mut self, index: String, value: Raw) {
        let Some(reg) = self.pins.get_mut(&index) else {
            debug!("Emulated value for unknown pin {}", index);
            return;
        };
        if !reg.is_open() {
            debug!("Emulated value for still-opening pin {}", index);
            return;
        }
        let gen = reg.gen;
        let cx = PinCx::new(&self.tx, &self.state, index.clone(), gen);
        reg.on_update(&cx, value);
        if reg.link_failed() {
            self.remove(&index, gen);
        }
    }

    fn read_all(&mut self) {
        debug!("Refreshing {} registered pins", self.pins.len());
        let targets: Vec<(String, u64, bool)> = self
            .pins
            .iter()
            .filter(|(_, reg)| reg.is_open())
            .map(|(index, reg)| (index.clone(), reg.gen, reg.dummy))
            .collect();
        for (index, gen, dummy) in targets {
            if dummy {
                self.emulate(index, 0);
            } else if let Some(reg) = self.pins.get_mut(&index) {
                if reg.gen == gen {
                    reg.enqueue_io(IoJob::Read);
                }
            }
        }
    }

    fn timer(&mut self, index: &str, gen: u64, kind: TimerKind, seq: u64) {
        let Some(reg) = self.pins.get_mut(index) else {
            return;
        };
        if reg.gen != gen {
            return;
        }
        let cx = PinCx::new(&self.tx, &self.state, index.to_string(), gen);
        reg.on_timer(&cx, kind, seq);
        if reg.link_failed() {
            self.remove(index, gen);
        }
    }

    fn io(&mut self, index: &str, gen: u64, done: IoDone) {
        let Some(reg) = self.pins.get_mut(index) else {
            return;
        };
        if reg.gen != gen {
            return;
        }
        let cx = PinCx::new(&self.tx, &self.state, index.to_string(), gen);
        match reg.on_io(&cx, done) {
            IoOutcome::Keep => {
                if reg.link_failed() {
                    self.remove(index, gen);
                }
            }
            IoOutcome::Remove => self.remove(index, gen),
        }
    }

    /// Idempotent teardown. The generation guard keeps a stale removal
    /// from taking down a successor registration on the same index.
    fn remove(&mut self, index: &str, gen: u64) {
        match self.pins.get(index) {
            Some(reg) if reg.gen == gen => {}
            _ => return,
        }
        let Some(mut reg) = self.pins.remove(index) else {
            return;
        };
        info!("Removing pin {} from {}", index, self.name);
        reg.cleanup();
        // The last observed raw/value/at stay behind as a historical
        // record; a pin that never opened has no entry at all.
        self.state.send_modify(|entry| {
            if let Some(pin) = entry.pins.get_mut(index) {
                pin.clear_registration();
            }
        });
    }

    fn close_all(&mut self) {
        let registered: Vec<(String, u64)> = self
            .pins
            .iter()
            .map(|(index, reg)| (index.clone(), reg.gen))
            .collect();
        for (index, gen) in registered {
            self.remove(&index, gen);
        }
    }
}
