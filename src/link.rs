use crate::consts;
use crate::error::PinError;
use crate::message::{LinkEvent, WriteRequest};
use crate::pin::registry::Command;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Controller-side end of a pin link: the event queue to the client plus
/// the open/close bookkeeping every send is guarded by.
pub(crate) struct Link {
    tx: mpsc::Sender<LinkEvent>,
    open: bool,
    failed: bool,
}

impl Link {
    /// Create a link pair. The receiver half becomes the client's
    /// [`PinLink`] once the registration opens.
    pub fn pair() -> (Link, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel(consts::LINK_QUEUE);
        (
            Link {
                tx,
                open: false,
                failed: false,
            },
            rx,
        )
    }

    pub fn can_send(&self) -> bool {
        self.open && !self.tx.is_closed()
    }

    /// Mark the link open. The initial response travels through the
    /// register reply, not through the event queue.
    pub fn open(&mut self) {
        self.open = true;
    }

    /// Queue an event for the client. `false` means the client is gone
    /// or hopelessly behind; the registration should be torn down.
    pub fn send(&mut self, event: LinkEvent) -> bool {
        if !self.can_send() {
            return false;
        }
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("Pin link queue full, closing. Dropped: {:?}", event);
                self.open = false;
                self.failed = true;
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.open = false;
                self.failed = true;
                false
            }
        }
    }

    /// A send has already failed on this link.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Final close notification. Safe to call on a dead link.
    pub fn close(&mut self) {
        if self.open {
            let _ = self.tx.try_send(LinkEvent::Closed);
            self.open = false;
        }
    }

    /// Terminal failure notification. Sent regardless of the open flag so
    /// a client whose queue overflowed still learns it was cut off.
    pub fn error(&mut self, err: &PinError) {
        let _ = self.tx.try_send(LinkEvent::Error {
            reason: err.to_string(),
        });
        self.open = false;
    }
}

/// Client-side end of a pin link. Receives controller events and carries
/// write requests back to the registry. Dropping it unregisters the pin.
pub struct PinLink {
    index: String,
    gen: u64,
    events: mpsc::Receiver<LinkEvent>,
    commands: mpsc::Sender<Command>,
    detached: bool,
}

impl PinLink {
    pub(crate) fn new(
        index: String,
        gen: u64,
        events: mpsc::Receiver<LinkEvent>,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        PinLink {
            index,
            gen,
            events,
            commands,
            detached: false,
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Next event from the controller. `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        let event = self.events.recv().await;
        if matches!(event, None | Some(LinkEvent::Closed) | Some(LinkEvent::Error { .. })) {
            self.detached = true;
        }
        event
    }

    /// Change the pin. Resolves once the write took effect on the driver,
    /// or with the validation or driver error.
    pub async fn write(&self, req: WriteRequest) -> Result<(), PinError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Write {
                index: self.index.clone(),
                gen: self.gen,
                req,
                reply: tx,
            })
            .await
            .map_err(|_| PinError::RegistryClosed)?;
        rx.await.map_err(|_| PinError::LinkClosed)?
    }

    /// Tear the registration down.
    pub async fn close(mut self) {
        self.detached = true;
        let _ = self
            .commands
            .send(Command::Unregister {
                index: self.index.clone(),
                gen: self.gen,
            })
            .await;
    }
}

impl Drop for PinLink {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let unregister = Command::Unregister {
            index: self.index.clone(),
            gen: self.gen,
        };
        if self.commands.try_send(unregister).is_err() {
            debug!("Dropping pin link {} without unregistering", self.index);
        }
    }
}
