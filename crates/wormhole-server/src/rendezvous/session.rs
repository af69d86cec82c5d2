//! Per-connection protocol state machine.
//!
//! The session is owned by the socket's read pump and mutated from that one
//! task; its only shared edges are the bounded outbound queue (drained by
//! the write pump) and the shutdown flag. The mailbox fan-out reaches the
//! session through [`SessionListener`], which holds clones of those edges
//! and nothing else, so the mailbox layer never names the session type.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use wormhole_proto::messages::{
    Add, Bind, Claim, Close, ClientCommand, ClientFrame, NameplateEntry, Open, ParseError, Ping,
    Release, ServerMessage,
};
use wormhole_proto::ClientError;
use wormhole_store::MessageRow;

use crate::error::RelayError;
use crate::rendezvous::application::Application;
use crate::rendezvous::mailbox::{Mailbox, MailboxListener};
use crate::rendezvous::service::RendezvousService;

/// Pushes mailbox traffic into a session's outbound queue. Runs under the
/// mailbox lock, so it must never block: a full queue means the session is
/// too slow to live and gets shut down instead.
struct SessionListener {
    outbound: mpsc::Sender<ServerMessage>,
    shutdown: watch::Sender<bool>,
    listening: Arc<AtomicBool>,
}

impl MailboxListener for SessionListener {
    fn on_message(&self, message: &MessageRow) {
        let frame = ServerMessage::Message {
            side: message.side.clone(),
            phase: message.phase.clone(),
            body: message.body.clone(),
            id: message.id.clone(),
            server_rx: message.server_rx,
        };
        if self.outbound.try_send(frame).is_err() {
            debug!("outbound queue overflow, dropping session");
            let _ = self.shutdown.send(true);
        }
    }

    fn on_stop(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }
}

pub struct Session {
    service: Arc<RendezvousService>,
    outbound: mpsc::Sender<ServerMessage>,
    shutdown: watch::Sender<bool>,

    app: Option<Arc<Application>>,
    side: String,
    nameplate: String,
    mailbox: Option<Arc<Mailbox>>,
    listener_handle: u64,
    listening: Arc<AtomicBool>,

    allocated: bool,
    claimed: bool,
    released: bool,
    closed: bool,
}

impl Session {
    pub fn new(
        service: Arc<RendezvousService>,
        outbound: mpsc::Sender<ServerMessage>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            service,
            outbound,
            shutdown,
            app: None,
            side: String::new(),
            nameplate: String::new(),
            mailbox: None,
            listener_handle: 0,
            listening: Arc::new(AtomicBool::new(false)),
            allocated: false,
            claimed: false,
            released: false,
            closed: false,
        }
    }

    fn is_bound(&self) -> bool {
        self.app.is_some() && !self.side.is_empty()
    }

    fn enqueue(&self, message: ServerMessage) {
        if self.outbound.try_send(message).is_err() {
            debug!("outbound queue overflow, dropping session");
            let _ = self.shutdown.send(true);
        }
    }

    /// Handle one raw inbound frame: parse, ack, gate on bind, dispatch.
    /// Handler failures become `error` frames; the session itself survives
    /// everything except socket trouble.
    pub fn on_frame(&mut self, raw: &[u8]) {
        let frame = match ClientFrame::parse(raw) {
            Ok(frame) => frame,
            Err(ParseError::UnknownType(kind)) => {
                debug!(kind = %kind, "client sent unknown message type");
                return self.frame_error(ClientError::UnknownType.into(), raw);
            }
            Err(ParseError::MissingType) => {
                return self.frame_error(ClientError::UnknownType.into(), raw);
            }
            Err(ParseError::Malformed(e)) => {
                debug!(error = %e, "client frame failed to parse");
                return self.frame_error(RelayError::Malformed(e), raw);
            }
        };

        // Ack first, before the command has any effect.
        self.enqueue(ServerMessage::Ack {
            id: frame.id.clone(),
        });

        if !self.is_bound()
            && !matches!(
                frame.command,
                ClientCommand::Ping(_) | ClientCommand::Bind(_)
            )
        {
            return self.frame_error(ClientError::BindFirst.into(), raw);
        }

        let result = match frame.command {
            ClientCommand::Ping(m) => {
                self.handle_ping(m);
                Ok(())
            }
            ClientCommand::Bind(m) => self.handle_bind(m),
            ClientCommand::List => self.handle_list(),
            ClientCommand::Allocate => self.handle_allocate(),
            ClientCommand::Claim(m) => self.handle_claim(m),
            ClientCommand::Release(m) => self.handle_release(m),
            ClientCommand::Open(m) => self.handle_open(m),
            ClientCommand::Add(m) => self.handle_add(m, frame.id.as_deref().unwrap_or("")),
            ClientCommand::Close(m) => self.handle_close(m),
        };

        if let Err(e) = result {
            self.frame_error(e, raw);
        }
    }

    /// Detach from the mailbox on socket teardown.
    pub fn teardown(&mut self) {
        if let Some(mailbox) = self.mailbox.take() {
            if self.listener_handle > 0 {
                mailbox.remove_listener(self.listener_handle);
            }
        }
        self.listener_handle = 0;
        self.listening.store(false, Ordering::SeqCst);
    }

    fn frame_error(&self, err: RelayError, orig: &[u8]) {
        if err.is_client() {
            debug!(error = %err, "rejecting client message");
        } else {
            error!(error = %err, "internal error while handling client message");
        }

        self.enqueue(ServerMessage::Error {
            error: err.wire_text(),
            orig: String::from_utf8_lossy(orig).into_owned(),
        });
    }

    fn handle_ping(&self, m: Ping) {
        self.enqueue(ServerMessage::Pong { pong: m.ping });
    }

    fn handle_bind(&mut self, m: Bind) -> Result<(), RelayError> {
        if self.is_bound() {
            return Err(ClientError::Bound.into());
        }
        if m.app_id.is_empty() {
            return Err(ClientError::BindAppId.into());
        }
        if m.side.is_empty() {
            return Err(ClientError::BindSide.into());
        }

        self.app = Some(self.service.get_app(&m.app_id));
        self.side = m.side.clone();

        info!(app = %m.app_id, side = %m.side, "bound client");
        Ok(())
    }

    fn app(&self) -> Result<&Arc<Application>, RelayError> {
        // The bind gate runs before every handler that calls this.
        self.app
            .as_ref()
            .ok_or_else(|| ClientError::BindFirst.into())
    }

    fn handle_list(&self) -> Result<(), RelayError> {
        if !self.service.allow_list() {
            self.enqueue(ServerMessage::Nameplates {
                nameplates: Vec::new(),
            });
            return Ok(());
        }

        let ids = self.app()?.get_nameplate_ids()?;
        self.enqueue(ServerMessage::Nameplates {
            nameplates: ids.into_iter().map(|id| NameplateEntry { id }).collect(),
        });
        Ok(())
    }

    fn handle_allocate(&mut self) -> Result<(), RelayError> {
        if self.allocated {
            return Err(ClientError::AlreadyAllocated.into());
        }

        let nameplate = self.app()?.allocate_nameplate(&self.side)?;
        self.allocated = true;
        self.nameplate = nameplate.clone();

        self.enqueue(ServerMessage::Allocated { nameplate });
        Ok(())
    }

    fn handle_claim(&mut self, m: Claim) -> Result<(), RelayError> {
        if self.claimed {
            return Err(ClientError::AlreadyClaimed.into());
        }
        if m.nameplate.is_empty() {
            return Err(ClientError::ClaimNameplate.into());
        }

        // A session claiming its own allocation already holds the side; it
        // gets the mailbox binding back instead of a re-claim error.
        let mailbox = if self.allocated && m.nameplate == self.nameplate {
            let app = self.app()?;
            let mailbox_id = app.mailbox_for_nameplate(&m.nameplate)?;
            app.open_mailbox(&mailbox_id, &self.side)?;
            mailbox_id
        } else {
            self.app()?.claim_nameplate(&m.nameplate, &self.side)?
        };
        self.claimed = true;
        self.nameplate = m.nameplate;

        self.enqueue(ServerMessage::Claimed { mailbox });
        Ok(())
    }

    fn handle_release(&mut self, m: Release) -> Result<(), RelayError> {
        if self.released {
            return Err(ClientError::AlreadyReleased.into());
        }

        if !m.nameplate.is_empty() && m.nameplate != self.nameplate {
            return Err(ClientError::ReleaseNameplate.into());
        }
        if m.nameplate.is_empty() && self.nameplate.is_empty() {
            return Err(ClientError::ReleaseNotClaimed.into());
        }

        self.app()?.release_nameplate(&self.nameplate, &self.side)?;
        self.released = true;

        self.enqueue(ServerMessage::Released {});
        Ok(())
    }

    fn handle_open(&mut self, m: Open) -> Result<(), RelayError> {
        if self.mailbox.is_some() {
            return Err(ClientError::AlreadyOpened.into());
        }
        if m.mailbox.is_empty() {
            return Err(ClientError::OpenMailbox.into());
        }

        let mailbox = self.app()?.open_mailbox(&m.mailbox, &self.side)?;

        self.listening.store(true, Ordering::SeqCst);
        let listener = SessionListener {
            outbound: self.outbound.clone(),
            shutdown: self.shutdown.clone(),
            listening: self.listening.clone(),
        };
        match mailbox.subscribe(Box::new(listener)) {
            Ok(handle) => {
                self.listener_handle = handle;
                self.mailbox = Some(mailbox);
                Ok(())
            }
            Err(e) => {
                self.listening.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    fn handle_add(&mut self, m: Add, message_id: &str) -> Result<(), RelayError> {
        let Some(mailbox) = self.mailbox.as_ref() else {
            return Err(ClientError::OpenFirst.into());
        };

        if m.phase.is_empty() {
            return Err(ClientError::AddPhase.into());
        }
        if m.body.is_empty() {
            return Err(ClientError::AddBody.into());
        }

        let app_id = self.app()?.id().to_string();
        mailbox.add_message(MessageRow {
            id: message_id.to_string(),
            app_id,
            mailbox_id: mailbox.id().to_string(),
            side: self.side.clone(),
            phase: m.phase,
            body: m.body,
            server_rx: Utc::now().timestamp(),
        })?;

        // No direct response; the fan-out echoes the message back.
        Ok(())
    }

    fn handle_close(&mut self, m: Close) -> Result<(), RelayError> {
        if self.closed {
            return Err(ClientError::AlreadyClosed.into());
        }

        if !m.mailbox.is_empty() {
            if let Some(mailbox) = self.mailbox.as_ref() {
                if mailbox.id() != m.mailbox {
                    return Err(ClientError::CloseMailbox.into());
                }
            }
        } else if self.mailbox.is_none() {
            return Err(ClientError::CloseOpenFirst.into());
        }

        // Closing by explicit id without an open handle re-opens the mailbox
        // just long enough to close this side of it.
        if self.mailbox.is_none() {
            let mailbox = self.app()?.open_mailbox(&m.mailbox, &self.side)?;
            self.mailbox = Some(mailbox);
        }

        let mailbox = self
            .mailbox
            .as_ref()
            .ok_or(ClientError::CloseOpenFirst)?
            .clone();
        self.app()?.close_mailbox(&mailbox, &self.side, &m.mood)?;

        if self.listening.swap(false, Ordering::SeqCst) && self.listener_handle > 0 {
            mailbox.remove_listener(self.listener_handle);
        }
        self.listener_handle = 0;
        self.mailbox = None;
        self.closed = true;

        self.enqueue(ServerMessage::Closed {});
        Ok(())
    }
}
