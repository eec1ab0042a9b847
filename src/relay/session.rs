//! Relay-side implementation of the protocol engine's session contract

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::relay::dispatcher::RelayDispatcher;
use crate::relay::envelope::{Envelope, MessageBuffer};
use crate::smtp::error::SmtpError;
use crate::smtp::session::{Backend, MailOptions, RcptOptions, Session};

/// When a received message is relayed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayTrigger {
    /// At connection teardown, with the last transaction of the connection
    #[default]
    Logout,
    /// As soon as each message body has been received
    Transaction,
}

/// Lifecycle of one [`RelaySession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    EnvelopeOpen,
    RecipientsCollected,
    BodyReceived,
    Terminated,
}

/// Session factory handed to the server
pub struct RelayBackend {
    dispatcher: Arc<RelayDispatcher>,
    trigger: RelayTrigger,
}

impl RelayBackend {
    pub fn new(dispatcher: Arc<RelayDispatcher>, trigger: RelayTrigger) -> Self {
        Self {
            dispatcher,
            trigger,
        }
    }
}

impl Backend for RelayBackend {
    type Session = RelaySession;

    fn new_session(&self, peer: SocketAddr) -> Result<RelaySession, SmtpError> {
        Ok(RelaySession::new(
            Arc::clone(&self.dispatcher),
            self.trigger,
            peer,
        ))
    }
}

/// Transaction state of one inbound connection
pub struct RelaySession {
    envelope: Envelope,
    buffer: MessageBuffer,
    state: SessionState,
    dispatcher: Arc<RelayDispatcher>,
    trigger: RelayTrigger,
    peer: SocketAddr,
}

impl RelaySession {
    pub fn new(dispatcher: Arc<RelayDispatcher>, trigger: RelayTrigger, peer: SocketAddr) -> Self {
        Self {
            envelope: Envelope::default(),
            buffer: MessageBuffer::new(),
            state: SessionState::New,
            dispatcher,
            trigger,
            peer,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn message(&self) -> &MessageBuffer {
        &self.buffer
    }

    fn ensure_open(&self, command: &str) -> Result<(), SmtpError> {
        if self.state == SessionState::Terminated {
            return Err(SmtpError::InvalidState(format!(
                "{command} after the session ended"
            )));
        }
        Ok(())
    }

    fn relay_current(&mut self) -> Result<(), SmtpError> {
        debug!(
            peer = %self.peer,
            from = %self.envelope.return_path,
            recipients = self.envelope.recipients.len(),
            bytes = self.buffer.len(),
            subject = self.buffer.subject().as_deref().unwrap_or(""),
            "Relaying message"
        );
        self.dispatcher
            .relay(&self.envelope, self.buffer.as_bytes())
            .map_err(SmtpError::from)
    }

    fn discard(&mut self) {
        self.envelope.clear();
        self.buffer.clear();
    }
}

impl Session for RelaySession {
    fn mail(&mut self, from: &str, _options: &MailOptions) -> Result<(), SmtpError> {
        self.ensure_open("MAIL")?;
        self.envelope.set_return_path(from);
        self.buffer.clear();
        self.state = SessionState::EnvelopeOpen;
        Ok(())
    }

    fn rcpt(&mut self, to: &str, _options: &RcptOptions) -> Result<(), SmtpError> {
        self.ensure_open("RCPT")?;
        self.envelope.add_recipient(to);
        self.state = SessionState::RecipientsCollected;
        Ok(())
    }

    fn data(&mut self, source: &mut dyn Read) -> Result<(), SmtpError> {
        self.ensure_open("DATA")?;

        if let Err(e) = self.buffer.fill_from(source) {
            warn!(peer = %self.peer, error = %e, "Failed to read message body");
            // Nothing left to relay for this transaction
            self.state = SessionState::EnvelopeOpen;
            return Err(SmtpError::DataRead(e));
        }
        self.state = SessionState::BodyReceived;

        match self.trigger {
            RelayTrigger::Logout => Ok(()),
            RelayTrigger::Transaction => {
                let result = self.relay_current();
                self.discard();
                self.state = SessionState::New;
                result
            }
        }
    }

    fn reset(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.discard();
        self.state = SessionState::New;
    }

    /// Relays only when a body was fully received (`BodyReceived`); any other
    /// state ends the session without relaying. Repeated calls do nothing.
    fn logout(&mut self) -> Result<(), SmtpError> {
        let previous = std::mem::replace(&mut self.state, SessionState::Terminated);
        match previous {
            SessionState::Terminated => Ok(()),
            SessionState::BodyReceived => {
                let result = self.relay_current();
                self.discard();
                result
            }
            _ => {
                debug!(peer = %self.peer, state = ?previous, "Nothing to relay at logout");
                self.discard();
                Ok(())
            }
        }
    }
}
