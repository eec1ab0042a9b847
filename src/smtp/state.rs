//! SMTP protocol state for one connection

use crate::smtp::error::SmtpError;

/// Represents where a connection is in the command sequence
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpState {
    /// Initial state - waiting for HELO/EHLO
    Initial,
    /// HELO received - ready for MAIL command
    GreetingReceived,
    /// MAIL FROM received - ready for RCPT commands
    MailReceived,
    /// At least one RCPT TO received - ready for DATA or more RCPT commands
    RecipientsReceived,
    /// DATA accepted - the body is being streamed to the session
    DataMode,
    /// QUIT received - the connection is closing
    Closing,
}

/// Command ordering and per-transaction counters.
///
/// Transaction contents (sender, recipients, body) are handed to the
/// [`Session`](crate::smtp::Session) as they arrive; this only tracks what the
/// protocol allows next.
#[derive(Debug)]
pub struct ProtocolState {
    /// Current state of the connection
    pub state: SmtpState,
    /// Client domain from HELO/EHLO command
    pub client_domain: Option<String>,
    /// Whether the client greeted with EHLO
    pub extended: bool,
    /// Recipients accepted in the current transaction
    pub recipients: usize,
    /// Transactions completed on this connection
    pub transactions: usize,
    /// Limit for `recipients`
    max_recipients: usize,
}

impl ProtocolState {
    /// Create the state for a fresh connection
    pub fn new(max_recipients: usize) -> Self {
        Self {
            state: SmtpState::Initial,
            client_domain: None,
            extended: false,
            recipients: 0,
            transactions: 0,
            max_recipients,
        }
    }

    /// Reset to post-HELO state (clears transaction counters)
    pub fn reset(&mut self) {
        self.state = SmtpState::GreetingReceived;
        self.recipients = 0;
    }

    /// Record the HELO/EHLO greeting; starts over any open transaction
    pub fn greet(&mut self, domain: String, extended: bool) {
        self.client_domain = Some(domain);
        self.extended = extended;
        self.reset();
    }

    /// Record an accepted MAIL FROM
    pub fn mail_accepted(&mut self) {
        self.recipients = 0;
        self.state = SmtpState::MailReceived;
    }

    /// Reserve room for one more recipient
    pub fn check_recipient_limit(&self) -> Result<(), SmtpError> {
        if self.recipients >= self.max_recipients {
            return Err(SmtpError::TooManyRecipients {
                max: self.max_recipients,
            });
        }
        Ok(())
    }

    /// Record an accepted RCPT TO
    pub fn recipient_accepted(&mut self) {
        self.recipients += 1;
        self.state = SmtpState::RecipientsReceived;
    }

    /// Enter the body phase
    pub fn start_data(&mut self) {
        self.state = SmtpState::DataMode;
    }

    /// The body phase is over, successfully or not
    pub fn finish_data(&mut self, completed: bool) {
        if completed {
            self.transactions += 1;
        }
        self.reset();
    }

    /// Mark the connection as closing after QUIT
    pub fn close(&mut self) {
        self.state = SmtpState::Closing;
    }

    pub fn is_closing(&self) -> bool {
        self.state == SmtpState::Closing
    }

    /// Check if the connection is ready for a specific command
    pub fn can_execute_command(&self, command: &str) -> bool {
        match command.to_uppercase().as_str() {
            "EHLO" | "HELO" => self.state != SmtpState::Closing,
            "MAIL" => self.state == SmtpState::GreetingReceived,
            "RCPT" => {
                self.state == SmtpState::MailReceived || self.state == SmtpState::RecipientsReceived
            }
            "DATA" => self.state == SmtpState::RecipientsReceived,
            "RSET" => self.state != SmtpState::Initial && self.state != SmtpState::Closing,
            "NOOP" => true, // NOOP can be sent at any time
            "QUIT" => true, // QUIT can be sent at any time
            _ => false,
        }
    }
}
