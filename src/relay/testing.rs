//! Test doubles for the relay layer

use std::io;
use std::sync::Mutex;

use crate::relay::envelope::Envelope;
use crate::relay::error::RelayError;
use crate::relay::target::RelayTarget;
use crate::relay::transport::Transport;

/// One message handed to [`RecordingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub target: String,
    pub envelope: Envelope,
    pub body: Vec<u8>,
}

/// Records every attempt; fails for the configured targets
#[derive(Default)]
pub struct RecordingTransport {
    failing: Vec<String>,
    attempts: Mutex<Vec<String>>,
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingTransport {
    pub fn failing(targets: &[&str]) -> Self {
        Self {
            failing: targets.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    /// Targets tried, in order, whether or not they succeeded
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    /// Successful deliveries
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn send(
        &self,
        target: &RelayTarget,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<(), RelayError> {
        self.attempts.lock().unwrap().push(target.to_string());

        if self.failing.contains(&target.address) {
            let refused = io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{target} refused the message"),
            );
            return Err(RelayError::Envelope(lettre::error::Error::Io(refused)));
        }

        self.sent.lock().unwrap().push(SentMessage {
            target: target.to_string(),
            envelope: envelope.clone(),
            body: body.to_vec(),
        });
        Ok(())
    }
}
