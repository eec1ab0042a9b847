//! Outbound SMTP client: one conversation per target per message

use std::time::Duration;

use lettre::address::Address;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::{SmtpTransport, Transport as _};
use serde::Deserialize;

use crate::relay::envelope::Envelope;
use crate::relay::error::RelayError;
use crate::relay::target::RelayTarget;

/// Sends one message to one upstream
pub trait Transport: Send + Sync {
    /// Run one complete SMTP client conversation with `target`
    fn send(
        &self,
        target: &RelayTarget,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<(), RelayError>;
}

/// STARTTLS behaviour towards upstreams
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plain text only
    None,
    /// Upgrade when the upstream offers STARTTLS
    #[default]
    Opportunistic,
    /// Refuse to send without STARTTLS
    Required,
}

/// [`Transport`] backed by `lettre`.
///
/// No credentials are sent. The target's host is the TLS server name.
#[derive(Debug, Clone)]
pub struct SmtpRelay {
    hello_name: String,
    tls: TlsMode,
    timeout: Option<Duration>,
}

impl SmtpRelay {
    /// `hello_name` is sent with EHLO, usually the relay's own domain
    pub fn new(hello_name: &str, tls: TlsMode, timeout: Option<Duration>) -> Self {
        Self {
            hello_name: hello_name.to_owned(),
            tls,
            timeout,
        }
    }

    fn build_transport(&self, target: &RelayTarget) -> Result<SmtpTransport, RelayError> {
        let tls = match self.tls {
            TlsMode::None => Tls::None,
            TlsMode::Opportunistic => {
                Tls::Opportunistic(TlsParameters::new(target.host.clone())?)
            }
            TlsMode::Required => Tls::Required(TlsParameters::new(target.host.clone())?),
        };

        let mut builder = SmtpTransport::builder_dangerous(target.host.as_str())
            .port(target.port)
            .tls(tls)
            .hello_name(ClientId::Domain(self.hello_name.clone()));
        if self.timeout.is_some() {
            builder = builder.timeout(self.timeout);
        }

        Ok(builder.build())
    }
}

impl Transport for SmtpRelay {
    fn send(
        &self,
        target: &RelayTarget,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<(), RelayError> {
        let envelope = build_lettre_envelope(envelope)?;
        let transport = self.build_transport(target)?;
        transport.send_raw(&envelope, body)?;
        Ok(())
    }
}

/// Convert an envelope to lettre's; an empty return path is the null sender
fn build_lettre_envelope(envelope: &Envelope) -> Result<lettre::address::Envelope, RelayError> {
    let from = if envelope.return_path.is_empty() {
        None
    } else {
        Some(parse_mailbox(&envelope.return_path)?)
    };

    let to = envelope
        .recipients
        .iter()
        .map(|rcpt| parse_mailbox(rcpt))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(lettre::address::Envelope::new(from, to)?)
}

fn parse_mailbox(address: &str) -> Result<Address, RelayError> {
    address.parse().map_err(|source| RelayError::Mailbox {
        address: address.to_owned(),
        source,
    })
}
