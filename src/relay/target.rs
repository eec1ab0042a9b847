//! Upstream destinations

use std::fmt;

use crate::relay::error::AddressError;

/// Port used when a destination does not name one
pub const DEFAULT_SMTP_PORT: u16 = 25;

/// One upstream SMTP server, parsed once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    /// Address as configured, e.g. `mail1:25`
    pub address: String,
    /// Host part of `address`; also the TLS / authentication server name
    pub host: String,
    pub port: u16,
}

impl RelayTarget {
    /// Parse a `host[:port]` destination.
    ///
    /// IPv6 literals are written in brackets, `[::1]:2525`.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let address = address.trim();
        let host = auth_host(address);
        if host.is_empty() {
            return Err(AddressError::EmptyHost(address.to_owned()));
        }

        let port = match port_part(address) {
            None => DEFAULT_SMTP_PORT,
            Some(port) => port
                .parse()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| AddressError::InvalidPort {
                    address: address.to_owned(),
                    port: port.to_owned(),
                })?,
        };

        Ok(Self {
            address: address.to_owned(),
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// The primary and backup upstreams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    pub primary: RelayTarget,
    /// Tried in this order after the primary accepted a message
    pub backups: Vec<RelayTarget>,
}

impl Destinations {
    pub fn parse<S: AsRef<str>>(primary: &str, backups: &[S]) -> Result<Self, AddressError> {
        Ok(Self {
            primary: RelayTarget::parse(primary)?,
            backups: backups
                .iter()
                .map(|backup| RelayTarget::parse(backup.as_ref()))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Host used for authentication and TLS when talking to `address`.
///
/// Strips a trailing `:port` and the brackets of an IPv6 literal. An
/// unbracketed address with several colons is taken to be a bare IPv6
/// address and returned whole.
pub fn auth_host(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        };
    }

    match address.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => address,
    }
}

/// The text after the host separator, if any
fn port_part(address: &str) -> Option<&str> {
    if let Some(rest) = address.strip_prefix('[') {
        return rest
            .find(']')
            .and_then(|end| rest[end + 1..].strip_prefix(':'));
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Some(port),
        _ => None,
    }
}
