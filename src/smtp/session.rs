//! Callback contract between the protocol engine and the code that owns a
//! mail transaction.
//!
//! The server parses the command stream and enforces command ordering. It
//! calls into a [`Session`] for every accepted transaction step, one session
//! per connection, created by a [`Backend`].

use std::io::Read;
use std::net::SocketAddr;

use crate::smtp::error::SmtpError;

/// Creates one [`Session`] per accepted connection
pub trait Backend: Send + Sync + 'static {
    type Session: Session;

    /// Called for every new connection before the greeting is sent
    fn new_session(&self, peer: SocketAddr) -> Result<Self::Session, SmtpError>;
}

/// Per-connection transaction callbacks
pub trait Session: Send {
    /// `MAIL FROM`: set the return path of the current transaction
    fn mail(&mut self, from: &str, options: &MailOptions) -> Result<(), SmtpError>;

    /// `RCPT TO`: add a recipient to the current transaction
    fn rcpt(&mut self, to: &str, options: &RcptOptions) -> Result<(), SmtpError>;

    /// `DATA`: receive the message body.
    ///
    /// `source` must be consumed to the end before this returns. The server
    /// drains whatever is left, but a session that stops early loses the
    /// rest of the body.
    fn data(&mut self, source: &mut dyn Read) -> Result<(), SmtpError>;

    /// `RSET` or an aborted transaction: discard the transaction state
    fn reset(&mut self);

    /// Connection teardown (`QUIT` or a closed connection)
    fn logout(&mut self) -> Result<(), SmtpError>;
}

/// Body type requested with the `BODY=` parameter of `MAIL FROM`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
}

/// ESMTP parameters given with `MAIL FROM`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailOptions {
    /// Declared message size (`SIZE=`)
    pub size: Option<usize>,
    /// Declared body type (`BODY=`)
    pub body: Option<BodyType>,
    /// Whether the client asked for `SMTPUTF8`
    pub utf8: bool,
}

/// ESMTP parameters given with `RCPT TO`, kept verbatim
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RcptOptions {
    pub params: Vec<String>,
}

impl MailOptions {
    /// Parse the parameters following the reverse path
    pub fn parse(params: &[&str]) -> Result<Self, SmtpError> {
        let mut options = Self::default();

        for param in params {
            let (keyword, value) = match param.split_once('=') {
                Some((keyword, value)) => (keyword, Some(value)),
                None => (*param, None),
            };

            match (keyword.to_uppercase().as_str(), value) {
                ("SIZE", Some(value)) => {
                    let size = value.parse().map_err(|_| {
                        SmtpError::InvalidSyntax(format!("invalid SIZE value '{value}'"))
                    })?;
                    options.size = Some(size);
                }
                ("BODY", Some(value)) => {
                    options.body = match value.to_uppercase().as_str() {
                        "7BIT" => Some(BodyType::SevenBit),
                        "8BITMIME" => Some(BodyType::EightBitMime),
                        _ => {
                            return Err(SmtpError::InvalidSyntax(format!(
                                "unsupported BODY value '{value}'"
                            )));
                        }
                    };
                }
                ("SMTPUTF8", None) => options.utf8 = true,
                _ => {
                    return Err(SmtpError::InvalidSyntax(format!(
                        "unsupported MAIL parameter '{param}'"
                    )));
                }
            }
        }

        Ok(options)
    }
}

impl RcptOptions {
    pub fn parse(params: &[&str]) -> Self {
        Self {
            params: params.iter().map(|param| (*param).to_owned()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_no_params() {
        assert_eq!(MailOptions::parse(&[]).unwrap(), MailOptions::default());
    }

    #[test]
    fn test_parse_known_params() {
        let options = MailOptions::parse(&["SIZE=1024", "body=8BITMIME", "SMTPUTF8"]).unwrap();
        assert_eq!(options.size, Some(1024));
        assert_eq!(options.body, Some(BodyType::EightBitMime));
        assert!(options.utf8);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(matches!(
            MailOptions::parse(&["SIZE=lots"]),
            Err(SmtpError::InvalidSyntax(_))
        ));
        assert!(matches!(
            MailOptions::parse(&["BODY=BINARYMIME"]),
            Err(SmtpError::InvalidSyntax(_))
        ));
        assert!(matches!(
            MailOptions::parse(&["RET=HDRS"]),
            Err(SmtpError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn test_rcpt_params_kept_verbatim() {
        let options = RcptOptions::parse(&["NOTIFY=NEVER"]);
        assert_eq!(options.params, vec!["NOTIFY=NEVER".to_string()]);
    }
}
