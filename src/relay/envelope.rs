//! Transaction data: envelope and raw message bytes

use std::io::{self, Read};

/// Return path and recipients of one transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Reverse path from MAIL FROM; empty for the null sender `<>`
    pub return_path: String,

    /// Recipients from RCPT TO, in the order given, duplicates kept
    pub recipients: Vec<String>,
}

impl Envelope {
    /// Create an envelope from its parts
    pub fn new(return_path: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            return_path: return_path.into(),
            recipients,
        }
    }

    /// Start a new envelope with the given return path
    pub fn set_return_path(&mut self, return_path: &str) {
        self.return_path = return_path.to_owned();
        self.recipients.clear();
    }

    /// Append one recipient
    pub fn add_recipient(&mut self, recipient: &str) {
        self.recipients.push(recipient.to_owned());
    }

    pub fn clear(&mut self) {
        self.return_path.clear();
        self.recipients.clear();
    }
}

/// Raw message bytes, headers and body, exactly as received
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBuffer {
    data: Vec<u8>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with everything `source` yields.
    ///
    /// The buffer is emptied first. On a read error it is left empty.
    pub fn fill_from(&mut self, source: &mut dyn Read) -> io::Result<usize> {
        self.data.clear();
        match source.read_to_end(&mut self.data) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.data.clear();
                Err(e)
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Get the subject line from the message headers (if present)
    pub fn subject(&self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.data);
        for line in text.lines() {
            if line.is_empty() {
                // End of headers
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("subject") {
                    return Some(value.trim().to_owned());
                }
            }
        }
        None
    }
}

impl From<&[u8]> for MessageBuffer {
    fn from(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Yields some bytes, then fails
    struct FailingReader {
        sent: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            self.sent = true;
            buf[..4].copy_from_slice(b"half");
            Ok(4)
        }
    }

    #[test]
    fn test_new_mail_starts_new_envelope() {
        let mut envelope = Envelope::default();
        envelope.set_return_path("first@example.com");
        envelope.add_recipient("a@example.com");

        envelope.set_return_path("second@example.com");
        assert_eq!(envelope.return_path, "second@example.com");
        assert!(envelope.recipients.is_empty());
    }

    #[test]
    fn test_recipients_keep_order_and_duplicates() {
        let mut envelope = Envelope::default();
        envelope.add_recipient("b@example.com");
        envelope.add_recipient("a@example.com");
        envelope.add_recipient("b@example.com");

        assert_eq!(
            envelope.recipients,
            vec!["b@example.com", "a@example.com", "b@example.com"]
        );
    }

    #[test]
    fn test_fill_replaces_previous_contents() {
        let mut buffer = MessageBuffer::new();
        buffer.fill_from(&mut Cursor::new(b"first message".to_vec())).unwrap();
        buffer.fill_from(&mut Cursor::new(b"second".to_vec())).unwrap();

        assert_eq!(buffer.as_bytes(), b"second");
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn test_fill_error_leaves_buffer_empty() {
        let mut buffer = MessageBuffer::from(&b"old"[..]);
        let result = buffer.fill_from(&mut FailingReader { sent: false });

        assert!(result.is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_subject() {
        let buffer = MessageBuffer::from(&b"Subject: hi\r\nFrom: a@x.com\r\n\r\nbody"[..]);
        assert_eq!(buffer.subject(), Some("hi".to_string()));

        let buffer = MessageBuffer::from(&b"From: a@x.com\n\nSubject: not a header"[..]);
        assert_eq!(buffer.subject(), None);
    }
}
