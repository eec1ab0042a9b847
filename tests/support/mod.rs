//! Shared harness: capture upstreams, a relay under test and a raw SMTP client

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use smtp_dup::relay::{
    BackupPool, Destinations, MessageBuffer, RelayBackend, RelayDispatcher, RelayTrigger,
    SmtpRelay, TlsMode,
};
use smtp_dup::smtp::{Backend, MailOptions, RcptOptions, Session};
use smtp_dup::{ServerHandle, ServerLimits, SmtpError, SmtpServer};

pub const WAIT: Duration = Duration::from_secs(10);

/// A message as an upstream received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub from: String,
    pub to: Vec<String>,
    pub data: Vec<u8>,
}

impl Email {
    pub fn subject(&self) -> Option<String> {
        MessageBuffer::from(self.data.as_slice()).subject()
    }
}

struct CaptureBackend {
    sender: Sender<Email>,
}

struct CaptureSession {
    sender: Sender<Email>,
    from: String,
    to: Vec<String>,
}

impl Backend for CaptureBackend {
    type Session = CaptureSession;

    fn new_session(&self, _peer: SocketAddr) -> Result<CaptureSession, SmtpError> {
        Ok(CaptureSession {
            sender: self.sender.clone(),
            from: String::new(),
            to: Vec::new(),
        })
    }
}

impl Session for CaptureSession {
    fn mail(&mut self, from: &str, _options: &MailOptions) -> Result<(), SmtpError> {
        self.from = from.to_string();
        self.to.clear();
        Ok(())
    }

    fn rcpt(&mut self, to: &str, _options: &RcptOptions) -> Result<(), SmtpError> {
        self.to.push(to.to_string());
        Ok(())
    }

    fn data(&mut self, source: &mut dyn Read) -> Result<(), SmtpError> {
        let mut data = Vec::new();
        source.read_to_end(&mut data).map_err(SmtpError::DataRead)?;
        let _ = self.sender.send(Email {
            from: self.from.clone(),
            to: self.to.clone(),
            data,
        });
        Ok(())
    }

    fn reset(&mut self) {
        self.from.clear();
        self.to.clear();
    }

    fn logout(&mut self) -> Result<(), SmtpError> {
        Ok(())
    }
}

/// Local upstream that hands every received message to the test
pub struct Upstream {
    pub addr: SocketAddr,
    rx: Receiver<Email>,
    handle: ServerHandle,
}

impl Upstream {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        let server = SmtpServer::new("upstream.test", CaptureBackend { sender: tx });
        let handle = server.handle();

        thread::spawn(move || {
            if let Err(e) = server.start_with_listener(listener) {
                eprintln!("Error starting upstream: {e}");
            }
        });

        Self { addr, rx, handle }
    }

    /// Destination string for this upstream
    pub fn target(&self) -> String {
        self.addr.to_string()
    }

    pub fn recv(&self) -> Email {
        self.rx.recv_timeout(WAIT).expect("upstream received nothing")
    }

    /// `None` if nothing arrives within `timeout`
    pub fn recv_within(&self, timeout: Duration) -> Option<Email> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.handle.stop(self.addr);
    }
}

/// An address nobody listens on
pub fn unreachable_target() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

/// The relay under test, listening on an ephemeral port
pub struct Relay {
    pub addr: SocketAddr,
    pub pool: Arc<BackupPool>,
    handle: ServerHandle,
}

impl Relay {
    pub fn start(primary: &str, backups: &[String]) -> Self {
        Self::start_with(primary, backups, RelayTrigger::Logout, ServerLimits::default())
    }

    pub fn start_with(
        primary: &str,
        backups: &[String],
        trigger: RelayTrigger,
        limits: ServerLimits,
    ) -> Self {
        let destinations = Destinations::parse(primary, backups).unwrap();
        let transport = Arc::new(SmtpRelay::new(
            "relay.test",
            TlsMode::None,
            Some(Duration::from_secs(5)),
        ));
        let pool = Arc::new(BackupPool::new(2, 64).unwrap());
        let dispatcher = Arc::new(RelayDispatcher::new(
            destinations,
            transport,
            Arc::clone(&pool),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = SmtpServer::new("relay.test", RelayBackend::new(dispatcher, trigger))
            .with_limits(limits);
        let handle = server.handle();

        thread::spawn(move || {
            if let Err(e) = server.start_with_listener(listener) {
                eprintln!("Error starting relay: {e}");
            }
        });

        Self { addr, pool, handle }
    }

    /// Wait for queued backup copies
    pub fn wait_for_backups(&self) {
        assert!(self.pool.wait_idle(WAIT), "backup deliveries did not finish");
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.handle.stop(self.addr);
    }
}

/// Line-level SMTP client
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    /// Connect and consume the greeting
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let writer = stream.try_clone().unwrap();
        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
        };

        let greeting = client.reply();
        assert!(greeting.starts_with("220"), "unexpected greeting {greeting}");
        client
    }

    /// Read one reply; returns its last line
    pub fn reply(&mut self) -> String {
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return line.trim_end().to_string();
            }
        }
    }

    pub fn send(&mut self, command: &str) -> String {
        self.write_raw(format!("{command}\r\n").as_bytes());
        self.reply()
    }

    /// The reply code for `command`
    pub fn code(&mut self, command: &str) -> String {
        self.send(command).chars().take(3).collect()
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
        self.writer.flush().unwrap();
    }

    /// MAIL, RCPT and DATA with `body`, which must end in CRLF.
    ///
    /// Returns the reply to the final dot.
    pub fn transaction(&mut self, from: &str, to: &[&str], body: &str) -> String {
        assert_eq!(self.code(&format!("MAIL FROM:<{from}>")), "250");
        for rcpt in to {
            assert_eq!(self.code(&format!("RCPT TO:<{rcpt}>")), "250");
        }
        assert_eq!(self.code("DATA"), "354");
        self.write_raw(body.as_bytes());
        self.send(".")
    }
}
