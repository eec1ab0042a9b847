//! SMTP server implementation

use crate::smtp::commands::SmtpCommandHandler;
use crate::smtp::data::DataReader;
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::{Backend, Session};
use crate::smtp::state::ProtocolState;

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, error, info, trace, warn};

/// Longest command read in one piece; anything longer is rejected whole
const COMMAND_READ_LIMIT: u64 = (SmtpLimits::COMMAND_LINE_MAX_LENGTH * 4) as u64;

/// Limits the server enforces on every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerLimits {
    /// Maximum size of one message body in bytes
    pub max_message_bytes: usize,
    /// Maximum number of recipients per transaction
    pub max_recipients: usize,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_message_bytes: SmtpLimits::DEFAULT_MAX_MESSAGE_BYTES,
            max_recipients: SmtpLimits::DEFAULT_MAX_RECIPIENTS,
        }
    }
}

/// SMTP server that hands every connection to a [`Session`] from its
/// [`Backend`], one thread per connection
pub struct SmtpServer<B: Backend> {
    /// Server hostname
    hostname: Arc<str>,
    backend: Arc<B>,
    limits: ServerLimits,
    stopped: Arc<AtomicBool>,
}

/// Stops the accept loop of a running [`SmtpServer`]
#[derive(Debug, Clone)]
pub struct ServerHandle {
    stopped: Arc<AtomicBool>,
}

impl<B: Backend> SmtpServer<B> {
    /// Create a new SMTP server
    pub fn new(hostname: &str, backend: B) -> Self {
        Self {
            hostname: Arc::from(hostname),
            backend: Arc::new(backend),
            limits: ServerLimits::default(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the default message size and recipient limits
    pub fn with_limits(mut self, limits: ServerLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Handle that stops this server once its accept loop is running
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stopped: Arc::clone(&self.stopped),
        }
    }

    /// Start the server on the specified address (blocking)
    pub fn start(&self, addr: &str) -> Result<(), SmtpError> {
        let listener = TcpListener::bind(addr)?;
        self.start_with_listener(listener)
    }

    /// Start the server with an existing listener (blocking)
    ///
    /// Returns once [`ServerHandle::stop`] has been called and the listener
    /// has seen one more connection attempt.
    pub fn start_with_listener(&self, listener: TcpListener) -> Result<(), SmtpError> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, hostname = %self.hostname, "SMTP server listening");

        for stream in listener.incoming() {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            match stream {
                Ok(stream) => self.spawn_client(stream),
                Err(e) => {
                    warn!(error = %e, "Error accepting connection");
                }
            }
        }

        info!(addr = %local_addr, "SMTP server stopped accepting connections");
        Ok(())
    }

    fn spawn_client(&self, stream: TcpStream) {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                warn!(error = %e, "Dropping connection without peer address");
                return;
            }
        };

        let hostname = Arc::clone(&self.hostname);
        let backend = Arc::clone(&self.backend);
        let limits = self.limits;

        let spawned = thread::Builder::new()
            .name(format!("smtp-{peer}"))
            .spawn(move || {
                debug!(%peer, "Accepted connection");
                if let Err(e) = handle_client(stream, peer, &hostname, backend.as_ref(), limits) {
                    error!(%peer, error = %e, "Error handling client");
                }
                debug!(%peer, "Connection closed");
            });

        if let Err(e) = spawned {
            error!(%peer, error = %e, "Failed to spawn connection thread");
        }
    }
}

impl ServerHandle {
    /// Ask the server to stop accepting connections.
    ///
    /// `addr` is the listening address; a throwaway connection to it wakes
    /// the blocked accept call.
    pub fn stop(&self, mut addr: SocketAddr) {
        self.stopped.store(true, Ordering::SeqCst);
        if addr.ip().is_unspecified() {
            addr.set_ip(match addr {
                SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
            });
        }
        if let Err(e) = TcpStream::connect(addr) {
            debug!(%addr, error = %e, "Wake-up connection failed");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Handle a client connection
fn handle_client<B: Backend>(
    stream: TcpStream,
    peer: SocketAddr,
    hostname: &str,
    backend: &B,
    limits: ServerLimits,
) -> Result<(), SmtpError> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let mut session = match backend.new_session(peer) {
        Ok(session) => session,
        Err(e) => {
            send_response(
                &mut writer,
                &SmtpResponse::error("421", "Service not available"),
            )?;
            return Err(e);
        }
    };

    let command_handler = SmtpCommandHandler::new(hostname, limits.max_message_bytes);
    let mut state = ProtocolState::new(limits.max_recipients);

    let result = serve_commands(
        &mut reader,
        &mut writer,
        peer,
        hostname,
        &command_handler,
        &mut state,
        &mut session,
        limits,
    );

    // Teardown without QUIT still ends the session
    if !state.is_closing() {
        if let Err(e) = session.logout() {
            error!(%peer, error = %e, "Logout after connection loss failed");
        }
    }
    debug!(%peer, transactions = state.transactions, "Session ended");

    result
}

#[allow(clippy::too_many_arguments)]
fn serve_commands<S: Session>(
    reader: &mut BufReader<TcpStream>,
    writer: &mut TcpStream,
    peer: SocketAddr,
    hostname: &str,
    command_handler: &SmtpCommandHandler,
    state: &mut ProtocolState,
    session: &mut S,
    limits: ServerLimits,
) -> Result<(), SmtpError> {
    // Send greeting
    send_response(writer, &SmtpResponse::greeting(hostname))?;

    let mut line_buffer = Vec::new();
    loop {
        line_buffer.clear();

        match (&mut *reader)
            .take(COMMAND_READ_LIMIT)
            .read_until(b'\n', &mut line_buffer)
        {
            Ok(0) => break, // Connection closed
            Ok(n) if n as u64 == COMMAND_READ_LIMIT && !line_buffer.ends_with(b"\n") => {
                // The tail of an overlong line is not a new command
                if let Err(e) = discard_line(reader) {
                    warn!(%peer, error = %e, "Error reading from client");
                    break;
                }
                debug!(%peer, "Command line too long");
                let e = SmtpError::LineTooLong {
                    max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
                };
                send_response(
                    writer,
                    &SmtpResponse::error(e.to_response_code(), &e.to_response_message()),
                )?;
            }
            Ok(_) => {
                // Replace invalid UTF-8 sequences with replacement character
                let line = String::from_utf8_lossy(&line_buffer);

                let command = line.trim();
                if command.is_empty() {
                    continue;
                }
                trace!(%peer, command, "Received command");

                let response = match command_handler.process_command(command, state, session) {
                    Ok(response) => response,
                    Err(e) => {
                        debug!(%peer, error = %e, "Command rejected");
                        SmtpResponse::error(e.to_response_code(), &e.to_response_message())
                    }
                };
                send_response(writer, &response)?;

                if response.code == "354" {
                    let Some(response) = receive_data(reader, peer, session, limits) else {
                        break; // Connection closed mid-body
                    };
                    send_response(writer, &response)?;
                    state.finish_data(response.is_success());
                }

                if state.is_closing() {
                    break;
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "Error reading from client");
                break;
            }
        }
    }

    Ok(())
}

/// Skip input up to and including the next LF
fn discard_line<R: BufRead>(reader: &mut R) -> std::io::Result<()> {
    let mut scratch = Vec::new();
    loop {
        scratch.clear();
        let n = (&mut *reader)
            .take(COMMAND_READ_LIMIT)
            .read_until(b'\n', &mut scratch)?;
        if n == 0 || scratch.ends_with(b"\n") {
            return Ok(());
        }
    }
}

/// Stream the body into the session and pick the reply for the final dot.
///
/// Returns `None` when the connection closed before the body ended.
fn receive_data<S: Session>(
    reader: &mut BufReader<TcpStream>,
    peer: SocketAddr,
    session: &mut S,
    limits: ServerLimits,
) -> Option<SmtpResponse> {
    let mut source = DataReader::new(reader, limits.max_message_bytes);
    let result = session.data(&mut source);

    if let Err(e) = source.drain() {
        warn!(%peer, error = %e, "Connection lost during DATA");
        return None;
    }
    // The session may have read up to EOF itself
    if source.is_closed() {
        warn!(%peer, received = source.received(), "Connection closed during DATA");
        return None;
    }

    if source.exceeded_limit() {
        let e = SmtpError::TooMuchData {
            max: limits.max_message_bytes,
        };
        warn!(%peer, received = source.received(), "Message rejected: too large");
        return Some(SmtpResponse::error(
            e.to_response_code(),
            &e.to_response_message(),
        ));
    }

    match result {
        Ok(()) => {
            debug!(%peer, bytes = source.received(), "Message accepted");
            Some(SmtpResponse::accepted())
        }
        Err(e) => {
            warn!(%peer, error = %e, "Message rejected");
            Some(SmtpResponse::error(
                e.to_response_code(),
                &e.to_response_message(),
            ))
        }
    }
}

/// Send a response to the client
fn send_response(stream: &mut TcpStream, response: &SmtpResponse) -> Result<(), SmtpError> {
    // Ensure response doesn't exceed maximum line length
    let formatted = response.format();
    if response.multiline.is_none() && formatted.len() > SmtpLimits::REPLY_LINE_MAX_LENGTH {
        let mut end = SmtpLimits::REPLY_LINE_MAX_LENGTH - 32;
        while !response.message.is_char_boundary(end) {
            end -= 1;
        }
        let truncated_response = SmtpResponse::new(
            &response.code,
            &format!("{} (truncated)", &response.message[..end]),
        );
        stream.write_all(truncated_response.format().as_bytes())?;
    } else {
        stream.write_all(formatted.as_bytes())?;
    }
    stream.flush()?;
    Ok(())
}
