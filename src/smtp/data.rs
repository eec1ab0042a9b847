//! Streaming reader for the DATA phase

use std::io::{self, BufRead, Read};

/// Upper bound for one read from the connection
const CHUNK_SIZE: u64 = 8 * 1024;

/// Reads a message body off the connection until the terminating `.` line.
///
/// Only CRLF ends a line. A bare LF is ordinary body data, so neither `.\n`
/// nor a dot after a bare LF ends the body or is unstuffed. Dot-stuffing is
/// removed and line endings are passed through untouched.
/// Reads fail once the body grows past `max_bytes`; [`DataReader::drain`]
/// then skips the rest so the next command starts on a line boundary.
pub struct DataReader<'a, R: BufRead> {
    inner: &'a mut R,
    line: Vec<u8>,
    pos: usize,
    received: usize,
    max_bytes: usize,
    at_line_start: bool,
    last_was_cr: bool,
    done: bool,
    closed: bool,
    exceeded: bool,
}

impl<'a, R: BufRead> DataReader<'a, R> {
    pub fn new(inner: &'a mut R, max_bytes: usize) -> Self {
        Self {
            inner,
            line: Vec::new(),
            pos: 0,
            received: 0,
            max_bytes,
            at_line_start: true,
            last_was_cr: false,
            done: false,
            closed: false,
            exceeded: false,
        }
    }

    /// Body bytes seen so far, after unstuffing
    pub fn received(&self) -> usize {
        self.received
    }

    /// Whether the body grew past the size limit
    pub fn exceeded_limit(&self) -> bool {
        self.exceeded
    }

    /// Whether the connection closed before the end-of-data line
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Consume the remainder of the body, up to and including the `.` line.
    ///
    /// Fails only when the connection closes or errors first.
    pub fn drain(&mut self) -> io::Result<()> {
        while !self.done {
            let was_exceeded = self.exceeded;
            if let Err(err) = self.next_line() {
                // Only the size error that trips the limit is expected here
                if was_exceeded || !self.exceeded {
                    return Err(err);
                }
            }
            self.line.clear();
            self.pos = 0;
        }
        Ok(())
    }

    fn size_error(&self) -> io::Error {
        io::Error::other(format!("message exceeds {} bytes", self.max_bytes))
    }

    fn next_line(&mut self) -> io::Result<()> {
        self.line.clear();
        self.pos = 0;

        let at_line_start = self.at_line_start;
        let n = (&mut *self.inner)
            .take(CHUNK_SIZE)
            .read_until(b'\n', &mut self.line)?;
        if n == 0 {
            self.done = true;
            self.closed = true;
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before end of data",
            ));
        }
        // A CR can end one bounded read and its LF start the next
        self.at_line_start = self.line.ends_with(b"\r\n")
            || (self.line == b"\n" && self.last_was_cr);
        self.last_was_cr = self.line.ends_with(b"\r");

        if at_line_start {
            if self.line == b".\r\n" {
                self.line.clear();
                self.done = true;
                return Ok(());
            }
            if self.line[0] == b'.' {
                self.line.remove(0);
            }
        }

        if self.exceeded {
            // Past the limit: discard until the end-of-data line
            self.line.clear();
            return Ok(());
        }

        self.received += self.line.len();
        if self.received > self.max_bytes {
            self.exceeded = true;
            self.line.clear();
            return Err(self.size_error());
        }

        Ok(())
    }
}

impl<R: BufRead> Read for DataReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.exceeded {
                return Err(self.size_error());
            }
            if self.pos < self.line.len() {
                let n = buf.len().min(self.line.len() - self.pos);
                buf[..n].copy_from_slice(&self.line[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            self.next_line()?;
        }
    }
}
