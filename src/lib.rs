//! # smtp-dup
//!
//! smtp-dup is an SMTP relay that duplicates every message it receives.
//!
//! Each message is relayed synchronously to one primary upstream. The
//! sender's transaction succeeds or fails with the primary. Once the primary
//! has accepted a message, a copy is queued for every backup upstream and
//! delivered in the background. Backup failures are logged and counted, and
//! never reach the sender.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use smtp_dup::relay::{
//!     BackupPool, Destinations, RelayBackend, RelayDispatcher, RelayTrigger, SmtpRelay, TlsMode,
//! };
//! use smtp_dup::SmtpServer;
//!
//! let destinations = Destinations::parse("mail1:25", &["mail2:25", "mail3:25"]).unwrap();
//! let transport = Arc::new(SmtpRelay::new("relay.local", TlsMode::Opportunistic, None));
//! let pool = Arc::new(BackupPool::new(4, 256).unwrap());
//! let dispatcher = Arc::new(RelayDispatcher::new(destinations, transport, Arc::clone(&pool)));
//!
//! let server = SmtpServer::new("relay.local", RelayBackend::new(dispatcher, RelayTrigger::Logout));
//! server.start("127.0.0.1:2525").unwrap();
//!
//! pool.shutdown(Duration::from_secs(30));
//! ```
//!
//! ## Supported SMTP commands
//!
//! - `HELO` / `EHLO` - Identify the sender (`EHLO` advertises `SIZE`,
//!   `8BITMIME`, `SMTPUTF8` and `PIPELINING`)
//! - `MAIL FROM` - Specify the sender's address, `<>` included
//! - `RCPT TO` - Specify the destination (multiple destinations are supported)
//! - `DATA` - Send the email body
//! - `RSET` - Reset the current transaction
//! - `NOOP` - Do nothing
//! - `QUIT` - Relay and close the connection
//!
//! ## When messages are relayed
//!
//! By default the relay happens at connection teardown, with the last
//! transaction of the connection, and the primary's verdict is the reply to
//! `QUIT`. With [`relay::RelayTrigger::Transaction`] every message is relayed
//! as soon as its body is complete and the verdict is the reply to `DATA`.
//!
//! ## Notes
//!
//! - Upstream delivery uses `lettre`, without credentials. STARTTLS is used
//!   when offered unless configured otherwise.
//! - Inbound TLS and authentication are not supported.
//! - Nothing is persisted. Backup copies still queued when the shutdown
//!   grace period runs out are dropped and counted.

pub mod config;
pub mod logging;
pub mod relay;
pub mod smtp;

pub use config::{Config, ConfigError};
pub use relay::{PrimaryRelayError, RelayBackend, RelayDispatcher, RelayError};
pub use smtp::{ServerHandle, ServerLimits, SmtpError, SmtpLimits, SmtpResponse, SmtpServer};
