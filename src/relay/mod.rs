//! Duplicating relay: one synchronous primary delivery, then best-effort
//! copies to every backup

pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod session;
pub mod target;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::{RelayDispatcher, RelayOutcome};
pub use envelope::{Envelope, MessageBuffer};
pub use error::{AddressError, PrimaryRelayError, RelayError};
pub use pool::{BackupPool, BackupStats, JobContext, PoolError, ShutdownReport};
pub use session::{RelayBackend, RelaySession, RelayTrigger, SessionState};
pub use target::{Destinations, RelayTarget, auth_host};
pub use transport::{SmtpRelay, TlsMode, Transport};
