//! Primary-then-backups delivery of one message

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::relay::envelope::Envelope;
use crate::relay::error::{PrimaryRelayError, RelayError};
use crate::relay::pool::{BackupPool, JobContext};
use crate::relay::target::{Destinations, RelayTarget};
use crate::relay::transport::Transport;

/// Outcome of one delivery attempt
#[derive(Debug)]
pub struct RelayOutcome {
    pub target: String,
    pub result: Result<(), RelayError>,
}

/// Sends each message to the primary upstream and, once the primary has
/// accepted it, queues copies for every backup.
pub struct RelayDispatcher {
    destinations: Arc<Destinations>,
    transport: Arc<dyn Transport>,
    pool: Arc<BackupPool>,
}

impl RelayDispatcher {
    pub fn new(
        destinations: Destinations,
        transport: Arc<dyn Transport>,
        pool: Arc<BackupPool>,
    ) -> Self {
        Self {
            destinations: Arc::new(destinations),
            transport,
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<BackupPool> {
        &self.pool
    }

    /// Deliver synchronously to the primary, then schedule the backups.
    ///
    /// Backups are never attempted when the primary fails. Their outcomes
    /// are logged and counted, never returned.
    pub fn relay(&self, envelope: &Envelope, body: &[u8]) -> Result<(), PrimaryRelayError> {
        let primary = &self.destinations.primary;
        let started = Instant::now();

        if let Err(source) = self.transport.send(primary, envelope, body) {
            error!(
                destination = %primary,
                from = %envelope.return_path,
                recipients = envelope.recipients.len(),
                error = %source,
                "Primary relay failed"
            );
            return Err(PrimaryRelayError {
                target: primary.to_string(),
                source,
            });
        }

        info!(
            destination = %primary,
            from = %envelope.return_path,
            recipients = envelope.recipients.len(),
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Relayed to primary"
        );

        self.schedule_backups(envelope, body);
        Ok(())
    }

    fn schedule_backups(&self, envelope: &Envelope, body: &[u8]) {
        if self.destinations.backups.is_empty() {
            return;
        }

        let destinations = Arc::clone(&self.destinations);
        let transport = Arc::clone(&self.transport);
        let copy = envelope.clone();
        let body: Arc<[u8]> = Arc::from(body);

        let submitted = self.pool.submit(move |ctx| {
            let outcomes = deliver_backups(ctx, &destinations.backups, &*transport, &copy, &body);
            let delivered = outcomes.iter().filter(|o| o.result.is_ok()).count();
            debug!(
                delivered,
                attempted = outcomes.len(),
                "Backup fan-out finished"
            );
        });

        if let Err(e) = submitted {
            error!(
                backups = self.destinations.backups.len(),
                from = %envelope_sender(envelope),
                error = %e,
                "Backup copies dropped"
            );
        }
    }
}

/// Try each backup in order. A failure never stops the remaining ones;
/// cancellation skips everything not yet started.
fn deliver_backups(
    ctx: &JobContext,
    backups: &[RelayTarget],
    transport: &dyn Transport,
    envelope: &Envelope,
    body: &[u8],
) -> Vec<RelayOutcome> {
    backups
        .iter()
        .map(|backup| {
            if ctx.is_cancelled() {
                ctx.record_cancelled();
                warn!(destination = %backup, "Backup relay skipped at shutdown");
                return RelayOutcome {
                    target: backup.to_string(),
                    result: Err(RelayError::Cancelled),
                };
            }

            let result = transport.send(backup, envelope, body);
            match &result {
                Ok(()) => {
                    ctx.record_delivered();
                    info!(destination = %backup, "Relayed to backup");
                }
                Err(e) => {
                    ctx.record_failed();
                    error!(
                        destination = %backup,
                        from = %envelope.return_path,
                        error = %e,
                        "Backup relay failed"
                    );
                }
            }

            RelayOutcome {
                target: backup.to_string(),
                result,
            }
        })
        .collect()
}

fn envelope_sender(envelope: &Envelope) -> &str {
    if envelope.return_path.is_empty() {
        "<>"
    } else {
        &envelope.return_path
    }
}
