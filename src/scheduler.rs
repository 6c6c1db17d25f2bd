//! # Refresh Scheduler
//!
//! Periodic sweep that finds tokens about to expire and enqueues one
//! `RefreshOAuth2Token` task per connection. The sweep never refreshes inline;
//! the per-connection lock in the token manager serializes whatever the
//! workers pick up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::oauth2::tokens::to_chrono;
use crate::repositories::{ConnectorVersionRepository, OAuth2TokenRepository};
use crate::tasks::{TaskDescriptor, TaskQueue};

/// Window used by one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepWindow {
    pub window: Duration,
    /// Published connector versions that opted into background refresh
    pub opted_in_versions: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub window: Option<Duration>,
    pub enqueued: u64,
}

pub struct RefreshScheduler {
    versions: ConnectorVersionRepository,
    tokens: OAuth2TokenRepository,
    queue: Arc<dyn TaskQueue>,
    global_before_expiry: Duration,
}

impl RefreshScheduler {
    pub fn new(
        versions: ConnectorVersionRepository,
        tokens: OAuth2TokenRepository,
        queue: Arc<dyn TaskQueue>,
        global_before_expiry: Duration,
    ) -> Self {
        Self {
            versions,
            tokens,
            queue,
            global_before_expiry,
        }
    }

    /// Largest of the global window and every opted-in connector's override,
    /// so no connector is refreshed later than it asked to be. `None` when no
    /// published connector opted in.
    pub async fn effective_window(&self) -> Result<Option<SweepWindow>> {
        let mut window = self.global_before_expiry;
        let mut opted_in_versions = 0;

        for version in self.versions.list_published().await? {
            let definition = match self.versions.load_definition(&version) {
                Ok(definition) => definition,
                Err(err) => {
                    warn!(
                        connector_id = %version.connector_id,
                        version = version.version,
                        error = %err,
                        "Skipping unreadable connector definition"
                    );
                    continue;
                }
            };

            let Some(oauth2) = definition.oauth2() else {
                continue;
            };
            if !oauth2.refresh.in_background {
                continue;
            }

            opted_in_versions += 1;
            window = window.max(oauth2.refresh.before_expiry(self.global_before_expiry));
        }

        if opted_in_versions == 0 {
            return Ok(None);
        }
        Ok(Some(SweepWindow {
            window,
            opted_in_versions,
        }))
    }

    /// One sweep: enqueue a refresh task for every live token of a ready
    /// connection expiring within the effective window.
    #[instrument(skip_all)]
    pub async fn sweep(&self) -> Result<SweepStats> {
        let started = Instant::now();

        let Some(window) = self.effective_window().await? else {
            debug!("No connector opted into background refresh; skipping sweep");
            return Ok(SweepStats::default());
        };

        let queue = self.queue.clone();
        let enqueued = self
            .tokens
            .enumerate_expiring_within(to_chrono(window.window), move |page| {
                let queue = queue.clone();
                async move {
                    for (token, connection) in page {
                        debug!(connection_id = %connection.id, token_id = %token.id, "Enqueueing token refresh");
                        queue
                            .enqueue(TaskDescriptor::RefreshOAuth2Token {
                                connection_id: connection.id,
                            })
                            .await?;
                    }
                    Ok(std::ops::ControlFlow::Continue(()))
                }
            })
            .await?;

        counter!("oauth2_refresh_sweep_enqueued_total").increment(enqueued);
        histogram!("oauth2_refresh_sweep_duration_seconds").record(started.elapsed().as_secs_f64());

        info!(
            window_seconds = window.window.as_secs(),
            opted_in_versions = window.opted_in_versions,
            enqueued,
            "Token refresh sweep completed"
        );

        Ok(SweepStats {
            window: Some(window.window),
            enqueued,
        })
    }
}
