//! # Token Refresh Worker
//!
//! Handles the tasks queued by the refresh scheduler. A queued refresh is only
//! carried out when the connection's connector opted into background refresh
//! and the token is inside that connector's own window; the sweep uses the
//! widest window across all connectors, so many queued tasks are no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::ephemeral::KeyValueStore;
use crate::error::Result;
use crate::models::connection::ConnectionState;
use crate::oauth2::TokenManager;
use crate::oauth2::tokens::to_chrono;
use crate::repositories::UsedNonceRepository;
use crate::scheduler::RefreshScheduler;
use crate::tasks::{Task, TaskDescriptor, TaskHandler};

/// What a queued refresh ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    Refreshed,
    /// Connection or token disappeared, or the connection left `ready`
    Gone,
    NotOptedIn,
    NotDue,
}

#[derive(Clone)]
pub struct TokenRefreshWorker {
    tokens: TokenManager,
}

impl TokenRefreshWorker {
    pub fn new(tokens: TokenManager) -> Self {
        Self { tokens }
    }

    #[instrument(skip(self))]
    pub async fn refresh_connection(&self, connection_id: Uuid) -> Result<RefreshDecision> {
        let ctx = match self.tokens.load_context(connection_id).await {
            Ok(ctx) => ctx,
            Err(err) if err.is_not_found() => return Ok(RefreshDecision::Gone),
            Err(err) => return Err(err),
        };
        if ctx.connection.state != ConnectionState::Ready {
            return Ok(RefreshDecision::Gone);
        }
        if !ctx.definition.refresh.in_background {
            debug!("Connector does not opt into background refresh");
            return Ok(RefreshDecision::NotOptedIn);
        }

        let token = match self.tokens.get_token(connection_id).await {
            Ok(token) => token,
            Err(err) if err.is_not_found() => return Ok(RefreshDecision::Gone),
            Err(err) => return Err(err),
        };

        let window = self.tokens.refresh_window(&ctx.definition);
        if !token.expires_within(to_chrono(window)) {
            return Ok(RefreshDecision::NotDue);
        }

        self.tokens.refresh_if_expiring(&ctx, window).await?;
        Ok(RefreshDecision::Refreshed)
    }
}

/// Routes every [`TaskDescriptor`] to the component that executes it.
pub struct BackgroundTaskHandler {
    scheduler: Arc<RefreshScheduler>,
    worker: TokenRefreshWorker,
    nonces: UsedNonceRepository,
    ephemeral: Arc<dyn KeyValueStore>,
}

impl BackgroundTaskHandler {
    pub fn new(
        scheduler: Arc<RefreshScheduler>,
        worker: TokenRefreshWorker,
        nonces: UsedNonceRepository,
        ephemeral: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            scheduler,
            worker,
            nonces,
            ephemeral,
        }
    }
}

#[async_trait]
impl TaskHandler for BackgroundTaskHandler {
    async fn handle(&self, task: &Task) -> Result<()> {
        match &task.descriptor {
            TaskDescriptor::RefreshExpiringOAuth2Tokens => {
                self.scheduler.sweep().await?;
            }
            TaskDescriptor::RefreshOAuth2Token { connection_id } => {
                let decision = self.worker.refresh_connection(*connection_id).await?;
                debug!(connection_id = %connection_id, ?decision, "Queued refresh handled");
            }
            TaskDescriptor::PurgeExpiredNonces => {
                let nonces = self.nonces.purge_expired().await?;
                let entries = self.ephemeral.purge_expired().await?;
                info!(nonces, entries, "Purged expired nonces and ephemeral entries");
            }
        }
        Ok(())
    }
}
