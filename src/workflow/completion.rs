//! Completion handlers run when a flow instance is finalized.
//!
//! Handlers are registered per `FlowCategory` when the back office is built.
//! Finalizing an instance whose category has no handler is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ledger::reconcile::on_refund_decision;
use crate::models::{FlowCategory, FlowInstance, RefundOrder};
use crate::store::BackOfficeStore;

#[async_trait]
pub trait CompletionHandler<S: BackOfficeStore>: Send + Sync {
    /// Runs inside the snapshot that finalized `instance`. An error aborts
    /// the whole vote.
    async fn on_complete(
        &self,
        store: &S,
        snapshot: &mut S::Snapshot,
        instance: &FlowInstance,
        approved: bool,
        now: DateTime<Utc>,
    ) -> Result<()>;

    fn name(&self) -> &str;
}

pub struct CompletionRegistry<S: BackOfficeStore> {
    handlers: HashMap<FlowCategory, Arc<dyn CompletionHandler<S>>>,
}

impl<S: BackOfficeStore> Default for CompletionRegistry<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S: BackOfficeStore> CompletionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the refund handler installed.
    pub fn with_refunds(correlation_window: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(FlowCategory::Refund, RefundCompletion::new(correlation_window));
        registry
    }

    /// Install `handler` for `category`, replacing any previous one.
    pub fn register<H>(&mut self, category: FlowCategory, handler: H)
    where
        H: CompletionHandler<S> + 'static,
    {
        self.handlers.insert(category, Arc::new(handler));
    }

    pub fn get(&self, category: FlowCategory) -> Option<&Arc<dyn CompletionHandler<S>>> {
        self.handlers.get(&category)
    }

    /// Number of registered handlers (for logging at startup).
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub async fn complete(
        &self,
        store: &S,
        snapshot: &mut S::Snapshot,
        instance: &FlowInstance,
        approved: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(handler) = self.get(instance.category) else {
            debug!(
                "No completion handler for {:?}, instance {} finalized without callback",
                instance.category, instance.id
            );
            return Ok(());
        };
        debug!(
            "Running completion handler {} for instance {} (approved: {})",
            handler.name(),
            instance.id,
            approved
        );
        handler
            .on_complete(store, snapshot, instance, approved, now)
            .await
    }
}

/// Applies a refund flow's outcome to the refund order it was started for.
///
/// The refund is found through its link to the instance. Refunds stored
/// without that link are matched by submission time instead: the newest
/// unlinked refund submitted within `correlation_window` of the instance's
/// creation.
#[derive(Debug, Clone)]
pub struct RefundCompletion {
    correlation_window: Duration,
}

impl RefundCompletion {
    pub fn new(correlation_window: Duration) -> Self {
        Self { correlation_window }
    }

    async fn find_refund<S: BackOfficeStore>(
        &self,
        store: &S,
        snapshot: &mut S::Snapshot,
        instance: &FlowInstance,
    ) -> Result<Option<RefundOrder>> {
        if let Some(refund) = store.find_refund_by_flow_instance(snapshot, instance.id).await? {
            return Ok(Some(refund));
        }
        let refund = store
            .find_unlinked_refund_submitted_between(
                snapshot,
                instance.created_at - self.correlation_window,
                instance.created_at + self.correlation_window,
            )
            .await?;
        if let Some(refund) = &refund {
            warn!(
                "Refund {} has no flow link, correlated to instance {} by submission time",
                refund.id, instance.id
            );
        }
        Ok(refund)
    }
}

#[async_trait]
impl<S: BackOfficeStore> CompletionHandler<S> for RefundCompletion {
    async fn on_complete(
        &self,
        store: &S,
        snapshot: &mut S::Snapshot,
        instance: &FlowInstance,
        approved: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(refund) = self.find_refund(store, snapshot, instance).await? else {
            info!("No refund order matches instance {}, nothing to apply", instance.id);
            return Ok(());
        };
        on_refund_decision(store, snapshot, refund.id, refund.order_id, approved, now).await
    }

    fn name(&self) -> &str {
        "refund_completion"
    }
}
