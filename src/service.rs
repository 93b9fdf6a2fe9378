//! The `BackOffice` facade: every exposed operation runs in one snapshot,
//! committed on success and aborted on any error.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::warn;

use crate::error::Result;
use crate::ledger::allocation::{allocate_sale, AllocationSummary};
use crate::ledger::reconcile;
use crate::models::{Ballot, FlowInstance, RefundOrder, RefundSubmission, SaleAllocation};
use crate::refund::submit_refund;
use crate::store::BackOfficeStore;
use crate::workflow::completion::CompletionRegistry;
use crate::workflow::evaluator::{cast_vote, VoteOutcome};
use crate::workflow::{dispatcher, instance};

pub struct BackOffice<S: BackOfficeStore> {
    store: Arc<S>,
    completions: CompletionRegistry<S>,
}

impl<S: BackOfficeStore> BackOffice<S> {
    /// Back office with the refund completion handler registered.
    pub fn new(store: Arc<S>, refund_correlation_window: Duration) -> Self {
        Self::with_completions(store, CompletionRegistry::with_refunds(refund_correlation_window))
    }

    pub fn with_completions(store: Arc<S>, completions: CompletionRegistry<S>) -> Self {
        Self { store, completions }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn completions(&self) -> &CompletionRegistry<S> {
        &self.completions
    }

    pub async fn create_from_template(&self, template_id: i64, initiator: i64) -> Result<FlowInstance> {
        let mut snapshot = self.store.begin_snapshot().await?;
        let result = instance::create_from_template(
            self.store(),
            &mut snapshot,
            template_id,
            initiator,
            Utc::now(),
        )
        .await;
        self.finish(snapshot, result).await
    }

    /// Cast a vote and, when it resolves the node, advance or finalize the
    /// instance in the same snapshot.
    pub async fn cast_vote(&self, vote_id: i64, voter: i64, ballot: Ballot) -> Result<VoteOutcome> {
        let mut snapshot = self.store.begin_snapshot().await?;
        let result = self.vote_and_dispatch(&mut snapshot, vote_id, voter, ballot).await;
        self.finish(snapshot, result).await
    }

    async fn vote_and_dispatch(
        &self,
        snapshot: &mut S::Snapshot,
        vote_id: i64,
        voter: i64,
        ballot: Ballot,
    ) -> Result<VoteOutcome> {
        let now = Utc::now();
        let mut outcome = cast_vote(self.store(), snapshot, vote_id, voter, ballot, now).await?;
        if outcome.resolved() {
            outcome.instance = dispatcher::dispatch(
                self.store(),
                snapshot,
                &self.completions,
                outcome.instance.clone(),
                &outcome.node_case,
                now,
            )
            .await?;
        }
        Ok(outcome)
    }

    pub async fn cancel(&self, instance_id: i64, requester: i64) -> Result<FlowInstance> {
        let mut snapshot = self.store.begin_snapshot().await?;
        let result =
            instance::cancel(self.store(), &mut snapshot, instance_id, requester, Utc::now()).await;
        self.finish(snapshot, result).await
    }

    pub async fn allocate_sale(&self, payment: &SaleAllocation) -> Result<AllocationSummary> {
        let mut snapshot = self.store.begin_snapshot().await?;
        let result = allocate_sale(self.store(), &mut snapshot, payment, Utc::now()).await;
        self.finish(snapshot, result).await
    }

    pub async fn submit_refund(
        &self,
        submission: &RefundSubmission,
    ) -> Result<(RefundOrder, FlowInstance)> {
        let mut snapshot = self.store.begin_snapshot().await?;
        let result = submit_refund(self.store(), &mut snapshot, submission, Utc::now()).await;
        self.finish(snapshot, result).await
    }

    /// Apply a refund decision directly. Normally reached through the refund
    /// flow's completion handler.
    pub async fn on_refund_decision(
        &self,
        refund_order_id: i64,
        order_id: i64,
        approved: bool,
    ) -> Result<()> {
        let mut snapshot = self.store.begin_snapshot().await?;
        let result = reconcile::on_refund_decision(
            self.store(),
            &mut snapshot,
            refund_order_id,
            order_id,
            approved,
            Utc::now(),
        )
        .await;
        self.finish(snapshot, result).await
    }

    async fn finish<T>(&self, snapshot: S::Snapshot, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.store.commit_snapshot(snapshot).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = self.store.abort_snapshot(snapshot).await {
                    warn!("Failed to abort snapshot after {}: {}", err, abort_err);
                }
                Err(err)
            }
        }
    }
}
