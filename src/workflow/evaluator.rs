//! Vote casting and node evaluation.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{BackOfficeError, Result, StorageError};
use crate::models::{
    Ballot, FlowInstance, NodeCase, NodeResult, NodeVote, SignMode, VoteDecision,
};
use crate::store::BackOfficeStore;

/// Result of a node given the decisions recorded on it so far.
///
/// `All` passes once every vote is Pass and rejects on the first Reject.
/// `Any` passes on the first Pass and rejects once every vote is Reject.
pub fn evaluate_node(sign_mode: SignMode, decisions: &[VoteDecision]) -> NodeResult {
    if decisions.is_empty() {
        return NodeResult::Pending;
    }
    let every = |wanted: VoteDecision| decisions.iter().all(|d| *d == wanted);
    let some = |wanted: VoteDecision| decisions.contains(&wanted);
    match sign_mode {
        SignMode::All if some(VoteDecision::Reject) => NodeResult::Rejected,
        SignMode::All if every(VoteDecision::Pass) => NodeResult::Passed,
        SignMode::Any if some(VoteDecision::Pass) => NodeResult::Passed,
        SignMode::Any if every(VoteDecision::Reject) => NodeResult::Rejected,
        _ => NodeResult::Pending,
    }
}

/// What a cast vote did to its node.
#[derive(Debug, Clone)]
pub struct VoteOutcome {
    pub vote: NodeVote,
    pub node_case: NodeCase,
    /// The owning instance, locked for the rest of the snapshot.
    pub instance: FlowInstance,
}

impl VoteOutcome {
    /// Whether this vote resolved its node.
    pub fn resolved(&self) -> bool {
        self.node_case.result != NodeResult::Pending
    }
}

/// Record `ballot` on a vote and re-evaluate its node.
///
/// On resolution the node's remaining pending votes are deleted and the node
/// case is closed; advancing the instance is left to the dispatcher.
pub async fn cast_vote<S: BackOfficeStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    vote_id: i64,
    voter: i64,
    ballot: Ballot,
    now: DateTime<Utc>,
) -> Result<VoteOutcome> {
    let mut vote = store
        .get_vote_for_update(snapshot, vote_id)
        .await?
        .ok_or(BackOfficeError::VoteNotFound(vote_id))?;
    if vote.approver_id != voter {
        return Err(BackOfficeError::NotAuthorizedApprover { vote_id, voter });
    }
    if vote.decision != VoteDecision::Pending {
        return Err(BackOfficeError::AlreadyVoted(vote_id));
    }

    let mut node_case = store
        .get_node_case(snapshot, vote.node_case_id)
        .await?
        .ok_or(StorageError::NotFound {
            entity: "node_case",
            id: vote.node_case_id,
        })?;
    let instance = store
        .get_flow_instance_for_update(snapshot, node_case.flow_instance_id)
        .await?
        .ok_or(BackOfficeError::FlowInstanceNotFound(node_case.flow_instance_id))?;
    if instance.status.is_terminal() {
        return Err(BackOfficeError::FlowClosed {
            instance_id: instance.id,
            status: instance.status,
        });
    }

    vote.decision = ballot.into();
    vote.cast_at = Some(now);
    store.update_vote(snapshot, &vote).await?;
    info!(
        "Principal {} cast {:?} on vote {} (node case {}, instance {})",
        voter, ballot, vote.id, node_case.id, instance.id
    );

    let decisions: Vec<VoteDecision> = store
        .list_votes(snapshot, node_case.id)
        .await?
        .into_iter()
        .map(|vote| vote.decision)
        .collect();
    let result = evaluate_node(node_case.sign_mode, &decisions);
    if result == NodeResult::Pending {
        debug!(
            "Node case {} still pending ({} of {} votes cast)",
            node_case.id,
            decisions.iter().filter(|d| **d != VoteDecision::Pending).count(),
            decisions.len()
        );
        return Ok(VoteOutcome {
            vote,
            node_case,
            instance,
        });
    }

    let purged = store.delete_pending_votes(snapshot, node_case.id).await?;
    node_case.result = result;
    node_case.resolved_at = Some(now);
    store.update_node_case(snapshot, &node_case).await?;
    info!(
        "Node case {} of instance {} resolved {:?}, {} pending votes purged",
        node_case.id, instance.id, result, purged
    );

    Ok(VoteOutcome {
        vote,
        node_case,
        instance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VoteDecision::{Pass, Pending, Reject};

    #[test]
    fn all_needs_every_pass() {
        assert_eq!(evaluate_node(SignMode::All, &[Pass, Pending]), NodeResult::Pending);
        assert_eq!(evaluate_node(SignMode::All, &[Pass, Pass]), NodeResult::Passed);
        assert_eq!(evaluate_node(SignMode::All, &[Pass]), NodeResult::Passed);
    }

    #[test]
    fn all_rejects_on_first_reject() {
        assert_eq!(evaluate_node(SignMode::All, &[Pending, Reject]), NodeResult::Rejected);
        assert_eq!(evaluate_node(SignMode::All, &[Pass, Reject, Pass]), NodeResult::Rejected);
    }

    #[test]
    fn any_passes_on_first_pass() {
        assert_eq!(evaluate_node(SignMode::Any, &[Pending, Pass]), NodeResult::Passed);
        assert_eq!(evaluate_node(SignMode::Any, &[Reject, Pass]), NodeResult::Passed);
    }

    #[test]
    fn any_rejects_only_when_everyone_rejects() {
        assert_eq!(evaluate_node(SignMode::Any, &[Reject, Pending]), NodeResult::Pending);
        assert_eq!(evaluate_node(SignMode::Any, &[Reject, Reject]), NodeResult::Rejected);
    }

    #[test]
    fn no_votes_is_pending() {
        assert_eq!(evaluate_node(SignMode::All, &[]), NodeResult::Pending);
        assert_eq!(evaluate_node(SignMode::Any, &[]), NodeResult::Pending);
    }
}
