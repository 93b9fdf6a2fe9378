//! # Workflow Integration Tests
//!
//! Drive flow instances through the `BackOffice` facade over an in-memory
//! store: node evaluation, advancement, finalization and cancellation.

mod common;

use common::*;
use tutor_backoffice::models::{Ballot, FlowCategory, FlowStatus, NodeResult, SignMode};
use tutor_backoffice::BackOfficeError;

async fn office_with_template(nodes: Vec<tutor_backoffice::models::TemplateNode>) -> Office {
    let office = empty_office();
    office
        .store()
        .add_template(template(300, FlowCategory::General, nodes))
        .await;
    office
}

#[tokio::test]
async fn scenario_c_all_node_rejects_on_first_reject_and_purges_pending_votes() {
    let office = office_with_template(vec![node(10, SignMode::All, &[1, 2, 3])]).await;
    let instance = office.create_from_template(300, CLERK).await.unwrap();
    let votes = open_votes(&office, instance.id).await;
    assert_eq!(votes.len(), 3);

    let first = office.cast_vote(votes[0].id, 1, Ballot::Pass).await.unwrap();
    assert!(!first.resolved());

    let second = office.cast_vote(votes[1].id, 2, Ballot::Reject).await.unwrap();
    assert!(second.resolved());
    assert_eq!(second.node_case.result, NodeResult::Rejected);
    assert_eq!(second.instance.status, FlowStatus::Rejected);
    assert!(second.instance.completed_at.is_some());

    let state = office.store().read().await;
    assert!(!state.votes.contains_key(&votes[2].id), "pending vote is purged");
    assert!(state.cc_records.is_empty());

    let late = office.cast_vote(votes[2].id, 3, Ballot::Pass).await.unwrap_err();
    assert!(matches!(late, BackOfficeError::VoteNotFound(_)));
}

#[tokio::test]
async fn all_node_passes_only_after_every_approver_passes() {
    let office = office_with_template(vec![node(10, SignMode::All, &[1, 2])]).await;
    let instance = office.create_from_template(300, CLERK).await.unwrap();
    let votes = open_votes(&office, instance.id).await;

    let first = office.cast_vote(votes[0].id, 1, Ballot::Pass).await.unwrap();
    assert_eq!(first.node_case.result, NodeResult::Pending);
    assert_eq!(first.instance.status, FlowStatus::Pending);

    let second = office.cast_vote(votes[1].id, 2, Ballot::Pass).await.unwrap();
    assert_eq!(second.node_case.result, NodeResult::Passed);
    assert_eq!(second.instance.status, FlowStatus::Approved);

    let state = office.store().read().await;
    assert_eq!(state.cc_records.len(), 1);
    assert_eq!(state.cc_records[0].flow_instance_id, instance.id);
    assert_eq!(state.cc_records[0].principal_id, 900);
}

#[tokio::test]
async fn any_node_passes_on_first_pass() {
    let office = office_with_template(vec![node(10, SignMode::Any, &[1, 2, 3])]).await;
    let instance = office.create_from_template(300, CLERK).await.unwrap();
    let votes = open_votes(&office, instance.id).await;

    office.cast_vote(votes[0].id, 1, Ballot::Reject).await.unwrap();
    let outcome = office.cast_vote(votes[2].id, 3, Ballot::Pass).await.unwrap();

    assert_eq!(outcome.node_case.result, NodeResult::Passed);
    assert_eq!(outcome.instance.status, FlowStatus::Approved);
    assert!(open_votes(&office, instance.id).await.is_empty());

    let moot = office.cast_vote(votes[1].id, 2, Ballot::Reject).await.unwrap_err();
    assert!(matches!(moot, BackOfficeError::VoteNotFound(_)));
}

#[tokio::test]
async fn any_node_rejects_only_when_everyone_rejects() {
    let office = office_with_template(vec![node(10, SignMode::Any, &[1, 2])]).await;
    let instance = office.create_from_template(300, CLERK).await.unwrap();
    let votes = open_votes(&office, instance.id).await;

    let first = office.cast_vote(votes[0].id, 1, Ballot::Reject).await.unwrap();
    assert_eq!(first.node_case.result, NodeResult::Pending);

    let second = office.cast_vote(votes[1].id, 2, Ballot::Reject).await.unwrap();
    assert_eq!(second.node_case.result, NodeResult::Rejected);
    assert_eq!(second.instance.status, FlowStatus::Rejected);
}

#[tokio::test]
async fn votes_are_bound_to_their_approver_and_cast_once() {
    let office = office_with_template(vec![node(10, SignMode::All, &[1, 2])]).await;
    let instance = office.create_from_template(300, CLERK).await.unwrap();
    let votes = open_votes(&office, instance.id).await;

    let stranger = office.cast_vote(votes[0].id, 2, Ballot::Pass).await.unwrap_err();
    assert!(matches!(
        stranger,
        BackOfficeError::NotAuthorizedApprover { voter: 2, .. }
    ));

    office.cast_vote(votes[0].id, 1, Ballot::Pass).await.unwrap();
    let again = office.cast_vote(votes[0].id, 1, Ballot::Reject).await.unwrap_err();
    assert!(matches!(again, BackOfficeError::AlreadyVoted(id) if id == votes[0].id));

    let unknown = office.cast_vote(9_999, 1, Ballot::Pass).await.unwrap_err();
    assert!(matches!(unknown, BackOfficeError::VoteNotFound(9_999)));
}

#[tokio::test]
async fn nodes_run_in_sort_key_order_and_advance_the_step() {
    // Declared out of order on purpose.
    let office = office_with_template(vec![
        node(20, SignMode::Any, &[2]),
        node(10, SignMode::All, &[1]),
    ])
    .await;
    let instance = office.create_from_template(300, CLERK).await.unwrap();
    assert_eq!(instance.current_step, 0);

    let votes = open_votes(&office, instance.id).await;
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].approver_id, 1);

    let outcome = office.cast_vote(votes[0].id, 1, Ballot::Pass).await.unwrap();
    assert_eq!(outcome.instance.status, FlowStatus::Pending);
    assert_eq!(outcome.instance.current_step, 1);
    assert!(office.store().read().await.cc_records.is_empty());

    let votes = open_votes(&office, instance.id).await;
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].approver_id, 2);

    let outcome = office.cast_vote(votes[0].id, 2, Ballot::Pass).await.unwrap();
    assert_eq!(outcome.instance.status, FlowStatus::Approved);
    assert_eq!(outcome.instance.current_step, 1);

    let state = office.store().read().await;
    assert_eq!(state.flow_instances[&instance.id].status, FlowStatus::Approved);
    assert_eq!(state.node_cases_for(instance.id).len(), 2);
    assert_eq!(state.cc_records.len(), 1);
}

#[tokio::test]
async fn running_instances_keep_the_template_they_started_with() {
    let office = office_with_template(vec![
        node(10, SignMode::Any, &[1]),
        node(20, SignMode::Any, &[2]),
    ])
    .await;
    let instance = office.create_from_template(300, CLERK).await.unwrap();

    // The template loses its second node after the instance started.
    office
        .store()
        .add_template(template(300, FlowCategory::General, vec![node(10, SignMode::Any, &[1])]))
        .await;

    let votes = open_votes(&office, instance.id).await;
    let outcome = office.cast_vote(votes[0].id, 1, Ballot::Pass).await.unwrap();
    assert_eq!(outcome.instance.status, FlowStatus::Pending);
    assert_eq!(open_votes(&office, instance.id).await[0].approver_id, 2);
}

#[tokio::test]
async fn empty_later_node_aborts_the_vote() {
    let office = office_with_template(vec![
        node(10, SignMode::Any, &[1]),
        node(20, SignMode::Any, &[]),
    ])
    .await;
    let instance = office.create_from_template(300, CLERK).await.unwrap();
    let votes = open_votes(&office, instance.id).await;

    let err = office.cast_vote(votes[0].id, 1, Ballot::Pass).await.unwrap_err();
    assert!(matches!(
        err,
        BackOfficeError::NoApproversConfigured { sort_key: 20, .. }
    ));

    // Nothing of the vote survived.
    let state = office.store().read().await;
    assert_eq!(state.flow_instances[&instance.id].current_step, 0);
    assert_eq!(state.node_cases_for(instance.id).len(), 1);
    assert_eq!(open_votes(&office, instance.id).await.len(), 1);
}

#[tokio::test]
async fn creation_checks_the_template() {
    let office = empty_office();
    let store = office.store();
    let mut disabled = template(301, FlowCategory::General, vec![node(10, SignMode::All, &[1])]);
    disabled.enabled = false;
    store.add_template(disabled).await;
    store
        .add_template(template(302, FlowCategory::General, vec![node(10, SignMode::All, &[])]))
        .await;
    store
        .add_template(template(303, FlowCategory::General, Vec::new()))
        .await;

    assert!(matches!(
        office.create_from_template(999, CLERK).await.unwrap_err(),
        BackOfficeError::TemplateNotFound(999)
    ));
    assert!(matches!(
        office.create_from_template(301, CLERK).await.unwrap_err(),
        BackOfficeError::TemplateDisabled(301)
    ));
    assert!(matches!(
        office.create_from_template(302, CLERK).await.unwrap_err(),
        BackOfficeError::NoApproversConfigured {
            template_id: 302,
            sort_key: 10
        }
    ));
    assert!(matches!(
        office.create_from_template(303, CLERK).await.unwrap_err(),
        BackOfficeError::NoApproversConfigured { template_id: 303, .. }
    ));

    let state = office.store().read().await;
    assert!(state.flow_instances.is_empty());
    assert!(state.node_cases.is_empty());
    assert!(state.votes.is_empty());
}

#[tokio::test]
async fn only_the_initiator_cancels_a_pending_instance() {
    let office = office_with_template(vec![node(10, SignMode::All, &[1, 2])]).await;
    let instance = office.create_from_template(300, CLERK).await.unwrap();

    let err = office.cancel(instance.id, 1).await.unwrap_err();
    assert!(matches!(
        err,
        BackOfficeError::NotInitiator { requester: 1, .. }
    ));

    let cancelled = office.cancel(instance.id, CLERK).await.unwrap();
    assert_eq!(cancelled.status, FlowStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    let again = office.cancel(instance.id, CLERK).await.unwrap_err();
    assert!(matches!(
        again,
        BackOfficeError::NotCancellable {
            status: FlowStatus::Cancelled,
            ..
        }
    ));

    let votes = open_votes(&office, instance.id).await;
    let closed = office.cast_vote(votes[0].id, 1, Ballot::Pass).await.unwrap_err();
    assert!(matches!(closed, BackOfficeError::FlowClosed { .. }));

    assert!(matches!(
        office.cancel(9_999, CLERK).await.unwrap_err(),
        BackOfficeError::FlowInstanceNotFound(9_999)
    ));
}

#[tokio::test]
async fn finished_instances_cannot_be_cancelled() {
    let office = office_with_template(vec![node(10, SignMode::Any, &[1])]).await;
    let instance = office.create_from_template(300, CLERK).await.unwrap();
    let votes = open_votes(&office, instance.id).await;
    office.cast_vote(votes[0].id, 1, Ballot::Pass).await.unwrap();

    let err = office.cancel(instance.id, CLERK).await.unwrap_err();
    assert!(matches!(
        err,
        BackOfficeError::NotCancellable {
            status: FlowStatus::Approved,
            ..
        }
    ));
}
