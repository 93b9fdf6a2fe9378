//! Advances or finalizes an instance once one of its nodes resolves.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::{BackOfficeError, Result};
use crate::models::{CcRecord, FlowInstance, FlowStatus, NodeCase, NodeResult};
use crate::store::BackOfficeStore;
use crate::workflow::completion::CompletionRegistry;

/// Act on a resolved node case.
///
/// Rejected finalizes the instance as Rejected. Passed opens the next node of
/// the template snapshot, or finalizes the instance as Approved and writes
/// the CC records when there is none. Finalization runs the completion
/// handler of the instance's category. Returns the updated instance.
pub async fn dispatch<S: BackOfficeStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    completions: &CompletionRegistry<S>,
    mut instance: FlowInstance,
    resolved: &NodeCase,
    now: DateTime<Utc>,
) -> Result<FlowInstance> {
    match resolved.result {
        NodeResult::Pending => Ok(instance),
        NodeResult::Rejected => {
            instance.status = FlowStatus::Rejected;
            instance.completed_at = Some(now);
            store.update_flow_instance(snapshot, &instance).await?;
            info!(
                "Flow instance {} rejected at node {}",
                instance.id, resolved.sort_key
            );
            completions
                .complete(store, snapshot, &instance, false, now)
                .await?;
            Ok(instance)
        }
        NodeResult::Passed => {
            let next = instance.template.node_after(resolved.sort_key).cloned();
            let Some(next) = next else {
                return finalize_approved(store, snapshot, completions, instance, now).await;
            };
            if next.approvers.is_empty() {
                return Err(BackOfficeError::NoApproversConfigured {
                    template_id: instance.template_id,
                    sort_key: next.sort_key,
                });
            }
            let (node_case, votes) = store
                .open_node_case(
                    snapshot,
                    instance.id,
                    next.sign_mode,
                    next.sort_key,
                    &next.approvers,
                    now,
                )
                .await?;
            instance.current_step += 1;
            store.update_flow_instance(snapshot, &instance).await?;
            info!(
                "Flow instance {} advanced to node {} (step {}, node case {}, {} votes)",
                instance.id,
                next.sort_key,
                instance.current_step,
                node_case.id,
                votes.len()
            );
            Ok(instance)
        }
    }
}

async fn finalize_approved<S: BackOfficeStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    completions: &CompletionRegistry<S>,
    mut instance: FlowInstance,
    now: DateTime<Utc>,
) -> Result<FlowInstance> {
    instance.status = FlowStatus::Approved;
    instance.completed_at = Some(now);
    store.update_flow_instance(snapshot, &instance).await?;

    let records: Vec<CcRecord> = instance
        .template
        .notify
        .iter()
        .map(|target| CcRecord {
            flow_instance_id: instance.id,
            principal_id: target.principal_id,
            note: target.note.clone(),
        })
        .collect();
    store.insert_cc_records(snapshot, &records).await?;
    info!(
        "Flow instance {} approved, {} principals notified",
        instance.id,
        records.len()
    );

    completions
        .complete(store, snapshot, &instance, true, now)
        .await?;
    Ok(instance)
}
