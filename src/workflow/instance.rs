//! Flow instance lifecycle: creation from a template and cancellation.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::{BackOfficeError, Result};
use crate::models::{FlowInstance, FlowStatus, NewFlowInstance};
use crate::store::BackOfficeStore;

/// Start a flow instance on a template and open its first node.
///
/// The template's nodes, approver sets and notify list are frozen into the
/// instance; later template edits do not affect it.
pub async fn create_from_template<S: BackOfficeStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    template_id: i64,
    initiator: i64,
    now: DateTime<Utc>,
) -> Result<FlowInstance> {
    let template = store
        .get_template(snapshot, template_id)
        .await?
        .ok_or(BackOfficeError::TemplateNotFound(template_id))?;
    if !template.enabled {
        return Err(BackOfficeError::TemplateDisabled(template_id));
    }

    let frozen = template.snapshot();
    let first = match frozen.first_node() {
        Some(node) if !node.approvers.is_empty() => node.clone(),
        other => {
            return Err(BackOfficeError::NoApproversConfigured {
                template_id,
                sort_key: other.map(|node| node.sort_key).unwrap_or_default(),
            })
        }
    };

    let instance = store
        .insert_flow_instance(
            snapshot,
            NewFlowInstance {
                template_id,
                category: template.category,
                initiator,
                template: frozen,
                created_at: now,
            },
        )
        .await?;
    let (node_case, votes) = store
        .open_node_case(
            snapshot,
            instance.id,
            first.sign_mode,
            first.sort_key,
            &first.approvers,
            now,
        )
        .await?;

    info!(
        "Flow instance {} started on template {} ({}) by {}: node {} open with {} votes",
        instance.id,
        template_id,
        template.name,
        initiator,
        node_case.sort_key,
        votes.len()
    );
    Ok(instance)
}

/// Cancel a pending instance on behalf of its initiator. No completion
/// handler runs.
pub async fn cancel<S: BackOfficeStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    instance_id: i64,
    requester: i64,
    now: DateTime<Utc>,
) -> Result<FlowInstance> {
    let mut instance = store
        .get_flow_instance_for_update(snapshot, instance_id)
        .await?
        .ok_or(BackOfficeError::FlowInstanceNotFound(instance_id))?;
    if instance.initiator != requester {
        return Err(BackOfficeError::NotInitiator {
            instance_id,
            requester,
        });
    }
    if instance.status != FlowStatus::Pending {
        return Err(BackOfficeError::NotCancellable {
            instance_id,
            status: instance.status,
        });
    }

    instance.status = FlowStatus::Cancelled;
    instance.completed_at = Some(now);
    store.update_flow_instance(snapshot, &instance).await?;
    info!("Flow instance {} cancelled by {}", instance.id, requester);
    Ok(instance)
}
