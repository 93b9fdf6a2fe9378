//! PostgreSQL implementation of `BackOfficeStore`.
//!
//! A snapshot is a `sqlx` transaction; dropping it without commit rolls it
//! back. Vote and flow-instance reads that feed a state change use
//! `SELECT ... FOR UPDATE`.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};

use crate::config::AppConfig;
use crate::error::StorageError;
use crate::models::{
    CcRecord, ChildOrder, ChildOrderStatus, FlowCategory, FlowInstance, FlowTemplate, LedgerEntry,
    NewFlowInstance, NewLedgerEntry, NewRefundOrder, NodeCase, NodeVote, NotifyTarget, Order,
    OrderStatus, Payment, PaymentSource, RefundItem, RefundOrder, RefundPayment, RefundStatus,
    SaleAllocation, SignMode, TemplateNode,
};
use crate::store::{payment_conflict, BackOfficeStore};

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StorageError::Conflict(db.message().to_string())
            }
            _ => StorageError::Backend(err.to_string()),
        }
    }
}

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool sized from the application configuration.
    pub async fn connect(config: &AppConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("migration failed: {e}")))
    }
}

fn ensure_updated(rows: u64, entity: &'static str, id: i64) -> Result<(), StorageError> {
    if rows == 0 {
        return Err(StorageError::NotFound { entity, id });
    }
    Ok(())
}

#[async_trait]
impl BackOfficeStore for PgStore {
    type Snapshot = Transaction<'static, Postgres>;

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError> {
        Ok(self.pool.begin().await?)
    }

    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError> {
        Ok(snapshot.commit().await?)
    }

    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError> {
        Ok(snapshot.rollback().await?)
    }

    async fn get_template(
        &self,
        snapshot: &mut Self::Snapshot,
        template_id: i64,
    ) -> Result<Option<FlowTemplate>, StorageError> {
        let header: Option<(i64, String, FlowCategory, bool)> = sqlx::query_as(
            "SELECT id, name, category, enabled FROM flow_templates WHERE id = $1",
        )
        .bind(template_id)
        .fetch_optional(&mut **snapshot)
        .await?;

        let Some((id, name, category, enabled)) = header else {
            return Ok(None);
        };

        let node_rows: Vec<(i64, i32, SignMode)> = sqlx::query_as(
            "SELECT id, sort_key, sign_mode FROM template_nodes WHERE template_id = $1 ORDER BY sort_key",
        )
        .bind(template_id)
        .fetch_all(&mut **snapshot)
        .await?;

        let approver_rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT a.node_id, a.principal_id
            FROM template_node_approvers a
            JOIN template_nodes n ON n.id = a.node_id
            WHERE n.template_id = $1
            ORDER BY a.node_id, a.principal_id
            "#,
        )
        .bind(template_id)
        .fetch_all(&mut **snapshot)
        .await?;

        let notify: Vec<NotifyTarget> = sqlx::query_as::<_, (i64, String)>(
            "SELECT principal_id, note FROM template_notify WHERE template_id = $1 ORDER BY principal_id",
        )
        .bind(template_id)
        .fetch_all(&mut **snapshot)
        .await?
        .into_iter()
        .map(|(principal_id, note)| NotifyTarget { principal_id, note })
        .collect();

        let nodes = node_rows
            .into_iter()
            .map(|(node_id, sort_key, sign_mode)| TemplateNode {
                sort_key,
                sign_mode,
                approvers: approver_rows
                    .iter()
                    .filter(|(owner, _)| *owner == node_id)
                    .map(|(_, principal_id)| *principal_id)
                    .collect(),
            })
            .collect();

        Ok(Some(FlowTemplate {
            id,
            name,
            category,
            enabled,
            nodes,
            notify,
        }))
    }

    async fn insert_flow_instance(
        &self,
        snapshot: &mut Self::Snapshot,
        instance: NewFlowInstance,
    ) -> Result<FlowInstance, StorageError> {
        let record: FlowInstance = sqlx::query_as(
            r#"
            INSERT INTO flow_instances (template_id, category, current_step, status, initiator, template, created_at)
            VALUES ($1, $2, 0, 'pending', $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(instance.template_id)
        .bind(instance.category)
        .bind(instance.initiator)
        .bind(Json(&instance.template))
        .bind(instance.created_at)
        .fetch_one(&mut **snapshot)
        .await?;
        Ok(record)
    }

    async fn get_flow_instance_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        instance_id: i64,
    ) -> Result<Option<FlowInstance>, StorageError> {
        Ok(
            sqlx::query_as("SELECT * FROM flow_instances WHERE id = $1 FOR UPDATE")
                .bind(instance_id)
                .fetch_optional(&mut **snapshot)
                .await?,
        )
    }

    async fn update_flow_instance(
        &self,
        snapshot: &mut Self::Snapshot,
        instance: &FlowInstance,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE flow_instances SET status = $1, current_step = $2, completed_at = $3 WHERE id = $4",
        )
        .bind(instance.status)
        .bind(instance.current_step)
        .bind(instance.completed_at)
        .bind(instance.id)
        .execute(&mut **snapshot)
        .await?;
        ensure_updated(result.rows_affected(), "flow instance", instance.id)
    }

    async fn open_node_case(
        &self,
        snapshot: &mut Self::Snapshot,
        flow_instance_id: i64,
        sign_mode: SignMode,
        sort_key: i32,
        approvers: &[i64],
        opened_at: DateTime<Utc>,
    ) -> Result<(NodeCase, Vec<NodeVote>), StorageError> {
        let node_case: NodeCase = sqlx::query_as(
            r#"
            INSERT INTO node_cases (flow_instance_id, sign_mode, sort_key, result, opened_at)
            VALUES ($1, $2, $3, 'pending', $4)
            RETURNING *
            "#,
        )
        .bind(flow_instance_id)
        .bind(sign_mode)
        .bind(sort_key)
        .bind(opened_at)
        .fetch_one(&mut **snapshot)
        .await?;

        let mut votes = Vec::with_capacity(approvers.len());
        for approver_id in approvers {
            let vote: NodeVote = sqlx::query_as(
                r#"
                INSERT INTO node_votes (node_case_id, approver_id, decision)
                VALUES ($1, $2, 'pending')
                RETURNING *
                "#,
            )
            .bind(node_case.id)
            .bind(approver_id)
            .fetch_one(&mut **snapshot)
            .await?;
            votes.push(vote);
        }
        Ok((node_case, votes))
    }

    async fn get_node_case(
        &self,
        snapshot: &mut Self::Snapshot,
        node_case_id: i64,
    ) -> Result<Option<NodeCase>, StorageError> {
        Ok(sqlx::query_as("SELECT * FROM node_cases WHERE id = $1")
            .bind(node_case_id)
            .fetch_optional(&mut **snapshot)
            .await?)
    }

    async fn update_node_case(
        &self,
        snapshot: &mut Self::Snapshot,
        node_case: &NodeCase,
    ) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE node_cases SET result = $1, resolved_at = $2 WHERE id = $3")
                .bind(node_case.result)
                .bind(node_case.resolved_at)
                .bind(node_case.id)
                .execute(&mut **snapshot)
                .await?;
        ensure_updated(result.rows_affected(), "node case", node_case.id)
    }

    async fn get_vote_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        vote_id: i64,
    ) -> Result<Option<NodeVote>, StorageError> {
        Ok(
            sqlx::query_as("SELECT * FROM node_votes WHERE id = $1 FOR UPDATE")
                .bind(vote_id)
                .fetch_optional(&mut **snapshot)
                .await?,
        )
    }

    async fn update_vote(
        &self,
        snapshot: &mut Self::Snapshot,
        vote: &NodeVote,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE node_votes SET decision = $1, cast_at = $2 WHERE id = $3")
            .bind(vote.decision)
            .bind(vote.cast_at)
            .bind(vote.id)
            .execute(&mut **snapshot)
            .await?;
        ensure_updated(result.rows_affected(), "vote", vote.id)
    }

    async fn list_votes(
        &self,
        snapshot: &mut Self::Snapshot,
        node_case_id: i64,
    ) -> Result<Vec<NodeVote>, StorageError> {
        Ok(
            sqlx::query_as("SELECT * FROM node_votes WHERE node_case_id = $1 ORDER BY id")
                .bind(node_case_id)
                .fetch_all(&mut **snapshot)
                .await?,
        )
    }

    async fn delete_pending_votes(
        &self,
        snapshot: &mut Self::Snapshot,
        node_case_id: i64,
    ) -> Result<u64, StorageError> {
        let result =
            sqlx::query("DELETE FROM node_votes WHERE node_case_id = $1 AND decision = 'pending'")
                .bind(node_case_id)
                .execute(&mut **snapshot)
                .await?;
        Ok(result.rows_affected())
    }

    async fn insert_cc_records(
        &self,
        snapshot: &mut Self::Snapshot,
        records: &[CcRecord],
    ) -> Result<(), StorageError> {
        for record in records {
            sqlx::query(
                "INSERT INTO cc_records (flow_instance_id, principal_id, note) VALUES ($1, $2, $3)",
            )
            .bind(record.flow_instance_id)
            .bind(record.principal_id)
            .bind(&record.note)
            .execute(&mut **snapshot)
            .await?;
        }
        Ok(())
    }

    async fn get_order(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
    ) -> Result<Option<Order>, StorageError> {
        Ok(sqlx::query_as("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut **snapshot)
            .await?)
    }

    async fn list_child_orders(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
    ) -> Result<Vec<ChildOrder>, StorageError> {
        Ok(
            sqlx::query_as("SELECT * FROM child_orders WHERE order_id = $1 ORDER BY id")
                .bind(order_id)
                .fetch_all(&mut **snapshot)
                .await?,
        )
    }

    async fn update_order_status(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
        status: OrderStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE orders SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(order_id)
            .execute(&mut **snapshot)
            .await?;
        ensure_updated(result.rows_affected(), "order", order_id)
    }

    async fn update_child_order_status(
        &self,
        snapshot: &mut Self::Snapshot,
        child_order_id: i64,
        status: ChildOrderStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE child_orders SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(child_order_id)
            .execute(&mut **snapshot)
            .await?;
        ensure_updated(result.rows_affected(), "child order", child_order_id)
    }

    async fn record_payment(
        &self,
        snapshot: &mut Self::Snapshot,
        payment: &SaleAllocation,
        confirmed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO payments (id, source, order_id, student_id, amount, confirmed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id, source) DO NOTHING
            "#,
        )
        .bind(payment.payment_id)
        .bind(payment.source)
        .bind(payment.order_id)
        .bind(payment.student_id)
        .bind(&payment.amount)
        .bind(confirmed_at)
        .execute(&mut **snapshot)
        .await?;

        let recorded_order_id: i64 =
            sqlx::query_scalar("SELECT order_id FROM payments WHERE id = $1 AND source = $2")
                .bind(payment.payment_id)
                .bind(payment.source)
                .fetch_one(&mut **snapshot)
                .await?;
        if recorded_order_id != payment.order_id {
            return Err(payment_conflict(payment, recorded_order_id));
        }
        Ok(())
    }

    async fn list_payments(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
    ) -> Result<Vec<Payment>, StorageError> {
        Ok(
            sqlx::query_as("SELECT * FROM payments WHERE order_id = $1 ORDER BY id, source")
                .bind(order_id)
                .fetch_all(&mut **snapshot)
                .await?,
        )
    }

    async fn list_ledger_entries(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
    ) -> Result<Vec<LedgerEntry>, StorageError> {
        Ok(
            sqlx::query_as("SELECT * FROM ledger_entries WHERE order_id = $1 ORDER BY id")
                .bind(order_id)
                .fetch_all(&mut **snapshot)
                .await?,
        )
    }

    async fn sale_exists(
        &self,
        snapshot: &mut Self::Snapshot,
        payment_id: i64,
        order_id: i64,
        source: PaymentSource,
    ) -> Result<bool, StorageError> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ledger_entries
                WHERE payment_id = $1 AND order_id = $2 AND payment_source = $3 AND kind = 'sale'
            )
            "#,
        )
        .bind(payment_id)
        .bind(order_id)
        .bind(source)
        .fetch_one(&mut **snapshot)
        .await?)
    }

    async fn append_ledger_entries(
        &self,
        snapshot: &mut Self::Snapshot,
        entries: &[NewLedgerEntry],
        created_at: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, StorageError> {
        let mut written = Vec::with_capacity(entries.len());
        for entry in entries {
            let record: LedgerEntry = sqlx::query_as(
                r#"
                INSERT INTO ledger_entries
                    (student_id, order_id, child_order_id, payment_id, payment_source, goods_id,
                     amount, kind, parent_entry_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING *
                "#,
            )
            .bind(entry.student_id)
            .bind(entry.order_id)
            .bind(entry.child_order_id)
            .bind(entry.payment_id)
            .bind(entry.payment_source)
            .bind(entry.goods_id)
            .bind(&entry.amount)
            .bind(entry.kind)
            .bind(entry.parent_entry_id)
            .bind(created_at)
            .fetch_one(&mut **snapshot)
            .await?;
            written.push(record);
        }
        Ok(written)
    }

    async fn insert_refund_order(
        &self,
        snapshot: &mut Self::Snapshot,
        refund: NewRefundOrder,
    ) -> Result<RefundOrder, StorageError> {
        let record: RefundOrder = sqlx::query_as(
            r#"
            INSERT INTO refund_orders (order_id, student_id, amount, status, reason, flow_instance_id, submitted_at)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(refund.order_id)
        .bind(refund.student_id)
        .bind(&refund.amount)
        .bind(&refund.reason)
        .bind(refund.flow_instance_id)
        .bind(refund.submitted_at)
        .fetch_one(&mut **snapshot)
        .await?;

        for item in &refund.items {
            sqlx::query(
                r#"
                INSERT INTO refund_items (refund_order_id, child_order_id, amount, status)
                VALUES ($1, $2, $3, 'pending')
                "#,
            )
            .bind(record.id)
            .bind(item.child_order_id)
            .bind(&item.amount)
            .execute(&mut **snapshot)
            .await?;
        }

        for payment in &refund.payments {
            sqlx::query(
                r#"
                INSERT INTO refund_payments (refund_order_id, payment_id, payment_source, amount, status)
                VALUES ($1, $2, $3, $4, 'pending')
                "#,
            )
            .bind(record.id)
            .bind(payment.payment_id)
            .bind(payment.source)
            .bind(&payment.amount)
            .execute(&mut **snapshot)
            .await?;
        }

        Ok(record)
    }

    async fn get_refund_order(
        &self,
        snapshot: &mut Self::Snapshot,
        refund_order_id: i64,
    ) -> Result<Option<RefundOrder>, StorageError> {
        Ok(
            sqlx::query_as("SELECT * FROM refund_orders WHERE id = $1 FOR UPDATE")
                .bind(refund_order_id)
                .fetch_optional(&mut **snapshot)
                .await?,
        )
    }

    async fn find_refund_by_flow_instance(
        &self,
        snapshot: &mut Self::Snapshot,
        flow_instance_id: i64,
    ) -> Result<Option<RefundOrder>, StorageError> {
        Ok(
            sqlx::query_as("SELECT * FROM refund_orders WHERE flow_instance_id = $1")
                .bind(flow_instance_id)
                .fetch_optional(&mut **snapshot)
                .await?,
        )
    }

    async fn find_unlinked_refund_submitted_between(
        &self,
        snapshot: &mut Self::Snapshot,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<RefundOrder>, StorageError> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM refund_orders
            WHERE flow_instance_id IS NULL AND submitted_at BETWEEN $1 AND $2
            ORDER BY submitted_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_optional(&mut **snapshot)
        .await?)
    }

    async fn list_refund_items(
        &self,
        snapshot: &mut Self::Snapshot,
        refund_order_id: i64,
    ) -> Result<Vec<RefundItem>, StorageError> {
        Ok(
            sqlx::query_as("SELECT * FROM refund_items WHERE refund_order_id = $1 ORDER BY id")
                .bind(refund_order_id)
                .fetch_all(&mut **snapshot)
                .await?,
        )
    }

    async fn list_refund_payments(
        &self,
        snapshot: &mut Self::Snapshot,
        refund_order_id: i64,
    ) -> Result<Vec<RefundPayment>, StorageError> {
        Ok(
            sqlx::query_as("SELECT * FROM refund_payments WHERE refund_order_id = $1 ORDER BY id")
                .bind(refund_order_id)
                .fetch_all(&mut **snapshot)
                .await?,
        )
    }

    async fn list_approved_refund_payments(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
    ) -> Result<Vec<RefundPayment>, StorageError> {
        Ok(sqlx::query_as(
            r#"
            SELECT rp.*
            FROM refund_payments rp
            JOIN refund_orders ro ON ro.id = rp.refund_order_id
            WHERE ro.order_id = $1 AND ro.status = 'approved'
            ORDER BY rp.id
            "#,
        )
        .bind(order_id)
        .fetch_all(&mut **snapshot)
        .await?)
    }

    async fn set_refund_status(
        &self,
        snapshot: &mut Self::Snapshot,
        refund_order_id: i64,
        status: RefundStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE refund_orders SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(refund_order_id)
            .execute(&mut **snapshot)
            .await?;
        ensure_updated(result.rows_affected(), "refund order", refund_order_id)?;

        sqlx::query("UPDATE refund_items SET status = $1 WHERE refund_order_id = $2")
            .bind(status)
            .bind(refund_order_id)
            .execute(&mut **snapshot)
            .await?;
        sqlx::query("UPDATE refund_payments SET status = $1 WHERE refund_order_id = $2")
            .bind(status)
            .bind(refund_order_id)
            .execute(&mut **snapshot)
            .await?;
        Ok(())
    }

    async fn approved_refund_total(
        &self,
        snapshot: &mut Self::Snapshot,
        order_id: i64,
    ) -> Result<BigDecimal, StorageError> {
        Ok(sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM refund_orders WHERE order_id = $1 AND status = 'approved'",
        )
        .bind(order_id)
        .fetch_one(&mut **snapshot)
        .await?)
    }
}
