//! Workflow row operations: insert, lookup, status transitions, identifier
//! updates, deletes, listing, and aggregate counts.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row};
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifier;
use crate::model::*;

use super::query::{Paging, SqlBuilder, WORKFLOW_COLUMNS, count_query, page_query};

impl super::Db {
    /// Insert a new workflow row.
    pub async fn insert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut sql = SqlBuilder::new(self.dialect());
        sql.push("INSERT INTO workflow (id, name, identifiers, status, started_at, ended_at) VALUES (")
            .push_bind(workflow.id.to_string())
            .push(", ")
            .push_bind(workflow.name.as_str())
            .push(", ")
            .push_bind(identifier::encode(&workflow.identifiers)?)
            .push(", ")
            .push_bind(workflow.status.as_str())
            .push(", ")
            .push_bind(format_timestamp(&workflow.started_at))
            .push(", ")
            .push_bind(workflow.ended_at.as_ref().map(format_timestamp))
            .push(")");
        sql.build().execute(self.pool()).await?;
        Ok(())
    }

    /// Get a workflow by ID.
    pub async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>> {
        let mut sql = SqlBuilder::new(self.dialect());
        sql.push("SELECT ")
            .push(WORKFLOW_COLUMNS)
            .push(" FROM workflow WHERE id = ")
            .push_bind(id.to_string());
        let row = sql.build().fetch_optional(self.pool()).await?;
        row.map(|row| WorkflowRow::from_row(&row)?.try_into_workflow())
            .transpose()
    }

    /// First workflow (oldest `started_at`) carrying this identifier.
    pub async fn find_workflow_by_identifier(
        &self,
        ident: &Identifier,
    ) -> Result<Option<Workflow>> {
        let mut sql = SqlBuilder::new(self.dialect());
        sql.push("SELECT ").push(WORKFLOW_COLUMNS).push(" FROM workflow WHERE ");
        self.dialect()
            .push_identifier_predicate(&mut sql, "identifiers", ident);
        sql.push(" ORDER BY started_at ASC, id ASC LIMIT 1");

        let row = sql.build().fetch_optional(self.pool()).await?;
        row.map(|row| WorkflowRow::from_row(&row)?.try_into_workflow())
            .transpose()
    }

    /// Move a pending workflow to `to`, stamping `ended_at`.
    ///
    /// Only rows still `pending` are touched. Returns whether a row moved.
    pub async fn transition_status(
        &self,
        id: WorkflowId,
        to: Status,
        ended_at: DateTime<Utc>,
    ) -> Result<bool> {
        if !Status::Pending.can_transition_to(to) {
            return Err(Error::Validation(format!("cannot transition to {to}")));
        }

        let mut sql = SqlBuilder::new(self.dialect());
        sql.push("UPDATE workflow SET status = ")
            .push_bind(to.as_str())
            .push(", ended_at = ")
            .push_bind(format_timestamp(&ended_at))
            .push(" WHERE id = ")
            .push_bind(id.to_string())
            .push(" AND status = ")
            .push_bind(Status::Pending.as_str());
        let rows_affected = sql.build().execute(self.pool()).await?.rows_affected();

        debug!(workflow_id = %id, to = %to, rows_affected, "status transition");
        Ok(rows_affected > 0)
    }

    /// Add `new` to the identifiers of the workflow found by `existing`.
    ///
    /// Returns `Ok(false)` when `new` is already attached.
    pub async fn attach_identifier(&self, existing: &Identifier, new: Identifier) -> Result<bool> {
        let mut find = SqlBuilder::new(self.dialect());
        find.push("SELECT ").push(WORKFLOW_COLUMNS).push(" FROM workflow WHERE ");
        self.dialect()
            .push_identifier_predicate(&mut find, "identifiers", existing);
        find.push(" ORDER BY started_at ASC, id ASC LIMIT 1")
            .push(self.dialect().row_lock_suffix());

        let missing = format!(
            "workflow with identifier {}={}",
            existing.key, existing.value
        );
        self.attach_to_found(find, missing, new).await
    }

    /// Add `new` to the identifiers of workflow `id`.
    pub async fn attach_identifier_to(&self, id: WorkflowId, new: Identifier) -> Result<bool> {
        let mut find = SqlBuilder::new(self.dialect());
        find.push("SELECT ")
            .push(WORKFLOW_COLUMNS)
            .push(" FROM workflow WHERE id = ")
            .push_bind(id.to_string())
            .push(self.dialect().row_lock_suffix());
        self.attach_to_found(find, format!("workflow {id}"), new)
            .await
    }

    /// Read-modify-write of the identifier list in one transaction. `find`
    /// locks the row where the backend supports it, so concurrent attaches
    /// to one workflow serialize instead of overwriting each other.
    async fn attach_to_found(
        &self,
        find: SqlBuilder<'_>,
        missing: String,
        new: Identifier,
    ) -> Result<bool> {
        identifier::validate(&new)?;

        let mut tx = self.pool().begin().await?;
        let Some(row) = find.build().fetch_optional(&mut *tx).await? else {
            return Err(Error::NotFound(missing));
        };
        let mut workflow = WorkflowRow::from_row(&row)?.try_into_workflow()?;

        if !identifier::attach(&mut workflow.identifiers, new) {
            return Ok(false);
        }

        let mut update = SqlBuilder::new(self.dialect());
        update
            .push("UPDATE workflow SET identifiers = ")
            .push_bind(identifier::encode(&workflow.identifiers)?)
            .push(" WHERE id = ")
            .push_bind(workflow.id.to_string());
        update.build().execute(&mut *tx).await?;

        tx.commit().await?;
        debug!(workflow_id = %workflow.id, "identifier attached");
        Ok(true)
    }

    /// Delete a workflow and all of its steps in one transaction.
    ///
    /// Returns whether the workflow row existed.
    pub async fn delete_workflow(&self, id: WorkflowId) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let mut steps = SqlBuilder::new(self.dialect());
        steps
            .push("DELETE FROM workflow_step WHERE workflow_id = ")
            .push_bind(id.to_string());
        let steps_deleted = steps.build().execute(&mut *tx).await?.rows_affected();

        let mut workflow = SqlBuilder::new(self.dialect());
        workflow
            .push("DELETE FROM workflow WHERE id = ")
            .push_bind(id.to_string());
        let existed = workflow.build().execute(&mut *tx).await?.rows_affected() > 0;

        tx.commit().await?;
        debug!(workflow_id = %id, existed, steps_deleted, "workflow deleted");
        Ok(existed)
    }

    /// Wipe both tables in one transaction.
    pub async fn delete_all_workflows(&self) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM workflow_step")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workflow").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Count and fetch one page of workflows under the same predicates.
    pub async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<WorkflowPage> {
        let paging = Paging::from_filter(filter)?;
        let count = count_query(self.dialect(), filter);
        let page = page_query(self.dialect(), filter, &paging);

        let mut tx = self.pool().begin().await?;
        let total: i64 = count.build().fetch_one(&mut *tx).await?.try_get("total")?;
        let rows = page.build().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let workflows = rows
            .iter()
            .map(|row| WorkflowRow::from_row(row)?.try_into_workflow())
            .collect::<Result<Vec<_>>>()?;

        Ok(WorkflowPage {
            workflows,
            total,
            page: paging.page,
            page_size: paging.page_size,
            total_pages: paging.total_pages(total),
        })
    }

    /// Status counts plus mean steps per workflow.
    ///
    /// Every workflow is in the denominator; workflows without steps add
    /// zero. Steps whose workflow no longer exists are not counted.
    pub async fn workflow_stats(&self) -> Result<WorkflowStats> {
        let counts = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COUNT(CASE WHEN status = 'completed' THEN 1 END) AS completed,
                    COUNT(CASE WHEN status = 'pending' THEN 1 END) AS pending
             FROM workflow",
        )
        .fetch_one(self.pool())
        .await?;
        let total: i64 = counts.try_get("total")?;
        let completed: i64 = counts.try_get("completed")?;
        let pending: i64 = counts.try_get("pending")?;

        let steps: i64 = sqlx::query(
            "SELECT COUNT(*) AS steps
             FROM workflow_step AS s JOIN workflow AS w ON s.workflow_id = w.id",
        )
        .fetch_one(self.pool())
        .await?
        .try_get("steps")?;

        let avg_steps = if total > 0 {
            round_to_cents(steps as f64 / total as f64)
        } else {
            0.0
        };

        Ok(WorkflowStats {
            total,
            completed,
            pending,
            failed: total - completed - pending,
            avg_steps,
        })
    }
}

fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: String,
    name: String,
    identifiers: Option<String>,
    status: String,
    started_at: String,
    ended_at: Option<String>,
}

impl WorkflowRow {
    fn try_into_workflow(self) -> Result<Workflow> {
        Ok(Workflow {
            id: self.id.parse()?,
            name: self.name,
            identifiers: identifier::decode(self.identifiers.as_deref())?,
            status: self.status.parse()?,
            started_at: parse_timestamp(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}
