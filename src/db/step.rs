//! Step row operations: batched inserts, ordered reads, and step aggregates.

use sqlx::{FromRow, Row};
use tracing::debug;

use crate::buffer::StepSink;
use crate::error::{Error, Result};
use crate::model::*;

use super::query::SqlBuilder;

/// Rows per INSERT statement. Keeps every backend under its bind limit.
const INSERT_CHUNK_ROWS: usize = 100;

const STEP_COLUMNS: &str = "id, workflow_id, step, data, created_at";

impl super::Db {
    /// Insert steps as multi-row INSERTs inside one transaction.
    ///
    /// The parent workflow is not checked; steps for unknown ids are stored
    /// as orphans.
    pub async fn insert_steps(&self, steps: &[WorkflowStep]) -> Result<()> {
        if steps.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;
        for chunk in steps.chunks(INSERT_CHUNK_ROWS) {
            let mut sql = SqlBuilder::new(self.dialect());
            sql.push("INSERT INTO workflow_step (")
                .push(STEP_COLUMNS)
                .push(") VALUES ");
            for (i, step) in chunk.iter().enumerate() {
                if i > 0 {
                    sql.push(", ");
                }
                sql.push("(")
                    .push_bind(step.id.to_string())
                    .push(", ")
                    .push_bind(step.workflow_id.to_string())
                    .push(", ")
                    .push_bind(step.step.as_str())
                    .push(", ")
                    .push_bind(self.encode_payload(&step.data)?)
                    .push(", ")
                    .push_bind(format_timestamp(&step.created_at))
                    .push(")");
            }
            sql.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(count = steps.len(), "steps inserted");
        Ok(())
    }

    /// Steps of one workflow, oldest first.
    pub async fn steps_for_workflow(&self, id: WorkflowId) -> Result<Vec<WorkflowStep>> {
        let mut sql = SqlBuilder::new(self.dialect());
        sql.push("SELECT ")
            .push(STEP_COLUMNS)
            .push(" FROM workflow_step WHERE workflow_id = ")
            .push_bind(id.to_string())
            .push(" ORDER BY created_at ASC, id ASC");
        let rows = sql.build().fetch_all(self.pool()).await?;
        rows.iter()
            .map(|row| StepRow::from_row(row)?.try_into_step())
            .collect()
    }

    /// Steps of every workflow carrying the identifier, grouped by workflow
    /// (oldest workflow first) and ordered by creation inside each group.
    pub async fn steps_by_identifier(&self, ident: &Identifier) -> Result<Vec<WorkflowStep>> {
        let mut sql = SqlBuilder::new(self.dialect());
        sql.push(
            "SELECT s.id AS id, s.workflow_id AS workflow_id, s.step AS step, \
             s.data AS data, s.created_at AS created_at \
             FROM workflow_step AS s JOIN workflow AS w ON s.workflow_id = w.id WHERE ",
        );
        self.dialect()
            .push_identifier_predicate(&mut sql, "w.identifiers", ident);
        sql.push(" ORDER BY w.started_at ASC, w.id ASC, s.created_at ASC, s.id ASC");

        let rows = sql.build().fetch_all(self.pool()).await?;
        rows.iter()
            .map(|row| StepRow::from_row(row)?.try_into_step())
            .collect()
    }

    /// Step names by number of occurrences, most frequent first, ties by name.
    pub async fn most_frequent_steps(&self, limit: i64) -> Result<Vec<StepFrequency>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let mut sql = SqlBuilder::new(self.dialect());
        sql.push(
            "SELECT step, COUNT(*) AS occurrences FROM workflow_step \
             GROUP BY step ORDER BY occurrences DESC, step ASC LIMIT ",
        )
        .push_bind(limit);

        let rows = sql.build().fetch_all(self.pool()).await?;
        rows.iter()
            .map(|row| -> Result<StepFrequency> {
                Ok(StepFrequency {
                    step: row.try_get("step")?,
                    count: row.try_get("occurrences")?,
                })
            })
            .collect()
    }

    /// Per-workflow step count and first/last step time, oldest workflow first.
    pub async fn step_durations(&self) -> Result<Vec<StepDuration>> {
        let rows = sqlx::query(
            "SELECT w.id AS id, w.name AS name, COUNT(s.id) AS step_count,
                    MIN(s.created_at) AS first_step_at, MAX(s.created_at) AS last_step_at
             FROM workflow AS w LEFT JOIN workflow_step AS s ON s.workflow_id = w.id
             GROUP BY w.id, w.name, w.started_at
             ORDER BY w.started_at ASC, w.id ASC",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| -> Result<StepDuration> {
                let id: String = row.try_get("id")?;
                let first: Option<String> = row.try_get("first_step_at")?;
                let last: Option<String> = row.try_get("last_step_at")?;
                let first_step_at = first.as_deref().map(parse_timestamp).transpose()?;
                let last_step_at = last.as_deref().map(parse_timestamp).transpose()?;
                let duration_ms = match (first_step_at, last_step_at) {
                    (Some(first), Some(last)) => Some((last - first).num_milliseconds()),
                    _ => None,
                };
                Ok(StepDuration {
                    workflow_id: id.parse()?,
                    name: row.try_get("name")?,
                    step_count: row.try_get("step_count")?,
                    first_step_at,
                    last_step_at,
                    duration_ms,
                })
            })
            .collect()
    }

    /// Serialize a payload for the `data` column.
    ///
    /// JSON `null` is written as the text `null`, or as SQL NULL when the
    /// legacy null-default mode is on.
    fn encode_payload(&self, data: &serde_json::Value) -> Result<Option<String>> {
        if data.is_null() && self.null_as_default() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_string(data)?))
    }
}

impl StepSink for super::Db {
    async fn write_steps(&self, steps: Vec<WorkflowStep>) -> Result<()> {
        self.insert_steps(&steps).await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct StepRow {
    id: String,
    workflow_id: String,
    step: String,
    data: Option<String>,
    created_at: String,
}

impl StepRow {
    fn try_into_step(self) -> Result<WorkflowStep> {
        let data = match self.data.as_deref() {
            None => serde_json::Value::Null,
            Some(text) => serde_json::from_str(text)?,
        };
        Ok(WorkflowStep {
            id: StepId(
                self.id
                    .parse::<uuid::Uuid>()
                    .map_err(|e| Error::Other(format!("invalid step id: {e}")))?,
            ),
            workflow_id: self.workflow_id.parse()?,
            step: self.step,
            data,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(data: Option<&str>) -> StepRow {
        StepRow {
            id: StepId::new().to_string(),
            workflow_id: WorkflowId::new().to_string(),
            step: "validate".into(),
            data: data.map(str::to_string),
            created_at: "2024-05-01T10:00:00.000123Z".into(),
        }
    }

    #[test]
    fn null_and_missing_payloads_read_as_null() {
        assert!(row(None).try_into_step().unwrap().data.is_null());
        assert!(row(Some("null")).try_into_step().unwrap().data.is_null());
    }

    #[test]
    fn payload_text_is_parsed_as_json() {
        let step = row(Some(r#"{"rows":12}"#)).try_into_step().unwrap();
        assert_eq!(step.data["rows"], 12);
        assert_eq!(step.created_at.timestamp_subsec_micros(), 123);
    }
}
