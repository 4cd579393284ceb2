use anyhow::Result;
use commit_status_core::models::ProblemRecord;
use sqlx::Row;

use crate::{Database, from_millis, now_millis};

impl Database {
    /// Adds a problem unless the entity already has one with the same description.
    ///
    /// Returns whether a new record was stored.
    pub async fn report_problem(
        &self,
        entity_id: &str,
        publisher_id: &str,
        description: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO problems (entity_id, publisher_id, description, reported_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (entity_id, description) DO NOTHING
            "#,
        )
        .bind(entity_id)
        .bind(publisher_id)
        .bind(description)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Removes every problem the publisher reported for the entity.
    pub async fn clear_problems(&self, entity_id: &str, publisher_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM problems WHERE entity_id = ? AND publisher_id = ?")
            .bind(entity_id)
            .bind(publisher_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    pub async fn get_problems(&self, entity_id: &str) -> Result<Vec<ProblemRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, publisher_id, description, reported_at
            FROM problems
            WHERE entity_id = ?
            ORDER BY id
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        let mut problems = Vec::with_capacity(rows.len());
        for row in rows {
            problems.push(ProblemRecord {
                entity_id: row.try_get("entity_id")?,
                publisher_id: row.try_get("publisher_id")?,
                description: row.try_get("description")?,
                reported_at: from_millis(row.try_get("reported_at")?),
            });
        }
        Ok(problems)
    }
}
