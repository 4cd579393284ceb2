use anyhow::{Context, Result};
use commit_status_core::models::{BuildRef, PromotionId};
use sqlx::Row;
use time::OffsetDateTime;

use crate::{Database, now_millis, to_millis};

impl Database {
    /// Stores the latest snapshot of a build, replacing any previous one.
    pub async fn upsert_build(&self, build: &BuildRef) -> Result<()> {
        let snapshot = serde_json::to_string(build).context("Failed to encode build snapshot")?;
        sqlx::query(
            r#"
            INSERT INTO builds (promotion_id, build_type_id, finished, snapshot, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (promotion_id) DO UPDATE SET
                build_type_id = excluded.build_type_id,
                finished = excluded.finished,
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(build.promotion_id.0 as i64)
        .bind(&build.build_type_id)
        .bind(build.is_finished())
        .bind(snapshot)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_build(&self, promotion_id: PromotionId) -> Result<Option<BuildRef>> {
        let row = sqlx::query("SELECT snapshot FROM builds WHERE promotion_id = ?")
            .bind(promotion_id.0 as i64)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let snapshot: String = row.try_get("snapshot")?;
        let build = serde_json::from_str(&snapshot)
            .with_context(|| format!("Invalid snapshot of build with promotion {promotion_id}"))?;
        Ok(Some(build))
    }

    /// Deletes finished builds last updated before `before`.
    pub async fn prune_finished_builds(&self, before: OffsetDateTime) -> Result<u64> {
        let result = sqlx::query("DELETE FROM builds WHERE finished = 1 AND updated_at < ?")
            .bind(to_millis(before))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
