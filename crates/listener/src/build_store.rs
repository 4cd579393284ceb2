use std::{sync::Arc, time::Duration};

use anyhow::Result;
use commit_status_core::models::{BuildRef, PromotionId};
use commit_status_db::Database;
use futures_util::future::BoxFuture;
use time::OffsetDateTime;

/// Source of current build snapshots.
///
/// Tasks only carry a promotion id; the build is looked up again when a task runs
/// so publishers see its latest state. The task may run on any node, so the
/// snapshot must be visible to all of them.
pub trait BuildStore: Send + Sync {
    fn build(&self, promotion_id: PromotionId) -> BoxFuture<'_, Result<Option<BuildRef>>>;
}

/// Builds reported through hooks on any node, kept in the shared database.
#[derive(Clone)]
pub struct SharedBuildStore {
    db: Arc<Database>,
}

impl SharedBuildStore {
    pub fn new(db: Arc<Database>) -> Self { Self { db } }

    /// Inserts or replaces the snapshot of a build.
    pub async fn upsert(&self, build: &BuildRef) -> Result<()> { self.db.upsert_build(build).await }

    /// Forgets finished builds not updated within `older_than`.
    pub async fn prune_finished(&self, older_than: Duration) -> Result<u64> {
        let pruned = self.db.prune_finished_builds(OffsetDateTime::now_utc() - older_than).await?;
        if pruned > 0 {
            tracing::info!("Forgot {} finished builds", pruned);
        }
        Ok(pruned)
    }
}

impl BuildStore for SharedBuildStore {
    fn build(&self, promotion_id: PromotionId) -> BoxFuture<'_, Result<Option<BuildRef>>> {
        Box::pin(self.db.get_build(promotion_id))
    }
}

#[cfg(test)]
mod tests {
    use commit_status_core::models::BuildState;

    use super::*;
    use crate::test_utils::{self, build, root};

    #[tokio::test]
    async fn test_snapshot_is_visible_through_another_store() {
        let (_dir, db) = test_utils::open_database().await;
        let receiving = SharedBuildStore::new(db.clone());
        let executing = SharedBuildStore::new(db);

        receiving.upsert(&build(1, BuildState::Running, vec![root(1)])).await.unwrap();
        receiving.upsert(&build(1, BuildState::Finished, vec![root(1)])).await.unwrap();
        let seen = executing.build(PromotionId(1)).await.unwrap().unwrap();
        assert_eq!(seen.state, BuildState::Finished);
        assert_eq!(seen.roots, vec![root(1)]);
        assert!(executing.build(PromotionId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_unfinished_builds() {
        let (_dir, db) = test_utils::open_database().await;
        let store = SharedBuildStore::new(db);
        store.upsert(&build(1, BuildState::Running, vec![])).await.unwrap();
        store.upsert(&build(2, BuildState::Finished, vec![])).await.unwrap();

        assert_eq!(store.prune_finished(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.prune_finished(Duration::ZERO).await.unwrap(), 1);
        assert!(store.build(PromotionId(1)).await.unwrap().is_some());
        assert!(store.build(PromotionId(2)).await.unwrap().is_none());
    }
}
