//! Process-wide view of the catalog used by readers.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::catalog::CatalogStore;
use crate::error::SyncError;
use crate::index::ProductIndex;

/// One complete, immutable catalog generation.
#[derive(Debug)]
pub struct CatalogSnapshot {
    pub index: ProductIndex,
    pub loaded_at: DateTime<Utc>,
    /// Job whose completion produced this generation; `None` when loaded on demand.
    pub job_id: Option<Uuid>,
}

/// Empty at startup, filled on first read or first completed sync, swapped whole after
/// every completed sync. Readers keep their `Arc` for as long as they need a consistent view.
#[derive(Debug, Default)]
pub struct CatalogState {
    current: ArcSwapOption<CatalogSnapshot>,
}

impl CatalogState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peek(&self) -> Option<Arc<CatalogSnapshot>> {
        self.current.load_full()
    }

    /// Current generation, loading it from the store if none has been published yet.
    pub async fn get(&self, store: &CatalogStore) -> Result<Arc<CatalogSnapshot>, SyncError> {
        if let Some(snapshot) = self.current.load_full() {
            return Ok(snapshot);
        }
        let products = store.load_products().await?;
        let snapshot = Arc::new(CatalogSnapshot {
            index: ProductIndex::build(products),
            loaded_at: Utc::now(),
            job_id: None,
        });
        debug!(products = snapshot.index.len(), "catalog state loaded on demand");
        // A concurrent publish wins over an on-demand load.
        let previous = self
            .current
            .compare_and_swap(&None::<Arc<CatalogSnapshot>>, Some(Arc::clone(&snapshot)));
        Ok(match &*previous {
            Some(existing) => Arc::clone(existing),
            None => snapshot,
        })
    }

    pub fn publish(&self, index: ProductIndex, job_id: Uuid) -> Arc<CatalogSnapshot> {
        let snapshot = Arc::new(CatalogSnapshot {
            index,
            loaded_at: Utc::now(),
            job_id: Some(job_id),
        });
        self.current.store(Some(Arc::clone(&snapshot)));
        debug!(%job_id, products = snapshot.index.len(), "catalog state published");
        snapshot
    }

    pub fn invalidate(&self) {
        self.current.store(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcf_core::{Attributes, Category, Product, ProductId, ProductRecord};

    #[test]
    fn publish_replaces_whole_generation() {
        let state = CatalogState::new();
        assert!(state.peek().is_none());

        let job = Uuid::new_v4();
        let index = ProductIndex::build(vec![Product::from_record(ProductRecord::new(
            ProductId::new("A").unwrap(),
            Category::Walls,
            Attributes::new(),
        ))]);
        let held = state.publish(index, job);
        state.publish(ProductIndex::default(), Uuid::new_v4());

        assert_eq!(held.index.len(), 1);
        assert_eq!(held.job_id, Some(job));
        assert!(state.peek().unwrap().index.is_empty());

        state.invalidate();
        assert!(state.peek().is_none());
    }
}
