//! Storage seams consumed by the orchestrator.

use async_trait::async_trait;
use cluster_core::{ClusterEntity, EntityPatch, Task};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DbError;

pub const DEFAULT_PAGE_SIZE: u32 = 25;

/// Optional equality filters for listing clusters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFilter {
    pub name: Option<String>,
    pub org_name: Option<String>,
    pub vdc_name: Option<String>,
}

impl EntityFilter {
    pub fn by_name(
        name: impl Into<String>,
        org_name: impl Into<String>,
        vdc_name: impl Into<String>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            org_name: Some(org_name.into()),
            vdc_name: Some(vdc_name.into()),
        }
    }

    pub fn matches(&self, entity: &ClusterEntity) -> bool {
        self.name.as_ref().map_or(true, |n| n == &entity.name)
            && self.org_name.as_ref().map_or(true, |o| o == &entity.org_name)
            && self.vdc_name.as_ref().map_or(true, |v| v == &entity.vdc_name)
    }
}

/// 1-based page selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn all() -> Self {
        Self::new(1, u32::MAX)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn page_count(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.total.div_ceil(u64::from(self.page_size))
        }
    }
}

/// Durable store of cluster records.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fails with [`DbError::EntityNotFound`] for an unknown id.
    async fn get(&self, id: &str) -> Result<ClusterEntity, DbError>;

    /// Persist a new record in the `PreCreated` state.
    async fn create(&self, entity_type: &str, entity: ClusterEntity)
        -> Result<ClusterEntity, DbError>;

    async fn update(&self, id: &str, patch: EntityPatch) -> Result<ClusterEntity, DbError>;

    async fn delete(&self, id: &str) -> Result<(), DbError>;

    /// Move a pre-created record to the `Resolved` state.
    async fn resolve(&self, id: &str) -> Result<ClusterEntity, DbError>;

    async fn list_by_type(
        &self,
        entity_type: &str,
        filter: &EntityFilter,
        page: PageRequest,
    ) -> Result<Page<ClusterEntity>, DbError>;
}

/// Persistence for task progress records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace.
    async fn save(&self, task: &Task) -> Result<(), DbError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, DbError>;

    async fn find_by_cluster(&self, cluster_id: &str) -> Result<Vec<Task>, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_offset() {
        assert_eq!(PageRequest::new(1, 25).offset(), 0);
        assert_eq!(PageRequest::new(3, 10).offset(), 20);
        assert_eq!(PageRequest::new(0, 0), PageRequest::new(1, 1));
    }

    #[test]
    fn test_page_count() {
        let page: Page<u8> = Page {
            items: vec![],
            total: 51,
            page: 1,
            page_size: 25,
        };
        assert_eq!(page.page_count(), 3);

        let empty: Page<u8> = Page {
            items: vec![],
            total: 0,
            page: 1,
            page_size: 25,
        };
        assert_eq!(empty.page_count(), 0);
    }
}
