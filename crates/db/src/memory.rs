use async_trait::async_trait;
use cluster_core::{ClusterEntity, EntityPatch, EntityState, Task};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DbError;
use crate::store::{EntityFilter, EntityStore, Page, PageRequest, TaskStore};

/// Process-local store implementing both [`EntityStore`] and [`TaskStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<String, ClusterEntity>>,
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entity_count(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entities.read().await.contains_key(id)
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<ClusterEntity, DbError> {
        self.entities
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::EntityNotFound(id.to_string()))
    }

    async fn create(
        &self,
        entity_type: &str,
        mut entity: ClusterEntity,
    ) -> Result<ClusterEntity, DbError> {
        let mut entities = self.entities.write().await;
        if entities.contains_key(&entity.id) {
            return Err(DbError::EntityExists(entity.id));
        }
        entity.entity_type = entity_type.to_string();
        entity.state = EntityState::PreCreated;
        entities.insert(entity.id.clone(), entity.clone());
        Ok(entity)
    }

    async fn update(&self, id: &str, patch: EntityPatch) -> Result<ClusterEntity, DbError> {
        let mut entities = self.entities.write().await;
        let entity = entities
            .get_mut(id)
            .ok_or_else(|| DbError::EntityNotFound(id.to_string()))?;
        patch.apply(entity);
        Ok(entity.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), DbError> {
        self.entities
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DbError::EntityNotFound(id.to_string()))
    }

    async fn resolve(&self, id: &str) -> Result<ClusterEntity, DbError> {
        let mut entities = self.entities.write().await;
        let entity = entities
            .get_mut(id)
            .ok_or_else(|| DbError::EntityNotFound(id.to_string()))?;
        entity.state = EntityState::Resolved;
        Ok(entity.clone())
    }

    async fn list_by_type(
        &self,
        entity_type: &str,
        filter: &EntityFilter,
        page: PageRequest,
    ) -> Result<Page<ClusterEntity>, DbError> {
        let entities = self.entities.read().await;
        let mut matching: Vec<&ClusterEntity> = entities
            .values()
            .filter(|e| e.entity_type == entity_type && filter.matches(e))
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
            .take(page.page_size as usize)
            .cloned()
            .collect();

        Ok(Page {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn save(&self, task: &Task) -> Result<(), DbError> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, DbError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn find_by_cluster(&self, cluster_id: &str) -> Result<Vec<Task>, DbError> {
        let tasks = self.tasks.read().await;
        let mut found: Vec<Task> = tasks
            .values()
            .filter(|t| t.cluster_id.as_deref() == Some(cluster_id))
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }
}
