use async_trait::async_trait;
use cluster_core::{ClusterEntity, EntityPatch, EntityState};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbError;
use crate::models::ClusterRow;
use crate::store::{EntityFilter, EntityStore, Page, PageRequest};

const SELECT_COLUMNS: &str =
    "id, entity_type, name, org_name, vdc_name, state, external_id, body, created_at, updated_at";

#[derive(Clone)]
pub struct ClusterRepository {
    pool: SqlitePool,
}

impl ClusterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn find_row(&self, id: &str) -> Result<Option<ClusterRow>, DbError> {
        let row: Option<ClusterRow> = sqlx::query_as(&format!(
            "SELECT {} FROM clusters WHERE id = ?",
            SELECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn write(&self, entity: &ClusterEntity) -> Result<(), DbError> {
        let row = ClusterRow::from_domain(entity)?;

        sqlx::query(
            r#"
            UPDATE clusters
            SET state = ?, external_id = ?, body = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&row.state)
        .bind(&row.external_id)
        .bind(&row.body)
        .bind(row.updated_at)
        .bind(&row.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl EntityStore for ClusterRepository {
    async fn get(&self, id: &str) -> Result<ClusterEntity, DbError> {
        self.find_row(id)
            .await?
            .ok_or_else(|| DbError::EntityNotFound(id.to_string()))?
            .into_domain()
    }

    async fn create(
        &self,
        entity_type: &str,
        mut entity: ClusterEntity,
    ) -> Result<ClusterEntity, DbError> {
        if self.find_row(&entity.id).await?.is_some() {
            return Err(DbError::EntityExists(entity.id));
        }
        entity.entity_type = entity_type.to_string();
        entity.state = EntityState::PreCreated;
        let row = ClusterRow::from_domain(&entity)?;

        sqlx::query(
            r#"
            INSERT INTO clusters (id, entity_type, name, org_name, vdc_name, state, external_id, body, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.entity_type)
        .bind(&row.name)
        .bind(&row.org_name)
        .bind(&row.vdc_name)
        .bind(&row.state)
        .bind(&row.external_id)
        .bind(&row.body)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(cluster_id = %entity.id, name = %entity.name, "Cluster entity created");
        Ok(entity)
    }

    async fn update(&self, id: &str, patch: EntityPatch) -> Result<ClusterEntity, DbError> {
        let mut entity = self.get(id).await?;
        patch.apply(&mut entity);
        self.write(&entity).await?;
        Ok(entity)
    }

    async fn delete(&self, id: &str) -> Result<(), DbError> {
        let result = sqlx::query("DELETE FROM clusters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::EntityNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn resolve(&self, id: &str) -> Result<ClusterEntity, DbError> {
        let mut entity = self.get(id).await?;
        entity.state = EntityState::Resolved;
        self.write(&entity).await?;
        Ok(entity)
    }

    async fn list_by_type(
        &self,
        entity_type: &str,
        filter: &EntityFilter,
        page: PageRequest,
    ) -> Result<Page<ClusterEntity>, DbError> {
        let name = filter.name.as_deref();
        let org_name = filter.org_name.as_deref();
        let vdc_name = filter.vdc_name.as_deref();

        let total: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM clusters
            WHERE entity_type = ?
              AND (? IS NULL OR name = ?)
              AND (? IS NULL OR org_name = ?)
              AND (? IS NULL OR vdc_name = ?)
            "#,
        )
        .bind(entity_type)
        .bind(name)
        .bind(name)
        .bind(org_name)
        .bind(org_name)
        .bind(vdc_name)
        .bind(vdc_name)
        .fetch_one(&self.pool)
        .await?;

        let limit = i64::from(page.page_size);
        let offset = i64::try_from(page.offset()).unwrap_or(i64::MAX);

        let rows: Vec<ClusterRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM clusters
            WHERE entity_type = ?
              AND (? IS NULL OR name = ?)
              AND (? IS NULL OR org_name = ?)
              AND (? IS NULL OR vdc_name = ?)
            ORDER BY created_at ASC, name ASC
            LIMIT ? OFFSET ?
            "#,
            SELECT_COLUMNS
        ))
        .bind(entity_type)
        .bind(name)
        .bind(name)
        .bind(org_name)
        .bind(org_name)
        .bind(vdc_name)
        .bind(vdc_name)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(ClusterRow::into_domain)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total: u64::try_from(total.0).unwrap_or_default(),
            page: page.page,
            page_size: page.page_size,
        })
    }
}
