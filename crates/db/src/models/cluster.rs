use chrono::{DateTime, TimeZone, Utc};
use cluster_core::ClusterEntity;

use crate::error::DbError;

/// Row of the `clusters` table. The full entity lives in `body` as JSON;
/// the other columns exist for filtering.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClusterRow {
    pub id: String,
    pub entity_type: String,
    pub name: String,
    pub org_name: String,
    pub vdc_name: String,
    pub state: String,
    pub external_id: Option<String>,
    pub body: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ClusterRow {
    pub fn from_domain(entity: &ClusterEntity) -> Result<Self, DbError> {
        Ok(Self {
            id: entity.id.clone(),
            entity_type: entity.entity_type.clone(),
            name: entity.name.clone(),
            org_name: entity.org_name.clone(),
            vdc_name: entity.vdc_name.clone(),
            state: entity.state.as_str().to_string(),
            external_id: entity.external_id.clone(),
            body: serde_json::to_string(entity)?,
            created_at: entity.created_at.timestamp_millis(),
            updated_at: entity.updated_at.timestamp_millis(),
        })
    }

    pub fn into_domain(self) -> Result<ClusterEntity, DbError> {
        let mut entity: ClusterEntity = serde_json::from_str(&self.body)?;
        if let Some(state) = cluster_core::EntityState::parse(&self.state) {
            entity.state = state;
        }
        entity.created_at = millis_to_datetime(self.created_at);
        entity.updated_at = millis_to_datetime(self.updated_at);
        Ok(entity)
    }
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
