//! Identifier mapping table
//!
//! Records which local identifiers have been replaced by server-assigned
//! ones. Used only to rewrite outbox entries and ping uploads that still
//! carry a stale local id. A lookup miss is not an error: it means the id
//! is already current.

use super::models::{EntityKind, IdMapping};
use crate::error::Result;
use sqlx::{SqliteConnection, SqlitePool};

#[derive(Clone)]
pub struct IdMappings {
    pool: SqlitePool,
}

impl IdMappings {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record `local_id -> server_id`. Idempotent upsert.
    pub async fn save(&self, entity: EntityKind, local_id: &str, server_id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        save_with(&mut conn, entity, local_id, server_id).await
    }

    /// Server id for a local id, if it has ever been remapped
    pub async fn resolve(&self, local_id: &str) -> Result<Option<String>> {
        let server_id: Option<String> =
            sqlx::query_scalar("SELECT server_id FROM id_mappings WHERE local_id = ? LIMIT 1")
                .bind(local_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(server_id)
    }

    /// The current form of `id`: its server id if remapped, otherwise itself
    pub async fn current(&self, id: &str) -> Result<String> {
        Ok(self.resolve(id).await?.unwrap_or_else(|| id.to_string()))
    }

    pub async fn get(&self, local_id: &str) -> Result<Option<IdMapping>> {
        let mapping = sqlx::query_as::<_, IdMapping>(
            "SELECT local_id, server_id, entity FROM id_mappings WHERE local_id = ?",
        )
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(mapping)
    }
}

/// Upsert a mapping on an existing connection or transaction
pub(crate) async fn save_with(
    conn: &mut SqliteConnection,
    entity: EntityKind,
    local_id: &str,
    server_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO id_mappings (local_id, server_id, entity) VALUES (?, ?, ?)
        ON CONFLICT(local_id) DO UPDATE SET server_id = excluded.server_id, entity = excluded.entity
        "#,
    )
    .bind(local_id)
    .bind(server_id)
    .bind(entity)
    .execute(&mut *conn)
    .await?;

    tracing::debug!("Mapped {} {} -> {}", entity, local_id, server_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_pool;

    #[tokio::test]
    async fn test_resolve_miss_is_none() {
        let ids = IdMappings::new(memory_pool().await);

        assert_eq!(ids.resolve("never-mapped").await.unwrap(), None);
        assert_eq!(ids.current("never-mapped").await.unwrap(), "never-mapped");
    }

    #[tokio::test]
    async fn test_save_is_idempotent_upsert() {
        let ids = IdMappings::new(memory_pool().await);

        ids.save(EntityKind::Shift, "L1", "server-1").await.unwrap();
        ids.save(EntityKind::Shift, "L1", "server-1").await.unwrap();
        assert_eq!(ids.resolve("L1").await.unwrap().as_deref(), Some("server-1"));

        ids.save(EntityKind::Shift, "L1", "server-2").await.unwrap();
        let mapping = ids.get("L1").await.unwrap().unwrap();
        assert_eq!(mapping.server_id, "server-2");
        assert_eq!(mapping.entity, EntityKind::Shift);
    }
}
