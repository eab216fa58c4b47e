//! Postgres implementation of the store interface.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::store::{
    SectionUpsert, SessionRow, SigningKey, Store, StoreError, StoredSection, WorldMeta,
};

fn transient(err: sqlx::Error) -> StoreError {
    StoreError::Transient(err.to_string())
}

/// Store backed by the relational schema: `worlds`, `world_members`,
/// `world_bans`, `world_sessions`, `world_sections`, `world_players`, and
/// `signing_keys`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(transient)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_world(&self, id: &str) -> Result<Option<WorldMeta>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, owner, is_public, max_players, generator_version, registry_version \
             FROM worlds WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        Ok(row.map(|row| WorldMeta {
            id: row.get("id"),
            name: row.get("name"),
            owner: row.get("owner"),
            is_public: row.get("is_public"),
            max_players: row.get::<i32, _>("max_players") as u32,
            generator_version: row.get::<i32, _>("generator_version") as u32,
            registry_version: row.get::<i32, _>("registry_version") as u32,
        }))
    }

    async fn check_member(&self, world: &str, user: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM world_members WHERE world_id = $1 AND user_id = $2)",
        )
        .bind(world)
        .bind(user)
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.get::<bool, _>(0))
    }

    async fn check_ban(&self, world: &str, user: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM world_bans \
             WHERE world_id = $1 AND user_id = $2 \
               AND (expires_at IS NULL OR expires_at > now()))",
        )
        .bind(world)
        .bind(user)
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.get::<bool, _>(0))
    }

    async fn load_section(
        &self,
        world: &str,
        section: &str,
    ) -> Result<Option<StoredSection>, StoreError> {
        let row = sqlx::query(
            "SELECT version, blocks FROM world_sections \
             WHERE world_id = $1 AND section_id = $2",
        )
        .bind(world)
        .bind(section)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        Ok(row.map(|row| StoredSection {
            version: row.get("version"),
            blocks: row.get("blocks"),
        }))
    }

    async fn upsert_sections(
        &self,
        world: &str,
        batch: &[SectionUpsert],
    ) -> Result<(), StoreError> {
        // One transaction per batch: either every row lands or none do.
        let mut tx = self.pool.begin().await.map_err(transient)?;
        for item in batch {
            sqlx::query(
                "INSERT INTO world_sections (world_id, section_id, version, blocks, updated_at) \
                 VALUES ($1, $2, $3, $4, now()) \
                 ON CONFLICT (world_id, section_id) \
                 DO UPDATE SET version = EXCLUDED.version, blocks = EXCLUDED.blocks, \
                               updated_at = now()",
            )
            .bind(world)
            .bind(&item.section_id)
            .bind(item.version)
            .bind(&item.blocks)
            .execute(&mut *tx)
            .await
            .map_err(transient)?;
        }
        tx.commit().await.map_err(transient)
    }

    async fn get_session(&self, world: &str) -> Result<Option<SessionRow>, StoreError> {
        let row = sqlx::query(
            "SELECT instance, url, status, participant_count \
             FROM world_sessions WHERE world_id = $1",
        )
        .bind(world)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        Ok(row.map(|row| SessionRow {
            instance: row.get("instance"),
            url: row.get("url"),
            status: row.get("status"),
            participant_count: row.get::<i32, _>("participant_count") as u32,
        }))
    }

    async fn register_session(
        &self,
        world: &str,
        instance: &str,
        url: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO world_sessions \
               (world_id, instance, url, status, participant_count, last_heartbeat, started_at) \
             VALUES ($1, $2, $3, 'online', 0, now(), now()) \
             ON CONFLICT (world_id) \
             DO UPDATE SET instance = $2, url = $3, status = 'online', \
                           participant_count = 0, last_heartbeat = now(), started_at = now()",
        )
        .bind(world)
        .bind(instance)
        .bind(url)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn heartbeat(&self, world: &str, participant_count: u32) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE world_sessions SET last_heartbeat = now(), participant_count = $2 \
             WHERE world_id = $1 AND status = 'online'",
        )
        .bind(world)
        .bind(participant_count as i32)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn mark_sessions_offline(&self, instance: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE world_sessions SET status = 'offline' WHERE instance = $1")
            .bind(instance)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn record_join(&self, world: &str, user: &str, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO world_players (world_id, user_id, display_name, joined_at, last_seen) \
             VALUES ($1, $2, $3, now(), now()) \
             ON CONFLICT (world_id, user_id) \
             DO UPDATE SET display_name = $3, last_seen = now()",
        )
        .bind(world)
        .bind(user)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn record_leave(&self, world: &str, user: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE world_players SET last_seen = now() WHERE world_id = $1 AND user_id = $2",
        )
        .bind(world)
        .bind(user)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn display_name(&self, user: &str) -> Result<String, StoreError> {
        let row = sqlx::query(
            "SELECT display_name FROM world_players \
             WHERE user_id = $1 ORDER BY last_seen DESC LIMIT 1",
        )
        .bind(user)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        Ok(row
            .map(|row| row.get("display_name"))
            .unwrap_or_else(|| crate::store::derived_display_name(user)))
    }

    async fn key_set(&self) -> Result<Vec<SigningKey>, StoreError> {
        let rows = sqlx::query("SELECT kid, algorithm, key_data FROM signing_keys")
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;

        Ok(rows
            .into_iter()
            .map(|row| SigningKey {
                kid: row.get("kid"),
                algorithm: row.get("algorithm"),
                key_data: row.get("key_data"),
            })
            .collect())
    }
}
