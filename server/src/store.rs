//! Typed interface over the durable store.
//!
//! The server only talks to its backend through the [`Store`] trait: world
//! metadata, membership and bans, section blobs, the session registry,
//! player presence, and the signing-key set. [`crate::pg_store::PgStore`] is
//! the production implementation; [`MemStore`] backs tests and store-less
//! development runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

/// Errors surfaced by store operations.
///
/// Transient failures are retried by the caller's own policy: persistence
/// leaves dirty flags set, presence updates are logged and dropped, and
/// handshake-path failures are fatal to that connection only.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Transient(String),
    #[error("corrupt store row: {0}")]
    Corrupt(String),
}

/// Durable world metadata.
#[derive(Debug, Clone)]
pub struct WorldMeta {
    pub id: String,
    pub name: String,
    pub owner: Option<String>,
    pub is_public: bool,
    pub max_players: u32,
    pub generator_version: u32,
    pub registry_version: u32,
}

/// A section blob as persisted: raw 8192 bytes plus its version.
#[derive(Debug, Clone)]
pub struct StoredSection {
    pub version: i64,
    pub blocks: Vec<u8>,
}

/// One row of a batched section flush.
#[derive(Debug, Clone)]
pub struct SectionUpsert {
    pub section_id: String,
    pub version: i64,
    pub blocks: Vec<u8>,
}

/// The session-registry row for a world.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub instance: String,
    pub url: String,
    pub status: String,
    pub participant_count: u32,
}

/// One entry of the credential signing-key set.
#[derive(Debug, Clone)]
pub struct SigningKey {
    pub kid: Option<String>,
    pub algorithm: String,
    pub key_data: String,
}

/// Capability set required of the durable backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns world metadata, or `None` when the world does not exist.
    async fn get_world(&self, id: &str) -> Result<Option<WorldMeta>, StoreError>;

    /// True when the user is a member of the world.
    async fn check_member(&self, world: &str, user: &str) -> Result<bool, StoreError>;

    /// True when the user is banned; expired bans report false.
    async fn check_ban(&self, world: &str, user: &str) -> Result<bool, StoreError>;

    /// Loads one persisted section blob, or `None` when never persisted.
    async fn load_section(
        &self,
        world: &str,
        section: &str,
    ) -> Result<Option<StoredSection>, StoreError>;

    /// Upserts a batch of sections atomically; versions replace on conflict.
    async fn upsert_sections(
        &self,
        world: &str,
        batch: &[SectionUpsert],
    ) -> Result<(), StoreError>;

    /// Returns the session row for a world, if any.
    async fn get_session(&self, world: &str) -> Result<Option<SessionRow>, StoreError>;

    /// Upserts the session row: status online, zero participants, started now.
    async fn register_session(
        &self,
        world: &str,
        instance: &str,
        url: &str,
    ) -> Result<(), StoreError>;

    /// Refreshes the session heartbeat and participant count.
    async fn heartbeat(&self, world: &str, participant_count: u32) -> Result<(), StoreError>;

    /// Marks every session row owned by this instance offline.
    async fn mark_sessions_offline(&self, instance: &str) -> Result<(), StoreError>;

    /// Records a player joining a world; failures are non-fatal.
    async fn record_join(&self, world: &str, user: &str, name: &str) -> Result<(), StoreError>;

    /// Records a player leaving a world; failures are non-fatal.
    async fn record_leave(&self, world: &str, user: &str) -> Result<(), StoreError>;

    /// Best-available display name for a user.
    async fn display_name(&self, user: &str) -> Result<String, StoreError>;

    /// Current credential signing-key set.
    async fn key_set(&self) -> Result<Vec<SigningKey>, StoreError>;
}

/// Fallback display name derived from a user id.
pub fn derived_display_name(user: &str) -> String {
    let prefix: String = user.chars().take(8).collect();
    format!("player-{prefix}")
}

#[derive(Default)]
struct MemInner {
    worlds: HashMap<String, WorldMeta>,
    members: HashSet<(String, String)>,
    bans: HashMap<(String, String), Option<DateTime<Utc>>>,
    sections: HashMap<(String, String), StoredSection>,
    sessions: HashMap<String, SessionRow>,
    presence: HashMap<(String, String), String>,
    names: HashMap<String, String>,
    keys: Vec<SigningKey>,
}

/// In-memory [`Store`] used by tests and store-less development runs.
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemInner::default()),
        }
    }

    pub fn insert_world(&self, meta: WorldMeta) {
        let mut inner = self.inner.lock().unwrap();
        inner.worlds.insert(meta.id.clone(), meta);
    }

    pub fn add_member(&self, world: &str, user: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.members.insert((world.to_string(), user.to_string()));
    }

    pub fn add_ban(&self, world: &str, user: &str, expires_at: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .bans
            .insert((world.to_string(), user.to_string()), expires_at);
    }

    pub fn set_keys(&self, keys: Vec<SigningKey>) {
        self.inner.lock().unwrap().keys = keys;
    }

    pub fn set_display_name(&self, user: &str, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.names.insert(user.to_string(), name.to_string());
    }

    /// Test observer: the persisted blob for one section.
    pub fn section(&self, world: &str, section: &str) -> Option<StoredSection> {
        let inner = self.inner.lock().unwrap();
        inner
            .sections
            .get(&(world.to_string(), section.to_string()))
            .cloned()
    }

    /// Test observer: the session row for one world.
    pub fn session(&self, world: &str) -> Option<SessionRow> {
        self.inner.lock().unwrap().sessions.get(world).cloned()
    }

    /// Test observer: recorded presence name for a (world, user) pair.
    pub fn presence(&self, world: &str, user: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .presence
            .get(&(world.to_string(), user.to_string()))
            .cloned()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_world(&self, id: &str) -> Result<Option<WorldMeta>, StoreError> {
        Ok(self.inner.lock().unwrap().worlds.get(id).cloned())
    }

    async fn check_member(&self, world: &str, user: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .members
            .contains(&(world.to_string(), user.to_string())))
    }

    async fn check_ban(&self, world: &str, user: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().unwrap();
        match inner.bans.get(&(world.to_string(), user.to_string())) {
            Some(None) => Ok(true),
            Some(Some(expires_at)) => Ok(*expires_at > Utc::now()),
            None => Ok(false),
        }
    }

    async fn load_section(
        &self,
        world: &str,
        section: &str,
    ) -> Result<Option<StoredSection>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sections
            .get(&(world.to_string(), section.to_string()))
            .cloned())
    }

    async fn upsert_sections(
        &self,
        world: &str,
        batch: &[SectionUpsert],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for item in batch {
            inner.sections.insert(
                (world.to_string(), item.section_id.clone()),
                StoredSection {
                    version: item.version,
                    blocks: item.blocks.clone(),
                },
            );
        }
        Ok(())
    }

    async fn get_session(&self, world: &str) -> Result<Option<SessionRow>, StoreError> {
        Ok(self.inner.lock().unwrap().sessions.get(world).cloned())
    }

    async fn register_session(
        &self,
        world: &str,
        instance: &str,
        url: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(
            world.to_string(),
            SessionRow {
                instance: instance.to_string(),
                url: url.to_string(),
                status: "online".to_string(),
                participant_count: 0,
            },
        );
        Ok(())
    }

    async fn heartbeat(&self, world: &str, participant_count: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner.sessions.get_mut(world) {
            row.participant_count = participant_count;
        }
        Ok(())
    }

    async fn mark_sessions_offline(&self, instance: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for row in inner.sessions.values_mut() {
            if row.instance == instance {
                row.status = "offline".to_string();
            }
        }
        Ok(())
    }

    async fn record_join(&self, world: &str, user: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .presence
            .insert((world.to_string(), user.to_string()), name.to_string());
        Ok(())
    }

    async fn record_leave(&self, _world: &str, _user: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn display_name(&self, user: &str) -> Result<String, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .names
            .get(user)
            .cloned()
            .unwrap_or_else(|| derived_display_name(user)))
    }

    async fn key_set(&self) -> Result<Vec<SigningKey>, StoreError> {
        Ok(self.inner.lock().unwrap().keys.clone())
    }
}
