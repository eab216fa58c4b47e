//! World registry and the admission pipeline.

use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::generator;
use crate::network::Ctx;
use crate::store::{derived_display_name, WorldMeta};
use crate::world::{send_frame, Participant, WorldHandle, DEFAULT_WORLD_ID};
use shared::frames::{ErrorCode, ServerFrame, Vec3};
use shared::{GENERATOR_VERSION, MAX_PARTICIPANTS, PROTOCOL_VERSION, REGISTRY_VERSION};

/// Fields of an inbound HELLO frame.
#[derive(Debug, Clone)]
pub struct HelloArgs {
    pub protocol_version: u32,
    pub registry_version: u32,
    pub generator_version: u32,
    pub jwt: Option<String>,
    pub world_id: String,
}

/// Result of processing a handshake.
pub enum HandshakeOutcome {
    /// Seated; the WELCOME has already been sent on this connection.
    Admitted(AdmissionInfo),
    /// Another live instance hosts this world.
    Redirected { url: String },
    /// Admission failed; fatal outcomes close the connection.
    Rejected {
        code: ErrorCode,
        message: String,
        fatal: bool,
    },
}

/// The admitted participant's world seat.
pub struct AdmissionInfo {
    pub world: Arc<WorldHandle>,
    pub player_id: String,
}

/// Process-wide map of active worlds.
pub struct WorldRegistry {
    worlds: RwLock<HashMap<String, Arc<WorldHandle>>>,
}

impl WorldRegistry {
    pub fn new() -> Self {
        Self {
            worlds: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<WorldHandle>> {
        self.worlds.read().await.get(id).cloned()
    }

    pub async fn active_worlds(&self) -> Vec<Arc<WorldHandle>> {
        self.worlds.read().await.values().cloned().collect()
    }

    /// Fetches or materializes a world; true when newly materialized.
    pub async fn get_or_create(&self, meta: WorldMeta) -> (Arc<WorldHandle>, bool) {
        let mut worlds = self.worlds.write().await;
        if let Some(world) = worlds.get(&meta.id) {
            return (world.clone(), false);
        }
        let world = WorldHandle::new(meta);
        worlds.insert(world.id.clone(), world.clone());
        info!("world {} materialized", world.id);
        (world, true)
    }

    /// Evicts a world once it has no participants and nothing left to flush.
    pub async fn remove_if_idle(&self, id: &str) -> bool {
        let mut worlds = self.worlds.write().await;
        let world = match worlds.get(id) {
            Some(world) => world,
            None => return false,
        };
        let idle = {
            let data = world.state.lock().await;
            data.participants.is_empty() && data.dirty_count() == 0
        };
        if idle {
            worlds.remove(id);
            info!("world {id} evicted");
        }
        idle
    }
}

impl Default for WorldRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn rejected(code: ErrorCode, message: impl Into<String>, fatal: bool) -> HandshakeOutcome {
    HandshakeOutcome::Rejected {
        code,
        message: message.into(),
        fatal,
    }
}

/// Spawn near the world center, nudged per seat so players don't stack.
fn spawn_position(seat: usize) -> Vec3 {
    let offset = (seat as f32 * 2.0) % 16.0;
    Vec3::new(2048.5 + offset, generator::SPAWN_Y, 2048.5)
}

/// Runs the admission pipeline for a handshake.
///
/// Version gates, credential verification, world lookup, ban and membership
/// checks, then capacity; on success the participant is seated, the WELCOME
/// goes out on `tx`, and PLAYER_JOIN reaches everyone else.
pub async fn admit(
    ctx: &Ctx,
    hello: HelloArgs,
    tx: &mpsc::UnboundedSender<Message>,
) -> HandshakeOutcome {
    if hello.protocol_version != PROTOCOL_VERSION {
        return rejected(
            ErrorCode::InvalidRequest,
            format!("protocol version {} not supported", hello.protocol_version),
            true,
        );
    }
    if hello.registry_version != REGISTRY_VERSION {
        return rejected(
            ErrorCode::RegistryMismatch,
            format!("registry version {} not supported", hello.registry_version),
            true,
        );
    }
    if hello.generator_version != GENERATOR_VERSION {
        return rejected(
            ErrorCode::GeneratorMismatch,
            format!("generator version {} not supported", hello.generator_version),
            true,
        );
    }

    let token = match hello.jwt.as_deref() {
        Some(token) => token,
        None => return rejected(ErrorCode::AuthFailed, "missing credential", true),
    };
    let verified = match ctx.verifier.verify(token).await {
        Ok(verified) => verified,
        Err(err) => return rejected(err.code(), err.to_string(), true),
    };
    let user_id = verified.user_id;

    let is_default = hello.world_id == DEFAULT_WORLD_ID;
    let meta = if is_default {
        // The one world that exists without the store.
        WorldMeta {
            id: DEFAULT_WORLD_ID.to_string(),
            name: "default world".to_string(),
            owner: None,
            is_public: true,
            max_players: MAX_PARTICIPANTS as u32,
            generator_version: GENERATOR_VERSION,
            registry_version: REGISTRY_VERSION,
        }
    } else {
        let meta = match ctx.store.get_world(&hello.world_id).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                return rejected(
                    ErrorCode::WorldNotFound,
                    format!("world {} does not exist", hello.world_id),
                    true,
                )
            }
            Err(err) => {
                warn!("world lookup failed for {}: {err}", hello.world_id);
                return rejected(ErrorCode::InvalidRequest, "store unavailable", true);
            }
        };
        if meta.registry_version != REGISTRY_VERSION {
            return rejected(
                ErrorCode::RegistryMismatch,
                "world registry version does not match this server",
                true,
            );
        }
        if meta.generator_version != GENERATOR_VERSION {
            return rejected(
                ErrorCode::GeneratorMismatch,
                "world generator version does not match this server",
                true,
            );
        }
        match ctx.store.check_ban(&hello.world_id, &user_id).await {
            Ok(true) => {
                return rejected(ErrorCode::PermissionDenied, "banned from this world", true)
            }
            Ok(false) => {}
            Err(err) => {
                warn!("ban lookup failed for {}: {err}", hello.world_id);
                return rejected(ErrorCode::InvalidRequest, "store unavailable", true);
            }
        }
        if !meta.is_public && meta.owner.as_deref() != Some(user_id.as_str()) {
            match ctx.store.check_member(&hello.world_id, &user_id).await {
                Ok(true) => {}
                Ok(false) => {
                    return rejected(ErrorCode::PermissionDenied, "this world is private", true)
                }
                Err(err) => {
                    warn!("membership lookup failed for {}: {err}", hello.world_id);
                    return rejected(ErrorCode::InvalidRequest, "store unavailable", true);
                }
            }
        }
        meta
    };

    // A live session row held by another instance wins the world.
    if !is_default && ctx.registry.get(&hello.world_id).await.is_none() {
        if let Ok(Some(session)) = ctx.store.get_session(&hello.world_id).await {
            if session.status == "online"
                && session.instance != ctx.instance_id
                && !session.url.is_empty()
            {
                return HandshakeOutcome::Redirected { url: session.url };
            }
        }
    }

    let display_name = match verified.display_name {
        Some(name) => name,
        None if is_default => derived_display_name(&user_id),
        None => ctx
            .store
            .display_name(&user_id)
            .await
            .unwrap_or_else(|_| derived_display_name(&user_id)),
    };

    let (world, created) = ctx.registry.get_or_create(meta).await;
    if created && !is_default {
        if let Err(err) = ctx
            .store
            .register_session(&world.id, &ctx.instance_id, &ctx.config.public_url)
            .await
        {
            warn!("session registration failed for world {}: {err}", world.id);
        }
    }

    // Seat the participant and announce, all under one critical section.
    {
        let mut data = world.state.lock().await;
        if data.participants.contains_key(&user_id) {
            return rejected(
                ErrorCode::InvalidRequest,
                "already connected to this world",
                true,
            );
        }
        let cap = (data.meta.max_players as usize).min(MAX_PARTICIPANTS);
        if data.participants.len() >= cap {
            return rejected(ErrorCode::WorldFull, "world is full", false);
        }

        let spawn = spawn_position(data.participants.len());
        let existing = data.player_states();
        let participant = Participant::new(
            user_id.clone(),
            display_name.clone(),
            spawn,
            tx.clone(),
        );
        let join = ServerFrame::PlayerJoin {
            protocol_version: PROTOCOL_VERSION,
            player: participant.state(),
        };
        data.participants.insert(user_id.clone(), participant);
        data.broadcast(&join, Some(user_id.as_str()));

        let welcome = ServerFrame::Welcome {
            protocol_version: PROTOCOL_VERSION,
            player_id: user_id.clone(),
            display_name: display_name.clone(),
            world_id: world.id.clone(),
            spawn_position: spawn,
            players: existing,
        };
        send_frame(tx, &welcome);
    }

    if !is_default {
        if let Err(err) = ctx.store.record_join(&world.id, &user_id, &display_name).await {
            warn!("presence update failed for {user_id}: {err}");
        }
    }

    info!("player {} joined world {}", user_id, world.id);
    HandshakeOutcome::Admitted(AdmissionInfo {
        world,
        player_id: user_id,
    })
}

/// Disconnect path: removes the participant, announces the leave, updates
/// presence, and flushes the world when its last seat empties.
///
/// Idempotent; the reaper and the connection task may both arrive here.
pub async fn depart(ctx: &Ctx, world: &Arc<WorldHandle>, player_id: &str) {
    let (removed, now_empty) = {
        let mut data = world.state.lock().await;
        let removed = data.remove_participant(player_id).is_some();
        if removed {
            let leave = ServerFrame::PlayerLeave {
                protocol_version: PROTOCOL_VERSION,
                player_id: player_id.to_string(),
            };
            data.broadcast(&leave, None);
        }
        (removed, data.participants.is_empty())
    };
    if !removed {
        return;
    }

    info!("player {} left world {}", player_id, world.id);
    if world.id != DEFAULT_WORLD_ID {
        if let Err(err) = ctx.store.record_leave(&world.id, player_id).await {
            warn!("presence update failed for {player_id}: {err}");
        }
    }
    if now_empty {
        crate::network::flush_world(ctx, world).await;
        ctx.registry.remove_if_idle(&world.id).await;
    }
}
