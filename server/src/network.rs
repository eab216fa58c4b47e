//! Server shell: listener, shared context, periodic loops, and shutdown.

use futures_util::FutureExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::CredentialVerifier;
use crate::config::Config;
use crate::registry::{self, WorldRegistry};
use crate::session;
use crate::store::{SectionUpsert, Store};
use crate::streamer;
use crate::utils::{get_timestamp, RateWindow};
use crate::world::{WorldHandle, DEFAULT_WORLD_ID};
use shared::frames::CLOSE_GOING_AWAY;
use shared::{
    CONNECTIONS_PER_MINUTE, HEARTBEAT_INTERVAL, PERSIST_INTERVAL, STALE_TIMEOUT, TICK_INTERVAL,
};

/// Stale-participant scan period against the 60 s activity deadline.
const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server context handed to every connection task and loop.
pub struct Ctx {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub verifier: CredentialVerifier,
    pub registry: WorldRegistry,
    pub instance_id: String,
    /// Wakes the persistence loop for an early flush.
    pub flush_notify: Notify,
    ip_windows: StdMutex<HashMap<IpAddr, RateWindow>>,
}

impl Ctx {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Arc<Self> {
        let verifier = CredentialVerifier::new(
            store.clone(),
            config.service_key.clone(),
            config.display_name_auth,
        );
        Arc::new(Self {
            config,
            store,
            verifier,
            registry: WorldRegistry::new(),
            instance_id: Uuid::new_v4().to_string(),
            flush_notify: Notify::new(),
            ip_windows: StdMutex::new(HashMap::new()),
        })
    }

    /// Sliding-window connection gate per source IP.
    pub fn connection_rate_ok(&self, ip: IpAddr) -> bool {
        let mut windows = self.ip_windows.lock().unwrap();
        windows
            .entry(ip)
            .or_insert_with(|| RateWindow::new(CONNECTIONS_PER_MINUTE, Duration::from_secs(60)))
            .try_acquire()
    }
}

/// The session/world server.
pub struct Server {
    ctx: Arc<Ctx>,
}

impl Server {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        Self {
            ctx: Ctx::new(config, store),
        }
    }

    /// Accepts connections until ctrl-c, then shuts down gracefully.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let ctx = &self.ctx;

        // Clear session rows orphaned by a previous crash.
        if let Err(err) = ctx.store.mark_sessions_offline(&ctx.instance_id).await {
            warn!("could not clear stale session rows: {err}");
        }

        let listener = TcpListener::bind(&ctx.config.bind_addr).await?;
        info!(
            "listening on {} (instance {}, region {})",
            ctx.config.bind_addr, ctx.instance_id, ctx.config.region
        );

        let (shutdown_tx, _) = watch::channel(false);
        tokio::spawn(tick_loop(ctx.clone(), shutdown_tx.subscribe()));
        tokio::spawn(persistence_loop(ctx.clone(), shutdown_tx.subscribe()));
        tokio::spawn(heartbeat_loop(ctx.clone(), shutdown_tx.subscribe()));
        tokio::spawn(reaper_loop(ctx.clone(), shutdown_tx.subscribe()));

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("connection accepted from {addr}");
                        tokio::spawn(session::handle_connection(ctx.clone(), stream, addr));
                    }
                    Err(err) => error!("accept failed: {err}"),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.shutdown(shutdown_tx).await;
        Ok(())
    }

    /// Close connections, stop loops, flush, and release session rows.
    async fn shutdown(&self, shutdown_tx: watch::Sender<bool>) {
        let ctx = &self.ctx;
        for world in ctx.registry.active_worlds().await {
            let data = world.state.lock().await;
            for participant in data.participants.values() {
                let _ = participant.tx.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::from(CLOSE_GOING_AWAY),
                    reason: "server shutting down".into(),
                })));
            }
        }
        let _ = shutdown_tx.send(true);
        for world in ctx.registry.active_worlds().await {
            flush_world(ctx, &world).await;
        }
        if let Err(err) = ctx.store.mark_sessions_offline(&ctx.instance_id).await {
            warn!("could not mark session rows offline: {err}");
        }
        info!("shutdown complete");
    }
}

/// 20 Hz broadcaster: motion snapshots plus paced section delivery.
async fn tick_loop(ctx: Arc<Ctx>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(TICK_INTERVAL);
    let mut tick_count: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        tick_count += 1;
        // A panicking cycle must not take the broadcaster down.
        if AssertUnwindSafe(tick_once(&ctx, tick_count))
            .catch_unwind()
            .await
            .is_err()
        {
            error!("tick cycle panicked; continuing");
        }
    }
}

async fn tick_once(ctx: &Arc<Ctx>, tick_count: u64) {
    let timestamp = get_timestamp();
    let worlds = ctx.registry.active_worlds().await;
    let mut participant_total = 0usize;
    for world in &worlds {
        let pending = {
            let data = world.state.lock().await;
            if data.participants.is_empty() {
                continue;
            }
            participant_total += data.participants.len();
            let snapshot = data.snapshot(timestamp);
            data.broadcast(&snapshot, None);
            data.participants
                .iter()
                .filter(|(_, participant)| !participant.pending_sections.is_empty())
                .map(|(player_id, _)| player_id.clone())
                .collect::<Vec<_>>()
        };
        for player_id in pending {
            streamer::deliver_pending(ctx, world, &player_id, streamer::per_tick_quota()).await;
        }
    }
    // Periodic status line.
    if tick_count % 600 == 0 && !worlds.is_empty() {
        debug!(
            "tick {tick_count}: {} worlds, {} participants",
            worlds.len(),
            participant_total
        );
    }
}

/// Drains dirty sections once per period, or sooner on back-pressure.
async fn persistence_loop(ctx: Arc<Ctx>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(PERSIST_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = ctx.flush_notify.notified() => {}
            _ = shutdown.changed() => break,
        }
        for world in ctx.registry.active_worlds().await {
            flush_world(&ctx, &world).await;
            ctx.registry.remove_if_idle(&world.id).await;
        }
    }
}

/// Flushes a world's dirty sections in one batched upsert.
///
/// On failure every dirty flag stays set and the next cycle retries.
pub async fn flush_world(ctx: &Ctx, world: &WorldHandle) {
    if world.id == DEFAULT_WORLD_ID {
        return;
    }
    let batch = { world.state.lock().await.dirty_batch() };
    if batch.is_empty() {
        return;
    }

    let mut upserts = Vec::with_capacity(batch.len());
    let mut flushed = Vec::with_capacity(batch.len());
    for (pos, version, blocks) in batch {
        flushed.push((pos, version));
        upserts.push(SectionUpsert {
            section_id: pos.to_string(),
            version,
            blocks,
        });
    }
    match ctx.store.upsert_sections(&world.id, &upserts).await {
        Ok(()) => {
            world.state.lock().await.clear_flushed(&flushed);
            debug!("flushed {} sections for world {}", flushed.len(), world.id);
        }
        Err(err) => warn!(
            "section flush for world {} failed: {err} (dirty flags kept)",
            world.id
        ),
    }
}

/// Refreshes session rows with participant counts.
async fn heartbeat_loop(ctx: Arc<Ctx>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        for world in ctx.registry.active_worlds().await {
            if world.id == DEFAULT_WORLD_ID {
                continue;
            }
            let count = { world.state.lock().await.participants.len() as u32 };
            if let Err(err) = ctx.store.heartbeat(&world.id, count).await {
                warn!("heartbeat for world {} failed: {err}", world.id);
            }
        }
    }
}

/// Closes connections that have gone quiet past the stale deadline.
async fn reaper_loop(ctx: Arc<Ctx>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(REAP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        for world in ctx.registry.active_worlds().await {
            let stale: Vec<String> = {
                let data = world.state.lock().await;
                data.participants
                    .iter()
                    .filter(|(_, participant)| participant.last_activity.elapsed() > STALE_TIMEOUT)
                    .map(|(player_id, _)| player_id.clone())
                    .collect()
            };
            for player_id in stale {
                info!("reaping stale participant {player_id} in world {}", world.id);
                {
                    let data = world.state.lock().await;
                    if let Some(participant) = data.participants.get(&player_id) {
                        let _ = participant.tx.send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(CLOSE_GOING_AWAY),
                            reason: "idle timeout".into(),
                        })));
                    }
                }
                registry::depart(&ctx, &world, &player_id).await;
            }
        }
    }
}
