//! Per-world in-memory state.
//!
//! A world owns its loaded sections, its participants, the subscription
//! index, and the edit-response cache. All of it sits behind the world's
//! `state` mutex; critical sections stay short and never span store I/O.
//! A separate `edit_gate` mutex serializes the edit pipeline per world.

use log::warn;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

use crate::generator;
use crate::store::{Store, StoreError, WorldMeta};
use crate::utils::RateWindow;
use shared::blocks::{blocks_to_bytes, bytes_to_blocks};
use shared::coords::SectionPos;
use shared::frames::{PlayerState, ServerFrame, Vec3};
use shared::{EDITS_PER_SECOND, PROTOCOL_VERSION, REQUEST_ID_TTL, SUBSCRIBES_PER_SECOND};

/// The one world that exists without the store: always public, never
/// persisted.
pub const DEFAULT_WORLD_ID: &str = "default-world";

/// One loaded 16×16×16 section.
pub struct Section {
    pub blocks: Vec<u16>,
    /// Monotonic: 0 for untouched baseline, bumped by every accepted edit.
    pub version: i64,
    pub dirty: bool,
    pub from_store: bool,
    pub last_access: Instant,
}

impl Section {
    /// A section freshly computed by the generator.
    pub fn baseline_for(pos: SectionPos) -> Self {
        Self {
            blocks: generator::baseline(pos),
            version: 0,
            dirty: false,
            from_store: false,
            last_access: Instant::now(),
        }
    }

    /// A section reloaded from the store.
    pub fn restored(blocks: Vec<u16>, version: i64) -> Self {
        Self {
            blocks,
            version,
            dirty: false,
            from_store: true,
            last_access: Instant::now(),
        }
    }

    /// True while the section is pure generator output.
    pub fn is_baseline(&self) -> bool {
        self.version == 0
    }
}

/// A connected, admitted user holding a seat in a world.
pub struct Participant {
    pub player_id: String,
    pub display_name: String,
    pub position: Vec3,
    pub velocity: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub last_input_sequence: u32,
    pub last_activity: Instant,
    pub subscribed: HashSet<SectionPos>,
    pub pending_sections: VecDeque<SectionPos>,
    pub edit_window: RateWindow,
    pub subscribe_window: RateWindow,
    /// Handle to the connection's writer task.
    pub tx: mpsc::UnboundedSender<Message>,
}

impl Participant {
    pub fn new(
        player_id: String,
        display_name: String,
        position: Vec3,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            player_id,
            display_name,
            position,
            velocity: Vec3::zero(),
            yaw: 0.0,
            pitch: 0.0,
            last_input_sequence: 0,
            last_activity: Instant::now(),
            subscribed: HashSet::new(),
            pending_sections: VecDeque::new(),
            edit_window: RateWindow::new(EDITS_PER_SECOND, Duration::from_secs(1)),
            subscribe_window: RateWindow::new(SUBSCRIBES_PER_SECOND, Duration::from_secs(1)),
            tx,
        }
    }

    /// Motion state as carried in snapshots and join frames.
    pub fn state(&self) -> PlayerState {
        PlayerState {
            player_id: self.player_id.clone(),
            display_name: self.display_name.clone(),
            position: self.position,
            velocity: self.velocity,
            yaw: self.yaw,
            pitch: self.pitch,
            last_input_sequence: self.last_input_sequence,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

struct CachedResponse {
    frame: ServerFrame,
    inserted: Instant,
}

/// Mutable world state guarded by [`WorldHandle::state`].
pub struct WorldData {
    pub meta: WorldMeta,
    pub sections: HashMap<SectionPos, Section>,
    pub participants: HashMap<String, Participant>,
    /// Section id → participants subscribed to it. Kept in lockstep with
    /// every participant's own subscribed set.
    pub subscribers: HashMap<SectionPos, HashSet<String>>,
    edit_cache: HashMap<String, CachedResponse>,
}

impl WorldData {
    pub fn new(meta: WorldMeta) -> Self {
        Self {
            meta,
            sections: HashMap::new(),
            participants: HashMap::new(),
            subscribers: HashMap::new(),
            edit_cache: HashMap::new(),
        }
    }

    pub fn player_states(&self) -> Vec<PlayerState> {
        self.participants.values().map(Participant::state).collect()
    }

    /// Motion snapshot of every participant.
    pub fn snapshot(&self, timestamp: u64) -> ServerFrame {
        ServerFrame::Snapshot {
            protocol_version: PROTOCOL_VERSION,
            timestamp,
            players: self.player_states(),
        }
    }

    /// Adds a subscription, returning false when it already existed.
    ///
    /// The participant's set, its pending queue, and the world index are
    /// updated together so the two views never disagree.
    pub fn subscribe(&mut self, player_id: &str, pos: SectionPos) -> bool {
        let participant = match self.participants.get_mut(player_id) {
            Some(participant) => participant,
            None => return false,
        };
        if !participant.subscribed.insert(pos) {
            return false;
        }
        participant.pending_sections.push_back(pos);
        self.subscribers
            .entry(pos)
            .or_default()
            .insert(player_id.to_string());
        true
    }

    /// Drops a subscription from both the participant set and the index.
    pub fn unsubscribe(&mut self, player_id: &str, pos: SectionPos) {
        if let Some(participant) = self.participants.get_mut(player_id) {
            participant.subscribed.remove(&pos);
            participant.pending_sections.retain(|pending| *pending != pos);
        }
        if let Some(set) = self.subscribers.get_mut(&pos) {
            set.remove(player_id);
            if set.is_empty() {
                self.subscribers.remove(&pos);
            }
        }
    }

    /// Removes a participant and clears every trace of it from the index.
    pub fn remove_participant(&mut self, player_id: &str) -> Option<Participant> {
        let participant = self.participants.remove(player_id)?;
        for pos in &participant.subscribed {
            if let Some(set) = self.subscribers.get_mut(pos) {
                set.remove(player_id);
                if set.is_empty() {
                    self.subscribers.remove(pos);
                }
            }
        }
        Some(participant)
    }

    /// Replayable response for a request id, if still cached.
    pub fn cached_response(&self, request_id: &str) -> Option<ServerFrame> {
        self.edit_cache
            .get(request_id)
            .map(|cached| cached.frame.clone())
    }

    /// Caches an edit response, lazily evicting entries past their TTL.
    pub fn cache_response(&mut self, request_id: &str, frame: ServerFrame) {
        self.edit_cache
            .retain(|_, cached| cached.inserted.elapsed() <= REQUEST_ID_TTL);
        self.edit_cache.insert(
            request_id.to_string(),
            CachedResponse {
                frame,
                inserted: Instant::now(),
            },
        );
    }

    /// Serializes a frame once and sends it to every participant, optionally
    /// excluding one of them.
    pub fn broadcast(&self, frame: &ServerFrame, exclude: Option<&str>) {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to serialize broadcast frame: {err}");
                return;
            }
        };
        for (player_id, participant) in &self.participants {
            if Some(player_id.as_str()) == exclude {
                continue;
            }
            let _ = participant.tx.send(Message::Text(text.clone()));
        }
    }

    /// Sends a frame to every participant subscribed to a section.
    pub fn broadcast_to_subscribers(&self, pos: SectionPos, frame: &ServerFrame) {
        let subscribers = match self.subscribers.get(&pos) {
            Some(subscribers) => subscribers,
            None => return,
        };
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to serialize section broadcast: {err}");
                return;
            }
        };
        for player_id in subscribers {
            if let Some(participant) = self.participants.get(player_id) {
                let _ = participant.tx.send(Message::Text(text.clone()));
            }
        }
    }

    /// Sends a frame to one participant.
    pub fn send_to(&self, player_id: &str, frame: &ServerFrame) {
        if let Some(participant) = self.participants.get(player_id) {
            send_frame(&participant.tx, frame);
        }
    }

    /// Serialized rows for every dirty section. Flags stay set until
    /// [`WorldData::clear_flushed`] confirms the write.
    pub fn dirty_batch(&self) -> Vec<(SectionPos, i64, Vec<u8>)> {
        let mut batch = Vec::new();
        for (pos, section) in &self.sections {
            if !section.dirty {
                continue;
            }
            match blocks_to_bytes(&section.blocks) {
                Ok(bytes) => batch.push((*pos, section.version, bytes)),
                Err(err) => warn!("section {pos} has malformed blocks: {err}"),
            }
        }
        batch
    }

    /// Clears dirty flags for flushed sections, unless a newer edit landed
    /// while the flush was in flight.
    pub fn clear_flushed(&mut self, flushed: &[(SectionPos, i64)]) {
        for (pos, version) in flushed {
            if let Some(section) = self.sections.get_mut(pos) {
                if section.version == *version {
                    section.dirty = false;
                    section.from_store = true;
                }
            }
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.sections.values().filter(|section| section.dirty).count()
    }
}

/// Shared handle to one active world.
pub struct WorldHandle {
    pub id: String,
    /// Short-critical-section state lock; never held across store I/O.
    pub state: Mutex<WorldData>,
    /// Serializes the edit pipeline per world, including section loads.
    pub edit_gate: Mutex<()>,
}

impl WorldHandle {
    pub fn new(meta: WorldMeta) -> Arc<Self> {
        Arc::new(Self {
            id: meta.id.clone(),
            state: Mutex::new(WorldData::new(meta)),
            edit_gate: Mutex::new(()),
        })
    }
}

/// Serializes and sends one frame on a connection handle.
pub fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = tx.send(Message::Text(text));
        }
        Err(err) => warn!("failed to serialize outbound frame: {err}"),
    }
}

/// Makes sure a section is resident, loading or generating it as needed.
///
/// The store call happens with the state lock released; the section is
/// inserted only if a concurrent loader did not get there first.
pub async fn ensure_section(
    store: &dyn Store,
    world: &WorldHandle,
    pos: SectionPos,
) -> Result<(), StoreError> {
    {
        let mut data = world.state.lock().await;
        if let Some(section) = data.sections.get_mut(&pos) {
            section.last_access = Instant::now();
            return Ok(());
        }
    }

    let stored = if world.id == DEFAULT_WORLD_ID {
        None
    } else {
        store.load_section(&world.id, &pos.to_string()).await?
    };
    let section = match stored {
        Some(row) => {
            let blocks = bytes_to_blocks(&row.blocks)
                .map_err(|err| StoreError::Corrupt(format!("section {pos}: {err}")))?;
            Section::restored(blocks, row.version)
        }
        None => Section::baseline_for(pos),
    };

    let mut data = world.state.lock().await;
    data.sections.entry(pos).or_insert(section);
    Ok(())
}
