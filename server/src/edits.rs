//! The block-edit arbiter.
//!
//! Edits are serialized per world by the edit gate, so two accepted edits to
//! the same section can never interleave and section versions form a strict
//! per-section linearization. Responses are cached by request id: duplicate
//! requests replay the identical frame to the requester and broadcast
//! nothing.

use log::warn;
use std::sync::Arc;
use std::time::Instant;

use crate::network::Ctx;
use crate::world::{ensure_section, WorldData, WorldHandle};
use shared::blocks::AIR;
use shared::coords::{world_to_local, SectionPos};
use shared::frames::{RejectReason, ServerFrame, Vec3};
use shared::{
    EYE_HEIGHT, MAX_DIRTY_SECTIONS, MAX_REACH, PLAYER_HALF_WIDTH, PLAYER_HEIGHT, PROTOCOL_VERSION,
};

fn reject_frame(
    request_id: &str,
    x: i32,
    y: i32,
    z: i32,
    block_id: u16,
    section: Option<SectionPos>,
    reason: RejectReason,
) -> ServerFrame {
    ServerFrame::BlockEvent {
        protocol_version: PROTOCOL_VERSION,
        request_id: request_id.to_string(),
        accepted: false,
        x,
        y,
        z,
        block_id,
        section_id: section.map(|pos| pos.to_string()),
        section_version: None,
        previous_block_id: None,
        reject_reason: Some(reason),
    }
}

/// Caches a rejection and sends it to the requester only.
#[allow(clippy::too_many_arguments)]
fn reject(
    data: &mut WorldData,
    player_id: &str,
    request_id: &str,
    x: i32,
    y: i32,
    z: i32,
    block_id: u16,
    section: Option<SectionPos>,
    reason: RejectReason,
) {
    let frame = reject_frame(request_id, x, y, z, block_id, section, reason);
    data.cache_response(request_id, frame.clone());
    data.send_to(player_id, &frame);
}

/// True when the block cell overlaps the participant's collision box.
fn intersects_participant(feet: Vec3, x: i32, y: i32, z: i32) -> bool {
    let (bx, by, bz) = (x as f32, y as f32, z as f32);
    feet.x - PLAYER_HALF_WIDTH < bx + 1.0
        && bx < feet.x + PLAYER_HALF_WIDTH
        && feet.y < by + 1.0
        && by < feet.y + PLAYER_HEIGHT
        && feet.z - PLAYER_HALF_WIDTH < bz + 1.0
        && bz < feet.z + PLAYER_HALF_WIDTH
}

/// Processes one BLOCK_EDIT_REQUEST.
#[allow(clippy::too_many_arguments)]
pub async fn handle_edit(
    ctx: &Ctx,
    world: &Arc<WorldHandle>,
    player_id: &str,
    request_id: String,
    x: i32,
    y: i32,
    z: i32,
    block_id: u16,
) {
    // Per-world serialization of the whole pipeline, section load included.
    let _gate = world.edit_gate.lock().await;

    // Validation under the state lock: idempotency, rate, bounds, reach.
    let (pos, index) = {
        let mut data = world.state.lock().await;
        if let Some(frame) = data.cached_response(&request_id) {
            data.send_to(player_id, &frame);
            return;
        }
        let (rate_ok, player_pos) = match data.participants.get_mut(player_id) {
            Some(participant) => {
                participant.touch();
                (participant.edit_window.try_acquire(), participant.position)
            }
            None => return,
        };
        if !rate_ok {
            reject(
                &mut data,
                player_id,
                &request_id,
                x,
                y,
                z,
                block_id,
                None,
                RejectReason::RateLimited,
            );
            return;
        }
        let (pos, index) = match world_to_local(x, y, z) {
            Some(found) => found,
            None => {
                reject(
                    &mut data,
                    player_id,
                    &request_id,
                    x,
                    y,
                    z,
                    block_id,
                    None,
                    RejectReason::OutOfBounds,
                );
                return;
            }
        };
        let eye_y = player_pos.y + EYE_HEIGHT;
        let dx = x as f32 + 0.5 - player_pos.x;
        let dy = y as f32 + 0.5 - eye_y;
        let dz = z as f32 + 0.5 - player_pos.z;
        if (dx * dx + dy * dy + dz * dz).sqrt() > MAX_REACH {
            reject(
                &mut data,
                player_id,
                &request_id,
                x,
                y,
                z,
                block_id,
                Some(pos),
                RejectReason::TooFar,
            );
            return;
        }
        (pos, index)
    };

    // Section residency; the store call runs without the state lock.
    if let Err(err) = ensure_section(ctx.store.as_ref(), world, pos).await {
        warn!("edit {request_id} in {}: section load failed: {err}", world.id);
        let mut data = world.state.lock().await;
        reject(
            &mut data,
            player_id,
            &request_id,
            x,
            y,
            z,
            block_id,
            Some(pos),
            RejectReason::FailedToApply,
        );
        return;
    }

    // Apply and announce.
    let dirty_count = {
        let mut data = world.state.lock().await;
        let player_pos = match data.participants.get(player_id) {
            Some(participant) => participant.position,
            None => return,
        };
        let prev = match data.sections.get(&pos) {
            Some(section) => section.blocks[index],
            None => {
                reject(
                    &mut data,
                    player_id,
                    &request_id,
                    x,
                    y,
                    z,
                    block_id,
                    Some(pos),
                    RejectReason::FailedToApply,
                );
                return;
            }
        };

        let reason = if block_id == AIR && prev == AIR {
            Some(RejectReason::NothingToBreak)
        } else if block_id != AIR && prev != AIR {
            Some(RejectReason::BlockOccupied)
        } else if block_id != AIR && intersects_participant(player_pos, x, y, z) {
            Some(RejectReason::CannotPlaceInsideSelf)
        } else {
            None
        };
        if let Some(reason) = reason {
            reject(
                &mut data, player_id, &request_id, x, y, z, block_id, Some(pos), reason,
            );
            return;
        }

        let section = match data.sections.get_mut(&pos) {
            Some(section) => section,
            None => return,
        };
        section.blocks[index] = block_id;
        section.version += 1;
        section.dirty = true;
        section.last_access = Instant::now();
        let version = section.version;

        let frame = ServerFrame::BlockEvent {
            protocol_version: PROTOCOL_VERSION,
            request_id: request_id.clone(),
            accepted: true,
            x,
            y,
            z,
            block_id,
            section_id: Some(pos.to_string()),
            section_version: Some(version),
            previous_block_id: Some(prev),
            reject_reason: None,
        };
        data.cache_response(&request_id, frame.clone());
        data.broadcast_to_subscribers(pos, &frame);
        data.dirty_count()
    };

    // Back-pressure: too much unflushed state forces an early flush.
    if dirty_count > MAX_DIRTY_SECTIONS {
        ctx.flush_notify.notify_one();
    }
}
