//! Chunk subscriptions and paced section delivery.
//!
//! Subscribe frames feed each participant's pending queue; sections drain at
//! a fixed per-tick quota from the tick loop, and at least one goes out
//! immediately on an explicit subscribe.

use log::warn;
use std::sync::Arc;

use crate::network::Ctx;
use crate::world::{ensure_section, WorldHandle};
use shared::coords::SectionPos;
use shared::frames::{ErrorCode, ServerFrame};
use shared::{
    encode_blocks, MAX_SUBSCRIPTIONS, PROTOCOL_VERSION, SECTIONS_PER_SECOND, TICKS_PER_SECOND,
};

/// Sections a participant may receive per tick.
pub fn per_tick_quota() -> usize {
    SECTIONS_PER_SECOND.div_ceil(TICKS_PER_SECOND) as usize
}

fn error_frame(code: ErrorCode, message: impl Into<String>) -> ServerFrame {
    ServerFrame::Error {
        protocol_version: PROTOCOL_VERSION,
        code,
        message: message.into(),
        fatal: false,
    }
}

/// Applies one SUBSCRIBE frame.
///
/// Unsubscribes are processed first and in full. Subscribes stop at the
/// first malformed id, rate overflow, or capacity overflow; entries already
/// processed stay subscribed.
pub async fn handle_subscribe(
    ctx: &Ctx,
    world: &Arc<WorldHandle>,
    player_id: &str,
    subscribe: Vec<String>,
    unsubscribe: Vec<String>,
) {
    let mut added = false;
    {
        let mut data = world.state.lock().await;
        match data.participants.get_mut(player_id) {
            Some(participant) => participant.touch(),
            None => return,
        }

        for raw in &unsubscribe {
            if let Ok(pos) = raw.parse::<SectionPos>() {
                data.unsubscribe(player_id, pos);
            }
        }

        for raw in &subscribe {
            let pos = match raw.parse::<SectionPos>() {
                Ok(pos) => pos,
                Err(_) => {
                    data.send_to(
                        player_id,
                        &error_frame(
                            ErrorCode::InvalidRequest,
                            format!("malformed section id {raw:?}"),
                        ),
                    );
                    break;
                }
            };
            let allowed = match data.participants.get_mut(player_id) {
                Some(participant) => participant.subscribe_window.try_acquire(),
                None => return,
            };
            if !allowed {
                data.send_to(
                    player_id,
                    &error_frame(ErrorCode::RateLimited, "subscribe rate exceeded"),
                );
                break;
            }
            let (already, full) = match data.participants.get(player_id) {
                Some(participant) => (
                    participant.subscribed.contains(&pos),
                    participant.subscribed.len() >= MAX_SUBSCRIPTIONS,
                ),
                None => return,
            };
            if already {
                continue;
            }
            if full {
                data.send_to(
                    player_id,
                    &error_frame(ErrorCode::RateLimited, "subscription limit reached"),
                );
                break;
            }
            data.subscribe(player_id, pos);
            added = true;
        }
    }

    if added {
        // An explicit subscribe flushes at least one section right away.
        deliver_pending(ctx, world, player_id, per_tick_quota().max(1)).await;
    }
}

/// Sends up to `quota` queued sections to one participant.
///
/// Section loads happen with the state lock released; a failed load requeues
/// the section for a later tick instead of dropping the subscription.
pub async fn deliver_pending(ctx: &Ctx, world: &Arc<WorldHandle>, player_id: &str, quota: usize) {
    for _ in 0..quota {
        let next = {
            let mut data = world.state.lock().await;
            let participant = match data.participants.get_mut(player_id) {
                Some(participant) => participant,
                None => return,
            };
            // Entries unsubscribed while queued are skipped.
            loop {
                match participant.pending_sections.pop_front() {
                    Some(pos) if participant.subscribed.contains(&pos) => break Some(pos),
                    Some(_) => continue,
                    None => break None,
                }
            }
        };
        let pos = match next {
            Some(pos) => pos,
            None => return,
        };

        if let Err(err) = ensure_section(ctx.store.as_ref(), world, pos).await {
            warn!("section load failed for {pos} in {}: {err}", world.id);
            let mut data = world.state.lock().await;
            if let Some(participant) = data.participants.get_mut(player_id) {
                participant.pending_sections.push_back(pos);
            }
            return;
        }

        let data = world.state.lock().await;
        let frame = match data.sections.get(&pos) {
            Some(section) => match encode_blocks(&section.blocks) {
                Ok(blocks) => ServerFrame::SectionData {
                    protocol_version: PROTOCOL_VERSION,
                    section_id: pos.to_string(),
                    version: section.version,
                    blocks,
                    baseline: section.is_baseline(),
                },
                Err(err) => {
                    warn!("section {pos} failed to encode: {err}");
                    continue;
                }
            },
            None => continue,
        };
        data.send_to(player_id, &frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_tick_quota_rounds_up() {
        let quota = per_tick_quota();
        assert!(quota >= 1);
        assert!(quota as u32 * TICKS_PER_SECOND >= SECTIONS_PER_SECOND);
    }
}
