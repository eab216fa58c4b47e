//! Deterministic baseline terrain.
//!
//! Generator version 1 is the flat world: stone fills world-y 0 through 3,
//! grass covers world-y 4, and everything above is air. The function is pure;
//! it never touches the store, so any section can be rebuilt from its
//! position alone.

use shared::blocks::{AIR, GRASS, STONE};
use shared::coords::{local_index, SectionPos, SECTION_SIZE, SECTION_VOLUME};

/// World-y of the highest stone layer.
pub const STONE_TOP_Y: i32 = 3;

/// World-y of the grass layer.
pub const GRASS_Y: i32 = 4;

/// Feet height of a freshly spawned participant (standing on the grass).
pub const SPAWN_Y: f32 = 5.0;

/// Computes the baseline blocks for a section.
pub fn baseline(section: SectionPos) -> Vec<u16> {
    let mut blocks = vec![AIR; SECTION_VOLUME];
    let base_y = section.sy * SECTION_SIZE;
    for ly in 0..SECTION_SIZE as usize {
        let world_y = base_y + ly as i32;
        let id = if world_y <= STONE_TOP_Y {
            STONE
        } else if world_y == GRASS_Y {
            GRASS
        } else {
            continue;
        };
        for lz in 0..SECTION_SIZE as usize {
            for lx in 0..SECTION_SIZE as usize {
                blocks[local_index(lx, ly, lz)] = id;
            }
        }
    }
    blocks
}
