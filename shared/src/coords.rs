//! Section addressing and world coordinate math.
//!
//! Worlds are a 256×256 grid of columns, each column a stack of 8 sections of
//! 16×16×16 blocks. A section is addressed by `(cx, cz, sy)` and serialized
//! on the wire as `"cx:cz:sy"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Side length of a section in blocks.
pub const SECTION_SIZE: i32 = 16;

/// Number of blocks in one section.
pub const SECTION_VOLUME: usize = 4096;

/// Sections per world along the x and z axes.
pub const WORLD_SECTIONS_XZ: i32 = 256;

/// Sections per world column (y axis).
pub const WORLD_SECTIONS_Y: i32 = 8;

/// World extent in blocks along x and z.
pub const WORLD_BLOCKS_XZ: i32 = WORLD_SECTIONS_XZ * SECTION_SIZE;

/// World extent in blocks along y.
pub const WORLD_BLOCKS_Y: i32 = WORLD_SECTIONS_Y * SECTION_SIZE;

/// Error raised by the section-id codec and bounds checks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordError {
    #[error("malformed section id {0:?}")]
    Malformed(String),
    #[error("section coordinates out of world bounds")]
    OutOfBounds,
}

/// Address of one 16×16×16 section within a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SectionPos {
    pub cx: i32,
    pub cz: i32,
    pub sy: i32,
}

impl SectionPos {
    /// Builds a section position, rejecting coordinates outside world bounds.
    pub fn new(cx: i32, cz: i32, sy: i32) -> Result<Self, CoordError> {
        if (0..WORLD_SECTIONS_XZ).contains(&cx)
            && (0..WORLD_SECTIONS_XZ).contains(&cz)
            && (0..WORLD_SECTIONS_Y).contains(&sy)
        {
            Ok(Self { cx, cz, sy })
        } else {
            Err(CoordError::OutOfBounds)
        }
    }

    /// World-space block coordinate of this section's minimum corner.
    pub fn origin(&self) -> (i32, i32, i32) {
        (
            self.cx * SECTION_SIZE,
            self.sy * SECTION_SIZE,
            self.cz * SECTION_SIZE,
        )
    }
}

impl fmt::Display for SectionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.cx, self.cz, self.sy)
    }
}

impl FromStr for SectionPos {
    type Err = CoordError;

    /// Parses `"cx:cz:sy"` with strict non-negative decimal components.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (cx, cz, sy) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c), None) => (a, b, c),
            _ => return Err(CoordError::Malformed(s.to_string())),
        };
        let component = |part: &str| -> Result<i32, CoordError> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CoordError::Malformed(s.to_string()));
            }
            part.parse::<i32>()
                .map_err(|_| CoordError::Malformed(s.to_string()))
        };
        SectionPos::new(component(cx)?, component(cz)?, component(sy)?)
    }
}

impl TryFrom<String> for SectionPos {
    type Error = CoordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SectionPos> for String {
    fn from(value: SectionPos) -> Self {
        value.to_string()
    }
}

/// Maps a world block coordinate to its containing section.
///
/// Returns `None` when the coordinate lies outside the world extents.
pub fn world_to_section(x: i32, y: i32, z: i32) -> Option<SectionPos> {
    if !in_world_bounds(x, y, z) {
        return None;
    }
    SectionPos::new(
        x.div_euclid(SECTION_SIZE),
        z.div_euclid(SECTION_SIZE),
        y.div_euclid(SECTION_SIZE),
    )
    .ok()
}

/// True when the block coordinate lies inside the world extents.
pub fn in_world_bounds(x: i32, y: i32, z: i32) -> bool {
    (0..WORLD_BLOCKS_XZ).contains(&x)
        && (0..WORLD_BLOCKS_Y).contains(&y)
        && (0..WORLD_BLOCKS_XZ).contains(&z)
}

/// Flat index of a block within its section: `ly·256 + lz·16 + lx`.
pub fn local_index(lx: usize, ly: usize, lz: usize) -> usize {
    debug_assert!(lx < 16 && ly < 16 && lz < 16);
    ly * 256 + lz * 16 + lx
}

/// Section and flat local index for a world block coordinate.
pub fn world_to_local(x: i32, y: i32, z: i32) -> Option<(SectionPos, usize)> {
    let section = world_to_section(x, y, z)?;
    let index = local_index(
        x.rem_euclid(SECTION_SIZE) as usize,
        y.rem_euclid(SECTION_SIZE) as usize,
        z.rem_euclid(SECTION_SIZE) as usize,
    );
    Some((section, index))
}

/// Enumerates the sections of every column within `radius` chunks of `center`.
///
/// The set is the closed disk in `(cx, cz)` crossed with the full `sy` column,
/// clipped to world bounds, ordered by Manhattan distance to the center
/// section with lexicographic `(cx, cz, sy)` tie-breaking.
pub fn sections_in_radius(center: SectionPos, radius: i32) -> Vec<SectionPos> {
    let mut out = Vec::new();
    let r = radius.max(0);
    for cx in (center.cx - r).max(0)..=(center.cx + r).min(WORLD_SECTIONS_XZ - 1) {
        for cz in (center.cz - r).max(0)..=(center.cz + r).min(WORLD_SECTIONS_XZ - 1) {
            let dx = cx - center.cx;
            let dz = cz - center.cz;
            if dx * dx + dz * dz > r * r {
                continue;
            }
            for sy in 0..WORLD_SECTIONS_Y {
                out.push(SectionPos { cx, cz, sy });
            }
        }
    }
    out.sort_by_key(|pos| {
        let manhattan =
            (pos.cx - center.cx).abs() + (pos.cz - center.cz).abs() + (pos.sy - center.sy).abs();
        (manhattan, pos.cx, pos.cz, pos.sy)
    });
    out
}
