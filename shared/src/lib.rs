//! # Shared Protocol Library
//!
//! Data structures, constants, and codecs shared between the voxel world
//! server, its integration tests, and the test client. Everything the wire
//! protocol and the world math depend on lives here so that all participants
//! agree on frame shapes, section addressing, and block encoding.
//!
//! ## Core Components
//!
//! - [`frames`] — the JSON wire protocol: inbound and outbound frame unions,
//!   error codes, close codes, and edit reject reasons.
//! - [`coords`] — section addressing: world↔section↔local index math and the
//!   strict `"cx:cz:sy"` section-id codec.
//! - [`blocks`] — block-id constants and the 4096×u16 ⇄ 8192-byte ⇄ base64
//!   section payload codec.
//!
//! Protocol version 1 fixes the wire format at JSON text frames with section
//! payloads as base64 of exactly 8192 little-endian bytes.

use std::time::Duration;

pub mod blocks;
pub mod coords;
pub mod frames;

pub use blocks::{decode_blocks, encode_blocks, AIR, DIRT, GRASS, STONE};
pub use coords::SectionPos;
pub use frames::{ClientFrame, ErrorCode, PlayerState, RejectReason, ServerFrame, Vec3};

/// Wire protocol version spoken by this server.
pub const PROTOCOL_VERSION: u32 = 1;

/// Block registry version the server was built against.
pub const REGISTRY_VERSION: u32 = 1;

/// Baseline terrain generator version (flat world).
pub const GENERATOR_VERSION: u32 = 1;

/// Hard cap on concurrent participants in a single world.
pub const MAX_PARTICIPANTS: usize = 8;

/// Motion snapshot broadcast period.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Snapshot ticks per second; `TICK_INTERVAL` expressed as a rate.
pub const TICKS_PER_SECOND: u32 = 20;

/// A connection must complete its handshake within this window.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Admitted connections idle longer than this are reaped.
pub const STALE_TIMEOUT: Duration = Duration::from_secs(60);

/// Dirty sections are flushed to the store at this period.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(1);

/// Session-row heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Signing-key set cache lifetime.
pub const KEY_SET_TTL: Duration = Duration::from_secs(3600);

/// Opaque display-name tokens are accepted up to this age.
pub const OPAQUE_TOKEN_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Per-participant block-edit budget (sliding one-second window).
pub const EDITS_PER_SECOND: usize = 20;

/// Per-participant subscribe budget (sliding one-second window).
pub const SUBSCRIBES_PER_SECOND: usize = 100;

/// Per-source-IP connection budget (sliding one-minute window).
pub const CONNECTIONS_PER_MINUTE: usize = 3;

/// Inbound frames larger than this close the connection.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Edit responses are replayable by request id for this long.
pub const REQUEST_ID_TTL: Duration = Duration::from_secs(60);

/// Maximum distance from a participant's eye to an edited block center.
pub const MAX_REACH: f32 = 5.0;

/// Maximum concurrent section subscriptions per participant.
pub const MAX_SUBSCRIPTIONS: usize = 128;

/// Paced section delivery rate per participant.
pub const SECTIONS_PER_SECOND: u32 = 40;

/// Dirty-section count per world past which a flush is forced.
pub const MAX_DIRTY_SECTIONS: usize = 500;

/// Participant collision box half-width in blocks.
pub const PLAYER_HALF_WIDTH: f32 = 0.3;

/// Participant collision box height in blocks.
pub const PLAYER_HEIGHT: f32 = 1.8;

/// Eye height above the participant's feet position.
pub const EYE_HEIGHT: f32 = 1.6;
