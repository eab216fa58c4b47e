//! Wire protocol frames for client-server communication.
//!
//! Frames are JSON objects over a bidirectional text stream, discriminated by
//! a `type` field. Every frame carries `protocol_version`. Section payloads
//! inside [`ServerFrame::SectionData`] use the codec in [`crate::blocks`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server is going away (shutdown, reaping).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Protocol violation (oversize frame, non-text payload).
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Connection arrived with a disallowed origin.
pub const CLOSE_INVALID_ORIGIN: u16 = 4403;
/// Source IP exceeded the connection rate window.
pub const CLOSE_RATE_LIMITED: u16 = 4429;

/// Input bitfield: forward movement.
pub const INPUT_FORWARD: u8 = 1 << 0;
/// Input bitfield: backward movement.
pub const INPUT_BACK: u8 = 1 << 1;
/// Input bitfield: strafe left.
pub const INPUT_LEFT: u8 = 1 << 2;
/// Input bitfield: strafe right.
pub const INPUT_RIGHT: u8 = 1 << 3;
/// Input bitfield: jump.
pub const INPUT_JUMP: u8 = 1 << 4;
/// Input bitfield: sneak.
pub const INPUT_SNEAK: u8 = 1 << 5;

/// A position or velocity in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }
}

/// One participant's motion state as carried in snapshots and join frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerState {
    pub player_id: String,
    pub display_name: String,
    pub position: Vec3,
    pub velocity: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub last_input_sequence: u32,
}

/// Machine-readable error codes carried by [`ServerFrame::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthFailed,
    AuthExpired,
    WorldNotFound,
    WorldFull,
    RegistryMismatch,
    GeneratorMismatch,
    RateLimited,
    InvalidRequest,
    OutOfBounds,
    PermissionDenied,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::AuthExpired => "auth_expired",
            ErrorCode::WorldNotFound => "world_not_found",
            ErrorCode::WorldFull => "world_full",
            ErrorCode::RegistryMismatch => "registry_mismatch",
            ErrorCode::GeneratorMismatch => "generator_mismatch",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::OutOfBounds => "out_of_bounds",
            ErrorCode::PermissionDenied => "permission_denied",
        };
        f.write_str(text)
    }
}

/// Why a block edit was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    #[serde(rename = "rate limited")]
    RateLimited,
    #[serde(rename = "out of bounds")]
    OutOfBounds,
    #[serde(rename = "too far")]
    TooFar,
    #[serde(rename = "nothing to break")]
    NothingToBreak,
    #[serde(rename = "block occupied")]
    BlockOccupied,
    #[serde(rename = "cannot place inside self")]
    CannotPlaceInsideSelf,
    #[serde(rename = "failed to apply edit")]
    FailedToApply,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::RateLimited => "rate limited",
            RejectReason::OutOfBounds => "out of bounds",
            RejectReason::TooFar => "too far",
            RejectReason::NothingToBreak => "nothing to break",
            RejectReason::BlockOccupied => "block occupied",
            RejectReason::CannotPlaceInsideSelf => "cannot place inside self",
            RejectReason::FailedToApply => "failed to apply edit",
        };
        f.write_str(text)
    }
}

/// Frames a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// Handshake. Must be the first frame on a connection.
    Hello {
        protocol_version: u32,
        registry_version: u32,
        generator_version: u32,
        /// Bearer credential: a signed token or an opaque display-name token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jwt: Option<String>,
        world_id: String,
    },
    /// Motion update, applied with coarse clamping only.
    Input {
        protocol_version: u32,
        sequence: u32,
        position: Vec3,
        velocity: Vec3,
        yaw: f32,
        pitch: f32,
        /// Bitfield of `INPUT_*` flags.
        inputs: u8,
    },
    /// Section interest changes, processed in order.
    Subscribe {
        protocol_version: u32,
        #[serde(default)]
        subscribe: Vec<String>,
        #[serde(default)]
        unsubscribe: Vec<String>,
    },
    /// A block placement or destruction request.
    BlockEditRequest {
        protocol_version: u32,
        request_id: String,
        x: i32,
        y: i32,
        z: i32,
        block_id: u16,
    },
}

/// Frames the server may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// Handshake completion with the assigned seat.
    Welcome {
        protocol_version: u32,
        player_id: String,
        display_name: String,
        world_id: String,
        spawn_position: Vec3,
        /// Participants already admitted to the world.
        players: Vec<PlayerState>,
    },
    /// Fixed-tick motion snapshot of every participant.
    Snapshot {
        protocol_version: u32,
        timestamp: u64,
        players: Vec<PlayerState>,
    },
    /// One section's blocks in response to a subscription.
    SectionData {
        protocol_version: u32,
        section_id: String,
        version: i64,
        /// Base64 of exactly 8192 little-endian payload bytes.
        blocks: String,
        /// True when the payload is pure generator output, never edited.
        baseline: bool,
    },
    /// Outcome of a block edit. Accepted events reach every subscriber of
    /// the section; rejections reach only the requester.
    BlockEvent {
        protocol_version: u32,
        request_id: String,
        accepted: bool,
        x: i32,
        y: i32,
        z: i32,
        block_id: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        section_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        section_version: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_block_id: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reject_reason: Option<RejectReason>,
    },
    /// A participant joined the world.
    PlayerJoin {
        protocol_version: u32,
        player: PlayerState,
    },
    /// A participant left the world.
    PlayerLeave {
        protocol_version: u32,
        player_id: String,
    },
    /// An error; `fatal` means the connection closes right after.
    Error {
        protocol_version: u32,
        code: ErrorCode,
        message: String,
        fatal: bool,
    },
    /// The client's input stream regressed; re-seed from this state.
    Resync {
        protocol_version: u32,
        position: Vec3,
        last_input_sequence: u32,
    },
    /// The world is hosted by another instance; reconnect there.
    Redirect {
        protocol_version: u32,
        url: String,
    },
}
