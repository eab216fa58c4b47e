//! # Voxel World Server Library
//!
//! The authoritative real-time server for the multi-user voxel sandbox. It
//! accepts persistent WebSocket connections, authenticates them, admits them
//! into named worlds of at most eight participants, relays motion at a fixed
//! 20 Hz tick, streams compressed section data on demand, arbitrates
//! concurrent block edits, and persists dirty sections to the relational
//! store in batches.
//!
//! ## Architecture
//!
//! Each connection runs on its own task and owns a writer task fed through an
//! unbounded channel; all per-world mutable state (participants, loaded
//! sections, the subscription index, the edit-response cache) lives behind a
//! per-world mutex with short critical sections that never span store I/O.
//! Block edits additionally serialize per world through an edit gate, which
//! makes section versions a strict per-section linearization.
//!
//! Four periodic loops run alongside the connection tasks:
//!
//! - the tick broadcaster (50 ms): motion snapshots and paced section
//!   delivery,
//! - the persistence loop (1 s): batched upserts of dirty sections,
//! - the heartbeat loop (30 s): session-row refresh per active world,
//! - the stale reaper: closes connections idle for more than a minute.
//!
//! ## Module Organization
//!
//! - [`config`] — command line / environment configuration and origin rules
//! - [`store`] / [`pg_store`] — the durable-store interface and its Postgres
//!   implementation
//! - [`auth`] — credential verification against the cached signing-key set
//! - [`generator`] — the deterministic baseline terrain function
//! - [`world`] — per-world in-memory state
//! - [`registry`] — the world registry and the admission pipeline
//! - [`session`] — the per-connection state machine
//! - [`streamer`] — chunk subscriptions and paced delivery
//! - [`edits`] — the block-edit arbiter
//! - [`network`] — the server shell and its periodic loops

pub mod auth;
pub mod config;
pub mod edits;
pub mod generator;
pub mod network;
pub mod pg_store;
pub mod registry;
pub mod session;
pub mod store;
pub mod streamer;
pub mod utils;
pub mod world;
