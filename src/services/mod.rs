//! Sync services built on the remote interfaces.
//!
//! ARCHITECTURE
//! ============
//! `entity` mirrors the durable shape collection and owns soft-lock timers.
//! `cursor` and `presence` run independently over the ephemeral store and
//! never touch entity state. `history` records session mutations and replays
//! them through `entity`. `command` turns command-source output into session
//! mutations.

pub mod command;
pub mod cursor;
pub mod entity;
pub mod history;
pub mod presence;
