//! CLI command implementations.

pub mod compact;
pub mod dump;
pub mod inspect;
pub mod journal;
pub mod verify;
