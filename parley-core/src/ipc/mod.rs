//! Serialisable types the loop publishes to its host.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them as JSON lines.

pub mod events;
