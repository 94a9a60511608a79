//! Domain layer: persisted records, shared enumerations, and the scoring engine.

pub mod entities;
pub mod scoring;
pub mod types;
