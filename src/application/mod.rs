//! Application services: repository seams, session cache service, publish
//! and distribution flow, and queue job payloads/processors.

pub mod jobs;
pub mod publish;
pub mod repos;
pub mod sessions;
