//! forma: a control-flow orchestrator that turns natural-language shape
//! descriptions into verified 3D models through a bounded, self-correcting
//! generate-execute-review loop.

pub mod api;
pub mod capability;
pub mod config;
pub mod engine;
pub mod errors;
pub mod orchestrator;
pub mod server;
pub mod store;
pub mod task;
