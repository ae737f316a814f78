//! # schemaflow-stream
//!
//! Delivers SchemaFlow runs to clients as a text event stream.
//!
//! - [`wire`]: `event:<name>\ndata:<payload>\n\n` framing
//! - [`pump`]: forwards progress events to a sink, guaranteeing a single
//!   trailing `end` frame and an `error` frame on abort
//! - [`server`]: axum routes for streaming, replaying and health checks

pub mod server;
mod transport;
pub mod wire;

pub use server::{router, serve, AppState, ChatStreamRequest, SharedState};
pub use transport::{pump, EventSink, PumpReport};
pub use wire::{decode_frames, encode_event};
