//! # chat-relay
//!
//! Real-time connection and message-distribution core for a chat-style
//! service: WebSocket session tracking, sliding-window rate limiting,
//! heartbeat-based liveness eviction, direct/broadcast delivery with
//! status bookkeeping, and drain-based graceful shutdown.
//!
//! The AI/voice side of the service lives behind the collaborator seams in
//! [`responder`] and [`speech`]; the core never calls an external API
//! directly.

pub mod config;
pub mod responder;
pub mod server;
pub mod speech;
pub mod utils;
