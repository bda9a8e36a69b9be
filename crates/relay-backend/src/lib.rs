//! Upstream backend dispatch: round-robin endpoint selection, unary
//! and streaming chat calls against an OpenAI-compatible
//! `/v1/chat/completions` surface.

pub mod dispatcher;
pub mod router;

pub use dispatcher::{BackendDispatcher, ChatChunk, ChatChoiceDelta, ChatChunkChoice};
pub use router::{BackendKind, Router};
