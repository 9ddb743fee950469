//! # Datasage Core
//!
//! Domain types, traits, and error definitions for the Datasage data agent.
//! This crate has **no framework dependencies**: it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every seam (model provider, tool capability) is a trait here.
//! Implementations live in their respective crates, and the agent loop is
//! tested against scripted stand-ins.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, SessionError, ToolError};
pub use event::StreamEvent;
pub use message::{Message, Session, SessionMeta, Timing, ToolCallRecord};
pub use provider::{
    DeltaReceiver, FinishReason, Provider, ProviderRequest, ProviderResponse, StreamDelta,
    ToolCallDelta, ToolDefinition, Usage,
};
pub use tool::{ResultCap, Tool, ToolDescriptor, ToolRegistry};
