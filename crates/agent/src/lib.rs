//! The Datasage agent: one conversational turn at a time.
//!
//! A turn moves through **AwaitingModel → (ExecutingTools → AwaitingModel)* →
//! Finalizing → Done**, or ends in a single error:
//!
//! 1. **Request** a model response over the session's full history
//! 2. **Aggregate** the delta stream, relaying text as it arrives
//! 3. **If tool calls**: persist them, dispatch each in order, persist results, loop
//! 4. **If text**: persist the answer and finish
//!
//! Every message is persisted through the session store before the turn
//! moves on.

pub mod aggregator;
pub mod dispatcher;
pub mod loop_runner;
pub mod prompt;

#[cfg(test)]
mod test_helpers;

pub use aggregator::{Aggregation, Outcome, StreamAggregator, aggregate, split_chunks};
pub use dispatcher::{DispatchError, SchemaGate, ToolDispatcher, parse_arguments};
pub use loop_runner::AgentLoop;
pub use prompt::{DEFAULT_SYSTEM_PROMPT, system_prompt};
