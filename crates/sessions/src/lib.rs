//! Session persistence for Datasage.

pub mod store;

pub use store::{SessionStore, new_session_id};
