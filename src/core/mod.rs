//! Core chat state
//!
//! The chat store that owns the conversation, plus the small SQLite table
//! that keeps the session identifier across restarts.

mod session;
mod store;

pub use session::SessionStore;
pub use store::{ChatSnapshot, ChatStore, StoreError, StoreOptions};
