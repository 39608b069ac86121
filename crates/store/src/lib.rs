//! Conversation persistence for the Foreman kernel.
//!
//! [`ConversationStore`] is the repository interface the kernel writes
//! through; [`MemoryStore`] is the in-memory reference implementation used
//! by tests and single-process hosts. Durable backends implement the same
//! trait behind their own crate.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::{
    ConversationPatch, ConversationStore, ListOptions, MessagePage, Signal, TodoPatch,
};
