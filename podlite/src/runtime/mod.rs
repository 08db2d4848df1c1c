//! Runtime: the entry point owning the store, the locks and the collaborators.

pub mod collaborators;
mod core;
pub mod graph;
pub mod layout;
pub mod options;
mod removal;
pub mod rt_impl;
pub mod types;

pub use self::core::Runtime;
pub use collaborators::Collaborators;
