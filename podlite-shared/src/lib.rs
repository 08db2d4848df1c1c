//! Types shared between podlite crates.

pub mod errors;

pub use errors::{PodliteError, PodliteResult};
