//! # Error Handling
//!
//! Error types for the translator. Structural precondition failures surface as
//! an [`Error`] from [`crate::Translator::translate`]; every other failure is
//! collected into an [`ErrorList`] and returned next to the produced resources.

mod list;
mod types;

pub use list::ErrorList;
pub use types::{Error, Result};
