//! Shared utility functions for stage-forge.
//!
//! JSON extraction from completion responses lives here so both the review
//! types and the stage agents can use it.

pub mod json_extraction;

pub use json_extraction::{extract_json_object, find_matching_brace};
