//! Shared utility functions for peach.

pub mod text;

pub use text::{extract_json_object, find_matching_brace, strip_code_fences, truncate_chars};
