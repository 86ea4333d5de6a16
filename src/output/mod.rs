//! Presentation helpers for the demo binary.

mod terminal;

// Re-export public functions
pub use terminal::{format_field, render_context};
