//! Terminal output utilities.
//!
//! Formats an exported template context as an aligned two-column table.

use colored::Colorize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Format a value as a quoted, right-aligned field.
pub fn format_field<T: ToString>(value: T, width: usize) -> String {
    let value_str = value.to_string();
    let quoted = format!("\"{value_str}\"");
    let quoted_len = quoted.len();

    if quoted_len >= width {
        quoted
    } else {
        format!("{quoted:>width$}")
    }
}

/// Render a context mapping as a table with a colored heading.
pub fn render_context(heading: &str, context: &BTreeMap<String, String>) -> String {
    let key_width = context.keys().map(|k| k.len()).max().unwrap_or(0);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} ({} variables)",
        heading.bold().green(),
        context.len()
    );
    for (keyword, value) in context {
        let _ = writeln!(out, "  {keyword:<key_width$} = {value}");
    }
    out
}
