//! Command-line entry points.

use serde::Serialize;

use crate::prelude::*;

pub mod backends;
pub mod extract;

/// Write `value` as pretty-printed JSON to `output_path`, or to standard
/// output when no path is given.
pub(crate) fn write_json<T: Serialize>(
    output_path: Option<&Path>,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .context("cannot serialize result")?;
    match output_path {
        Some(path) => std::fs::write(path, json.as_bytes())
            .with_context(|| format!("cannot write {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}
