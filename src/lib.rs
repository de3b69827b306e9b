#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_possible_truncation
)]

pub mod aggregate;
pub mod arch;
pub mod cache_lines;
pub mod config;
pub mod conflict_set;
pub mod handler;
pub mod report;
pub mod symbols;

#[cfg(test)]
pub mod testing;

pub use handler::{Handler, KernelId, Rejection};
pub use trace_model::{AccessMessage, Direction, ExecMask, MemorySpace, RawMessage};

use color_eyre::eyre;
use std::path::Path;

/// Load the access messages of a kernel dispatch from a JSON array.
pub fn parse_messages(path: impl AsRef<Path>) -> eyre::Result<Vec<AccessMessage>> {
    let reader = utils::fs::open_readable(path.as_ref())?;
    let messages = serde_json::from_reader(reader)?;
    Ok(messages)
}

/// Load a JSON instruction database.
pub fn parse_symbols(path: impl AsRef<Path>) -> eyre::Result<symbols::KernelDatabase> {
    let reader = utils::fs::open_readable(path.as_ref())?;
    let db = symbols::KernelDatabase::from_reader(reader)?;
    Ok(db)
}

/// Analyze `messages` and report the results.
///
/// Returns the number of messages consumed by an analysis.
pub fn run(
    handler: &mut Handler,
    messages: &[AccessMessage],
    db: Option<&symbols::KernelDatabase>,
) -> Result<usize, report::Error> {
    let kernel = handler.kernel().name.clone();
    let mut handled = 0;
    for message in messages {
        let consumed = match db {
            Some(db) => handler.handle_with(message, &kernel, db),
            None => handler.handle(message),
        };
        if consumed {
            handled += 1;
        }
    }
    log::debug!("handled {handled} of {} messages", messages.len());
    match db {
        Some(db) => handler.report_with(&kernel, db)?,
        None => handler.report()?,
    }
    Ok(handled)
}
