//! Hot-reloadable reference data stores.
//!
//! Each store keeps an immutable snapshot of one `;`-delimited reference
//! file and swaps it wholesale when the file changes. Readers always see a
//! complete snapshot, never a mix of old and new records; a reload that
//! fails to parse leaves the previous snapshot in place.

mod snapshot;

pub mod routes;
pub mod schedules;
pub mod vehicles;

pub use routes::RouteStore;
pub use schedules::ScheduleStore;
pub use vehicles::VehicleStore;

use std::path::Path;

use notify::Watcher;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
}

/// A reload attempt that failed; the store keeps serving its previous
/// snapshot.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("read datasource file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse record `{record}`: {reason}")]
    Parse { record: String, reason: String },
}

/// Run `reload` once, then again on every change to `path`, until the token
/// cancels. The closure owns its own error reporting; a failed reload must
/// not end the loop.
pub(crate) async fn watch_and_reload<F>(
    path: &Path,
    token: &CancellationToken,
    mut reload: F,
) -> Result<(), notify::Error>
where
    F: FnMut(),
{
    let (tx, mut rx) = tokio::sync::mpsc::channel::<notify::Result<notify::Event>>(16);
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.blocking_send(event);
    })?;
    watcher.watch(path, notify::RecursiveMode::NonRecursive)?;

    reload();

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            event = rx.recv() => match event {
                Some(Ok(event)) => {
                    info!(path = %path.display(), kind = ?event.kind, "datasource file modified");
                    reload();
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(()),
            },
        }
    }
}

/// Read a reference file line by line, skipping blank lines and parsing
/// each remaining line with `parse`. The first line that fails to parse
/// aborts the whole read.
pub(crate) fn read_records<T, F>(path: &Path, parse: F) -> Result<Vec<T>, ReloadError>
where
    F: Fn(&str) -> Result<T, String>,
{
    let contents = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let record = parse(line).map_err(|reason| ReloadError::Parse {
            record: line.to_string(),
            reason,
        })?;
        records.push(record);
    }
    Ok(records)
}
