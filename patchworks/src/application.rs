use crate::options::Options;
use anyhow::{Context as _, Result};
use patchworks_controller::{events::TracingEventSink, Context};
use patchworks_store::FileStore;
use std::process::exit;
use std::sync::Arc;

/// Create the single-threaded tokio runtime used by the CLI.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to initialize tokio runtime")
}

/// Handle a Result, printing the error and exiting with code 1 on failure.
pub fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("patchworks error: {:?}", e);
            exit(1);
        }
    }
}

pub fn open_store(options: &Options) -> Result<Arc<FileStore>> {
    let store = FileStore::open(&options.store)
        .with_context(|| format!("opening store {}", options.store.display()))?;
    Ok(Arc::new(store))
}

/// The engine's collaborators: the store from the options, and events as
/// log lines.
pub fn engine_context(options: &Options) -> Result<Context> {
    Ok(Context::new(open_store(options)?, Arc::new(TracingEventSink)))
}
