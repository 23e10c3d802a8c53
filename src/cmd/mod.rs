//! Command-line entry points.

use crate::{
    prelude::*,
    stores::{Backend, BackendOpts},
    tracker::PageCompletionTracker,
};

pub mod aggregate;
pub mod cleanup;
pub mod evaluate;
pub mod flatten;
pub mod human_complete;
pub mod process_page;
pub mod schema;
pub mod segments;
pub mod serve_pages;
pub mod status;

/// Connect to our backend and build a tracker on its state store.
async fn connect_tracker(backend_opts: &BackendOpts) -> Result<(Backend, PageCompletionTracker)> {
    let backend = backend_opts.connect().await?;
    let tracker = PageCompletionTracker::new(backend.state_store()?);
    Ok((backend, tracker))
}
