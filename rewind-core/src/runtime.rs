//! Tokio runtime used for background loads and writes.

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Handle, Runtime};

static GLOBAL_RT: Lazy<Option<Runtime>> = Lazy::new(|| {
    let threads = num_cpus::get().clamp(1, 4);
    match Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name("rewind-io")
        .enable_all()
        .build()
    {
        Ok(rt) => Some(rt),
        Err(e) => {
            tracing::error!(error = %e, "failed to build background runtime");
            None
        }
    }
});

/// The runtime the caller is on, or a lazily built crate-global one when
/// called from plain threads.
///
/// Returns `None` only if no runtime is active and the global one could not
/// be started.
pub fn handle() -> Option<Handle> {
    Handle::try_current()
        .ok()
        .or_else(|| GLOBAL_RT.as_ref().map(|rt| rt.handle().clone()))
}
