use once_cell::sync::Lazy;
use std::future::Future;
use tokio::runtime::{Builder, Runtime};

static TOKIO_RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    Builder::new_current_thread()
        .thread_name("machine-engine-blocking")
        .enable_all()
        .build()
        .expect("cannot build tokio runtime")
});

/// Runs a future to completion from synchronous callers that do not own a runtime.
pub fn block_on<F: Future>(future: F) -> F::Output {
    TOKIO_RUNTIME.block_on(future)
}
