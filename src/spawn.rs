//! The global executor.
//!
//! Connection tasks and user code run on a lazily initialized
//! multi-threaded executor. It exists for convenience: a server embedded in
//! a larger application can equally be driven by any executor capable of
//! running the futures returned by [`Server::start`][crate::Server::start].

use std::future::Future;
use std::panic::catch_unwind;
use std::thread;

use async_executor::{Executor, Task};
use async_lock::OnceCell;
use futures_lite::future;

static EXECUTOR: OnceCell<Executor<'static>> = OnceCell::new();

/// Spawns a task onto the global executor.
///
/// Worker threads are started on first use; their count is read from the
/// `TERN_THREADS` environment variable and defaults to the number of CPU
/// cores.
///
/// # Examples
///
/// ```
/// let task = tern::spawn(async { 1 + 2 });
///
/// tern::block_on(async {
///     assert_eq!(task.await, 3);
/// });
/// ```
pub fn spawn<T: Send + 'static>(future: impl Future<Output = T> + Send + 'static) -> Task<T> {
    executor().spawn(future)
}

fn executor() -> &'static Executor<'static> {
    EXECUTOR.get_or_init_blocking(|| {
        start_workers(worker_count());
        Executor::new()
    })
}

fn worker_count() -> usize {
    std::env::var("TERN_THREADS")
        .ok()
        .and_then(|value| value.parse().ok())
        .filter(|&count| count > 0)
        .unwrap_or_else(num_cpus::get)
        .max(1)
}

fn start_workers(count: usize) {
    for id in 0..count {
        thread::Builder::new()
            .name(format!("tern-worker-{}", id))
            .spawn(run_worker)
            .expect("cannot spawn executor thread");
    }
}

/// Drives the executor until the process exits. A panicking task unwinds
/// into the worker, which resumes driving.
fn run_worker() {
    loop {
        let tick = catch_unwind(|| future::block_on(executor().run(future::pending::<()>())));
        if tick.is_ok() {
            break;
        }
    }
}
