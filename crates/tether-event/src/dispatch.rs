//! The process-wide dispatch queue.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::OnceLock;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    job: Job,
    runtime: Option<Handle>,
}

static QUEUE: OnceLock<mpsc::UnboundedSender<Task>> = OnceLock::new();

fn queue() -> &'static mpsc::UnboundedSender<Task> {
    QUEUE.get_or_init(|| {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        std::thread::Builder::new()
            .name("tether-dispatch".into())
            .spawn(move || {
                while let Some(task) = rx.blocking_recv() {
                    run(task);
                }
            })
            // Without the dispatch thread no event can ever fire.
            .expect("failed to spawn tether-dispatch thread");
        tx
    })
}

fn run(task: Task) {
    let _guard = task.runtime.as_ref().map(Handle::enter);
    if catch_unwind(AssertUnwindSafe(task.job)).is_err() {
        tracing::error!("event listener panicked");
    }
}

/// Queues `job` behind every job queued before it.
pub(crate) fn defer<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    let task = Task {
        job: Box::new(job),
        runtime: Handle::try_current().ok(),
    };
    // The receiver lives for the whole process.
    let _ = queue().send(task);
}
