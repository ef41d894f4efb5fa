//! A small worker-pool abstraction over native threads, so the scheduler
//! stays executor-agnostic: a sub-batch's tasks (already bounded to at
//! most `maxConcurrent` items) run as a set of scoped threads joined
//! before the caller proceeds.

/// Run `f` against every item in `items` concurrently, preserving input
/// order in the returned results. Blocks until every item finishes.
pub fn run_concurrent<T, R, F>(items: Vec<T>, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    std::thread::scope(|scope| {
        let handles: Vec<_> = items
            .into_iter()
            .map(|item| scope.spawn(|| f(item)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker thread panicked"))
            .collect()
    })
}
