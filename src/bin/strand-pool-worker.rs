//! Standalone process-pool worker program. Serves the built-in job
//! registry; embedders with custom jobs build their own worker binary and
//! register jobs before calling [`strand::executor::process_pool::worker_main`].

fn main() {
    strand::executor::process_pool::worker_main();
}
