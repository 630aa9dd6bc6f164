//! Thread supervisor for the operator loops.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::operators::{
    ContentUpload, DownloadOnceCleanup, ERROR_BACKOFF, FileVersionSync, LocalCreate, LocalHasher,
    LocalScanner, LocalVersionCreation, Operator,
};

/// Granularity at which sleeping loops notice the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Runs one worker thread per operator until the shutdown flag flips.
pub struct Server {
    config: Arc<Config>,
}

impl Server {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Blocks until `shutdown` becomes true, then joins the workers.
    pub fn run(&self, shutdown: &Arc<AtomicBool>) -> io::Result<()> {
        let operators: Vec<Box<dyn Operator>> = vec![
            Box::new(LocalScanner::new(self.config.clone())),
            Box::new(LocalHasher::new(self.config.clone())),
            Box::new(LocalVersionCreation::new(self.config.clone())),
            Box::new(ContentUpload::new(self.config.clone())),
            Box::new(FileVersionSync::new(self.config.clone())),
            Box::new(LocalCreate::new(self.config.clone())),
            Box::new(DownloadOnceCleanup::new(self.config.clone())),
        ];

        let mut workers = Vec::with_capacity(operators.len());
        for operator in operators {
            let flag = Arc::clone(shutdown);
            workers.push(
                thread::Builder::new()
                    .name(operator.name().to_owned())
                    .spawn(move || run_operator(operator, &flag))?,
            );
        }

        info!("server running; interrupt to exit");
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(SHUTDOWN_POLL);
        }

        info!("shutting down");
        for worker in workers {
            if worker.join().is_err() {
                warn!("operator thread panicked during shutdown");
            }
        }
        Ok(())
    }
}

/// The shared operator loop: step, then sleep according to the outcome.
///
/// Steps that did work re-run after the short interval; idle steps back
/// off exponentially up to the operator's ceiling; failed steps log and
/// take the fixed error back-off so a persistent fault neither spins nor
/// kills the process.
pub fn run_operator(mut operator: Box<dyn Operator>, shutdown: &AtomicBool) {
    let short = operator.short_interval();
    let mut delay = short;
    while !shutdown.load(Ordering::Relaxed) {
        match operator.step() {
            Ok(true) => delay = short,
            Ok(false) => delay = (delay * 2).min(operator.max_interval()),
            Err(err) => {
                warn!(
                    operator = operator.name(),
                    error = %err,
                    "operator step failed"
                );
                delay = ERROR_BACKOFF;
            }
        }
        sleep_interruptible(delay, shutdown);
    }
}

fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let slice = remaining.min(SHUTDOWN_POLL);
        thread::sleep(slice);
        remaining -= slice;
    }
}
