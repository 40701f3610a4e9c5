//! Periodic bootstrapping of a set of DHT instances.
//!
//! [`BootstrapDriver`] runs [`bootstrap_round`] on a fixed period until it is
//! stopped. When several instances share one process, rounds can start at a
//! random instance so no instance always bootstraps against a cold network.

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::BootstrapConfig;
use crate::context::{Canceller, OpContext};
use crate::dht::DhtNode;
use crate::error::DhtError;
use crate::protocols::DhtRpc;

/// Bootstrap every instance in `dhts` once, one after another. Returns the
/// number of instances whose bootstrap succeeded.
pub async fn bootstrap_round<N: DhtRpc>(ctx: &OpContext, dhts: &[DhtNode<N>], config: &BootstrapConfig) -> usize {
    if dhts.is_empty() {
        return 0;
    }
    let start = if config.randomize_start {
        rand::thread_rng().gen_range(0..dhts.len())
    } else {
        0
    };

    let mut succeeded = 0;
    for i in 0..dhts.len() {
        let dht = &dhts[(start + i) % dhts.len()];
        match dht.bootstrap(ctx, config).await {
            Ok(()) => succeeded += 1,
            Err(DhtError::Cancelled) => break,
            Err(e) => debug!(peer = %dht.local_id().short(), error = %e, "bootstrap failed"),
        }
    }
    info!(instances = dhts.len(), start, succeeded, "bootstrap round complete");
    succeeded
}

pub struct BootstrapDriver {
    stop_tx: watch::Sender<bool>,
    canceller: Canceller,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BootstrapDriver {
    /// Start bootstrapping `dhts` now and every `config.period` after.
    pub fn spawn<N: DhtRpc>(dhts: Vec<DhtNode<N>>, config: BootstrapConfig) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (ctx, canceller) = OpContext::with_cancel();

        let task = tokio::spawn(async move {
            loop {
                bootstrap_round(&ctx, &dhts, &config).await;
                tokio::select! {
                    _ = tokio::time::sleep(config.period) => {}
                    _ = stop_rx.changed() => break,
                }
                if *stop_rx.borrow() {
                    break;
                }
            }
            debug!("bootstrap driver stopped");
        });

        Self {
            stop_tx,
            canceller,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop the driver. With `wait` an in-flight round runs to completion;
    /// otherwise its lookups are cancelled. Returns once the driver task has
    /// exited.
    pub async fn stop(&self, wait: bool) {
        self.stop_tx.send_replace(true);
        if !wait {
            self.canceller.cancel();
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for BootstrapDriver {
    fn drop(&mut self) {
        self.canceller.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
