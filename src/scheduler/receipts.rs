use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::adapters::{PlatformAdapter, Receipt};

/// Routes an adapter's receipt stream to the probe cycle waiting on each
/// token. A receipt whose token has no registered waiter (late, duplicate,
/// or from a discarded probe) is dropped here.
#[derive(Clone)]
pub(crate) struct ReceiptRouter {
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<Receipt>>>>,
}

impl ReceiptRouter {
    pub(crate) fn spawn(
        adapter: &Arc<dyn PlatformAdapter>,
        cancel: CancellationToken,
    ) -> Self {
        let router = Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
        };

        let mut receipts = adapter.subscribe_receipts();
        let waiters = Arc::clone(&router.waiters);
        let channel = adapter.channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    receipt = receipts.recv() => {
                        let Some(receipt) = receipt else {
                            debug!("{channel} receipt feed closed; router exiting");
                            break;
                        };
                        match waiters.lock().await.remove(&receipt.token) {
                            Some(tx) => {
                                let _ = tx.send(receipt);
                            }
                            None => {
                                debug!(
                                    "Dropping unmatched {channel} receipt for token {}",
                                    receipt.token
                                );
                            }
                        }
                    }
                }
            }
        });

        router
    }

    pub(crate) async fn register(&self, token: &str) -> oneshot::Receiver<Receipt> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(token.to_string(), tx);
        rx
    }

    /// Forget a token so any later receipt for it is dropped.
    pub(crate) async fn deregister(&self, token: &str) {
        self.waiters.lock().await.remove(token);
    }
}
