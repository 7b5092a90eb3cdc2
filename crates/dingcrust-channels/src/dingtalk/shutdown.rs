use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use super::dispatcher::DeliveryDispatcher;
use super::tasks::TaskPool;

/// What a shutdown pass managed to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Open cards taken out of the registry for finishing.
    pub open_cards: usize,
    /// Whether finalization was cut short by the timeout.
    pub timed_out: bool,
    /// Whether this pass released the HTTP client.
    pub transport_released: bool,
}

/// Finishes open cards and releases shared resources when the channel stops.
pub struct ShutdownCoordinator {
    dispatcher: Arc<DeliveryDispatcher>,
    tasks: TaskPool,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(dispatcher: Arc<DeliveryDispatcher>, tasks: TaskPool, timeout: Duration) -> Self {
        Self {
            dispatcher,
            tasks,
            timeout,
        }
    }

    /// Finish every open card (bounded by the timeout), release the HTTP
    /// client and cancel background tasks.
    ///
    /// Each conversation is finished independently, so a slot held by a
    /// delivery still in flight only delays its own card. Whatever is left
    /// when the timeout fires stays with that delivery, which fails fast
    /// once the transport is closed.
    ///
    /// Running it twice is harmless; the second pass finds nothing to do.
    pub async fn shutdown(&self) -> ShutdownReport {
        let registry = self.dispatcher.registry();
        let lifecycle = self.dispatcher.lifecycle();
        let taken = AtomicUsize::new(0);
        let mut report = ShutdownReport::default();

        let pending = registry.keys().into_iter().map(|key| {
            let taken = &taken;
            async move {
                let mut slot = registry.lock(&key).await;
                let Some(mut card) = slot.take() else {
                    return;
                };
                taken.fetch_add(1, Ordering::Relaxed);
                info!("dingtalk: finishing card {} for {key} on shutdown", card.id());
                lifecycle.finish(&mut card).await;
            }
        });

        if tokio::time::timeout(self.timeout, join_all(pending))
            .await
            .is_err()
        {
            report.timed_out = true;
            warn!(
                "dingtalk: card finalization exceeded {}s, {} conversation(s) still busy",
                self.timeout.as_secs_f32(),
                registry.slot_count()
            );
        }
        report.open_cards = taken.load(Ordering::Relaxed);

        report.transport_released = lifecycle.api().close();
        self.tasks.cancel_all();
        info!(
            "dingtalk: shutdown complete ({} open card(s), {} task(s) cancelled)",
            report.open_cards,
            self.tasks.len()
        );
        report
    }
}
