use std::sync::Arc;

use tracing::info;

use crate::{
    clock::Clock,
    config::Config,
    ports::KeyValueStore,
    scheduler::RechargeScheduler,
    store::{QuotaSettings, QuotaStore},
};

/// Store + scheduler wired together for an application process.
///
/// Build it once at startup and hand `store()` clones to anything that spends
/// or displays quota.
pub struct QuotaRuntime {
    store: QuotaStore,
    scheduler: RechargeScheduler,
}

impl QuotaRuntime {
    pub async fn start(cfg: &Config, kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let store = QuotaStore::load(QuotaSettings::from(cfg), kv, clock).await;
        let scheduler = RechargeScheduler::new(store.clone(), cfg.tick_interval);
        scheduler.start().await;

        let snap = store.snapshot();
        info!(
            balance = snap.balance,
            mode = ?snap.mode,
            "quota runtime started"
        );

        Self { store, scheduler }
    }

    pub fn store(&self) -> &QuotaStore {
        &self.store
    }

    pub fn scheduler(&self) -> &RechargeScheduler {
        &self.scheduler
    }

    /// Stop the timer, then wait for queued writes to land.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.store.flush().await;
        info!("quota runtime stopped");
    }
}
