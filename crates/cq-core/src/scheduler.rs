//! Recharge scheduler.
//!
//! One background task follows the store's state channel:
//! - Idle while the quota is usable (no timer, just waiting for a change)
//! - Armed while a cooldown runs: ticks every `tick_interval` and asks the
//!   store to reconcile against the clock
//! - Back to Idle on the first tick that refills the quota or finds the
//!   cooldown already cleared by a grant/reset
//!
//! Ticks go through `QuotaStore::reconcile`, i.e. the same lock as consumers.

use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::store::QuotaStore;

/// Lifecycle of the scheduler's timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Armed,
}

#[derive(Clone)]
pub struct RechargeScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: QuotaStore,
    tick_interval: Duration,
    phase: watch::Sender<Phase>,
    state: tokio::sync::Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    task: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

enum ArmedExit {
    Settled,
    Cancelled,
}

impl RechargeScheduler {
    pub fn new(store: QuotaStore, tick_interval: Duration) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                tick_interval,
                phase,
                state: tokio::sync::Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Start following the store, if not already running.
    ///
    /// A store restored in the middle of a cooldown arms the timer right away.
    pub async fn start(&self) {
        let mut st = self.inner.state.lock().await;
        if st.task.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        st.cancel = Some(cancel.clone());
        let scheduler = self.clone();
        st.task = Some(tokio::spawn(async move {
            scheduler.run(cancel).await;
        }));
        debug!(
            tick_ms = self.inner.tick_interval.as_millis() as u64,
            "recharge scheduler started"
        );
    }

    /// Cancel the timer and wait for the task to exit. Idempotent.
    pub async fn stop(&self) {
        let (cancel, task) = {
            let mut st = self.inner.state.lock().await;
            (st.cancel.take(), st.task.take())
        };

        if let Some(tok) = cancel {
            tok.cancel();
        }
        if let Some(handle) = task {
            let _ = handle.await;
            debug!("recharge scheduler stopped");
        }
        self.set_phase(Phase::Idle);
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase.subscribe()
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut updates = self.inner.store.subscribe();

        loop {
            let recharging = updates.borrow_and_update().is_recharging();
            if !recharging {
                self.set_phase(Phase::Idle);
                tokio::select! {
                  _ = cancel.cancelled() => break,
                  changed = updates.changed() => {
                    if changed.is_err() {
                      break;
                    }
                    continue;
                  }
                }
            }

            self.set_phase(Phase::Armed);
            match self.tick_until_settled(&cancel).await {
                ArmedExit::Settled => continue,
                ArmedExit::Cancelled => break,
            }
        }

        self.set_phase(Phase::Idle);
    }

    async fn tick_until_settled(&self, cancel: &CancellationToken) -> ArmedExit {
        let store = &self.inner.store;
        let mut tick = tokio::time::interval(self.inner.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Some(deadline) = store.snapshot().recharge_deadline {
            debug!(%deadline, "recharge timer armed");
        }

        loop {
            tokio::select! {
              _ = cancel.cancelled() => return ArmedExit::Cancelled,
              _ = tick.tick() => {
                if store.reconcile(store.now()) {
                  info!("recharge timer fired");
                  return ArmedExit::Settled;
                }
                if !store.snapshot().is_recharging() {
                  debug!("cooldown cleared before deadline; disarming");
                  return ArmedExit::Settled;
                }
              }
            }
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.inner.phase.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            *current = phase;
            true
        });
    }
}
