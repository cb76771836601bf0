//! Authoritative in-memory quota record.
//!
//! - Every operation runs under one lock and either commits a full transition or
//!   nothing
//! - Committed states are published on a `watch` channel (scheduler + UI) and
//!   queued to a single writer task, so durable writes land in commit order
//! - Storage faults never reach callers: reads fall back to the default state,
//!   failed writes are logged and superseded by the next commit

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::Config,
    domain::{Mode, QuotaRecord, QuotaState},
    ports::KeyValueStore,
};

/// Constants the store needs from configuration.
#[derive(Clone, Debug)]
pub struct QuotaSettings {
    pub initial_balance: u32,
    pub cooldown: chrono::Duration,
    pub state_key: String,
}

impl From<&Config> for QuotaSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            initial_balance: cfg.initial_balance,
            cooldown: cfg.cooldown_chrono(),
            state_key: cfg.state_key.clone(),
        }
    }
}

/// Read-only copy of the quota state, as seen by observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub balance: u32,
    pub mode: Mode,
    pub recharge_deadline: Option<DateTime<Utc>>,
}

impl QuotaSnapshot {
    pub fn is_recharging(&self) -> bool {
        self.mode == Mode::Recharging
    }

    pub fn remaining_cooldown(&self, now: DateTime<Utc>) -> Duration {
        self.recharge_deadline
            .and_then(|deadline| (deadline - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

impl From<&QuotaState> for QuotaSnapshot {
    fn from(st: &QuotaState) -> Self {
        Self {
            balance: st.balance(),
            mode: st.mode(),
            recharge_deadline: st.recharge_deadline(),
        }
    }
}

enum PersistCommand {
    Write(QuotaRecord),
    Flush(oneshot::Sender<()>),
}

/// Shared handle to the process-wide quota record.
///
/// Create it once with [`QuotaStore::load`] and pass clones to every consumer.
#[derive(Clone)]
pub struct QuotaStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    settings: QuotaSettings,
    clock: Arc<dyn Clock>,
    state: Mutex<QuotaState>,
    updates: watch::Sender<QuotaSnapshot>,
    writes: mpsc::UnboundedSender<PersistCommand>,
}

impl QuotaStore {
    /// Restore the record from `kv`, or start fully charged.
    ///
    /// A cooldown that already ran out while the process was down is settled
    /// here, before the handle is returned. Must be called inside a tokio
    /// runtime (the persistence writer is spawned onto it).
    ///
    /// A non-positive `settings.cooldown` is raised to one millisecond so a
    /// deadline always lies strictly after the depletion that set it.
    pub async fn load(
        mut settings: QuotaSettings,
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let min_cooldown = chrono::Duration::milliseconds(1);
        if settings.cooldown < min_cooldown {
            warn!(
                cooldown_ms = settings.cooldown.num_milliseconds(),
                "quota cooldown must be positive; using 1ms"
            );
            settings.cooldown = min_cooldown;
        }

        let now = clock.now();
        let stored = read_record(kv.as_ref(), &settings.state_key).await;

        let restored = stored.and_then(|record| {
            let state = record.into_state(now, settings.cooldown);
            if state.is_none() {
                warn!(key = %settings.state_key, ?record, "discarding inconsistent quota record");
            }
            state
        });

        let mut state = match restored {
            Some(state) => state,
            None => {
                info!(
                    initial = settings.initial_balance,
                    "no usable quota record; starting fully charged"
                );
                QuotaState::full(settings.initial_balance)
            }
        };

        if state.reconcile(now, settings.initial_balance) {
            info!(
                balance = state.balance(),
                "cooldown elapsed while offline; quota refilled"
            );
        }

        let needs_write = stored != Some(QuotaRecord::from(&state));

        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_loop(kv, settings.state_key.clone(), rx));
        let (updates, _) = watch::channel(QuotaSnapshot::from(&state));

        let store = Self {
            inner: Arc::new(StoreInner {
                settings,
                clock,
                state: Mutex::new(state),
                updates,
                writes,
            }),
        };

        if needs_write {
            store.enqueue_write(&state);
        }

        debug!(
            balance = state.balance(),
            mode = ?state.mode(),
            "quota store loaded"
        );
        store
    }

    /// Spend `amount` units before a metered action. `false` must block it.
    pub fn consume(&self, amount: u32) -> bool {
        let now = self.now();
        let cooldown = self.inner.settings.cooldown;

        let mut st = self.lock_state();
        if !st.consume(amount, now, cooldown) {
            debug!(amount, balance = st.balance(), "quota consume rejected");
            return false;
        }
        if let Some(deadline) = st.recharge_deadline() {
            info!(%deadline, "quota exhausted; recharging");
        }
        self.commit(&st);
        true
    }

    /// Additive top-up (purchase, promotion, refresh). Cancels a running
    /// cooldown. Returns `false` for a zero amount.
    pub fn grant(&self, amount: u32) -> bool {
        let mut st = self.lock_state();
        let was_recharging = st.is_recharging();
        if !st.grant(amount) {
            return false;
        }
        info!(
            amount,
            balance = st.balance(),
            cancelled_cooldown = was_recharging,
            "quota granted"
        );
        self.commit(&st);
        true
    }

    /// Absolute reset of the balance. Cancels a running cooldown; a reset to
    /// zero starts a fresh one.
    pub fn force_reset(&self, target_balance: u32) {
        let now = self.now();
        let cooldown = self.inner.settings.cooldown;

        let mut st = self.lock_state();
        st.force_reset(target_balance, now, cooldown);
        info!(
            balance = target_balance,
            deadline = ?st.recharge_deadline(),
            "quota reset"
        );
        self.commit(&st);
    }

    /// Refill if the cooldown has run out by `now`. Idempotent: returns `true`
    /// only for the call that performed the refill.
    pub fn reconcile(&self, now: DateTime<Utc>) -> bool {
        let mut st = self.lock_state();
        if !st.reconcile(now, self.inner.settings.initial_balance) {
            return false;
        }
        info!(balance = st.balance(), "cooldown elapsed; quota refilled");
        self.commit(&st);
        true
    }

    /// Time left until the refill. Reads the last published snapshot, so it
    /// never waits on a mutation in progress.
    pub fn remaining_cooldown(&self, now: DateTime<Utc>) -> Duration {
        self.snapshot().remaining_cooldown(now)
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        *self.inner.updates.borrow()
    }

    /// Observe every committed state.
    pub fn subscribe(&self) -> watch::Receiver<QuotaSnapshot> {
        self.inner.updates.subscribe()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Wait until every write queued so far has been attempted.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.inner.writes.send(PersistCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QuotaState> {
        // Transitions never panic mid-update, so a poisoned guard still holds a
        // consistent state.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish + queue a write. Called with the state lock held so both the
    /// watch value and the write queue follow commit order.
    fn commit(&self, st: &QuotaState) {
        self.inner.updates.send_replace(QuotaSnapshot::from(st));
        self.enqueue_write(st);
    }

    fn enqueue_write(&self, st: &QuotaState) {
        let record = QuotaRecord::from(st);
        if self.inner.writes.send(PersistCommand::Write(record)).is_err() {
            warn!("quota persistence writer has stopped; state kept in memory only");
        }
    }
}

async fn read_record(kv: &dyn KeyValueStore, key: &str) -> Option<QuotaRecord> {
    let raw = match kv.get(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(key, error = %e, "failed to read quota record; using defaults");
            return None;
        }
    };

    match serde_json::from_str::<QuotaRecord>(&raw) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(key, error = %e, "corrupt quota record; using defaults");
            None
        }
    }
}

async fn persist_loop(
    kv: Arc<dyn KeyValueStore>,
    key: String,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            PersistCommand::Write(record) => {
                let txt = match serde_json::to_string(&record) {
                    Ok(txt) => txt,
                    Err(e) => {
                        warn!(key = %key, error = %e, "failed to encode quota record");
                        continue;
                    }
                };
                if let Err(e) = kv.set(&key, txt).await {
                    warn!(
                        key = %key,
                        error = %e,
                        "failed to persist quota record; next change will retry"
                    );
                }
            }
            PersistCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, ports::MemoryKv, Error, Result};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const KEY: &str = "quota_state";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap()
    }

    fn settings() -> QuotaSettings {
        QuotaSettings {
            initial_balance: 10,
            cooldown: chrono::Duration::hours(12),
            state_key: KEY.to_string(),
        }
    }

    async fn fresh(kv: Arc<MemoryKv>, clock: Arc<ManualClock>) -> QuotaStore {
        QuotaStore::load(settings(), kv, clock).await
    }

    fn stored(kv: &MemoryKv) -> QuotaRecord {
        serde_json::from_str(&kv.snapshot(KEY).unwrap()).unwrap()
    }

    #[derive(Default)]
    struct FlakyKv {
        inner: MemoryKv,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl KeyValueStore for FlakyKv {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Error::Storage {
                    key: key.to_string(),
                    reason: "disk on fire".to_string(),
                });
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::Storage {
                    key: key.to_string(),
                    reason: "read-only filesystem".to_string(),
                });
            }
            self.inner.set(key, value).await
        }
    }

    #[tokio::test]
    async fn exhausting_quota_starts_cooldown_and_blocks() {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let store = fresh(kv.clone(), clock.clone()).await;

        for _ in 0..10 {
            assert!(store.consume(1));
        }
        let snap = store.snapshot();
        assert_eq!(snap.balance, 0);
        assert_eq!(snap.mode, Mode::Recharging);
        assert_eq!(snap.recharge_deadline, Some(t0() + chrono::Duration::hours(12)));

        clock.advance(chrono::Duration::hours(1));
        assert!(!store.consume(1));
        assert_eq!(store.snapshot().balance, 0);
        assert_eq!(
            store.remaining_cooldown(store.now()),
            Duration::from_secs(11 * 3600)
        );

        store.flush().await;
        assert_eq!(
            stored(&kv),
            QuotaRecord {
                balance: 0,
                recharge_deadline: Some((t0() + chrono::Duration::hours(12)).timestamp_millis()),
            }
        );
    }

    #[tokio::test]
    async fn reconcile_after_deadline_refills_once() {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let store = fresh(kv.clone(), clock).await;
        assert!(store.consume(10));

        let deadline = t0() + chrono::Duration::hours(12);
        assert!(!store.reconcile(deadline - chrono::Duration::seconds(1)));
        assert!(store.snapshot().is_recharging());

        assert!(store.reconcile(deadline + chrono::Duration::milliseconds(1)));
        let snap = store.snapshot();
        assert_eq!(snap.balance, 10);
        assert_eq!(snap.mode, Mode::Normal);
        assert_eq!(snap.recharge_deadline, None);

        assert!(!store.reconcile(deadline + chrono::Duration::hours(5)));
        assert_eq!(store.snapshot().balance, 10);

        store.flush().await;
        assert_eq!(stored(&kv), QuotaRecord::from(&QuotaState::full(10)));
    }

    #[tokio::test]
    async fn restart_after_expired_cooldown_loads_refilled() {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));
        {
            let store = fresh(kv.clone(), clock.clone()).await;
            for _ in 0..10 {
                store.consume(1);
            }
            store.flush().await;
        }

        clock.advance(chrono::Duration::hours(13));
        let store = fresh(kv.clone(), clock).await;
        let snap = store.snapshot();
        assert_eq!(snap.balance, 10);
        assert_eq!(snap.mode, Mode::Normal);

        store.flush().await;
        assert_eq!(stored(&kv).recharge_deadline, None);
    }

    #[tokio::test]
    async fn restart_preserves_state_round_trip() {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));

        let first = fresh(kv.clone(), clock.clone()).await;
        first.consume(4);
        first.flush().await;
        let second = fresh(kv.clone(), clock.clone()).await;
        assert_eq!(second.snapshot(), first.snapshot());

        second.consume(6);
        second.flush().await;
        clock.advance(chrono::Duration::hours(2));
        let third = fresh(kv.clone(), clock).await;
        assert_eq!(third.snapshot(), second.snapshot());
        assert!(third.snapshot().is_recharging());
    }

    #[tokio::test]
    async fn grant_while_recharging_is_immediately_consumable() {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let store = fresh(kv.clone(), clock).await;
        store.consume(10);

        assert!(store.grant(5));
        let snap = store.snapshot();
        assert_eq!(snap.balance, 5);
        assert_eq!(snap.mode, Mode::Normal);
        assert_eq!(snap.recharge_deadline, None);
        assert!(store.consume(1));

        // A late tick after the grant must not refill again.
        assert!(!store.reconcile(t0() + chrono::Duration::days(1)));
        assert_eq!(store.snapshot().balance, 4);
    }

    #[tokio::test]
    async fn invalid_amounts_are_rejected_without_writes() {
        let kv = Arc::new(FlakyKv::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let store = QuotaStore::load(settings(), kv.clone(), clock).await;
        store.flush().await;
        let writes_after_load = kv.writes.load(Ordering::SeqCst);

        assert!(!store.consume(0));
        assert!(!store.grant(0));
        assert!(!store.consume(11));
        store.flush().await;

        assert_eq!(store.snapshot().balance, 10);
        assert_eq!(kv.writes.load(Ordering::SeqCst), writes_after_load);
    }

    #[tokio::test]
    async fn force_reset_sets_absolute_balance() {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let store = fresh(kv.clone(), clock).await;
        store.consume(10);

        store.force_reset(3);
        assert_eq!(store.snapshot().balance, 3);
        assert_eq!(store.snapshot().mode, Mode::Normal);

        store.force_reset(20);
        assert_eq!(store.snapshot().balance, 20);
        store.flush().await;
        assert_eq!(stored(&kv).balance, 20);
    }

    #[tokio::test]
    async fn reset_to_zero_recharges_after_cooldown() {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let store = fresh(kv.clone(), clock.clone()).await;

        store.force_reset(0);
        let snap = store.snapshot();
        assert_eq!(snap.balance, 0);
        assert_eq!(snap.mode, Mode::Recharging);
        assert_eq!(snap.recharge_deadline, Some(t0() + chrono::Duration::hours(12)));
        assert!(!store.consume(1));

        clock.advance(chrono::Duration::days(30));
        assert!(store.reconcile(store.now()));
        assert_eq!(store.snapshot().balance, 10);
        assert!(store.consume(1));

        store.flush().await;
        assert_eq!(stored(&kv), QuotaRecord::from(&QuotaState::full(9)));
    }

    #[tokio::test]
    async fn empty_record_without_deadline_loads_recharging() {
        let kv = Arc::new(MemoryKv::new());
        kv.set(KEY, r#"{"balance":0}"#.to_string()).await.unwrap();
        let clock = Arc::new(ManualClock::new(t0()));

        let store = fresh(kv.clone(), clock).await;
        let deadline = t0() + chrono::Duration::hours(12);
        assert_eq!(store.snapshot().recharge_deadline, Some(deadline));

        store.flush().await;
        assert_eq!(
            stored(&kv).recharge_deadline,
            Some(deadline.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn zero_cooldown_still_sets_a_future_deadline() {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let store = QuotaStore::load(
            QuotaSettings {
                cooldown: chrono::Duration::zero(),
                ..settings()
            },
            kv,
            clock.clone(),
        )
        .await;

        assert!(store.consume(10));
        let deadline = store.snapshot().recharge_deadline.unwrap();
        assert!(deadline > t0());
        assert!(!store.reconcile(t0()));

        clock.advance(chrono::Duration::milliseconds(1));
        assert!(store.reconcile(store.now()));
        assert_eq!(store.snapshot().balance, 10);
    }

    #[tokio::test]
    async fn corrupt_record_is_replaced_with_default() {
        let kv = Arc::new(MemoryKv::new());
        kv.set(KEY, "{not json".to_string()).await.unwrap();
        let clock = Arc::new(ManualClock::new(t0()));

        let store = fresh(kv.clone(), clock).await;
        assert_eq!(store.snapshot().balance, 10);
        assert_eq!(store.snapshot().mode, Mode::Normal);

        store.flush().await;
        assert_eq!(stored(&kv), QuotaRecord::from(&QuotaState::full(10)));
    }

    #[tokio::test]
    async fn inconsistent_record_is_replaced_with_default() {
        let kv = Arc::new(MemoryKv::new());
        let deadline = (t0() + chrono::Duration::hours(1)).timestamp_millis();
        kv.set(KEY, format!(r#"{{"balance":3,"rechargeDeadline":{deadline}}}"#))
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(t0()));

        let store = fresh(kv, clock).await;
        assert_eq!(store.snapshot(), QuotaSnapshot::from(&QuotaState::full(10)));
    }

    #[tokio::test]
    async fn storage_faults_never_block_consumers() {
        let kv = Arc::new(FlakyKv::default());
        kv.fail_reads.store(true, Ordering::SeqCst);
        kv.fail_writes.store(true, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::new(t0()));

        let store = QuotaStore::load(settings(), kv.clone(), clock).await;
        assert_eq!(store.snapshot().balance, 10);
        assert!(store.consume(1));
        store.flush().await;
        assert_eq!(store.snapshot().balance, 9);
        assert_eq!(kv.inner.snapshot(KEY), None);

        // Durability catches up on the next successful write.
        kv.fail_writes.store(false, Ordering::SeqCst);
        assert!(store.consume(1));
        store.flush().await;
        assert_eq!(stored(&kv.inner).balance, 8);
    }

    #[tokio::test]
    async fn subscribers_see_each_commit() {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let store = fresh(kv, clock).await;
        let mut rx = store.subscribe();

        store.consume(10);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_recharging());

        store.consume(1); // rejected, nothing published
        assert!(!rx.has_changed().unwrap());

        store.grant(2);
        assert_eq!(rx.borrow_and_update().balance, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumers_never_overspend() {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let store = fresh(kv.clone(), clock).await;
        store.force_reset(100);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut won = 0u32;
                for _ in 0..50 {
                    if store.consume(1) {
                        won += 1;
                    }
                    tokio::task::yield_now().await;
                }
                won
            }));
        }

        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 100);
        assert_eq!(store.snapshot().balance, 0);
        assert!(store.snapshot().is_recharging());

        store.flush().await;
        assert_eq!(stored(&kv).balance, 0);
    }
}
