//! Quota state machine.
//!
//! Every transition here is pure: callers supply the current time and the
//! configured constants, and the state either changes completely or not at all.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Whether the quota is usable or waiting out a cooldown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    Recharging,
}

/// The single quota record.
///
/// `mode` is derived from the presence of the recharge deadline, so the two
/// can never disagree. The fields are private: the only way to change them is
/// through the transitions below, each of which keeps `balance == 0` while a
/// deadline is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaState {
    balance: u32,
    recharge_deadline: Option<DateTime<Utc>>,
}

impl QuotaState {
    /// A fresh, fully charged state.
    pub fn full(initial_balance: u32) -> Self {
        Self {
            balance: initial_balance,
            recharge_deadline: None,
        }
    }

    pub fn balance(&self) -> u32 {
        self.balance
    }

    pub fn recharge_deadline(&self) -> Option<DateTime<Utc>> {
        self.recharge_deadline
    }

    pub fn mode(&self) -> Mode {
        if self.recharge_deadline.is_some() {
            Mode::Recharging
        } else {
            Mode::Normal
        }
    }

    pub fn is_recharging(&self) -> bool {
        self.mode() == Mode::Recharging
    }

    /// Spend `amount` units. Returns `false` (and leaves the state untouched)
    /// when `amount` is zero or the balance cannot cover it.
    ///
    /// Draining the balance to zero from `Normal` starts the cooldown.
    pub fn consume(
        &mut self,
        amount: u32,
        now: DateTime<Utc>,
        cooldown: chrono::Duration,
    ) -> bool {
        if amount == 0 || self.balance < amount {
            return false;
        }

        self.balance -= amount;
        if self.balance == 0 && self.mode() == Mode::Normal {
            self.recharge_deadline = Some(now + cooldown);
        }
        true
    }

    /// Add `amount` units and cancel any cooldown in progress.
    pub fn grant(&mut self, amount: u32) -> bool {
        if amount == 0 {
            return false;
        }
        self.balance = self.balance.saturating_add(amount);
        self.recharge_deadline = None;
        true
    }

    /// Overwrite the balance and cancel any cooldown in progress.
    ///
    /// Resetting to zero counts as a depletion: a fresh cooldown starts at
    /// `now`, so the quota still refills on its own.
    pub fn force_reset(
        &mut self,
        target_balance: u32,
        now: DateTime<Utc>,
        cooldown: chrono::Duration,
    ) {
        self.balance = target_balance;
        self.recharge_deadline = if target_balance == 0 {
            Some(now + cooldown)
        } else {
            None
        };
    }

    /// Refill to `initial_balance` once the deadline has passed.
    ///
    /// Returns `true` only for the call that performed the refill; every later
    /// call (and any call outside a cooldown) is a no-op.
    pub fn reconcile(&mut self, now: DateTime<Utc>, initial_balance: u32) -> bool {
        match self.recharge_deadline {
            Some(deadline) if now >= deadline => {
                self.balance = initial_balance;
                self.recharge_deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Time left until the refill, zero outside a cooldown or once overdue.
    pub fn remaining_cooldown(&self, now: DateTime<Utc>) -> Duration {
        self.recharge_deadline
            .and_then(|deadline| (deadline - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

/// On-disk shape of [`QuotaState`].
///
/// ```json
/// { "balance": 3, "rechargeDeadline": 1767268800000 }
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecord {
    pub balance: u32,
    /// Epoch milliseconds.
    #[serde(default)]
    pub recharge_deadline: Option<i64>,
}

impl From<&QuotaState> for QuotaRecord {
    fn from(state: &QuotaState) -> Self {
        Self {
            balance: state.balance,
            recharge_deadline: state.recharge_deadline.map(|d| d.timestamp_millis()),
        }
    }
}

impl QuotaRecord {
    /// Rebuild a state from a stored record.
    ///
    /// Returns `None` for records no transition could have produced (a
    /// deadline alongside a non-zero balance, or an unrepresentable
    /// timestamp). A deadline further out than one full cooldown from `now`
    /// means the wall clock moved backwards; it is pulled in to `now + cooldown`.
    /// An empty balance without a deadline starts a cooldown at `now`.
    pub fn into_state(
        self,
        now: DateTime<Utc>,
        cooldown: chrono::Duration,
    ) -> Option<QuotaState> {
        let recharge_deadline = match self.recharge_deadline {
            None if self.balance == 0 => Some(now + cooldown),
            None => None,
            Some(_) if self.balance != 0 => return None,
            Some(ms) => {
                let deadline = Utc.timestamp_millis_opt(ms).single()?;
                Some(deadline.min(now + cooldown))
            }
        };

        Some(QuotaState {
            balance: self.balance,
            recharge_deadline,
        })
    }
}
