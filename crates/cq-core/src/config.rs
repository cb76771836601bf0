use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

const DEFAULT_INITIAL_BALANCE: u32 = 10;
const DEFAULT_COOLDOWN_SECS: u64 = 12 * 60 * 60;
const DEFAULT_TICK_MS: u64 = 1000;
const DEFAULT_REFRESH_BONUS: u32 = 5;

/// Typed configuration for the quota gate.
#[derive(Clone, Debug)]
pub struct Config {
    // Quota
    pub initial_balance: u32,
    pub cooldown: Duration,
    pub refresh_bonus: u32,

    // Recharge scheduler
    pub tick_interval: Duration,

    // Persistence
    pub state_dir: PathBuf,
    pub state_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_balance: DEFAULT_INITIAL_BALANCE,
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            refresh_bonus: DEFAULT_REFRESH_BONUS,
            tick_interval: Duration::from_millis(DEFAULT_TICK_MS),
            state_dir: PathBuf::from("/tmp/chat-quota"),
            state_key: "quota_state".to_string(),
        }
    }
}

impl Config {
    /// Load from `.env` (if present) and the process environment.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let initial_balance =
            parse_var::<u32>(&lookup, "QUOTA_INITIAL_BALANCE")?.unwrap_or(defaults.initial_balance);
        if initial_balance == 0 {
            return Err(Error::Config(
                "QUOTA_INITIAL_BALANCE must be greater than zero".to_string(),
            ));
        }

        let cooldown = parse_var::<u64>(&lookup, "QUOTA_COOLDOWN_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.cooldown);
        if cooldown.is_zero() {
            return Err(Error::Config(
                "QUOTA_COOLDOWN_SECS must be greater than zero".to_string(),
            ));
        }
        // The store keeps the cooldown as a chrono duration.
        if chrono::Duration::from_std(cooldown).is_err() {
            return Err(Error::Config(format!(
                "QUOTA_COOLDOWN_SECS out of range: {}",
                cooldown.as_secs()
            )));
        }

        let tick_interval = parse_var::<u64>(&lookup, "QUOTA_TICK_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.tick_interval);
        if tick_interval.is_zero() {
            return Err(Error::Config(
                "QUOTA_TICK_MS must be greater than zero".to_string(),
            ));
        }

        let refresh_bonus =
            parse_var::<u32>(&lookup, "QUOTA_REFRESH_BONUS")?.unwrap_or(defaults.refresh_bonus);
        if refresh_bonus == 0 {
            return Err(Error::Config(
                "QUOTA_REFRESH_BONUS must be greater than zero".to_string(),
            ));
        }

        let state_dir = lookup("QUOTA_STATE_DIR")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);
        let state_key = lookup("QUOTA_STATE_KEY")
            .and_then(non_empty)
            .unwrap_or(defaults.state_key);
        if !is_valid_key(&state_key) {
            return Err(Error::Config(format!(
                "QUOTA_STATE_KEY may only contain [A-Za-z0-9_-]: {state_key}"
            )));
        }

        Ok(Self {
            initial_balance,
            cooldown,
            refresh_bonus,
            tick_interval,
            state_dir,
            state_key,
        })
    }

    pub fn cooldown_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.cooldown).unwrap_or(chrono::Duration::MAX)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = lookup(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} is not a valid number: {raw}")))
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
