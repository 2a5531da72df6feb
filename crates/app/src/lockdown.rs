use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

use hostmap_storage::{OptionsError, OptionsRepository};

use crate::Clock;

pub const LOCKDOWN_OPTION: &str = "hostmap_lockdown";
/// Query parameter carrying the rotating escape key.
pub const ESCAPE_PARAM: &str = "hostmap_unlock";

const KEY_WINDOW_SECS: i64 = 3600;
const KEY_HEX_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockdownState {
    pub enabled: bool,
    pub changed_at: DateTime<Utc>,
}

/// Emergency switch that hides every extension except the platform's own.
#[derive(Clone)]
pub struct LockdownSwitch {
    options: OptionsRepository,
    secret: Arc<[u8]>,
    clock: Clock,
}

impl LockdownSwitch {
    pub fn new(options: OptionsRepository, secret: impl AsRef<[u8]>, clock: Clock) -> Self {
        Self {
            options,
            secret: Arc::from(secret.as_ref()),
            clock,
        }
    }

    /// Persists the flag. Returns `true` when the stored value changed.
    pub async fn toggle(&self, on: bool) -> Result<bool, LockdownError> {
        let mut tx = self.options.begin().await?;
        let current: Option<LockdownState> = self.options.get_in(&mut tx, LOCKDOWN_OPTION).await?;
        if current.is_some_and(|state| state.enabled) == on {
            tx.rollback().await.map_err(OptionsError::from)?;
            return Ok(false);
        }

        let state = LockdownState {
            enabled: on,
            changed_at: (self.clock)(),
        };
        self.options
            .put_in(&mut tx, LOCKDOWN_OPTION, &state, state.changed_at)
            .await?;
        tx.commit().await.map_err(OptionsError::from)?;
        info!(stage = "lockdown", enabled = on, "lockdown toggled");
        Ok(true)
    }

    pub async fn is_enabled(&self) -> Result<bool, LockdownError> {
        let state: Option<LockdownState> = self.options.get(LOCKDOWN_OPTION).await?;
        Ok(state.is_some_and(|state| state.enabled))
    }

    fn key_for_window(&self, window: i64) -> Result<String, LockdownError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|_| LockdownError::Key)?;
        mac.update(window.to_string().as_bytes());
        let mut key = hex::encode(mac.finalize().into_bytes());
        key.truncate(KEY_HEX_LEN);
        Ok(key)
    }

    /// Escape key valid during the hour containing `now`.
    pub fn current_key(&self, now: DateTime<Utc>) -> Result<String, LockdownError> {
        self.key_for_window(now.timestamp().div_euclid(KEY_WINDOW_SECS))
    }

    /// Key for the window containing the switch's own "now".
    pub fn escape_key(&self) -> Result<String, LockdownError> {
        self.current_key((self.clock)())
    }

    /// Accepts the key of the current or the previous hour window.
    pub fn verify_key(&self, provided: &str, now: DateTime<Utc>) -> bool {
        let window = now.timestamp().div_euclid(KEY_WINDOW_SECS);
        [window, window - 1].into_iter().any(|window| {
            self.key_for_window(window)
                .map(|expected| bool::from(expected.as_bytes().ct_eq(provided.as_bytes())))
                .unwrap_or(false)
        })
    }

    /// Disables lockdown when `provided` is a valid escape key.
    pub async fn try_escape(&self, provided: &str) -> Result<bool, LockdownError> {
        if !self.verify_key(provided, (self.clock)()) {
            counter!("lockdown_escape_total", "result" => "rejected").increment(1);
            warn!(stage = "lockdown", "escape key rejected");
            return Ok(false);
        }
        self.toggle(false).await?;
        counter!("lockdown_escape_total", "result" => "unlocked").increment(1);
        info!(stage = "lockdown", "lockdown lifted via escape key");
        Ok(true)
    }
}

#[derive(Debug, Error)]
pub enum LockdownError {
    #[error("lockdown flag unavailable: {0}")]
    PersistenceUnavailable(#[from] OptionsError),
    #[error("failed to initialize escape key")]
    Key,
}

/// Decides which extensions load for a request.
#[derive(Clone)]
pub struct ExtensionLoader {
    registered: Vec<String>,
    platform: String,
    lockdown: Option<LockdownSwitch>,
}

impl ExtensionLoader {
    pub fn new(registered: Vec<String>, platform: impl Into<String>) -> Self {
        Self {
            registered,
            platform: platform.into(),
            lockdown: None,
        }
    }

    pub fn with_lockdown(mut self, lockdown: LockdownSwitch) -> Self {
        self.lockdown = Some(lockdown);
        self
    }

    /// Extensions to load. Only the platform's own while lockdown is on; an
    /// unreadable flag counts as off.
    pub async fn active_extensions(&self) -> Vec<String> {
        let locked = match &self.lockdown {
            Some(switch) => switch.is_enabled().await.unwrap_or_else(|err| {
                warn!(stage = "lockdown", error = %err, "lockdown flag unreadable");
                false
            }),
            None => false,
        };

        if locked {
            return self
                .registered
                .iter()
                .filter(|name| **name == self.platform)
                .cloned()
                .collect();
        }
        self.registered.clone()
    }
}
