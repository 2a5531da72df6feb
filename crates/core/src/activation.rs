use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle event reported by the host framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapMode {
    Activating,
    Deactivating,
}

impl TapMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activating => "activating",
            Self::Deactivating => "deactivating",
        }
    }

    /// Mode that brings the record in line with the given loaded state.
    pub fn for_loaded(loaded: bool) -> Self {
        if loaded {
            Self::Activating
        } else {
            Self::Deactivating
        }
    }

    fn target_active(self) -> bool {
        matches!(self, Self::Activating)
    }
}

impl fmt::Display for TapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tap mode '{0}'")]
pub struct UnknownTapMode(pub String);

impl FromStr for TapMode {
    type Err = UnknownTapMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "activating" => Ok(Self::Activating),
            "deactivating" => Ok(Self::Deactivating),
            other => Err(UnknownTapMode(other.to_string())),
        }
    }
}

/// Durable record of whether domain resolution is wired in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub active: bool,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub last_activated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_deactivated: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
}

impl ActivationRecord {
    /// Record assumed when nothing has been persisted yet.
    pub fn absent(now: DateTime<Utc>) -> Self {
        Self {
            active: false,
            created: now,
            last_activated: None,
            last_deactivated: None,
            last_modified: now,
        }
    }

    /// Returns the record after applying `mode`, or `None` when already in
    /// the target state.
    pub fn tapped(&self, mode: TapMode, now: DateTime<Utc>) -> Option<Self> {
        if self.active == mode.target_active() {
            return None;
        }

        let mut next = self.clone();
        next.active = mode.target_active();
        match mode {
            TapMode::Activating => next.last_activated = Some(now),
            TapMode::Deactivating => next.last_deactivated = Some(now),
        }
        next.last_modified = now;
        Some(next)
    }
}
