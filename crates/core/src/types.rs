use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a tenant site owned by the host framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub i64);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a mapped domain row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(pub i64);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Verification stage of a mapped domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStage {
    Pending,
    Checking,
    Success,
    Error,
}

impl DomainStage {
    /// Returns the canonical database representation for the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Checking => "checking",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Parses the database representation. Unknown values are `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "checking" => Some(Self::Checking),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// `true` once a verification run has reached a verdict.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

impl fmt::Display for DomainStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A custom domain mapped onto a tenant site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub domain: String,
    pub site_id: SiteId,
    pub is_primary: bool,
    /// Promotion sequence; the highest ranked primary of a site is authoritative.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_rank: Option<i64>,
    pub stage: DomainStage,
    pub is_secure: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Site resolved for the current request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentSite {
    pub site_id: SiteId,
    pub host: String,
    pub source: SiteSource,
}

/// Where the current site came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SiteSource {
    /// The host framework's own resolution.
    Network,
    /// A mapped custom domain overrode the host framework.
    Mapped { domain_id: DomainId },
}
