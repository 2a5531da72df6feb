//! Domain types shared by the storage layer and the application: mapped
//! domains, verification stages, the activation record and hostname rules.

pub mod activation;
pub mod hostname;
pub mod types;
pub mod verification;

pub use activation::{ActivationRecord, TapMode};
pub use types::{CurrentSite, Domain, DomainId, DomainStage, SiteId, SiteSource};
