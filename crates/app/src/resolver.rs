use axum::http::{header::HOST, HeaderMap};
use metrics::counter;
use tracing::{debug, warn};

use hostmap_core::{hostname::normalize_host, hostname::AliasTable, CurrentSite, SiteSource};
use hostmap_storage::DomainRepository;

pub const FORWARDED_HOST: &str = "x-forwarded-host";

/// Maps request hosts onto tenant sites via the domain table.
#[derive(Clone)]
pub struct HostResolver {
    domains: DomainRepository,
    aliases: AliasTable,
}

impl HostResolver {
    pub fn new(domains: DomainRepository, aliases: AliasTable) -> Self {
        Self { domains, aliases }
    }

    /// Looks up the normalized host, then its alias-stripped form. Returns
    /// `None` on a miss or when storage is unavailable so the caller falls
    /// back to the host framework's own resolution.
    pub async fn resolve(&self, host: &str) -> Option<CurrentSite> {
        for candidate in self.aliases.candidates(host) {
            match self.domains.find_by_domain(candidate).await {
                Ok(Some(domain)) => {
                    let result = if candidate == host { "hit" } else { "alias_hit" };
                    counter!("domain_resolve_total", "result" => result).increment(1);
                    debug!(stage = "resolver", %host, site_id = %domain.site_id, domain_id = %domain.id, "host mapped");
                    return Some(CurrentSite {
                        site_id: domain.site_id,
                        host: host.to_string(),
                        source: SiteSource::Mapped {
                            domain_id: domain.id,
                        },
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    counter!("domain_resolve_total", "result" => "error").increment(1);
                    warn!(stage = "resolver", %host, error = %err, "domain lookup failed, falling through");
                    return None;
                }
            }
        }

        counter!("domain_resolve_total", "result" => "miss").increment(1);
        None
    }
}

/// Pulls the request host out of the headers and normalizes it.
/// `X-Forwarded-Host` wins when `trust_forwarded` is set.
pub fn extract_host(headers: &HeaderMap, trust_forwarded: bool) -> Option<String> {
    let forwarded = trust_forwarded
        .then(|| headers.get(FORWARDED_HOST))
        .flatten()
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next());

    let raw = forwarded.or_else(|| headers.get(HOST).and_then(|value| value.to_str().ok()))?;
    let host = normalize_host(raw);
    (!host.is_empty()).then_some(host)
}
