use thiserror::Error;

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Reasons a hostname is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostnameError {
    #[error("hostname is empty")]
    Empty,
    #[error("hostname exceeds 253 characters")]
    TooLong,
    #[error("hostname must contain at least two labels")]
    SingleLabel,
    #[error("hostname label '{0}' is invalid")]
    InvalidLabel(String),
    #[error("ip literals cannot be mapped")]
    IpLiteral,
}

/// Normalizes a raw `Host` value: trims, strips the port and a trailing dot,
/// and lowercases. Bracketed IPv6 literals keep their brackets.
pub fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim();

    let without_port = if let Some(rest) = trimmed.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &trimmed[..end + 2],
            None => trimmed,
        }
    } else {
        match trimmed.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => trimmed,
        }
    };

    without_port
        .strip_suffix('.')
        .unwrap_or(without_port)
        .to_ascii_lowercase()
}

/// Normalizes and validates a domain submitted for mapping.
pub fn parse_domain(raw: &str) -> Result<String, HostnameError> {
    let normalized = normalize_host(raw);
    validate_hostname(&normalized)?;
    Ok(normalized)
}

/// Checks hostname syntax on an already normalized value.
pub fn validate_hostname(host: &str) -> Result<(), HostnameError> {
    if host.is_empty() {
        return Err(HostnameError::Empty);
    }
    if host.len() > MAX_HOSTNAME_LEN {
        return Err(HostnameError::TooLong);
    }
    if host.starts_with('[') || host.parse::<std::net::IpAddr>().is_ok() {
        return Err(HostnameError::IpLiteral);
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return Err(HostnameError::SingleLabel);
    }

    for label in &labels {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid {
            return Err(HostnameError::InvalidLabel(label.to_string()));
        }
    }

    if let Some(tld) = labels.last() {
        if tld.chars().all(|c| c.is_ascii_digit()) {
            return Err(HostnameError::InvalidLabel(tld.to_string()));
        }
    }

    Ok(())
}

/// Prefixes stripped from request hosts before a second lookup, e.g. `www.`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasTable {
    prefixes: Vec<String>,
}

impl AliasTable {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|prefix| prefix.into().to_ascii_lowercase())
                .filter(|prefix| !prefix.is_empty())
                .collect(),
        }
    }

    /// Returns the host with the first matching alias prefix removed, if any
    /// matched and something meaningful remains.
    pub fn strip<'a>(&self, host: &'a str) -> Option<&'a str> {
        self.prefixes.iter().find_map(|prefix| {
            host.strip_prefix(prefix.as_str())
                .filter(|rest| rest.contains('.'))
        })
    }

    /// Lookup candidates in order: the host itself, then its alias-stripped form.
    pub fn candidates<'a>(&self, host: &'a str) -> Vec<&'a str> {
        let mut candidates = vec![host];
        if let Some(stripped) = self.strip(host) {
            candidates.push(stripped);
        }
        candidates
    }
}
