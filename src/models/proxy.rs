use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{RelayError, Result};

/// One upstream-facing proxy and its cooldown bookkeeping
#[derive(Debug, Clone)]
pub struct ProxyEntry {
    address: Arc<str>,
    uses_since_cooldown: u32,
    available_at: Instant,
}

impl ProxyEntry {
    pub fn new(address: impl Into<Arc<str>>, now: Instant) -> Self {
        Self {
            address: address.into(),
            uses_since_cooldown: 0,
            available_at: now,
        }
    }

    pub fn address(&self) -> &Arc<str> {
        &self.address
    }

    pub fn uses_since_cooldown(&self) -> u32 {
        self.uses_since_cooldown
    }

    pub fn available_at(&self) -> Instant {
        self.available_at
    }

    pub fn is_available(&self, now: Instant) -> bool {
        self.available_at <= now
    }

    /// Record one use; enters cooldown once `quota` uses have accumulated.
    ///
    /// Returns true when this use started a cooldown.
    pub fn mark_used(&mut self, now: Instant, quota: u32, cooldown: Duration) -> bool {
        self.uses_since_cooldown += 1;

        if self.uses_since_cooldown >= quota {
            self.available_at = now + cooldown;
            self.uses_since_cooldown = 0;
            return true;
        }

        false
    }
}

/// Outcome of asking a proxy selector for the next proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySelection {
    /// Use this proxy for the request
    Selected(Arc<str>),
    /// Every proxy is cooling down; the earliest frees up after `wait`
    AllBusy { wait: Duration },
}

impl ProxySelection {
    pub fn is_selected(&self) -> bool {
        matches!(self, ProxySelection::Selected(_))
    }
}

impl fmt::Display for ProxySelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxySelection::Selected(address) => write!(f, "{}", address),
            ProxySelection::AllBusy { wait } => write!(f, "busy for {} ms", wait.as_millis()),
        }
    }
}

/// Parse a newline-delimited proxy list.
///
/// Blank lines are skipped and surrounding whitespace is trimmed. Addresses
/// without a scheme are treated as plain HTTP proxies.
pub fn parse_proxy_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            if line.contains("://") {
                line.to_string()
            } else {
                format!("http://{}", line)
            }
        })
        .collect()
}

/// Load a proxy list from disk; a missing or empty list is a startup error.
pub fn load_proxy_list(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        RelayError::InvalidConfig(format!(
            "Proxies are enabled, but proxy list {} cannot be read: {}",
            path.display(),
            e
        ))
    })?;

    let proxies = parse_proxy_list(&contents);
    if proxies.is_empty() {
        return Err(RelayError::InvalidConfig(format!(
            "Proxies are enabled, but proxy list {} is empty",
            path.display()
        )));
    }

    Ok(proxies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_proxy_list_trims_and_skips_blank_lines() {
        let list = "  10.0.0.1:8080 \r\n\n\t\nsocks5://10.0.0.2:1080\n   \n";
        assert_eq!(
            parse_proxy_list(list),
            vec![
                "http://10.0.0.1:8080".to_string(),
                "socks5://10.0.0.2:1080".to_string()
            ]
        );
    }

    #[test]
    fn test_load_proxy_list_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_proxy_list(&dir.path().join("missing.txt")).unwrap_err();
        assert!(matches!(err, RelayError::InvalidConfig(_)));
    }

    #[test]
    fn test_load_proxy_list_rejects_empty_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "\n   \n").unwrap();

        let err = load_proxy_list(file.path()).unwrap_err();
        assert!(matches!(err, RelayError::InvalidConfig(_)));
    }

    #[test]
    fn test_load_proxy_list_reads_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "http://a.example:3128\nb.example:3128").unwrap();

        let proxies = load_proxy_list(file.path()).unwrap();
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[1], "http://b.example:3128");
    }

    #[test]
    fn test_mark_used_enters_cooldown_at_quota() {
        let now = Instant::now();
        let mut entry = ProxyEntry::new("http://a.example:3128", now);

        assert!(!entry.mark_used(now, 2, Duration::from_secs(60)));
        assert_eq!(entry.uses_since_cooldown(), 1);
        assert!(entry.is_available(now));

        assert!(entry.mark_used(now, 2, Duration::from_secs(60)));
        assert_eq!(entry.uses_since_cooldown(), 0);
        assert!(!entry.is_available(now));
        assert!(entry.is_available(now + Duration::from_secs(60)));
    }
}
