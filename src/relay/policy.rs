//! Admission policy checked before any network I/O or rate accounting

use hyper::header::HeaderName;
use tracing::debug;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::models::RequestContext;

/// Validates a relay request against the configured URL and header policy
#[derive(Debug, Clone)]
pub struct PolicyGate {
    blocked_phrases: Vec<String>,
    required_headers: Vec<HeaderName>,
}

impl PolicyGate {
    pub fn new(blocked_phrases: Vec<String>, required_headers: &[String]) -> Self {
        let required_headers = required_headers
            .iter()
            .filter_map(|h| HeaderName::from_bytes(h.to_lowercase().as_bytes()).ok())
            .collect();

        Self {
            blocked_phrases,
            required_headers,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.blocked_phrases.clone(), &config.required_headers)
    }

    /// Allow the request, or reject it with the reason.
    pub fn validate(&self, ctx: &RequestContext) -> Result<()> {
        if let Some(phrase) = self
            .blocked_phrases
            .iter()
            .find(|phrase| ctx.target_url.contains(phrase.as_str()))
        {
            debug!(target_url = %ctx.target_url, phrase = %phrase, "Rejected disallowed URL");
            return Err(RelayError::DisallowedContent);
        }

        // An empty requirement list admits everything. Blank values count as missing.
        if !self.required_headers.is_empty()
            && !self.required_headers.iter().any(|name| {
                ctx.headers
                    .get_all(name)
                    .iter()
                    .any(|value| !value.as_bytes().iter().all(u8::is_ascii_whitespace))
            })
        {
            debug!(target_url = %ctx.target_url, "Rejected request without origin header");
            return Err(RelayError::MissingOrigin);
        }

        Ok(())
    }
}
