//! Host identity → backend variant.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::BackendDescriptor;
use crate::error::OrchestrationError;

/// One prioritized resolution rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRule {
    /// Regex matched against the host identity string.
    pub pattern: String,
    pub backend: BackendDescriptor,
}

/// Ordered pattern list mapping host identities to backends.
///
/// First match wins; no match falls back to [`BackendDescriptor::LocalPool`].
#[derive(Debug, Clone)]
pub struct BackendResolver {
    rules: Vec<(Regex, BackendDescriptor)>,
}

impl BackendResolver {
    pub fn new(rules: &[BackendRule]) -> Result<Self, OrchestrationError> {
        let compiled = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|re| (re, rule.backend))
                    .map_err(|e| {
                        OrchestrationError::Configuration(format!(
                            "invalid backend pattern {:?}: {}",
                            rule.pattern, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules: compiled })
    }

    pub fn resolve(&self, host_identity: &str) -> BackendDescriptor {
        let resolved = self
            .rules
            .iter()
            .find(|(re, _)| re.is_match(host_identity))
            .map(|(_, backend)| *backend)
            .unwrap_or_default();
        tracing::debug!(host = host_identity, backend = %resolved, "Resolved backend");
        resolved
    }
}
