//! Engine version descriptors.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// URL sentinel for a module bundled with the host.
pub const EMBEDDED_SENTINEL: &str = "embedded";

/// File name of the bundled module.
pub const EMBEDDED_FILE_NAME: &str = "embedded.wasm";

/// Upper bound on `next` hops followed when walking an upgrade chain.
pub const MAX_UPGRADE_CHAIN: usize = 16;

/// A released module version as reported by a module or persisted by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineVersion {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<EngineVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
}

impl EngineVersion {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            sha: String::new(),
            url: url.into(),
            next: None,
            release_date: None,
        }
    }

    /// Descriptor of the bundled module.
    pub fn embedded() -> Self {
        Self::new(EMBEDDED_SENTINEL, EMBEDDED_SENTINEL, EMBEDDED_SENTINEL)
    }

    /// Descriptor of the bundled module at a concrete location.
    pub fn embedded_at(path: &Path) -> Self {
        Self::new(
            EMBEDDED_SENTINEL,
            EMBEDDED_SENTINEL,
            path.to_string_lossy().to_string(),
        )
    }

    pub fn with_next(mut self, next: EngineVersion) -> Self {
        self.next = Some(Box::new(next));
        self
    }

    /// Bundled versions never need a network download.
    ///
    /// The sentinel id marks the bundle wherever `embedded_at` placed it.
    pub fn is_embedded(&self) -> bool {
        self.id == EMBEDDED_SENTINEL
            || self.url == EMBEDDED_SENTINEL
            || self.url.ends_with(EMBEDDED_FILE_NAME)
    }

    /// Walk `self → next → …`, stopping after [`MAX_UPGRADE_CHAIN`] hops or
    /// at the first id seen twice. Module-reported chains can repeat ids.
    pub fn upgrade_chain(&self) -> Vec<&EngineVersion> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(self);

        while let Some(version) = current {
            if chain.len() >= MAX_UPGRADE_CHAIN || !seen.insert(version.id.as_str()) {
                tracing::warn!(
                    version = %self.id,
                    hops = chain.len(),
                    "upgrade chain truncated"
                );
                break;
            }
            chain.push(version);
            current = version.next.as_deref();
        }

        chain
    }

    /// Newest version reachable through the upgrade chain.
    pub fn latest(&self) -> &EngineVersion {
        self.upgrade_chain().last().copied().unwrap_or(self)
    }
}
