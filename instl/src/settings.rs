// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Persistent defaults loaded through the vendor/admin layered config
//! crate, grounded on `moss::repository::Map`'s `impl Config` and on
//! `config::Manager::system`'s `(root, program)` construction.

use serde::{Deserialize, Serialize};

use config::Config;

/// Domain name this engine registers its config file under, replacing
/// the teacher's own `"moss"` program name.
pub const PROGRAM: &str = "instl";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct InstlConfig {
    /// Repository base URL, overridable by `--base-url`.
    pub base_url: Option<String>,
    /// Download worker pool size, overridable by [`crate::download::Config`].
    pub download_workers: Option<usize>,
    /// Max retries per download.
    pub download_max_retries: Option<u32>,
    /// Require a valid `index.yaml.sig` signature before trusting a
    /// synced remote file map.
    #[serde(default)]
    pub verify_signature: bool,
}

impl Config for InstlConfig {
    fn domain() -> String {
        PROGRAM.into()
    }

    fn merge(self, other: Self) -> Self {
        Self {
            base_url: other.base_url.or(self.base_url),
            download_workers: other.download_workers.or(self.download_workers),
            download_max_retries: other.download_max_retries.or(self.download_max_retries),
            verify_signature: other.verify_signature || self.verify_signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_admin_layer_when_present() {
        let vendor = InstlConfig {
            base_url: Some("https://vendor.example/repo".into()),
            download_workers: Some(4),
            ..Default::default()
        };
        let admin = InstlConfig {
            base_url: Some("https://admin.example/repo".into()),
            ..Default::default()
        };

        let merged = vendor.merge(admin);
        assert_eq!(merged.base_url.as_deref(), Some("https://admin.example/repo"));
        assert_eq!(merged.download_workers, Some(4));
    }
}
