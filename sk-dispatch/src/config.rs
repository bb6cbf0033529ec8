//! JSON bindings file parsing.
//!
//! `load-bindings` replaces the active bindings with the contents of a
//! JSON file. Each entry expands to a TCP and a UDP binding with a
//! wildcard port, which is the common shape for fronting a service on
//! every port of a prefix.

use std::path::Path;

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::Deserialize;

use crate::binding::{Binding, Protocol};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingsFile {
    pub bindings: Vec<BindingEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingEntry {
    pub label: String,
    pub prefix: IpNet,
}

impl BindingsFile {
    /// Load and parse a bindings file. Unknown fields are rejected so a
    /// typo can't silently drop configuration.
    pub fn load(path: &Path) -> Result<BindingsFile> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))
    }

    /// Expand every entry into its TCP and UDP wildcard-port bindings.
    pub fn to_bindings(&self) -> Vec<Binding> {
        self.bindings
            .iter()
            .flat_map(|entry| {
                [
                    Binding::new(&entry.label, Protocol::Tcp, entry.prefix, 0),
                    Binding::new(&entry.label, Protocol::Udp, entry.prefix, 0),
                ]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_expands() {
        let file: BindingsFile = serde_json::from_str(
            r#"{"bindings":[{"label":"foo","prefix":"127.0.0.1/32"}]}"#,
        )
        .unwrap();

        let bindings = file.to_bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(
            bindings[0],
            Binding::new("foo", Protocol::Tcp, "127.0.0.1/32".parse().unwrap(), 0)
        );
        assert_eq!(
            bindings[1],
            Binding::new("foo", Protocol::Udp, "127.0.0.1/32".parse().unwrap(), 0)
        );
    }

    #[test]
    fn prefixes_are_masked_on_expansion() {
        let file: BindingsFile = serde_json::from_str(
            r#"{"bindings":[{"label":"foo","prefix":"192.0.2.77/24"}]}"#,
        )
        .unwrap();

        let bindings = file.to_bindings();
        assert_eq!(bindings[0].prefix.to_string(), "192.0.2.0/24");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = serde_json::from_str::<BindingsFile>(
            r#"{"bindings":[{"label":"foo","prefix":"127.0.0.1/32","port":80}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("port"));

        assert!(serde_json::from_str::<BindingsFile>(
            r#"{"bindings":[],"extra":true}"#
        )
        .is_err());
    }

    #[test]
    fn rejects_invalid_prefix() {
        assert!(serde_json::from_str::<BindingsFile>(
            r#"{"bindings":[{"label":"foo","prefix":"not-a-prefix"}]}"#
        )
        .is_err());
    }

    #[test]
    fn empty_file_means_remove_everything() {
        let file: BindingsFile = serde_json::from_str(r#"{"bindings":[]}"#).unwrap();
        assert!(file.to_bindings().is_empty());
    }
}
