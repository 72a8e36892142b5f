// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared configuration loading for the ledger watcher and the simulator CLI.
//!
//! Files ending in `.yaml`/`.yml` are parsed as YAML, everything else as JSON.
//! Saving always writes pretty-printed JSON.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

pub trait Config: Serialize + DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("parsing yaml config {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("parsing json config {}", path.display()))?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("writing config file {}", path.display()))?;
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    struct Sample {
        rpc_url: String,
        required_confirmations: u64,
    }

    impl Config for Sample {}

    #[test]
    fn test_load_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("node.yaml");
        std::fs::write(
            &yaml_path,
            "rpc-url: http://localhost:8545\nrequired-confirmations: 6\n",
        )
        .unwrap();
        let yaml = Sample::load(&yaml_path).unwrap();
        assert_eq!(yaml.required_confirmations, 6);

        let json_path = dir.path().join("node.json");
        std::fs::write(
            &json_path,
            r#"{"rpc-url":"http://localhost:8545","required-confirmations":12}"#,
        )
        .unwrap();
        let json = Sample::load(&json_path).unwrap();
        assert_eq!(json.rpc_url, "http://localhost:8545");
        assert_eq!(json.required_confirmations, 12);
    }

    #[test]
    fn test_saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let sample = Sample {
            rpc_url: "http://node".to_string(),
            required_confirmations: 1,
        };
        sample.save(&path).unwrap();
        assert_eq!(Sample::load(&path).unwrap(), sample);
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let err = Sample::load("/definitely/not/here.yaml").unwrap_err();
        assert!(format!("{:#}", err).contains("/definitely/not/here.yaml"));
    }
}
