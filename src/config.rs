//! Configuration - storage credential, base path and the dataset list
//!
//! Everything here is resolved once at startup and handed explicitly to the
//! engine and the driver. Nothing touches storage before `StorageConfig::validate`
//! has succeeded.

use crate::dataset::DatasetId;
use crate::error::{IngestError, Result};
use crate::paths::BasePath;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Account key for the storage the base path lives on
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageCredential {
    pub account: Option<String>,
    pub key: String,
}

impl fmt::Debug for StorageCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredential")
            .field("account", &self.account)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Storage access settings shared by every dataset in a run
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub base_path: BasePath,
    pub credential: Option<StorageCredential>,
}

impl StorageConfig {
    pub fn new(base_path: BasePath, credential: Option<StorageCredential>) -> Self {
        Self {
            base_path,
            credential,
        }
    }

    /// Fails when the credential is absent or blank.
    pub fn validate(&self) -> Result<&StorageCredential> {
        let credential = self.credential.as_ref().ok_or_else(|| {
            IngestError::Config("storage account key is not configured".to_string())
        })?;
        if credential.key.trim().is_empty() {
            return Err(IngestError::Config(
                "storage account key is blank".to_string(),
            ));
        }
        if let Some(account) = &credential.account {
            if account.trim().is_empty() {
                return Err(IngestError::Config(
                    "storage account name is blank".to_string(),
                ));
            }
        }
        Ok(credential)
    }
}

/// What to do when one dataset fails
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the loop at the failing dataset
    #[default]
    FailFast,
    /// Keep going and report every failure at the end
    ContinueOnError,
}

/// Optional JSON config file. Every field can also come from the CLI or env.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestFileConfig {
    pub base_path: Option<String>,
    pub storage_account: Option<String>,
    pub datasets: Option<Vec<DatasetId>>,
    pub failure_policy: Option<FailurePolicy>,
    pub display_rows: Option<usize>,
}

impl IngestFileConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("cannot read config file {:?}: {}", path, e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            IngestError::Config(format!("invalid config file {:?}: {}", path, e))
        })
    }
}

/// Fully resolved settings for one process run
#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub storage: StorageConfig,
    pub datasets: Vec<DatasetId>,
    pub failure_policy: FailurePolicy,
    pub display_rows: usize,
}

impl IngestConfig {
    pub const DEFAULT_DISPLAY_ROWS: usize = 20;

    pub fn new(storage: StorageConfig) -> Self {
        Self {
            storage,
            datasets: DatasetId::ocde_defaults(),
            failure_policy: FailurePolicy::default(),
            display_rows: Self::DEFAULT_DISPLAY_ROWS,
        }
    }

    pub fn with_datasets(mut self, datasets: Vec<DatasetId>) -> Self {
        self.datasets = datasets;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_display_rows(mut self, rows: usize) -> Self {
        self.display_rows = rows;
        self
    }

    /// Merge explicit overrides on top of a config file. Overrides win.
    pub fn resolve(
        file: IngestFileConfig,
        base_path: Option<String>,
        account: Option<String>,
        key: Option<String>,
        failure_policy: Option<FailurePolicy>,
    ) -> Result<Self> {
        let raw_base = base_path.or(file.base_path).ok_or_else(|| {
            IngestError::Config("base path is not configured".to_string())
        })?;
        let base_path = BasePath::parse(&raw_base)?;

        let credential = key.map(|key| StorageCredential {
            account: account.or(file.storage_account),
            key,
        });

        let datasets = match file.datasets {
            Some(list) if list.is_empty() => {
                return Err(IngestError::Config(
                    "dataset list in config file is empty".to_string(),
                ))
            }
            Some(list) => list,
            None => DatasetId::ocde_defaults(),
        };

        Ok(Self {
            storage: StorageConfig::new(base_path, credential),
            datasets,
            failure_policy: failure_policy
                .or(file.failure_policy)
                .unwrap_or_default(),
            display_rows: file.display_rows.unwrap_or(Self::DEFAULT_DISPLAY_ROWS),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(key: &str) -> Option<StorageCredential> {
        Some(StorageCredential {
            account: Some("tfmlake".to_string()),
            key: key.to_string(),
        })
    }

    #[test]
    fn test_missing_or_blank_key_is_rejected() {
        let base = BasePath::parse("/tmp/lake").unwrap();
        assert!(StorageConfig::new(base.clone(), None).validate().is_err());
        assert!(StorageConfig::new(base.clone(), credential("  ")).validate().is_err());
        assert!(StorageConfig::new(base, credential("c2VjcmV0")).validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", credential("c2VjcmV0").unwrap());
        assert!(!rendered.contains("c2VjcmV0"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_resolve_prefers_overrides() {
        let file = IngestFileConfig {
            base_path: Some("/from/file".to_string()),
            storage_account: Some("fileaccount".to_string()),
            datasets: Some(vec![DatasetId::parse("GDP_Current_Price_Annual").unwrap()]),
            failure_policy: Some(FailurePolicy::ContinueOnError),
            display_rows: Some(5),
        };
        let config = IngestConfig::resolve(
            file,
            Some("/from/cli".to_string()),
            None,
            Some("key".to_string()),
            Some(FailurePolicy::FailFast),
        )
        .unwrap();

        assert_eq!(config.storage.base_path.as_str(), "/from/cli/");
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.datasets.len(), 1);
        assert_eq!(config.display_rows, 5);
        let credential = config.storage.credential.unwrap();
        assert_eq!(credential.account.as_deref(), Some("fileaccount"));
    }

    #[test]
    fn test_resolve_defaults() {
        let config = IngestConfig::resolve(
            IngestFileConfig::default(),
            Some("/lake".to_string()),
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(config.datasets, DatasetId::ocde_defaults());
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert!(config.storage.credential.is_none());
    }

    #[test]
    fn test_resolve_requires_base_path() {
        let err = IngestConfig::resolve(IngestFileConfig::default(), None, None, None, None);
        assert!(matches!(err, Err(IngestError::Config(_))));
    }

    #[test]
    fn test_file_config_parses_policy() {
        let parsed: IngestFileConfig = serde_json::from_str(
            r#"{"base_path": "/lake", "failure_policy": "continue_on_error",
                "datasets": ["GDP_Constant_Price_Annual"]}"#,
        )
        .unwrap();
        assert_eq!(parsed.failure_policy, Some(FailurePolicy::ContinueOnError));
        assert!(serde_json::from_str::<IngestFileConfig>(r#"{"datasets": ["a/b"]}"#).is_err());
    }
}
