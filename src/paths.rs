//! Path Deriver - landing, bronze, checkpoint and schema locations per dataset
//!
//! Layout under the base path:
//! `{base}landing/ocde/{id}` and `{base}bronze/ocde/{id}[/checkpoint/|/schema/]`

use crate::dataset::DatasetId;
use crate::error::{IngestError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref URI_SCHEME: Regex = Regex::new(r"^([A-Za-z][A-Za-z0-9+.\-]*)://").unwrap();
}

const DOMAIN: &str = "ocde";

/// Root location every dataset path is namespaced under. Always ends with `/`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BasePath(String);

impl BasePath {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IngestError::Config("base path is empty".to_string()));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(IngestError::Config(format!(
                "base path '{}' contains whitespace",
                trimmed
            )));
        }
        if let Some(caps) = URI_SCHEME.captures(trimmed) {
            if trimmed.len() == caps[0].len() {
                return Err(IngestError::Config(format!(
                    "base path '{}' has a scheme but no location",
                    trimmed
                )));
            }
        }

        let mut base = trimmed.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self(base))
    }

    /// URI scheme, or `None` for a bare filesystem path
    pub fn scheme(&self) -> Option<&str> {
        URI_SCHEME
            .captures(&self.0)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BasePath {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self> {
        BasePath::parse(&value)
    }
}

impl From<BasePath> for String {
    fn from(base: BasePath) -> Self {
        base.0
    }
}

impl fmt::Display for BasePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The four locations one dataset reads from and writes to
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DatasetPaths {
    /// Where raw CSV files arrive
    pub landing: String,
    /// Destination table
    pub bronze: String,
    /// Durable ingestion progress
    pub checkpoint: String,
    /// Inferred schema cache
    pub schema: String,
}

impl DatasetPaths {
    pub fn derive(base: &BasePath, id: &DatasetId) -> Self {
        let bronze = format!("{}bronze/{}/{}", base.as_str(), DOMAIN, id.as_str());
        Self {
            landing: format!("{}landing/{}/{}", base.as_str(), DOMAIN, id.as_str()),
            checkpoint: format!("{}/checkpoint/", bronze),
            schema: format!("{}/schema/", bronze),
            bronze,
        }
    }
}

/// Ordered mapping from dataset to its derived paths
#[derive(Clone, Debug, Default)]
pub struct PathPlan {
    entries: Vec<(DatasetId, DatasetPaths)>,
}

impl PathPlan {
    pub fn new(base: &BasePath, datasets: &[DatasetId]) -> Self {
        Self {
            entries: datasets
                .iter()
                .map(|id| (id.clone(), DatasetPaths::derive(base, id)))
                .collect(),
        }
    }

    pub fn get(&self, id: &DatasetId) -> Option<&DatasetPaths> {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate == id)
            .map(|(_, paths)| paths)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DatasetId, &DatasetPaths)> {
        self.entries.iter().map(|(id, paths)| (id, paths))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BasePath {
        BasePath::parse("abfss://tfm@lake.dfs.core.windows.net/").unwrap()
    }

    #[test]
    fn test_derive_naming_scheme() {
        let id = DatasetId::parse("GDP_Constant_Price_Annual").unwrap();
        let paths = DatasetPaths::derive(&base(), &id);

        assert_eq!(
            paths.landing,
            "abfss://tfm@lake.dfs.core.windows.net/landing/ocde/GDP_Constant_Price_Annual"
        );
        assert_eq!(
            paths.bronze,
            "abfss://tfm@lake.dfs.core.windows.net/bronze/ocde/GDP_Constant_Price_Annual"
        );
        assert_eq!(paths.checkpoint, format!("{}/checkpoint/", paths.bronze));
        assert_eq!(paths.schema, format!("{}/schema/", paths.bronze));
    }

    #[test]
    fn test_paths_are_distinct_and_contain_id_once() {
        for id in DatasetId::ocde_defaults() {
            let paths = DatasetPaths::derive(&base(), &id);
            let all = [&paths.landing, &paths.bronze, &paths.checkpoint, &paths.schema];
            for (i, a) in all.iter().enumerate() {
                assert_eq!(a.matches(id.as_str()).count(), 1, "{}", a);
                for b in all.iter().skip(i + 1) {
                    assert_ne!(a, b);
                }
            }
        }
    }

    #[test]
    fn test_derive_is_deterministic() {
        let id = DatasetId::parse("GDP_Current_Price_Annual").unwrap();
        assert_eq!(
            DatasetPaths::derive(&base(), &id),
            DatasetPaths::derive(&base(), &id)
        );
    }

    #[test]
    fn test_base_path_normalization() {
        assert_eq!(BasePath::parse("/data/lake").unwrap().as_str(), "/data/lake/");
        assert_eq!(BasePath::parse(" /data/lake/ ").unwrap().as_str(), "/data/lake/");
        assert!(BasePath::parse("").is_err());
        assert!(BasePath::parse("   ").is_err());
        assert!(BasePath::parse("file://").is_err());
        assert!(BasePath::parse("/data/my lake").is_err());
    }

    #[test]
    fn test_scheme_detection() {
        assert_eq!(base().scheme(), Some("abfss"));
        assert_eq!(BasePath::parse("file:///tmp/lake").unwrap().scheme(), Some("file"));
        assert_eq!(BasePath::parse("/tmp/lake").unwrap().scheme(), None);
    }

    #[test]
    fn test_path_plan_preserves_order() {
        let ids = DatasetId::ocde_defaults();
        let plan = PathPlan::new(&base(), &ids);
        assert_eq!(plan.len(), 4);
        let order: Vec<&DatasetId> = plan.iter().map(|(id, _)| id).collect();
        assert_eq!(order, ids.iter().collect::<Vec<_>>());
        assert!(plan.get(&ids[2]).unwrap().bronze.ends_with(ids[2].as_str()));
    }
}
