//! Dataset identifiers - the declarative list that drives the ingestion loop

use crate::error::{IngestError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref DATASET_ID: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").unwrap();
}

/// The OCDE GDP series ingested by default
pub const OCDE_DATASETS: [&str; 4] = [
    "GDP_Constant_Price_Annual",
    "GDP_Current_Price_Annual",
    "GDP_PerCapita_Constant_Prices_Annual",
    "GDP_PerCapita_Current_Prices_Annual",
];

/// Name of one dataset. Used verbatim as a path segment, so construction
/// rejects anything that is not safe inside a single segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetId(String);

impl DatasetId {
    pub fn parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !DATASET_ID.is_match(&name) {
            return Err(IngestError::Config(format!(
                "invalid dataset identifier '{}': expected letters, digits, '_', '.' or '-'",
                name
            )));
        }
        Ok(Self(name))
    }

    /// The four OCDE datasets, in ingestion order
    pub fn ocde_defaults() -> Vec<DatasetId> {
        OCDE_DATASETS
            .iter()
            .map(|name| DatasetId((*name).to_string()))
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DatasetId {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self> {
        DatasetId::parse(value)
    }
}

impl From<DatasetId> for String {
    fn from(id: DatasetId) -> Self {
        id.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
