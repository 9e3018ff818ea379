//! Column Normalizer - makes ingested header names safe for the bronze table

/// Replace every space with an underscore. Nothing else changes.
pub fn normalize_column(name: &str) -> String {
    name.replace(' ', "_")
}

pub fn normalize_columns<S: AsRef<str>>(columns: &[S]) -> Vec<String> {
    columns
        .iter()
        .map(|c| normalize_column(c.as_ref()))
        .collect()
}
