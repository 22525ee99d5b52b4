//! Soup and index specifications.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How an indexed path is projected and stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    String,
    Integer,
    Floating,
    FullText,
    /// Indexed through an expression index on `json_extract`, no column.
    Json1,
}

impl IndexType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::String => "string",
            IndexType::Integer => "integer",
            IndexType::Floating => "floating",
            IndexType::FullText => "full_text",
            IndexType::Json1 => "json1",
        }
    }

    /// SQL type of the projected column, `None` for expression indexes.
    pub fn column_type(&self) -> Option<&'static str> {
        match self {
            IndexType::String | IndexType::FullText => Some("TEXT"),
            IndexType::Integer => Some("INTEGER"),
            IndexType::Floating => Some("REAL"),
            IndexType::Json1 => None,
        }
    }

    pub fn has_column(&self) -> bool {
        self.column_type().is_some()
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(IndexType::String),
            "integer" => Ok(IndexType::Integer),
            "floating" => Ok(IndexType::Floating),
            "full_text" => Ok(IndexType::FullText),
            "json1" => Ok(IndexType::Json1),
            other => Err(Error::InvalidOperation(format!("unknown index type: {}", other))),
        }
    }
}

/// A queryable projection of a document path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub path: String,
    #[serde(rename = "type")]
    pub index_type: IndexType,
    pub column_name: Option<String>,
}

impl IndexSpec {
    pub fn new(path: &str, index_type: IndexType) -> Self {
        Self {
            path: path.to_string(),
            index_type,
            column_name: None,
        }
    }

    pub(crate) fn with_column(path: &str, index_type: IndexType, column_name: Option<String>) -> Self {
        Self {
            path: path.to_string(),
            index_type,
            column_name,
        }
    }

    /// `path|type`, the identity used when diffing index sets.
    pub fn path_type(&self) -> String {
        format!("{}|{}", self.path, self.index_type)
    }

    /// Parses `path:type`, as accepted on the command line.
    pub fn parse(text: &str) -> Result<Self> {
        let (path, index_type) = text
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidOperation(format!("expected path:type, got {}", text)))?;
        Ok(Self::new(path, index_type.parse()?))
    }
}

pub(crate) fn has_full_text(specs: &[IndexSpec]) -> bool {
    specs.iter().any(|s| s.index_type == IndexType::FullText)
}

pub(crate) fn has_json1(specs: &[IndexSpec]) -> bool {
    specs.iter().any(|s| s.index_type == IndexType::Json1)
}

/// Rejects empty or duplicate-path index lists.
pub(crate) fn validate_index_specs(soup_name: &str, specs: &[IndexSpec]) -> Result<()> {
    if specs.is_empty() {
        return Err(Error::InvalidOperation(format!("no index specs given for soup {}", soup_name)));
    }
    let mut seen = HashSet::new();
    for spec in specs {
        if spec.path.is_empty() {
            return Err(Error::InvalidOperation(format!("empty index path for soup {}", soup_name)));
        }
        if !seen.insert(spec.path.as_str()) {
            return Err(Error::InvalidOperation(format!(
                "duplicate index path {} for soup {}",
                spec.path, soup_name
            )));
        }
    }
    Ok(())
}

/// Optional per-soup behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SoupFeature {
    /// Store document bodies in the encrypted blob store instead of in-row.
    #[serde(rename = "externalStorage")]
    ExternalStorage,
}

/// The soup metadata needed to (re)create a soup's table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoupSpec {
    pub soup_name: String,
    pub features: Vec<SoupFeature>,
}

impl SoupSpec {
    pub fn new(soup_name: &str) -> Self {
        Self {
            soup_name: soup_name.to_string(),
            features: Vec::new(),
        }
    }

    pub fn with_features(soup_name: &str, features: &[SoupFeature]) -> Self {
        let mut spec = Self::new(soup_name);
        for feature in features {
            if !spec.features.contains(feature) {
                spec.features.push(*feature);
            }
        }
        spec
    }

    pub fn uses_external_storage(&self) -> bool {
        self.features.contains(&SoupFeature::ExternalStorage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_spec_serialization() {
        let spec = IndexSpec::with_column("a.b", IndexType::FullText, Some("TABLE_1_0".to_string()));
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json, serde_json::json!({"path": "a.b", "type": "full_text", "columnName": "TABLE_1_0"}));
        let back: IndexSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_parse() {
        let spec = IndexSpec::parse("address.city:string").unwrap();
        assert_eq!(spec, IndexSpec::new("address.city", IndexType::String));
        assert!(IndexSpec::parse("nocolon").is_err());
        assert!(IndexSpec::parse("a:blob").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(validate_index_specs("s", &[]).is_err());
        let dup = [IndexSpec::new("a", IndexType::String), IndexSpec::new("a", IndexType::Integer)];
        assert!(validate_index_specs("s", &dup).is_err());
        let ok = [IndexSpec::new("a", IndexType::String), IndexSpec::new("b", IndexType::Json1)];
        assert!(validate_index_specs("s", &ok).is_ok());
    }

    #[test]
    fn test_soup_spec_features() {
        let spec = SoupSpec::with_features("s", &[SoupFeature::ExternalStorage, SoupFeature::ExternalStorage]);
        assert_eq!(spec.features.len(), 1);
        assert!(spec.uses_external_storage());
        assert!(!SoupSpec::new("s").uses_external_storage());
    }
}
