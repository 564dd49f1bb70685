//! Structured metadata recorded alongside spectra.
//!
//! The driver only talks to a [`MetadataSink`]: named attributes and named
//! `f64` arrays with a unit. [`JsonMetadataSink`] keeps everything in one
//! serde_json document that can be written to disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CcsError, Result};

/// Attribute value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean
    Bool(bool),
    /// Integer
    Integer(i64),
    /// Float
    Float(f64),
    /// Text
    Text(String),
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<u16> for AttributeValue {
    fn from(v: u16) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Receiver of structured metadata.
pub trait MetadataSink {
    /// Record a scalar or string attribute, replacing an earlier value.
    fn set_attribute(&mut self, name: &str, value: AttributeValue) -> Result<()>;

    /// Record a named array with its unit, replacing an earlier array.
    fn write_array(&mut self, name: &str, values: &[f64], unit: &str) -> Result<()>;
}

/// Run-level description written at the top of the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    /// The name of the experiment.
    pub experiment_name: String,
    /// A detailed description of the experiment.
    pub description: String,
    /// User annotations or notes.
    pub annotations: String,
    /// Version of the acquisition software.
    pub software_version: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            experiment_name: "CCS acquisition".to_string(),
            description: String::new(),
            annotations: String::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Metadata {
    /// Validates the metadata.
    pub fn validate(&self) -> Result<()> {
        if self.experiment_name.is_empty() {
            return Err(CcsError::invalid_parameter("experiment name cannot be empty"));
        }
        Ok(())
    }
}

/// A builder for constructing `Metadata` instances.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    /// Builder starting from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Experiment name.
    pub fn experiment_name(mut self, name: &str) -> Self {
        self.inner.experiment_name = name.to_string();
        self
    }

    /// Description.
    pub fn description(mut self, description: &str) -> Self {
        self.inner.description = description.to_string();
        self
    }

    /// Free-form notes.
    pub fn annotations(mut self, annotations: &str) -> Self {
        self.inner.annotations = annotations.to_string();
        self
    }

    /// Finish.
    pub fn build(self) -> Metadata {
        self.inner
    }
}

/// Array with its unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArrayRecord {
    /// Physical unit
    pub unit: String,
    /// Values
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Document {
    metadata: Metadata,
    attributes: BTreeMap<String, AttributeValue>,
    arrays: BTreeMap<String, ArrayRecord>,
}

/// Metadata sink backed by a JSON document.
#[derive(Debug, Clone)]
pub struct JsonMetadataSink {
    path: Option<PathBuf>,
    document: Document,
}

impl JsonMetadataSink {
    /// In-memory sink.
    pub fn new(metadata: Metadata) -> Self {
        Self {
            path: None,
            document: Document {
                metadata,
                attributes: BTreeMap::new(),
                arrays: BTreeMap::new(),
            },
        }
    }

    /// Sink written to `path` on [`JsonMetadataSink::flush`].
    pub fn to_file(metadata: Metadata, path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(metadata)
        }
    }

    /// Recorded attribute.
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.document.attributes.get(name)
    }

    /// Recorded array.
    pub fn array(&self, name: &str) -> Option<&ArrayRecord> {
        self.document.arrays.get(name)
    }

    /// Run description.
    pub fn metadata(&self) -> &Metadata {
        &self.document.metadata
    }

    /// Document as a JSON value.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.document)
            .map_err(|e| CcsError::invalid_parameter(format!("metadata not serializable: {}", e)))
    }

    /// Write the document to its file; a no-op for in-memory sinks.
    pub fn flush(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.write_to(path),
            None => Ok(()),
        }
    }

    /// Write the document to `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.document)
            .map_err(|e| CcsError::invalid_parameter(format!("metadata not serializable: {}", e)))?;
        std::fs::write(path, text).map_err(|source| CcsError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl MetadataSink for JsonMetadataSink {
    fn set_attribute(&mut self, name: &str, value: AttributeValue) -> Result<()> {
        self.document.attributes.insert(name.to_string(), value);
        Ok(())
    }

    fn write_array(&mut self, name: &str, values: &[f64], unit: &str) -> Result<()> {
        self.document.arrays.insert(
            name.to_string(),
            ArrayRecord {
                unit: unit.to_string(),
                values: values.to_vec(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_validate() {
        let meta = MetadataBuilder::new()
            .experiment_name("fluorescence")
            .description("dye in cuvette")
            .build();
        assert!(meta.validate().is_ok());
        assert!(MetadataBuilder::new().experiment_name("").build().validate().is_err());
    }

    #[test]
    fn test_flush_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let mut sink = JsonMetadataSink::to_file(Metadata::default(), &path);
        sink.set_attribute("serial_number", "M00555555".into()).unwrap();
        sink.set_attribute("integration_time_s", 0.01.into()).unwrap();
        sink.write_array("intensity", &[0.0, 0.5, 1.0], "a.u.").unwrap();
        sink.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["attributes"]["serial_number"], "M00555555");
        assert_eq!(value["arrays"]["intensity"]["unit"], "a.u.");
        assert_eq!(value["arrays"]["intensity"]["values"][1], 0.5);
    }
}
