//! Class label table for the car classifier.
//!
//! The manifest is a small JSON file shipped next to the weights:
//!
//! ```json
//! { "num_classes": 196, "class_names": ["AM General Hummer SUV 2000", "..."] }
//! ```

use crate::error::{Result, ServeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
struct LabelManifest {
    num_classes: Option<usize>,
    class_names: Vec<String>,
}

/// Immutable, ordered mapping from class id to class name.
#[derive(Debug, Clone)]
pub struct ClassLabelTable {
    names: Arc<[String]>,
}

impl ClassLabelTable {
    /// Build a table from names in class-id order.
    pub fn from_names(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(ServeError::Configuration(
                "class label table is empty".to_string(),
            ));
        }
        Ok(Self {
            names: names.into(),
        })
    }

    /// Load the manifest from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ServeError::Configuration(format!(
                "failed to read class manifest {}: {}",
                path.display(),
                e
            ))
        })?;

        let table = Self::from_json(&raw)?;
        info!(path = %path.display(), classes = table.len(), "Class label table loaded");
        Ok(table)
    }

    /// Parse a manifest body.
    pub fn from_json(raw: &str) -> Result<Self> {
        let manifest: LabelManifest = serde_json::from_str(raw)
            .map_err(|e| ServeError::Configuration(format!("invalid class manifest: {}", e)))?;

        if let Some(declared) = manifest.num_classes {
            if declared != manifest.class_names.len() {
                return Err(ServeError::Configuration(format!(
                    "class manifest declares {} classes but lists {}",
                    declared,
                    manifest.class_names.len()
                )));
            }
        }

        Self::from_names(manifest.class_names)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, class_id: usize) -> Option<&str> {
        self.names.get(class_id).map(String::as_str)
    }

    /// Resolve a model output index. An out-of-range id means the model head
    /// and the table disagree, which is reported as an inference failure.
    pub fn resolve(&self, class_id: usize) -> Result<&str> {
        self.get(class_id).ok_or_else(|| {
            ServeError::Inference(format!(
                "class id {} outside label table of {}",
                class_id,
                self.len()
            ))
        })
    }

    pub fn contains(&self, label: &str) -> bool {
        self.names.iter().any(|n| n == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Fail unless the table has exactly `output_width` entries.
    pub fn ensure_width(&self, output_width: usize) -> Result<()> {
        if self.len() != output_width {
            return Err(ServeError::Configuration(format!(
                "label table has {} classes but the model outputs {}",
                self.len(),
                output_width
            )));
        }
        Ok(())
    }
}

/// Make/model/year split of a Stanford Cars style class name
/// such as `"BMW M5 Sedan 2010"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarDescriptor {
    pub make: String,
    pub model: String,
    pub body_style: Option<String>,
    pub year: u16,
}

impl CarDescriptor {
    /// Returns `None` for names with fewer than three tokens or without a trailing year.
    ///
    /// With four or more tokens the second-to-last one is the body style.
    pub fn parse(class_name: &str) -> Option<Self> {
        let tokens: Vec<&str> = class_name.split_whitespace().collect();
        if tokens.len() < 3 {
            return None;
        }

        let year = tokens[tokens.len() - 1].parse::<u16>().ok()?;
        let make = tokens[0].to_string();

        let (model, body_style) = if tokens.len() > 3 {
            (
                tokens[1..tokens.len() - 2].join(" "),
                Some(tokens[tokens.len() - 2].to_string()),
            )
        } else {
            (tokens[1].to_string(), None)
        };

        Some(Self {
            make,
            model,
            body_style,
            year,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table(n: usize) -> ClassLabelTable {
        ClassLabelTable::from_names((0..n).map(|i| format!("Car {} Coupe 20{:02}", i, i)).collect())
            .unwrap()
    }

    #[test]
    fn test_resolve() {
        let labels = table(10);
        assert_eq!(labels.len(), 10);
        assert_eq!(labels.resolve(7).unwrap(), "Car 7 Coupe 2007");
        assert!(matches!(labels.resolve(10), Err(ServeError::Inference(_))));
        assert!(labels.contains("Car 0 Coupe 2000"));
    }

    #[test]
    fn test_ensure_width() {
        let labels = table(196);
        assert!(labels.ensure_width(196).is_ok());
        assert!(matches!(
            labels.ensure_width(195),
            Err(ServeError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_table_rejected() {
        assert!(matches!(
            ClassLabelTable::from_names(Vec::new()),
            Err(ServeError::Configuration(_))
        ));
    }

    #[test]
    fn test_manifest_count_mismatch() {
        let raw = r#"{"num_classes": 3, "class_names": ["a", "b"]}"#;
        assert!(matches!(
            ClassLabelTable::from_json(raw),
            Err(ServeError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_manifest_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"num_classes": 2, "class_names": ["Acura RL Sedan 2012", "BMW M5 Sedan 2010"]}}"#
        )
        .unwrap();

        let labels = ClassLabelTable::load(file.path()).unwrap();
        assert_eq!(labels.get(1), Some("BMW M5 Sedan 2010"));
        assert_eq!(labels.iter().count(), 2);
    }

    #[test]
    fn test_missing_manifest() {
        let err = ClassLabelTable::load("/nonexistent/class_names.json").unwrap_err();
        assert!(matches!(err, ServeError::Configuration(_)));
    }

    #[test]
    fn test_car_descriptor_parse() {
        let car = CarDescriptor::parse("BMW M5 Sedan 2010").unwrap();
        assert_eq!(car.make, "BMW");
        assert_eq!(car.model, "M5");
        assert_eq!(car.body_style.as_deref(), Some("Sedan"));
        assert_eq!(car.year, 2010);

        let car = CarDescriptor::parse("Aston Martin V8 Vantage Convertible 2012").unwrap();
        assert_eq!(car.make, "Aston");
        assert_eq!(car.model, "Martin V8 Vantage");

        let car = CarDescriptor::parse("Fisker Karma 2012").unwrap();
        assert_eq!(car.model, "Karma");
        assert_eq!(car.body_style, None);

        assert!(CarDescriptor::parse("Tesla 2012").is_none());
        assert!(CarDescriptor::parse("Ford Focus Sedan").is_none());
    }
}
