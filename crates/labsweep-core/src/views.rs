//! Metadata-only views over existing datasets.
//!
//! A view stores paths, never data. If a referenced dataset is missing the view
//! stays intact but can not be resolved.

use serde::{Deserialize, Serialize};

use crate::models::Category;

/// Weak reference to a dataset by name and category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataReference {
    pub name: String,
    pub category: Category,
}

impl DataReference {
    pub fn data(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: Category::Data,
        }
    }

    pub fn analysis(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: Category::Analysis,
        }
    }

    pub fn to_path(&self) -> String {
        self.category.path_of(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewType {
    OneD,
    OneDV,
    TwoD,
    ThreeD,
    Table,
    Text,
}

/// What kind of derivation produced an analysis dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    Transform,
    Combination,
    Fit,
    Custom,
}

/// A named plot description pairing existing datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataView {
    pub x: DataReference,
    pub y: DataReference,
    #[serde(default)]
    pub z: Option<DataReference>,
    pub view_type: ViewType,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl DataView {
    pub fn new(x: DataReference, y: DataReference, view_type: ViewType) -> Self {
        Self {
            x,
            y,
            z: None,
            view_type,
            params: serde_json::Value::Null,
        }
    }

    /// A line plot of `y` against `x`.
    pub fn line(x: DataReference, y: DataReference) -> Self {
        Self::new(x, y, ViewType::OneD)
    }

    pub fn with_z(mut self, z: DataReference) -> Self {
        self.z = Some(z);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// All referenced dataset paths, x first.
    pub fn references(&self) -> Vec<&DataReference> {
        let mut refs = vec![&self.x, &self.y];
        if let Some(z) = &self.z {
            refs.push(z);
        }
        refs
    }

    /// Colon-joined paths, stored as the `xyz` attribute.
    pub fn xyz(&self) -> String {
        self.references()
            .iter()
            .map(|r| r.to_path())
            .collect::<Vec<_>>()
            .join(":")
    }
}
