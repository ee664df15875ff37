//! Declarative dataset descriptors (`datasets.yaml`).

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use isla_adapters::SourceSpec;
use isla_core::{BUILTIN_SILVER_COLUMNS, COL_MUNICIPALITY_CODE};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn default_bronze_table() -> String {
    "bronze_records".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetCatalog {
    pub datasets: Vec<DatasetDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source: SourceSpec,
    pub silver_table: String,
    #[serde(default = "default_bronze_table")]
    pub bronze_table: String,
    pub municipality: MunicipalitySpec,
    pub fields: Vec<FieldSpec>,
    /// Composite natural key of the silver table.
    pub key: Vec<String>,
    #[serde(default)]
    pub references: Option<ReferenceSpec>,
    #[serde(default)]
    pub upsert_procedure: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub facts: Option<FactSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MunicipalitySpec {
    /// Raw keys holding the free-text municipality name, tried in order.
    pub source: Vec<String>,
    /// Declared postal-code field consulted for overrides.
    #[serde(default)]
    pub postal_code_field: Option<String>,
    /// Postal code → municipality code, applied to unresolved names only.
    #[serde(default)]
    pub postal_code_overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Numeric,
    Boolean,
    Date,
    PostalCode,
}

impl FieldKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldKind::Integer | FieldKind::Numeric)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    /// Raw keys to read, in order. Defaults to the field name.
    #[serde(default)]
    pub source: Vec<String>,
    #[serde(default)]
    pub required: bool,
    /// Enumeration whitelist, compared in matching form.
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub range: Option<RangeRule>,
    #[serde(default)]
    pub period: Option<PeriodRule>,
}

impl FieldSpec {
    pub fn source_keys(&self) -> Vec<&str> {
        if self.source.is_empty() {
            vec![self.name.as_str()]
        } else {
            self.source.iter().map(String::as_str).collect()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeRule {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl RangeRule {
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRule {
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

impl PeriodRule {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }
}

/// Child-table gate: `field` must exist in `table.column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSpec {
    pub field: String,
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSpec {
    pub table: String,
    #[serde(default)]
    pub procedure: Option<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub measures: Vec<String>,
}

impl FactSpec {
    /// `municipality_code` followed by the grouping dimensions.
    pub fn key_columns(&self) -> Vec<String> {
        std::iter::once(COL_MUNICIPALITY_CODE.to_string())
            .chain(self.dimensions.iter().cloned())
            .collect()
    }
}

impl DatasetDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn batch_size_or(&self, default: usize) -> usize {
        self.batch_size.unwrap_or(default)
    }

    pub fn page_size_or(&self, default: usize) -> usize {
        self.page_size.unwrap_or(default)
    }

    fn is_column(&self, name: &str) -> bool {
        BUILTIN_SILVER_COLUMNS.contains(&name) || self.field(name).is_some()
    }

    pub fn rebase_local_sources(&mut self, root: &Path) {
        match &mut self.source {
            SourceSpec::Fixture { path, .. } if path.is_relative() => *path = root.join(&*path),
            SourceSpec::Csv { location, .. } if !is_remote(location) && Path::new(location).is_relative() => {
                *location = root.join(&*location).display().to_string();
            }
            _ => {}
        }
    }

    pub fn validate(&self) -> Result<()> {
        let id = &self.id;
        if self.municipality.source.is_empty() {
            bail!("dataset {id}: municipality.source must list at least one raw key");
        }
        let mut names = HashSet::new();
        for field in &self.fields {
            if BUILTIN_SILVER_COLUMNS.contains(&field.name.as_str()) {
                bail!("dataset {id}: field {} shadows a built-in column", field.name);
            }
            if !names.insert(field.name.as_str()) {
                bail!("dataset {id}: field {} declared twice", field.name);
            }
            if field.range.is_some() && !field.kind.is_numeric() {
                bail!("dataset {id}: range on non-numeric field {}", field.name);
            }
            if field.period.is_some() && field.kind != FieldKind::Date {
                bail!("dataset {id}: period on non-date field {}", field.name);
            }
            if !field.allowed.is_empty() && field.kind != FieldKind::Text {
                bail!("dataset {id}: allowed values on non-text field {}", field.name);
            }
        }
        if self.key.is_empty() {
            bail!("dataset {id}: key must name at least one column");
        }
        for column in &self.key {
            if !self.is_column(column) {
                bail!("dataset {id}: key column {column} is not declared");
            }
        }
        if let Some(field) = &self.municipality.postal_code_field {
            if self.field(field).is_none() {
                bail!("dataset {id}: postal_code_field {field} is not declared");
            }
        }
        if let Some(reference) = &self.references {
            if !self.is_column(&reference.field) {
                bail!("dataset {id}: reference field {} is not declared", reference.field);
            }
        }
        if let Some(facts) = &self.facts {
            for dimension in &facts.dimensions {
                if self.field(dimension).is_none() {
                    bail!("dataset {id}: fact dimension {dimension} is not a declared field");
                }
            }
            for measure in &facts.measures {
                match self.field(measure) {
                    Some(field) if field.kind.is_numeric() => {}
                    Some(_) => bail!("dataset {id}: fact measure {measure} is not numeric"),
                    None => bail!("dataset {id}: fact measure {measure} is not a declared field"),
                }
            }
        }
        if self.batch_size == Some(0) {
            bail!("dataset {id}: batch_size must be positive");
        }
        if self.page_size == Some(0) {
            bail!("dataset {id}: page_size must be positive");
        }
        Ok(())
    }
}

impl DatasetCatalog {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let catalog: Self = serde_yaml::from_str(text).context("parsing dataset catalog")?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog file; relative local source paths are taken from the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut catalog = Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))?;
        if let Some(root) = path.parent() {
            for dataset in &mut catalog.datasets {
                dataset.rebase_local_sources(root);
            }
        }
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for dataset in &self.datasets {
            if !ids.insert(dataset.id.as_str()) {
                bail!("dataset id {} declared twice", dataset.id);
            }
            dataset.validate()?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&DatasetDescriptor> {
        self.datasets.iter().find(|d| d.id == id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &DatasetDescriptor> {
        self.datasets.iter().filter(|d| d.enabled)
    }
}
