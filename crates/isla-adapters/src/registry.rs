use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use isla_core::MunicipalityEntry;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{decode_text, parse_delimited, AdapterError};

/// Authoritative list of municipality codes and their official names.
#[async_trait]
pub trait MunicipalityRegistry: Send + Sync {
    async fn municipalities(&self) -> Result<Vec<MunicipalityEntry>, AdapterError>;
}

/// Registry held in memory; handy for tests and embedded territories.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry(pub Vec<MunicipalityEntry>);

#[async_trait]
impl MunicipalityRegistry for StaticRegistry {
    async fn municipalities(&self) -> Result<Vec<MunicipalityEntry>, AdapterError> {
        Ok(self.0.clone())
    }
}

/// Registry read from a YAML or CSV file on every call.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MunicipalityRegistry for FileRegistry {
    async fn municipalities(&self) -> Result<Vec<MunicipalityEntry>, AdapterError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| AdapterError::Io {
                path: self.path.clone(),
                source,
            })?;
        parse_registry(&self.path, &bytes)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryYaml {
    List(Vec<MunicipalityEntry>),
    Keyed { municipalities: Vec<MunicipalityEntry> },
}

fn csv_cell(row: &isla_core::RawRecord, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        row.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| match value {
                JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            })
    })
}

fn parse_registry(path: &Path, bytes: &[u8]) -> Result<Vec<MunicipalityEntry>, AdapterError> {
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));

    let entries = if is_csv {
        let rows = parse_delimited(&decode_text(bytes), None)?;
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                let code = csv_cell(row, &["code", "codigo", "cod_ine"]);
                let name = csv_cell(row, &["canonical_name", "nombre", "name"]);
                match (code, name) {
                    (Some(code), Some(name)) => Ok(MunicipalityEntry::new(code, name)),
                    _ => Err(AdapterError::Malformed {
                        what: "registry csv",
                        message: format!("row {} lacks a code or a name", i + 1),
                    }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let parsed: RegistryYaml =
            serde_yaml::from_slice(bytes).map_err(|e| AdapterError::Malformed {
                what: "registry yaml",
                message: e.to_string(),
            })?;
        match parsed {
            RegistryYaml::List(entries) | RegistryYaml::Keyed { municipalities: entries } => entries,
        }
    };

    let mut seen = HashSet::new();
    for entry in &entries {
        if !seen.insert(entry.code.as_str()) {
            return Err(AdapterError::Malformed {
                what: "registry",
                message: format!("duplicate municipality code {}", entry.code),
            });
        }
    }
    Ok(entries)
}

/// Read a registry file (YAML list, `municipalities:` map, or CSV).
pub async fn load_registry_file(path: impl AsRef<Path>) -> Result<Vec<MunicipalityEntry>, AdapterError> {
    FileRegistry::new(path.as_ref()).municipalities().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_registry_accepts_both_shapes() {
        let list = parse_registry(
            Path::new("m.yaml"),
            b"- code: '38026'\n  canonical_name: La Orotava\n",
        )
        .unwrap();
        let keyed = parse_registry(
            Path::new("m.yaml"),
            b"municipalities:\n  - code: '38026'\n    canonical_name: La Orotava\n",
        )
        .unwrap();
        assert_eq!(list, keyed);
        assert_eq!(list[0], MunicipalityEntry::new("38026", "La Orotava"));
    }

    #[test]
    fn csv_registry_reads_spanish_headers() {
        let entries = parse_registry(
            Path::new("municipios.csv"),
            "CODIGO;NOMBRE\n38001;Adeje\n38028;Puerto de la Cruz\n".as_bytes(),
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].canonical_name, "Puerto de la Cruz");
    }

    #[test]
    fn duplicate_codes_are_rejected() {
        let err = parse_registry(
            Path::new("m.yaml"),
            b"- {code: '1', canonical_name: A}\n- {code: '1', canonical_name: B}\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate municipality code 1"));
    }

    #[tokio::test]
    async fn static_registry_returns_its_entries() {
        let registry = StaticRegistry(vec![MunicipalityEntry::new("38032", "Los Realejos")]);
        assert_eq!(registry.municipalities().await.unwrap().len(), 1);
    }
}
