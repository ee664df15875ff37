//! Bronze rows → silver records: normalization, name resolution, postal
//! overrides, and soft validation of the resolved code.

use std::collections::{BTreeMap, HashSet};

use isla_core::{MunicipalityEntry, RawRecord, SilverRecord};
use serde::Serialize;
use tracing::{debug, warn};

use crate::names::{normalize_for_matching, MatchMethod, NameIndex};
use crate::normalize::normalize_record;
use crate::schema::DatasetDescriptor;

/// Distinct unresolved names kept in the run summary.
pub const UNRESOLVED_SAMPLE_CAP: usize = 20;

/// Codes in scope for the territory. Codes outside it are nulled, not dropped.
#[derive(Debug, Clone, Default)]
pub struct AllowedCodes(HashSet<String>);

impl AllowedCodes {
    pub fn new(codes: impl IntoIterator<Item = String>) -> Self {
        Self(codes.into_iter().collect())
    }

    /// `configured` when non-empty, otherwise every registry code.
    pub fn for_territory(configured: &[String], registry: &[MunicipalityEntry]) -> Self {
        if configured.is_empty() {
            Self::new(registry.iter().map(|e| e.code.clone()))
        } else {
            Self::new(configured.iter().cloned())
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub input_rows: usize,
    pub accepted: usize,
    pub rejected: BTreeMap<String, usize>,
    pub resolved_exact: usize,
    pub resolved_fallback: usize,
    pub resolved_override: usize,
    pub unresolved: usize,
    pub unresolved_names: Vec<String>,
    pub codes_nulled: usize,
}

impl TransformStats {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }
}

pub struct Transformer<'a> {
    descriptor: &'a DatasetDescriptor,
    index: &'a NameIndex,
    allowed: &'a AllowedCodes,
}

impl<'a> Transformer<'a> {
    pub fn new(descriptor: &'a DatasetDescriptor, index: &'a NameIndex, allowed: &'a AllowedCodes) -> Self {
        Self {
            descriptor,
            index,
            allowed,
        }
    }

    pub fn transform(&self, resource_id: &str, rows: &[RawRecord]) -> (Vec<SilverRecord>, TransformStats) {
        let mut stats = TransformStats {
            input_rows: rows.len(),
            ..Default::default()
        };
        let mut reported = HashSet::new();
        let mut records = Vec::with_capacity(rows.len());

        for raw in rows {
            let mut record = match normalize_record(self.descriptor, resource_id, raw) {
                Ok(record) => record,
                Err(rejection) => {
                    debug!(dataset = %self.descriptor.id, %rejection, "row rejected");
                    *stats.rejected.entry(rejection.reason().to_string()).or_default() += 1;
                    continue;
                }
            };
            self.resolve(&mut record, &mut stats, &mut reported);
            if let Some(code) = record.municipality_code.as_deref() {
                if !self.allowed.contains(code) {
                    debug!(dataset = %self.descriptor.id, code, "code outside territory; nulled");
                    record.municipality_code = None;
                    stats.codes_nulled += 1;
                }
            }
            stats.accepted += 1;
            records.push(record);
        }
        (records, stats)
    }

    fn resolve(&self, record: &mut SilverRecord, stats: &mut TransformStats, reported: &mut HashSet<String>) {
        let Some(name) = record.municipality_name.clone() else {
            return;
        };
        if let Some(found) = self.index.resolve_match(&name) {
            match found.method {
                MatchMethod::Exact => stats.resolved_exact += 1,
                MatchMethod::Fallback { score } => {
                    debug!(name = %name, code = %found.code, score, "resolved by substring fallback");
                    stats.resolved_fallback += 1;
                }
            }
            record.municipality_code = Some(found.code);
            record.municipality_normalized = Some(found.canonical_name);
            return;
        }

        if let Some(code) = self.postal_override(record) {
            stats.resolved_override += 1;
            record.municipality_normalized = Some(
                self.index
                    .canonical_name(&code)
                    .map(String::from)
                    .unwrap_or_else(|| normalize_for_matching(&name)),
            );
            record.municipality_code = Some(code);
            return;
        }

        stats.unresolved += 1;
        record.municipality_normalized = Some(normalize_for_matching(&name));
        if reported.insert(name.clone()) {
            match self.index.suggest(&name) {
                Some((closest, similarity)) => warn!(
                    dataset = %self.descriptor.id,
                    name = %name,
                    closest,
                    similarity,
                    "unresolved municipality"
                ),
                None => warn!(dataset = %self.descriptor.id, name = %name, "unresolved municipality"),
            }
            if stats.unresolved_names.len() < UNRESOLVED_SAMPLE_CAP {
                stats.unresolved_names.push(name);
            }
        }
    }

    fn postal_override(&self, record: &SilverRecord) -> Option<String> {
        let spec = &self.descriptor.municipality;
        let field = spec.postal_code_field.as_ref()?;
        let postal_code = record.fields.get(field)?.as_text()?;
        spec.postal_code_overrides.get(postal_code).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DatasetCatalog;
    use serde_json::{json, Value as JsonValue};

    fn descriptor() -> DatasetDescriptor {
        DatasetCatalog::from_yaml_str(
            r#"
datasets:
  - id: alojamientos
    display_name: Alojamientos
    source: { kind: fixture, path: x.json, resource_id: aloj }
    silver_table: silver_alojamientos
    municipality:
      source: [municipio]
      postal_code_field: codigo_postal
      postal_code_overrides: { "38639": "38006", "38999": "99999" }
    fields:
      - { name: nombre, kind: text, required: true }
      - { name: modalidad, kind: text, required: true, allowed: [hotelera, extrahotelera] }
      - { name: codigo_postal, kind: postal_code }
    key: [source_resource_id, municipality_normalized, nombre]
"#,
        )
        .unwrap()
        .datasets
        .remove(0)
    }

    fn registry() -> Vec<MunicipalityEntry> {
        vec![
            MunicipalityEntry::new("38006", "Arona"),
            MunicipalityEntry::new("38032", "Los Realejos"),
            MunicipalityEntry::new("38026", "La Orotava"),
        ]
    }

    fn raw(value: JsonValue) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    fn run(rows: Vec<JsonValue>, allowed: AllowedCodes) -> (Vec<SilverRecord>, TransformStats) {
        let descriptor = descriptor();
        let index = NameIndex::build(&registry());
        let rows: Vec<RawRecord> = rows.into_iter().map(raw).collect();
        Transformer::new(&descriptor, &index, &allowed).transform("aloj", &rows)
    }

    #[test]
    fn article_variants_share_code_and_normalized_name() {
        let (records, stats) = run(
            vec![
                json!({"municipio": "Realejos, Los", "modalidad": "hotelera", "nombre": "Hotel X"}),
                json!({"municipio": "LOS REALEJOS", "modalidad": "hotelera", "nombre": "Hotel X"}),
            ],
            AllowedCodes::for_territory(&[], &registry()),
        );
        assert_eq!(stats.resolved_exact, 2);
        for record in &records {
            assert_eq!(record.municipality_code.as_deref(), Some("38032"));
            assert_eq!(record.municipality_normalized.as_deref(), Some("Los Realejos"));
        }
    }

    #[test]
    fn rejected_rows_are_counted_by_reason() {
        let (records, stats) = run(
            vec![
                json!({"municipio": "Arona", "modalidad": "vivienda vacacional", "nombre": "Casa"}),
                json!({"municipio": "Arona", "modalidad": "hotelera"}),
                json!({"municipio": "Arona", "modalidad": "hotelera", "nombre": "Hotel"}),
            ],
            AllowedCodes::for_territory(&[], &registry()),
        );
        assert_eq!(records.len(), 1);
        assert_eq!(stats.rejected["not_in_enumeration"], 1);
        assert_eq!(stats.rejected["missing_required"], 1);
        assert_eq!(stats.rejected_total(), 2);
        assert_eq!(stats.accepted, 1);
    }

    #[test]
    fn postal_overrides_apply_only_to_unresolved_names() {
        let (records, stats) = run(
            vec![
                json!({"municipio": "Costa del Silencio", "modalidad": "hotelera", "nombre": "A", "codigo_postal": "38639"}),
                json!({"municipio": "La Orotava", "modalidad": "hotelera", "nombre": "B", "codigo_postal": "38639"}),
            ],
            AllowedCodes::for_territory(&[], &registry()),
        );
        assert_eq!(stats.resolved_override, 1);
        assert_eq!(records[0].municipality_code.as_deref(), Some("38006"));
        assert_eq!(records[0].municipality_normalized.as_deref(), Some("Arona"));
        assert_eq!(records[1].municipality_code.as_deref(), Some("38026"));
    }

    #[test]
    fn unresolved_names_stay_loadable_with_a_null_code() {
        let (records, stats) = run(
            vec![
                json!({"municipio": "Valle Gran Rey", "modalidad": "hotelera", "nombre": "A"}),
                json!({"municipio": "Valle Gran Rey", "modalidad": "hotelera", "nombre": "B"}),
            ],
            AllowedCodes::for_territory(&[], &registry()),
        );
        assert_eq!(records.len(), 2);
        assert_eq!(stats.unresolved, 2);
        assert_eq!(stats.unresolved_names, vec!["Valle Gran Rey"]);
        assert_eq!(records[0].municipality_code, None);
        assert_eq!(records[0].municipality_normalized.as_deref(), Some("valle gran rey"));
    }

    #[test]
    fn codes_outside_the_allow_list_are_nulled_not_dropped() {
        let (records, stats) = run(
            vec![
                json!({"municipio": "Arona", "modalidad": "hotelera", "nombre": "A"}),
                json!({"municipio": "Somewhere", "modalidad": "hotelera", "nombre": "B", "codigo_postal": "38999"}),
            ],
            AllowedCodes::new(["38006".to_string()]),
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].municipality_code.as_deref(), Some("38006"));
        assert_eq!(records[1].municipality_code, None);
        assert_eq!(stats.codes_nulled, 1);
    }

    #[test]
    fn configured_allow_list_overrides_the_registry() {
        let allowed = AllowedCodes::for_territory(&["38026".to_string()], &registry());
        assert_eq!(allowed.len(), 1);
        assert!(allowed.contains("38026"));
        assert!(!allowed.contains("38006"));
    }
}
