//! Municipality name resolution.
//!
//! Registry names are expanded into every spelling sources are known to use
//! (`La Orotava`, `Orotava, La`, `Orotava (La)`, `Orotava`) and indexed.
//! Lookups try the same expansion of the input first and fall back to a
//! scored substring scan.

use std::collections::{HashMap, HashSet};

use isla_core::MunicipalityEntry;
use serde::Serialize;
use strsim::jaro_winkler;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Definite articles recognised in leading and trailing position.
pub const ARTICLES: [&str; 4] = ["el", "la", "los", "las"];

/// Shortest overlap, in characters, the substring fallback accepts.
pub const MIN_FALLBACK_SCORE: usize = 5;

/// Trim, lowercase, collapse whitespace, strip diacritics, flatten commas.
pub fn normalize_for_matching(input: &str) -> String {
    let collapsed = input
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let stripped: String = collapsed.nfd().filter(|c| !is_combining_mark(*c)).collect();

    let mut out = String::with_capacity(stripped.len());
    let mut chars = stripped.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' {
            out.push(' ');
            if chars.peek().is_some_and(|next| next.is_whitespace()) {
                chars.next();
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn is_article(token: &str) -> bool {
    ARTICLES.contains(&normalize_for_matching(token).as_str())
}

/// `"<main> (<article>)"` on the raw string.
fn split_parenthesized_article(raw: &str) -> Option<(&str, &str)> {
    let body = raw.strip_suffix(')')?;
    let open = body.rfind('(')?;
    let main = body[..open].trim();
    let article = body[open + 1..].trim();
    (!main.is_empty() && is_article(article)).then_some((main, article))
}

/// `"<main>, <article>"` on the raw string, before commas are flattened.
fn split_comma_article(raw: &str) -> Option<(&str, &str)> {
    let comma = raw.rfind(',')?;
    let main = raw[..comma].trim();
    let article = raw[comma + 1..].trim();
    (!main.is_empty() && is_article(article)).then_some((main, article))
}

/// `"<main> <article>"` on the canonical form.
fn split_trailing_article(canonical: &str) -> Option<(&str, &str)> {
    let (main, article) = canonical.rsplit_once(' ')?;
    let main = main.trim();
    (!main.is_empty() && ARTICLES.contains(&article)).then_some((main, article))
}

fn split_leading_article(canonical: &str) -> Option<(&str, &str)> {
    let (article, rest) = canonical.split_once(' ')?;
    let rest = rest.trim();
    (!rest.is_empty() && ARTICLES.contains(&article)).then_some((article, rest))
}

struct Variants {
    ordered: Vec<String>,
    seen: HashSet<String>,
}

impl Variants {
    fn push(&mut self, candidate: &str) {
        let canonical = normalize_for_matching(candidate);
        if !canonical.is_empty() && self.seen.insert(canonical.clone()) {
            self.ordered.push(canonical);
        }
    }
}

/// Every canonical spelling of `name`, in a fixed order without repeats.
pub fn generate_name_variations(name: &str) -> Vec<String> {
    let raw = name.trim();
    let base = normalize_for_matching(raw);
    let mut variants = Variants {
        ordered: Vec::new(),
        seen: HashSet::new(),
    };
    variants.push(&base);

    let mut trailing_article = false;
    if let Some((main, article)) = split_parenthesized_article(raw) {
        variants.push(&format!("{article} {main}"));
        variants.push(main);
        trailing_article = true;
    }
    if let Some((main, article)) = split_comma_article(raw) {
        variants.push(&format!("{article} {main}"));
        variants.push(main);
        trailing_article = true;
    }
    if let Some((main, article)) = split_trailing_article(&base) {
        variants.push(&format!("{article} {main}"));
        variants.push(main);
        trailing_article = true;
    }

    let leading = split_leading_article(&base);
    if let Some((_, rest)) = leading {
        variants.push(rest);
    }
    if leading.is_none() && !trailing_article {
        for article in ARTICLES {
            variants.push(&format!("{article} {base}"));
        }
    }
    if let Some((article, rest)) = leading {
        variants.push(&format!("{rest}, {article}"));
        variants.push(&format!("{rest} ({article})"));
        variants.push(rest);
    }

    variants.ordered
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    Fallback { score: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameMatch {
    pub code: String,
    pub canonical_name: String,
    pub method: MatchMethod,
}

/// Variant → code lookup built from the registry. The first code written for
/// a variant keeps it; later collisions are ignored.
#[derive(Debug, Clone)]
pub struct NameIndex {
    entries: Vec<(String, String)>,
    positions: HashMap<String, usize>,
    canonical_names: HashMap<String, String>,
    min_fallback_score: usize,
}

impl Default for NameIndex {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
            canonical_names: HashMap::new(),
            min_fallback_score: MIN_FALLBACK_SCORE,
        }
    }
}

impl NameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(registry: &[MunicipalityEntry]) -> Self {
        let mut index = Self::new();
        for entry in registry {
            index
                .canonical_names
                .entry(entry.code.clone())
                .or_insert_with(|| entry.canonical_name.clone());
            for variant in generate_name_variations(&entry.canonical_name) {
                index.insert(variant, &entry.code);
            }
        }
        index
    }

    pub fn with_min_fallback_score(mut self, score: usize) -> Self {
        self.min_fallback_score = score;
        self
    }

    pub fn min_fallback_score(&self) -> usize {
        self.min_fallback_score
    }

    /// Returns false when the variant was already claimed.
    pub fn insert(&mut self, variant: String, code: &str) -> bool {
        if self.positions.contains_key(&variant) {
            return false;
        }
        self.positions.insert(variant.clone(), self.entries.len());
        self.entries.push((variant, code.to_string()));
        true
    }

    pub fn get(&self, variant: &str) -> Option<&str> {
        self.positions
            .get(variant)
            .map(|&i| self.entries[i].1.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn canonical_name(&self, code: &str) -> Option<&str> {
        self.canonical_names.get(code).map(String::as_str)
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.canonical_names.keys().map(String::as_str)
    }

    /// Code for `name`, or `None` when it is unresolved.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.lookup(name).map(|(code, _)| code)
    }

    pub fn resolve_match(&self, name: &str) -> Option<NameMatch> {
        let (code, method) = self.lookup(name)?;
        Some(NameMatch {
            code: code.to_string(),
            canonical_name: self.canonical_name(code).unwrap_or(code).to_string(),
            method,
        })
    }

    fn lookup(&self, name: &str) -> Option<(&str, MatchMethod)> {
        if let Some(code) = generate_name_variations(name)
            .iter()
            .find_map(|variant| self.get(variant))
        {
            return Some((code, MatchMethod::Exact));
        }

        let input = normalize_for_matching(name);
        if input.is_empty() {
            return None;
        }
        let input_len = input.chars().count();
        let mut best: Option<(&str, usize)> = None;
        for (key, code) in &self.entries {
            if !(input.contains(key.as_str()) || key.contains(input.as_str())) {
                continue;
            }
            let score = input_len.min(key.chars().count());
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((code.as_str(), score));
            }
        }
        best.filter(|(_, score)| *score >= self.min_fallback_score)
            .map(|(code, score)| (code, MatchMethod::Fallback { score }))
    }

    /// Closest registry name by Jaro-Winkler similarity. Diagnostic only.
    pub fn suggest(&self, name: &str) -> Option<(&str, f64)> {
        let input = normalize_for_matching(name);
        self.canonical_names
            .values()
            .map(|canonical| {
                let score = jaro_winkler(&input, &normalize_for_matching(canonical));
                (canonical.as_str(), score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(a.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(entries: &[(&str, &str)]) -> Vec<MunicipalityEntry> {
        entries
            .iter()
            .map(|(code, name)| MunicipalityEntry::new(*code, *name))
            .collect()
    }

    #[test]
    fn matching_form_strips_case_spacing_diacritics_and_commas() {
        assert_eq!(normalize_for_matching("  Güímar  "), "guimar");
        assert_eq!(normalize_for_matching("SANTA   ÚRSULA"), "santa ursula");
        assert_eq!(normalize_for_matching("Realejos, Los"), "realejos los");
        assert_eq!(normalize_for_matching("a,b"), "a b");
    }

    #[test]
    fn leading_article_names_gain_trailing_spellings() {
        assert_eq!(
            generate_name_variations("La Orotava"),
            vec!["la orotava", "orotava", "orotava la", "orotava (la)"]
        );
    }

    #[test]
    fn parenthesized_article_is_moved_to_the_front() {
        let variants = generate_name_variations("Orotava (La)");
        assert_eq!(variants[0], "orotava (la)");
        assert_eq!(variants[1], "la orotava");
        assert_eq!(variants[2], "orotava");
    }

    #[test]
    fn comma_article_is_detected_before_flattening() {
        let variants = generate_name_variations("Realejos, Los");
        assert_eq!(variants[..3], ["realejos los", "los realejos", "realejos"]);
        assert!(!variants.contains(&"el realejos los".to_string()));
    }

    #[test]
    fn articleless_names_try_every_article() {
        assert_eq!(
            generate_name_variations("Arona"),
            vec!["arona", "el arona", "la arona", "los arona", "las arona"]
        );
    }

    #[test]
    fn first_writer_keeps_a_variant() {
        let index = NameIndex::build(&registry(&[("1", "La Cruz"), ("2", "Cruz")]));
        assert_eq!(index.resolve("Cruz"), Some("1"));
        assert_eq!(index.get("la cruz"), Some("1"));
    }

    #[test]
    fn article_forms_resolve_to_the_same_code() {
        let index = NameIndex::build(&registry(&[("38026", "La Orotava")]));
        for input in ["Orotava (La)", "Orotava, La", "La Orotava", "LA  OROTAVA", "orotava"] {
            assert_eq!(index.resolve(input), Some("38026"), "{input}");
        }
    }

    #[test]
    fn every_generated_variant_resolves_to_its_own_code() {
        let entries = registry(&[
            ("38001", "Adeje"),
            ("38026", "La Orotava"),
            ("38031", "Los Realejos"),
            ("38032", "El Rosario"),
            ("38023", "San Cristóbal de La Laguna"),
            ("38035", "Santa Úrsula"),
        ]);
        let index = NameIndex::build(&entries);
        for entry in &entries {
            for variant in generate_name_variations(&entry.canonical_name) {
                assert_eq!(index.resolve(&variant), Some(entry.code.as_str()), "{variant}");
            }
        }
    }

    #[test]
    fn fallback_accepts_five_characters_and_rejects_four() {
        let index = NameIndex::build(&registry(&[("38005", "Arico")]));
        assert_eq!(index.resolve("Aric"), None);
        let accepted = index.resolve_match("Arico Nuevo").unwrap();
        assert_eq!(accepted.code, "38005");
        assert_eq!(accepted.method, MatchMethod::Fallback { score: 5 });
    }

    #[test]
    fn fallback_ties_keep_the_earliest_key() {
        let forward = NameIndex::build(&registry(&[("1", "Santa"), ("2", "Tanta")]));
        let reverse = NameIndex::build(&registry(&[("2", "Tanta"), ("1", "Santa")]));
        assert_eq!(forward.resolve("Santa Tanta"), Some("1"));
        assert_eq!(reverse.resolve("Santa Tanta"), Some("2"));
    }

    #[test]
    fn longer_overlap_beats_earlier_shorter_one() {
        let index = NameIndex::build(&registry(&[
            ("90001", "Muelle"),
            ("38038", "Santa Cruz de Tenerife"),
            ("38028", "Puerto de la Cruz"),
        ]));
        let m = index.resolve_match("Muelle de Puerto de la Cruz").unwrap();
        assert_eq!(m.code, "38028");
        assert_eq!(m.canonical_name, "Puerto de la Cruz");
    }

    #[test]
    fn threshold_can_be_lowered_for_review() {
        let index = NameIndex::build(&registry(&[("38005", "Arico")])).with_min_fallback_score(4);
        assert_eq!(index.resolve("Aric"), Some("38005"));
    }

    #[test]
    fn blank_input_is_unresolved() {
        let index = NameIndex::build(&registry(&[("38005", "Arico")]));
        assert_eq!(index.resolve("   "), None);
    }

    #[test]
    fn suggestions_point_at_the_closest_name() {
        let index = NameIndex::build(&registry(&[("38001", "Adeje"), ("38043", "Tacoronte")]));
        let (name, score) = index.suggest("Tacoronnte").unwrap();
        assert_eq!(name, "Tacoronte");
        assert!(score > 0.9);
    }
}
