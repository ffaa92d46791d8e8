//! Location field standardization: exact lookups plus fuzzy city matching.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::Deserialize;
use strsim::jaro_winkler;
use tracing::warn;

pub const CRATE_NAME: &str = "leadflow-standardize";

/// Default similarity cutoff (0-100) for fuzzy city matches.
pub const DEFAULT_CITY_THRESHOLD: f64 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Country,
    State,
    City,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Country => "country",
            Self::State => "state",
            Self::City => "city",
        }
    }
}

/// Result of standardizing one raw value.
///
/// `matched == false` means the value passed through unresolved: the
/// normalized raw value is used as both code and display, never rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct Standardized {
    pub code: String,
    pub display: String,
    pub matched: bool,
}

/// Geographic scope used to narrow fuzzy city candidates.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scope<'a> {
    pub country: Option<&'a str>,
    pub state: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookupEntry {
    pub name: String,
    pub code: String,
    pub display: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LookupFile {
    entries: Vec<LookupEntry>,
}

#[derive(Debug, Clone)]
struct CityCandidate {
    key: String,
    code: String,
    display: String,
    country_key: Option<String>,
    state_key: Option<String>,
}

/// Counters for the ingestion summary; curation works off the warn logs.
#[derive(Debug, Default)]
pub struct StandardizeStats {
    pub exact: AtomicU64,
    pub fuzzy: AtomicU64,
    pub unmatched: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub exact: u64,
    pub fuzzy: u64,
    pub unmatched: u64,
}

/// Read-only standardization lookup, seeded from YAML reference files.
///
/// The pipeline never writes back: fuzzy guesses are not persisted, unknown
/// values are logged for manual curation.
pub struct Standardizer {
    tables: HashMap<FieldType, HashMap<String, (String, String)>>,
    cities: Vec<CityCandidate>,
    city_threshold: f64,
    stats: StandardizeStats,
}

impl Standardizer {
    pub fn new(entries: HashMap<FieldType, Vec<LookupEntry>>, city_threshold: f64) -> Self {
        let mut tables: HashMap<FieldType, HashMap<String, (String, String)>> = HashMap::new();
        let mut cities = Vec::new();

        for (field, list) in entries {
            let table = tables.entry(field).or_default();
            for entry in list {
                for key in std::iter::once(&entry.name).chain(entry.aliases.iter()) {
                    let normalized = normalize_key(key);
                    // Index a space-free variant too, so "U.S." (normalized
                    // "u s") still reaches the "us" alias.
                    let compact = compact_key(&normalized);
                    if compact != normalized {
                        table.insert(compact, (entry.code.clone(), entry.display.clone()));
                    }
                    table.insert(normalized, (entry.code.clone(), entry.display.clone()));
                }
                if field == FieldType::City {
                    cities.push(CityCandidate {
                        key: normalize_key(&entry.name),
                        code: entry.code.clone(),
                        display: entry.display.clone(),
                        country_key: entry.country.as_deref().map(normalize_key),
                        state_key: entry.state.as_deref().map(normalize_key),
                    });
                }
            }
        }

        Self {
            tables,
            cities,
            city_threshold,
            stats: StandardizeStats::default(),
        }
    }

    /// Load `countries.yml`, `states.yml` and `cities.yml` from a directory.
    /// Missing files are tolerated; their field type simply never matches.
    pub fn load_dir(dir: &Path, city_threshold: f64) -> Result<Self> {
        let mut entries = HashMap::new();
        for (field, file_name) in [
            (FieldType::Country, "countries.yml"),
            (FieldType::State, "states.yml"),
            (FieldType::City, "cities.yml"),
        ] {
            let path = dir.join(file_name);
            if !path.exists() {
                warn!(file = %path.display(), "standardization file missing, field will pass through");
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let parsed: LookupFile = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            entries.insert(field, parsed.entries);
        }
        Ok(Self::new(entries, city_threshold))
    }

    /// Standardize one raw value for `field`, using `scope` to narrow fuzzy
    /// city candidates to the row's resolved country/state.
    pub fn standardize(&self, field: FieldType, raw: &str, scope: Scope<'_>) -> Standardized {
        let key = normalize_key(raw);
        if key.is_empty() {
            self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
            return Standardized {
                code: key.clone(),
                display: raw.trim().to_string(),
                matched: false,
            };
        }

        let table = self.tables.get(&field);
        let hit = table
            .and_then(|t| t.get(&key))
            .or_else(|| table.and_then(|t| t.get(&compact_key(&key))));
        if let Some((code, display)) = hit {
            self.stats.exact.fetch_add(1, Ordering::Relaxed);
            return Standardized {
                code: code.clone(),
                display: display.clone(),
                matched: true,
            };
        }

        if field == FieldType::City {
            if let Some(candidate) = self.best_city_match(&key, scope) {
                self.stats.fuzzy.fetch_add(1, Ordering::Relaxed);
                return Standardized {
                    code: candidate.code.clone(),
                    display: candidate.display.clone(),
                    matched: true,
                };
            }
        }

        self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
        warn!(
            field = field.as_str(),
            value = raw.trim(),
            "no standardization match, passing value through for curation"
        );
        Standardized {
            code: key,
            display: raw.trim().to_string(),
            matched: false,
        }
    }

    fn best_city_match(&self, key: &str, scope: Scope<'_>) -> Option<&CityCandidate> {
        let country_key = scope.country.map(normalize_key);
        let state_key = scope.state.map(normalize_key);

        let mut best: Option<(&CityCandidate, f64)> = None;
        for candidate in &self.cities {
            if !scope_matches(country_key.as_deref(), candidate.country_key.as_deref()) {
                continue;
            }
            if !scope_matches(state_key.as_deref(), candidate.state_key.as_deref()) {
                continue;
            }
            let score = jaro_winkler(key, &candidate.key) * 100.0;
            if score < self.city_threshold {
                continue;
            }
            match best {
                Some((_, prev)) if prev >= score => {}
                _ => best = Some((candidate, score)),
            }
        }
        best.map(|(candidate, _)| candidate)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            exact: self.stats.exact.load(Ordering::Relaxed),
            fuzzy: self.stats.fuzzy.load(Ordering::Relaxed),
            unmatched: self.stats.unmatched.load(Ordering::Relaxed),
        }
    }
}

/// Candidate passes when either side is unscoped, or the keys overlap.
fn scope_matches(wanted: Option<&str>, candidate: Option<&str>) -> bool {
    match (wanted, candidate) {
        (Some(w), Some(c)) => w == c || w.contains(c) || c.contains(w),
        _ => true,
    }
}

/// Lowercase, trim, strip punctuation and collapse interior whitespace.
pub fn normalize_key(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Space-free form of a normalized key, used as a secondary lookup so
/// punctuated abbreviations match their unpunctuated aliases.
fn compact_key(normalized: &str) -> String {
    normalized.split_whitespace().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn city(name: &str, code: &str, country: &str, state: &str) -> LookupEntry {
        LookupEntry {
            name: name.to_string(),
            code: code.to_string(),
            display: name.to_string(),
            country: Some(country.to_string()),
            state: Some(state.to_string()),
            aliases: vec![],
        }
    }

    fn standardizer() -> Standardizer {
        let mut entries = HashMap::new();
        entries.insert(
            FieldType::Country,
            vec![LookupEntry {
                name: "United States".into(),
                code: "USA".into(),
                display: "United States".into(),
                country: None,
                state: None,
                aliases: vec!["us".into(), "usa".into(), "united states of america".into()],
            }],
        );
        entries.insert(
            FieldType::State,
            vec![LookupEntry {
                name: "California".into(),
                code: "US-CA".into(),
                display: "California".into(),
                country: Some("United States".into()),
                state: None,
                aliases: vec!["ca".into()],
            }],
        );
        entries.insert(
            FieldType::City,
            vec![
                city("Los Angeles", "los-angeles", "United States", "California"),
                city("Las Vegas", "las-vegas", "United States", "Nevada"),
            ],
        );
        Standardizer::new(entries, DEFAULT_CITY_THRESHOLD)
    }

    #[test]
    fn normalization_strips_punctuation_and_case() {
        assert_eq!(normalize_key("  Los-Angeles,  CA. "), "los angeles ca");
        assert_eq!(normalize_key("U.S.A."), "u s a");
    }

    #[test]
    fn exact_lookup_hits_aliases() {
        let s = standardizer();
        let out = s.standardize(FieldType::Country, "U.S.", Scope::default());
        assert!(out.matched);
        assert_eq!(out.code, "USA");
        assert_eq!(out.display, "United States");
        assert_eq!(s.stats().exact, 1);
    }

    #[test]
    fn punctuated_and_fused_spellings_match_aliases() {
        let s = standardizer();
        for raw in ["U.S.A.", "U. S.", "UnitedStates"] {
            let out = s.standardize(FieldType::Country, raw, Scope::default());
            assert!(out.matched, "{raw} should resolve");
            assert_eq!(out.code, "USA");
        }
    }

    #[test]
    fn typo_city_fuzzy_matches_above_threshold() {
        let s = standardizer();
        let out = s.standardize(
            FieldType::City,
            "Loe Anglus",
            Scope {
                country: Some("United States"),
                state: Some("California"),
            },
        );
        assert!(out.matched);
        assert_eq!(out.display, "Los Angeles");
        assert_eq!(s.stats().fuzzy, 1);
    }

    #[test]
    fn low_similarity_city_passes_through_verbatim() {
        let s = standardizer();
        let out = s.standardize(FieldType::City, "Atlantiss", Scope::default());
        assert!(!out.matched);
        assert_eq!(out.code, "atlantiss");
        assert_eq!(out.display, "Atlantiss");
        assert_eq!(s.stats().unmatched, 1);
    }

    #[test]
    fn state_scope_excludes_other_states() {
        let s = standardizer();
        // "Las Vegis" would fuzzy-hit Las Vegas, but the row resolved to CA.
        let out = s.standardize(
            FieldType::City,
            "Las Vegis",
            Scope {
                country: Some("United States"),
                state: Some("California"),
            },
        );
        assert!(!out.matched);
    }

    #[test]
    fn unknown_country_is_not_rejected() {
        let s = standardizer();
        let out = s.standardize(FieldType::Country, "Atlantis Federation", Scope::default());
        assert!(!out.matched);
        assert_eq!(out.code, "atlantis federation");
        assert_eq!(out.display, "Atlantis Federation");
    }

    #[test]
    fn yaml_seeding_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("countries.yml"),
            "entries:\n  - name: Italy\n    code: ITA\n    display: Italy\n    aliases: [it]\n",
        )
        .expect("write countries.yml");
        let s = Standardizer::load_dir(dir.path(), DEFAULT_CITY_THRESHOLD).expect("load");
        let out = s.standardize(FieldType::Country, "IT", Scope::default());
        assert!(out.matched);
        assert_eq!(out.code, "ITA");
    }
}
