//! # store::levels
//!
//! **Price-Level Store** — user-defined levels loaded from a JSON file.
//!
//! ## File format
//! ```json
//! {
//!   "EURUSD": [
//!     { "id": "r1", "price": 1.1000, "type": "above",
//!       "description": "Resistance", "expires_at": "2025-06-30T00:00:00Z",
//!       "recurring": true }
//!   ]
//! }
//! ```
//! `type` defaults to `both`, `recurring` to `true`, `description` to
//! `"Price level at <price>"`.  A malformed entry is skipped with a
//! `ConfigInvalid` issue; the rest of the file still loads.
//!
//! Trigger state lives next to the definition in [`LevelStore`] and survives
//! reloads as long as the level's `(target, kind)` did not change.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::AppError;
use crate::models::{LevelKey, LevelKind, PriceLevel, Recurrence, TriggerState};

// ─── Wire format ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct LevelEntry {
    id: Value,
    price: f64,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    recurring: Option<bool>,
}

impl From<&PriceLevel> for LevelEntry {
    fn from(level: &PriceLevel) -> Self {
        Self {
            id:          Value::String(level.id.clone()),
            price:       level.target,
            kind:        Some(level.kind.as_str().to_string()),
            description: Some(level.description.clone()),
            expires_at:  level.expires_at,
            recurring:   Some(level.recurrence == Recurrence::Recurring),
        }
    }
}

/// Result of parsing one file: the valid levels and one issue per rejected entry.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub levels: BTreeMap<String, Vec<PriceLevel>>,
    pub issues: Vec<AppError>,
}

impl LoadReport {
    pub fn level_count(&self) -> usize {
        self.levels.values().map(Vec::len).sum()
    }
}

// ─── Parsing ──────────────────────────────────────────────────────────────────

/// Parse the whole document.  Only a document that is not a JSON object is
/// a hard error; anything wrong inside a single entry becomes an issue.
pub fn parse_levels(json: &str) -> Result<LoadReport, AppError> {
    let doc: Value = serde_json::from_str(json)
        .map_err(|e| AppError::ConfigInvalid(format!("levels file is not valid JSON: {e}")))?;
    let Value::Object(symbols) = doc else {
        return Err(AppError::ConfigInvalid("levels file must be a JSON object".into()));
    };

    let mut report = LoadReport::default();

    for (raw_symbol, entries) in symbols {
        let symbol = raw_symbol.trim().to_string();
        if symbol.is_empty() {
            report.issues.push(AppError::ConfigInvalid("empty symbol key".into()));
            continue;
        }
        let Value::Array(entries) = entries else {
            report
                .issues
                .push(AppError::ConfigInvalid(format!("{symbol}: expected a list of levels")));
            continue;
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut levels = Vec::with_capacity(entries.len());

        for (index, entry) in entries.into_iter().enumerate() {
            match build_level(&symbol, index, entry) {
                Ok(level) if !seen.insert(level.id.clone()) => {
                    report.issues.push(AppError::ConfigInvalid(format!(
                        "{symbol}/{}: duplicate id",
                        level.id
                    )));
                }
                Ok(level) => levels.push(level),
                Err(issue) => report.issues.push(issue),
            }
        }

        if !levels.is_empty() {
            report.levels.insert(symbol, levels);
        }
    }

    Ok(report)
}

/// Validate one entry in file format, for levels added over HTTP.
pub fn parse_level(symbol: &str, entry: Value) -> Result<PriceLevel, AppError> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(AppError::ConfigInvalid("symbol must not be empty".into()));
    }
    build_level(symbol, 0, entry)
}

fn build_level(symbol: &str, index: usize, entry: Value) -> Result<PriceLevel, AppError> {
    let invalid = |reason: String| AppError::ConfigInvalid(format!("{symbol}[{index}]: {reason}"));

    let entry: LevelEntry = serde_json::from_value(entry).map_err(|e| invalid(e.to_string()))?;

    let id = match entry.id {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => return Err(invalid(format!("invalid id {other}"))),
    };
    if !entry.price.is_finite() || entry.price <= 0.0 {
        return Err(invalid(format!("id {id}: price must be positive")));
    }
    let kind = match entry.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("both") => LevelKind::Both,
        Some("above") => LevelKind::Above,
        Some("below") => LevelKind::Below,
        Some(other) => return Err(invalid(format!("id {id}: unknown type '{other}'"))),
    };
    let recurrence = match entry.recurring {
        Some(false) => Recurrence::OneTime,
        _ => Recurrence::Recurring,
    };

    Ok(PriceLevel {
        description: entry
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("Price level at {}", entry.price)),
        id,
        symbol: symbol.to_string(),
        target: entry.price,
        kind,
        expires_at: entry.expires_at,
        recurrence,
        state: TriggerState::default(),
    })
}

/// Read and parse `path`.  A missing file is an empty level set.
pub fn load_levels_file(path: &Path) -> Result<LoadReport, AppError> {
    match fs::read_to_string(path) {
        Ok(json) => parse_levels(&json),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No levels file — starting with no price levels");
            Ok(LoadReport::default())
        }
        Err(e) => Err(AppError::ConfigInvalid(format!("{}: {e}", path.display()))),
    }
}

/// Write definitions (without trigger state) atomically: tmp file then rename.
pub fn save_levels_file(path: &Path, levels: &BTreeMap<String, Vec<PriceLevel>>) -> Result<(), AppError> {
    let doc: BTreeMap<&str, Vec<LevelEntry>> = levels
        .iter()
        .map(|(symbol, list)| (symbol.as_str(), list.iter().map(LevelEntry::from).collect()))
        .collect();
    let json = serde_json::to_string_pretty(&doc).map_err(anyhow::Error::from)?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(anyhow::Error::from)?;
    fs::rename(&tmp, path).map_err(anyhow::Error::from)?;
    Ok(())
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ─── LevelStore ───────────────────────────────────────────────────────────────

/// In-memory level set with trigger state, backed by the JSON file.
#[derive(Debug, Default)]
pub struct LevelStore {
    path: PathBuf,
    levels: BTreeMap<String, Vec<PriceLevel>>,
    file_mtime: Option<SystemTime>,
    /// Issues already logged, so a broken entry is not re-reported every reload.
    reported: HashSet<String>,
}

impl LevelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load from disk, keeping trigger state of unchanged levels.
    /// On a hard parse error the current set is kept.
    pub fn reload(&mut self) -> Result<usize, AppError> {
        let mtime = modified_at(&self.path);
        let report = load_levels_file(&self.path)?;
        self.file_mtime = mtime;

        for issue in &report.issues {
            if self.reported.insert(issue.to_string()) {
                warn!(error = %issue, "⚠️ Price level skipped");
            }
        }
        let count = report.level_count();
        self.apply(report.levels);
        info!(levels = count, path = %self.path.display(), "📐 Price levels loaded");
        Ok(count)
    }

    /// Reload only when the file's mtime moved.
    pub fn reload_if_changed(&mut self) -> Result<bool, AppError> {
        if modified_at(&self.path) == self.file_mtime {
            return Ok(false);
        }
        self.reload()?;
        Ok(true)
    }

    /// Replace definitions.  A level keeps its state when the same
    /// `(symbol, id)` exists with the same target and kind; otherwise it
    /// starts fresh.
    pub fn apply(&mut self, mut incoming: BTreeMap<String, Vec<PriceLevel>>) {
        let mut previous: HashMap<LevelKey, TriggerState> = self
            .levels
            .values()
            .flatten()
            .map(|l| (l.key(), l.state.clone()))
            .collect();

        for level in incoming.values_mut().flatten() {
            if let Some(state) = previous.remove(&level.key()) {
                level.restore_state(state);
            }
        }
        self.levels = incoming;
    }

    /// Adopt persisted trigger states.
    pub fn restore_states(&mut self, saved: Vec<(LevelKey, TriggerState)>) {
        let mut saved: HashMap<LevelKey, TriggerState> = saved.into_iter().collect();
        for level in self.levels.values_mut().flatten() {
            if let Some(state) = saved.remove(&level.key()) {
                level.restore_state(state);
            }
        }
    }

    pub fn states(&self) -> Vec<(LevelKey, TriggerState)> {
        self.levels
            .values()
            .flatten()
            .map(|l| (l.key(), l.state.clone()))
            .collect()
    }

    /// Symbols with at least one live level, i.e. the prices worth fetching.
    pub fn live_symbols(&self) -> Vec<String> {
        self.levels
            .iter()
            .filter(|(_, list)| list.iter().any(PriceLevel::is_live))
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    pub fn all(&self) -> &BTreeMap<String, Vec<PriceLevel>> {
        &self.levels
    }

    pub fn symbols_mut(&mut self) -> impl Iterator<Item = (&String, &mut Vec<PriceLevel>)> {
        self.levels.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.levels.values().map(Vec::len).sum()
    }

    // ── Management (HTTP surface) ────────────────────────────────────────────

    /// Add a level and rewrite the file.
    pub fn add(&mut self, level: PriceLevel) -> Result<(), AppError> {
        if !level.target.is_finite() || level.target <= 0.0 {
            return Err(AppError::BadRequest("price must be positive".into()));
        }
        let list = self.levels.entry(level.symbol.clone()).or_default();
        if list.iter().any(|l| l.id == level.id) {
            return Err(AppError::BadRequest(format!("level {} already exists", level.key())));
        }
        info!(level = %level.key(), target = level.target, kind = level.kind.as_str(), "➕ Price level added");
        list.push(level);
        self.persist()
    }

    /// Remove a level and rewrite the file.
    pub fn remove(&mut self, symbol: &str, id: &str) -> Result<PriceLevel, AppError> {
        let list = self
            .levels
            .get_mut(symbol)
            .ok_or_else(|| AppError::NotFound(format!("no levels for {symbol}")))?;
        let index = list
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| AppError::NotFound(format!("level {symbol}/{id}")))?;
        let removed = list.remove(index);
        if list.is_empty() {
            self.levels.remove(symbol);
        }
        info!(level = %removed.key(), "➖ Price level removed");
        self.persist()?;
        Ok(removed)
    }

    fn persist(&mut self) -> Result<(), AppError> {
        save_levels_file(&self.path, &self.levels)?;
        self.file_mtime = modified_at(&self.path);
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sentinel_levels_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir.join("price_levels.json")
    }

    #[test]
    fn test_parse_defaults() {
        let report = parse_levels(r#"{ "EURUSD": [ { "id": "r1", "price": 1.1 } ] }"#).unwrap();
        assert!(report.issues.is_empty());
        let level = &report.levels["EURUSD"][0];
        assert_eq!(level.kind, LevelKind::Both);
        assert_eq!(level.recurrence, Recurrence::Recurring);
        assert_eq!(level.description, "Price level at 1.1");
        assert!(level.expires_at.is_none());
    }

    #[test]
    fn test_bad_entry_skipped_rest_loads() {
        let json = r#"{
            "EURUSD": [
                { "id": "ok",  "price": 1.1, "type": "above" },
                { "id": "neg", "price": -3.0 },
                { "id": "typ", "price": 1.2, "type": "sideways" },
                { "price": 1.3 }
            ],
            "XAUUSD": [ { "id": 7, "price": 2000.0, "type": "below", "recurring": false } ]
        }"#;
        let report = parse_levels(json).unwrap();

        assert_eq!(report.level_count(), 2);
        assert_eq!(report.issues.len(), 3);
        assert!(report.issues.iter().all(|e| matches!(e, AppError::ConfigInvalid(_))));
        let gold = &report.levels["XAUUSD"][0];
        assert_eq!(gold.id, "7");
        assert_eq!(gold.recurrence, Recurrence::OneTime);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let json = r#"{ "EURUSD": [ { "id": "a", "price": 1.1 }, { "id": "a", "price": 1.2 } ] }"#;
        let report = parse_levels(json).unwrap();
        assert_eq!(report.level_count(), 1);
        assert_eq!(report.levels["EURUSD"][0].target, 1.1);
        assert_eq!(report.issues.len(), 1);
    }

    #[test]
    fn test_non_object_document_is_hard_error() {
        assert!(matches!(parse_levels("[1, 2]"), Err(AppError::ConfigInvalid(_))));
        assert!(matches!(parse_levels("{ nope"), Err(AppError::ConfigInvalid(_))));
    }

    #[test]
    fn test_apply_keeps_state_only_for_unchanged_levels() {
        let mut store = LevelStore::default();
        store.apply(
            parse_levels(r#"{ "EURUSD": [ { "id": "a", "price": 1.1 }, { "id": "b", "price": 1.2 } ] }"#)
                .unwrap()
                .levels,
        );
        for (_, list) in store.symbols_mut() {
            for level in list.iter_mut() {
                level.state.times_fired = 3;
                level.state.fingerprint = Some((level.target, level.kind));
            }
        }

        // "b" moved its target
        store.apply(
            parse_levels(r#"{ "EURUSD": [ { "id": "a", "price": 1.1 }, { "id": "b", "price": 1.25 } ] }"#)
                .unwrap()
                .levels,
        );
        let list = &store.all()["EURUSD"];
        assert_eq!(list[0].state.times_fired, 3);
        assert_eq!(list[1].state.times_fired, 0);
    }

    #[test]
    fn test_add_remove_round_trip_through_file() {
        let path = make_test_path("add_remove");
        let mut store = LevelStore::new(&path);
        assert_eq!(store.reload().unwrap(), 0);

        let level = PriceLevel {
            id:          "s1".into(),
            symbol:      "GBPUSD".into(),
            target:      1.25,
            kind:        LevelKind::Below,
            description: "Support".into(),
            expires_at:  None,
            recurrence:  Recurrence::OneTime,
            state:       TriggerState::default(),
        };
        store.add(level.clone()).unwrap();
        assert!(matches!(store.add(level), Err(AppError::BadRequest(_))));

        let mut fresh = LevelStore::new(&path);
        assert_eq!(fresh.reload().unwrap(), 1);
        assert_eq!(fresh.all()["GBPUSD"][0].description, "Support");
        assert_eq!(fresh.all()["GBPUSD"][0].recurrence, Recurrence::OneTime);

        fresh.remove("GBPUSD", "s1").unwrap();
        assert!(matches!(fresh.remove("GBPUSD", "s1"), Err(AppError::NotFound(_))));
        assert_eq!(fresh.len(), 0);
    }

    #[test]
    fn test_reload_if_changed_skips_untouched_file() {
        let path = make_test_path("mtime");
        fs::write(&path, r#"{ "EURUSD": [ { "id": "a", "price": 1.1 } ] }"#).unwrap();
        let mut store = LevelStore::new(&path);
        store.reload().unwrap();
        assert!(!store.reload_if_changed().unwrap());
    }

    #[test]
    fn test_live_symbols_excludes_spent() {
        let mut store = LevelStore::default();
        store.apply(
            parse_levels(r#"{ "EURUSD": [ { "id": "a", "price": 1.1 } ], "USDJPY": [ { "id": "b", "price": 150 } ] }"#)
                .unwrap()
                .levels,
        );
        for (symbol, list) in store.symbols_mut() {
            if symbol == "USDJPY" {
                list[0].state.spent = true;
            }
        }
        assert_eq!(store.live_symbols(), vec!["EURUSD".to_string()]);
    }
}
