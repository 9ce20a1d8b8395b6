//! # store::persist
//!
//! Engine state that must survive a restart, written as one JSON document.
//!
//! ## What is saved
//! - the last committed snapshot (diff baseline)
//! - per-level trigger state (spent one-time levels stay spent)
//! - dedup keys, rate buckets (ต่อนาทีและต่อชั่วโมง) and deferred alerts
//! - risk day baseline and announced breaches (drawdown reference เริ่มใหม่ทุกครั้งที่ start)
//! - tickets already given a profit suggestion
//!
//! ## Atomic writes
//! Write to `<file>.tmp`, then `fs::rename` over the real file.  A crash
//! mid-write leaves the previous document intact, so at most the last cycle
//! is re-announced after a restart.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::engine::policy::PolicyState;
use crate::engine::risk::RiskState;
use crate::error::AppError;
use crate::models::{LevelKey, TradingSnapshot, TriggerState};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub baseline: Option<TradingSnapshot>,
    #[serde(default)]
    pub levels: Vec<(LevelKey, TriggerState)>,
    #[serde(default)]
    pub policy: PolicyState,
    #[serde(default)]
    pub risk: RiskState,
    #[serde(default)]
    pub suggested: Vec<u64>,
    #[serde(default)]
    pub requested_closes: Vec<u64>,
}

/// File-backed store for [`PersistedState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), AppError> {
        let mut doc = state.clone();
        doc.version = FORMAT_VERSION;

        let json = serde_json::to_string_pretty(&doc).map_err(anyhow::Error::from)?;
        let tmp = self.tmp_path();
        fs::write(&tmp, json).map_err(anyhow::Error::from)?;
        fs::rename(&tmp, &self.path).map_err(anyhow::Error::from)?;
        Ok(())
    }

    /// `Ok(None)` when nothing was saved yet; `StateCorrupt` when the file
    /// exists but cannot be read back.
    pub fn load(&self) -> Result<Option<PersistedState>, AppError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::StateCorrupt(format!("{}: {e}", self.path.display()))),
        };
        let state: PersistedState = serde_json::from_str(&json)
            .map_err(|e| AppError::StateCorrupt(format!("{}: {e}", self.path.display())))?;
        if state.version > FORMAT_VERSION {
            return Err(AppError::StateCorrupt(format!(
                "state file version {} is newer than supported {FORMAT_VERSION}",
                state.version
            )));
        }
        Ok(Some(state))
    }

    /// Load, falling back to a fresh state (all levels armed, no history) on
    /// corruption.  The corrupt file is kept aside for inspection.
    pub fn load_or_default(&self) -> PersistedState {
        match self.load() {
            Ok(Some(state)) => {
                info!(
                    path     = %self.path.display(),
                    saved_at = ?state.saved_at,
                    levels   = state.levels.len(),
                    "💾 Engine state restored"
                );
                state
            }
            Ok(None) => {
                info!(path = %self.path.display(), "No saved state — starting fresh");
                PersistedState::default()
            }
            Err(e) => {
                error!(error = %e, "❌ Saved state unusable — starting fresh");
                let aside = self.path.with_extension("corrupt");
                if let Err(rename_err) = fs::rename(&self.path, &aside) {
                    warn!(error = %rename_err, "Could not move corrupt state file aside");
                }
                PersistedState::default()
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
