//! # state
//!
//! Shared application state handed to every Axum handler.  The engine itself
//! sits behind one mutex shared with the poll scheduler; everything else here
//! is either immutable after startup or internally synchronized.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::error;

use crate::engine::{EngineState, SharedEngine};
use crate::notify::Dispatcher;
use crate::scheduler::{LoopStatus, SharedStatus};
use crate::source::SnapshotSource;
use crate::store::StateStore;

// ─── AppState ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    // ── Engine ────────────────────────────────────────────────────────────────
    /// Differ, levels, policy และ trackers ทั้งหมด
    /// Command ถือ lock นี้ตลอด read-modify-write เหมือน poll cycle
    pub engine: SharedEngine,
    pub state_store: StateStore,

    // ── Collaborators ─────────────────────────────────────────────────────────
    pub source:     Arc<dyn SnapshotSource>,
    pub dispatcher: Arc<Dispatcher>,

    // ── Loop / Metrics ────────────────────────────────────────────────────────
    pub status:        SharedStatus,
    pub command_count: Arc<AtomicU64>,
    pub started_at:    DateTime<Utc>,

    // ── Settings ──────────────────────────────────────────────────────────────
    pub command_timeout: Duration,
    /// `None` = ไม่ได้ตั้ง key → ทุก request ผ่าน (dev mode)
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(
        engine: SharedEngine,
        state_store: StateStore,
        source: Arc<dyn SnapshotSource>,
        dispatcher: Arc<Dispatcher>,
        command_timeout: Duration,
        api_key: Option<String>,
    ) -> Self {
        Self {
            engine,
            state_store,
            source,
            dispatcher,
            status:        Arc::new(RwLock::new(LoopStatus::default())),
            command_count: Arc::new(AtomicU64::new(0)),
            started_at:    Utc::now(),
            command_timeout,
            api_key,
        }
    }

    // ── Helper Methods ────────────────────────────────────────────────────────

    /// Persist the engine after a command or level edit.  Called with the
    /// engine lock held; a failed write is logged, the next cycle retries.
    pub fn persist(&self, engine: &EngineState) {
        if let Err(e) = self.state_store.save(&engine.snapshot_state(Utc::now())) {
            error!(error = %e, "❌ Engine state save failed");
        }
    }

    pub fn next_command(&self) -> u64 {
        self.command_count.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub type SharedState = Arc<AppState>;

pub fn build_state(
    engine: SharedEngine,
    state_store: StateStore,
    source: Arc<dyn SnapshotSource>,
    dispatcher: Arc<Dispatcher>,
    command_timeout: Duration,
    api_key: Option<String>,
) -> SharedState {
    Arc::new(AppState::new(engine, state_store, source, dispatcher, command_timeout, api_key))
}
