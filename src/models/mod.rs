//! Domain models shared across the whole alerting engine.

pub mod event;
pub mod level;
pub mod order;
pub mod position;
pub mod snapshot;

pub use event::{
    AlertCategory, AlertDecision, Event, EventBody, FieldChange, LevelTrigger, ModifiedField,
    Outcome, Priority, ProfitSuggestion, RiskKind, SuppressReason,
};
pub use level::{LevelKey, LevelKind, PriceLevel, Recurrence, TriggerState};
pub use order::{Order, OrderType};
pub use position::{Position, Side};
pub use snapshot::{AccountSnapshot, TradingSnapshot};
