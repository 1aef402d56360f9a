//! Durable state for the position auto-close engine.
//!
//! - `PositionStore`: positions table, sole owner of the `closed` transition
//! - `TimerStore`: per-symbol hold timers that survive restarts
//! - `JsonLinesLedger`: append-only daily files of closed positions
//!
//! Both stores run on a dedicated single-writer SQLite worker (see `worker`).

pub mod error;
pub mod ledger;
pub mod positions;
pub mod timers;
pub mod worker;

pub use error::{PersistenceError, PersistenceResult};
pub use ledger::{ClosedPositionRecord, JsonLinesLedger};
pub use positions::{CloseWrite, ExitFields, NewPosition, PositionRecord, PositionStore};
pub use timers::{RestoreOutcome, RestoredTimer, TimerEntry, TimerStore};
pub use worker::{spawn_sqlite_worker, SqliteHandle};
