mod coverage;
mod engine;
mod error;
mod event;
mod log;
mod notify;
pub mod store;

pub use coverage::{CoverageRange, CoverageTracker, Gap};
pub use engine::{
    AGGREGATES_TABLE, AggregateChange, AggregationEngine, DefaultFn, EngineBuilder, EngineConfig,
    EngineStatus, FoldFn, UpgradeFn,
};
pub use error::{Error, Result};
pub use event::Event;
pub use log::EventLog;
pub use notify::{ChangeNotifier, Listener, SubscriptionId};
pub use store::{FileStore, KvStore, KvTxn, MemStore, ScanDirection};
