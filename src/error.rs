use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the log, the store implementations and the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failure from a file-backed store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialization failure for events, coverage metadata or the
    /// persisted store document.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The persisted store document failed validation on open.
    #[error("store corrupt: {0}")]
    Corrupt(String),

    /// Another process holds the store's exclusive lock.
    #[error("store is locked by another process")]
    Locked,

    /// `append` generated a global id that already exists in the index.
    /// Nothing was recorded and no coverage advanced.
    #[error("global id collision: {global_id}")]
    GlobalIdCollision {
        /// The colliding token.
        global_id: String,
    },

    /// Operation requires a successfully initialized engine.
    #[error("engine is not initialized")]
    NotInitialized,

    /// Initialization failed earlier; the failure is remembered and
    /// returned from every subsequent call without retrying.
    #[error("engine initialization failed: {0}")]
    InitFailed(String),

    /// The engine was disposed; all operations fail fast.
    #[error("engine is disposed")]
    Disposed,

    /// A consumer-supplied fold rejected an event.
    #[error("fold error: {0}")]
    Fold(String),

    /// A consumer-supplied schema upgrade hook failed.
    #[error("schema upgrade error: {0}")]
    Upgrade(String),
}
