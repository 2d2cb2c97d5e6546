use thiserror::Error;

/// Engine-wide error taxonomy.
///
/// Per-game conditions that are expected during normal operation (ties,
/// not-yet-final games) are not errors; they are reported as skip reasons in
/// an [`crate::advance::AdvanceReport`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// The node graph is inconsistent (missing edge, multiple roots, cycle).
    /// Fatal for every operation on the tournament until it is re-seeded.
    #[error("malformed bracket: {0}")]
    MalformedBracket(String),

    #[error("unknown bracket node {0}")]
    UnknownNode(u64),

    #[error("unknown game {0}")]
    UnknownGame(u64),

    /// Run count or scoring mode outside supported bounds; rejected before
    /// any work is queued.
    #[error("invalid simulation request: {0}")]
    SimulationRequestInvalid(String),

    /// The backing store failed a read or write. Propagated untouched.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// The external sports-data provider failed or returned garbage.
    #[error("provider error: {0}")]
    Provider(String),

    /// A simulation was cancelled before completing a single run.
    #[error("simulation cancelled")]
    Cancelled,

    /// The job queue has been shut down and accepts no further work.
    #[error("job queue is closed")]
    QueueClosed,
}
