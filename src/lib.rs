pub mod advance;
pub mod bracket;
pub mod config;
pub mod error;
pub mod jobs;
pub mod poller;
pub mod provider;
pub mod scoring;
pub mod simulate;
pub mod store;
pub mod types;

use std::fs;
use std::path::Path;

use tracing::info;
use tracing_subscriber::EnvFilter;

pub use advance::{apply_final_results, AdvanceReport, SkipReason};
pub use bracket::{seed_bracket, BracketNode, BracketTree};
pub use config::EngineConfig;
pub use error::EngineError;
pub use jobs::{JobHandle, SimulationService, SubmitOutcome};
pub use poller::{poll_field_once, spawn_field_polling, PollOutcome};
pub use provider::{HttpSportsProvider, SportsDataProvider};
pub use scoring::ScoringMode;
pub use simulate::{run_simulation, SeedWeightModel, SimulationOptions, WinModel};
pub use store::{MemoryStore, NodeStore, PickStore};
pub use types::{
    GameResult, GameStatus, Pick, SimulationRequest, SimulationResult, TournamentField,
};

/// Initialize tracing with file + stderr output. Hold the returned guard
/// for the life of the process or buffered log lines are lost.
pub fn init_tracing(logs_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    fs::create_dir_all(logs_dir).ok();
    let file_appender = tracing_appender::rolling::daily(logs_dir, "engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    info!("bracket engine logging initialized");
    guard
}
