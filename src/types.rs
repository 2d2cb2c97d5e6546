use serde::{Deserialize, Serialize};
use std::sync::{atomic::AtomicBool, Arc};

use crate::scoring::ScoringMode;

// ── Constants ──────────────────────────────────────────────────────────

/// Cache-invalidation tag. Bump whenever the probability model or the
/// scoring logic changes; prior cached simulation results become
/// unreachable without an explicit flush.
pub const MODEL_VERSION: u32 = 3;

pub const MIN_SIMULATION_RUNS: u32 = 100;
pub const MAX_SIMULATION_RUNS: u32 = 10_000;

// ── Shared state type aliases ──────────────────────────────────────────

pub type SharedCancelFlag = Arc<AtomicBool>;

// ── Game results (consumed from the provider) ──────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    InProgress,
    Final,
    Unknown,
}

impl GameStatus {
    pub fn is_final(self) -> bool {
        self == GameStatus::Final
    }
}

impl Default for GameStatus {
    fn default() -> Self {
        GameStatus::Scheduled
    }
}

/// One game's live-score row. `status` is the only trustworthy
/// final/not-final signal; the engine acts only on `Final`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameResult {
    pub game_id: u64,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub home_score: Option<u32>,
    pub away_score: Option<u32>,
    pub status: GameStatus,
}

/// Which input slot of a node a team occupies (or feeds into).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Home,
    Away,
}

// ── Picks ───────────────────────────────────────────────────────────────

/// A user's selection for one node within one bracket entry.
/// `(entry_id, node_id)` is unique. `is_correct` stays `None` until the
/// node's game goes final; correctness and points are always written
/// together.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pick {
    pub entry_id: u64,
    pub node_id: u64,
    pub picked_team: String,
    pub is_correct: Option<bool>,
    pub points: u32,
}

impl Pick {
    pub fn new(entry_id: u64, node_id: u64, picked_team: impl Into<String>) -> Self {
        Pick {
            entry_id,
            node_id,
            picked_team: picked_team.into(),
            is_correct: None,
            points: 0,
        }
    }
}

// ── Tournament field (consumed from the provider) ──────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldTeam {
    pub name: String,
    pub seed: Option<u32>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentField {
    pub is_field_set: bool,
    #[serde(default)]
    pub teams: Vec<FieldTeam>,
    #[serde(default)]
    pub lock_time: Option<chrono::DateTime<chrono::Utc>>,
}

// ── Simulation request / result ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    pub user_id: u64,
    pub entry_id: u64,
    pub tournament_id: u64,
    pub run_count: u32,
    pub mode: ScoringMode,
    /// Fixed RNG seed; `None` picks a clock-derived seed.
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamFraction {
    pub team: String,
    pub fraction: f64,
}

/// Per-node outcome distribution across all completed runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProjection {
    pub node_id: u64,
    pub round: u32,
    pub slot: u32,
    /// Whether the node's real-world game was already final (no randomness
    /// was spent on it).
    pub decided: bool,
    pub picked_team: Option<String>,
    /// Fraction of runs in which the user's pick won this node. `None` when
    /// the entry has no pick here.
    pub survival: Option<f64>,
    /// Fraction of runs each candidate won this node, descending.
    pub win_fractions: Vec<TeamFraction>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsPercentiles {
    pub p10: u32,
    pub p50: u32,
    pub p90: u32,
}

/// Derived data: never hand-edited, always regenerable from the current
/// tree + picks + run count + model version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub tournament_id: u64,
    pub entry_id: u64,
    /// Runs actually completed (equals the request's run count unless the
    /// job was cancelled mid-flight).
    pub run_count: u32,
    pub model_version: u32,
    pub mode: ScoringMode,
    pub nodes: Vec<NodeProjection>,
    pub expected_points: f64,
    pub percentiles: PointsPercentiles,
    pub generated_at_ms: u64,
}
