use std::collections::HashMap;
use std::sync::Mutex;

use crate::bracket::BracketNode;
use crate::error::EngineError;
use crate::types::{GameStatus, Pick, Side};

// ── Persistence interfaces ──────────────────────────────────────────────

/// Keyed CRUD over bracket nodes. The engine does not care how rows are
/// stored, only that reads return the full current team/seed/linkage state
/// and that each write below is one logical operation.
pub trait NodeStore: Send + Sync {
    fn nodes_for_tournament(&self, tournament_id: u64) -> Result<Vec<BracketNode>, EngineError>;

    /// Bulk insert at seeding time.
    fn insert_nodes(&self, nodes: &[BracketNode]) -> Result<(), EngineError>;

    /// Record a final winner on a node and flip its latch to `Final`.
    /// Returns the status the node had *before* this call — the latch read
    /// the advancement state machine keys idempotence off.
    fn record_result(&self, node_id: u64, winner: &str) -> Result<GameStatus, EngineError>;

    /// Write a team name into one input slot of a node. The only organic
    /// way later-round team names get populated.
    fn set_slot_team(&self, node_id: u64, side: Side, team: &str) -> Result<(), EngineError>;

    fn bind_game(&self, node_id: u64, game_id: u64) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PickScoreCounts {
    pub correct: u32,
    pub incorrect: u32,
}

/// Keyed CRUD over picks. `score_node_picks` is deliberately set-based:
/// every pick on the node is updated in one logical step, so a pick can
/// never end up with `is_correct` and `points` out of step.
pub trait PickStore: Send + Sync {
    fn picks_for_entry(&self, entry_id: u64) -> Result<Vec<Pick>, EngineError>;

    fn upsert_pick(&self, pick: Pick) -> Result<(), EngineError>;

    /// Score all picks for one node: picks matching `winner`
    /// (case-insensitive) get `is_correct = true` and `points`; every other
    /// pick on the node gets `is_correct = false` and 0. All or nothing.
    fn score_node_picks(
        &self,
        node_id: u64,
        winner: &str,
        points: u32,
    ) -> Result<PickScoreCounts, EngineError>;
}

// ── In-memory implementation ────────────────────────────────────────────

/// Mutex-guarded maps. Backs the tests and the poller's seeding path; a
/// relational store implements the same traits in production.
#[derive(Default)]
pub struct MemoryStore {
    nodes: Mutex<HashMap<u64, BracketNode>>,
    picks: Mutex<HashMap<(u64, u64), Pick>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl NodeStore for MemoryStore {
    fn nodes_for_tournament(&self, tournament_id: u64) -> Result<Vec<BracketNode>, EngineError> {
        let guard = self.nodes.lock().map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        let mut out: Vec<BracketNode> = guard
            .values()
            .filter(|node| node.tournament_id == tournament_id)
            .cloned()
            .collect();
        out.sort_by_key(|node| (node.round, node.slot));
        Ok(out)
    }

    fn insert_nodes(&self, nodes: &[BracketNode]) -> Result<(), EngineError> {
        let mut guard = self.nodes.lock().map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        for node in nodes {
            guard.insert(node.id, node.clone());
        }
        Ok(())
    }

    fn record_result(&self, node_id: u64, winner: &str) -> Result<GameStatus, EngineError> {
        let mut guard = self.nodes.lock().map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        let node = guard.get_mut(&node_id).ok_or(EngineError::UnknownNode(node_id))?;
        let prior = node.game_status;
        node.game_status = GameStatus::Final;
        node.winner = Some(winner.to_string());
        Ok(prior)
    }

    fn set_slot_team(&self, node_id: u64, side: Side, team: &str) -> Result<(), EngineError> {
        let mut guard = self.nodes.lock().map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        let node = guard.get_mut(&node_id).ok_or(EngineError::UnknownNode(node_id))?;
        match side {
            Side::Home => node.home_team = Some(team.to_string()),
            Side::Away => node.away_team = Some(team.to_string()),
        }
        Ok(())
    }

    fn bind_game(&self, node_id: u64, game_id: u64) -> Result<(), EngineError> {
        let mut guard = self.nodes.lock().map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        let node = guard.get_mut(&node_id).ok_or(EngineError::UnknownNode(node_id))?;
        node.game_id = Some(game_id);
        Ok(())
    }
}

impl PickStore for MemoryStore {
    fn picks_for_entry(&self, entry_id: u64) -> Result<Vec<Pick>, EngineError> {
        let guard = self.picks.lock().map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        let mut out: Vec<Pick> = guard
            .values()
            .filter(|pick| pick.entry_id == entry_id)
            .cloned()
            .collect();
        out.sort_by_key(|pick| pick.node_id);
        Ok(out)
    }

    fn upsert_pick(&self, pick: Pick) -> Result<(), EngineError> {
        let mut guard = self.picks.lock().map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        guard.insert((pick.entry_id, pick.node_id), pick);
        Ok(())
    }

    fn score_node_picks(
        &self,
        node_id: u64,
        winner: &str,
        points: u32,
    ) -> Result<PickScoreCounts, EngineError> {
        let winner = winner.to_lowercase();
        let mut guard = self.picks.lock().map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        let mut counts = PickScoreCounts::default();
        for pick in guard.values_mut().filter(|pick| pick.node_id == node_id) {
            if pick.picked_team.to_lowercase() == winner {
                pick.is_correct = Some(true);
                pick.points = points;
                counts.correct += 1;
            } else {
                pick.is_correct = Some(false);
                pick.points = 0;
                counts.incorrect += 1;
            }
        }
        Ok(counts)
    }
}
