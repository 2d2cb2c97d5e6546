use serde::Serialize;
use tracing::{info, warn};

use crate::bracket::BracketTree;
use crate::error::EngineError;
use crate::scoring::ScoringMode;
use crate::store::{NodeStore, PickStore};
use crate::types::{GameResult, Side};

// ── Report ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// The game has not transitioned into `final`.
    NotFinal,
    /// Tie or missing score: no winner can be derived. A no-op, not an
    /// error.
    NotActionable,
    /// The result references a game no node is bound to.
    UnknownGame,
    /// The provider's winner name matches neither of the node's teams
    /// (provider rename / abbreviation mismatch).
    TeamMismatch,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedGame {
    pub game_id: u64,
    pub reason: SkipReason,
}

/// Partial-success report for one advancement batch: how many nodes were
/// newly finalized vs idempotently re-scored, what was skipped and why,
/// and which writes failed. One bad game never aborts the batch.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceReport {
    pub finalized: u32,
    pub rescored: u32,
    pub picks_correct: u32,
    pub picks_incorrect: u32,
    pub skipped: Vec<SkippedGame>,
    #[serde(skip)]
    pub errors: Vec<(u64, EngineError)>,
}

// ── State machine ───────────────────────────────────────────────────────

/// Consume a batch of game results for one tournament: derive each winner,
/// score the node's picks in one set-based write, and propagate the winner
/// into the next node's slot.
///
/// Each node is a one-shot latch (`pending` -> `final`). Re-running with
/// the same final result reproduces identical pick scores and skips
/// re-propagation, keyed off the prior status returned by
/// [`NodeStore::record_result`].
pub fn apply_final_results(
    nodes: &dyn NodeStore,
    picks: &dyn PickStore,
    mode: ScoringMode,
    tournament_id: u64,
    results: &[GameResult],
) -> Result<AdvanceReport, EngineError> {
    // A malformed tree is fatal for the whole tournament until re-seeded.
    let mut tree = BracketTree::build(nodes.nodes_for_tournament(tournament_id)?)?;
    let game_index = tree.game_index();

    let mut report = AdvanceReport::default();

    // Process in dependency order so a round-1 result in this batch can
    // populate the round-2 node another result in the same batch decides.
    let mut bound: Vec<(u32, u32, u64, &GameResult)> = Vec::new();
    for result in results {
        match game_index.get(&result.game_id) {
            Some(node_id) => {
                let node = tree.node(*node_id)?;
                bound.push((node.round, node.slot, *node_id, result));
            }
            None => {
                warn!(game_id = result.game_id, "result for unbound game, skipping");
                report.skipped.push(SkippedGame {
                    game_id: result.game_id,
                    reason: SkipReason::UnknownGame,
                });
            }
        }
    }
    bound.sort_by_key(|(round, slot, _, _)| (*round, *slot));

    for (_, _, node_id, result) in bound {
        if let Err(err) = advance_one(nodes, picks, mode, &mut tree, node_id, result, &mut report) {
            report.errors.push((result.game_id, err));
        }
    }

    info!(
        tournament_id,
        finalized = report.finalized,
        rescored = report.rescored,
        skipped = report.skipped.len(),
        errors = report.errors.len(),
        "advancement batch applied"
    );
    Ok(report)
}

fn advance_one(
    nodes: &dyn NodeStore,
    picks: &dyn PickStore,
    mode: ScoringMode,
    tree: &mut BracketTree,
    node_id: u64,
    result: &GameResult,
    report: &mut AdvanceReport,
) -> Result<(), EngineError> {
    if !result.status.is_final() {
        report.skipped.push(SkippedGame {
            game_id: result.game_id,
            reason: SkipReason::NotFinal,
        });
        return Ok(());
    }

    let node = tree.node(node_id)?;
    let round = node.round;

    // A tie or a missing score cannot produce a winner: recorded but not
    // actionable, reported as a no-op.
    let (winner_side, loser_side) = match (result.home_score, result.away_score) {
        (Some(home), Some(away)) if home > away => (Side::Home, Side::Away),
        (Some(home), Some(away)) if away > home => (Side::Away, Side::Home),
        _ => {
            info!(game_id = result.game_id, "no winner derivable, skipping");
            report.skipped.push(SkippedGame {
                game_id: result.game_id,
                reason: SkipReason::NotActionable,
            });
            return Ok(());
        }
    };

    // Resolve the winner against the node's own team names. The node's
    // casing is canonical; the provider's name must match one slot
    // case-insensitively or the result is flagged, never guessed.
    let provider_winner = match winner_side {
        Side::Home => result.home_team.as_deref(),
        Side::Away => result.away_team.as_deref(),
    };
    let resolved = match provider_winner {
        Some(name) => {
            if node.team(Side::Home).is_some_and(|team| team.eq_ignore_ascii_case(name)) {
                Some((Side::Home, Side::Away))
            } else if node.team(Side::Away).is_some_and(|team| team.eq_ignore_ascii_case(name)) {
                Some((Side::Away, Side::Home))
            } else {
                None
            }
        }
        // Provider omitted names: trust the score sides directly.
        None => node.team(winner_side).map(|_| (winner_side, loser_side)),
    };
    let Some((winner_side, loser_side)) = resolved else {
        warn!(
            game_id = result.game_id,
            node_id,
            winner = provider_winner.unwrap_or("<none>"),
            "winner matches neither bracket slot, skipping"
        );
        report.skipped.push(SkippedGame {
            game_id: result.game_id,
            reason: SkipReason::TeamMismatch,
        });
        return Ok(());
    };

    let winner = node.team(winner_side).map(str::to_string).ok_or_else(|| {
        EngineError::MalformedBracket(format!("node {node_id} winner slot has no team"))
    })?;
    let loser = node.team(loser_side).map(str::to_string);

    let winner_seed = tree.seed_for_team(&winner);
    let loser_seed = loser.as_deref().and_then(|team| tree.seed_for_team(team));
    let points = mode.points_for(round, winner_seed, loser_seed);

    // One set-based write: correctness flag and points always move
    // together for every pick on the node.
    let counts = picks.score_node_picks(node_id, &winner, points)?;
    report.picks_correct += counts.correct;
    report.picks_incorrect += counts.incorrect;

    // Latch check-and-set: the prior status decides whether propagation
    // already happened.
    let prior = nodes.record_result(node_id, &winner)?;
    let (next_node_id, next_node_side) = {
        let local = tree.node_mut(node_id)?;
        local.winner = Some(winner.clone());
        local.game_status = crate::types::GameStatus::Final;
        (local.next_node_id, local.next_node_side)
    };

    if prior.is_final() {
        report.rescored += 1;
        return Ok(());
    }
    report.finalized += 1;

    if let (Some(next_id), Some(side)) = (next_node_id, next_node_side) {
        nodes.set_slot_team(next_id, side, &winner)?;
        let next = tree.node_mut(next_id)?;
        match side {
            Side::Home => next.home_team = Some(winner),
            Side::Away => next.away_team = Some(winner),
        }
    }
    Ok(())
}
