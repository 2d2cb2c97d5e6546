use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crate::bracket::BracketTree;
use crate::config::now_ms;
use crate::error::EngineError;
use crate::scoring::ScoringMode;
use crate::types::{
    NodeProjection, Pick, PointsPercentiles, SimulationResult, TeamFraction, MAX_SIMULATION_RUNS,
    MIN_SIMULATION_RUNS, MODEL_VERSION,
};

// ── RNG ─────────────────────────────────────────────────────────────────

/// Xorshift generator. One instance per worker, seeds split
/// deterministically from the request's base seed so fixed-seed runs are
/// reproducible.
#[derive(Clone, Debug)]
pub struct SimRng {
    state: u64,
}

impl SimRng {
    pub fn new(seed: u64) -> Self {
        let mut state = seed;
        if state == 0 {
            state = 0x9E37_79B9_7F4A_7C15;
        }
        SimRng { state }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    pub fn next_f64(&mut self) -> f64 {
        let v = self.next_u64() >> 11;
        (v as f64) / ((1u64 << 53) as f64)
    }
}

// ── Win-probability model ───────────────────────────────────────────────

/// A team as the simulator sees it: canonical name plus its round-1 seed
/// when known.
#[derive(Debug, Clone)]
pub struct TeamRef {
    pub name: String,
    pub seed: Option<u32>,
}

/// Probability source for undecided games. Pluggable: the seed heuristic
/// below is only the default, not authoritative — a provider-supplied
/// model drops in without touching the run loop.
pub trait WinModel: Send + Sync {
    /// Probability that `home` beats `away`.
    fn home_win_probability(&self, home: &TeamRef, away: &TeamRef) -> f64;
}

/// Inverse-seed weighting: a 1 seed over a 16 seed wins 16/17 of the time,
/// clamped so no game is a lock. Unknown seeds fall back to a coin flip.
#[derive(Debug, Clone)]
pub struct SeedWeightModel {
    pub clamp_min: f64,
    pub clamp_max: f64,
}

impl Default for SeedWeightModel {
    fn default() -> Self {
        SeedWeightModel { clamp_min: 0.05, clamp_max: 0.95 }
    }
}

impl WinModel for SeedWeightModel {
    fn home_win_probability(&self, home: &TeamRef, away: &TeamRef) -> f64 {
        match (home.seed, away.seed) {
            (Some(home_seed), Some(away_seed)) => {
                let weight_home = 1.0 / home_seed.max(1) as f64;
                let weight_away = 1.0 / away_seed.max(1) as f64;
                (weight_home / (weight_home + weight_away)).clamp(self.clamp_min, self.clamp_max)
            }
            _ => 0.5,
        }
    }
}

/// Every undecided game resolves home with the same probability. Used by
/// the determinism and convergence tests and handy as an externally
/// supplied flat prior.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbabilityModel(pub f64);

impl WinModel for FixedProbabilityModel {
    fn home_win_probability(&self, _home: &TeamRef, _away: &TeamRef) -> f64 {
        self.0
    }
}

// ── Simulation ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub run_count: u32,
    /// Fixed seed for reproducible runs; `None` derives one from the clock.
    pub seed: Option<u64>,
    pub workers: usize,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        SimulationOptions { run_count: 1_000, seed: None, workers: 4 }
    }
}

/// Precomputed per-node plan in traversal order. Teams are interned to
/// dense indices so a run's slot state is a flat copyable vector and the
/// canonical tree is never touched.
struct PlanNode {
    node_id: u64,
    round: u32,
    slot: u32,
    /// Interned winner when the real-world game is already final; no
    /// randomness is spent here.
    decided: Option<u16>,
    /// (plan index, slot side: 0 home / 1 away) this winner feeds.
    next: Option<(usize, usize)>,
    has_pick: bool,
    pick_team: Option<u16>,
    pick_name: Option<String>,
}

/// Play out the remaining bracket `run_count` times and report, per node,
/// how often each candidate won it, plus the entry's projected points.
///
/// Runs are split into contiguous chunks across worker threads; each
/// worker owns private accumulators merged once after its batch completes.
/// `progress` fires roughly every 5% of runs. Setting `cancel` stops new
/// runs promptly; fractions are reported over the runs that completed.
pub fn run_simulation(
    tree: &BracketTree,
    entry_id: u64,
    picks: &[Pick],
    mode: ScoringMode,
    options: &SimulationOptions,
    model: &dyn WinModel,
    cancel: &AtomicBool,
    progress: &(dyn Fn(f64) + Sync),
) -> Result<SimulationResult, EngineError> {
    if options.run_count < MIN_SIMULATION_RUNS || options.run_count > MAX_SIMULATION_RUNS {
        return Err(EngineError::SimulationRequestInvalid(format!(
            "run count {} outside {}..={}",
            options.run_count, MIN_SIMULATION_RUNS, MAX_SIMULATION_RUNS
        )));
    }

    let mut registry: Vec<TeamRef> = Vec::new();
    let mut by_name: HashMap<String, u16> = HashMap::new();

    let picks_by_node: HashMap<u64, &Pick> =
        picks.iter().map(|pick| (pick.node_id, pick)).collect();
    let plan_index: HashMap<u64, usize> = tree
        .order
        .iter()
        .enumerate()
        .map(|(index, id)| (*id, index))
        .collect();

    let mut plan: Vec<PlanNode> = Vec::with_capacity(tree.order.len());
    let mut base: Vec<[Option<u16>; 2]> = Vec::with_capacity(tree.order.len());
    for id in &tree.order {
        let node = tree.node(*id)?;
        let home = node
            .home_team
            .as_deref()
            .map(|team| intern(&mut registry, &mut by_name, team, tree.seed_for_team(team)));
        let away = node
            .away_team
            .as_deref()
            .map(|team| intern(&mut registry, &mut by_name, team, tree.seed_for_team(team)));
        let decided = node
            .winner
            .as_deref()
            .filter(|_| node.game_status.is_final())
            .map(|team| intern(&mut registry, &mut by_name, team, tree.seed_for_team(team)));
        let pick = picks_by_node.get(id);
        let pick_team = pick.and_then(|pick| {
            by_name.get(&pick.picked_team.to_lowercase()).copied()
        });
        plan.push(PlanNode {
            node_id: *id,
            round: node.round,
            slot: node.slot,
            decided,
            next: node.next_node_id.and_then(|next_id| {
                let side = match node.next_node_side {
                    Some(crate::types::Side::Home) => 0,
                    Some(crate::types::Side::Away) => 1,
                    None => return None,
                };
                plan_index.get(&next_id).map(|index| (*index, side))
            }),
            has_pick: pick.is_some(),
            pick_team,
            pick_name: pick.map(|pick| pick.picked_team.clone()),
        });
        base.push([home, away]);
    }

    let total = options.run_count;
    let workers = options.workers.max(1).min(total as usize);
    let base_seed = options.seed.unwrap_or_else(|| now_ms() ^ 0x9E37_79B9_7F4A_7C15);
    let step = (u64::from(total) / 20).max(1);
    let completed = AtomicU64::new(0);

    let chunk = total as usize / workers;
    let remainder = total as usize % workers;

    let merged: Result<(Vec<Vec<u32>>, Vec<u32>), EngineError> = thread::scope(|scope| {
        let plan = &plan;
        let registry = &registry;
        let base = &base;
        let completed = &completed;

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let runs = chunk + usize::from(worker < remainder);
            let rng = SimRng::new(
                base_seed.wrapping_add((worker as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            );
            handles.push(scope.spawn(move || {
                run_chunk(
                    plan, registry, base, mode, runs, total, step, rng, completed, cancel,
                    progress, model,
                )
            }));
        }

        let mut wins_total = vec![vec![0u32; registry.len()]; plan.len()];
        let mut scores_all: Vec<u32> = Vec::with_capacity(total as usize);
        for handle in handles {
            let (wins, scores) = handle
                .join()
                .map_err(|_| EngineError::Provider("simulation worker panicked".to_string()))?;
            for (total_row, row) in wins_total.iter_mut().zip(wins) {
                for (acc, value) in total_row.iter_mut().zip(row) {
                    *acc += value;
                }
            }
            scores_all.extend(scores);
        }
        Ok((wins_total, scores_all))
    });
    let (wins, mut scores) = merged?;

    let done = scores.len() as u32;
    if done == 0 {
        return Err(EngineError::Cancelled);
    }
    let denom = f64::from(done);

    let mut nodes = Vec::new();
    for (index, plan_node) in plan.iter().enumerate() {
        let mut fractions: Vec<TeamFraction> = wins[index]
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(team, count)| TeamFraction {
                team: registry[team].name.clone(),
                fraction: f64::from(*count) / denom,
            })
            .collect();
        if fractions.is_empty() {
            continue;
        }
        fractions.sort_by(|a, b| {
            b.fraction
                .partial_cmp(&a.fraction)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.team.cmp(&b.team))
        });
        let survival = if plan_node.has_pick {
            let count = plan_node
                .pick_team
                .map(|team| wins[index][team as usize])
                .unwrap_or(0);
            Some(f64::from(count) / denom)
        } else {
            None
        };
        nodes.push(NodeProjection {
            node_id: plan_node.node_id,
            round: plan_node.round,
            slot: plan_node.slot,
            decided: plan_node.decided.is_some(),
            picked_team: plan_node.pick_name.clone(),
            survival,
            win_fractions: fractions,
        });
    }

    // Wide accumulation before the single divide.
    let points_sum: u64 = scores.iter().map(|points| u64::from(*points)).sum();
    let expected_points = points_sum as f64 / denom;
    scores.sort_unstable();
    let percentile = |q: f64| -> u32 {
        let index = ((scores.len() - 1) as f64 * q).round() as usize;
        scores[index]
    };

    Ok(SimulationResult {
        tournament_id: tree.tournament_id,
        entry_id,
        run_count: done,
        model_version: MODEL_VERSION,
        mode,
        nodes,
        expected_points,
        percentiles: PointsPercentiles {
            p10: percentile(0.10),
            p50: percentile(0.50),
            p90: percentile(0.90),
        },
        generated_at_ms: now_ms(),
    })
}

fn intern(
    registry: &mut Vec<TeamRef>,
    by_name: &mut HashMap<String, u16>,
    name: &str,
    seed: Option<u32>,
) -> u16 {
    let key = name.to_lowercase();
    if let Some(index) = by_name.get(&key) {
        return *index;
    }
    let index = registry.len() as u16;
    registry.push(TeamRef { name: name.to_string(), seed });
    by_name.insert(key, index);
    index
}

#[allow(clippy::too_many_arguments)]
fn run_chunk(
    plan: &[PlanNode],
    registry: &[TeamRef],
    base: &[[Option<u16>; 2]],
    mode: ScoringMode,
    runs: usize,
    total: u32,
    step: u64,
    mut rng: SimRng,
    completed: &AtomicU64,
    cancel: &AtomicBool,
    progress: &(dyn Fn(f64) + Sync),
    model: &dyn WinModel,
) -> (Vec<Vec<u32>>, Vec<u32>) {
    let mut wins = vec![vec![0u32; registry.len()]; plan.len()];
    let mut scores = Vec::with_capacity(runs);
    let mut state: Vec<[Option<u16>; 2]> = base.to_vec();

    for _ in 0..runs {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        state.copy_from_slice(base);
        let mut run_points = 0u32;

        for (index, plan_node) in plan.iter().enumerate() {
            let slots = state[index];
            let winner = match plan_node.decided {
                // Real-world result: used verbatim.
                Some(team) => Some(team),
                None => match (slots[0], slots[1]) {
                    (Some(home), Some(away)) => {
                        let p = model
                            .home_win_probability(&registry[home as usize], &registry[away as usize]);
                        Some(if rng.next_f64() < p { home } else { away })
                    }
                    // Byes advance without spending randomness.
                    (Some(home), None) => Some(home),
                    (None, Some(away)) => Some(away),
                    (None, None) => None,
                },
            };
            let Some(winner) = winner else {
                continue;
            };
            wins[index][winner as usize] += 1;
            if plan_node.pick_team == Some(winner) {
                let loser = if slots[0] == Some(winner) { slots[1] } else { slots[0] };
                let winner_seed = registry[winner as usize].seed;
                let loser_seed = loser.and_then(|team| registry[team as usize].seed);
                run_points += mode.points_for(plan_node.round, winner_seed, loser_seed);
            }
            if let Some((next, side)) = plan_node.next {
                state[next][side] = Some(winner);
            }
        }

        scores.push(run_points);
        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
        if done % step == 0 || done == u64::from(total) {
            progress(done as f64 / f64::from(total));
        }
    }

    (wins, scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::BracketNode;
    use crate::types::{GameStatus, Side};
    use std::sync::Mutex;

    fn node(id: u64, round: u32, slot: u32, next: Option<(u64, Side)>) -> BracketNode {
        BracketNode {
            id,
            tournament_id: 1,
            round,
            region: None,
            slot,
            home_seed: None,
            away_seed: None,
            home_team: None,
            away_team: None,
            next_node_id: next.map(|(next_id, _)| next_id),
            next_node_side: next.map(|(_, side)| side),
            game_id: None,
            game_status: GameStatus::Scheduled,
            winner: None,
        }
    }

    /// A/B and C/D feeding a championship node, with round 1 already final
    /// (A and C won) and round 2 undecided.
    fn semifinals_done_tree() -> BracketTree {
        let mut one = node(1, 1, 0, Some((3, Side::Home)));
        one.home_team = Some("A".to_string());
        one.away_team = Some("B".to_string());
        one.home_seed = Some(1);
        one.away_seed = Some(4);
        one.winner = Some("A".to_string());
        one.game_status = GameStatus::Final;
        let mut two = node(2, 1, 1, Some((3, Side::Away)));
        two.home_team = Some("C".to_string());
        two.away_team = Some("D".to_string());
        two.home_seed = Some(2);
        two.away_seed = Some(3);
        two.winner = Some("C".to_string());
        two.game_status = GameStatus::Final;
        let mut three = node(3, 2, 0, None);
        three.home_team = Some("A".to_string());
        three.away_team = Some("C".to_string());
        BracketTree::build(vec![one, two, three]).unwrap()
    }

    fn options(run_count: u32, seed: u64) -> SimulationOptions {
        SimulationOptions { run_count, seed: Some(seed), workers: 2 }
    }

    fn no_progress() -> impl Fn(f64) + Sync {
        |_: f64| {}
    }

    #[test]
    fn coin_flip_final_lands_near_half() {
        let tree = semifinals_done_tree();
        let picks = vec![Pick::new(10, 3, "A")];
        let cancel = AtomicBool::new(false);
        let result = run_simulation(
            &tree,
            10,
            &picks,
            ScoringMode::Classic,
            &options(1_000, 42),
            &FixedProbabilityModel(0.5),
            &cancel,
            &no_progress(),
        )
        .unwrap();

        let championship = result.nodes.iter().find(|n| n.node_id == 3).unwrap();
        let survival = championship.survival.unwrap();
        assert!((survival - 0.5).abs() < 0.08, "survival {survival} far from 0.5");

        // Exactly one of A and C wins each run: fractions sum to 1.
        let sum: f64 = championship.win_fractions.iter().map(|f| f.fraction).sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert_eq!(championship.win_fractions.len(), 2);
    }

    #[test]
    fn fully_decided_bracket_is_deterministic() {
        let mut tree = semifinals_done_tree();
        {
            let three = tree.node_mut(3).unwrap();
            three.winner = Some("A".to_string());
            three.game_status = GameStatus::Final;
        }
        let picks = vec![Pick::new(10, 1, "A"), Pick::new(10, 3, "C")];
        let cancel = AtomicBool::new(false);

        for runs in [100u32, 1_000] {
            let result = run_simulation(
                &tree,
                10,
                &picks,
                ScoringMode::Classic,
                &options(runs, 7),
                &SeedWeightModel::default(),
                &cancel,
                &no_progress(),
            )
            .unwrap();
            let one = result.nodes.iter().find(|n| n.node_id == 1).unwrap();
            assert_eq!(one.survival, Some(1.0));
            let three = result.nodes.iter().find(|n| n.node_id == 3).unwrap();
            assert_eq!(three.survival, Some(0.0));
            assert!(three.decided);
            // Only round 1 scores: weight 1, every run identical.
            assert_eq!(result.expected_points, 1.0);
            assert_eq!(result.percentiles.p10, 1);
            assert_eq!(result.percentiles.p90, 1);
        }
    }

    #[test]
    fn estimates_tighten_with_more_runs() {
        let tree = semifinals_done_tree();
        let picks = vec![Pick::new(10, 3, "A")];
        let cancel = AtomicBool::new(false);

        let survival_at = |runs: u32| {
            let result = run_simulation(
                &tree,
                10,
                &picks,
                ScoringMode::Classic,
                &options(runs, 1234),
                &FixedProbabilityModel(0.5),
                &cancel,
                &no_progress(),
            )
            .unwrap();
            result.nodes.iter().find(|n| n.node_id == 3).unwrap().survival.unwrap()
        };

        // Sampling error bounds: loose at 100 runs, tight at 10_000.
        assert!((survival_at(100) - 0.5).abs() < 0.15);
        assert!((survival_at(10_000) - 0.5).abs() < 0.03);
    }

    #[test]
    fn fixed_seed_reproduces_identical_results() {
        let tree = semifinals_done_tree();
        let picks = vec![Pick::new(10, 3, "A")];
        let cancel = AtomicBool::new(false);
        let run = || {
            run_simulation(
                &tree,
                10,
                &picks,
                ScoringMode::Classic,
                &options(500, 99),
                &SeedWeightModel::default(),
                &cancel,
                &no_progress(),
            )
            .unwrap()
        };
        let first = run();
        let second = run();
        assert_eq!(first.expected_points, second.expected_points);
        let survival = |result: &SimulationResult| {
            result.nodes.iter().find(|n| n.node_id == 3).unwrap().survival
        };
        assert_eq!(survival(&first), survival(&second));
    }

    #[test]
    fn progress_fires_coarsely_and_reaches_one() {
        let tree = semifinals_done_tree();
        let picks = vec![Pick::new(10, 3, "A")];
        let cancel = AtomicBool::new(false);
        let seen: Mutex<Vec<f64>> = Mutex::new(Vec::new());
        let progress = |fraction: f64| {
            seen.lock().unwrap().push(fraction);
        };
        run_simulation(
            &tree,
            10,
            &picks,
            ScoringMode::Classic,
            &SimulationOptions { run_count: 1_000, seed: Some(5), workers: 1 },
            &FixedProbabilityModel(0.5),
            &cancel,
            &progress,
        )
        .unwrap();
        let seen = seen.into_inner().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.len() <= 21);
        assert_eq!(*seen.last().unwrap(), 1.0);
    }

    #[test]
    fn cancelled_before_start_reports_cancelled() {
        let tree = semifinals_done_tree();
        let cancel = AtomicBool::new(true);
        let err = run_simulation(
            &tree,
            10,
            &[],
            ScoringMode::Classic,
            &options(500, 1),
            &FixedProbabilityModel(0.5),
            &cancel,
            &no_progress(),
        )
        .unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }

    #[test]
    fn out_of_bounds_run_count_is_rejected() {
        let tree = semifinals_done_tree();
        let cancel = AtomicBool::new(false);
        let err = run_simulation(
            &tree,
            10,
            &[],
            ScoringMode::Classic,
            &options(50, 1),
            &FixedProbabilityModel(0.5),
            &cancel,
            &no_progress(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::SimulationRequestInvalid(_)));
    }

    #[test]
    fn bye_advances_without_randomness() {
        let mut one = node(1, 1, 0, Some((3, Side::Home)));
        one.home_team = Some("A".to_string());
        one.home_seed = Some(1);
        let mut two = node(2, 1, 1, Some((3, Side::Away)));
        two.home_team = Some("C".to_string());
        two.away_team = Some("D".to_string());
        two.home_seed = Some(2);
        two.away_seed = Some(3);
        let three = node(3, 2, 0, None);
        let tree = BracketTree::build(vec![one, two, three]).unwrap();
        let cancel = AtomicBool::new(false);

        let result = run_simulation(
            &tree,
            10,
            &[],
            ScoringMode::Classic,
            &options(200, 3),
            &FixedProbabilityModel(0.5),
            &cancel,
            &no_progress(),
        )
        .unwrap();
        let bye = result.nodes.iter().find(|n| n.node_id == 1).unwrap();
        assert_eq!(bye.win_fractions.len(), 1);
        assert_eq!(bye.win_fractions[0].team, "A");
        assert_eq!(bye.win_fractions[0].fraction, 1.0);
    }
}
