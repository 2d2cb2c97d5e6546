use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::EngineError;
use crate::types::{FieldTeam, GameStatus, Side};

// ── Nodes ───────────────────────────────────────────────────────────────

/// One game slot in the single-elimination tree, addressed by
/// (round, region, slot). Seeds are populated for round 1 only and are
/// immutable once the field is set; team names in later rounds are filled
/// in by the advancement state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketNode {
    pub id: u64,
    pub tournament_id: u64,
    /// 1-based; strictly increases along every outgoing edge.
    pub round: u32,
    pub region: Option<String>,
    /// 0-based position within the round.
    pub slot: u32,
    pub home_seed: Option<u32>,
    pub away_seed: Option<u32>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    /// `None` only for the championship (terminal) node.
    pub next_node_id: Option<u64>,
    pub next_node_side: Option<Side>,
    /// Binding to an external game record once a matchup is scheduled.
    pub game_id: Option<u64>,
    /// One-shot advancement latch: `Final` means scored and propagated.
    #[serde(default)]
    pub game_status: GameStatus,
    pub winner: Option<String>,
}

impl BracketNode {
    pub fn is_terminal(&self) -> bool {
        self.next_node_id.is_none()
    }

    pub fn team(&self, side: Side) -> Option<&str> {
        match side {
            Side::Home => self.home_team.as_deref(),
            Side::Away => self.away_team.as_deref(),
        }
    }

    pub fn seed(&self, side: Side) -> Option<u32> {
        match side {
            Side::Home => self.home_seed,
            Side::Away => self.away_seed,
        }
    }
}

// ── Tree ────────────────────────────────────────────────────────────────

/// Canonical representation of one tournament's node graph: id lookup,
/// derived adjacency, and the dependency-respecting traversal order.
#[derive(Debug, Clone)]
pub struct BracketTree {
    pub tournament_id: u64,
    nodes: HashMap<u64, BracketNode>,
    /// Node ids sorted by (round asc, slot asc). Round number encodes
    /// dependency depth, so this order never reads a node before its
    /// inputs were written.
    pub order: Vec<u64>,
    /// next_node_id -> nodes feeding into it.
    pub dependents: HashMap<u64, Vec<u64>>,
    pub terminal_id: u64,
    pub max_round: u32,
    /// Lowercased round-1 team name -> seed. Used for win-probability
    /// heuristics and upset bonuses in later rounds.
    pub team_seeds: HashMap<String, u32>,
}

impl BracketTree {
    pub fn build(nodes: Vec<BracketNode>) -> Result<Self, EngineError> {
        if nodes.is_empty() {
            return Err(EngineError::MalformedBracket("no nodes".to_string()));
        }
        let tournament_id = nodes[0].tournament_id;
        let max_round = nodes.iter().map(|node| node.round).max().unwrap_or(1);

        let mut lookup: HashMap<u64, BracketNode> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            if lookup.insert(node.id, node).is_some() {
                return Err(EngineError::MalformedBracket("duplicate node id".to_string()));
            }
        }

        let mut terminal_id = None;
        let mut dependents: HashMap<u64, Vec<u64>> = HashMap::new();
        for node in lookup.values() {
            match node.next_node_id {
                None => {
                    if terminal_id.is_some() {
                        return Err(EngineError::MalformedBracket(
                            "multiple terminal nodes".to_string(),
                        ));
                    }
                    terminal_id = Some(node.id);
                }
                Some(next_id) => {
                    let next = lookup.get(&next_id).ok_or_else(|| {
                        EngineError::MalformedBracket(format!(
                            "node {} points at missing node {next_id}",
                            node.id
                        ))
                    })?;
                    if next.round <= node.round {
                        return Err(EngineError::MalformedBracket(format!(
                            "edge {} -> {next_id} does not increase round",
                            node.id
                        )));
                    }
                    if node.next_node_side.is_none() {
                        return Err(EngineError::MalformedBracket(format!(
                            "node {} has an edge without a side",
                            node.id
                        )));
                    }
                    dependents.entry(next_id).or_default().push(node.id);
                }
            }
        }
        let terminal_id = terminal_id.ok_or_else(|| {
            EngineError::MalformedBracket("no terminal node".to_string())
        })?;
        if lookup[&terminal_id].round != max_round {
            return Err(EngineError::MalformedBracket(
                "terminal node is not in the last round".to_string(),
            ));
        }
        for children in dependents.values_mut() {
            children.sort();
        }

        // Defensive only: the round check above already rules cycles out,
        // but a walk with a step budget catches anything it missed.
        let budget = lookup.len() as u32;
        for node in lookup.values() {
            let mut current = node.id;
            let mut steps = 0u32;
            while let Some(next_id) = lookup[&current].next_node_id {
                steps += 1;
                if steps > budget {
                    return Err(EngineError::MalformedBracket(format!(
                        "cycle reachable from node {}",
                        node.id
                    )));
                }
                current = next_id;
            }
        }

        let mut order: Vec<u64> = lookup.keys().copied().collect();
        order.sort_by_key(|id| {
            let node = &lookup[id];
            (node.round, node.slot)
        });

        let mut team_seeds = HashMap::new();
        for node in lookup.values().filter(|node| node.round == 1) {
            if let (Some(team), Some(seed)) = (node.home_team.as_ref(), node.home_seed) {
                team_seeds.insert(team.to_lowercase(), seed);
            }
            if let (Some(team), Some(seed)) = (node.away_team.as_ref(), node.away_seed) {
                team_seeds.insert(team.to_lowercase(), seed);
            }
        }

        Ok(BracketTree {
            tournament_id,
            nodes: lookup,
            order,
            dependents,
            terminal_id,
            max_round,
            team_seeds,
        })
    }

    pub fn get(&self, id: u64) -> Option<&BracketNode> {
        self.nodes.get(&id)
    }

    pub fn node(&self, id: u64) -> Result<&BracketNode, EngineError> {
        self.nodes.get(&id).ok_or(EngineError::UnknownNode(id))
    }

    pub fn node_mut(&mut self, id: u64) -> Result<&mut BracketNode, EngineError> {
        self.nodes.get_mut(&id).ok_or(EngineError::UnknownNode(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// game_id -> node_id for every node bound to an external game.
    pub fn game_index(&self) -> HashMap<u64, u64> {
        self.nodes
            .values()
            .filter_map(|node| node.game_id.map(|game_id| (game_id, node.id)))
            .collect()
    }

    pub fn seed_for_team(&self, team: &str) -> Option<u32> {
        self.team_seeds.get(&team.to_lowercase()).copied()
    }

    /// Number of edges between a node and the championship node.
    pub fn steps_to_terminal(&self, id: u64) -> Option<u32> {
        let mut current = self.nodes.get(&id)?;
        let mut steps = 0;
        while let Some(next_id) = current.next_node_id {
            current = self.nodes.get(&next_id)?;
            steps += 1;
        }
        Some(steps)
    }
}

// ── Seeding ─────────────────────────────────────────────────────────────

/// Standard single-elimination placement: seed 1 meets the weakest seed,
/// the 2-seed lands in the opposite half, and so on.
pub fn seed_positions(size: u32) -> Vec<u32> {
    let mut seeds = vec![1u32];
    while seeds.len() < size as usize {
        let n = seeds.len() as u32;
        let mut next = Vec::with_capacity(seeds.len() * 2);
        for seed in seeds.iter().copied() {
            next.push(seed);
            next.push((n * 2 + 1).saturating_sub(seed));
        }
        seeds = next;
    }
    seeds
}

fn next_power_of_two(n: usize) -> usize {
    n.max(2).next_power_of_two()
}

fn normalize_field_seeds(teams: &[FieldTeam]) -> Vec<(FieldTeam, u32)> {
    let mut used = std::collections::HashSet::new();
    let mut assigned: Vec<(FieldTeam, u32)> = Vec::with_capacity(teams.len());
    for team in teams {
        let seed = team.seed.filter(|s| *s > 0 && used.insert(*s)).unwrap_or(0);
        assigned.push((team.clone(), seed));
    }
    let mut next_seed = 1u32;
    for (_, seed) in assigned.iter_mut() {
        if *seed != 0 {
            continue;
        }
        while used.contains(&next_seed) {
            next_seed += 1;
        }
        *seed = next_seed;
        used.insert(next_seed);
    }
    assigned.sort_by_key(|(_, seed)| *seed);
    assigned
}

/// Build the full node set for a finalized field: round-1 nodes carry the
/// seeded matchups, later rounds start empty, and every non-terminal node
/// is wired to the slot it feeds. Node ids are namespaced under the
/// tournament (high bits) so bulk inserts from different tournaments never
/// collide.
pub fn seed_bracket(tournament_id: u64, teams: &[FieldTeam]) -> Result<Vec<BracketNode>, EngineError> {
    if teams.len() < 2 {
        return Err(EngineError::MalformedBracket(
            "field needs at least two teams".to_string(),
        ));
    }
    let assigned = normalize_field_seeds(teams);
    let by_seed: HashMap<u32, &FieldTeam> = assigned
        .iter()
        .map(|(team, seed)| (*seed, team))
        .collect();

    let bracket_size = next_power_of_two(assigned.len());
    let rounds = bracket_size.trailing_zeros();
    let positions = seed_positions(bracket_size as u32);

    let node_id = |ordinal: u64| (tournament_id << 16) | ordinal;

    let mut nodes = Vec::new();
    let mut ordinal = 0u64;
    let mut round_start: Vec<u64> = Vec::new();

    for round in 1..=rounds {
        round_start.push(ordinal + 1);
        let games = bracket_size >> round;
        for slot in 0..games {
            ordinal += 1;
            let mut node = BracketNode {
                id: node_id(ordinal),
                tournament_id,
                round,
                region: None,
                slot: slot as u32,
                home_seed: None,
                away_seed: None,
                home_team: None,
                away_team: None,
                next_node_id: None,
                next_node_side: None,
                game_id: None,
                game_status: GameStatus::Scheduled,
                winner: None,
            };
            if round == 1 {
                let home_seed = positions[slot * 2];
                let away_seed = positions[slot * 2 + 1];
                let home = by_seed.get(&home_seed);
                let away = by_seed.get(&away_seed);
                node.home_seed = home.map(|_| home_seed);
                node.away_seed = away.map(|_| away_seed);
                node.home_team = home.map(|team| team.name.clone());
                node.away_team = away.map(|team| team.name.clone());
                node.region = match (home.and_then(|t| t.region.as_ref()), away.and_then(|t| t.region.as_ref())) {
                    (Some(a), Some(b)) if a == b => Some(a.clone()),
                    _ => None,
                };
            }
            nodes.push(node);
        }
    }

    // Wire edges: slot s of round r feeds slot s/2 of round r+1; even slots
    // land in the home side.
    for round in 1..rounds {
        let games = (bracket_size >> round) as u64;
        let start = round_start[round as usize - 1];
        let next_start = round_start[round as usize];
        for slot in 0..games {
            let index = (start + slot - 1) as usize;
            nodes[index].next_node_id = Some(node_id(next_start + slot / 2));
            nodes[index].next_node_side = Some(if slot % 2 == 0 { Side::Home } else { Side::Away });
        }
    }

    Ok(nodes)
}
