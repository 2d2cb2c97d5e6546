use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::bracket::seed_bracket;
use crate::error::EngineError;
use crate::provider::SportsDataProvider;
use crate::store::NodeStore;

/// What one poll tick concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Provider reached, field not announced yet. Poll again next tick.
    Waiting,
    /// The tournament already has nodes; nothing to do, ever again.
    AlreadySeeded,
    /// Field arrived and the bracket was built and persisted.
    Seeded { node_count: usize },
}

/// One auto-import tick: if the tournament has no bracket yet and the
/// provider says the field is set, seed the bracket. Idempotent; the store
/// check runs first so a seeded tournament never costs a provider call.
pub fn poll_field_once(
    provider: &dyn SportsDataProvider,
    store: &dyn NodeStore,
    tournament_id: u64,
    season: u32,
) -> Result<PollOutcome, EngineError> {
    if !store.nodes_for_tournament(tournament_id)?.is_empty() {
        return Ok(PollOutcome::AlreadySeeded);
    }

    let field = provider.tournament_field(season)?;
    if !field.is_field_set || field.teams.is_empty() {
        return Ok(PollOutcome::Waiting);
    }

    let nodes = seed_bracket(tournament_id, &field.teams)?;
    store.insert_nodes(&nodes)?;
    info!(
        tournament_id,
        season,
        node_count = nodes.len(),
        team_count = field.teams.len(),
        "bracket seeded from provider field"
    );
    Ok(PollOutcome::Seeded { node_count: nodes.len() })
}

/// Background field poller. Ticks every `interval_ms` until the bracket is
/// seeded or `stop` is raised. Provider errors are logged and absorbed;
/// the next tick retries.
pub fn spawn_field_polling(
    provider: Arc<dyn SportsDataProvider>,
    store: Arc<dyn NodeStore>,
    tournament_id: u64,
    season: u32,
    interval_ms: u64,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        info!(tournament_id, season, interval_ms, "field polling started");
        while !stop.load(Ordering::Relaxed) {
            match poll_field_once(provider.as_ref(), store.as_ref(), tournament_id, season) {
                Ok(PollOutcome::Seeded { node_count }) => {
                    info!(tournament_id, node_count, "field polling finished");
                    return;
                }
                Ok(PollOutcome::AlreadySeeded) => {
                    info!(tournament_id, "bracket already present, field polling stopped");
                    return;
                }
                Ok(PollOutcome::Waiting) => {}
                Err(e) => warn!(tournament_id, "field poll failed: {e}"),
            }
            // Sleep in slices so a stop request is honored promptly.
            let mut remaining = interval_ms;
            while remaining > 0 && !stop.load(Ordering::Relaxed) {
                let slice = remaining.min(100);
                thread::sleep(Duration::from_millis(slice));
                remaining -= slice;
            }
        }
        info!(tournament_id, "field polling stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{FieldTeam, TournamentField};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedProvider {
        fields: Mutex<VecDeque<Result<TournamentField, EngineError>>>,
    }

    impl ScriptedProvider {
        fn new(fields: Vec<Result<TournamentField, EngineError>>) -> Self {
            ScriptedProvider { fields: Mutex::new(fields.into()) }
        }
    }

    impl SportsDataProvider for ScriptedProvider {
        fn tournament_field(&self, _season: u32) -> Result<TournamentField, EngineError> {
            self.fields
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(EngineError::Provider("script exhausted".to_string())))
        }

        fn live_scores(
            &self,
            _game_ids: &[u64],
        ) -> Result<Vec<crate::types::GameResult>, EngineError> {
            Ok(Vec::new())
        }
    }

    fn unset_field() -> TournamentField {
        TournamentField { is_field_set: false, teams: Vec::new(), lock_time: None }
    }

    fn four_team_field() -> TournamentField {
        TournamentField {
            is_field_set: true,
            teams: ["A", "B", "C", "D"]
                .iter()
                .enumerate()
                .map(|(idx, name)| FieldTeam {
                    name: name.to_string(),
                    seed: Some(idx as u32 + 1),
                    region: None,
                })
                .collect(),
            lock_time: None,
        }
    }

    #[test]
    fn waits_then_seeds_then_never_calls_again() {
        let provider = ScriptedProvider::new(vec![Ok(unset_field()), Ok(four_team_field())]);
        let store = MemoryStore::new();

        assert_eq!(poll_field_once(&provider, &store, 1, 2026).unwrap(), PollOutcome::Waiting);
        assert_eq!(
            poll_field_once(&provider, &store, 1, 2026).unwrap(),
            PollOutcome::Seeded { node_count: 3 }
        );
        // Script is exhausted: a further provider call would error. It
        // doesn't, because the store check short-circuits.
        assert_eq!(
            poll_field_once(&provider, &store, 1, 2026).unwrap(),
            PollOutcome::AlreadySeeded
        );
        assert_eq!(store.nodes_for_tournament(1).unwrap().len(), 3);
    }

    #[test]
    fn provider_failure_propagates() {
        let provider =
            ScriptedProvider::new(vec![Err(EngineError::Provider("down".to_string()))]);
        let store = MemoryStore::new();
        let err = poll_field_once(&provider, &store, 1, 2026).unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));
    }

    #[test]
    fn background_poller_stops_after_seeding() {
        let provider: Arc<dyn SportsDataProvider> =
            Arc::new(ScriptedProvider::new(vec![Ok(unset_field()), Ok(four_team_field())]));
        let store = Arc::new(MemoryStore::new());
        let stop = Arc::new(AtomicBool::new(false));

        let handle = spawn_field_polling(
            provider,
            Arc::clone(&store) as Arc<dyn NodeStore>,
            1,
            2026,
            10,
            Arc::clone(&stop),
        );
        handle.join().unwrap();
        assert_eq!(store.nodes_for_tournament(1).unwrap().len(), 3);
    }
}
