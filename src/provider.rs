use std::thread::sleep;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::EngineError;
use crate::types::{FieldTeam, GameResult, GameStatus, TournamentField};

// ── Provider interface ──────────────────────────────────────────────────

/// Upstream sports-data source. The engine only ever consumes these two
/// feeds; everything else it derives itself.
pub trait SportsDataProvider: Send + Sync {
    /// The season's tournament field, possibly not yet announced.
    fn tournament_field(&self, season: u32) -> Result<TournamentField, EngineError>;

    /// Current score rows for the given games.
    fn live_scores(&self, game_ids: &[u64]) -> Result<Vec<GameResult>, EngineError>;
}

// ── Wire format ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireField {
    #[serde(default)]
    is_field_set: bool,
    #[serde(default)]
    teams: Vec<WireTeam>,
    #[serde(default)]
    lock_time: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTeam {
    name: String,
    #[serde(default)]
    seed: Option<u32>,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireGame {
    game_id: u64,
    #[serde(default)]
    home_team: Option<String>,
    #[serde(default)]
    away_team: Option<String>,
    #[serde(default)]
    home_score: Option<u32>,
    #[serde(default)]
    away_score: Option<u32>,
    #[serde(default)]
    status: Option<String>,
}

/// Lenient status parsing: providers disagree on spelling and new values
/// appear without warning. Anything unrecognized maps to `Unknown`, which
/// the engine treats as not-final.
pub fn map_game_status(raw: Option<&str>) -> GameStatus {
    let Some(raw) = raw else {
        return GameStatus::Unknown;
    };
    match raw.trim().to_lowercase().as_str() {
        "scheduled" | "pre" | "pregame" | "created" => GameStatus::Scheduled,
        "inprogress" | "in_progress" | "live" | "halftime" => GameStatus::InProgress,
        "final" | "f" | "complete" | "completed" | "closed" => GameStatus::Final,
        other => {
            warn!("unrecognized game status {other:?}");
            GameStatus::Unknown
        }
    }
}

// ── HTTP implementation ─────────────────────────────────────────────────

const MAX_ATTEMPTS: u32 = 3;

pub struct HttpSportsProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    token: String,
}

impl HttpSportsProvider {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        HttpSportsProvider {
            client: reqwest::blocking::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    /// GET with a short backoff. Transient failures are the norm during
    /// game days; the poller's cadence absorbs anything longer.
    fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, EngineError> {
        let url = format!("{}{path}", self.base_url);
        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .send()
                .and_then(|response| response.error_for_status());
            match response {
                Ok(response) => match response.json::<T>() {
                    Ok(body) => return Ok(body),
                    Err(e) => last_error = format!("bad response body: {e}"),
                },
                Err(e) => last_error = e.to_string(),
            }
            warn!("provider request failed (attempt {attempt}/{MAX_ATTEMPTS}): {last_error}");
            if attempt < MAX_ATTEMPTS {
                sleep(Duration::from_millis(500 * u64::from(attempt)));
            }
        }
        Err(EngineError::Provider(last_error))
    }
}

impl SportsDataProvider for HttpSportsProvider {
    fn tournament_field(&self, season: u32) -> Result<TournamentField, EngineError> {
        let wire: WireField = self.get_json(&format!("/seasons/{season}/field"))?;
        Ok(TournamentField {
            is_field_set: wire.is_field_set,
            teams: wire
                .teams
                .into_iter()
                .map(|team| FieldTeam { name: team.name, seed: team.seed, region: team.region })
                .collect(),
            lock_time: wire.lock_time,
        })
    }

    fn live_scores(&self, game_ids: &[u64]) -> Result<Vec<GameResult>, EngineError> {
        if game_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = game_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let wire: Vec<WireGame> = self.get_json(&format!("/scores?gameIds={ids}"))?;
        Ok(wire
            .into_iter()
            .map(|game| GameResult {
                game_id: game.game_id,
                home_team: game.home_team,
                away_team: game.away_team,
                home_score: game.home_score,
                away_score: game.away_score,
                status: map_game_status(game.status.as_deref()),
            })
            .collect())
    }
}
