//! Wire format of the analysis engine.
//!
//! Requests and responses are JSON objects, one per line. The caller picks the request `id`
//! and the engine echoes it back; that is the only way to tell which answer belongs to which
//! question, since an engine may answer out of order or still have output buffered from an
//! earlier, abandoned query.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::game::Color;

static QUERY_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A query id never handed out before in this process: `<prefix>-<n>`.
pub fn unique_query_id(prefix: &str) -> String {
    format!("{prefix}-{}", QUERY_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// One move as the engine reads it: `["B", "D4"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMove(pub Color, pub String);

impl std::fmt::Display for EngineMove {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.0, self.1)
    }
}

/// Optional outputs requested from the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Ask for the per-point ownership map.
    pub include_ownership: bool,
    /// Ask for the policy output.
    pub include_policy: bool,
    /// Ask for visit counts along principal variations.
    pub include_pv_visits: bool,
}

/// A single analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Unique per request; echoed by the engine.
    pub id: String,
    /// Moves leading to the analysed position, already in engine coordinates.
    pub moves: Vec<EngineMove>,
    /// Board edge length.
    pub board_size: u8,
    /// Komi.
    pub komi: f64,
    /// Rule set tag.
    pub rules: String,
    /// Ply indices to report on.
    pub analysis_targets: Vec<usize>,
    /// Maximum search visits.
    pub visit_budget: u32,
    /// Maximum search time in seconds.
    pub time_budget: Option<f64>,
    /// Optional outputs.
    pub options: QueryOptions,
}

impl Query {
    /// Engine request object for this query.
    pub fn to_request(&self) -> EngineRequest<'_> {
        EngineRequest {
            id: &self.id,
            moves: &self.moves,
            rules: &self.rules,
            komi: self.komi,
            board_x_size: self.board_size,
            board_y_size: self.board_size,
            analyze_turns: &self.analysis_targets,
            max_visits: self.visit_budget,
            max_time: self.time_budget,
            include_ownership: self.options.include_ownership.then_some(true),
            include_policy: self.options.include_policy.then_some(true),
            include_pv_visits: self.options.include_pv_visits.then_some(true),
        }
    }

    /// Single-line JSON form of the request.
    pub fn to_request_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_request())
    }
}

/// Serialized shape of a request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRequest<'a> {
    id: &'a str,
    moves: &'a [EngineMove],
    rules: &'a str,
    komi: f64,
    board_x_size: u8,
    board_y_size: u8,
    analyze_turns: &'a [usize],
    max_visits: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_ownership: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_policy: Option<bool>,
    #[serde(rename = "includePVVisits", skip_serializing_if = "Option::is_none")]
    include_pv_visits: Option<bool>,
}

/// Evaluation of the analysed position itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootEvaluation {
    /// Search visits spent. Zero means the engine did not really answer.
    pub visits: u32,
    /// Win probability, mover's perspective.
    pub winrate: f64,
    /// Estimated lead in points.
    pub score_lead: f64,
    /// Mean score, when reported.
    pub score_mean: Option<f64>,
}

/// One candidate move, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMove {
    /// Engine coordinate of the move.
    #[serde(rename = "move")]
    pub mv: String,
    /// Visits spent on this move.
    pub visits: u32,
    /// Win probability after this move.
    pub winrate: f64,
    /// Lead after this move.
    pub score_lead: f64,
    /// Principal variation starting with this move.
    pub principal_variation: Vec<String>,
}

/// A decoded engine answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Echo of the query id.
    pub id: String,
    /// Root evaluation.
    pub root: RootEvaluation,
    /// Candidate moves ordered by rank.
    pub candidate_moves: Vec<CandidateMove>,
    /// Ownership map, row-major, when requested.
    pub ownership: Option<Vec<f64>>,
}

impl AnalysisResult {
    /// `visits == 0`: the call succeeded but carries no evaluation.
    pub fn is_degenerate(&self) -> bool {
        self.root.visits == 0
    }

    /// Best candidate, if any.
    pub fn best_move(&self) -> Option<&CandidateMove> {
        self.candidate_moves.first()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRootInfo {
    #[serde(default)]
    visits: u32,
    #[serde(default)]
    winrate: f64,
    #[serde(default)]
    score_lead: f64,
    score_mean: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMoveInfo {
    #[serde(rename = "move")]
    mv: String,
    #[serde(default)]
    visits: u32,
    #[serde(default)]
    winrate: f64,
    #[serde(default)]
    score_lead: f64,
    order: Option<u32>,
    #[serde(default)]
    pv: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResponse {
    id: String,
    root_info: Option<RawRootInfo>,
    #[serde(default)]
    move_infos: Vec<RawMoveInfo>,
    ownership: Option<Vec<f64>>,
    error: Option<String>,
    warning: Option<String>,
    field: Option<String>,
    #[serde(default)]
    is_during_search: bool,
}

/// What a line of engine output turned out to be, relative to the query being waited on.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseLine {
    /// The answer to our query.
    Answer(AnalysisResult),
    /// The engine refused our query.
    Rejected(String),
    /// The engine warned about our query; an answer may still follow.
    Warning(String),
    /// Well-formed, but carries our id without a usable body.
    Malformed(String),
    /// Well-formed response for another query (stale or foreign).
    Foreign(String),
    /// Not a JSON object with an `id` (engine log noise, blank line).
    Noise,
}

/// Classify one output line against the id of the query being waited on.
pub fn classify_line(line: &str, expected_id: &str) -> ResponseLine {
    let line = line.trim();
    if !line.starts_with('{') {
        return ResponseLine::Noise;
    }
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return ResponseLine::Noise,
    };
    let Some(id) = value.get("id").and_then(serde_json::Value::as_str) else {
        return ResponseLine::Noise;
    };
    if id != expected_id {
        return ResponseLine::Foreign(id.to_string());
    }
    decode_response(value)
}

/// Decode a response object whose id is already known to match.
pub fn decode_response(value: serde_json::Value) -> ResponseLine {
    let raw: RawResponse = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => return ResponseLine::Malformed(e.to_string()),
    };
    let with_field = |msg: String| match &raw.field {
        Some(field) => format!("{msg} (field '{field}')"),
        None => msg,
    };
    if let Some(error) = raw.error.clone() {
        return ResponseLine::Rejected(with_field(error));
    }
    if let Some(warning) = raw.warning.clone() {
        return ResponseLine::Warning(with_field(warning));
    }
    if raw.is_during_search {
        return ResponseLine::Warning("partial result during search".to_string());
    }
    let Some(root) = raw.root_info else {
        return ResponseLine::Malformed("response has no rootInfo".to_string());
    };

    let mut move_infos = raw.move_infos;
    if move_infos.iter().all(|m| m.order.is_some()) {
        move_infos.sort_by_key(|m| m.order);
    }

    ResponseLine::Answer(AnalysisResult {
        id: raw.id,
        root: RootEvaluation {
            visits: root.visits,
            winrate: root.winrate,
            score_lead: root.score_lead,
            score_mean: root.score_mean,
        },
        candidate_moves: move_infos
            .into_iter()
            .map(|m| CandidateMove {
                mv: m.mv,
                visits: m.visits,
                winrate: m.winrate,
                score_lead: m.score_lead,
                principal_variation: m.pv,
            })
            .collect(),
        ownership: raw.ownership,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> Query {
        Query {
            id: "q1".to_string(),
            moves: vec![EngineMove(Color::Black, "D4".to_string())],
            board_size: 19,
            komi: 7.5,
            rules: "tromp-taylor".to_string(),
            analysis_targets: vec![1],
            visit_budget: 200,
            time_budget: None,
            options: QueryOptions {
                include_pv_visits: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn request_field_names() {
        let line = query().to_request_line().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["moves"], serde_json::json!([["B", "D4"]]));
        assert_eq!(value["boardXSize"], 19);
        assert_eq!(value["boardYSize"], 19);
        assert_eq!(value["analyzeTurns"], serde_json::json!([1]));
        assert_eq!(value["maxVisits"], 200);
        assert_eq!(value["includePVVisits"], true);
        assert!(value.get("maxTime").is_none());
        assert!(value.get("includeOwnership").is_none());
        assert!(!line.contains('\n'));
    }

    #[test]
    fn classify_answer_and_order() {
        let line = r#"{"id":"q1","rootInfo":{"visits":10,"winrate":0.6,"scoreLead":2.5},
            "moveInfos":[{"move":"Q16","visits":3,"winrate":0.5,"scoreLead":1.0,"order":1,"pv":["Q16"]},
                         {"move":"D16","visits":7,"winrate":0.6,"scoreLead":2.5,"order":0,"pv":["D16","Q16"]}]}"#
            .replace('\n', "");
        let ResponseLine::Answer(result) = classify_line(&line, "q1") else {
            panic!("expected answer");
        };
        assert_eq!(result.root.visits, 10);
        assert_eq!(result.best_move().unwrap().mv, "D16");
        assert_eq!(result.candidate_moves[0].principal_variation, vec!["D16", "Q16"]);
    }

    #[test]
    fn classify_other_lines() {
        assert_eq!(classify_line("KataGo v1.15 loaded", "q1"), ResponseLine::Noise);
        assert_eq!(classify_line("{not json", "q1"), ResponseLine::Noise);
        assert_eq!(
            classify_line(r#"{"id":"old","rootInfo":{"visits":1}}"#, "q1"),
            ResponseLine::Foreign("old".to_string())
        );
        assert_eq!(
            classify_line(r#"{"id":"q1","error":"bad move","field":"moves"}"#, "q1"),
            ResponseLine::Rejected("bad move (field 'moves')".to_string())
        );
        assert!(matches!(
            classify_line(r#"{"id":"q1","warning":"unused field"}"#, "q1"),
            ResponseLine::Warning(_)
        ));
        assert!(matches!(
            classify_line(r#"{"id":"q1"}"#, "q1"),
            ResponseLine::Malformed(_)
        ));
    }
}
