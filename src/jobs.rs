//! Batch job descriptors and job files.
//!
//! A job file is either a JSON array:
//!
//! ```json
//! [
//!   {"id": "opening", "moves": [["B", "D4"], ["W", "Q16"]], "komi": 6.5},
//!   {"moves": "B D4, W Q16, B Q4", "max_visits": 200, "description": "three moves"}
//! ]
//! ```
//!
//! or a CSV file with the columns `id, moves, board_size, komi, rules, max_visits,
//! description`, where `moves` holds either the JSON list or the `"B D4, W Q16"` form. Every
//! column but `moves` may be left empty.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::game::{self, Color, DEFAULT_BOARD_SIZE, DEFAULT_KOMI, DEFAULT_RULES};
use crate::protocol::{EngineMove, Query, QueryOptions};

/// Visit budget of a job that does not set one.
pub const DEFAULT_JOB_VISITS: u32 = 1000;

/// One independent analysis: evaluate the position after `moves`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Key of the job in the batch report.
    pub id: String,
    /// Free text.
    pub description: String,
    /// Moves in engine coordinates.
    pub moves: Vec<EngineMove>,
    /// Board edge length.
    pub board_size: u8,
    /// Komi.
    pub komi: f64,
    /// Rule set tag.
    pub rules: String,
    /// Visit budget.
    pub max_visits: u32,
}

impl Job {
    /// A job with default parameters.
    pub fn new(id: impl Into<String>, moves: Vec<EngineMove>) -> Self {
        Job {
            id: id.into(),
            description: String::new(),
            moves,
            board_size: DEFAULT_BOARD_SIZE,
            komi: DEFAULT_KOMI,
            rules: DEFAULT_RULES.to_string(),
            max_visits: DEFAULT_JOB_VISITS,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the board size.
    pub fn with_board_size(mut self, board_size: u8) -> Self {
        self.board_size = board_size;
        self
    }

    /// Set the komi.
    pub fn with_komi(mut self, komi: f64) -> Self {
        self.komi = komi;
        self
    }

    /// Set the visit budget.
    pub fn with_max_visits(mut self, max_visits: u32) -> Self {
        self.max_visits = max_visits;
        self
    }

    /// Query evaluating the final position of the job.
    pub fn to_query(&self, id: String, time_budget: Option<f64>, options: QueryOptions) -> Query {
        Query {
            id,
            moves: self.moves.clone(),
            board_size: self.board_size,
            komi: self.komi,
            rules: self.rules.clone(),
            analysis_targets: vec![self.moves.len()],
            visit_budget: self.max_visits,
            time_budget,
            options,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMoves {
    List(Vec<(String, String)>),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawJob {
    id: Option<String>,
    moves: Option<RawMoves>,
    board_size: Option<u8>,
    komi: Option<f64>,
    rules: Option<String>,
    max_visits: Option<u32>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCsvJob {
    id: Option<String>,
    moves: Option<String>,
    board_size: Option<u8>,
    komi: Option<f64>,
    rules: Option<String>,
    max_visits: Option<u32>,
    description: Option<String>,
}

impl From<RawCsvJob> for RawJob {
    fn from(row: RawCsvJob) -> Self {
        RawJob {
            id: row.id,
            moves: row.moves.map(RawMoves::Text),
            board_size: row.board_size,
            komi: row.komi,
            rules: row.rules,
            max_visits: row.max_visits,
            description: row.description,
        }
    }
}

impl RawJob {
    fn into_job(self, index: usize) -> anyhow::Result<Job> {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("job_{index}"));
        let board_size = self.board_size.unwrap_or(DEFAULT_BOARD_SIZE);
        let pairs = match self.moves {
            None => vec![],
            Some(RawMoves::List(pairs)) => pairs,
            Some(RawMoves::Text(text)) => parse_moves_cell(&text)
                .with_context(|| format!("job '{id}': invalid moves"))?,
        };
        let moves = pairs
            .iter()
            .map(|(color, position)| normalize_move(color, position, board_size))
            .collect::<anyhow::Result<Vec<_>>>()
            .with_context(|| format!("job '{id}': invalid move"))?;
        let max_visits = self.max_visits.unwrap_or(DEFAULT_JOB_VISITS);
        if max_visits == 0 {
            bail!("job '{id}': max_visits must be at least 1");
        }

        Ok(Job {
            id,
            description: self.description.unwrap_or_default(),
            moves,
            board_size,
            komi: self.komi.unwrap_or(DEFAULT_KOMI),
            rules: self
                .rules
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_RULES.to_string()),
            max_visits,
        })
    }
}

/// A CSV `moves` cell: a JSON list, or `"B D4, W Q16"`.
fn parse_moves_cell(text: &str) -> anyhow::Result<Vec<(String, String)>> {
    let text = text.trim();
    if text.starts_with('[') {
        return serde_json::from_str(text).context("moves cell is not a JSON move list");
    }
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| match item.split_once(char::is_whitespace) {
            Some((color, position)) => Ok((color.to_string(), position.trim().to_string())),
            None => bail!("expected '<color> <point>', got '{item}'"),
        })
        .collect()
}

/// Check a move and rewrite it in canonical form (`B`, upper-case point).
fn normalize_move(color: &str, position: &str, board_size: u8) -> anyhow::Result<EngineMove> {
    let mv = game::parse_engine_move(color, position, board_size)?;
    let point = mv.location.to_engine(board_size)?;
    Ok(EngineMove(mv.player, point))
}

/// Load jobs from a `.csv` file, or from a JSON file for any other extension.
///
/// # Errors
///
/// Fails on unreadable files, syntax errors and invalid moves. A bad job file is a
/// configuration error: nothing is loaded.
#[instrument]
pub fn load_jobs(path: &Path) -> anyhow::Result<Vec<Job>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("could not read job file {}", path.display()))?;
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    let jobs = if is_csv {
        parse_csv_jobs(&text)
    } else {
        parse_json_jobs(&text)
    }
    .with_context(|| format!("invalid job file {}", path.display()))?;
    info!(count = jobs.len(), "jobs loaded");
    Ok(jobs)
}

/// Parse a JSON job array.
///
/// # Errors
///
/// Fails on syntax errors and invalid moves.
pub fn parse_json_jobs(text: &str) -> anyhow::Result<Vec<Job>> {
    let raw: Vec<RawJob> = serde_json::from_str(text).context("expected a JSON array of jobs")?;
    raw.into_iter()
        .enumerate()
        .map(|(i, job)| job.into_job(i))
        .collect()
}

/// Parse CSV job rows.
///
/// # Errors
///
/// Fails on syntax errors and invalid moves.
pub fn parse_csv_jobs(text: &str) -> anyhow::Result<Vec<Job>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    reader
        .deserialize::<RawCsvJob>()
        .enumerate()
        .map(|(i, row)| {
            let row = row.with_context(|| format!("row {}", i + 1))?;
            RawJob::from(row).into_job(i)
        })
        .collect()
}

/// A representative job set: empty board, common openings, a visit sweep, every usual
/// board size and a komi sweep.
pub fn sample_jobs() -> Vec<Job> {
    fn moves(list: &[(&str, &str)]) -> Vec<EngineMove> {
        list.iter()
            .map(|(c, p)| {
                let color = if *c == "B" { Color::Black } else { Color::White };
                EngineMove(color, p.to_string())
            })
            .collect()
    }

    let mut jobs = vec![Job::new("empty_board", vec![]).with_description("empty board")];

    let four_stars = [("B", "D4"), ("W", "Q16"), ("B", "Q4"), ("W", "D16")];
    let openings: [(&str, &str, Vec<EngineMove>); 5] = [
        ("star_point_opening", "four star points", moves(&four_stars)),
        (
            "komoku_opening",
            "komoku",
            moves(&[("B", "D4"), ("W", "Q16"), ("B", "R4"), ("W", "C16")]),
        ),
        (
            "sansan_opening",
            "3-3 points",
            moves(&[("B", "C3"), ("W", "Q16"), ("B", "Q3"), ("W", "C16")]),
        ),
        (
            "high_approach",
            "high approach",
            moves(&[("B", "D4"), ("W", "Q16"), ("B", "Q4"), ("W", "D16"), ("B", "F3")]),
        ),
        (
            "low_approach",
            "low approach",
            moves(&[("B", "D4"), ("W", "Q16"), ("B", "Q4"), ("W", "D16"), ("B", "F4")]),
        ),
    ];
    for (id, description, mv) in openings {
        jobs.push(Job::new(id, mv).with_description(description));
    }

    let two_stars = [("B", "D4"), ("W", "Q16")];
    for visits in [100, 500, 1000, 2000] {
        jobs.push(
            Job::new(format!("visits_test_{visits}"), moves(&two_stars))
                .with_max_visits(visits)
                .with_description(format!("visit budget {visits}")),
        );
    }
    for size in [9, 13, 19] {
        jobs.push(
            Job::new(format!("board_size_{size}"), vec![])
                .with_board_size(size)
                .with_description(format!("{size}x{size} board")),
        );
    }
    for komi in [0.5, 5.5, 7.5, 9.5] {
        jobs.push(
            Job::new(format!("komi_{komi}"), moves(&two_stars))
                .with_komi(komi)
                .with_description(format!("komi {komi}")),
        );
    }
    jobs
}

#[derive(Serialize)]
struct CsvJobRow<'a> {
    id: &'a str,
    moves: String,
    board_size: u8,
    komi: f64,
    rules: &'a str,
    max_visits: u32,
    description: &'a str,
}

/// Write `jobs` to `path`, as CSV for a `.csv` extension and as a JSON array otherwise.
///
/// # Errors
///
/// Fails on encoding or IO errors.
pub fn write_job_file(jobs: &[Job], path: &Path) -> anyhow::Result<()> {
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    let bytes = if is_csv {
        let mut writer = csv::Writer::from_writer(vec![]);
        for job in jobs {
            writer.serialize(CsvJobRow {
                id: &job.id,
                moves: job
                    .moves
                    .iter()
                    .map(EngineMove::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                board_size: job.board_size,
                komi: job.komi,
                rules: &job.rules,
                max_visits: job.max_visits,
                description: &job.description,
            })?;
        }
        writer.into_inner().context("could not flush CSV")?
    } else {
        serde_json::to_vec_pretty(jobs)?
    };
    fs::write(path, bytes).with_context(|| format!("could not write {}", path.display()))?;
    info!(count = jobs.len(), "job file written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_cell_forms() {
        let text = parse_moves_cell("B D4, W Q16").unwrap();
        let json = parse_moves_cell(r#"[["B","D4"],["W","Q16"]]"#).unwrap();
        assert_eq!(text, json);
        assert!(parse_moves_cell("B D4, Q16").is_err());
    }

    #[test]
    fn normalizes_case() {
        let mv = normalize_move("b", "q16", 19).unwrap();
        assert_eq!(mv, EngineMove(Color::Black, "Q16".to_string()));
    }

    #[test]
    fn samples_are_valid() {
        let jobs = sample_jobs();
        assert_eq!(jobs.len(), 17);
        for job in &jobs {
            for EngineMove(color, point) in &job.moves {
                normalize_move(color.letter(), point, job.board_size).unwrap();
            }
        }
    }
}
