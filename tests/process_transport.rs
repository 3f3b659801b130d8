#![cfg(unix)]

use std::time::{Duration, Instant};

use analysis_runner::cancel::CancelToken;
use analysis_runner::game::Color;
use analysis_runner::protocol::{unique_query_id, EngineMove, Query, QueryOptions};
use analysis_runner::transport::{ProcessConfig, ProcessTransport, Transport, TransportError};

/// Shell engine: for every request it logs a line, answers a stale query, then answers the
/// request with `reply` (a printf format receiving the request id).
fn scripted_engine(reply: &str) -> ProcessConfig {
    let script = format!(
        r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/')
  echo "engine: searching"
  echo '{{"id":"stale-0","rootInfo":{{"visits":5,"winrate":0.1,"scoreLead":0}}}}'
  printf '{reply}\n' "$id"
done"#
    );
    ProcessConfig::new("sh", vec!["-c".to_string(), script])
}

fn silent_engine() -> ProcessConfig {
    ProcessConfig::new("sh", vec!["-c".to_string(), "cat >/dev/null".to_string()])
}

fn query() -> Query {
    Query {
        id: unique_query_id("test"),
        moves: vec![
            EngineMove(Color::Black, "D4".to_string()),
            EngineMove(Color::White, "Q16".to_string()),
        ],
        board_size: 19,
        komi: 7.5,
        rules: "tromp-taylor".to_string(),
        analysis_targets: vec![2],
        visit_budget: 10,
        time_budget: None,
        options: QueryOptions::default(),
    }
}

const ANSWER: &str = r#"{"id":"%s","rootInfo":{"visits":7,"winrate":0.6,"scoreLead":1.5},"moveInfos":[{"move":"Q4","visits":7,"winrate":0.6,"scoreLead":1.5,"order":0,"pv":["Q4","D16"]}]}"#;

#[test]
fn answers_are_matched_by_id() {
    let mut transport = ProcessTransport::spawn(&scripted_engine(ANSWER)).unwrap();

    for _ in 0..2 {
        let query = query();
        let result = transport.send(&query, Duration::from_secs(5)).unwrap();
        assert_eq!(result.id, query.id);
        assert_eq!(result.root.visits, 7);
        assert_eq!(result.best_move().unwrap().mv, "Q4");
    }
}

#[test]
fn unbounded_timeout_is_accepted() {
    let mut transport = ProcessTransport::spawn(&scripted_engine(ANSWER)).unwrap();
    let query = query();

    let result = transport.send(&query, Duration::MAX).unwrap();

    assert_eq!(result.id, query.id);
}

#[test]
fn engine_errors_are_rejections() {
    let config = scripted_engine(r#"{"id":"%s","error":"illegal move","field":"moves"}"#);
    let mut transport = ProcessTransport::spawn(&config).unwrap();

    match transport.send(&query(), Duration::from_secs(5)) {
        Err(TransportError::EngineRejected(msg)) => assert!(msg.contains("illegal move")),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn silent_engine_times_out() {
    let mut transport = ProcessTransport::spawn(&silent_engine()).unwrap();
    let start = Instant::now();

    let err = transport.send(&query(), Duration::from_millis(200)).unwrap_err();

    assert!(matches!(err, TransportError::Timeout(_)), "{err:?}");
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn exited_engine_is_unreachable() {
    let mut transport = ProcessTransport::spawn(&ProcessConfig::new("true", vec![])).unwrap();
    let err = transport.send(&query(), Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, TransportError::Unreachable(_)), "{err:?}");
}

#[test]
fn missing_program_is_unreachable() {
    let config = ProcessConfig::new("/nonexistent/analysis-engine", vec![]);
    let err = ProcessTransport::spawn(&config).unwrap_err();
    assert!(matches!(err, TransportError::Unreachable(_)), "{err:?}");
}

#[test]
fn cancellation_cuts_the_wait_to_the_grace_period() {
    let mut transport = ProcessTransport::spawn(&silent_engine()).unwrap();
    let cancel = CancelToken::with_grace(Duration::from_millis(100));
    cancel.cancel();
    let start = Instant::now();

    let err = transport
        .send_cancellable(&query(), Duration::from_secs(30), &cancel)
        .unwrap_err();

    assert!(matches!(err, TransportError::Timeout(_)), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn command_line_is_split_on_whitespace() {
    let config = ProcessConfig::from_command_line("  katago analysis -config a.cfg ").unwrap();
    assert_eq!(config.command, "katago");
    assert_eq!(config.args, vec!["analysis", "-config", "a.cfg"]);
    assert!(ProcessConfig::from_command_line("   ").is_none());
}
