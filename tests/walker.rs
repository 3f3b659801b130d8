use std::sync::atomic::Ordering;
use std::time::Duration;

use analysis_runner::coordinate::{Coordinate, Location};
use analysis_runner::prelude::*;
use analysis_runner::progress::ProgressEvent;
use analysis_runner::report::FailureKind;
use analysis_runner::settings::QueryProfile;

mod stubs;
use stubs::{degenerate, evaluation, result, StubTransport};

fn record(moves: usize) -> GameRecord {
    let points = ["dp", "pd", "pp", "dd", "qf", "fc", "cn", "nq", "jj", "jd"];
    let moves = (0..moves)
        .map(|i| {
            let player = if i % 2 == 0 { Color::Black } else { Color::White };
            let point = Coordinate::from_sgf(points[i % points.len()]).unwrap();
            Move::new(player, Location::Point(point))
        })
        .collect();
    GameRecord::with_moves(moves)
}

fn single_profile(threshold: usize) -> AnalysisSettings {
    AnalysisSettingsBuilder::new()
        .with_profiles(vec![QueryProfile::primary(100, None)])
        .with_failure_threshold(threshold)
        .build()
        .unwrap()
}

#[test]
fn walks_every_ply() {
    let game = record(6);
    let stub = StubTransport::deterministic();
    let calls = stub.calls();
    let mut walker = SequentialWalker::new(stub, single_profile(3));

    let state = walker.walk(&game, 0, 100);

    assert_eq!(state.status, WalkStatus::Completed);
    assert_eq!(state.stop_reason, None);
    assert_eq!(state.move_count, 6);
    let plies: Vec<_> = state.results.iter().map(|p| p.ply).collect();
    assert_eq!(plies, vec![0, 1, 2, 3, 4, 5, 6]);
    assert_eq!(calls.load(Ordering::SeqCst), 7);
    assert!(state.failures.is_empty());
    assert_eq!(state.results[0].played_move, None);
    assert_eq!(state.results[0].mover, Color::Black);
    assert_eq!(state.results[2].mover, Color::White);
}

#[test]
fn walking_twice_gives_the_same_evaluations() {
    let game = record(8);
    let mut walker = SequentialWalker::new(StubTransport::deterministic(), single_profile(3));

    let first = walker.walk(&game, 2, 7);
    let second = walker.walk(&game, 2, 7);

    let strip = |state: &WalkState| {
        state
            .results
            .iter()
            .map(|p| (p.ply, p.black_winrate, p.result.root.visits, p.result.root.score_lead))
            .collect::<Vec<_>>()
    };
    assert_eq!(strip(&first), strip(&second));
    assert_eq!(first.results.len(), 6);
    assert_eq!(first.status, second.status);
}

#[test]
fn query_ids_are_never_reused() {
    let game = record(5);
    let stub = StubTransport::deterministic();
    let queries = stub.queries();
    let mut walker = SequentialWalker::new(stub, single_profile(3));
    walker.walk(&game, 0, 5);
    walker.walk(&game, 0, 5);

    let queries = queries.lock().unwrap();
    let mut ids: Vec<_> = queries.iter().map(|q| q.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 12);
}

#[test]
fn circuit_breaker_stops_after_threshold() {
    let game = record(10);
    let stub = StubTransport::new(|q, _| Ok(degenerate(&q.id)));
    let calls = stub.calls();
    let mut walker = SequentialWalker::new(stub, single_profile(3));

    let state = walker.walk(&game, 0, 10);

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(state.status, WalkStatus::Stopped);
    assert_eq!(state.stop_reason, Some(FailureKind::CircuitOpen));
    assert_eq!(state.consecutive_failures, 3);
    assert_eq!(state.failures.len(), 3);
    assert!(state.failures.iter().all(|f| f.kind == FailureKind::Degenerate));
    assert!(state.results.is_empty());
    assert_eq!(state.current_ply, 2);
}

#[test]
fn success_resets_the_failure_count() {
    let game = record(9);
    // every third query fails
    let stub = StubTransport::new(|q, n| {
        if n % 3 == 2 {
            Err(TransportError::Timeout(Duration::from_millis(1)))
        } else {
            Ok(evaluation(q))
        }
    });
    let mut walker = SequentialWalker::new(stub, single_profile(2));

    let state = walker.walk(&game, 0, 9);

    assert_eq!(state.status, WalkStatus::Completed);
    assert_eq!(state.failures.len(), 3);
    assert_eq!(state.results.len(), 7);
    assert!(state.failures.iter().all(|f| f.kind == FailureKind::Timeout));
}

#[test]
fn degrading_profiles_are_tried_in_order() {
    let game = record(3);
    let stub = StubTransport::new(|q, _| {
        if q.time_budget.is_some() {
            Err(TransportError::Timeout(Duration::from_secs(1)))
        } else {
            Ok(evaluation(q))
        }
    });
    let queries = stub.queries();
    let settings = AnalysisSettingsBuilder::new()
        .with_visit_budget(400)
        .with_time_budget(Duration::from_secs(2))
        .build()
        .unwrap();
    let mut walker = SequentialWalker::new(stub, settings);

    let state = walker.walk(&game, 0, 3);

    assert_eq!(state.status, WalkStatus::Completed);
    assert_eq!(state.results.len(), 4);
    assert!(state.results.iter().all(|p| p.profile == "reduced"));
    assert!(state.results.iter().all(|p| p.result.root.visits == 50));
    let queries = queries.lock().unwrap();
    assert_eq!(queries.len(), 8);
    assert_eq!(queries[0].visit_budget, 400);
    assert_eq!(queries[0].time_budget, Some(2.0));
    assert!(queries[0].options.include_policy);
    assert_eq!(queries[1].visit_budget, 50);
    assert!(!queries[1].options.include_policy);
    assert_ne!(queries[0].id, queries[1].id);
}

#[test]
fn failed_ply_reports_last_profile_error() {
    let game = record(1);
    let stub = StubTransport::new(|q, _| {
        if q.time_budget.is_some() {
            Err(TransportError::Timeout(Duration::from_secs(1)))
        } else {
            Err(TransportError::EngineRejected("bad rules".to_string()))
        }
    });
    let settings = AnalysisSettingsBuilder::new()
        .with_time_budget(Duration::from_secs(1))
        .with_failure_threshold(5)
        .build()
        .unwrap();

    let state = SequentialWalker::new(stub, settings).walk(&game, 0, 1);

    assert_eq!(state.status, WalkStatus::Completed);
    assert_eq!(state.failures.len(), 2);
    assert_eq!(state.failures[0].kind, FailureKind::EngineRejected);
    assert_eq!(state.failures[0].attempts, 2);
    assert!(state.failures[0].message.contains("bad rules"));
}

#[test]
fn win_rates_are_normalised() {
    let game = record(2);
    // mover always sees 0.7
    let stub = StubTransport::new(|q, _| Ok(result(&q.id, 10, 0.7, 2.0)));
    let settings = AnalysisSettingsBuilder::new()
        .with_profiles(vec![QueryProfile::reduced(10)])
        .with_reference_color(Color::White)
        .build()
        .unwrap();

    let state = SequentialWalker::new(stub, settings).walk(&game, 0, 2);

    let rates: Vec<_> = state
        .results
        .iter()
        .map(|p| (p.mover, p.winrate, p.black_winrate, p.display_winrate))
        .collect();
    let close = |a: f64, b: f64| (a - b).abs() < 1e-9;
    // ply 0 and 1: Black moved, ply 2: White moved
    assert_eq!(rates[0].0, Color::Black);
    assert_eq!(rates[1].0, Color::Black);
    assert_eq!(rates[2].0, Color::White);
    assert!(close(rates[1].2, 0.7) && close(rates[1].3, 0.3));
    assert!(close(rates[2].2, 0.3) && close(rates[2].3, 0.7));
    assert!(rates.iter().all(|r| close(r.1, 0.7)));
}

#[test]
fn raw_win_rate_without_reference_color() {
    let game = record(2);
    let stub = StubTransport::new(|q, _| Ok(result(&q.id, 10, 0.25, 0.0)));
    let state = SequentialWalker::new(stub, single_profile(3)).walk(&game, 2, 2);
    assert_eq!(state.results[0].display_winrate, 0.25);
    assert!((state.results[0].black_winrate - 0.75).abs() < 1e-9);
}

#[test]
fn off_board_moves_are_skipped() {
    let moves = [(Color::Black, "cc"), (Color::White, "pd"), (Color::Black, "pp"), (Color::White, "gg")]
        .into_iter()
        .map(|(player, p)| Move::new(player, Location::Point(Coordinate::from_sgf(p).unwrap())))
        .collect();
    let game = GameRecord {
        moves,
        board_size: 9,
        ..Default::default()
    };
    // "pd" and "pp" do not fit on 9x9
    let state = SequentialWalker::new(StubTransport::deterministic(), single_profile(3))
        .walk(&game, 0, 10);

    assert_eq!(state.status, WalkStatus::Completed);
    let skipped: Vec<_> = state.skipped_moves.iter().map(|s| s.index).collect();
    assert_eq!(skipped, vec![1, 2]);
    assert_eq!(state.move_count, 2);
    assert_eq!(state.results.len(), 3);
    assert_eq!(state.results[2].played_move, Some(game.moves[3]));
}

#[test]
fn progress_is_emitted_per_ply() {
    let game = record(4);
    let (sink, events) = ProgressSink::bounded(64);
    let stub = StubTransport::new(|q, n| {
        if n == 1 {
            Ok(degenerate(&q.id))
        } else {
            Ok(evaluation(q))
        }
    });
    let mut walker = SequentialWalker::new(stub, single_profile(3)).with_progress(sink);

    walker.walk(&game, 0, 4);
    drop(walker);

    let plies: Vec<_> = events
        .iter()
        .map(|e| match e {
            ProgressEvent::Ply(p) => (p.ply, p.failure),
            ProgressEvent::Job(_) => panic!("unexpected job event"),
        })
        .collect();
    assert_eq!(
        plies,
        vec![
            (0, None),
            (1, Some(FailureKind::Degenerate)),
            (2, None),
            (3, None),
            (4, None)
        ]
    );
}

#[test]
fn cancelled_walk_stops_before_next_ply() {
    let game = record(5);
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let stub = StubTransport::new(move |q, n| {
        if n == 1 {
            token.cancel();
        }
        Ok(evaluation(q))
    });
    let mut walker = SequentialWalker::new(stub, single_profile(3)).with_cancel(cancel);

    let state = walker.walk(&game, 0, 5);

    assert_eq!(state.status, WalkStatus::Stopped);
    assert_eq!(state.stop_reason, Some(FailureKind::Cancelled));
    assert_eq!(state.results.len(), 2);
}

#[test]
fn empty_range_completes_without_queries() {
    let stub = StubTransport::deterministic();
    let calls = stub.calls();
    let state = SequentialWalker::new(stub, single_profile(3)).walk(&record(3), 5, 9);
    assert_eq!(state.status, WalkStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
