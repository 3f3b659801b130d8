use std::collections::HashSet;

use analysis_runner::coordinate::{
    from_engine_coordinate, sgf_to_engine, to_engine_coordinate, Coordinate, CoordinateError,
    Location,
};
use analysis_runner::game::{Color, GameRecord, Move};
use analysis_runner::prelude::*;
use analysis_runner::protocol::EngineMove;

mod stubs;
use stubs::StubTransport;

#[test]
fn known_points() {
    let cases = [
        ("aa", 19, "A19"),
        ("ss", 19, "T1"),
        ("ia", 19, "J19"),
        ("ha", 19, "H19"),
        ("dp", 19, "D4"),
        ("pd", 19, "Q16"),
        ("dd", 19, "D16"),
        ("cc", 9, "C7"),
        ("ii", 9, "J1"),
        ("yy", 25, "Z1"),
    ];
    for (sgf, size, engine) in cases {
        let mut chars = sgf.chars();
        let (a, b) = (chars.next().unwrap(), chars.next().unwrap());
        assert_eq!(to_engine_coordinate(a, b, size).unwrap(), engine, "{sgf} on {size}");
    }
}

#[test]
fn injective_and_invertible_on_every_board() {
    for size in [2u8, 9, 13, 19, 25] {
        let mut seen = HashSet::new();
        for col in 0..size {
            for row in 0..size {
                let a = (b'a' + col) as char;
                let b = (b'a' + row) as char;
                let engine = to_engine_coordinate(a, b, size).unwrap();
                assert!(!engine.contains('I'), "{engine}");
                assert!(seen.insert(engine.clone()), "{engine} produced twice on {size}");
                assert_eq!(
                    from_engine_coordinate(&engine, size).unwrap(),
                    Location::Point(Coordinate::new(col, row))
                );
            }
        }
        assert_eq!(seen.len(), size as usize * size as usize);
    }
}

#[test]
fn out_of_range_axes_are_rejected() {
    assert_eq!(
        to_engine_coordinate('t', 'a', 19),
        Err(CoordinateError::InvalidCoordinate {
            coordinate: "ta".to_string(),
            board_size: 19
        })
    );
    assert!(to_engine_coordinate('a', 'j', 9).is_err());
    assert!(to_engine_coordinate('A', 'a', 19).is_err());
    assert!(from_engine_coordinate("T19", 9).is_err());
    assert!(from_engine_coordinate("I5", 19).is_err());
}

#[test]
fn passes() {
    assert_eq!(sgf_to_engine("", 19).unwrap(), "pass");
    assert_eq!(sgf_to_engine("tt", 19).unwrap(), "pass");
    assert_eq!(sgf_to_engine("pass", 9).unwrap(), "pass");
    // on large boards "tt" is a real point
    assert_eq!(sgf_to_engine("tt", 21).unwrap(), "U2");
    assert_eq!(from_engine_coordinate("PASS", 19).unwrap(), Location::Pass);
}

#[test]
fn record_is_sent_in_engine_coordinates() {
    let record = GameRecord::from_sgf("(;SZ[19];B[dp];W[pd])").unwrap();
    let stub = StubTransport::deterministic();
    let queries = stub.queries();
    let settings = AnalysisSettingsBuilder::new()
        .with_profiles(vec![QueryProfile::reduced(10)])
        .build()
        .unwrap();

    let state = SequentialWalker::new(stub, settings).walk(&record, 2, 2);

    assert_eq!(state.status, WalkStatus::Completed);
    let queries = queries.lock().unwrap();
    assert_eq!(queries.len(), 1);
    assert_eq!(
        queries[0].moves,
        vec![
            EngineMove(Color::Black, "D4".to_string()),
            EngineMove(Color::White, "Q16".to_string()),
        ]
    );
    assert_eq!(queries[0].analysis_targets, vec![2]);
    assert_eq!(
        state.results[0].played_move,
        Some(Move::new(
            Color::White,
            Location::Point(Coordinate::new(15, 3))
        ))
    );
}
