//! Conversion between game-record coordinates and engine coordinates.
//!
//! Game records (SGF) address a point with two lowercase letters, column then row, both
//! counted from the top-left corner: `"dp"` is the fourth column, sixteenth row from the top.
//! The engine uses a column letter followed by a row number counted from the bottom, with the
//! letter `I` never used: on a 19x19 board `"dp"` becomes `"D4"`.
//!
//! Every function here is pure.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Literal token used by the engine (and accepted in game records) for a pass.
pub const PASS: &str = "pass";

/// Largest board addressable with the engine's lettering (`A`..`Z` without `I`).
pub const MAX_BOARD_SIZE: u8 = 25;

/// Error returned when a coordinate cannot be converted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinateError {
    /// One of the axes falls outside the board.
    #[error("invalid coordinate '{coordinate}' for a {board_size}x{board_size} board")]
    InvalidCoordinate {
        /// The offending input, as given.
        coordinate: String,
        /// Board size the coordinate was checked against.
        board_size: u8,
    },

    /// The board size itself cannot be expressed with engine coordinates.
    #[error("unsupported board size {0} (expected 2..={MAX_BOARD_SIZE})")]
    UnsupportedBoardSize(u8),
}

/// A point on the board, in game-record orientation (row 0 is the top row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    /// Column index, 0 is the leftmost column.
    pub col: u8,
    /// Row index, 0 is the top row.
    pub row: u8,
}

impl Coordinate {
    /// Create a coordinate from its axis indices. No range check is done here, it happens when
    /// converting against a board size.
    pub fn new(col: u8, row: u8) -> Self {
        Coordinate { col, row }
    }

    /// Read a two-letter game-record coordinate (`"dp"`). Letters outside `a..=z` are rejected,
    /// but the board range is checked later by [`Coordinate::to_engine`].
    pub fn from_sgf(text: &str) -> Option<Self> {
        let mut chars = text.chars();
        let (Some(c0), Some(c1), None) = (chars.next(), chars.next(), chars.next()) else {
            return None;
        };
        let c0 = c0.to_ascii_lowercase();
        let c1 = c1.to_ascii_lowercase();
        if !c0.is_ascii_lowercase() || !c1.is_ascii_lowercase() {
            return None;
        }
        Some(Coordinate::new(c0 as u8 - b'a', c1 as u8 - b'a'))
    }

    /// Two-letter game-record form of this coordinate.
    pub fn to_sgf(self) -> String {
        let letter = |i: u8| char::from(b'a'.saturating_add(i));
        format!("{}{}", letter(self.col), letter(self.row))
    }

    /// Engine form of this coordinate on a `board_size` board.
    pub fn to_engine(self, board_size: u8) -> Result<String, CoordinateError> {
        check_board_size(board_size)?;
        if self.col >= board_size || self.row >= board_size {
            return Err(CoordinateError::InvalidCoordinate {
                coordinate: format!("({}, {})", self.col, self.row),
                board_size,
            });
        }
        to_engine_coordinate((b'a' + self.col) as char, (b'a' + self.row) as char, board_size)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sgf())
    }
}

/// Where a move is played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// A point of the board.
    Point(Coordinate),
    /// No stone placed.
    Pass,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Point(c) => c.fmt(f),
            Location::Pass => f.write_str(PASS),
        }
    }
}

impl Location {
    /// Engine form of this location, `pass` for passes.
    pub fn to_engine(self, board_size: u8) -> Result<String, CoordinateError> {
        match self {
            Location::Point(c) => c.to_engine(board_size),
            Location::Pass => {
                check_board_size(board_size)?;
                Ok(PASS.to_string())
            }
        }
    }
}

fn check_board_size(board_size: u8) -> Result<(), CoordinateError> {
    if (2..=MAX_BOARD_SIZE).contains(&board_size) {
        Ok(())
    } else {
        Err(CoordinateError::UnsupportedBoardSize(board_size))
    }
}

fn column_letter(index: u8) -> char {
    if index >= 8 {
        (b'A' + index + 1) as char
    } else {
        (b'A' + index) as char
    }
}

/// Convert the two axis characters of a game-record coordinate to the engine coordinate.
///
/// The column letter skips `I`; the row is numbered from the bottom
/// (`board_size - row_index`).
///
/// # Errors
///
/// [`CoordinateError::InvalidCoordinate`] when either axis is outside `'a'..'a' + board_size`.
///
/// ```
/// use analysis_runner::coordinate::to_engine_coordinate;
///
/// assert_eq!(to_engine_coordinate('d', 'p', 19).unwrap(), "D4");
/// assert_eq!(to_engine_coordinate('i', 'a', 19).unwrap(), "J19");
/// ```
pub fn to_engine_coordinate(
    axis0: char,
    axis1: char,
    board_size: u8,
) -> Result<String, CoordinateError> {
    check_board_size(board_size)?;
    let invalid = || CoordinateError::InvalidCoordinate {
        coordinate: format!("{axis0}{axis1}"),
        board_size,
    };
    let limit = (b'a' + board_size) as char;
    if !('a'..limit).contains(&axis0) || !('a'..limit).contains(&axis1) {
        return Err(invalid());
    }
    let col = axis0 as u8 - b'a';
    let row = axis1 as u8 - b'a';
    Ok(format!("{}{}", column_letter(col), board_size - row))
}

/// Convert a full game-record coordinate string, handling passes.
///
/// `"pass"`, the empty coordinate and, on boards up to 19x19, the legacy `"tt"` all map to
/// [`PASS`].
pub fn sgf_to_engine(text: &str, board_size: u8) -> Result<String, CoordinateError> {
    parse_sgf_location(text, board_size)?.to_engine(board_size)
}

/// Read a game-record location, handling passes. The board range is only checked for passes'
/// board size; points are range-checked on conversion.
pub fn parse_sgf_location(text: &str, board_size: u8) -> Result<Location, CoordinateError> {
    let trimmed = text.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case(PASS)
        || (board_size <= 19 && trimmed.eq_ignore_ascii_case("tt"))
    {
        return Ok(Location::Pass);
    }
    Coordinate::from_sgf(trimmed)
        .map(Location::Point)
        .ok_or_else(|| CoordinateError::InvalidCoordinate {
            coordinate: trimmed.to_string(),
            board_size,
        })
}

/// Inverse of [`to_engine_coordinate`]: read an engine coordinate (`"Q16"`, `"pass"`).
pub fn from_engine_coordinate(text: &str, board_size: u8) -> Result<Location, CoordinateError> {
    check_board_size(board_size)?;
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case(PASS) {
        return Ok(Location::Pass);
    }
    let invalid = || CoordinateError::InvalidCoordinate {
        coordinate: trimmed.to_string(),
        board_size,
    };

    let mut chars = trimmed.chars();
    let letter = chars.next().ok_or_else(invalid)?.to_ascii_uppercase();
    if !letter.is_ascii_uppercase() || letter == 'I' {
        return Err(invalid());
    }
    let mut col = letter as u8 - b'A';
    if letter > 'I' {
        col -= 1;
    }
    let number: u8 = chars.as_str().parse().map_err(|_| invalid())?;
    if col >= board_size || number == 0 || number > board_size {
        return Err(invalid());
    }
    Ok(Location::Point(Coordinate::new(col, board_size - number)))
}
