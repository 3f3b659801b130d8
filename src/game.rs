//! Game records: colors, moves, and reading them from SGF text or simple move lists.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::coordinate::{self, Location};

/// Default board size of a game record.
pub const DEFAULT_BOARD_SIZE: u8 = 19;
/// Default komi of a game record.
pub const DEFAULT_KOMI: f64 = 7.5;
/// Default rule set tag.
pub const DEFAULT_RULES: &str = "tromp-taylor";

/// Side to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Color {
    /// First player.
    #[serde(rename = "B")]
    Black,
    /// Second player.
    #[serde(rename = "W")]
    White,
}

impl Color {
    /// The other color.
    pub fn opponent(self) -> Color {
        match self {
            Color::Black => Color::White,
            Color::White => Color::Black,
        }
    }

    /// Single-letter form used by game records and the engine.
    pub fn letter(self) -> &'static str {
        match self {
            Color::Black => "B",
            Color::White => "W",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}

impl FromStr for Color {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "b" | "black" => Ok(Color::Black),
            "w" | "white" => Ok(Color::White),
            other => bail!("unknown color '{other}'"),
        }
    }
}

/// One ply of a game record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Move {
    /// Who played.
    pub player: Color,
    /// Where.
    pub location: Location,
}

impl Move {
    /// Create a move.
    pub fn new(player: Color, location: Location) -> Self {
        Move { player, location }
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.player, self.location)
    }
}

/// An ordered move list together with the parameters the engine needs to replay it.
///
/// Colors are taken as recorded: strict alternation is not assumed (handicap stones and
/// edited records break it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    /// Moves in playing order.
    pub moves: Vec<Move>,
    /// Board edge length.
    pub board_size: u8,
    /// Points given to White.
    pub komi: f64,
    /// Rule set tag forwarded to the engine.
    pub rules: String,
}

impl Default for GameRecord {
    fn default() -> Self {
        GameRecord {
            moves: vec![],
            board_size: DEFAULT_BOARD_SIZE,
            komi: DEFAULT_KOMI,
            rules: DEFAULT_RULES.to_string(),
        }
    }
}

impl GameRecord {
    /// An empty record with the given moves and default parameters.
    pub fn with_moves(moves: Vec<Move>) -> Self {
        GameRecord {
            moves,
            ..Default::default()
        }
    }

    /// Number of plies.
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    /// True if the record has no move.
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Read the main line of an SGF game.
    ///
    /// Only the first variation is followed at every branch, and only the first game of a
    /// collection is read. `SZ`, `KM` and `RU` properties override the defaults. Move values are
    /// kept as raw axis indices: points outside the board are reported later, when the record is
    /// walked. Values that are not two letters are dropped here with a warning.
    pub fn from_sgf(sgf: &str) -> anyhow::Result<GameRecord> {
        let sgf = sgf.trim();
        if !sgf.starts_with('(') {
            bail!("not an SGF game tree (expected '(' at start)");
        }

        let token = Regex::new(
            r"(?s)(?P<open>\()|(?P<close>\))|(?P<node>;)|(?P<ident>[A-Za-z]+)\s*(?P<values>(?:\[(?:\\.|[^\\\]])*\]\s*)+)",
        )?;
        let value = Regex::new(r"(?s)\[((?:\\.|[^\\\]])*)\]")?;

        let mut record = GameRecord::default();
        let mut raw_moves: Vec<(Color, String)> = vec![];
        let (mut size, mut komi, mut rules) = (None, None, None);

        // one entry per followed tree: has one of its variations already been read
        let mut followed: Vec<bool> = vec![];
        // nesting depth inside a skipped variation
        let mut skipped = 0usize;

        for caps in token.captures_iter(sgf) {
            if skipped > 0 {
                if caps.name("open").is_some() {
                    skipped += 1;
                } else if caps.name("close").is_some() {
                    skipped -= 1;
                }
                continue;
            }
            if caps.name("open").is_some() {
                if followed.last() == Some(&true) {
                    skipped = 1;
                } else {
                    followed.push(false);
                }
            } else if caps.name("close").is_some() {
                followed.pop();
                match followed.last_mut() {
                    Some(parent) => *parent = true,
                    None => break,
                }
            } else if let (Some(ident), Some(values)) = (caps.name("ident"), caps.name("values")) {
                // lower-case letters are legacy decoration around the identifier
                let ident: String = ident.as_str().chars().filter(char::is_ascii_uppercase).collect();
                let first = value
                    .captures(values.as_str())
                    .map(|v| unescape(&v[1]))
                    .unwrap_or_default();
                match ident.as_str() {
                    "B" => raw_moves.push((Color::Black, first)),
                    "W" => raw_moves.push((Color::White, first)),
                    "SZ" if size.is_none() => size = Some(first),
                    "KM" if komi.is_none() => komi = Some(first),
                    "RU" if rules.is_none() => rules = Some(first),
                    _ => {}
                }
            }
        }

        if let Some(size) = size {
            // rectangular boards are written `SZ[cols:rows]`
            let side = size.split(':').next().unwrap_or_default().trim();
            record.board_size = side
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid board size {size:?}: {e}"))?;
        }
        if let Some(komi) = komi {
            match komi.trim().parse::<f64>() {
                Ok(value) if value.is_finite() => record.komi = value,
                _ => warn!("ignoring invalid komi {komi:?}"),
            }
        }
        if let Some(rules) = rules {
            let tag = rules.trim().to_ascii_lowercase();
            if !tag.is_empty() {
                record.rules = tag;
            }
        }

        for (player, text) in raw_moves {
            match coordinate::parse_sgf_location(&text, record.board_size) {
                Ok(location) => record.moves.push(Move::new(player, location)),
                Err(e) => warn!("skipping move {player}[{text}]: {e}"),
            }
        }

        Ok(record)
    }
}

/// Drop the SGF escape character: `\]` reads as `]`, an escaped line break disappears.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\n') | Some('\r') | None => {}
            Some(escaped) => out.push(escaped),
        }
    }
    out
}

/// Parse a `"B D4, W Q16"` move list written in engine coordinates.
///
/// Entries with an unknown color or an invalid coordinate are skipped and returned in the
/// second element of the tuple.
pub fn parse_move_list(text: &str, board_size: u8) -> (Vec<Move>, Vec<String>) {
    let mut moves = vec![];
    let mut rejected = vec![];
    for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((color, position)) = item.split_once(char::is_whitespace) else {
            rejected.push(item.to_string());
            continue;
        };
        match parse_engine_move(color, position, board_size) {
            Ok(m) => moves.push(m),
            Err(e) => {
                warn!("skipping move '{item}': {e}");
                rejected.push(item.to_string());
            }
        }
    }
    (moves, rejected)
}

/// Build a [`Move`] from a color letter and an engine coordinate.
pub fn parse_engine_move(color: &str, position: &str, board_size: u8) -> anyhow::Result<Move> {
    let player = color.parse::<Color>()?;
    let location = coordinate::from_engine_coordinate(position, board_size)?;
    Ok(Move::new(player, location))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::Coordinate;

    #[test]
    fn sgf_root_properties() {
        let record = GameRecord::from_sgf("(;GM[1]SZ[13]KM[6.5]RU[Japanese];B[dd];W[])").unwrap();
        assert_eq!(record.board_size, 13);
        assert_eq!(record.komi, 6.5);
        assert_eq!(record.rules, "japanese");
        assert_eq!(
            record.moves,
            vec![
                Move::new(Color::Black, Location::Point(Coordinate::new(3, 3))),
                Move::new(Color::White, Location::Pass),
            ]
        );
    }

    #[test]
    fn sgf_defaults() {
        let record = GameRecord::from_sgf("(;FF[4];B[pd];W[dp])").unwrap();
        assert_eq!(record.board_size, 19);
        assert_eq!(record.komi, 7.5);
        assert_eq!(record.rules, "tromp-taylor");
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn sgf_follows_the_first_variation() {
        let record = GameRecord::from_sgf("(;SZ[19];B[pd](;W[dp];B[pp])(;W[dd];B[dq]))").unwrap();
        assert_eq!(
            record.moves,
            vec![
                Move::new(Color::Black, Location::Point(Coordinate::new(15, 3))),
                Move::new(Color::White, Location::Point(Coordinate::new(3, 15))),
                Move::new(Color::Black, Location::Point(Coordinate::new(15, 15))),
            ]
        );
    }

    #[test]
    fn sgf_nested_variations_and_second_game_are_ignored() {
        let record =
            GameRecord::from_sgf("(;SZ[9];B[cc](;W[gg](;B[gc])(;B[cg]))(;W[aa]))(;SZ[13];B[aa])").unwrap();
        assert_eq!(record.board_size, 9);
        assert_eq!(
            record.moves,
            vec![
                Move::new(Color::Black, Location::Point(Coordinate::new(2, 2))),
                Move::new(Color::White, Location::Point(Coordinate::new(6, 6))),
                Move::new(Color::Black, Location::Point(Coordinate::new(6, 2))),
            ]
        );
    }

    #[test]
    fn sgf_move_after_other_properties() {
        let record = GameRecord::from_sgf("(;SZ[19];C[opening]B[pd];W[dp]N[reply])").unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record.moves[0].player, Color::Black);
        assert_eq!(record.moves[1].player, Color::White);
    }

    #[test]
    fn sgf_escaped_bracket_in_comment() {
        let record =
            GameRecord::from_sgf(r"(;SZ[19]C[a \] (fake;W[aa]) b];B[pd]C[;B[dd\]];W[dp])").unwrap();
        assert_eq!(
            record.moves,
            vec![
                Move::new(Color::Black, Location::Point(Coordinate::new(15, 3))),
                Move::new(Color::White, Location::Point(Coordinate::new(3, 15))),
            ]
        );
        assert_eq!(unescape(r"a \] b\\"), r"a ] b\");
    }

    #[test]
    fn sgf_rejects_non_tree() {
        assert!(GameRecord::from_sgf("B[pd]").is_err());
    }

    #[test]
    fn move_list_skips_bad_entries() {
        let (moves, rejected) = parse_move_list("B D4, W Q16, X A1, B I3, W pass", 19);
        assert_eq!(moves.len(), 3);
        assert_eq!(moves[2], Move::new(Color::White, Location::Pass));
        assert_eq!(rejected, vec!["X A1", "B I3"]);
    }
}
