use super::Verdict;
use shakmaty::fen::Fen;
use shakmaty::san::San;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Outcome, Position};

/// Rules-engine handle for a single game.
///
/// Wraps the current position and exposes exactly the operations the match
/// machinery needs: apply a human move in SAN, apply an engine move in UCI
/// coordinate notation, serialize the position, and detect terminal outcomes.
/// Legality is enforced on application; an illegal or unparseable move leaves
/// the position untouched.
#[derive(Debug, Clone, Default)]
pub struct GameBoard {
    pos: Chess,
}

impl GameBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fen(fen: &str) -> anyhow::Result<Self> {
        let setup = Fen::from_ascii(fen.as_bytes())?;
        let pos = setup.into_position(CastlingMode::Standard)?;
        Ok(Self { pos })
    }

    /// Applies a move in standard algebraic notation, e.g. "Nf3" or "e4".
    pub fn play_san(&mut self, move_text: &str) -> anyhow::Result<()> {
        let san = move_text.parse::<San>()?;
        let m = san.to_move(&self.pos)?;
        self.pos.play_unchecked(&m);
        Ok(())
    }

    /// Applies a move in UCI coordinate notation, e.g. "e2e4" or "e7e8q".
    pub fn play_uci(&mut self, move_text: &str) -> anyhow::Result<()> {
        let uci = UciMove::from_ascii(move_text.as_bytes())?;
        let m = uci.to_move(&self.pos)?;
        self.pos.play_unchecked(&m);
        Ok(())
    }

    pub fn fen(&self) -> String {
        Fen::from_position(self.pos.clone(), EnPassantMode::Legal).to_string()
    }

    /// Terminal result of the current position, if the game is over.
    pub fn verdict(&self) -> Option<Verdict> {
        match self.pos.outcome() {
            Some(Outcome::Decisive { winner: Color::White }) => Some(Verdict::LightWon),
            Some(Outcome::Decisive { winner: Color::Black }) => Some(Verdict::DarkWon),
            Some(Outcome::Draw) => Some(Verdict::Drawn),
            None if self.seventy_five_moves() => Some(Verdict::Drawn),
            None => None,
        }
    }

    /// How the game ended, if it has.
    pub fn method(&self) -> Option<&'static str> {
        if self.pos.is_checkmate() {
            Some("checkmate")
        } else if self.pos.is_stalemate() {
            Some("stalemate")
        } else if self.pos.is_insufficient_material() {
            Some("insufficient material")
        } else if self.seventy_five_moves() {
            Some("seventy-five-move rule")
        } else {
            None
        }
    }

    fn seventy_five_moves(&self) -> bool {
        self.pos.halfmoves() >= 150
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_move_flips_side_to_move() {
        let mut board = GameBoard::new();
        board.play_san("e4").expect("legal opening move");
        assert!(board.fen().contains(" b "));
        assert_eq!(board.verdict(), None);
        assert_eq!(board.method(), None);
    }

    #[test]
    fn illegal_san_leaves_position_untouched() {
        let mut board = GameBoard::new();
        let before = board.fen();
        assert!(board.play_san("e5").is_err());
        assert!(board.play_san("Ke2").is_err());
        assert!(board.play_san("not a move").is_err());
        assert_eq!(board.fen(), before);
    }

    #[test]
    fn fools_mate_is_checkmate_for_dark() {
        let mut board = GameBoard::new();
        for m in ["f3", "e5", "g4", "Qh4#"] {
            board.play_san(m).expect("scripted mate line");
        }
        assert_eq!(board.verdict(), Some(Verdict::DarkWon));
        assert_eq!(board.method(), Some("checkmate"));
        assert_eq!(board.verdict().unwrap().score(), "0-1");
    }

    #[test]
    fn stalemate_is_drawn() {
        let board = GameBoard::from_fen("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1").expect("valid fen");
        assert_eq!(board.verdict(), Some(Verdict::Drawn));
        assert_eq!(board.method(), Some("stalemate"));
    }

    #[test]
    fn uci_move_round_trips_through_fen() {
        let mut board = GameBoard::new();
        board.play_uci("e2e4").expect("legal uci move");
        assert!(board.fen().starts_with("rnbqkbnr/pppppppp/8/8/4P3"));
        assert!(board.play_uci("e7e5q").is_err());
    }
}
