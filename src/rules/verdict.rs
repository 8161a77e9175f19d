/// Terminal result of a finished game, as reported by the rules engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    LightWon,
    DarkWon,
    Drawn,
}

impl Verdict {
    /// Conventional score string for the result.
    pub fn score(&self) -> &'static str {
        match self {
            Self::LightWon => "1-0",
            Self::DarkWon => "0-1",
            Self::Drawn => "1/2-1/2",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.score())
    }
}
