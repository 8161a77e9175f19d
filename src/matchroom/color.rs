use serde::{Deserialize, Serialize};

/// Piece color of a seat. `NoColor` is a sentinel for absence and is never a
/// legal player color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Light,
    Dark,
    NoColor,
}

impl Color {
    pub fn opponent(&self) -> Self {
        match self {
            Self::Light => Self::Dark,
            Self::Dark => Self::Light,
            Self::NoColor => Self::NoColor,
        }
    }

    /// The verdict in which this side wins, if it can win at all.
    pub fn wins(&self) -> Option<crate::rules::Verdict> {
        match self {
            Self::Light => Some(crate::rules::Verdict::LightWon),
            Self::Dark => Some(crate::rules::Verdict::DarkWon),
            Self::NoColor => None,
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Light => write!(f, "light"),
            Self::Dark => write!(f, "dark"),
            Self::NoColor => write!(f, "no_color"),
        }
    }
}

impl std::str::FromStr for Color {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(Self::Light),
            "dark" => Ok(Self::Dark),
            "no_color" => Ok(Self::NoColor),
            other => Err(anyhow::anyhow!("non-existent piece color {:?}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_strings_round_trip() {
        for color in [Color::Light, Color::Dark, Color::NoColor] {
            let encoded = serde_json::to_string(&color).unwrap();
            let decoded: Color = serde_json::from_str(&encoded).unwrap();
            assert_eq!(color, decoded);
        }
        assert_eq!(serde_json::to_string(&Color::NoColor).unwrap(), r#""no_color""#);
    }

    #[test]
    fn deserialization_writes_through() {
        let decoded: Color = serde_json::from_str(r#""dark""#).unwrap();
        assert_eq!(decoded, Color::Dark);
        assert!(serde_json::from_str::<Color>(r#""purple""#).is_err());
    }

    #[test]
    fn opponents_are_symmetric() {
        assert_eq!(Color::Light.opponent(), Color::Dark);
        assert_eq!(Color::Dark.opponent(), Color::Light);
        assert_eq!(Color::NoColor.opponent(), Color::NoColor);
    }
}
