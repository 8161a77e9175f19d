use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Clock budget granted to each player; doubles as the matchmaking bucket key.
///
/// Wire form is a humantime string ("5m", "30s"); parsing accepts the usual
/// concatenated grammar ("5m0s"). Deserialization accepts any well-formed
/// duration so handlers can distinguish a bad payload from an unsupported
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeControl(Duration);

pub const SUPPORTED_TIME_CONTROLS: [TimeControl; 5] = [
    TimeControl::from_minutes(1),
    TimeControl::from_minutes(3),
    TimeControl::from_minutes(5),
    TimeControl::from_minutes(10),
    TimeControl::from_minutes(20),
];

/// Engine matches are not bucketed by time control; the human side always
/// plays on this budget.
pub const ENGINE_MATCH_TIME_CONTROL: TimeControl = TimeControl::from_minutes(30);

impl TimeControl {
    pub const fn from_minutes(minutes: u64) -> Self {
        Self(Duration::from_secs(minutes * 60))
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_TIME_CONTROLS.contains(self)
    }
}

impl std::fmt::Display for TimeControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl Serialize for TimeControl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TimeControl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text)
            .map(TimeControl)
            .map_err(D::Error::custom)
    }
}

/// Playing-strength bucket for engine matches, expressed as an Elo target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineLevel(pub u16);

pub const SUPPORTED_ENGINE_LEVELS: [EngineLevel; 5] = [
    EngineLevel(600),
    EngineLevel(1000),
    EngineLevel(1400),
    EngineLevel(1800),
    EngineLevel(2200),
];

impl EngineLevel {
    pub fn is_supported(&self) -> bool {
        SUPPORTED_ENGINE_LEVELS.contains(self)
    }
}

impl std::fmt::Display for EngineLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Go-style duration wire form, truncated to whole seconds for clock frames.
pub fn wire_duration(d: Duration) -> String {
    humantime::format_duration(Duration::from_secs(d.as_secs())).to_string()
}
