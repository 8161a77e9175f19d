use crate::rules::Verdict;

pub type MatchId = uuid::Uuid;

/// Record carried on the cleanup channel from a match's terminators to the
/// owning manager's sweep loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome<B> {
    pub id: MatchId,
    pub bucket: B,
    pub outcome: String,
    pub method: String,
}

impl<B> MatchOutcome<B> {
    pub fn decided(id: MatchId, bucket: B, verdict: Verdict, method: &str) -> Self {
        Self {
            id,
            bucket,
            outcome: verdict.score().to_string(),
            method: method.to_string(),
        }
    }

    pub fn flagged(id: MatchId, bucket: B, verdict: Verdict) -> Self {
        Self {
            id,
            bucket,
            outcome: verdict.score().to_string(),
            method: "flagged".to_string(),
        }
    }

    pub fn abandoned(id: MatchId, bucket: B) -> Self {
        Self {
            id,
            bucket,
            outcome: "abandoned".to_string(),
            method: String::new(),
        }
    }

    /// A match that never managed to seat both players.
    pub fn unstarted(id: MatchId, bucket: B) -> Self {
        Self {
            id,
            bucket,
            outcome: "0-0".to_string(),
            method: "abandonment".to_string(),
        }
    }
}
