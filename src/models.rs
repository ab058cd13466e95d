use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundStatus {
    #[serde(rename = "WAITING")]
    Waiting,
    #[serde(rename = "LOCKED")]
    Locked,
    #[serde(rename = "COUNTDOWN")]
    Countdown,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "READY_DRAW")]
    ReadyDraw,
    #[serde(rename = "DRAWING")]
    Drawing,
    #[serde(rename = "PENDING_CONFIRM")]
    PendingConfirm,
    #[serde(rename = "FINISHED")]
    Finished,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Waiting => "WAITING",
            RoundStatus::Locked => "LOCKED",
            RoundStatus::Countdown => "COUNTDOWN",
            RoundStatus::Running => "RUNNING",
            RoundStatus::ReadyDraw => "READY_DRAW",
            RoundStatus::Drawing => "DRAWING",
            RoundStatus::PendingConfirm => "PENDING_CONFIRM",
            RoundStatus::Finished => "FINISHED",
        }
    }

    pub fn parse(s: &str) -> Option<RoundStatus> {
        Some(match s {
            "WAITING" => RoundStatus::Waiting,
            "LOCKED" => RoundStatus::Locked,
            "COUNTDOWN" => RoundStatus::Countdown,
            "RUNNING" => RoundStatus::Running,
            "READY_DRAW" => RoundStatus::ReadyDraw,
            "DRAWING" => RoundStatus::Drawing,
            "PENDING_CONFIRM" => RoundStatus::PendingConfirm,
            "FINISHED" => RoundStatus::Finished,
            _ => return None,
        })
    }

    /// Reveal data is only served once outcomes can no longer change.
    pub fn reveal_open(&self) -> bool {
        matches!(
            self,
            RoundStatus::ReadyDraw
                | RoundStatus::Drawing
                | RoundStatus::PendingConfirm
                | RoundStatus::Finished
        )
    }
}

/// Round configuration, immutable once the round has started. Monetary
/// fields are integer minor units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: i64,
    pub title: String,
    pub total_pool: i64,
    pub duration_sec: i64,
    pub slice_ms: i64,
    pub drops_per_slice: i64,
    pub bombs_per_slice: i64,
    pub bigs_per_slice: i64,
    pub empty_per_slice: i64,
    pub big_multiplier: f64,
    pub max_speed: f64,
    pub drop_visible_ms: i64,
    pub score_total: i64,
    pub bomb_penalty: i64,
    pub lucky_ratio: i64,
    pub base_ratio: i64,
    pub status: RoundStatus,
    #[serde(rename = "start_at")]
    pub start_at_ms: i64,
    #[serde(rename = "end_at")]
    pub end_at_ms: i64,
    pub seed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for st in [
            RoundStatus::Waiting,
            RoundStatus::Locked,
            RoundStatus::Countdown,
            RoundStatus::Running,
            RoundStatus::ReadyDraw,
            RoundStatus::Drawing,
            RoundStatus::PendingConfirm,
            RoundStatus::Finished,
        ] {
            assert_eq!(RoundStatus::parse(st.as_str()), Some(st));
        }
        assert_eq!(RoundStatus::parse("NOPE"), None);
    }

    #[test]
    fn test_reveal_gating() {
        assert!(!RoundStatus::Running.reveal_open());
        assert!(!RoundStatus::Countdown.reveal_open());
        assert!(RoundStatus::ReadyDraw.reveal_open());
        assert!(RoundStatus::Finished.reveal_open());
    }
}
