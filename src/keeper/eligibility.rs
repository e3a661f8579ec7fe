use serde::Serialize;

use crate::{
    keeper::registry::FailureMark,
    ledger::models::InheritanceRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityState {
    Active,
    Inactive,
    Eligible,
    Executed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub state: EligibilityState,
    pub reason: String,
    /// Seconds until the inactivity period elapses; zero once it has
    pub time_remaining_secs: i64,
}

impl Evaluation {
    pub fn is_eligible(&self) -> bool {
        self.state == EligibilityState::Eligible
    }
}

/// Pure eligibility evaluation of a validated record at `now` (unix seconds).
pub fn evaluate(record: &InheritanceRecord, now: i64) -> Evaluation {
    let deadline = record
        .last_active_at
        .saturating_add(record.inactivity_period_secs);
    let time_remaining_secs = deadline.saturating_sub(now).max(0);

    if record.is_executed {
        return Evaluation {
            state: EligibilityState::Executed,
            reason: "inheritance already executed".to_string(),
            time_remaining_secs: 0,
        };
    }

    let inactive_for = now.saturating_sub(record.last_active_at);
    if inactive_for <= record.inactivity_period_secs {
        return Evaluation {
            state: EligibilityState::Active,
            reason: format!(
                "owner active {}s ago, period is {}s",
                inactive_for.max(0),
                record.inactivity_period_secs
            ),
            time_remaining_secs,
        };
    }

    if record.balance == 0 {
        return Evaluation {
            state: EligibilityState::Inactive,
            reason: "owner inactive but there is nothing to distribute".to_string(),
            time_remaining_secs: 0,
        };
    }

    Evaluation {
        state: EligibilityState::Eligible,
        reason: format!(
            "owner inactive for {}s (> {}s)",
            inactive_for, record.inactivity_period_secs
        ),
        time_remaining_secs: 0,
    }
}

/// Evaluation shared by status reporting and execution gating.
///
/// INVARIANT: both call sites go through here so the keeper never acts on a
/// different belief than it reports.
pub fn assess(record: &InheritanceRecord, failure: Option<&FailureMark>, now: i64) -> Evaluation {
    if record.is_executed {
        return evaluate(record, now);
    }

    if let Some(mark) = failure {
        return Evaluation {
            state: EligibilityState::Failed,
            reason: mark.reason.clone(),
            time_remaining_secs: 0,
        };
    }

    if let Err(e) = record.validate() {
        return Evaluation {
            state: EligibilityState::Failed,
            reason: e.to_string(),
            time_remaining_secs: 0,
        };
    }

    evaluate(record, now)
}
