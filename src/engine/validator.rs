use ulid::Ulid;

use crate::model::{Ms, Reservation};
use crate::policy::Policy;

use super::EngineError;

/// A reservation as it would be written, before the decision.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub from: Ms,
    pub to: Ms,
    /// Set on update so the record does not collide with its own prior window.
    pub exclude_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidInterval { from: Ms, to: Ms },
    PolicyViolation { duration: Ms, max: Ms },
    OverlapConflict(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(Rejection),
}

/// Decide a candidate against its source policy and the reservations the
/// store reported as overlapping with a shared participant.
///
/// Order is fixed: interval shape, then policy, then overlap.
pub fn validate(candidate: &Candidate, policy: &Policy, overlaps: &[Reservation]) -> Verdict {
    if candidate.to <= candidate.from {
        return Verdict::Reject(Rejection::InvalidInterval {
            from: candidate.from,
            to: candidate.to,
        });
    }
    let duration = candidate.to - candidate.from;
    if duration > policy.max_duration {
        return Verdict::Reject(Rejection::PolicyViolation {
            duration,
            max: policy.max_duration,
        });
    }
    if let Some(existing) = overlaps
        .iter()
        .find(|r| Some(r.id) != candidate.exclude_id)
    {
        return Verdict::Reject(Rejection::OverlapConflict(existing.id));
    }
    Verdict::Accept
}

impl From<Rejection> for EngineError {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::InvalidInterval { from, to } => EngineError::InvalidInterval { from, to },
            Rejection::PolicyViolation { duration, max } => {
                EngineError::PolicyViolation { duration, max }
            }
            Rejection::OverlapConflict(id) => EngineError::OverlapConflict(id),
        }
    }
}

impl Rejection {
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::InvalidInterval { .. } => "invalid_interval",
            Rejection::PolicyViolation { .. } => "policy_violation",
            Rejection::OverlapConflict(_) => "overlap_conflict",
        }
    }
}
