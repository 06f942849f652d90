use std::time::Duration;

use crate::engine::EngineError;
use crate::limits::MAX_POLICY_LEN;
use crate::model::{Ms, Source};

/// Per-source reservation policy, parsed from the stored duration string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub max_duration: Ms,
}

impl Policy {
    /// Accepts anything `humantime` does: `"2h"`, `"90m"`, `"1h 30m"`, `"1day"`.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > MAX_POLICY_LEN {
            return Err(EngineError::PolicyMalformed(raw.to_string()));
        }
        let duration = humantime::parse_duration(raw)
            .map_err(|_| EngineError::PolicyMalformed(raw.to_string()))?;
        Ok(Self {
            max_duration: duration_ms(duration),
        })
    }

    pub fn for_source(source: &Source) -> Result<Self, EngineError> {
        Self::parse(&source.max_possible_duration)
    }
}

fn duration_ms(d: Duration) -> Ms {
    Ms::try_from(d.as_millis()).unwrap_or(Ms::MAX)
}
