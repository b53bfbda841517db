//! Mapping from drawn values to event kinds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What an idle tick should do, decided by one draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawnAction {
    SendOne,
    SendOther,
    SendBoth,
    Internal,
}

/// Invalid event value configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventRangeError {
    #[error("send value {0} is used by more than one send kind")]
    DuplicateSendValue(u32),

    #[error("send value {0} falls inside the internal range")]
    SendValueInInternalRange(u32),

    #[error("internal range {min}..={max} is empty")]
    EmptyInternalRange { min: u32, max: u32 },
}

/// Event value boundaries.
///
/// Each idle tick draws uniformly from the smallest to the largest configured
/// value. Three distinguished values select a send; every other value is an
/// internal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventRanges {
    pub send_to_one: u32,
    pub send_to_other: u32,
    pub send_to_both: u32,
    pub internal_min: u32,
    pub internal_max: u32,
}

impl Default for EventRanges {
    fn default() -> Self {
        Self {
            send_to_one: 1,
            send_to_other: 2,
            send_to_both: 3,
            internal_min: 4,
            internal_max: 10,
        }
    }
}

impl EventRanges {
    /// Inclusive bounds of the draw.
    pub fn draw_bounds(&self) -> (u32, u32) {
        let values = [
            self.send_to_one,
            self.send_to_other,
            self.send_to_both,
            self.internal_min,
            self.internal_max,
        ];
        let low = values.iter().copied().min().unwrap_or(0);
        let high = values.iter().copied().max().unwrap_or(0);
        (low, high)
    }

    /// Decide what a drawn value means.
    pub fn classify(&self, value: u32) -> DrawnAction {
        if value == self.send_to_one {
            DrawnAction::SendOne
        } else if value == self.send_to_other {
            DrawnAction::SendOther
        } else if value == self.send_to_both {
            DrawnAction::SendBoth
        } else {
            DrawnAction::Internal
        }
    }

    /// Check the three send values are distinct and outside the internal range.
    pub fn validate(&self) -> Result<(), EventRangeError> {
        if self.internal_min > self.internal_max {
            return Err(EventRangeError::EmptyInternalRange {
                min: self.internal_min,
                max: self.internal_max,
            });
        }
        let sends = [self.send_to_one, self.send_to_other, self.send_to_both];
        for (i, value) in sends.iter().enumerate() {
            if sends[i + 1..].contains(value) {
                return Err(EventRangeError::DuplicateSendValue(*value));
            }
            if (self.internal_min..=self.internal_max).contains(value) {
                return Err(EventRangeError::SendValueInInternalRange(*value));
            }
        }
        Ok(())
    }
}
