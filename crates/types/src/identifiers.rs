//! Domain-specific identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine identifier.
///
/// Small integer, unique within a cluster. The ordering of identifiers decides
/// which side of a pair initiates the connection (lower connects to higher).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MachineId(pub u32);

impl MachineId {
    /// Get the raw value.
    pub fn get(&self) -> u32 {
        self.0
    }

    /// Whether this machine dials `other` (as opposed to waiting for `other` to dial in).
    pub fn initiates_to(&self, other: MachineId) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Machine({})", self.0)
    }
}

impl From<u32> for MachineId {
    fn from(id: u32) -> Self {
        MachineId(id)
    }
}
