//! Resource lifecycle state machine

use serde::{Deserialize, Serialize};

/// What kind of cloud object a resource record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Vpc,
    Subnet,
    SecurityGroup,
    Instance,
    Route,
}

/// Whether a resource may disappear underneath us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Durability {
    /// Stays until we destroy it
    Durable,
    /// May be reclaimed by the provider (spot capacity); refresh must
    /// detect the loss and apply must rebuild it
    Interruptible,
}

/// Lifecycle of a managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceState {
    /// Not present in the cloud
    Absent,
    /// Apply has decided to create it
    Planned,
    /// Creation call in flight
    Applying,
    /// Exists and observed healthy
    Active,
    /// Deletion call in flight
    Destroying,
}

impl ResourceState {
    /// Legal transitions of the lifecycle; anything else indicates a
    /// provisioner bug or corrupted state file
    pub fn can_transition_to(self, next: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, next),
            (Absent, Planned)
                | (Planned, Applying)
                | (Planned, Absent)
                | (Applying, Active)
                | (Applying, Absent)
                | (Active, Destroying)
                // An interruptible resource observed missing
                | (Active, Absent)
                | (Destroying, Absent)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ResourceState::*;

    #[test]
    fn test_create_path() {
        assert!(Absent.can_transition_to(Planned));
        assert!(Planned.can_transition_to(Applying));
        assert!(Applying.can_transition_to(Active));
    }

    #[test]
    fn test_destroy_path() {
        assert!(Active.can_transition_to(Destroying));
        assert!(Destroying.can_transition_to(Absent));
    }

    #[test]
    fn test_interruption_observed() {
        assert!(Active.can_transition_to(Absent));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Absent.can_transition_to(Active));
        assert!(!Active.can_transition_to(Planned));
        assert!(!Destroying.can_transition_to(Active));
    }
}
