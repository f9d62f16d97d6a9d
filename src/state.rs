//! Rebuild state machine vocabulary shared by the coordinator and journal.

use serde::{Deserialize, Serialize};

/// Lifecycle of one full rebuild run. Every change is appended to the
/// journal's transition log before the coordinator acts on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RebuildState {
    Building,
    Validating,
    Swapping,
    Committed,
    RolledBack,
    Aborted,
    /// The exchange failed and restoring the previous production could not
    /// be confirmed. Needs an operator.
    UnknownState,
}

impl RebuildState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Validating => "validating",
            Self::Swapping => "swapping",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Aborted => "aborted",
            Self::UnknownState => "unknown_state",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "building" => Some(Self::Building),
            "validating" => Some(Self::Validating),
            "swapping" => Some(Self::Swapping),
            "committed" => Some(Self::Committed),
            "rolled_back" => Some(Self::RolledBack),
            "aborted" => Some(Self::Aborted),
            "unknown_state" => Some(Self::UnknownState),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::RolledBack | Self::Aborted | Self::UnknownState
        )
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Building, Self::Validating)
                | (Self::Building, Self::Aborted)
                | (Self::Validating, Self::Swapping)
                | (Self::Validating, Self::Aborted)
                | (Self::Swapping, Self::Committed)
                | (Self::Swapping, Self::Aborted)
                | (Self::Swapping, Self::RolledBack)
                | (Self::Swapping, Self::UnknownState)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RebuildPhase {
    Extract,
    Base,
    Aggregate,
    Rating,
    Compose,
    Stage,
    Validate,
    Swap,
}

impl RebuildPhase {
    pub const ALL: [RebuildPhase; 8] = [
        Self::Extract,
        Self::Base,
        Self::Aggregate,
        Self::Rating,
        Self::Compose,
        Self::Stage,
        Self::Validate,
        Self::Swap,
    ];

    pub fn number(self) -> u32 {
        match self {
            Self::Extract => 1,
            Self::Base => 2,
            Self::Aggregate => 3,
            Self::Rating => 4,
            Self::Compose => 5,
            Self::Stage => 6,
            Self::Validate => 7,
            Self::Swap => 8,
        }
    }

    pub fn total() -> u32 {
        Self::ALL.len() as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Base => "base",
            Self::Aggregate => "aggregate",
            Self::Rating => "rating",
            Self::Compose => "compose",
            Self::Stage => "stage",
            Self::Validate => "validate",
            Self::Swap => "swap",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|phase| phase.name() == lower)
    }

    pub fn from_number(number: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|phase| phase.number() == number)
    }

    /// Phases whose output is a pure function of the earlier ones and can be
    /// checkpointed.
    pub fn is_checkpointed(self) -> bool {
        self.number() <= Self::Compose.number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_forward_edges_are_allowed() {
        use RebuildState::*;
        assert!(Building.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Swapping));
        assert!(Swapping.can_transition_to(Committed));
        assert!(Swapping.can_transition_to(UnknownState));
        assert!(Swapping.can_transition_to(Aborted));

        assert!(!Building.can_transition_to(Swapping));
        assert!(!Validating.can_transition_to(Committed));
        assert!(!Committed.can_transition_to(Building));
        assert!(!Aborted.can_transition_to(Validating));
        assert!(!Validating.can_transition_to(RolledBack));
    }

    #[test]
    fn terminal_states() {
        use RebuildState::*;
        for state in [Committed, RolledBack, Aborted, UnknownState] {
            assert!(state.is_terminal());
            assert_eq!(RebuildState::parse(state.as_str()), Some(state));
        }
        for state in [Building, Validating, Swapping] {
            assert!(!state.is_terminal());
        }
    }

    #[test]
    fn phases_are_numbered_in_order() {
        let numbers: Vec<u32> = RebuildPhase::ALL.iter().map(|p| p.number()).collect();
        assert_eq!(numbers, (1..=8).collect::<Vec<_>>());
        assert_eq!(RebuildPhase::parse(" Rating "), Some(RebuildPhase::Rating));
        assert_eq!(RebuildPhase::from_number(6), Some(RebuildPhase::Stage));
        assert!(RebuildPhase::Compose.is_checkpointed());
        assert!(!RebuildPhase::Stage.is_checkpointed());
    }
}
