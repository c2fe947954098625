//! Sandbox status - the per-service readiness state machine
//!
//! ```text
//! OFFLINE ──► BUILDING ──► BUILDING_WAITING ──► READY ──► WORKING ──► WORKING_APPLYING
//!                 │                │              ▲                          │
//!                 └────────────────┼──────────────┘                          │
//!                                  └──► OFFLINE          READY ◄─────────────┘
//!
//! any ──► OFFLINE        (hard failure)
//! any ──► BUILDING       (teardown only)
//! ```

use serde::{Deserialize, Serialize};

/// Status of one service's sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxStatus {
    /// No live sandbox (never started, or the last attempt failed)
    Offline,
    /// Creating or attaching to the sandbox
    Building,
    /// Sandbox exists but has not answered a readiness check yet
    BuildingWaiting,
    /// Live and idle
    Ready,
    /// At least one agent turn is streaming against this sandbox
    Working,
    /// A turn is materializing patches, linting or committing
    WorkingApplying,
}

/// Why a status is being assigned. Teardown is the only reason allowed
/// to leave the regular edge set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Regular,
    Teardown,
}

impl SandboxStatus {
    /// Label used for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Offline => "OFFLINE",
            SandboxStatus::Building => "BUILDING",
            SandboxStatus::BuildingWaiting => "BUILDING_WAITING",
            SandboxStatus::Ready => "READY",
            SandboxStatus::Working => "WORKING",
            SandboxStatus::WorkingApplying => "WORKING_APPLYING",
        }
    }

    /// Whether `self -> next` is a legal edge for the given kind of transition.
    ///
    /// Re-assigning the current value is always allowed and is a no-op for
    /// callers (they skip the broadcast).
    pub fn can_transition_to(&self, next: SandboxStatus, kind: Transition) -> bool {
        use SandboxStatus::*;

        if *self == next {
            return true;
        }
        if next == Offline {
            return true;
        }
        if kind == Transition::Teardown && next == Building {
            return true;
        }
        matches!(
            (*self, next),
            (Offline, Building)
                | (Building, BuildingWaiting)
                | (Building, Ready)
                | (BuildingWaiting, Ready)
                | (Ready, Working)
                | (Working, WorkingApplying)
                | (WorkingApplying, Ready)
        )
    }

    /// A sandbox in one of these states has a live handle that turns may use
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SandboxStatus::Ready | SandboxStatus::Working | SandboxStatus::WorkingApplying
        )
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
