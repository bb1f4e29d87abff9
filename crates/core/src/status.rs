//! Job status state machine and backend tags.
//!
//! Status enums are stored as SMALLINT ids; the discriminants are part of
//! the persisted format and must not be renumbered.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Every variant, in id order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Look up a variant by its database ID.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Wire name, identical to the serde representation.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $label ),+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| {
                        CoreError::Validation(format!(
                            "Unknown {} '{s}'",
                            stringify!($name)
                        ))
                    })
            }
        }
    };
}

define_status_enum! {
    /// Job lifecycle status.
    JobStatus {
        Pending = 1 => "pending",
        Running = 2 => "running",
        Completed = 3 => "completed",
        Failed = 4 => "failed",
        Cancelled = 5 => "cancelled",
    }
}

define_status_enum! {
    /// Execution environment a job is bound to at submission.
    BackendType {
        Local = 1 => "local",
        RemoteDocker = 2 => "remote_docker",
        Slurm = 3 => "slurm",
    }
}

impl JobStatus {
    /// Statuses from which no further transition is possible.
    pub const TERMINAL: [JobStatus; 3] = [
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// The only reachable edges are pending -> running, pending -> cancelled
    /// and running -> {completed, failed, cancelled}.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }

    /// Validate a transition, returning a `Conflict` for illegal edges.
    pub fn transition(self, next: JobStatus) -> Result<JobStatus, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::Conflict(format!(
                "Illegal job status transition {self} -> {next}"
            )))
        }
    }
}

impl BackendType {
    /// Remote backends need a connected session at submission time.
    pub fn is_remote(self) -> bool {
        !matches!(self, BackendType::Local)
    }
}

// ---------------------------------------------------------------------------
// Observations
// ---------------------------------------------------------------------------

/// What a backend reports about a submitted unit of work.
///
/// This is an observation, not a job status: the lifecycle manager decides
/// which transition (if any) an observation triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ObservedState {
    /// Accepted by the backend but not started (queued, container created).
    Pending,
    Running,
    /// Process ended on its own with this exit code.
    Exited { exit_code: i32 },
    /// Stopped from outside (for example `scancel` by an administrator).
    Cancelled,
    /// Backend answered but the state is not recognised.
    Unknown { raw: String },
}

impl ObservedState {
    pub fn is_finished(&self) -> bool {
        matches!(self, ObservedState::Exited { .. } | ObservedState::Cancelled)
    }
}
