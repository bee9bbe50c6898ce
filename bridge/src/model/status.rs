//! Printer lifecycle status

use serde::{Deserialize, Serialize};

/// Lifecycle status as shown to observers.
///
/// No ordering of transitions is enforced: the firmware may jump from any
/// status to any other and the latest reported value wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintStatus {
    Idle,
    Printing,
    Paused,
    Stopped,
    Completed,
    Error,
    SelfTesting,
    Pausing,
    Resuming,
}

impl PrintStatus {
    /// Map the raw `state` code reported by the firmware.
    pub fn from_state_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(PrintStatus::Idle),
            1 => Some(PrintStatus::Printing),
            2 => Some(PrintStatus::SelfTesting),
            3 => Some(PrintStatus::Error),
            4 => Some(PrintStatus::Stopped),
            5 => Some(PrintStatus::Paused),
            _ => None,
        }
    }

    /// Combine the raw state with the other job fields that refine it.
    pub fn derive(
        state_code: Option<i64>,
        error_code: Option<i64>,
        progress: Option<u8>,
        file_name: Option<&str>,
    ) -> Option<Self> {
        if matches!(error_code, Some(code) if code != 0) {
            return Some(PrintStatus::Error);
        }
        let status = PrintStatus::from_state_code(state_code?)?;
        let has_file = file_name.is_some_and(|name| !name.is_empty());
        if status == PrintStatus::Idle && progress == Some(100) && has_file {
            return Some(PrintStatus::Completed);
        }
        Some(status)
    }

    /// A job is loaded on the printer (running, paused or in a transition).
    pub fn is_job_active(&self) -> bool {
        matches!(
            self,
            PrintStatus::Printing
                | PrintStatus::Paused
                | PrintStatus::Pausing
                | PrintStatus::Resuming
                | PrintStatus::SelfTesting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PrintStatus::Idle => "idle",
            PrintStatus::Printing => "printing",
            PrintStatus::Paused => "paused",
            PrintStatus::Stopped => "stopped",
            PrintStatus::Completed => "completed",
            PrintStatus::Error => "error",
            PrintStatus::SelfTesting => "self_testing",
            PrintStatus::Pausing => "pausing",
            PrintStatus::Resuming => "resuming",
        }
    }
}

impl std::fmt::Display for PrintStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
