use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// Tools whose successful execution mutates the workspace. Shared between
/// stall detection (progress = successful mutation with novel output) and
/// checkpointing (shadow commit before each of these).
pub const FILE_MODIFYING_TOOLS: &[&str] = &[
    "Edit",
    "Write",
    "Bash",
    "execute",
    "write_file",
    "edit_file",
];

pub fn is_file_modifying(tool: &str) -> bool {
    FILE_MODIFYING_TOOLS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(tool))
}

#[derive(Debug, Default)]
struct StallState {
    consecutive_no_progress: u32,
    strikes: u32,
    last_output_hash: Option<u64>,
}

/// Per-run sliding window over step outcomes. Fires once
/// `threshold` consecutive no-progress steps have been observed
/// `max_retries` times; any progress step fully resets the window.
/// Called from bus callback tasks, so the interior is locked.
#[derive(Debug)]
pub struct StallTracker {
    threshold: u32,
    max_retries: u32,
    state: Mutex<StallState>,
}

impl StallTracker {
    pub fn new(threshold: u32, max_retries: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            max_retries: max_retries.max(1),
            state: Mutex::new(StallState::default()),
        }
    }

    /// Returns true the moment the tracker fires. Identical consecutive
    /// outputs count as no-progress even for successful mutations.
    pub fn record_step(&self, tool: &str, success: bool, output: &str) -> bool {
        let hash = hash_output(output);
        let Ok(mut state) = self.state.lock() else {
            return false;
        };

        let repeated = state.last_output_hash == Some(hash);
        state.last_output_hash = Some(hash);

        let progress = success && is_file_modifying(tool) && !repeated;
        if progress {
            state.consecutive_no_progress = 0;
            return false;
        }

        state.consecutive_no_progress += 1;
        if state.consecutive_no_progress >= self.threshold {
            state.strikes += 1;
            state.consecutive_no_progress = 0;
            if state.strikes >= self.max_retries {
                return true;
            }
        }
        false
    }
}

fn hash_output(output: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    output.hash(&mut hasher);
    hasher.finish()
}
