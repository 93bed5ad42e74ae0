//! Pid list parsing and diffing for `track-jdwp` frames

use std::collections::{BTreeSet, HashSet};

/// Parse one frame of newline-separated pids
///
/// Non-numeric lines are skipped; duplicates collapse.
pub fn parse_pid_list(frame: &[u8]) -> BTreeSet<u32> {
    String::from_utf8_lossy(frame)
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            match line.parse::<u32>() {
                Ok(pid) => Some(pid),
                Err(_) => {
                    log::debug!("Skipping non-numeric pid line {:?}", line);
                    None
                }
            }
        })
        .collect()
}

/// Pids to drop and pids to open
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PidDiff {
    pub removed: Vec<u32>,
    pub added: Vec<u32>,
}

impl PidDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Compare the current sessions against a new pid list
pub fn diff_pids(current: &HashSet<u32>, next: &BTreeSet<u32>) -> PidDiff {
    let mut removed: Vec<u32> = current.iter().filter(|p| !next.contains(*p)).copied().collect();
    removed.sort_unstable();
    let added = next.iter().filter(|p| !current.contains(*p)).copied().collect();
    PidDiff { removed, added }
}
