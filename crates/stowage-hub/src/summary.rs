//! Bounded directory-summary probing.
//!
//! Summaries (file count, total bytes per directory) are a convenience the
//! UI can live without, so the probe is strictly budgeted: at most four
//! workers, at most 200 directories, and a five-second wall clock. Whatever
//! finishes inside the budget is returned with `completed` marking whether
//! the sweep covered everything.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::driver::HubDriver;
use stowage_core::OpContext;
use stowage_types::{Result, path};

const MAX_WORKERS: usize = 4;
const MAX_DIRS: usize = 200;
const WALL_CLOCK: Duration = Duration::from_secs(5);

/// Aggregate facts about one directory.
#[derive(Debug, Clone, Serialize)]
pub struct DirSummary {
    pub path: String,
    pub file_count: u64,
    pub total_bytes: u64,
    /// False when the budget expired before this directory was fully walked.
    pub completed: bool,
}

/// Probe summaries for a set of directories.
///
/// Returns partial results; the second tuple element is `false` when any
/// directory was skipped or truncated by the budget.
pub fn directory_summary(
    driver: &HubDriver,
    cx: &OpContext,
    dirs: &[String],
) -> Result<(Vec<DirSummary>, bool)> {
    let deadline = Instant::now() + WALL_CLOCK;
    let truncated_input = dirs.len() > MAX_DIRS;

    let mut queue = VecDeque::new();
    for raw in dirs.iter().take(MAX_DIRS) {
        queue.push_back(path::normalize(raw, Some(true))?);
    }
    let queue = Mutex::new(queue);
    let results: Mutex<Vec<DirSummary>> = Mutex::new(Vec::new());
    let workers = MAX_WORKERS.min(dirs.len().max(1));

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if Instant::now() >= deadline || cx.cancel.is_cancelled() {
                        break;
                    }
                    let dir = {
                        let mut queue = queue.lock().expect("summary queue");
                        match queue.pop_front() {
                            Some(dir) => dir,
                            None => break,
                        }
                    };
                    let repo_path = path::strip_root(dir.trim_end_matches('/')).to_string();
                    let summary = match driver.walk_files(cx, &repo_path) {
                        Ok(files) => DirSummary {
                            path: dir,
                            file_count: files.len() as u64,
                            total_bytes: files
                                .iter()
                                .filter_map(|f| f.content_size())
                                .sum(),
                            completed: Instant::now() < deadline,
                        },
                        Err(_) => DirSummary {
                            path: dir,
                            file_count: 0,
                            total_bytes: 0,
                            completed: false,
                        },
                    };
                    results.lock().expect("summary results").push(summary);
                }
            });
        }
    });

    let summaries = results.into_inner().expect("summary results");
    let unprocessed = !queue.into_inner().expect("summary queue").is_empty();
    let all_done = !truncated_input
        && !unprocessed
        && summaries.iter().all(|s| s.completed);
    Ok((summaries, all_done))
}
