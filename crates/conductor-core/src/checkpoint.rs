use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Shadow snapshots of the workspace, taken before every file-mutating tool
/// call and keyed by `(run_id, call_id, tool)`. Snapshot, rewind and cleanup
/// are all best-effort: checkpoint trouble is logged and never fails the run.
pub struct CheckpointManager {
    shadow_root: PathBuf,
    sequences: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMeta {
    run_id: String,
    call_id: String,
    tool: String,
}

const MAX_SNAPSHOT_FILES: usize = 2_000;
const MAX_SNAPSHOT_FILE_BYTES: u64 = 4 * 1024 * 1024;

impl CheckpointManager {
    pub fn new(shadow_root: impl Into<PathBuf>) -> Self {
        Self {
            shadow_root: shadow_root.into(),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(&self, run_id: &str, call_id: &str, tool: &str, workspace: &Path) {
        let seq = self.next_sequence(run_id);
        let snapshot_dir = self
            .shadow_root
            .join(run_id)
            .join(format!("{seq:06}_{call_id}"));
        let meta = SnapshotMeta {
            run_id: run_id.to_string(),
            call_id: call_id.to_string(),
            tool: tool.to_string(),
        };
        let workspace = workspace.to_path_buf();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            std::fs::create_dir_all(&snapshot_dir)?;
            let meta_json = serde_json::to_vec(&meta)?;
            std::fs::write(snapshot_dir.join(".snapshot.json"), meta_json)?;
            copy_tree(&workspace, &snapshot_dir.join("tree"))?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(run_id, call_id, "shadow checkpoint failed: {err:#}");
            }
            Err(err) => {
                tracing::warn!(run_id, call_id, "shadow checkpoint task failed: {err}");
            }
        }
    }

    /// Restore the run's first snapshot over the working tree. Files created
    /// after the snapshot are left in place; tracked files revert.
    pub async fn rewind_to_first(&self, run_id: &str, workspace: &Path) {
        let run_dir = self.shadow_root.join(run_id);
        let workspace = workspace.to_path_buf();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let Some(first) = first_snapshot(&run_dir)? else {
                return Ok(false);
            };
            copy_tree(&first.join("tree"), &workspace)?;
            Ok(true)
        })
        .await;

        match result {
            Ok(Ok(true)) => {
                tracing::info!(run_id, "workspace rewound to first shadow checkpoint");
            }
            Ok(Ok(false)) => {
                tracing::warn!(run_id, "no shadow checkpoint to rewind to");
            }
            Ok(Err(err)) => {
                tracing::warn!(run_id, "shadow rewind failed: {err:#}");
            }
            Err(err) => {
                tracing::warn!(run_id, "shadow rewind task failed: {err}");
            }
        }
    }

    /// Drop all of the run's snapshots, keeping the working tree as-is.
    pub async fn cleanup(&self, run_id: &str) {
        if let Ok(mut sequences) = self.sequences.lock() {
            sequences.remove(run_id);
        }
        let run_dir = self.shadow_root.join(run_id);
        if let Err(err) = tokio::fs::remove_dir_all(&run_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(run_id, "shadow cleanup failed: {err}");
            }
        }
    }

    fn next_sequence(&self, run_id: &str) -> u64 {
        let Ok(mut sequences) = self.sequences.lock() else {
            return 0;
        };
        let seq = sequences.entry(run_id.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }
}

fn first_snapshot(run_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(run_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs.into_iter().next())
}

/// Bounded recursive copy, skipping VCS internals and anything oversized.
fn copy_tree(from: &Path, to: &Path) -> anyhow::Result<()> {
    let mut copied = 0usize;
    copy_tree_inner(from, to, &mut copied)
}

fn copy_tree_inner(from: &Path, to: &Path, copied: &mut usize) -> anyhow::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        if *copied >= MAX_SNAPSHOT_FILES {
            return Ok(());
        }
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" || name == ".shadow" || name == ".snapshot.json" {
            continue;
        }
        let src = entry.path();
        let dst = to.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree_inner(&src, &dst, copied)?;
        } else if file_type.is_file() {
            if entry.metadata()?.len() > MAX_SNAPSHOT_FILE_BYTES {
                continue;
            }
            std::fs::copy(&src, &dst)?;
            *copied += 1;
        }
    }
    Ok(())
}
