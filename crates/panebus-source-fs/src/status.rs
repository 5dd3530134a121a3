//! Local status probe: lightweight counts, branch head and dirty path set.
//!
//! The probe is blocking and runs off the confined region. Output is reduced
//! to counts and path identifiers before it leaves this module; raw command
//! output never reaches an envelope.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use panebus_core::GitStatusCounts;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to spawn status command for {root}: {source}")]
    Spawn {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("status command failed for {root} (exit code {code}): {stderr}")]
    Failed {
        root: PathBuf,
        code: i32,
        stderr: String,
    },
}

/// Reduced status of one root. Paths are relative to the root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub counts: GitStatusCounts,
    pub branch: Option<String>,
    pub dirty_paths: BTreeSet<PathBuf>,
}

/// Computes a [`StatusReport`] for a root. Enables fakes in tests.
pub trait StatusProbe: Send + Sync {
    fn probe(&self, root: &Path) -> Result<StatusReport, StatusError>;
}

impl<T: StatusProbe + ?Sized> StatusProbe for std::sync::Arc<T> {
    fn probe(&self, root: &Path) -> Result<StatusReport, StatusError> {
        (**self).probe(root)
    }
}

// ─── Git CLI ──────────────────────────────────────────────────────

/// Probe backed by `git status --porcelain=v2 --branch`.
#[derive(Debug, Clone)]
pub struct GitCliProbe {
    git_bin: PathBuf,
}

impl GitCliProbe {
    pub fn new(git_bin: impl Into<PathBuf>) -> Self {
        Self {
            git_bin: git_bin.into(),
        }
    }

    fn run(&self, root: &Path, args: &[&str]) -> Result<String, StatusError> {
        let output = std::process::Command::new(&self.git_bin)
            .arg("--no-optional-locks")
            .arg("-C")
            .arg(root)
            .args(args)
            .output()
            .map_err(|source| StatusError::Spawn {
                root: root.to_path_buf(),
                source,
            })?;
        if !output.status.success() {
            return Err(StatusError::Failed {
                root: root.to_path_buf(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for GitCliProbe {
    fn default() -> Self {
        Self::new("git")
    }
}

impl StatusProbe for GitCliProbe {
    fn probe(&self, root: &Path) -> Result<StatusReport, StatusError> {
        // Porcelain paths are relative to the repository top level; the
        // prefix maps them back onto the registered root.
        let prefix = self.run(root, &["rev-parse", "--show-prefix"])?;
        let output = self.run(
            root,
            &[
                "status",
                "--porcelain=v2",
                "--branch",
                "--untracked-files=all",
                "--",
                ".",
            ],
        )?;
        Ok(parse_porcelain_v2(&output, prefix.trim()))
    }
}

// ─── Parsing ──────────────────────────────────────────────────────

/// Parse `git status --porcelain=v2 --branch` output. Paths outside
/// `prefix` are skipped; the rest are made relative to it.
pub fn parse_porcelain_v2(output: &str, prefix: &str) -> StatusReport {
    let mut report = StatusReport::default();
    for line in output.lines() {
        if let Some(head) = line.strip_prefix("# branch.head ") {
            report.branch = (head != "(detached)").then(|| head.to_string());
            continue;
        }
        let (xy, path) = match line.as_bytes().first() {
            Some(b'1') => (field(line, 1), last_field(line, 8)),
            Some(b'2') => (
                field(line, 1),
                last_field(line, 9).map(|p| p.split('\t').next().unwrap_or(p)),
            ),
            Some(b'u') => (field(line, 1), last_field(line, 10)),
            Some(b'?') => (Some("?"), line.get(2..)),
            _ => continue,
        };
        let (Some(xy), Some(path)) = (xy, path) else {
            continue;
        };
        let Some(rel) = path.strip_prefix(prefix) else {
            continue;
        };
        if rel.is_empty() {
            continue;
        }

        let mut code = xy.chars();
        match (code.next(), code.next()) {
            (Some('?'), _) => report.counts.untracked += 1,
            (Some(x), Some(y)) => {
                if x != '.' {
                    report.counts.staged += 1;
                }
                if y != '.' {
                    report.counts.changed += 1;
                }
            }
            _ => continue,
        }
        report.dirty_paths.insert(PathBuf::from(rel.trim_end_matches('/')));
    }
    report
}

fn field(line: &str, index: usize) -> Option<&str> {
    line.split(' ').nth(index)
}

/// Remainder of the line starting at field `index` (0-based), for paths that
/// may contain spaces.
fn last_field(line: &str, index: usize) -> Option<&str> {
    line.splitn(index + 1, ' ').nth(index)
}
