//! Pruning of rotated target files
//!
//! Runs after each rotation, once the retired writer has closed. Files
//! belonging to the logical target are those whose name starts with the
//! base stem; they are ordered by modification time ascending with name
//! as tie-break, and deleted oldest-first until every configured budget
//! holds.
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::time::Duration;
use tracing::{debug, trace};

use crate::Error;

/// Retention budgets for one logical target.
#[derive(Clone, Debug, Default)]
pub struct Pruner {
    /// delete files whose modification time is older than this
    pub max_age: Option<Duration>,
    /// keep only this many newest files
    pub keep_count: Option<usize>,
    /// delete oldest files until the total size fits this budget
    pub total_size: Option<u64>,
}

struct Candidate {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

impl Pruner {
    /// True when at least one budget is configured.
    pub fn is_configured(&self) -> bool {
        self.max_age.is_some() || self.keep_count.is_some() || self.total_size.is_some()
    }

    /// Applies every configured budget against `base.*` files in `dir`.
    /// Returns the deleted paths.
    pub fn prune(&self, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, Error> {
        let mut candidates = collect(dir, prefix)?;
        // oldest first; name breaks modification-time ties
        candidates.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut remove = vec![false; candidates.len()];

        if let Some(age) = self.max_age {
            let cutoff = SystemTime::now()
                .checked_sub(age)
                .unwrap_or(SystemTime::UNIX_EPOCH);
            for (i, c) in candidates.iter().enumerate() {
                if c.modified < cutoff {
                    remove[i] = true;
                }
            }
        }

        if let Some(keep) = self.keep_count {
            let surviving = remove.iter().filter(|r| !**r).count();
            let mut excess = surviving.saturating_sub(keep);
            for (i, _) in candidates.iter().enumerate() {
                if excess == 0 {
                    break;
                }
                if !remove[i] {
                    remove[i] = true;
                    excess -= 1;
                }
            }
        }

        if let Some(budget) = self.total_size {
            let mut total: u64 = candidates
                .iter()
                .enumerate()
                .filter(|(i, _)| !remove[*i])
                .map(|(_, c)| c.size)
                .sum();
            for (i, c) in candidates.iter().enumerate() {
                if total <= budget {
                    break;
                }
                if !remove[i] {
                    remove[i] = true;
                    total -= c.size;
                }
            }
        }

        let mut removed = Vec::new();
        for (i, c) in candidates.iter().enumerate() {
            if !remove[i] {
                continue;
            }
            match std::fs::remove_file(&c.path) {
                Ok(()) => {
                    debug!(path = format!("{}", c.path.display()), "pruned");
                    removed.push(c.path.clone());
                }
                Err(e) => {
                    // the file may have been rotated away concurrently
                    trace!(
                        path = format!("{}", c.path.display()),
                        error = format!("{e}"),
                        "prune skipped"
                    );
                }
            }
        }
        Ok(removed)
    }
}

fn collect(dir: &Path, prefix: &str) -> Result<Vec<Candidate>, Error> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| Error::OutputError(format!("{}: {e}", dir.display())))?;
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(prefix) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        out.push(Candidate {
            path: entry.path(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: meta.len(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str, size: usize, age: Duration) {
        let path = dir.join(name);
        fs::write(&path, vec![b'x'; size]).unwrap();
        let mtime = SystemTime::now().checked_sub(age).unwrap();
        let times = std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap();
        times.set_modified(mtime).unwrap();
    }

    #[test]
    fn keep_count_removes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "app_1.log", 10, Duration::from_secs(300));
        touch(dir.path(), "app_2.log", 10, Duration::from_secs(200));
        touch(dir.path(), "app_3.log", 10, Duration::from_secs(100));
        touch(dir.path(), "other.log", 10, Duration::from_secs(400));

        let pruner = Pruner {
            keep_count: Some(2),
            ..Default::default()
        };
        let removed = pruner.prune(dir.path(), "app").unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].ends_with("app_1.log"));
        // unrelated files are never touched
        assert!(dir.path().join("other.log").exists());
    }

    #[test]
    fn age_budget_removes_old_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "app_old.log", 10, Duration::from_secs(7200));
        touch(dir.path(), "app_new.log", 10, Duration::from_secs(10));

        let pruner = Pruner {
            max_age: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let removed = pruner.prune(dir.path(), "app").unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].ends_with("app_old.log"));
    }

    #[test]
    fn size_budget_removes_oldest_until_under() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "app_1.log", 100, Duration::from_secs(300));
        touch(dir.path(), "app_2.log", 100, Duration::from_secs(200));
        touch(dir.path(), "app_3.log", 100, Duration::from_secs(100));

        let pruner = Pruner {
            total_size: Some(220),
            ..Default::default()
        };
        let removed = pruner.prune(dir.path(), "app").unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].ends_with("app_1.log"));
    }

    #[test]
    fn name_breaks_modification_ties() {
        let dir = tempfile::tempdir().unwrap();
        let age = Duration::from_secs(500);
        touch(dir.path(), "app_b.log", 10, age);
        touch(dir.path(), "app_a.log", 10, age);

        let pruner = Pruner {
            keep_count: Some(1),
            ..Default::default()
        };
        let removed = pruner.prune(dir.path(), "app").unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].ends_with("app_a.log"));
    }

    #[test]
    fn unconfigured_pruner_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "app_1.log", 10, Duration::from_secs(9999));
        let pruner = Pruner::default();
        assert!(!pruner.is_configured());
        let removed = pruner.prune(dir.path(), "app").unwrap();
        assert!(removed.is_empty());
        assert!(dir.path().join("app_1.log").exists());
    }
}
