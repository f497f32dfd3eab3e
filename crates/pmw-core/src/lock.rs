use crate::error::{PmwError, Result};
use crate::paths;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant, SystemTime};

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// How long to wait for a held lock, and when a held lock counts as
/// abandoned regardless of its holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    pub timeout: Duration,
    pub stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(900),
        }
    }
}

/// Exclusive writer lock on one plan directory, held for the lifetime of the
/// value. Read-modify-write of shared plan artifacts happens under it.
///
/// The file holds the writer's pid. A lock whose pid is no longer running,
/// or that is older than `stale_after`, is reclaimed.
#[derive(Debug)]
pub struct PlanLock {
    path: PathBuf,
}

impl PlanLock {
    pub fn acquire(root: &Path, plan_id: &str, timeout: Duration) -> Result<Self> {
        Self::acquire_with(
            root,
            plan_id,
            LockSettings {
                timeout,
                ..LockSettings::default()
            },
        )
    }

    pub fn acquire_with(root: &Path, plan_id: &str, settings: LockSettings) -> Result<Self> {
        Self::acquire_at(paths::lock_path(root, plan_id), plan_id, settings)
    }

    /// Guard held while a phase handler runs. Fails at once when another
    /// handler of the plan is running; only a dead holder is reclaimed.
    pub fn acquire_phase(root: &Path, plan_id: &str) -> Result<Self> {
        let settings = LockSettings {
            timeout: Duration::ZERO,
            stale_after: Duration::MAX,
        };
        Self::acquire_at(paths::phase_lock_path(root, plan_id), plan_id, settings).map_err(|e| match e {
            PmwError::Locked(id) => PmwError::PhaseRunning(id),
            other => other,
        })
    }

    fn acquire_at(path: PathBuf, plan_id: &str, settings: LockSettings) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                return Err(PmwError::PlanNotFound(plan_id.to_string()));
            }
        }

        let deadline = Instant::now() + settings.timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if reclaim_stale(&path, settings.stale_after) {
                        tracing::warn!(plan = plan_id, lock = %path.display(), "reclaimed abandoned plan lock");
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(PmwError::Locked(plan_id.to_string()));
                    }
                    tracing::debug!(plan = plan_id, "waiting for plan lock");
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for PlanLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Removes the lock at `path` when its holder is gone. The file is renamed
/// aside first and compared, so a lock re-created by another waiter in the
/// meantime is put back instead of deleted.
fn reclaim_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    let holder = content.trim().parse::<u32>().ok();
    let aged = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .is_some_and(|age| age >= stale_after);
    let dead = holder.is_some_and(|pid| !process_alive(pid));
    if !aged && !dead {
        return false;
    }

    let aside = path.with_extension(format!("stale-{}", std::process::id()));
    if std::fs::rename(path, &aside).is_err() {
        return false;
    }
    let moved = std::fs::read_to_string(&aside).unwrap_or_default();
    if moved != content {
        // Someone else's fresh lock; restore it unless a newer one exists.
        let _ = std::fs::hard_link(&aside, path);
    }
    let _ = std::fs::remove_file(&aside);
    moved == content
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(true)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn plan_dir(dir: &TempDir) -> &Path {
        std::fs::create_dir_all(paths::plan_dir(dir.path(), "demo")).unwrap();
        dir.path()
    }

    #[test]
    fn second_acquire_times_out() {
        let dir = TempDir::new().unwrap();
        let root = plan_dir(&dir);
        let _held = PlanLock::acquire(root, "demo", Duration::from_millis(50)).unwrap();
        let err = PlanLock::acquire(root, "demo", Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, PmwError::Locked(_)));
    }

    #[test]
    fn drop_releases() {
        let dir = TempDir::new().unwrap();
        let root = plan_dir(&dir);
        {
            let _held = PlanLock::acquire(root, "demo", Duration::from_millis(50)).unwrap();
            assert!(paths::lock_path(root, "demo").exists());
        }
        assert!(!paths::lock_path(root, "demo").exists());
        PlanLock::acquire(root, "demo", Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn missing_plan_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            PlanLock::acquire(dir.path(), "ghost", Duration::from_millis(10)),
            Err(PmwError::PlanNotFound(_))
        ));
    }

    #[test]
    fn concurrent_writers_are_serialized() {
        let dir = TempDir::new().unwrap();
        let root = plan_dir(&dir).to_path_buf();
        let inside = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let root = root.clone();
                let inside = Arc::clone(&inside);
                s.spawn(move || {
                    let _lock = PlanLock::acquire(&root, "demo", Duration::from_secs(5)).unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    std::thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
    }

    #[cfg(unix)]
    #[test]
    fn lock_of_dead_writer_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let root = plan_dir(&dir);
        std::fs::write(paths::lock_path(root, "demo"), "2147483646\n").unwrap();

        let lock = PlanLock::acquire(root, "demo", Duration::from_millis(50)).unwrap();
        let holder = std::fs::read_to_string(paths::lock_path(root, "demo")).unwrap();
        assert_eq!(holder.trim(), std::process::id().to_string());
        drop(lock);
    }

    #[test]
    fn old_lock_is_reclaimed_even_if_holder_lives() {
        let dir = TempDir::new().unwrap();
        let root = plan_dir(&dir);
        std::fs::write(paths::lock_path(root, "demo"), format!("{}\n", std::process::id())).unwrap();
        let settings = LockSettings {
            timeout: Duration::from_millis(50),
            stale_after: Duration::from_millis(400),
        };

        assert!(matches!(
            PlanLock::acquire_with(root, "demo", settings),
            Err(PmwError::Locked(_))
        ));
        std::thread::sleep(Duration::from_millis(500));
        PlanLock::acquire_with(root, "demo", settings).unwrap();
    }

    #[test]
    fn live_lock_is_not_reclaimed() {
        let dir = TempDir::new().unwrap();
        let root = plan_dir(&dir);
        let _held = PlanLock::acquire(root, "demo", Duration::from_millis(50)).unwrap();
        assert!(!reclaim_stale(&paths::lock_path(root, "demo"), Duration::from_secs(60)));
        assert!(paths::lock_path(root, "demo").exists());
    }

    #[test]
    fn phase_guard_fails_fast_and_is_independent_of_writer_lock() {
        let dir = TempDir::new().unwrap();
        let root = plan_dir(&dir);
        let guard = PlanLock::acquire_phase(root, "demo").unwrap();
        assert!(matches!(
            PlanLock::acquire_phase(root, "demo"),
            Err(PmwError::PhaseRunning(_))
        ));
        PlanLock::acquire(root, "demo", Duration::from_millis(50)).unwrap();
        drop(guard);
        PlanLock::acquire_phase(root, "demo").unwrap();
    }
}
