//! Filesystem reconciler for the workspace folder.
//!
//! Project folders that the workspace manifest no longer lists are deleted
//! together with their project records. A watcher thread polls the manifest
//! and runs a pass every time it changes.

use std::collections::HashSet;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crate::error::SandboxError;
use crate::lock::FileLock;
use crate::workspace::{Workspace, WorkspaceManifest};

/// Longest the watcher sleeps before looking at the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub directories_scanned: usize,
    pub directories_removed: usize,
    pub records_removed: usize,
    pub failures: usize,
}

/// Non-hidden directories directly under `root`.
fn project_directories(root: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Top-level workspace directory a manifest folder path lives in.
///
/// `group/app` and `./group` both keep `group` alive.
fn top_level(path: &str) -> Option<&str> {
    Path::new(path)
        .components()
        .find(|c| !matches!(c, Component::CurDir))
        .and_then(|c| match c {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
}

fn listed_directories(manifest: &WorkspaceManifest) -> HashSet<String> {
    manifest
        .folders
        .iter()
        .filter_map(|folder| top_level(&folder.path))
        .map(str::to_string)
        .collect()
}

/// Delete one stale folder and its records. `None` if it was listed meanwhile.
fn remove_stale(
    workspace: &Workspace,
    name: &str,
    lock_timeout: Duration,
) -> Result<Option<usize>, SandboxError> {
    let paths = workspace.paths();
    let _guard = FileLock::acquire(&paths.folder_lock(name), lock_timeout)?;

    // A load may have listed the folder while we waited for its lock.
    if listed_directories(&workspace.read_existing_manifest()?).contains(name) {
        return Ok(None);
    }

    match std::fs::remove_dir_all(paths.project_dir(name)) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(Some(workspace.remove_projects_by_slug(name)?))
}

/// Run one reconciliation pass.
///
/// An absent or unreadable manifest skips the pass. Each stale folder is
/// handled on its own; a failure is logged and the pass moves on.
pub fn reconcile(workspace: &Workspace, lock_timeout: Duration) -> ReconcileStats {
    let mut stats = ReconcileStats::default();

    let manifest = match workspace.read_existing_manifest() {
        Ok(manifest) => manifest,
        Err(e) => {
            log::warn!("reconcile: skipping pass: {}", e);
            return stats;
        }
    };
    let listed = listed_directories(&manifest);

    let root = workspace.paths().workspace_dir();
    let directories = match project_directories(&root) {
        Ok(directories) => directories,
        Err(e) => {
            log::warn!("reconcile: failed to list {}: {}", root.display(), e);
            return stats;
        }
    };
    stats.directories_scanned = directories.len();

    for name in directories.iter().filter(|name| !listed.contains(*name)) {
        match remove_stale(workspace, name, lock_timeout) {
            Ok(Some(records)) => {
                stats.directories_removed += 1;
                stats.records_removed += records;
                log::info!("Removed project folder {} ({} records)", name, records);
            }
            Ok(None) => log::debug!("reconcile: {} was added back, keeping it", name),
            Err(e) => {
                stats.failures += 1;
                log::warn!("reconcile: failed to remove {}: {}", name, e);
            }
        }
    }

    stats
}

/// Identity of one version of the manifest file.
type Fingerprint = (u64, SystemTime, u64);

fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.ino(), meta.modified().ok()?, meta.len()))
}

/// Watches the manifest and reconciles on every change.
pub struct Reconciler {
    workspace: Workspace,
    lock_timeout: Duration,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn new(
        workspace: Workspace,
        lock_timeout: Duration,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            workspace,
            lock_timeout,
            interval,
            shutdown,
        }
    }

    /// Sleep one interval. Returns false once shutdown is requested.
    fn wait(&self) -> bool {
        let deadline = Instant::now() + self.interval;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SHUTDOWN_POLL));
        }
    }

    /// Run the watch loop until shutdown.
    pub fn run(self) {
        log::info!("Reconciler thread started");
        let manifest = self.workspace.paths().workspace_file();
        let mut last = fingerprint(&manifest);

        while self.wait() {
            let current = fingerprint(&manifest);
            if current == last {
                continue;
            }
            last = current;
            if current.is_some() {
                log::debug!("Workspace manifest changed, reconciling");
                reconcile(&self.workspace, self.lock_timeout);
            }
        }

        log::info!("Reconciler shutting down");
    }
}

/// Handle for managing the reconciler thread.
pub struct ReconcilerHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl ReconcilerHandle {
    /// Spawn the watcher thread.
    pub fn spawn(
        workspace: Workspace,
        lock_timeout: Duration,
        interval: Duration,
    ) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let reconciler = Reconciler::new(workspace, lock_timeout, interval, Arc::clone(&shutdown));

        let thread = thread::Builder::new()
            .name("sandbox-reconciler".to_string())
            .spawn(move || reconciler.run())?;

        Ok(Self {
            thread: Some(thread),
            shutdown,
        })
    }

    /// Signal shutdown and wait for thread to exit.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::DEFAULT_LOCK_TIMEOUT;
    use crate::paths::SandboxPaths;
    use crate::workspace::{ProjectRecord, WorkspaceManifest};
    use filetime::FileTime;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn setup(on_disk: &[&str], listed: &[&str]) -> (TempDir, Workspace) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(SandboxPaths::new(dir.path()), DEFAULT_LOCK_TIMEOUT);
        for name in on_disk {
            let folder = ws.paths().project_dir(name);
            std::fs::create_dir_all(folder.join("src")).unwrap();
            std::fs::write(folder.join("src").join("main.rs"), "fn main() {}").unwrap();
        }
        let mut manifest = WorkspaceManifest::default();
        for name in listed {
            manifest.add_folder(name);
        }
        ws.write_manifest(&manifest).unwrap();

        let records: Vec<ProjectRecord> = on_disk
            .iter()
            .map(|slug| serde_json::from_value(json!({"_id": format!("id-{}", slug), "slug": slug})).unwrap())
            .collect();
        ws.write_projects(&records).unwrap();
        (dir, ws)
    }

    fn slugs(ws: &Workspace) -> Vec<String> {
        ws.load_projects()
            .unwrap()
            .iter()
            .filter_map(|p| p.slug().map(str::to_string))
            .collect()
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn removes_only_unlisted_folders_and_their_records() {
        let (_dir, ws) = setup(&["A", "B", "C"], &["A", "C"]);

        let stats = reconcile(&ws, DEFAULT_LOCK_TIMEOUT);

        assert_eq!(stats.directories_scanned, 3);
        assert_eq!(stats.directories_removed, 1);
        assert_eq!(stats.records_removed, 1);
        assert!(!ws.paths().project_dir("B").exists());
        assert!(ws.paths().project_dir("A").join("src/main.rs").exists());
        assert!(ws.paths().project_dir("C").exists());
        assert_eq!(slugs(&ws), vec!["A", "C"]);
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let (_dir, ws) = setup(&["A", "B"], &["A"]);
        reconcile(&ws, DEFAULT_LOCK_TIMEOUT);
        let stats = reconcile(&ws, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(stats.directories_removed, 0);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn missing_manifest_deletes_nothing() {
        let (_dir, ws) = setup(&["A"], &[]);
        std::fs::remove_file(ws.paths().workspace_file()).unwrap();

        let stats = reconcile(&ws, DEFAULT_LOCK_TIMEOUT);

        assert_eq!(stats, ReconcileStats::default());
        assert!(ws.paths().project_dir("A").exists());
    }

    #[test]
    fn hidden_directories_and_files_are_left_alone() {
        let (_dir, ws) = setup(&[".vscode", "A"], &[]);
        std::fs::write(ws.paths().workspace_dir().join("notes.txt"), "x").unwrap();

        let stats = reconcile(&ws, DEFAULT_LOCK_TIMEOUT);

        assert_eq!(stats.directories_removed, 1);
        assert!(ws.paths().project_dir(".vscode").exists());
        assert!(ws.paths().workspace_dir().join("notes.txt").exists());
        assert!(ws.paths().workspace_file().exists());
    }

    #[test]
    fn nested_folder_keeps_its_top_level_directory() {
        let (_dir, ws) = setup(&["group", "stale"], &["group/app", "./other"]);
        let nested = ws.paths().workspace_dir().join("group").join("app");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("work.txt"), "unsaved").unwrap();

        let stats = reconcile(&ws, DEFAULT_LOCK_TIMEOUT);

        assert_eq!(stats.directories_scanned, 2);
        assert_eq!(stats.directories_removed, 1);
        assert!(nested.join("work.txt").exists());
        assert!(!ws.paths().project_dir("stale").exists());
    }

    #[test]
    fn top_level_ignores_leading_dot_segments() {
        assert_eq!(top_level("demo"), Some("demo"));
        assert_eq!(top_level("group/app"), Some("group"));
        assert_eq!(top_level("./demo"), Some("demo"));
        assert_eq!(top_level("/abs/path"), None);
        assert_eq!(top_level(""), None);
    }

    #[test]
    fn folder_listed_while_waiting_for_its_lock_survives() {
        let (_dir, ws) = setup(&["A", "B"], &["A"]);
        let held = FileLock::acquire(&ws.paths().folder_lock("B"), DEFAULT_LOCK_TIMEOUT).unwrap();

        let pass = {
            let ws = ws.clone();
            thread::spawn(move || reconcile(&ws, DEFAULT_LOCK_TIMEOUT))
        };
        // Let the pass read the manifest and block on B's lock.
        thread::sleep(Duration::from_millis(200));
        assert!(ws.add_folder("B").unwrap());
        drop(held);

        let stats = pass.join().unwrap();
        assert_eq!(stats.directories_removed, 0);
        assert_eq!(stats.failures, 0);
        assert!(ws.paths().project_dir("B").join("src/main.rs").exists());
        assert_eq!(slugs(&ws), vec!["A", "B"]);
    }

    #[test]
    fn manifest_removed_mid_pass_keeps_the_folder() {
        let (_dir, ws) = setup(&["A", "B"], &["A"]);
        let held = FileLock::acquire(&ws.paths().folder_lock("B"), DEFAULT_LOCK_TIMEOUT).unwrap();

        let pass = {
            let ws = ws.clone();
            thread::spawn(move || reconcile(&ws, DEFAULT_LOCK_TIMEOUT))
        };
        thread::sleep(Duration::from_millis(200));
        std::fs::remove_file(ws.paths().workspace_file()).unwrap();
        drop(held);

        let stats = pass.join().unwrap();
        assert_eq!(stats.directories_removed, 0);
        assert_eq!(stats.failures, 1);
        assert!(ws.paths().project_dir("B").exists());
    }

    #[test]
    fn busy_folder_is_skipped_and_counted() {
        let (_dir, ws) = setup(&["A", "B"], &["A"]);
        let _held = FileLock::acquire(&ws.paths().folder_lock("B"), DEFAULT_LOCK_TIMEOUT).unwrap();

        let stats = reconcile(&ws, Duration::from_millis(50));

        assert_eq!(stats.failures, 1);
        assert!(ws.paths().project_dir("B").exists());
    }

    #[test]
    fn watcher_reconciles_after_manifest_rewrite() {
        let (_dir, ws) = setup(&["A", "B"], &["A", "B"]);
        let mut handle =
            ReconcilerHandle::spawn(ws.clone(), DEFAULT_LOCK_TIMEOUT, Duration::from_millis(20))
                .unwrap();

        let mut manifest = ws.load_manifest().unwrap();
        manifest.folders.retain(|f| f.path != "B");
        ws.write_manifest(&manifest).unwrap();

        let b = ws.paths().project_dir("B");
        assert!(wait_until(Duration::from_secs(5), || !b.exists()));
        assert!(ws.paths().project_dir("A").exists());
        handle.shutdown();
    }

    #[test]
    fn watcher_waits_for_a_change_before_the_first_pass() {
        let (_dir, ws) = setup(&["A", "B"], &["A"]);
        let _handle =
            ReconcilerHandle::spawn(ws.clone(), DEFAULT_LOCK_TIMEOUT, Duration::from_millis(20))
                .unwrap();

        thread::sleep(Duration::from_millis(150));
        let b = ws.paths().project_dir("B");
        assert!(b.exists());

        let later = SystemTime::now() + Duration::from_secs(60);
        filetime::set_file_mtime(ws.paths().workspace_file(), FileTime::from_system_time(later))
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || !b.exists()));
    }

    #[test]
    fn handle_shutdown_stops_thread() {
        let (_dir, ws) = setup(&[], &[]);
        let mut handle =
            ReconcilerHandle::spawn(ws, DEFAULT_LOCK_TIMEOUT, Duration::from_secs(3600)).unwrap();
        let started = Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
