use crate::pw::daemon::{pw_event, tasks};
use crate::pw::descriptor::{check_safe_name, Descriptor};
use crate::pw::supervisor::{ChildInfo, WatchedChild};
use anyhow::Context as _;
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::os::unix::fs::{DirBuilderExt as _, OpenOptionsExt as _};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Pause between descriptor-directory scans.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Owns the set of per-child supervisors and the two on-disk trees: runtime
/// state under `work_dir` (pids/, logs/) and descriptors under
/// `conf_dir/processes`.
///
/// The manager is deliberately thin. Every lifecycle decision lives in the
/// per-child supervisor; all the manager holds is the map and the
/// directories, so the external operations stay trivially correct under
/// concurrency. The map lock is never held across I/O.
pub struct ProcessManager {
    work_dir: PathBuf,
    conf_dir: PathBuf,
    children: Mutex<HashMap<String, Arc<WatchedChild>>>,
}

impl ProcessManager {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        conf_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Arc<Self>> {
        let s = Arc::new(Self {
            work_dir: work_dir.into(),
            conf_dir: conf_dir.into(),
            children: Mutex::new(HashMap::new()),
        });
        make_private_dir(&s.pids_dir())?;
        make_private_dir(&s.logs_dir())?;
        make_private_dir(&s.processes_dir())?;
        Ok(s)
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.work_dir.join("pids")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.work_dir.join("logs")
    }

    pub fn processes_dir(&self) -> PathBuf {
        self.conf_dir.join("processes")
    }

    fn conf_path(&self, key: &str) -> PathBuf {
        self.processes_dir().join(format!("{key}.conf"))
    }

    fn pid_file_path(&self, key: &str) -> PathBuf {
        self.pids_dir().join(format!("{key}.pid"))
    }

    fn log_file_path(&self, key: &str) -> PathBuf {
        self.logs_dir().join(format!("{key}.log"))
    }

    /// One pass over the descriptor directory: reap supervisors that have
    /// wound down, then spawn a supervisor for every descriptor file that
    /// does not have one yet. Parse errors are not handled here; the
    /// supervisor owns those.
    pub fn scan_directory(self: &Arc<Self>) -> anyhow::Result<()> {
        let dir = self.processes_dir();
        let rd = fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))?;

        let mut keys: Vec<String> = Vec::new();
        for ent in rd {
            let ent = ent.with_context(|| format!("list {}", dir.display()))?;
            let ft = ent
                .file_type()
                .with_context(|| format!("file_type {}", ent.path().display()))?;
            if !ft.is_file() {
                continue;
            }
            let name = ent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(key) = name.strip_suffix(".conf") else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            keys.push(key.to_string());
        }

        let mut children = self.lock_children();

        children.retain(|_, c| !c.is_done());

        for key in keys {
            if children.contains_key(&key) {
                continue;
            }
            let child = Arc::new(WatchedChild::new(
                key.clone(),
                self.conf_path(&key),
                self.pid_file_path(&key),
                self.log_file_path(&key),
            ));
            children.insert(key.clone(), Arc::clone(&child));
            pw_event("manager", Some(&key), "supervising new descriptor");
            tasks().spawn(child.supervise());
        }

        Ok(())
    }

    /// Scan forever. Listing errors are logged and retried on the next pass.
    pub async fn run_scan_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.scan_directory() {
                pw_event("manager", None, format!("descriptor scan error: {e}"));
            }
            tokio::time::sleep(SCAN_INTERVAL).await;
        }
    }

    pub fn list(&self) -> Vec<ChildInfo> {
        let children = self.lock_children();
        let mut out: Vec<ChildInfo> = children.values().filter_map(|c| c.info()).collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn get(&self, key: &str) -> Option<ChildInfo> {
        let children = self.lock_children();
        children.get(key).and_then(|c| c.info())
    }

    /// Serialize a descriptor into the processes directory. The write is
    /// atomic (tmp + rename) so a supervisor mid-scan never sees a torn file;
    /// the rename also refreshes the mtime, which is what triggers the
    /// restart.
    pub fn write_process(&self, name: &str, descriptor: &Descriptor) -> anyhow::Result<()> {
        check_safe_name(name)?;
        let json = serde_json::to_vec(descriptor)?;

        let dir = self.processes_dir();
        let tmp = dir.join(format!(".{name}.conf.tmp.{}", std::process::id()));
        {
            let mut f = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)
                .with_context(|| format!("open {}", tmp.display()))?;
            f.write_all(&json)
                .with_context(|| format!("write {}", tmp.display()))?;
        }
        let dest = self.conf_path(name);
        fs::rename(&tmp, &dest)
            .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;
        Ok(())
    }

    /// Remove a descriptor file. The supervisor notices the absence on its
    /// next tick, stops the child, and winds down.
    pub fn delete_process(&self, name: &str) -> anyhow::Result<()> {
        check_safe_name(name)?;
        let path = self.conf_path(name);
        fs::remove_file(&path).with_context(|| format!("delete {}", path.display()))?;
        Ok(())
    }

    fn lock_children(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<WatchedChild>>> {
        self.children.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn make_private_dir(path: &PathBuf) -> anyhow::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o600)
        .create(path)
        .with_context(|| format!("create {}", path.display()))?;
    Ok(())
}
