use crate::pw::credential::build_credential;
use crate::pw::daemon::{pw_event, tasks};
use crate::pw::descriptor::Descriptor;
use anyhow::Context as _;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{setsid, Gid, Pid, Uid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt as _;
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::time as tokio_time;

/// Pause between reconcile iterations. Deliberately coarse: the loop favors
/// robustness against filesystem races and signal timing over latency.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// SIGTERM is sent for this many stop iterations before escalating to
/// SIGKILL.
const STOP_GRACE_TICKS: u32 = 10;

/// Snapshot of one supervised child, as reported to the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildInfo {
    pub key: String,
    pub pid: i32,
    pub running: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, serde_json::Value>,
}

/// One record per descriptor file. The owning supervisor task is the sole
/// writer of every field after construction; the manager only takes
/// snapshots.
#[derive(Debug)]
pub struct WatchedChild {
    key: String,
    conf_path: PathBuf,
    pid_path: PathBuf,
    log_path: PathBuf,
    state: Mutex<ChildState>,
}

#[derive(Debug, Default)]
struct ChildState {
    pid: i32,
    done: bool,
    tags: BTreeMap<String, serde_json::Value>,
}

impl WatchedChild {
    pub fn new(key: String, conf_path: PathBuf, pid_path: PathBuf, log_path: PathBuf) -> Self {
        Self {
            key,
            conf_path,
            pid_path,
            log_path,
            state: Mutex::new(ChildState::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pid(&self) -> i32 {
        self.lock_state().pid
    }

    pub fn is_done(&self) -> bool {
        self.lock_state().done
    }

    /// None once the supervisor has exited; the manager drops the record on
    /// its next sweep.
    pub fn info(&self) -> Option<ChildInfo> {
        let st = self.lock_state();
        if st.done {
            return None;
        }
        Some(ChildInfo {
            key: self.key.clone(),
            pid: st.pid,
            running: st.pid > 0,
            tags: st.tags.clone(),
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ChildState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_pid(&self, pid: i32) {
        self.lock_state().pid = pid;
    }

    fn set_done(&self) {
        self.lock_state().done = true;
    }

    fn set_tags(&self, tags: BTreeMap<String, serde_json::Value>) {
        self.lock_state().tags = tags;
    }

    fn clear_tags(&self) {
        self.lock_state().tags = BTreeMap::new();
    }

    /// The per-child reconcile loop. Runs until the descriptor file is gone
    /// and no child is tracked, then flags the record done.
    pub async fn supervise(self: Arc<Self>) {
        let mut conf: Option<Descriptor> = None;
        let mut last_mod: Option<SystemTime> = None;

        // First pass: pick up the descriptor and re-attach to a child that
        // survived a supervisor restart via its pid file.
        match stat_mtime(&self.conf_path) {
            Err(e) => pw_event(
                "supervise",
                Some(&self.key),
                format!("descriptor stat error: {e}"),
            ),
            Ok(None) => {}
            Ok(Some(mtime)) => match Descriptor::load(&self.conf_path) {
                Ok(d) => {
                    conf = Some(d);
                    last_mod = Some(mtime);
                }
                Err(e) => pw_event(
                    "supervise",
                    Some(&self.key),
                    format!("descriptor read error: {e}"),
                ),
            },
        }

        let mut pid = self.pid();
        if pid <= 0 {
            match read_pid_file(&self.pid_path) {
                Ok(p) => {
                    if p > 0 {
                        pw_event("supervise", Some(&self.key), format!("adopting pid {p} from pid file"));
                    }
                    pid = p;
                    self.set_pid(pid);
                }
                Err(e) => pw_event(
                    "supervise",
                    Some(&self.key),
                    format!("pid file read error: {e}"),
                ),
            }
        }

        let mut tagged = false;

        loop {
            // 1. Re-read the descriptor if it changed or vanished. The file's
            // mtime is the version marker; any difference means a new version
            // and the tracked child (if any) belongs to the old one.
            let stat = match stat_mtime(&self.conf_path) {
                Ok(v) => v,
                Err(e) => {
                    pw_event(
                        "supervise",
                        Some(&self.key),
                        format!("descriptor stat error: {e}"),
                    );
                    None
                }
            };

            if stat.is_none() || stat != last_mod {
                if pid > 0 {
                    if conf.as_ref().map(|c| c.defers_restart()).unwrap_or(false) {
                        // The replacement child takes over from the old one;
                        // stop tracking without signaling.
                        pw_event(
                            "supervise",
                            Some(&self.key),
                            format!("deferring to new process, releasing pid {pid}"),
                        );
                        pid = 0;
                        self.set_pid(0);
                    } else {
                        stop(&self.key, pid, STOP_GRACE_TICKS).await;
                        if let Err(e) = remove_pid_file(&self.pid_path) {
                            pw_event(
                                "supervise",
                                Some(&self.key),
                                format!("pid file remove error: {e}"),
                            );
                        }
                        if tagged {
                            self.clear_tags();
                            tagged = false;
                        }
                        pid = 0;
                        self.set_pid(0);
                    }
                }

                match stat {
                    None => conf = None,
                    Some(mtime) => match Descriptor::load(&self.conf_path) {
                        Ok(d) => {
                            conf = Some(d);
                            last_mod = Some(mtime);
                        }
                        Err(e) => {
                            // Corrupt reads as absent; the supervisor winds
                            // down until a good version shows up.
                            pw_event(
                                "supervise",
                                Some(&self.key),
                                format!("descriptor read error: {e}"),
                            );
                            conf = None;
                        }
                    },
                }
            }

            if let Some(c) = conf.as_ref() {
                // 2. Verify the tracked pid still belongs to us. Pids get
                // recycled; only a compatible comm name is trusted.
                if pid > 0 {
                    if pid_matches(&self.key, c, pid) {
                        if !tagged {
                            self.set_tags(c.tags.clone());
                            tagged = true;
                        }
                    } else {
                        pw_event(
                            "supervise",
                            Some(&self.key),
                            format!("process no longer running, releasing pid {pid}"),
                        );
                        pid = 0;
                        self.set_pid(0);
                    }
                }

                // 3. Start a child if none is tracked.
                if pid <= 0 {
                    pw_event("supervise", Some(&self.key), "starting process");
                    let c2 = c.clone();
                    let log_path = self.log_path.clone();
                    let started = tasks()
                        .spawn_blocking(move || start_child(&c2, &log_path))
                        .await
                        .map_err(|e| anyhow::anyhow!("join error: {e}"))
                        .and_then(|r| r);
                    match started {
                        Ok(new_pid) => {
                            pw_event(
                                "supervise",
                                Some(&self.key),
                                format!("started pid {new_pid}"),
                            );
                            pid = new_pid;
                            self.set_pid(pid);
                            if let Err(e) = write_pid_file(&self.pid_path, pid) {
                                pw_event(
                                    "supervise",
                                    Some(&self.key),
                                    format!("pid file write error: {e}"),
                                );
                            }
                        }
                        Err(e) => {
                            // Transient by policy; the next tick retries.
                            pw_event("supervise", Some(&self.key), format!("start error: {e}"));
                        }
                    }
                }
            }

            // 4. Descriptor deleted and the child is gone: wind down.
            if conf.is_none() && pid <= 0 {
                break;
            }

            tokio_time::sleep(TICK_INTERVAL).await;
        }

        pw_event("supervise", Some(&self.key), "done supervising");
        self.set_done();
    }
}

fn stat_mtime(path: &Path) -> io::Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(md) => Ok(Some(md.modified()?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn proc_comm(pid: i32) -> io::Result<String> {
    fs::read_to_string(format!("/proc/{pid}/comm"))
}

/// Liveness probe: does the kernel still know this pid?
pub(crate) fn is_running(pid: i32) -> bool {
    match proc_comm(pid) {
        Ok(s) => !s.trim().is_empty(),
        Err(_) => false,
    }
}

/// Identity check for a candidate pid: present in /proc AND carrying a comm
/// name compatible with the descriptor. A mismatch is logged with both sides
/// but is not an error.
fn pid_matches(key: &str, d: &Descriptor, pid: i32) -> bool {
    let comm = match proc_comm(pid) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                pw_event("supervise", Some(key), format!("comm read failed pid={pid}: {e}"));
            }
            return false;
        }
    };
    let comm = comm.trim();
    if comm.is_empty() {
        return false;
    }
    let ok = d.matches_comm(comm);
    if !ok {
        pw_event(
            "supervise",
            Some(key),
            format!("found pid {pid}, but comm {comm:?} did not match {:?}", d.name),
        );
    }
    ok
}

/// Stop a process and return only once it is observed gone. SIGTERM for the
/// first `grace_ticks` iterations, SIGKILL after that, one probe per second.
/// A failed signal send is logged and the loop keeps probing; the `/proc`
/// entry is the source of truth, not the send result.
pub(crate) async fn stop(key: &str, pid: i32, grace_ticks: u32) {
    let mut count: u32 = 0;
    loop {
        count += 1;

        if !is_running(pid) {
            pw_event("stop", Some(key), format!("pid {pid} no longer running"));
            return;
        }

        let sig = if count > grace_ticks {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        pw_event("stop", Some(key), format!("sending {sig} to pid {pid}"));
        if let Err(e) = kill(Pid::from_raw(pid), sig) {
            pw_event("stop", Some(key), format!("signal send failed pid={pid}: {e}"));
        }

        tokio_time::sleep(TICK_INTERVAL).await;
    }
}

/// Launch the described child. Returns its pid; the exit status is drained on
/// a detached thread so the child never lingers as a zombie and the drain
/// never blocks supervisor shutdown.
pub(crate) fn start_child(d: &Descriptor, log_path: &Path) -> anyhow::Result<i32> {
    anyhow::ensure!(!d.name.is_empty(), "no command specified");

    let mut cmd = Command::new(&d.name);
    cmd.args(&d.args);

    // The child gets exactly the configured environment; nothing is
    // inherited from the supervisor.
    cmd.env_clear();
    for entry in &d.env {
        match entry.split_once('=') {
            Some((k, v)) => {
                cmd.env(k, v);
            }
            None => {
                cmd.env(entry, "");
            }
        }
    }

    if !d.dir.is_empty() {
        cmd.current_dir(&d.dir);
    }

    let cred = if d.user.is_empty() {
        None
    } else {
        build_credential(&d.user).with_context(|| format!("credentials for user {:?}", d.user))?
    };

    let logfile = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(log_path)
        .with_context(|| format!("open log file {}", log_path.display()))?;
    let logfile_err = logfile
        .try_clone()
        .with_context(|| format!("clone log handle {}", log_path.display()))?;
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(logfile));
    cmd.stderr(Stdio::from(logfile_err));

    // Child-side setup order: detach from the supervisor's controlling
    // terminal first, then drop groups/gid/uid.
    unsafe {
        cmd.pre_exec(move || {
            let _ = setsid();
            if let Some(cred) = cred.as_ref() {
                let gids: Vec<Gid> = cred.groups.iter().map(|g| Gid::from_raw(*g)).collect();
                nix::unistd::setgroups(&gids).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("setgroups failed: {e}"),
                    )
                })?;
                nix::unistd::setgid(Gid::from_raw(cred.gid)).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("setgid({}) failed: {e}", cred.gid),
                    )
                })?;
                nix::unistd::setuid(Uid::from_raw(cred.uid)).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("setuid({}) failed: {e}", cred.uid),
                    )
                })?;
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().with_context(|| format!("spawn {:?}", d.name))?;
    let pid = child.id() as i32;

    std::thread::spawn(move || {
        let _ = child.wait();
    });

    Ok(pid)
}

pub(crate) fn read_pid_file(path: &Path) -> anyhow::Result<i32> {
    let contents = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };

    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    match trimmed.parse::<i32>() {
        Ok(pid) => Ok(pid),
        Err(e) => {
            // Unparseable content reads as "no pid"; a fresh child gets
            // started and the file rewritten.
            pw_event(
                "supervise",
                None,
                format!("pid file {} did not contain a valid pid: {e}", path.display()),
            );
            Ok(0)
        }
    }
}

pub(crate) fn write_pid_file(path: &Path, pid: i32) -> anyhow::Result<()> {
    let contents = if pid > 0 { pid.to_string() } else { String::new() };
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    f.write_all(contents.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn remove_pid_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        r => r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pid");

        // Missing file reads as "no pid".
        assert_eq!(read_pid_file(&path).unwrap(), 0);

        write_pid_file(&path, 4321).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "4321");
        assert_eq!(read_pid_file(&path).unwrap(), 4321);

        // Zero writes an empty file, which reads back as "no pid".
        write_pid_file(&path, 0).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
        assert_eq!(read_pid_file(&path).unwrap(), 0);
    }

    #[test]
    fn garbage_pid_file_reads_as_no_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pid");
        fs::write(&path, "not-a-pid\n").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), 0);

        fs::write(&path, "  987  \n").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), 987);
    }

    #[test]
    fn liveness_probe() {
        assert!(is_running(std::process::id() as i32));
        // Way above any realistic pid_max.
        assert!(!is_running(i32::MAX));
    }

    fn sh_descriptor(script: &str) -> Descriptor {
        Descriptor {
            name: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Descriptor::default()
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        cond()
    }

    #[test]
    fn start_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let err = start_child(&Descriptor::default(), &dir.path().join("x.log")).unwrap_err();
        assert!(err.to_string().contains("no command"), "{err}");
    }

    #[test]
    fn start_redirects_output_and_sets_exact_env() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("c.log");

        let mut d = Descriptor {
            name: "/usr/bin/env".to_string(),
            ..Descriptor::default()
        };
        d.env = vec!["MARKER=hello".to_string()];

        let pid = start_child(&d, &log).unwrap();
        assert!(pid > 0);

        assert!(wait_for(
            || fs::read_to_string(&log).map(|s| s.contains("MARKER=hello")).unwrap_or(false),
            Duration::from_secs(5),
        ));
        // env_clear means the supervisor's own environment never leaks in.
        let out = fs::read_to_string(&log).unwrap();
        assert!(!out.contains("PATH="), "environment leaked: {out}");
    }

    #[test]
    fn start_honors_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("pwd.log");

        let mut d = sh_descriptor("pwd");
        d.dir = dir.path().display().to_string();

        start_child(&d, &log).unwrap();
        let want = fs::canonicalize(dir.path()).unwrap().display().to_string();
        assert!(wait_for(
            || fs::read_to_string(&log).map(|s| s.contains(&want)).unwrap_or(false),
            Duration::from_secs(5),
        ));
    }

    #[tokio::test]
    async fn stop_terminates_a_child() {
        let dir = tempfile::tempdir().unwrap();
        let d = Descriptor {
            name: "/bin/sleep".to_string(),
            args: vec!["30".to_string()],
            ..Descriptor::default()
        };
        let pid = start_child(&d, &dir.path().join("s.log")).unwrap();
        assert!(wait_for(|| is_running(pid), Duration::from_secs(5)));

        stop("t", pid, 3).await;
        assert!(!is_running(pid));
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        // Ignore SIGTERM so only the escalation can end the child.
        let d = sh_descriptor("trap '' TERM; sleep 30");
        let pid = start_child(&d, &dir.path().join("k.log")).unwrap();
        assert!(wait_for(|| is_running(pid), Duration::from_secs(5)));
        // Give the shell a moment to install the trap.
        tokio_time::sleep(Duration::from_millis(300)).await;

        stop("t", pid, 1).await;
        assert!(!is_running(pid));
    }
}
