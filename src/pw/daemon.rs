use crate::pw::asyncutil::TaskTracker;
use crate::pw::build_info;
use crate::pw::config::MasterConfig;
use crate::pw::manager::ProcessManager;
use crate::pw::rpc::{Request, Response, WireRequest};
use anyhow::Context as _;
use chrono::Local;
use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
use tokio::net::{UnixListener as TokioUnixListener, UnixStream as TokioUnixStream};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::time as tokio_time;

static TASKS: OnceLock<TaskTracker> = OnceLock::new();

pub(crate) fn tasks() -> &'static TaskTracker {
    TASKS.get_or_init(TaskTracker::new)
}

const TASK_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Structured stderr event line: timestamp, component, optional app key,
/// key=value message body.
pub(crate) fn pw_event(component: &str, key: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    match key {
        Some(k) => eprintln!("{ts} [{component}] key={k} {}", msg.as_ref()),
        None => eprintln!("{ts} [{component}] {}", msg.as_ref()),
    }
}

pub fn run_daemon(cfg: &MasterConfig) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(run_daemon_async(cfg.clone()))
}

pub async fn run_daemon_async(cfg: MasterConfig) -> anyhow::Result<()> {
    pw_event(
        "boot",
        None,
        format!(
            "starting work_dir={} conf_dir={} sock={}",
            cfg.work_directory.display(),
            cfg.conf_directory.display(),
            cfg.sock.display()
        ),
    );

    let manager = ProcessManager::new(&cfg.work_directory, &cfg.conf_directory)?;

    prepare_socket(&cfg.sock)?;
    let listener = TokioUnixListener::bind(&cfg.sock)
        .map_err(|e| anyhow::anyhow!("failed to bind socket {}: {e}", cfg.sock.display()))?;
    fs::set_permissions(&cfg.sock, fs::Permissions::from_mode(cfg.sock_mode))
        .with_context(|| format!("chmod socket {}", cfg.sock.display()))?;

    let mut shutting_down = false;

    tasks().spawn(Arc::clone(&manager).run_scan_loop());
    start_task_stats_reporter();

    let mut sigterm = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = unix_signal(SignalKind::interrupt()).context("install SIGINT handler")?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let m = Arc::clone(&manager);
                        tasks().spawn(async move {
                            if let Err(e) = handle_connection_async(m, stream).await {
                                pw_event("rpc", None, format!("connection error: {e}"));
                            }
                        });
                    }
                    Err(e) => {
                        pw_event("rpc", None, format!("accept error: {e}"));
                    }
                }
            }
            _ = sigterm.recv() => {
                pw_event("shutdown", None, "received SIGTERM");
                shutting_down = true;
            }
            _ = sigint.recv() => {
                pw_event("shutdown", None, "received SIGINT");
                shutting_down = true;
            }
        }

        if shutting_down {
            break;
        }
    }

    // Children are intentionally left running: they live in their own
    // sessions, and the next daemon generation re-attaches through the pid
    // files.
    let _ = fs::remove_file(&cfg.sock);
    pw_event("shutdown", None, "daemon exiting, children stay supervisable");
    Ok(())
}

/// Refuse to start while another daemon owns the socket; clean up a stale
/// socket file left behind by a crash.
fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if let Some(parent) = sock.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create socket dir {}", parent.display()))?;
        }
    }

    if sock.exists() {
        match std::os::unix::net::UnixStream::connect(sock) {
            Ok(_) => anyhow::bail!(
                "socket {} is in use; is another procwatchd running?",
                sock.display()
            ),
            Err(_) => {
                pw_event(
                    "boot",
                    None,
                    format!("removing stale socket {}", sock.display()),
                );
                fs::remove_file(sock)
                    .with_context(|| format!("remove stale socket {}", sock.display()))?;
            }
        }
    }
    Ok(())
}

fn start_task_stats_reporter() {
    tasks().spawn(async {
        loop {
            tokio_time::sleep(TASK_STATS_INTERVAL).await;
            let t = tasks();
            pw_event(
                "tasks",
                None,
                format!("active={} spawned_total={}", t.active_count(), t.total_spawned()),
            );
        }
    });
}

async fn handle_connection_async(
    manager: Arc<ProcessManager>,
    stream: TokioUnixStream,
) -> anyhow::Result<()> {
    let mut reader = TokioBufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await.context("read request")?;
    if line.trim().is_empty() {
        anyhow::bail!("empty request");
    }

    let wire: WireRequest = serde_json::from_str(line.trim_end()).context("parse request")?;
    let resp = dispatch_async(manager, wire.request).await;

    let mut out = serde_json::to_string(&resp)?;
    out.push('\n');
    let stream = reader.get_mut();
    stream.write_all(out.as_bytes()).await.context("write response")?;
    stream.flush().await.context("flush response")?;
    Ok(())
}

pub async fn dispatch_async(manager: Arc<ProcessManager>, req: Request) -> Response {
    match req {
        Request::List => Response {
            ok: true,
            message: String::new(),
            children: manager.list(),
        },
        Request::Get { key } => match manager.get(&key) {
            Some(info) => Response {
                ok: true,
                message: String::new(),
                children: vec![info],
            },
            None => Response {
                ok: true,
                message: format!("no such process: {key}"),
                children: vec![],
            },
        },
        Request::Write { name, descriptor } => {
            let m = Arc::clone(&manager);
            let n = name.clone();
            let r = tasks()
                .spawn_blocking(move || m.write_process(&n, &descriptor))
                .await
                .map_err(|e| anyhow::anyhow!("join error: {e}"))
                .and_then(|r| r);
            match r {
                Ok(()) => Response {
                    ok: true,
                    message: format!("wrote {name}"),
                    children: vec![],
                },
                Err(e) => Response {
                    ok: false,
                    message: format!("write {name}: {e}"),
                    children: vec![],
                },
            }
        }
        Request::Delete { name } => {
            let m = Arc::clone(&manager);
            let n = name.clone();
            let r = tasks()
                .spawn_blocking(move || m.delete_process(&n))
                .await
                .map_err(|e| anyhow::anyhow!("join error: {e}"))
                .and_then(|r| r);
            match r {
                Ok(()) => Response {
                    ok: true,
                    message: format!("deleted {name}"),
                    children: vec![],
                },
                Err(e) => Response {
                    ok: false,
                    message: format!("delete {name}: {e}"),
                    children: vec![],
                },
            }
        }
        Request::ServerVersion => Response {
            ok: true,
            message: build_info::banner(),
            children: vec![],
        },
    }
}
