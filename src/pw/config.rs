use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    /// Runtime state directory. Pid files land in `<work_directory>/pids`,
    /// child logs in `<work_directory>/logs`.
    #[serde(default = "default_work_directory")]
    pub work_directory: PathBuf,

    /// Configuration directory. Descriptors are scanned from
    /// `<conf_directory>/processes/*.conf`.
    #[serde(default = "default_conf_directory")]
    pub conf_directory: PathBuf,

    #[serde(default = "default_sock")]
    pub sock: PathBuf,

    /// Unix socket mode (octal), e.g. 600 or "0600".
    #[serde(default = "default_sock_mode", deserialize_with = "deserialize_sock_mode")]
    pub sock_mode: u32,
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MasterConfigFile {
    #[serde(default)]
    global: Option<GlobalConfigFile>,
    #[serde(default)]
    unix_socket: Option<UnixSocketConfigFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalConfigFile {
    #[serde(default)]
    work_directory: Option<PathBuf>,
    #[serde(default)]
    conf_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnixSocketConfigFile {
    #[serde(default = "default_sock")]
    path: PathBuf,
    #[serde(default = "default_sock_mode", deserialize_with = "deserialize_sock_mode")]
    mode: u32,
}

fn default_work_directory() -> PathBuf {
    "work".into()
}
fn default_conf_directory() -> PathBuf {
    "config.d".into()
}
fn default_sock() -> PathBuf {
    "/tmp/procwatch.sock".into()
}
fn default_sock_mode() -> u32 {
    0o600
}

fn deserialize_sock_mode<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .map(|x| x as u32)
            .ok_or_else(|| D::Error::custom("mode must be an integer")),
        serde_yaml::Value::String(s) => parse_mode_str(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "mode must be an integer or string (e.g. 600 or \"0600\")",
        )),
    }
}

fn parse_mode_str(s: &str) -> Result<u32, String> {
    let t = s.trim();
    let t = t.strip_prefix("0o").unwrap_or(t);
    let t = t.strip_prefix("0O").unwrap_or(t);
    let t = t.strip_prefix("0").unwrap_or(t);
    u32::from_str_radix(t, 8).map_err(|e| format!("invalid mode {s:?}: {e}"))
}

pub fn load_master_config(config_path: &Path) -> anyhow::Result<MasterConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let file_cfg: MasterConfigFile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?;

    // Start from defaults and overlay provided groups.
    let mut cfg = MasterConfig {
        work_directory: default_work_directory(),
        conf_directory: default_conf_directory(),
        sock: default_sock(),
        sock_mode: default_sock_mode(),
    };

    if let Some(gl) = file_cfg.global {
        if let Some(wd) = gl.work_directory {
            cfg.work_directory = wd;
        }
        if let Some(cd) = gl.conf_directory {
            cfg.conf_directory = cd;
        }
    }
    if let Some(us) = file_cfg.unix_socket {
        cfg.sock = us.path;
        cfg.sock_mode = us.mode;
    }

    // Resolve relative paths against the config file directory.
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    if cfg.work_directory.is_relative() {
        cfg.work_directory = base.join(&cfg.work_directory);
    }
    if cfg.conf_directory.is_relative() {
        cfg.conf_directory = base.join(&cfg.conf_directory);
    }
    if cfg.sock.is_relative() {
        cfg.sock = base.join(&cfg.sock);
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_cfg(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults_apply_when_groups_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_cfg(dir.path(), "{}\n");
        let cfg = load_master_config(&path).unwrap();
        assert_eq!(cfg.work_directory, dir.path().join("work"));
        assert_eq!(cfg.conf_directory, dir.path().join("config.d"));
        assert_eq!(cfg.sock, PathBuf::from("/tmp/procwatch.sock"));
        assert_eq!(cfg.sock_mode, 0o600);
    }

    #[test]
    fn grouped_overrides_and_relative_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_cfg(
            dir.path(),
            "global:\n  work_directory: state\n  conf_directory: /etc/procwatch\nunix_socket:\n  path: control.sock\n  mode: \"0660\"\n",
        );
        let cfg = load_master_config(&path).unwrap();
        assert_eq!(cfg.work_directory, dir.path().join("state"));
        assert_eq!(cfg.conf_directory, PathBuf::from("/etc/procwatch"));
        assert_eq!(cfg.sock, dir.path().join("control.sock"));
        assert_eq!(cfg.sock_mode, 0o660);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_cfg(dir.path(), "global:\n  bogus: 1\n");
        assert!(load_master_config(&path).is_err());
    }

    #[test]
    fn mode_string_forms() {
        assert_eq!(parse_mode_str("600").unwrap(), 0o600);
        assert_eq!(parse_mode_str("0600").unwrap(), 0o600);
        assert_eq!(parse_mode_str("0o660").unwrap(), 0o660);
        assert!(parse_mode_str("9x9").is_err());
    }
}
