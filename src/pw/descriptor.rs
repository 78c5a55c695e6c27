use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// On-disk child descriptor, one per `<conf>/processes/<key>.conf`.
///
/// The wire format is a JSON object with PascalCase keys (`Name`, `Args`,
/// ...). Every field is optional; unknown fields are ignored so descriptors
/// written by newer tooling still load. An empty `Name` is accepted at parse
/// time and rejected at start time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Descriptor {
    /// Executable path (absolute or PATH-resolvable).
    pub name: String,
    /// Argument vector, excluding argv[0].
    pub args: Vec<String>,
    /// `KEY=VALUE` entries; the child gets exactly this environment.
    pub env: Vec<String>,
    /// Working directory; empty means inherit.
    pub dir: String,
    /// Username to run as; empty means the supervisor's own uid.
    pub user: String,
    /// Opaque decoration reported in status snapshots.
    pub tags: BTreeMap<String, serde_json::Value>,
    /// Overrides the default comm-name matching heuristic.
    pub match_executable_name: String,
    /// "" or "defer".
    pub restart_action: String,
}

impl Descriptor {
    pub fn load(path: &Path) -> anyhow::Result<Descriptor> {
        let raw = std::fs::read_to_string(path)?;
        let d: Descriptor = serde_json::from_str(&raw)?;
        Ok(d)
    }

    /// "defer" means a descriptor change must not kill the old child; the new
    /// child is trusted to displace it (haproxy-style handoff).
    pub fn defers_restart(&self) -> bool {
        self.restart_action == "defer"
    }

    /// Decide whether a kernel-reported short command name is compatible with
    /// this descriptor.
    ///
    /// The comm value is what `/proc/<pid>/comm` reports: the executable
    /// basename, truncated by the kernel (15 bytes on Linux). Matching is
    /// deliberately fuzzy; a pid is only ever trusted after this check, never
    /// on `/proc/<pid>` existence alone.
    pub fn matches_comm(&self, comm: &str) -> bool {
        let comm = comm.trim();
        if comm.is_empty() {
            return false;
        }

        if !self.match_executable_name.is_empty() {
            return comm.contains(&self.match_executable_name);
        }

        if self.name.contains(comm) {
            return true;
        }
        if self.name.ends_with(&format!("/{comm}")) {
            return true;
        }

        // The kernel truncates comm; accept prefix matches only when enough
        // of the name survived to make a collision unlikely.
        if comm.len() >= 10
            && (self.name.contains(&format!("/{comm}")) || self.name.starts_with(comm))
        {
            return true;
        }

        false
    }
}

/// Reject keys that could escape the processes directory. Keys become file
/// basenames, so: non-empty, no path separators, no `..`, no leading dot.
pub fn check_safe_name(name: &str) -> anyhow::Result<()> {
    anyhow::ensure!(!name.is_empty(), "name must not be empty");
    anyhow::ensure!(
        !name.contains('/') && !name.contains('\\'),
        "name must not contain path separators: {name:?}"
    );
    anyhow::ensure!(!name.contains(".."), "name must not contain '..': {name:?}");
    anyhow::ensure!(
        !name.starts_with('.'),
        "name must not start with a dot: {name:?}"
    );
    Ok(())
}
