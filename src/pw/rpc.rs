use crate::pw::build_info;
use crate::pw::descriptor::Descriptor;
use crate::pw::supervisor::ChildInfo;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientBuildInfo {
    pub build_time: String,
    pub build_host: String,
}

impl ClientBuildInfo {
    pub fn current() -> Self {
        Self {
            build_time: build_info::build_time_pretty(),
            build_host: build_info::build_host().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub client: ClientBuildInfo,
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    /// Snapshot every supervised child.
    List,
    /// Snapshot one child by key.
    Get { key: String },
    /// Persist a descriptor; the scan loop picks it up within one interval.
    Write { name: String, descriptor: Descriptor },
    /// Remove a descriptor; its supervisor stops the child and winds down.
    Delete { name: String },
    /// Return server build info (build_host/build_time).
    ServerVersion,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub children: Vec<ChildInfo>,
}

impl Response {
    pub fn render_text(&self) -> String {
        if !self.message.is_empty() && self.children.is_empty() {
            return self.message.clone();
        }
        if self.children.is_empty() {
            return "(no processes)".to_string();
        }

        fn pad(s: &str, width: usize) -> String {
            if s.len() >= width {
                return s.to_string();
            }
            let mut out = String::with_capacity(width);
            out.push_str(s);
            out.push_str(&" ".repeat(width - s.len()));
            out
        }

        fn border(widths: &[usize]) -> String {
            let mut out = String::new();
            out.push('+');
            for w in widths {
                // 1 leading + 1 trailing padding space per cell.
                out.push_str(&"-".repeat(*w + 2));
                out.push('+');
            }
            out
        }

        fn row_line(cols: &[String], widths: &[usize]) -> String {
            let mut out = String::new();
            out.push('|');
            for (i, w) in widths.iter().enumerate() {
                let v = cols.get(i).map(|s| s.as_str()).unwrap_or("");
                out.push(' ');
                out.push_str(&pad(v, *w));
                out.push(' ');
                out.push('|');
            }
            out
        }

        let headers = ["key", "pid", "running", "tags"];
        let mut rows: Vec<Vec<String>> = Vec::new();
        for c in &self.children {
            let pid = if c.pid > 0 {
                c.pid.to_string()
            } else {
                "-".to_string()
            };
            let running = if c.running { "yes" } else { "no" };
            let tags = if c.tags.is_empty() {
                "-".to_string()
            } else {
                serde_json::to_string(&c.tags).unwrap_or_else(|_| "?".to_string())
            };
            rows.push(vec![c.key.clone(), pid, running.to_string(), tags]);
        }

        let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
        for r in &rows {
            for (i, c) in r.iter().enumerate() {
                widths[i] = widths[i].max(c.len());
            }
        }

        let mut out = String::new();
        let top = border(&widths);
        out.push_str(&top);
        out.push('\n');
        out.push_str(&row_line(
            &headers.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &widths,
        ));
        out.push('\n');
        out.push_str(&top);
        out.push('\n');
        for r in &rows {
            out.push_str(&row_line(r, &widths));
            out.push('\n');
        }
        out.push_str(&top);
        out.push('\n');
        out
    }
}

pub fn client_call(sock: &Path, req: Request) -> anyhow::Result<Response> {
    let mut stream = UnixStream::connect(sock).map_err(|e| {
        anyhow::anyhow!(
            "failed to connect to procwatch daemon socket {}: {e}",
            sock.display()
        )
    })?;

    let wire = WireRequest {
        client: ClientBuildInfo::current(),
        request: req,
    };
    let line = serde_json::to_string(&wire)? + "\n";
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut resp_line = String::new();
    reader.read_line(&mut resp_line)?;
    if resp_line.trim().is_empty() {
        anyhow::bail!("empty response from daemon");
    }
    let resp: Response = serde_json::from_str(resp_line.trim_end())?;
    if !resp.ok {
        anyhow::bail!("{}", resp.message);
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let req = Request::Get {
            key: "web".to_string(),
        };
        let s = serde_json::to_string(&req).unwrap();
        assert_eq!(s, r#"{"type":"Get","data":{"key":"web"}}"#);
    }

    #[test]
    fn render_lists_children() {
        let resp = Response {
            ok: true,
            message: String::new(),
            children: vec![ChildInfo {
                key: "s1".to_string(),
                pid: 42,
                running: true,
                tags: Default::default(),
            }],
        };
        let text = resp.render_text();
        assert!(text.contains("| s1"), "{text}");
        assert!(text.contains("42"), "{text}");
    }

    #[test]
    fn render_prefers_message_when_no_children() {
        let resp = Response {
            ok: true,
            message: "no such process: x".to_string(),
            children: vec![],
        };
        assert_eq!(resp.render_text(), "no such process: x");
    }
}
