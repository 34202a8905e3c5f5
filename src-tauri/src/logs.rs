use crate::error::{NovelMindError, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::UNIX_EPOCH;

/// Bounded in-memory buffer for captured backend output.
///
/// The backend's stdout/stderr must always be drained once piped, or the
/// child can deadlock when its stdio buffers fill. Reader threads push here
/// and the oldest lines are dropped past `max_lines`.
#[derive(Debug)]
pub struct LogRingBuffer {
    max_lines: usize,
    dropped_total: AtomicU64,
    lines: RwLock<VecDeque<String>>,
}

impl LogRingBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            dropped_total: AtomicU64::new(0),
            lines: RwLock::new(VecDeque::new()),
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn push(&self, text: String) {
        let mut guard = self.lines.write().unwrap();
        guard.push_back(text);
        while guard.len() > self.max_lines {
            guard.pop_front();
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, last_n: usize) -> Vec<String> {
        let guard = self.lines.read().unwrap();
        let start = guard.len().saturating_sub(last_n);
        guard.iter().skip(start).cloned().collect()
    }
}

/// Append-only per-session backend log file (packaged mode).
///
/// Layout: a session-start marker, interleaved stdout/stderr lines, and an
/// `[Exit]` trailer when the process goes away.
#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl SessionLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(NovelMindError::Io)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(NovelMindError::Io)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort append; a full disk must not take the supervisor down.
    pub fn write_line(&self, line: &str) {
        let mut file = self.file.lock().unwrap();
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::warn!("Failed to append to backend session log: {}", e);
        }
    }

    pub fn write_session_start(&self, port: u16) {
        self.write_line(&format!(
            "--- Backend Session Started at {} (Port: {}) ---",
            chrono::Utc::now().to_rfc3339(),
            port
        ));
    }

    pub fn write_exit(&self, code: Option<i32>) {
        let code = code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.write_line(&format!("[Exit] Backend process exited with code {}", code));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogFileInfo {
    pub name: String,
    pub size: u64,
    pub modified_ms: u64,
}

pub fn list_log_files(logs_dir: &Path) -> Result<Vec<LogFileInfo>> {
    let mut out = Vec::new();
    let entries = fs::read_dir(logs_dir).map_err(NovelMindError::Io)?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        // Only expose our own files (shell rolling logs + backend session log).
        if !file_name.starts_with("novelmind") && !file_name.starts_with("backend") {
            continue;
        }

        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        out.push(LogFileInfo {
            name: file_name,
            size: meta.len(),
            modified_ms,
        });
    }

    out.sort_by_key(|f| std::cmp::Reverse(f.modified_ms));
    Ok(out)
}

// Best-effort "tail" by bytes and split into lines.
pub fn tail_file(path: &Path, tail_lines: usize, max_bytes: u64) -> Result<Vec<String>> {
    let mut file = File::open(path).map_err(NovelMindError::Io)?;
    let len = file.metadata().map_err(NovelMindError::Io)?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).map_err(NovelMindError::Io)?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(NovelMindError::Io)?;
    let s = String::from_utf8_lossy(&buf);

    let mut lines: Vec<String> = s
        .split('\n')
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|l| !l.is_empty())
        .collect();

    if lines.len() > tail_lines {
        lines = lines.split_off(lines.len() - tail_lines);
    }

    Ok(lines)
}

pub fn sanitize_log_file_name(name: &str) -> Result<String> {
    // Avoid path traversal: only allow a simple file name.
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(NovelMindError::InvalidConfig(
            "Invalid log file name".to_string(),
        ));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest() {
        let buf = LogRingBuffer::new(3);
        buf.push("a".to_string());
        buf.push("b".to_string());
        buf.push("c".to_string());
        buf.push("d".to_string());
        let snap = buf.snapshot(10);
        assert_eq!(snap, vec!["b", "c", "d"]);
        assert_eq!(buf.dropped_total(), 1);
    }

    #[test]
    fn ring_buffer_snapshot_limits_lines() {
        let buf = LogRingBuffer::new(10);
        for i in 0..5 {
            buf.push(format!("line {}", i));
        }
        let snap = buf.snapshot(2);
        assert_eq!(snap, vec!["line 3", "line 4"]);
    }

    #[test]
    fn session_log_writes_marker_and_exit_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.log");
        let log = SessionLog::open(&path).unwrap();
        log.write_session_start(5173);
        log.write_line("Uvicorn running");
        log.write_exit(Some(0));

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("--- Backend Session Started at "));
        assert!(contents.contains("(Port: 5173) ---"));
        assert!(contents.contains("Uvicorn running"));
        assert!(contents.contains("[Exit] Backend process exited with code 0"));
    }

    #[test]
    fn session_log_appends_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.log");
        {
            let log = SessionLog::open(&path).unwrap();
            log.write_session_start(5001);
        }
        {
            let log = SessionLog::open(&path).unwrap();
            log.write_session_start(5002);
        }
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("(Port: 5001)"));
        assert!(contents.contains("(Port: 5002)"));
    }

    #[test]
    fn tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("novelmind.log");
        fs::write(&path, "one\ntwo\nthree\nfour\n").unwrap();
        let lines = tail_file(&path, 2, 1024).unwrap();
        assert_eq!(lines, vec!["three", "four"]);
    }

    #[test]
    fn rejects_traversal_in_log_file_name() {
        assert!(sanitize_log_file_name("../etc/passwd").is_err());
        assert!(sanitize_log_file_name("sub/novelmind.log").is_err());
        assert!(sanitize_log_file_name("novelmind.2026-08-05.log").is_ok());
    }
}
