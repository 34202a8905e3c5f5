// Launch plan resolution for the analysis backend.
//
// All packaging/platform branching lives in pure functions over an injected
// set of paths, so the dev-vs-packaged matrix is unit-testable without
// spawning anything.

use crate::error::{NovelMindError, Result};
use std::collections::HashMap;
use std::path::PathBuf;

/// Environment variable the backend reads to pick its listen port.
pub const BACKEND_PORT_ENV: &str = "APP_PORT";
/// Keeps the Python backend's output line-buffered through the pipe.
pub const UNBUFFERED_ENV: &str = "PYTHONUNBUFFERED";

const BACKEND_ENTRY_POINT: &str = "main.py";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Running from the source tree (`tauri dev`).
    Development,
    /// Running from an installed bundle.
    Packaged,
}

/// Filesystem roots the plan is resolved against.
#[derive(Debug, Clone)]
pub struct LaunchPaths {
    /// Backend source tree, used in development mode.
    pub source_backend_dir: PathBuf,
    /// Bundle resource directory, used in packaged mode.
    pub resource_dir: PathBuf,
}

/// A fully resolved launch: what to exec, where, and with which environment.
/// Computed once per launch attempt and not mutated afterwards.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub envs: HashMap<String, String>,
    /// True when a packaged install had no bundled executable and we fell
    /// back to a system interpreter. That only works if the user happens to
    /// have Python installed, so callers surface a warning.
    pub interpreter_fallback: bool,
}

fn bundled_executable_name(platform: &str) -> &'static str {
    if platform == "windows" {
        "novelmind-backend.exe"
    } else {
        "novelmind-backend"
    }
}

fn dev_runner_name(platform: &str) -> &'static str {
    if platform == "windows" {
        "uv.exe"
    } else {
        "uv"
    }
}

fn interpreter_name(platform: &str) -> &'static str {
    if platform == "windows" {
        "python"
    } else {
        "python3"
    }
}

fn port_envs(port: u16) -> HashMap<String, String> {
    let mut envs = HashMap::new();
    envs.insert(BACKEND_PORT_ENV.to_string(), port.to_string());
    envs.insert(UNBUFFERED_ENV.to_string(), "1".to_string());
    envs
}

/// Resolve the executable, arguments, working directory and environment for
/// the current packaging mode and OS. `platform` takes the values of
/// `std::env::consts::OS` ("windows", "macos", "linux").
pub fn resolve_launch_plan(
    mode: LaunchMode,
    platform: &str,
    paths: &LaunchPaths,
    port: u16,
) -> Result<LaunchPlan> {
    match mode {
        LaunchMode::Development => {
            let backend_dir = &paths.source_backend_dir;
            if !backend_dir.join(BACKEND_ENTRY_POINT).is_file() {
                return Err(NovelMindError::Launch(format!(
                    "Backend source tree not found at {:?}",
                    backend_dir
                )));
            }
            // `uv run python main.py` executes inside the backend's declared
            // environment, same as the npm dev script did.
            Ok(LaunchPlan {
                program: PathBuf::from(dev_runner_name(platform)),
                args: vec![
                    "run".to_string(),
                    "python".to_string(),
                    BACKEND_ENTRY_POINT.to_string(),
                ],
                cwd: backend_dir.clone(),
                envs: port_envs(port),
                interpreter_fallback: false,
            })
        }
        LaunchMode::Packaged => {
            let backend_dir = paths.resource_dir.join("backend");
            let bundled = backend_dir.join(bundled_executable_name(platform));
            if bundled.is_file() {
                return Ok(LaunchPlan {
                    program: bundled,
                    args: Vec::new(),
                    cwd: backend_dir,
                    envs: port_envs(port),
                    interpreter_fallback: false,
                });
            }

            let script = backend_dir.join(BACKEND_ENTRY_POINT);
            if !script.is_file() {
                return Err(NovelMindError::Launch(format!(
                    "No bundled backend executable or {} under {:?}",
                    BACKEND_ENTRY_POINT, backend_dir
                )));
            }
            Ok(LaunchPlan {
                program: PathBuf::from(interpreter_name(platform)),
                args: vec![BACKEND_ENTRY_POINT.to_string()],
                cwd: backend_dir,
                envs: port_envs(port),
                interpreter_fallback: true,
            })
        }
    }
}

/// Locate the backend source tree for development runs. `tauri dev` may run
/// from the crate dir or the project root, so a few candidates are probed.
pub fn find_dev_backend_dir() -> Option<PathBuf> {
    let current_dir = std::env::current_dir().ok()?;
    let candidates = [
        current_dir.join("backend"),
        current_dir.join("..").join("backend"),
        current_dir.join("src-tauri").join("..").join("backend"),
    ];
    candidates
        .into_iter()
        .find(|c| c.join(BACKEND_ENTRY_POINT).is_file())
}
