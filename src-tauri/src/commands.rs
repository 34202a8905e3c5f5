// NovelMind Tauri Commands
// These are the IPC commands exposed to the frontend

use crate::backend::{BackendStatus, DEFAULT_BACKEND_PORT};
use crate::connectivity::{resolve_backend_port, ConnectionInfo, PortSource};
use crate::error::{NovelMindError, Result};
use crate::logs::{self, LogFileInfo};
use crate::state::AppState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tauri::{AppHandle, Manager, State, Window};
use tauri_plugin_dialog::DialogExt;
use tauri_plugin_opener::OpenerExt;

const LOG_TAIL_MAX_BYTES: u64 = 512 * 1024;

// ============================================================================
// Dialogs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct FileFilter {
    pub name: String,
    pub extensions: Vec<String>,
}

fn novel_filters() -> Vec<FileFilter> {
    vec![
        FileFilter {
            name: "Novels".to_string(),
            extensions: ["txt", "docx", "epub", "mobi"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        },
        FileFilter {
            name: "All Files".to_string(),
            extensions: vec!["*".to_string()],
        },
    ]
}

fn export_filters() -> Vec<FileFilter> {
    vec![
        FileFilter {
            name: "JSON".to_string(),
            extensions: vec!["json".to_string()],
        },
        FileFilter {
            name: "All Files".to_string(),
            extensions: vec!["*".to_string()],
        },
    ]
}

fn file_dialog_with_filters(
    app: &AppHandle,
    filters: Vec<FileFilter>,
) -> tauri_plugin_dialog::FileDialogBuilder<tauri::Wry> {
    let mut dialog = app.dialog().file();
    for filter in &filters {
        let extensions: Vec<&str> = filter.extensions.iter().map(String::as_str).collect();
        dialog = dialog.add_filter(filter.name.as_str(), &extensions);
    }
    dialog
}

/// Pick a novel file to import. Returns the chosen path, or null when the
/// user cancels.
#[tauri::command]
pub async fn open_file_dialog(
    app: AppHandle,
    filters: Option<Vec<FileFilter>>,
) -> Option<String> {
    file_dialog_with_filters(&app, filters.unwrap_or_else(novel_filters))
        .blocking_pick_file()
        .map(|path| path.to_string())
}

#[tauri::command]
pub async fn open_directory_dialog(app: AppHandle) -> Option<String> {
    app.dialog()
        .file()
        .blocking_pick_folder()
        .map(|path| path.to_string())
}

#[tauri::command]
pub async fn save_file_dialog(
    app: AppHandle,
    filters: Option<Vec<FileFilter>>,
) -> Option<String> {
    file_dialog_with_filters(&app, filters.unwrap_or_else(export_filters))
        .blocking_save_file()
        .map(|path| path.to_string())
}

// ============================================================================
// App metadata
// ============================================================================

/// Resolve a named well-known path, mirroring the path kinds the frontend
/// historically requested.
#[tauri::command]
pub fn get_app_path(app: AppHandle, kind: String) -> Result<String> {
    let path = match kind.as_str() {
        "appData" | "userData" => app.path().app_data_dir(),
        "appConfig" => app.path().app_config_dir(),
        "logs" => app.path().app_log_dir(),
        "home" => app.path().home_dir(),
        "temp" => app.path().temp_dir(),
        "downloads" => app.path().download_dir(),
        "documents" => app.path().document_dir(),
        other => {
            return Err(NovelMindError::NotFound(format!(
                "Unknown path kind: {}",
                other
            )))
        }
    }
    .map_err(|e| NovelMindError::NotFound(format!("Failed to resolve path {}: {}", kind, e)))?;
    Ok(path.to_string_lossy().to_string())
}

#[tauri::command]
pub fn get_app_version(app: AppHandle) -> String {
    app.package_info().version.to_string()
}

// ============================================================================
// Port handshake bridge
// ============================================================================

/// Host side of the handshake: the port allocated for this session. The
/// port is assigned during setup, before any webview can invoke this, so a
/// caller always observes a value.
#[tauri::command]
pub fn get_backend_port(state: State<'_, AppState>) -> u16 {
    state.backend.port().unwrap_or(DEFAULT_BACKEND_PORT)
}

/// Client side of the handshake: resolve the port with a bounded retry,
/// point the HTTP client at it, and reset cached connectivity.
#[tauri::command]
pub async fn resolve_backend_connection(
    state: State<'_, AppState>,
    max_attempts: Option<u32>,
    delay_ms: Option<u64>,
) -> Result<u16> {
    let port = resolve_backend_port(
        Some(state.backend.as_ref() as &dyn PortSource),
        max_attempts.unwrap_or(5),
        Duration::from_millis(delay_ms.unwrap_or(500)),
    )
    .await;
    state.client.set_port(port);
    Ok(port)
}

/// Debounced `/health` probe; throttled calls return the cached state.
#[tauri::command]
pub async fn check_backend_connectivity(state: State<'_, AppState>) -> Result<ConnectionInfo> {
    state.client.check_health().await;
    Ok(state.client.connection_info())
}

/// Name/version/status reported by the backend's root endpoint.
#[tauri::command]
pub async fn get_backend_info(state: State<'_, AppState>) -> Result<serde_json::Value> {
    state.client.get_json("/").await
}

// ============================================================================
// Backend supervision
// ============================================================================

#[tauri::command]
pub async fn start_backend(app: AppHandle, state: State<'_, AppState>) -> Result<()> {
    crate::launch_backend(&app, state.inner()).await
}

#[tauri::command]
pub async fn stop_backend(state: State<'_, AppState>) -> Result<()> {
    state.backend.stop().await
}

#[tauri::command]
pub async fn get_backend_status(state: State<'_, AppState>) -> Result<BackendStatus> {
    Ok(state.backend.status().await)
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendLogs {
    pub lines: Vec<String>,
    pub dropped: u64,
}

/// Captured backend output (bounded ring buffer snapshot).
#[tauri::command]
pub fn get_backend_logs(state: State<'_, AppState>, last_n: Option<usize>) -> BackendLogs {
    let (lines, dropped) = state.backend.logs_snapshot(last_n.unwrap_or(200));
    BackendLogs { lines, dropped }
}

// ============================================================================
// Log files
// ============================================================================

fn logs_dir(app: &AppHandle) -> PathBuf {
    crate::app_data_dir(app).join("logs")
}

#[tauri::command]
pub fn list_app_log_files(app: AppHandle) -> Result<Vec<LogFileInfo>> {
    logs::list_log_files(&logs_dir(&app))
}

#[tauri::command]
pub fn read_log_tail(
    app: AppHandle,
    file_name: String,
    lines: Option<usize>,
) -> Result<Vec<String>> {
    let file_name = logs::sanitize_log_file_name(&file_name)?;
    let path = logs_dir(&app).join(file_name);
    logs::tail_file(&path, lines.unwrap_or(500), LOG_TAIL_MAX_BYTES)
}

/// Reveal the log folder in the OS file manager and return its path. In dev
/// builds the backend writes its own log next to the sources, so a copy is
/// pulled in first to keep everything inspectable from one place.
#[tauri::command]
pub fn open_log_folder(app: AppHandle) -> Result<String> {
    let dir = logs_dir(&app);
    std::fs::create_dir_all(&dir).map_err(NovelMindError::Io)?;

    #[cfg(debug_assertions)]
    {
        if let Some(backend_dir) = crate::launch_plan::find_dev_backend_dir() {
            let dev_log = backend_dir.join("data").join("app.log");
            if dev_log.is_file() {
                if let Err(e) = std::fs::copy(&dev_log, dir.join("backend-dev.log")) {
                    tracing::warn!("Failed to copy backend dev log: {}", e);
                }
            }
        }
    }

    // Highlight the most recent log file when there is one.
    let newest = logs::list_log_files(&dir)
        .ok()
        .and_then(|files| files.into_iter().next());
    let reveal_target = match newest {
        Some(file) => dir.join(file.name),
        None => dir.clone(),
    };
    app.opener()
        .reveal_item_in_dir(&reveal_target)
        .map_err(|e| NovelMindError::Backend(format!("Failed to open log folder: {}", e)))?;

    Ok(dir.to_string_lossy().to_string())
}

// ============================================================================
// Window controls (fire-and-forget)
// ============================================================================

#[tauri::command]
pub fn minimize_window(window: Window) {
    let _ = window.minimize();
}

/// Toggles between maximized and restored based on the current state.
#[tauri::command]
pub fn toggle_maximize_window(window: Window) {
    match window.is_maximized() {
        Ok(true) => {
            let _ = window.unmaximize();
        }
        Ok(false) => {
            let _ = window.maximize();
        }
        Err(e) => tracing::warn!("Failed to query window state: {}", e),
    }
}

#[tauri::command]
pub fn close_window(window: Window) {
    let _ = window.close();
}
