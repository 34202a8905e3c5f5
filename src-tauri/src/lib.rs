// NovelMind - AI-powered novel plot analysis and relationship visualization
// This is the main library entry point for the Tauri application

mod backend;
mod commands;
mod connectivity;
mod error;
mod launch_plan;
mod logs;
mod state;

use tauri::Manager;
use tauri_plugin_dialog::{DialogExt, MessageDialogKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application data directory, falling back to the platform data dir when
/// the resolver has no answer (some Linux setups during `tauri dev`).
pub(crate) fn app_data_dir(app: &tauri::AppHandle) -> std::path::PathBuf {
    app.path()
        .app_data_dir()
        .ok()
        .or_else(|| dirs::data_dir().map(|d| d.join("novelmind")))
        .unwrap_or_else(|| std::path::PathBuf::from("."))
}

/// Initialize tracing for logging (console + file)
fn init_tracing(app_data_dir: &std::path::Path) {
    use std::fs;
    use tracing_appender::rolling;

    // Create logs directory
    let logs_dir = app_data_dir.join("logs");
    fs::create_dir_all(&logs_dir).ok();

    // Daily rotation; files are named novelmind.YYYY-MM-DD.log
    let file_appender = rolling::daily(&logs_dir, "novelmind");

    // Set up both console and file logging
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false); // No ANSI colors in file

    let console_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "novelmind=info,tauri=info".into()),
        )
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!("Logging initialized (logs directory: {:?})", logs_dir);
}

/// Resolve the launch plan for the current packaging mode and start the
/// backend. Spawn failures are returned, not panicked: the shell keeps
/// running with no live backend and the UI shows a disconnected state.
pub(crate) async fn launch_backend(
    app: &tauri::AppHandle,
    state: &state::AppState,
) -> error::Result<()> {
    use launch_plan::{resolve_launch_plan, LaunchMode, LaunchPaths};

    let mode = if cfg!(debug_assertions) {
        LaunchMode::Development
    } else {
        LaunchMode::Packaged
    };

    let paths = LaunchPaths {
        source_backend_dir: launch_plan::find_dev_backend_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("backend")),
        resource_dir: app.path().resource_dir().unwrap_or_default(),
    };

    let port = state.backend.port().unwrap_or(backend::DEFAULT_BACKEND_PORT);
    let plan = resolve_launch_plan(mode, std::env::consts::OS, &paths, port)?;

    // Packaged installs mirror backend output into an append-only session
    // log under the app data dir; dev runs keep it in the ring buffer only.
    if mode == LaunchMode::Packaged {
        let log_path = app_data_dir(app).join("logs").join("backend.log");
        match logs::SessionLog::open(&log_path) {
            Ok(log) => state.backend.attach_session_log(std::sync::Arc::new(log)),
            Err(e) => tracing::warn!("Failed to open backend session log: {}", e),
        }
    }

    state.backend.start(plan).await
}

async fn stop_backend_blocking(state: &state::AppState, reason: &str) {
    tracing::info!("{} - stopping backend", reason);
    if let Err(e) = state.backend.stop().await {
        tracing::error!("Failed to stop backend ({}): {}", reason, e);
    }
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let mut builder = tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .plugin(tauri_plugin_dialog::init())
        .setup(|app| {
            // Get app data directory for logging and state
            let app_data_dir = app_data_dir(app.handle());
            std::fs::create_dir_all(&app_data_dir).ok();
            init_tracing(&app_data_dir);
            tracing::debug!("Starting NovelMind application");

            let app_state = state::AppState::new();

            // The port must be known before the backend can be told to bind
            // it, and before any webview exists to ask for it. Allocation
            // failure falls back to the fixed default instead of aborting.
            let port = match backend::allocate_port() {
                Ok(port) => port,
                Err(e) => {
                    tracing::error!(
                        "{}; falling back to port {}",
                        e,
                        backend::DEFAULT_BACKEND_PORT
                    );
                    backend::DEFAULT_BACKEND_PORT
                }
            };
            app_state.backend.set_port(port);
            app_state.client.set_port(port);
            tracing::info!("Allocated backend port {}", port);

            app.manage(app_state);

            // Launch is fire-and-forget relative to window creation; the UI
            // may render and issue failing requests until the backend is up,
            // which the connectivity debounce absorbs.
            let handle = app.handle().clone();
            tauri::async_runtime::spawn(async move {
                let state = handle.state::<state::AppState>();
                if let Err(e) = launch_backend(&handle, &state).await {
                    tracing::error!("Failed to start analysis backend: {}", e);
                    handle
                        .dialog()
                        .message(format!("Failed to start the analysis backend:\n{}", e))
                        .kind(MessageDialogKind::Error)
                        .title("NovelMind")
                        .show(|_| {});
                }
            });

            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            // Dialogs
            commands::open_file_dialog,
            commands::open_directory_dialog,
            commands::save_file_dialog,
            // App metadata
            commands::get_app_path,
            commands::get_app_version,
            // Port handshake
            commands::get_backend_port,
            commands::resolve_backend_connection,
            commands::check_backend_connectivity,
            commands::get_backend_info,
            // Backend supervision
            commands::start_backend,
            commands::stop_backend,
            commands::get_backend_status,
            commands::get_backend_logs,
            // Logs
            commands::open_log_folder,
            commands::list_app_log_files,
            commands::read_log_tail,
            // Window controls
            commands::minimize_window,
            commands::toggle_maximize_window,
            commands::close_window,
        ]);

    // Add desktop-only plugins
    #[cfg(not(any(target_os = "android", target_os = "ios")))]
    {
        builder = builder
            .plugin(tauri_plugin_single_instance::init(|_app, _args, _cwd| {
                // Handle when another instance tries to launch
                tracing::info!("Another instance tried to launch");
            }))
            .on_window_event(|window, event| {
                if let tauri::WindowEvent::CloseRequested { .. } = event {
                    let app = window.app_handle();
                    if let Some(state) = app.try_state::<state::AppState>() {
                        tauri::async_runtime::block_on(stop_backend_blocking(
                            &state,
                            "Window closing",
                        ));
                    }
                }
            });
    }

    let app = builder
        .build(tauri::generate_context!())
        .expect("error while running tauri application");

    app.run(|app_handle, event| {
        if let tauri::RunEvent::ExitRequested { .. } = event {
            if let Some(state) = app_handle.try_state::<state::AppState>() {
                tauri::async_runtime::block_on(stop_backend_blocking(&state, "Exit requested"));
            }
        }
    });
}
