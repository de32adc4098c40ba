mod attendance;
mod audit;
mod authz;
mod backup;
mod classes;
mod config;
mod db;
mod error;
mod identity;
mod ipc;
mod ledger;
mod model;
mod notify;
mod profiles;
mod settings;
mod token;
mod validate;

use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    // stdout carries protocol replies only.
    let filter = EnvFilter::try_new(config::log_filter_from_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn main() {
    init_logging();

    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "invalid configuration");
            std::process::exit(2);
        }
    };
    let preselected = cfg.workspace.clone();
    let mut state = ipc::AppState::new(cfg);
    if let Some(path) = preselected {
        if let Err(e) = state.open_workspace(&path) {
            tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "could not open configured workspace");
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tutord ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to echo back.
                let reply = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() },
                });
                let _ = writeln!(stdout, "{}", reply);
                let _ = stdout.flush();
                continue;
            }
        };

        let span = tracing::info_span!(
            "request",
            id = %req.id,
            method = %req.method,
            actor = tracing::field::Empty
        );
        let resp = span.in_scope(|| ipc::handle_request(&mut state, req));
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("stdin closed, shutting down");
}
