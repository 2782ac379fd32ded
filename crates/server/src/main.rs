// kwatch-server main
// HTTP API and background pipelines for the kernel-log anomaly service.

use std::path::PathBuf;

use kwatch_server::app::{build_router, App};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kwatch_server=info,kwatch_tailer=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let port: u16 = flag_value(&args, "--port", "-p")
        .and_then(|s| s.parse().ok())
        .or_else(|| {
            std::env::var("KWATCH_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
        })
        .unwrap_or(8000);

    let data_dir: PathBuf = flag_value(&args, "--data-dir", "-d")
        .map(PathBuf::from)
        .or_else(|| std::env::var("KWATCH_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"));

    let config_path: PathBuf = flag_value(&args, "--config", "-c")
        .map(PathBuf::from)
        .or_else(|| std::env::var("KWATCH_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config/config.json"));

    std::fs::create_dir_all(&data_dir)?;
    tracing::info!(data_dir = %data_dir.display(), config = %config_path.display(), port, "starting");

    let app = App::new(data_dir, config_path, None)?;
    app.spawn_background();

    let web_dir = PathBuf::from("web");
    let router = build_router(app, Some(web_dir));

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("kernelwatch server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn flag_value(args: &[String], long: &str, short: &str) -> Option<String> {
    args.iter()
        .position(|a| a == long || a == short)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutting down..."),
        Err(err) => {
            // Keep serving: completing this future would stop the server.
            tracing::error!(%err, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    }
}
