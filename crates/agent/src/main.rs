// kwatch-agent main
// Tails local logs and reports anomalies to the central ingest server.
//
// Usage:
//   kwatch-agent --server http://server:8000 [--token t] [--config path]
//                [--data-dir path] [--oneshot]

use std::path::PathBuf;

use kwatch_agent::Agent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kwatch_agent=info,kwatch_tailer=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let Some(server) = flag_value(&args, "--server", "-s")
        .or_else(|| std::env::var("KWATCH_SERVER").ok())
    else {
        eprintln!("usage: kwatch-agent --server http://host:port [--token t] [--config path] [--data-dir path] [--oneshot]");
        std::process::exit(2);
    };

    let token = flag_value(&args, "--token", "-t").or_else(|| std::env::var("KWATCH_TOKEN").ok());
    let config_path = flag_value(&args, "--config", "-c")
        .map(PathBuf::from)
        .or_else(|| std::env::var("KWATCH_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config/config.json"));
    let data_dir = flag_value(&args, "--data-dir", "-d")
        .map(PathBuf::from)
        .or_else(|| std::env::var("KWATCH_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"));

    std::fs::create_dir_all(&data_dir)?;
    let agent = Agent::new(&server, token, config_path, data_dir)?;

    if args.iter().any(|a| a == "--oneshot") {
        let config = agent.load_config();
        let stats = agent.run_oneshot(&config).await?;
        tracing::info!(
            files = stats.files_scanned,
            lines = stats.lines_read,
            events = stats.events_emitted,
            "one-shot scan complete"
        );
        return Ok(());
    }

    agent.run().await
}

fn flag_value(args: &[String], long: &str, short: &str) -> Option<String> {
    args.iter()
        .position(|a| a == long || a == short)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
