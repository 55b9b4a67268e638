use std::{net::SocketAddr, path::PathBuf};

use anyhow::bail;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use storeforward::{
    config::Config,
    logging,
    queue::{Queue, QueuedRequestSummary},
    replay::ReplaySummary,
};

#[derive(Debug, Parser)]
#[command(name = "storeforward")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the relay.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Inspect and manage the durable request queue.
    Queue {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(subcommand)]
        action: QueueCommand,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum QueueCommand {
    /// List queued requests.
    List,
    /// Remove all queued requests.
    Clear,
    /// Trigger a replay pass on a running relay admin endpoint.
    Replay {
        /// Explicit admin listen address (`host:port`), required when config
        /// uses `admin_port = 0`.
        #[arg(long)]
        admin_addr: Option<SocketAddr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueueCommandOutcome {
    Listed {
        summaries: Vec<QueuedRequestSummary>,
    },
    Cleared {
        cleared: usize,
    },
    Replayed {
        summary: ReplaySummary,
        admin_addr: SocketAddr,
    },
}

fn resolve_admin_addr_for_replay(
    config: &Config,
    admin_addr_override: Option<SocketAddr>,
) -> anyhow::Result<SocketAddr> {
    if let Some(admin_addr) = admin_addr_override {
        return Ok(admin_addr);
    }

    let Some(admin_port) = config.relay.admin_port else {
        bail!("`queue replay` requires `relay.admin_port` in config or `--admin-addr` override");
    };
    if admin_port == 0 {
        bail!(
            "`queue replay` cannot infer admin port from `relay.admin_port = 0`; pass `--admin-addr`"
        );
    }

    Ok(SocketAddr::new(config.relay.listen.ip(), admin_port))
}

fn extract_admin_error_message(response_body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(response_body).ok()?;
    value
        .get("error")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}

async fn replay_via_admin(admin_addr: SocketAddr) -> anyhow::Result<ReplaySummary> {
    let uri: Uri = format!("http://{admin_addr}/replay")
        .parse()
        .map_err(|err| anyhow::anyhow!("build admin replay URI: {err}"))?;

    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build(connector);

    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .map_err(|err| anyhow::anyhow!("build admin replay request: {err}"))?;

    let response = client
        .request(request)
        .await
        .map_err(|err| anyhow::anyhow!("request admin replay endpoint: {err}"))?;
    let status = response.status();
    let response_body = response
        .into_body()
        .collect()
        .await
        .map_err(|err| anyhow::anyhow!("read admin replay response body: {err}"))?
        .to_bytes();
    if !status.is_success() {
        let message = extract_admin_error_message(&response_body)
            .unwrap_or_else(|| String::from_utf8_lossy(&response_body).into_owned());
        bail!("replay via admin {admin_addr} failed: {status} {message}");
    }

    serde_json::from_slice(&response_body)
        .map_err(|err| anyhow::anyhow!("parse admin replay response: {err}"))
}

async fn run_queue_command(
    config: &Config,
    command: QueueCommand,
) -> anyhow::Result<QueueCommandOutcome> {
    match command {
        QueueCommand::List => {
            let queue = Queue::from_config(config)?;
            let summaries = queue.list().await?;
            Ok(QueueCommandOutcome::Listed { summaries })
        }
        QueueCommand::Clear => {
            let queue = Queue::from_config(config)?;
            let cleared = queue.clear().await?;
            Ok(QueueCommandOutcome::Cleared { cleared })
        }
        QueueCommand::Replay { admin_addr } => {
            let admin_addr = resolve_admin_addr_for_replay(config, admin_addr)?;
            let summary = replay_via_admin(admin_addr).await?;
            Ok(QueueCommandOutcome::Replayed {
                summary,
                admin_addr,
            })
        }
    }
}

fn print_queue_command_outcome(outcome: QueueCommandOutcome) {
    match outcome {
        QueueCommandOutcome::Listed { summaries } => {
            if summaries.is_empty() {
                println!("queue is empty");
                return;
            }
            for summary in summaries {
                println!(
                    "{:>6}  {:<7} {} ({} bytes, queued_at_unix_ms={})",
                    summary.id,
                    summary.method,
                    summary.url,
                    summary.body_bytes,
                    summary.created_at_unix_ms
                );
            }
        }
        QueueCommandOutcome::Cleared { cleared } => {
            println!("cleared {cleared} queued request(s)");
        }
        QueueCommandOutcome::Replayed {
            summary,
            admin_addr,
        } => {
            println!(
                "replay pass via admin {admin_addr}: {} attempted, {} failed",
                summary.attempted, summary.failed
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let relay = storeforward::relay::serve(&config).await?;
            eprintln!(
                "{}",
                startup_summary(&config, relay.listen_addr, relay.admin_listen_addr)
            );
            tokio::signal::ctrl_c().await?;
            relay.shutdown().await;
        }
        Command::Queue { config, action } => {
            let config = Config::load(config.as_deref())?;
            let outcome = run_queue_command(&config, action).await?;
            print_queue_command_outcome(outcome);
        }
    }

    Ok(())
}

fn startup_summary(
    config: &Config,
    relay_listen_addr: SocketAddr,
    admin_listen_addr: Option<SocketAddr>,
) -> String {
    let admin_listen_addr = admin_listen_addr
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "disabled".to_owned());
    let replay_interval = config
        .replay
        .as_ref()
        .and_then(|replay| replay.interval_secs)
        .map(|secs| secs.to_string())
        .unwrap_or_else(|| "disabled".to_owned());
    let replay_ack = config
        .replay
        .as_ref()
        .and_then(|replay| replay.ack)
        .unwrap_or_default();

    format!(
        "startup config: relay_listen={}, admin_listen={}, upstream={}, offline_rule={}, storage_path={}, replay_interval_secs={}, replay_ack={}",
        relay_listen_addr,
        admin_listen_addr,
        config.relay.upstream,
        config.offline.rule,
        config.storage.path.display(),
        replay_interval,
        replay_ack
    )
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use clap::Parser;
    use storeforward::config::Config;
    use tempfile::tempdir;

    use super::{
        Cli, Command, QueueCommand, QueueCommandOutcome, resolve_admin_addr_for_replay,
        run_queue_command, startup_summary,
    };

    fn config_with_storage(base_path: &Path) -> Config {
        Config::from_toml_str(&format!(
            r#"
[relay]
listen = "127.0.0.1:8400"
upstream = "http://127.0.0.1:8080"
admin_port = 8401

[offline]
rule = {{ kind = "suffix", value = ".json" }}

[storage]
path = "{}"
"#,
            base_path.display()
        ))
        .expect("config should parse")
    }

    #[test]
    fn cli_parses_serve_and_queue_commands() {
        let cli = Cli::parse_from(["storeforward", "serve", "--log-level", "debug"]);
        assert!(matches!(
            cli.command,
            Command::Serve {
                log_level: Some(ref level),
                ..
            } if level == "debug"
        ));

        let cli = Cli::parse_from(["storeforward", "queue", "list"]);
        assert!(matches!(
            cli.command,
            Command::Queue {
                action: QueueCommand::List,
                ..
            }
        ));

        let cli = Cli::parse_from([
            "storeforward",
            "queue",
            "replay",
            "--admin-addr",
            "127.0.0.1:9999",
        ]);
        assert!(matches!(
            cli.command,
            Command::Queue {
                action: QueueCommand::Replay {
                    admin_addr: Some(_)
                },
                ..
            }
        ));
    }

    #[test]
    fn admin_addr_resolution_prefers_override_then_config() {
        let temp_dir = tempdir().unwrap();
        let config = config_with_storage(temp_dir.path());

        let explicit = "127.0.0.1:7000".parse().unwrap();
        assert_eq!(
            resolve_admin_addr_for_replay(&config, Some(explicit)).unwrap(),
            explicit
        );
        assert_eq!(
            resolve_admin_addr_for_replay(&config, None).unwrap(),
            "127.0.0.1:8401".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn queue_list_and_clear_operate_on_the_store() {
        let temp_dir = tempdir().unwrap();
        let config = config_with_storage(temp_dir.path());

        let queue = storeforward::queue::Queue::from_config(&config).unwrap();
        queue
            .enqueue(
                "http://origin.test/a.json",
                "POST",
                vec![bytes::Bytes::from_static(b"abc")],
            )
            .await
            .unwrap();

        let outcome = run_queue_command(&config, QueueCommand::List).await.unwrap();
        let QueueCommandOutcome::Listed { summaries } = outcome else {
            panic!("expected listed outcome");
        };
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].url, "http://origin.test/a.json");
        assert_eq!(summaries[0].body_bytes, 3);

        let outcome = run_queue_command(&config, QueueCommand::Clear)
            .await
            .unwrap();
        assert_eq!(outcome, QueueCommandOutcome::Cleared { cleared: 1 });
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[test]
    fn startup_summary_names_every_surface() {
        let temp_dir = tempdir().unwrap();
        let config = config_with_storage(temp_dir.path());

        let summary = startup_summary(
            &config,
            "127.0.0.1:8400".parse().unwrap(),
            Some("127.0.0.1:8401".parse().unwrap()),
        );

        assert!(summary.contains("relay_listen=127.0.0.1:8400"));
        assert!(summary.contains("admin_listen=127.0.0.1:8401"));
        assert!(summary.contains("offline_rule=suffix:.json"));
        assert!(summary.contains("replay_interval_secs=disabled"));
        assert!(summary.contains("replay_ack=drained"));
    }
}
