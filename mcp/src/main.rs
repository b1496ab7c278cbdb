use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use host_evals_api::HttpServeOptions;
use host_evals_core::features::FeatureRegistry;
use host_evals_core::tracker::ExpiryPolicy;
use host_evals_mcp_runtime::HarnessConfig;
use serde_json::json;

mod logging;

use logging::LogTarget;

#[derive(Parser)]
#[command(
    name = "mcp-host-evals",
    version,
    about = "MCP server that walks a host through protocol exercises and scores which features it implements"
)]
struct Cli {
    #[command(flatten)]
    harness: HarnessArgs,

    #[command(flatten)]
    logs: LogArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct HarnessArgs {
    /// Seconds a triggered notification waits for the host's follow-up call
    #[arg(long, global = true, env = "MCP_HOST_EVALS_CALLBACK_TIMEOUT_SECS", default_value_t = 5)]
    callback_timeout_secs: u64,

    /// Seconds an emitted progress/message value stays confirmable
    #[arg(long, global = true, env = "MCP_HOST_EVALS_CONFIRMATION_TIMEOUT_SECS", default_value_t = 600)]
    confirmation_timeout_secs: u64,

    /// Seconds to wait for the host to answer a server-initiated request
    #[arg(long, global = true, env = "MCP_HOST_EVALS_REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    request_timeout_secs: u64,
}

#[derive(Args, Debug)]
struct LogArgs {
    /// Directory for runtime.log and error.log
    #[arg(long, global = true, env = "MCP_HOST_EVALS_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Log to the console only
    #[arg(long, global = true, env = "MCP_HOST_EVALS_NO_LOG_FILES")]
    no_log_files: bool,
}

impl LogArgs {
    fn dir(&self) -> Option<&std::path::Path> {
        (!self.no_log_files).then_some(self.log_dir.as_path())
    }
}

impl HarnessArgs {
    fn config(&self) -> HarnessConfig {
        HarnessConfig {
            policy: ExpiryPolicy {
                callback_window: Duration::from_secs(self.callback_timeout_secs),
                confirmation_window: Duration::from_secs(self.confirmation_timeout_secs),
            },
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve streamable HTTP on /mcp
    Http {
        /// Port to listen on (retries once on port + 1 when taken)
        #[arg(long, env = "MCP_HOST_EVALS_PORT", default_value_t = 3000, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,

        /// Interface to bind
        #[arg(long, env = "MCP_HOST_EVALS_HOST", default_value = "127.0.0.1")]
        host: String,

        /// Seconds before a session with no traffic and no open stream is dropped
        #[arg(long, env = "MCP_HOST_EVALS_SESSION_IDLE_SECS", default_value_t = 1800, value_parser = clap::value_parser!(u64).range(1..))]
        session_idle_secs: u64,
    },
    /// Serve a single session over stdin/stdout
    Stdio,
}

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let target = match cli.command {
        Command::Http { .. } => LogTarget::Stdout,
        Command::Stdio => LogTarget::Stderr,
    };
    logging::init(target, cli.logs.dir());

    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let registry = Arc::new(FeatureRegistry::mcp());
    let config = cli.harness.config();

    let outcome = match cli.command {
        Command::Http {
            port,
            host,
            session_idle_secs,
        } => host_evals_api::serve(HttpServeOptions {
            host,
            port,
            registry,
            harness: config,
            session_idle_timeout: Duration::from_secs(session_idle_secs),
        })
        .await
        .map_err(|err| err.to_string()),
        Command::Stdio => host_evals_mcp_runtime::stdio::serve_stdio(registry, &config)
            .await
            .map_err(|err| err.to_string()),
    };

    match outcome {
        Ok(()) => 0,
        Err(message) => {
            tracing::error!(event = "server_failed", error = %message, "Server stopped with an error");
            let payload = json!({
                "error": "mcp_host_evals_error",
                "message": message,
            });
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".to_string())
            );
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_defaults() {
        let cli = Cli::try_parse_from(["mcp-host-evals", "http"]).expect("parse");
        match cli.command {
            Command::Http {
                port,
                host,
                session_idle_secs,
            } => {
                assert_eq!(port, 3000);
                assert_eq!(host, "127.0.0.1");
                assert_eq!(
                    Duration::from_secs(session_idle_secs),
                    host_evals_api::DEFAULT_SESSION_IDLE_TIMEOUT
                );
            }
            Command::Stdio => panic!("expected http"),
        }
        let config = cli.harness.config();
        assert_eq!(config.policy.callback_window, Duration::from_secs(5));
        assert_eq!(config.policy.confirmation_window, Duration::from_secs(600));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn invalid_ports_are_rejected() {
        for port in ["0", "65536", "eighty"] {
            assert!(
                Cli::try_parse_from(["mcp-host-evals", "http", "--port", port]).is_err(),
                "{port}"
            );
        }
    }

    #[test]
    fn file_logging_defaults_on_and_can_be_disabled() {
        let cli = Cli::try_parse_from(["mcp-host-evals", "stdio"]).expect("parse");
        assert_eq!(cli.logs.dir(), Some(std::path::Path::new("logs")));

        let cli = Cli::try_parse_from(["mcp-host-evals", "stdio", "--log-dir", "/tmp/evals"]).expect("parse");
        assert_eq!(cli.logs.dir(), Some(std::path::Path::new("/tmp/evals")));

        let cli = Cli::try_parse_from(["mcp-host-evals", "http", "--no-log-files"]).expect("parse");
        assert_eq!(cli.logs.dir(), None);
    }

    #[test]
    fn timeouts_are_global_flags() {
        let cli = Cli::try_parse_from(["mcp-host-evals", "stdio", "--callback-timeout-secs", "2"])
            .expect("parse");
        assert!(matches!(cli.command, Command::Stdio));
        assert_eq!(cli.harness.config().policy.callback_window, Duration::from_secs(2));
    }
}
