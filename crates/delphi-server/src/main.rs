//! delphi-server binary.
//!
//! ## Usage
//!
//! ```bash
//! # Anthropic API (needs ANTHROPIC_API_KEY)
//! delphi-server --addr 0.0.0.0:5640
//!
//! # Claude CLI subscription, debug logging
//! delphi-server --backend claude-cli --debug
//!
//! # Local Ollama daemon
//! delphi-server --backend ollama --ollama-url http://localhost:11434
//! ```
//!
//! Mount with `9pfuse localhost:5640 /mnt/llm`, then
//! `echo "hi" > /mnt/llm/ask && cat /mnt/llm/ask`.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use delphi_llm::{AnthropicBackend, Backend, CliBackend, OllamaBackend, SessionManager};
use delphi_server::{build_root, Server, DEFAULT_PORT};
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn print_usage() {
    eprintln!(
        r#"delphi-server - serve an LLM as a 9P2000 filesystem

USAGE:
    delphi-server [OPTIONS]

OPTIONS:
    --addr <ADDR>          Listen address (default: 0.0.0.0:{port})
    --backend <NAME>       anthropic | claude-cli | ollama
                           (default: anthropic if ANTHROPIC_API_KEY is set,
                           else claude-cli)
    --ollama-url <URL>     Ollama base URL (default: http://localhost:11434)
    --debug                Log every T-/R-message summary line
    --help, -h             Show this help

ENVIRONMENT:
    ANTHROPIC_API_KEY      Credential for the anthropic backend

EXAMPLES:
    ANTHROPIC_API_KEY=sk-... delphi-server
    delphi-server --backend ollama --addr 127.0.0.1:5640
    9pfuse localhost:{port} /mnt/llm
"#,
        port = DEFAULT_PORT
    );
}

struct Options {
    addr: String,
    backend: Option<String>,
    ollama_url: String,
    debug: bool,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        addr: format!("0.0.0.0:{DEFAULT_PORT}"),
        backend: None,
        ollama_url: String::new(),
        debug: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" => {
                let value = args.get(i + 1).ok_or("--addr requires a value")?;
                // Accept the Plan 9 habit of ":5640" for "every interface".
                options.addr = if let Some(port) = value.strip_prefix(':') {
                    format!("0.0.0.0:{port}")
                } else {
                    value.clone()
                };
                i += 2;
            }
            "--backend" => {
                options.backend = Some(args.get(i + 1).ok_or("--backend requires a value")?.clone());
                i += 2;
            }
            "--ollama-url" => {
                options.ollama_url = args.get(i + 1).ok_or("--ollama-url requires a value")?.clone();
                i += 2;
            }
            "--debug" => {
                options.debug = true;
                i += 1;
            }
            other => return Err(format!("unknown option: {other}")),
        }
    }
    Ok(options)
}

fn build_backend(options: &Options) -> Result<Arc<dyn Backend>, String> {
    let api_key = env::var("ANTHROPIC_API_KEY").ok();

    let name = match &options.backend {
        Some(name) => name.clone(),
        None if api_key.is_some() => "anthropic".to_string(),
        None => "claude-cli".to_string(),
    };

    match name.as_str() {
        "anthropic" => {
            let key = api_key.ok_or("ANTHROPIC_API_KEY environment variable not set")?;
            Ok(Arc::new(AnthropicBackend::new(&key)))
        }
        "claude-cli" => Ok(Arc::new(CliBackend::new())),
        "ollama" => Ok(Arc::new(OllamaBackend::new(&options.ollama_url))),
        other => Err(format!(
            "unknown backend: {other} (expected anthropic, claude-cli, or ollama)"
        )),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {e}");
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let default_level = if options.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let backend = match build_backend(&options) {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let sessions = SessionManager::new(backend);
    let root = build_root(sessions);
    let mut server = Server::new(root);
    server.set_debug(options.debug);
    let server = Arc::new(server);

    let listener = match TcpListener::bind(&options.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Error: failed to listen on {}: {e}", options.addr);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(addr = %options.addr, "delphi listening");
    tracing::info!("mount with: 9pfuse {} /mnt/llm", options.addr);

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server error");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    ExitCode::SUCCESS
}
