//! muxpool command line client.
//!
//! Sends one request through a [`Transport`] and prints the response as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use muxpool::config::{load_config, TransportConfig};
use muxpool::http::{Headers, Request};
use muxpool::observability::init_logging;
use muxpool::{TcpDialer, Transport, WireCodec};

#[derive(Parser)]
#[command(name = "muxpool")]
#[command(about = "Send requests over pooled exclusive or multiplexed connections", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the response
    Send {
        url: String,

        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request header as `name:value`, repeatable
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Request body
        #[arg(short, long)]
        data: Option<String>,

        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("header '{}' must look like name:value", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header '{}' has an empty name", raw));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[derive(Serialize)]
struct Output<'a> {
    status: u16,
    headers: &'a Headers,
    body: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TransportConfig::default(),
    };
    init_logging(&config.observability.log_level);

    tracing::info!(
        default_mode = %config.default_mode,
        dial_timeout_ms = config.pool.dial_timeout_ms,
        max_frame_size = config.codec.max_frame_size,
        "Configuration loaded"
    );

    let codec = Arc::new(WireCodec::new(config.codec.max_frame_size));
    let transport = Transport::new(config, Arc::new(TcpDialer::new()), codec);

    match cli.command {
        Commands::Send {
            url,
            method,
            headers,
            data,
            timeout_ms,
        } => {
            let mut request = Request::new(&method, &url)?;
            for (name, value) in headers {
                request = request.header(name, value);
            }
            if let Some(data) = data {
                request = request.bytes(data);
            }
            if let Some(ms) = timeout_ms {
                request = request.timeout(Duration::from_millis(ms));
            }

            let result = transport.send(request).await;
            transport.shutdown();
            let response = result?;

            let output = Output {
                status: response.status(),
                headers: response.headers(),
                body: response.text(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_argument_splits_on_first_colon() {
        assert_eq!(
            parse_header("X-Trace: a:b").unwrap(),
            ("X-Trace".to_string(), "a:b".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn cli_parses_send() {
        let cli = Cli::try_parse_from([
            "muxpool",
            "send",
            "http://example.com/",
            "-X",
            "POST",
            "-H",
            "a:1",
            "--data",
            "hi",
            "--timeout-ms",
            "500",
        ])
        .unwrap();
        let Commands::Send {
            method,
            headers,
            timeout_ms,
            ..
        } = cli.command;
        assert_eq!(method, "POST");
        assert_eq!(headers.len(), 1);
        assert_eq!(timeout_ms, Some(500));
    }
}
