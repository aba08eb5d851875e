// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # AuditChain CLI
//!
//! Entry point for the `auditchain` binary. Every invocation is one short
//! session against a durable staging file, so entries logged by separate
//! processes accumulate until a flush commits them.
//!
//! - `log`     stage one JSON entry (optionally followed by a policy flush)
//! - `flush`   commit pending entries as one chain link
//! - `history` walk the chain back and print it oldest first
//! - `head`    show the output the next flush would spend
//! - `discard` drop pending entries
//! - `version` print build version information

mod cli;
mod logging;
mod signer;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use auditchain_protocol::chain::ChainServices;
use auditchain_protocol::client::{Network, WhatsOnChainClient};
use auditchain_protocol::codec::DecodedPayload;
use auditchain_protocol::config::{AuditConfig, StagingMode, PROTOCOL_VERSION};
use auditchain_protocol::metrics::AuditMetrics;
use auditchain_protocol::storage::HeadCache;
use auditchain_protocol::{AuditLogger, FlushOutcome};

use cli::{AuditCli, Commands, GlobalArgs};
use logging::LogFormat;
use signer::ExternalSigner;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = AuditCli::parse();

    if let Commands::Version = cli.command {
        print_version();
        return Ok(());
    }

    logging::init_logging(logging::DEFAULT_DIRECTIVES, LogFormat::from(cli.global.log_format));

    let config = load_config(&cli.global)?;
    let metrics = AuditMetrics::new().context("failed to register metrics")?;
    let (mut logger, can_sign) = open_session(&cli.global, config, metrics.clone())?;

    let result = run_command(&mut logger, cli.command, can_sign).await;

    if cli.global.dump_metrics {
        match metrics.encode() {
            Ok(text) => eprint!("{text}"),
            Err(e) => tracing::warn!(error = %e, "metrics exposition failed"),
        }
    }
    result
}

async fn run_command(logger: &mut AuditLogger, command: Commands, can_sign: bool) -> Result<()> {
    match command {
        Commands::Log(args) => {
            let raw = match args.entry {
                Some(raw) => raw,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read entry from stdin")?;
                    buf
                }
            };
            let value: serde_json::Value =
                serde_json::from_str(raw.trim()).context("entry is not valid JSON")?;
            logger.log_value(value).context("failed to stage entry")?;
            eprintln!("staged ({} pending)", logger.pending().len());

            if args.flush {
                require_signer(can_sign)?;
                let outcome = logger.flush().await.context("flush failed")?;
                report_flush(&outcome);
            }
        }
        Commands::Flush(args) => {
            require_signer(can_sign)?;
            let outcome = if args.force {
                logger.force_flush().await
            } else {
                logger.flush().await
            }
            .context("flush failed")?;
            report_flush(&outcome);
        }
        Commands::History(args) => {
            let records = match args.from.as_deref() {
                Some(txid) => logger.history_from(txid).await,
                None => logger.history().await,
            }
            .context("history read failed")?;

            for record in &records {
                if args.json {
                    println!("{}", serde_json::to_string(record)?);
                    continue;
                }
                match &record.payload {
                    DecodedPayload::Batch { batch, encoding } => {
                        println!(
                            "{}  {}  agent={} entries={} ({:?})",
                            record.txid,
                            batch.timestamp.to_rfc3339(),
                            batch.agent_id,
                            batch.entries.len(),
                            encoding,
                        );
                        for entry in &batch.entries {
                            println!(
                                "    {}  {}",
                                entry.ts.to_rfc3339(),
                                serde_json::Value::Object(entry.fields.clone())
                            );
                        }
                    }
                    DecodedPayload::Raw { hex, reason } => {
                        println!("{}  raw ({} bytes): {}", record.txid, hex.len() / 2, reason);
                    }
                }
            }
            eprintln!("{} link(s)", records.len());
        }
        Commands::Head => match logger.current_head().await.context("head lookup failed")? {
            Some(head) => println!("{}:{}  {} sats", head.txid, head.output_index, head.value),
            None => bail!("no spendable output for {}; fund it first", logger.address()),
        },
        Commands::Discard => {
            let dropped = logger.discard().context("failed to discard pending entries")?;
            eprintln!("discarded {dropped} pending entr{}", if dropped == 1 { "y" } else { "ies" });
        }
        Commands::Version => print_version(),
    }
    Ok(())
}

/// Reads the optional config file and applies flag overrides. The CLI always
/// stages durably: each invocation is its own process.
fn load_config(args: &GlobalArgs) -> Result<AuditConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str::<AuditConfig>(&raw)
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => AuditConfig::default(),
    };

    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    if let Some(min) = args.min_batch_size {
        config.min_batch_size = min;
    }
    if let Some(agent_id) = &args.agent_id {
        config.agent_id = agent_id.clone();
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.network_timeout_ms = timeout_ms;
    }
    config.staging_mode = StagingMode::Durable;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

fn staging_path(args: &GlobalArgs) -> PathBuf {
    args.staging
        .clone()
        .unwrap_or_else(|| args.data_dir.join("staging.json"))
}

fn open_session(
    args: &GlobalArgs,
    config: AuditConfig,
    metrics: AuditMetrics,
) -> Result<(AuditLogger, bool)> {
    let address = args
        .address
        .clone()
        .context("an address is required (--address or AUDITCHAIN_ADDRESS)")?;
    let locking_script = match &args.locking_script {
        Some(script) => hex::decode(script.trim()).context("locking script is not valid hex")?,
        None => Vec::new(),
    };
    let key = ExternalSigner::new(address, locking_script, args.signer.as_deref());
    let can_sign = key.can_sign();

    let client = http_client(args, config.network_timeout())?;
    let cache = open_cache(&args.data_dir)?;
    let staging = staging_path(args);

    tracing::debug!(
        data_dir = %args.data_dir.display(),
        staging = %staging.display(),
        api = client.base_url(),
        "session resources ready"
    );

    let logger = AuditLogger::builder(config, Arc::new(key))
        .services(ChainServices::from_backend(Arc::new(client)))
        .cache(cache)
        .staging_path(staging)
        .metrics(metrics)
        .build()
        .context("failed to start audit session")?;
    Ok((logger, can_sign))
}

fn http_client(args: &GlobalArgs, timeout: Duration) -> Result<WhatsOnChainClient> {
    let client = match &args.api_url {
        Some(url) => WhatsOnChainClient::with_base_url(url.clone(), timeout),
        None => {
            let network: Network = args.network.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            WhatsOnChainClient::new(network, timeout)
        }
    };
    client.context("failed to build HTTP client")
}

fn open_cache(data_dir: &Path) -> Result<HeadCache> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let path = data_dir.join("heads");
    HeadCache::open(&path).with_context(|| format!("failed to open head cache at {}", path.display()))
}

fn require_signer(can_sign: bool) -> Result<()> {
    if !can_sign {
        bail!("flushing needs --signer and --locking-script (or AUDITCHAIN_SIGNER / AUDITCHAIN_LOCKING_SCRIPT)");
    }
    Ok(())
}

fn report_flush(outcome: &FlushOutcome) {
    match outcome {
        FlushOutcome::Committed(receipt) => {
            tracing::info!(
                txid = %receipt.txid,
                entries = receipt.entries,
                payload_bytes = receipt.payload_bytes,
                change = receipt.new_head.value,
                "link committed"
            );
            println!("{}", receipt.txid);
        }
        FlushOutcome::Deferred { pending } => {
            eprintln!("deferred: {pending} pending, below the session threshold");
        }
        FlushOutcome::Empty => eprintln!("nothing to flush"),
    }
}

fn print_version() {
    println!("auditchain {}", env!("CARGO_PKG_VERSION"));
    println!("protocol   {}", PROTOCOL_VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditchain_protocol::config::FlushMode;

    fn args(extra: &[&str]) -> GlobalArgs {
        let mut argv = vec!["auditchain"];
        argv.extend_from_slice(extra);
        argv.push("head");
        AuditCli::try_parse_from(argv).unwrap().global
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"mode":"session","min_batch_size":10,"agent_id":"file-agent"}"#)
            .unwrap();

        let config = load_config(&args(&[
            "--config",
            path.to_str().unwrap(),
            "--min-batch-size",
            "3",
        ]))
        .unwrap();
        assert_eq!(config.mode, FlushMode::Session);
        assert_eq!(config.min_batch_size, 3);
        assert_eq!(config.agent_id, "file-agent");
        assert_eq!(config.staging_mode, StagingMode::Durable);
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        assert!(load_config(&args(&["--min-batch-size", "0"])).is_err());
    }

    #[test]
    fn staging_defaults_into_the_data_dir() {
        let global = args(&["--data-dir", "/var/lib/auditchain"]);
        assert_eq!(staging_path(&global), PathBuf::from("/var/lib/auditchain/staging.json"));
    }

    #[test]
    fn session_opens_without_a_signer() {
        let dir = tempfile::tempdir().unwrap();
        let global = args(&[
            "--address",
            "1Agent",
            "--data-dir",
            dir.path().to_str().unwrap(),
        ]);
        let config = load_config(&global).unwrap();
        let (logger, can_sign) = open_session(&global, config, AuditMetrics::new().unwrap()).unwrap();
        assert!(!can_sign);
        assert_eq!(logger.address(), "1Agent");
        assert!(dir.path().join("heads").exists());
    }
}
