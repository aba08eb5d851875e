//! # CLI Interface
//!
//! Command-line structure for the `auditchain` binary, via `clap` derive.
//! Global options describe the session (address, network, local state);
//! subcommands act on it.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use auditchain_protocol::config::FlushMode;

/// AuditChain agent audit log.
///
/// Stages structured log entries locally and commits them as a chain of
/// transactions on BSV, one link per flush.
#[derive(Parser, Debug)]
#[command(
    name = "auditchain",
    about = "Tamper-evident agent audit logs on BSV",
    version,
    propagate_version = true
)]
pub struct AuditCli {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// JSON session configuration. Flags below override its fields.
    #[arg(long, short = 'c', global = true, env = "AUDITCHAIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address whose chain is written and read.
    #[arg(long, short = 'a', global = true, env = "AUDITCHAIN_ADDRESS")]
    pub address: Option<String>,

    /// Locking script for change outputs, hex. Required to flush.
    #[arg(long, global = true, env = "AUDITCHAIN_LOCKING_SCRIPT")]
    pub locking_script: Option<String>,

    /// Signer command. Receives the sign request as JSON on stdin and must
    /// print the unlocking script as hex.
    #[arg(long, global = true, env = "AUDITCHAIN_SIGNER")]
    pub signer: Option<String>,

    /// Network to talk to: mainnet or testnet.
    #[arg(long, global = true, env = "AUDITCHAIN_NETWORK", default_value = "mainnet")]
    pub network: String,

    /// Override the WhatsOnChain API base URL.
    #[arg(long, global = true, env = "AUDITCHAIN_API_URL")]
    pub api_url: Option<String>,

    /// Directory for the head cache and the default staging file.
    #[arg(
        long,
        short = 'd',
        global = true,
        env = "AUDITCHAIN_DATA_DIR",
        default_value = ".auditchain"
    )]
    pub data_dir: PathBuf,

    /// Staging file for pending entries. Defaults to `<data-dir>/staging.json`.
    #[arg(long, global = true, env = "AUDITCHAIN_STAGING")]
    pub staging: Option<PathBuf>,

    /// Flush policy override.
    #[arg(long, global = true, env = "AUDITCHAIN_MODE", value_enum)]
    pub mode: Option<ModeArg>,

    /// Session-mode batch threshold override.
    #[arg(long, global = true, env = "AUDITCHAIN_MIN_BATCH_SIZE")]
    pub min_batch_size: Option<usize>,

    /// Agent identifier override.
    #[arg(long, global = true, env = "AUDITCHAIN_AGENT_ID")]
    pub agent_id: Option<String>,

    /// Per-call network timeout override, in milliseconds.
    #[arg(long, global = true, env = "AUDITCHAIN_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Log format on stderr.
    #[arg(long, global = true, env = "AUDITCHAIN_LOG_FORMAT", value_enum, default_value = "pretty")]
    pub log_format: LogFormatArg,

    /// Print the Prometheus text exposition to stderr before exiting.
    #[arg(long, global = true)]
    pub dump_metrics: bool,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stage one entry.
    Log(LogArgs),
    /// Commit pending entries to the chain.
    Flush(FlushArgs),
    /// Print the committed history, oldest first.
    History(HistoryArgs),
    /// Show the current chain head.
    Head,
    /// Drop pending entries without committing them.
    Discard,
    /// Print version information and exit.
    Version,
}

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Entry as a JSON object. Read from stdin when omitted.
    pub entry: Option<String>,

    /// Run a policy flush after staging.
    #[arg(long)]
    pub flush: bool,
}

#[derive(Args, Debug)]
pub struct FlushArgs {
    /// Commit regardless of the flush policy.
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Walk back from this transaction instead of the address's head.
    #[arg(long)]
    pub from: Option<String>,

    /// One JSON document per link instead of a readable listing.
    #[arg(long)]
    pub json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Immediate,
    Session,
}

impl From<ModeArg> for FlushMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Immediate => FlushMode::Immediate,
            ModeArg::Session => FlushMode::Session,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Json,
}
