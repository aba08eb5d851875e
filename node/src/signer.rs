//! # External Signer
//!
//! A [`KeyService`] that never sees the private key. Each signing request is
//! handed to a separate program: the `SignRequest` goes to its stdin as one
//! JSON document, and the unlocking script comes back on stdout as hex.
//!
//! ```text
//! auditchain --signer "bsv-sign --key-file ~/.keys/agent.wif" flush
//! ```
//!
//! The writer bounds the whole exchange with its own timeout; a signer that
//! hangs is killed when the future is dropped.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use auditchain_protocol::chain::KeyService;
use auditchain_protocol::error::{AuditError, AuditResult};
use auditchain_protocol::transaction::{SigningContext, UnlockingProof};

/// Delegates signing to an external command.
#[derive(Debug, Clone)]
pub struct ExternalSigner {
    address: String,
    locking_script: Vec<u8>,
    command: Option<Vec<String>>,
}

impl ExternalSigner {
    /// `command` is split on whitespace into program and arguments. `None`
    /// yields a key that can read and stage but refuses to sign.
    pub fn new(address: impl Into<String>, locking_script: Vec<u8>, command: Option<&str>) -> Self {
        let command = command
            .map(|c| c.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|parts| !parts.is_empty());
        Self {
            address: address.into(),
            locking_script,
            command,
        }
    }

    pub fn can_sign(&self) -> bool {
        self.command.is_some() && !self.locking_script.is_empty()
    }
}

#[async_trait]
impl KeyService for ExternalSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn locking_script(&self) -> Vec<u8> {
        self.locking_script.clone()
    }

    async fn sign(&self, ctx: &SigningContext) -> AuditResult<UnlockingProof> {
        let parts = self
            .command
            .as_ref()
            .ok_or_else(|| AuditError::Signing("no signer command configured".to_string()))?;
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| AuditError::Signing("empty signer command".to_string()))?;

        let request = serde_json::to_vec(&ctx.to_request()?)
            .map_err(|e| AuditError::Signing(format!("cannot encode sign request: {e}")))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AuditError::Signing(format!("cannot start signer {program}: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&request)
                .await
                .map_err(|e| AuditError::Signing(format!("cannot write to signer: {e}")))?;
            // Closing stdin tells the signer the request is complete.
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AuditError::Signing(format!("signer did not finish: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AuditError::Signing(format!(
                "signer exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        tracing::debug!(address = %self.address, bytes = stdout.trim().len() / 2, "signer answered");
        UnlockingProof::from_hex(stdout.trim())
    }
}
