//! Line-oriented administrative console.
//!
//! Credential prompts are states of the console rather than blocking reads:
//! the next line from stdin answers the pending prompt, so file events keep
//! flowing while the administrator types.

use std::io::{self, Write};

use lockdown_core::error::CredentialError;
use lockdown_core::event_log::EventSeverity;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::engine::Engine;

const HELP: &str = "\
=== File Protection System ===
Available commands:
  help    - Show this help message
  enable  - Enable file protection
  disable - Disable file protection (requires credential)
  change  - Change credential
  status  - Show current protection status
  stop    - Stop the program
==============================";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

enum Pending {
    Command,
    DisableCredential,
    CurrentCredential,
    NewCredential { current: Zeroizing<String> },
}

pub struct AdminConsole {
    pending: Pending,
}

impl Default for AdminConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminConsole {
    pub fn new() -> Self {
        Self {
            pending: Pending::Command,
        }
    }

    pub fn print_help(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "{HELP}")
    }

    /// Whether the next line will be read as a credential.
    pub fn awaiting_credential(&self) -> bool {
        !matches!(self.pending, Pending::Command)
    }

    pub fn handle_line(
        &mut self,
        engine: &mut Engine,
        line: &str,
        out: &mut impl Write,
    ) -> io::Result<Flow> {
        let line = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
        match std::mem::replace(&mut self.pending, Pending::Command) {
            Pending::Command => self.dispatch(engine, line.trim(), out),
            Pending::DisableCredential => {
                finish_disable(engine, &line, out)?;
                Ok(Flow::Continue)
            }
            Pending::CurrentCredential => {
                write!(out, "Enter new credential: ")?;
                out.flush()?;
                self.pending = Pending::NewCredential { current: line };
                Ok(Flow::Continue)
            }
            Pending::NewCredential { current } => {
                finish_change(engine, &current, &line, out)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn dispatch(&mut self, engine: &mut Engine, cmd: &str, out: &mut impl Write) -> io::Result<Flow> {
        match cmd {
            "" => {}
            "help" => self.print_help(out)?,
            "enable" => {
                let report = engine.enable();
                info!(locked = report.processed, "administrator enabled protection");
                writeln!(out, "Protection enabled.")?;
            }
            "disable" => {
                write!(out, "Enter credential: ")?;
                out.flush()?;
                self.pending = Pending::DisableCredential;
            }
            "change" => {
                write!(out, "Enter current credential: ")?;
                out.flush()?;
                self.pending = Pending::CurrentCredential;
            }
            "status" => write_status(engine, out)?,
            "stop" => {
                writeln!(out, "Stopping file protection system...")?;
                return Ok(Flow::Stop);
            }
            other => {
                warn!(command = other, "unknown command");
                writeln!(out, "Unknown command '{other}'. Type 'help' for available commands.")?;
            }
        }
        Ok(Flow::Continue)
    }
}

fn write_status(engine: &Engine, out: &mut impl Write) -> io::Result<()> {
    let policy = engine.policy();
    writeln!(out, "Protection status: {}", engine.state())?;
    writeln!(out, "Protected directory: {}", policy.root().display())?;
    if let Some(source) = policy.source() {
        writeln!(out, "Configuration: {}", source.display())?;
    }
    let patterns: Vec<&str> = policy.patterns().collect();
    writeln!(out, "Patterns ({}): {}", patterns.len(), patterns.join(" "))?;
    writeln!(
        out,
        "Watched directories: {}/{}",
        engine.registry().len(),
        engine.registry().capacity()
    )?;

    let Some(journal) = engine.journal() else {
        return Ok(());
    };
    match journal.verify_chain() {
        Ok(count) => writeln!(
            out,
            "Journal: {} ({count} entries, chain intact)",
            journal.path().display()
        )?,
        Err(e) => {
            warn!(error = %e, "journal chain verification failed");
            writeln!(out, "Journal: {} (chain broken: {e})", journal.path().display())?;
        }
    }
    if let Ok(recent) = journal.read_recent(None, Some(1)) {
        if let Some(last) = recent.first() {
            writeln!(
                out,
                "Last event: {} at {}",
                last.event_type,
                last.timestamp.to_rfc3339()
            )?;
        }
    }
    Ok(())
}

fn finish_disable(engine: &mut Engine, candidate: &str, out: &mut impl Write) -> io::Result<()> {
    if !engine.policy().verify_credential(candidate) {
        warn!("rejected credential for disable");
        engine.record(
            "CREDENTIAL_REJECTED",
            EventSeverity::Warn,
            serde_json::json!({"action": "disable"}),
        );
        return writeln!(out, "Incorrect credential.");
    }
    let report = engine.disable();
    info!(restored = report.processed, failed = report.failed, "administrator disabled protection");
    writeln!(out, "Protection disabled.")
}

fn finish_change(
    engine: &mut Engine,
    current: &str,
    new: &str,
    out: &mut impl Write,
) -> io::Result<()> {
    match engine.policy_mut().rotate_credential(current, new) {
        Ok(()) => {
            engine.record("CREDENTIAL_ROTATED", EventSeverity::Info, serde_json::json!({}));
            writeln!(out, "Credential changed successfully.")
        }
        Err(CredentialError::Rejected) => {
            warn!("rejected credential for change");
            engine.record(
                "CREDENTIAL_REJECTED",
                EventSeverity::Warn,
                serde_json::json!({"action": "change"}),
            );
            writeln!(out, "Incorrect credential.")
        }
        Err(e) => {
            warn!(error = %e, "credential change failed");
            writeln!(out, "Failed to change credential: {e}")
        }
    }
}
