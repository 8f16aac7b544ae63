//! Operator commands and their replies.

use crate::engine::{Engine, Status};
use crate::types::{Check, CheckStatus};
use thiserror::Error;

const DAY_MS: f64 = 86_400_000.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    RefreshNet,
    Refresh(Option<String>),
    Check(Option<String>),
    RefreshAll,
    Info,
    Expired,
    ExpiringSoon,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Please provide a server argument")]
    MissingArgument,
    #[error("No such server")]
    NoSuchServer,
    #[error("Please `refresh` the server, as it has not been processed yet.")]
    NotProcessed,
}

impl Command {
    /// Parse a channel message; `None` unless it is a known command.
    pub fn parse(message: &str, prefix: &str) -> Option<Self> {
        if message.len() <= prefix.len() {
            return None;
        }
        let mut args = message.strip_prefix(prefix)?.split_whitespace();
        let name = args.next()?;
        let arg = args.next().map(str::to_string);
        Some(match name {
            "help" => Command::Help,
            "refreshnet" => Command::RefreshNet,
            "refresh" => Command::Refresh(arg),
            "check" => Command::Check(arg),
            "refreshall" => Command::RefreshAll,
            "info" => Command::Info,
            "expired" => Command::Expired,
            "expiringsoon" => Command::ExpiringSoon,
            _ => return None,
        })
    }
}

/// Carry out `command` and return the reply lines.
pub fn execute(engine: &mut Engine, command: Command, now: i64) -> Vec<String> {
    let result = match command {
        Command::Help => Ok(help()),
        Command::RefreshNet => Ok(vec!["Please wait...".to_string()]),
        Command::Refresh(server) => server
            .ok_or(CommandError::MissingArgument)
            .and_then(|server| engine.refresh(&server))
            .map(|jobs| vec![format!("Added {} jobs", jobs)]),
        Command::RefreshAll => {
            let (jobs, servers) = engine.refresh_all();
            Ok(vec![format!("Added {} jobs ({} servers)", jobs, servers)])
        }
        Command::Check(server) => server
            .ok_or(CommandError::MissingArgument)
            .and_then(|server| {
                let checks = engine.check(&server)?;
                Ok(check_report(&server, checks, now))
            }),
        Command::Info => Ok(info_report(&engine.status(), now)),
        Command::Expired => Ok(expiry_list(
            "Certificates that expired:",
            engine.expired(now),
            |ts| format!("{:.2}d ago", (now - ts) as f64 / DAY_MS),
        )),
        Command::ExpiringSoon => Ok(expiry_list(
            "Certificates expiring soon:",
            engine.expiring_soon(now),
            |ts| format!("in {:.2}d", (ts - now) as f64 / DAY_MS),
        )),
    };
    result.unwrap_or_else(|e| vec![format!("ERROR: {}", e)])
}

fn help() -> Vec<String> {
    [
        "CertServ is a utility to view information about certificate expiry.",
        "  help: Get this message",
        "  refreshnet: Refresh network state",
        "  refresh <server>: Refresh a server",
        "  check <server>: Check a server",
        "  refreshall: Refresh all servers",
        "  info: Show information about the bot, and statistics",
        "  expired: Show expired certificates",
        "  expiringsoon: Show certificates expiring in 7 days",
    ]
    .iter()
    .map(|line| line.to_string())
    .collect()
}

fn check_report(server: &str, checks: &[Check], now: i64) -> Vec<String> {
    let mut lines = vec![format!("Server information for {}:", server)];
    let mut seen_invalid = false;
    for check in checks {
        let addr = if check.addr == server {
            format!("Port {} ({})", check.port, check.link)
        } else {
            format!("{}:{} ({})", check.addr, check.port, check.link)
        };
        let expiry = check.expiry.as_deref().unwrap_or("unknown");
        let detail = match (check.status, check.expiry_ts) {
            (CheckStatus::Success, Some(ts)) if ts > now => {
                let valid = check.valid.unwrap_or(false);
                seen_invalid |= !valid;
                format!(
                    "Expires in {:.2}d ({}){}",
                    (ts - now) as f64 / DAY_MS,
                    expiry,
                    if valid { "" } else { " (!)" }
                )
            }
            (CheckStatus::Success, Some(ts)) => {
                format!("Expired {:.2}d ago ({})", (now - ts) as f64 / DAY_MS, expiry)
            }
            (CheckStatus::Success, None) | (CheckStatus::Error, _) => {
                "Encountered error while connecting".to_string()
            }
            (CheckStatus::Timeout, _) => "Timed out while connecting".to_string(),
        };
        lines.push(format!("  {}: {}", addr, detail));
    }
    if seen_invalid {
        lines.push("(!): Self signed, wrong domain or something else".to_string());
    }
    lines
}

fn info_report(status: &Status, now: i64) -> Vec<String> {
    let plural = |n: usize| if n == 1 { "" } else { "s" };
    let mut lines = vec![format!("CertServ version {}", env!("CARGO_PKG_VERSION"))];
    if status.discovery_pending > 0 {
        lines.push(format!(
            "Network refresh: Waiting for {} server{}",
            status.discovery_pending,
            plural(status.discovery_pending)
        ));
    } else if status.discovery_in_progress {
        lines.push("Network refresh: Waiting...".to_string());
    }
    if status.queued > 0 || status.in_flight > 0 {
        lines.push(format!("Expiry refresh: {} in queue", status.queued));
        lines.push(format!(
            "Expiry refresh: Waiting for {} connection{}",
            status.in_flight,
            plural(status.in_flight)
        ));
        lines.push(format!(
            "Expiry refresh: Processing {} job{} per second",
            status.rate,
            if status.rate == 1.0 { "" } else { "s" }
        ));
    }
    lines.push(format!("Network state: {} servers", status.network_servers));
    lines.push(format!(
        "Network state: Last updated {:.2}m ago",
        (now - status.network_last_updated) as f64 / 60_000.0
    ));
    lines.push(format!("Expiry state: {} servers", status.expiry_servers));
    lines.push(format!(
        "Expiry state: Last updated {:.2}h ago",
        (now - status.expiry_last_updated) as f64 / 3_600_000.0
    ));
    if status.stale_transient {
        lines.push("WARNING: No jobs are running but a transient state exists".to_string());
    }
    lines
}

fn expiry_list(
    title: &str,
    entries: Vec<(String, Check)>,
    when: impl Fn(i64) -> String,
) -> Vec<String> {
    let mut lines = vec![title.to_string()];
    for (server, check) in &entries {
        let via = if *server == check.addr {
            String::new()
        } else {
            format!(" ({})", server)
        };
        let ts = check.expiry_ts.unwrap_or_default();
        lines.push(format!(
            "  {}:{}{} ({}), {}",
            check.addr,
            check.port,
            via,
            check.link,
            when(ts)
        ));
    }
    if entries.is_empty() {
        lines.push("None! \\o/".to_string());
    }
    lines
}
