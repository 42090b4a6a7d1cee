use crate::blacklist::{self, BlacklistChange, ConfigStore, FileConfigStore};
use crate::finding_store::FindingStore;
use std::path::Path;

const DEFAULT_FINDINGS_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleAction {
  RunMonitor,
  ExitOk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
  Help,
  BlacklistAdd(String),
  BlacklistRemove(String),
  BlacklistList,
  Findings(usize),
  Run,
}

/// Global flags are ignored here; `--dry-run` is read by the caller.
pub fn parse_command(args: &[String]) -> anyhow::Result<Command> {
  let args: Vec<&str> = args
    .iter()
    .skip(1)
    .map(String::as_str)
    .filter(|a| *a != "--dry-run")
    .collect();

  if args.iter().any(|a| *a == "--help" || *a == "-h") {
    return Ok(Command::Help);
  }

  if let Some(i) = args.iter().position(|a| *a == "--blacklist") {
    let tail = &args[i + 1..];
    let sub = tail.first().copied().unwrap_or("");
    let author = tail.get(1..).unwrap_or_default().join(" ");
    return match sub {
      "add" if !author.trim().is_empty() => Ok(Command::BlacklistAdd(author)),
      "remove" if !author.trim().is_empty() => Ok(Command::BlacklistRemove(author)),
      "list" => Ok(Command::BlacklistList),
      _ => anyhow::bail!("expected: --blacklist add <author> | remove <author> | list"),
    };
  }

  if let Some(i) = args.iter().position(|a| *a == "--findings") {
    let limit = match args.get(i + 1) {
      Some(n) => n
        .parse::<usize>()
        .map_err(|_| anyhow::anyhow!("expected: --findings [N], got `{n}`"))?,
      None => DEFAULT_FINDINGS_LIMIT,
    };
    return Ok(Command::Findings(limit));
  }

  if let Some(unknown) = args.iter().find(|a| a.starts_with('-')) {
    anyhow::bail!("unknown option `{unknown}` (try --help)");
  }
  Ok(Command::Run)
}

pub fn run_console_command(base: &Path, command: Command) -> anyhow::Result<ConsoleAction> {
  match command {
    Command::Help => print_help(),
    Command::BlacklistAdd(author) => {
      let store = FileConfigStore::at_base(base);
      match blacklist::add_author(&store, &author)? {
        BlacklistChange::AlreadyPresent => println!("`{}` is already blacklisted.", author.trim()),
        _ => println!("Blacklisted `{}`. The poller picks this up on its next cycle.", author.trim()),
      }
    }
    Command::BlacklistRemove(author) => {
      let store = FileConfigStore::at_base(base);
      match blacklist::remove_author(&store, &author)? {
        BlacklistChange::NotPresent => println!("`{}` was not blacklisted.", author.trim()),
        _ => println!("Removed `{}` from the blacklist.", author.trim()),
      }
    }
    Command::BlacklistList => {
      let cfg = FileConfigStore::at_base(base).get()?;
      if cfg.blacklisted_authors.is_empty() {
        println!("Blacklist is empty.");
      } else {
        println!("Blacklisted authors ({}):", cfg.blacklisted_authors.len());
        for author in &cfg.blacklisted_authors {
          println!("- {author}");
        }
      }
    }
    Command::Findings(limit) => print_findings(base, limit)?,
    Command::Run => return Ok(ConsoleAction::RunMonitor),
  }
  Ok(ConsoleAction::ExitOk)
}

fn print_findings(base: &Path, limit: usize) -> anyhow::Result<()> {
  let items = FindingStore::at_base(base).list_recent(limit)?;
  if items.is_empty() {
    println!("No findings recorded.");
    return Ok(());
  }

  println!("Last {}/{} findings:", items.len(), limit);
  for rec in items {
    let f = &rec.finding;
    println!(
      "- {} {}@{} (prev {}) {} {} score={} detected_at_unix_ms={}",
      rec.finding_id,
      f.package_name,
      f.latest_version,
      f.previous_version.as_deref().unwrap_or("none"),
      f.script_type,
      f.alert_type,
      f.suspicion_score,
      rec.detected_at_unix_ms
    );
  }
  Ok(())
}

fn print_help() {
  println!("script-watch v{}", env!("CARGO_PKG_VERSION"));
  println!("Watches the registry change feed for new or changed install scripts.");
  println!();
  println!("Usage: script-watch [--dry-run] [command]");
  println!("  (no command)                 run the monitor until Ctrl+C");
  println!("  --dry-run                    log alerts instead of sending them");
  println!("  --blacklist add <author>");
  println!("  --blacklist remove <author>");
  println!("  --blacklist list");
  println!("  --findings [N]               show the N most recent findings (default {DEFAULT_FINDINGS_LIMIT})");
  println!("  --version");
  println!();
  println!("Data directory: ${} (default ./data)", crate::paths::HOME_ENV);
}
