//! Heuristic scoring of lifecycle script command text.
//!
//! Every category is independent: a command collects the weight of each
//! category it trips, with no cap and no mutual exclusion.

use regex::Regex;
use std::sync::OnceLock;

/// Scores at or above this are treated as high confidence by the issue
/// tracker gate. Chat channels ignore it.
pub const HIGH_CONFIDENCE_SCORE: u32 = 10;

#[derive(Debug, Clone, Copy)]
enum Trigger {
  Any(&'static [&'static str]),
  AllOf(&'static str, &'static [&'static str]),
  Ipv4Literal,
}

#[derive(Debug, Clone, Copy)]
pub struct Category {
  pub id: &'static str,
  pub title: &'static str,
  pub weight: u32,
  trigger: Trigger,
}

pub const CATEGORIES: &[Category] = &[
  Category {
    id: "shell_pipe",
    title: "Direct pipe into a shell",
    weight: 15,
    trigger: Trigger::Any(&["| bash", "| sh", "| zsh"]),
  },
  Category {
    id: "downloader",
    title: "Downloader invocation",
    weight: 8,
    trigger: Trigger::Any(&["curl ", "wget "]),
  },
  Category {
    id: "shell_interpreter",
    title: "Windows shell interpreter",
    weight: 5,
    trigger: Trigger::Any(&["cmd.exe", "powershell"]),
  },
  Category {
    id: "dynamic_eval",
    title: "Dynamic evaluation",
    weight: 5,
    trigger: Trigger::Any(&["eval(", "exec("]),
  },
  Category {
    id: "one_liner",
    title: "Scripting one-liner",
    weight: 5,
    trigger: Trigger::Any(&["python -c", "perl -e", "node -e"]),
  },
  Category {
    id: "base64",
    title: "Obfuscation marker",
    weight: 4,
    trigger: Trigger::Any(&["base64"]),
  },
  Category {
    id: "ipv4_literal",
    title: "Literal IPv4 address",
    weight: 8,
    trigger: Trigger::Ipv4Literal,
  },
  Category {
    id: "destructive_delete",
    title: "Recursive delete of a path",
    weight: 3,
    trigger: Trigger::AllOf("rm -rf", &["/", "~"]),
  },
  Category {
    id: "network_recon",
    title: "Network reconnaissance",
    weight: 2,
    trigger: Trigger::Any(&["nslookup", "dig ", "ping "]),
  },
  Category {
    id: "host_recon",
    title: "Host identity reconnaissance",
    weight: 2,
    trigger: Trigger::Any(&["whoami", "hostname", "uname"]),
  },
  Category {
    id: "id_query",
    title: "Numeric user/group id query",
    weight: 2,
    trigger: Trigger::AllOf("id", &[" -u", " -g"]),
  },
  Category {
    id: "env_dump",
    title: "Environment dump",
    weight: 5,
    trigger: Trigger::Any(&["env", "printenv"]),
  },
  Category {
    id: "dev_identity",
    title: "Developer identity probe",
    weight: 4,
    trigger: Trigger::Any(&["git config", "npm whoami", "npm config"]),
  },
  Category {
    id: "cloud_credentials",
    title: "Cloud credential probe",
    weight: 8,
    trigger: Trigger::Any(&["aws configure", "gcloud config", "az account"]),
  },
  Category {
    id: "system_credentials",
    title: "System credential files",
    weight: 10,
    trigger: Trigger::Any(&["/etc/passwd", "/etc/shadow"]),
  },
  Category {
    id: "user_secrets",
    title: "User secret files",
    weight: 10,
    trigger: Trigger::Any(&[".ssh/", ".bash_history"]),
  },
];

fn ipv4_pattern() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  // Constant pattern; compiling it cannot fail.
  RE.get_or_init(|| Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}").expect("ipv4 pattern"))
}

impl Category {
  fn matches(&self, original: &str, lower: &str) -> bool {
    match self.trigger {
      Trigger::Any(needles) => needles.iter().any(|n| lower.contains(n)),
      Trigger::AllOf(required, any_of) => {
        lower.contains(required) && any_of.iter().any(|n| lower.contains(n))
      }
      Trigger::Ipv4Literal => ipv4_pattern().is_match(original),
    }
  }
}

/// Categories tripped by `cmd`, in table order.
pub fn matched_categories(cmd: Option<&str>) -> Vec<&'static Category> {
  let Some(cmd) = cmd.filter(|c| !c.is_empty()) else {
    return Vec::new();
  };
  let lower = cmd.to_lowercase();
  CATEGORIES
    .iter()
    .filter(|c| c.matches(cmd, &lower))
    .collect()
}

pub fn score(cmd: Option<&str>) -> u32 {
  matched_categories(cmd).iter().map(|c| c.weight).sum()
}
