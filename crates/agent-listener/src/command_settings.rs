// Listener command-line parsing: one optional verb, boolean flags, and
// `--key value` options. Secret-bearing options are masked before any
// argument string reaches a trace sink.

use std::collections::{HashMap, HashSet};

/// Verbs the listener understands.
const COMMANDS: &[&str] = &[
    "configure",
    "remove",
    "reauth",
    "run",
    "warmup",
    "diagnostics",
];

/// Boolean flags.
const FLAGS: &[&str] = &[
    "version",
    "commit",
    "help",
    "once",
    "replace",
    "unattended",
    "disableupdate",
];

/// `--key value` options.
const ARGS: &[&str] = &["auth", "name", "pool", "token", "url", "work"];

/// Options whose values are secrets.
const SECRET_ARGS: &[&str] = &["token"];

/// Parsed command line for the listener process.
#[derive(Debug, Clone, Default)]
pub struct CommandSettings {
    command: Option<String>,
    flags: HashSet<String>,
    args: HashMap<String, String>,
    unknown: Vec<String>,
}

impl CommandSettings {
    /// Parse from the process arguments.
    pub fn parse() -> Self {
        Self::from_args(std::env::args().skip(1).collect())
    }

    /// Parse from an explicit argument list.
    pub fn from_args(raw: Vec<String>) -> Self {
        let mut settings = CommandSettings::default();
        let mut iter = raw.into_iter().peekable();

        while let Some(arg) = iter.next() {
            if let Some(name) = arg.strip_prefix("--") {
                let name = name.to_lowercase();
                if FLAGS.contains(&name.as_str()) {
                    settings.flags.insert(name);
                } else if ARGS.contains(&name.as_str()) {
                    match iter.next() {
                        Some(value) => {
                            settings.args.insert(name, value);
                        }
                        None => settings.unknown.push(format!("--{name}")),
                    }
                } else {
                    settings.unknown.push(format!("--{name}"));
                }
            } else if settings.command.is_none() && COMMANDS.contains(&arg.to_lowercase().as_str())
            {
                settings.command = Some(arg.to_lowercase());
            } else {
                settings.unknown.push(arg);
            }
        }

        settings
    }

    /// The verb, if one was given; `run` is the default elsewhere.
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Arguments that did not parse; reported before startup proceeds.
    pub fn unknown(&self) -> &[String] {
        &self.unknown
    }

    pub fn is_version(&self) -> bool {
        self.flags.contains("version")
    }

    pub fn is_commit(&self) -> bool {
        self.flags.contains("commit")
    }

    pub fn is_help(&self) -> bool {
        self.flags.contains("help")
    }

    pub fn is_once(&self) -> bool {
        self.flags.contains("once")
    }

    pub fn is_unattended(&self) -> bool {
        self.flags.contains("unattended")
    }

    pub fn is_disable_update(&self) -> bool {
        self.flags.contains("disableupdate")
    }

    pub fn get_url(&self) -> Option<&str> {
        self.args.get("url").map(String::as_str)
    }

    pub fn get_token(&self) -> Option<&str> {
        self.args.get("token").map(String::as_str)
    }

    pub fn get_pool(&self) -> Option<&str> {
        self.args.get("pool").map(String::as_str)
    }

    pub fn get_name(&self) -> Option<&str> {
        self.args.get("name").map(String::as_str)
    }

    pub fn get_work(&self) -> Option<&str> {
        self.args.get("work").map(String::as_str)
    }

    /// The argument map with secret values replaced, safe for tracing.
    pub fn sanitized_args(&self) -> Vec<String> {
        let mut rendered: Vec<String> = self
            .args
            .iter()
            .map(|(name, value)| {
                if SECRET_ARGS.contains(&name.as_str()) {
                    format!("--{name} ***")
                } else {
                    format!("--{name} {value}")
                }
            })
            .collect();
        rendered.extend(self.flags.iter().map(|f| format!("--{f}")));
        rendered.sort();
        rendered
    }
}
