//! Console system.
//!
//! Typed console variables plus a parser that turns an input line into a
//! [`ConsoleCommand`]. The console itself performs no game actions: the
//! server and client dispatch the parsed command onto their own operations.
//!
//! ```ignore
//! let mut console = Console::new();
//! console.register_cvar("sv_tickrate", CvarValue::Int(64), "Server tick rate", CvarFlags::NONE);
//! match console.parse("kick 3") {
//!     ConsoleCommand::Kick(id) => { /* ... */ }
//!     _ => {}
//! }
//! ```

use std::collections::BTreeMap;

use anyhow::{bail, Context};

use crate::net::ClientId;

/// Console variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum CvarValue {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
}

impl CvarValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            CvarValue::Int(v) => Some(*v),
            CvarValue::Float(v) => Some(*v as i64),
            CvarValue::Bool(v) => Some(i64::from(*v)),
            CvarValue::String(s) => s.parse().ok(),
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            CvarValue::Float(v) => Some(*v),
            CvarValue::Int(v) => Some(*v as f64),
            CvarValue::String(s) => s.parse().ok(),
            CvarValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            CvarValue::Bool(v) => *v,
            CvarValue::Int(v) => *v != 0,
            CvarValue::Float(v) => *v != 0.0,
            CvarValue::String(s) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
        }
    }

    /// Parses `text` into a value of the same variant as `self`.
    fn parse_like(&self, text: &str) -> anyhow::Result<Self> {
        Ok(match self {
            CvarValue::Int(_) => CvarValue::Int(text.parse().with_context(|| format!("'{text}' is not an integer"))?),
            CvarValue::Float(_) => CvarValue::Float(text.parse().with_context(|| format!("'{text}' is not a number"))?),
            CvarValue::Bool(_) => match text {
                "1" | "true" => CvarValue::Bool(true),
                "0" | "false" => CvarValue::Bool(false),
                _ => bail!("'{text}' is not a boolean"),
            },
            CvarValue::String(_) => CvarValue::String(text.to_string()),
        })
    }
}

impl std::fmt::Display for CvarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CvarValue::Int(v) => write!(f, "{v}"),
            CvarValue::Float(v) => write!(f, "{v}"),
            CvarValue::String(v) => write!(f, "\"{v}\""),
            CvarValue::Bool(v) => write!(f, "{}", u8::from(*v)),
        }
    }
}

bitflags::bitflags! {
    /// Cvar flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CvarFlags: u32 {
        const NONE = 0;
        const ARCHIVE = 1 << 0;
        const SERVER_ONLY = 1 << 1;
        const CLIENT_ONLY = 1 << 2;
        /// Fixed at startup; the console refuses writes.
        const READ_ONLY = 1 << 3;
    }
}

/// Console variable metadata.
#[derive(Debug, Clone)]
pub struct Cvar {
    pub value: CvarValue,
    pub default: CvarValue,
    pub description: String,
    pub flags: CvarFlags,
}

/// A parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// `map <name>`
    Map(String),
    Status,
    /// `kick <id>`
    Kick(ClientId),
    /// `say <text...>`
    Say(String),
    Quit,
    Disconnect,
    Echo(String),
    Help,
    CvarList,
    /// `<cvar>` or `<cvar> <value>` / `set <cvar> <value>`
    Cvar { name: String, value: Option<String> },
    /// Parse failure or unknown command, with a message for the operator.
    Invalid(String),
    Empty,
}

/// The console.
#[derive(Debug, Default)]
pub struct Console {
    cvars: BTreeMap<String, Cvar>,
    history: Vec<String>,
}

const MAX_HISTORY: usize = 100;

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a console variable.
    pub fn register_cvar(&mut self, name: &str, default: CvarValue, description: &str, flags: CvarFlags) {
        self.cvars.insert(
            name.to_string(),
            Cvar {
                value: default.clone(),
                default,
                description: description.to_string(),
                flags,
            },
        );
    }

    pub fn get_cvar(&self, name: &str) -> Option<&CvarValue> {
        self.cvars.get(name).map(|c| &c.value)
    }

    pub fn cvar_int(&self, name: &str) -> Option<i64> {
        self.get_cvar(name).and_then(CvarValue::as_int)
    }

    pub fn cvar_float(&self, name: &str) -> Option<f64> {
        self.get_cvar(name).and_then(CvarValue::as_float)
    }

    pub fn cvar_bool(&self, name: &str) -> bool {
        self.get_cvar(name).is_some_and(CvarValue::as_bool)
    }

    /// Sets a cvar from text, keeping its registered type.
    pub fn set_cvar(&mut self, name: &str, text: &str) -> anyhow::Result<&CvarValue> {
        let cvar = self
            .cvars
            .get_mut(name)
            .with_context(|| format!("unknown cvar: {name}"))?;
        if cvar.flags.contains(CvarFlags::READ_ONLY) {
            bail!("{name} is read-only");
        }
        cvar.value = cvar.value.parse_like(text)?;
        Ok(&cvar.value)
    }

    /// Reads or writes a cvar and returns the operator-facing line.
    pub fn exec_cvar(&mut self, name: &str, value: Option<&str>) -> String {
        match value {
            None => match self.cvars.get(name) {
                Some(c) => format!("{name} = {} (default: {}) - {}", c.value, c.default, c.description),
                None => format!("Unknown command: {name}"),
            },
            Some(text) => match self.set_cvar(name, text) {
                Ok(v) => format!("{name} = {v}"),
                Err(e) => format!("{e:#}"),
            },
        }
    }

    pub fn cvar_list(&self) -> Vec<String> {
        self.cvars
            .iter()
            .map(|(name, c)| format!("  {name} = {} (default: {})", c.value, c.default))
            .collect()
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Parses a line and records it in the history.
    pub fn parse(&mut self, line: &str) -> ConsoleCommand {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            return ConsoleCommand::Empty;
        }
        self.history.push(line.to_string());
        if self.history.len() > MAX_HISTORY {
            self.history.remove(0);
        }

        let tokens = parse_command_line(line);
        let Some((head, args)) = tokens.split_first() else {
            return ConsoleCommand::Empty;
        };
        match head.as_str() {
            "map" => match args {
                [name] => ConsoleCommand::Map(name.clone()),
                _ => ConsoleCommand::Invalid("Usage: map <mapname>".into()),
            },
            "status" => ConsoleCommand::Status,
            "kick" => match args {
                [id] => match id.trim_start_matches('#').parse::<u16>() {
                    Ok(n) => ConsoleCommand::Kick(ClientId(n)),
                    Err(_) => ConsoleCommand::Invalid(format!("kick: '{id}' is not a client id")),
                },
                _ => ConsoleCommand::Invalid("Usage: kick <id>".into()),
            },
            "say" if args.is_empty() => ConsoleCommand::Invalid("Usage: say <message>".into()),
            "say" => ConsoleCommand::Say(args.join(" ")),
            "quit" | "exit" => ConsoleCommand::Quit,
            "disconnect" => ConsoleCommand::Disconnect,
            "echo" => ConsoleCommand::Echo(args.join(" ")),
            "help" => ConsoleCommand::Help,
            "cvarlist" => ConsoleCommand::CvarList,
            "set" => match args {
                [name, rest @ ..] if !rest.is_empty() => ConsoleCommand::Cvar {
                    name: name.clone(),
                    value: Some(rest.join(" ")),
                },
                _ => ConsoleCommand::Invalid("Usage: set <cvar> <value>".into()),
            },
            name if self.cvars.contains_key(name) => ConsoleCommand::Cvar {
                name: name.to_string(),
                value: (!args.is_empty()).then(|| args.join(" ")),
            },
            other => ConsoleCommand::Invalid(format!("Unknown command: {other}")),
        }
    }
}

/// Splits a command line on whitespace, keeping quoted runs together.
fn parse_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted {
                    tokens.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() || quoted {
        tokens.push(current);
    }
    tokens
}
