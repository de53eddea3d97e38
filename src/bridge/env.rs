//! Per-session environment staging and the interactive remote command.
//!
//! Values never appear in a command string: each one travels as a
//! `BURROW_ENV_<n>` variable of the staging exec and bash's `printf %q`
//! writes it to the startup script already quoted.

use std::collections::BTreeMap;
use tracing::warn;

/// Prefix of the variables carrying values into the staging command.
pub(crate) const ENV_VALUE_PREFIX: &str = "BURROW_ENV_";

/// True for portable shell identifiers: `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Drops entries whose names are not valid identifiers, with a warning.
pub(crate) fn valid_vars(vars: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    vars.iter()
        .filter(|(name, _)| {
            let valid = is_valid_env_name(name);
            if !valid {
                warn!("Skipping invalid environment variable name '{}'", name);
            }
            valid
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// A command that writes an owner-only startup script, plus the env it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EnvStaging {
    pub command: String,
    pub env: BTreeMap<String, String>,
}

/// Builds the staging command for `vars`, or `None` when no valid names remain.
pub(crate) fn staging(script_path: &str, vars: &BTreeMap<String, String>) -> Option<EnvStaging> {
    let vars = valid_vars(vars);
    if vars.is_empty() {
        return None;
    }

    let mut env = BTreeMap::new();
    let mut lines = Vec::with_capacity(vars.len());
    for (i, (name, value)) in vars.into_iter().enumerate() {
        let carrier = format!("{ENV_VALUE_PREFIX}{i}");
        lines.push(format!("printf 'export %s=%q\\n' {name} \"${carrier}\";"));
        env.insert(carrier, value);
    }

    let path = shell_words::quote(script_path);
    let script = format!("{{ {} }} > {path}", lines.join(" "));
    Some(EnvStaging {
        command: format!(
            "umask 077 && bash -c {} && chmod 600 {path}",
            shell_words::quote(&script)
        ),
        env,
    })
}

/// The command run by the interactive client:
/// `cd <dir> && . <script> && exec <command>`, omitting absent parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RemoteCommand {
    workdir: Option<String>,
    env_script: Option<String>,
    command: String,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_workdir(mut self, workdir: Option<&str>) -> Self {
        self.workdir = workdir.map(String::from);
        self
    }

    pub fn with_env_script(mut self, script: Option<&str>) -> Self {
        self.env_script = script.map(String::from);
        self
    }

    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ref dir) = self.workdir {
            parts.push(format!("cd {}", shell_words::quote(dir)));
        }
        if let Some(ref script) = self.env_script {
            parts.push(format!(". {}", shell_words::quote(script)));
        }
        parts.push(format!("exec {}", self.command));
        parts.join(" && ")
    }
}
