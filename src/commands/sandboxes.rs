//! `burrow sandboxes`: list and remove sandboxes created by burrow.

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use std::fmt::Write;

use crate::sandbox::{DockerSandbox, SandboxSummary};

/// Sandbox housekeeping actions.
#[derive(Subcommand, Debug)]
pub enum SandboxAction {
    /// List sandboxes created by burrow
    List,

    /// Force-remove a sandbox
    Kill {
        /// Sandbox id or name
        id: String,
    },
}

pub(crate) async fn run(action: SandboxAction) -> Result<()> {
    match action {
        SandboxAction::List => {
            let sandboxes = DockerSandbox::list().await?;
            print!("{}", format_list(&sandboxes));
        }
        SandboxAction::Kill { id } => {
            DockerSandbox::kill(&id).await?;
            println!("{} Removed sandbox {}", "✓".green(), id.cyan());
        }
    }
    Ok(())
}

fn format_list(sandboxes: &[SandboxSummary]) -> String {
    let mut out = String::new();
    if sandboxes.is_empty() {
        writeln!(&mut out, "No sandboxes found").unwrap();
        return out;
    }

    let width = sandboxes.iter().map(|s| s.name.len()).max().unwrap_or(0);
    writeln!(
        &mut out,
        "{}",
        format!("{:12}  {:width$}  {:10}  {}", "ID", "NAME", "STATE", "IMAGE").bold()
    )
    .unwrap();
    for sandbox in sandboxes {
        let state = format!("{:10}", sandbox.state);
        let state = if sandbox.state == "running" {
            state.green()
        } else {
            state.yellow()
        };
        writeln!(
            &mut out,
            "{:12}  {:width$}  {}  {} {}",
            sandbox.id,
            sandbox.name,
            state,
            sandbox.image,
            format!("({})", sandbox.status).dimmed()
        )
        .unwrap();
    }
    out
}
