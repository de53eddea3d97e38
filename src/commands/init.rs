//! `burrow init`: write a starter `burrow.toml`.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::fs;
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates::BURROW_TOML;

/// What `burrow init` did with the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitOutcome {
    Created,
    Overwritten,
    Skipped,
}

/// Writes the config template into the current directory.
pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let path = cwd.join(CONFIG_FILE);
    info!("Initializing burrow in {}", cwd.display());

    let outcome = write_config(path.exists(), force, |content| {
        fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
    })?;

    print!("{}", format_outcome(outcome));
    Ok(())
}

/// Writes the template through `write` unless the file `exists` and
/// `force` is off.
fn write_config<W>(exists: bool, force: bool, write: W) -> Result<InitOutcome>
where
    W: FnOnce(&str) -> Result<()>,
{
    if exists && !force {
        return Ok(InitOutcome::Skipped);
    }
    write(BURROW_TOML)?;
    Ok(if exists {
        InitOutcome::Overwritten
    } else {
        InitOutcome::Created
    })
}

fn format_outcome(outcome: InitOutcome) -> String {
    let mut out = String::new();

    if outcome == InitOutcome::Skipped {
        writeln!(
            &mut out,
            "{} {} already exists, use --force to overwrite",
            "⊘".yellow(),
            CONFIG_FILE.cyan()
        )
        .unwrap();
        return out;
    }

    writeln!(
        &mut out,
        "\n{} burrow initialized successfully!\n",
        "✓".green().bold()
    )
    .unwrap();
    let note = if outcome == InitOutcome::Overwritten {
        "overwritten with the default template"
    } else {
        "created"
    };
    writeln!(&mut out, "  {} ({note})", CONFIG_FILE.cyan()).unwrap();

    writeln!(&mut out, "\n{}", "Next steps:".yellow().bold()).unwrap();
    writeln!(&mut out, "  1. Add your repositories under [[repos]]").unwrap();
    writeln!(
        &mut out,
        "  2. Run {} to set them up locally",
        "burrow setup".green()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  3. Run {} to bootstrap a sandbox and open a shell in it",
        "burrow up --attach".green()
    )
    .unwrap();

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_write_config_creates_missing_file() {
        let written = RefCell::new(None);
        let outcome = write_config(false, false, |content| {
            *written.borrow_mut() = Some(content.to_string());
            Ok(())
        })
        .unwrap();

        assert_eq!(outcome, InitOutcome::Created);
        assert_eq!(written.borrow().as_deref(), Some(BURROW_TOML));
    }

    #[test]
    fn test_write_config_skips_existing_without_force() {
        let outcome = write_config(true, false, |_| panic!("must not write")).unwrap();
        assert_eq!(outcome, InitOutcome::Skipped);
    }

    #[test]
    fn test_write_config_overwrites_with_force() {
        let mut writes = 0;
        let outcome = write_config(true, true, |_| {
            writes += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(outcome, InitOutcome::Overwritten);
        assert_eq!(writes, 1);
    }

    #[test]
    fn test_write_config_propagates_write_failure() {
        let err = write_config(false, true, |_| anyhow::bail!("read-only filesystem")).unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn test_format_outcome() {
        colored::control::set_override(false);

        let created = format_outcome(InitOutcome::Created);
        assert!(created.contains("initialized successfully"));
        assert!(created.contains("burrow.toml (created)"));
        assert!(created.contains("Next steps"));

        let overwritten = format_outcome(InitOutcome::Overwritten);
        assert!(overwritten.contains("overwritten"));

        let skipped = format_outcome(InitOutcome::Skipped);
        assert!(skipped.contains("already exists"));
        assert!(skipped.contains("--force"));
        assert!(!skipped.contains("Next steps"));
    }
}
