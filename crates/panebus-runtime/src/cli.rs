//! CLI definition using clap derive.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use panebus_core::WorktreeId;
use panebus_runtime::config::CONFIG_ENV;

#[derive(Parser)]
#[command(name = "panebus", about = "Event coordination core for multi-pane workspaces")]
pub struct Cli {
    /// Configuration file (TOML). Missing file means defaults.
    #[arg(long, short = 'c', global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Watch worktree roots and print delivered notifications as JSON lines
    Run(RunOpts),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args)]
pub struct RunOpts {
    /// Worktree root as `<id>=<path>`; repeatable
    #[arg(long = "root", value_parser = parse_root)]
    pub roots: Vec<(WorktreeId, PathBuf)>,

    /// Worktree whose viewer pane starts focused
    #[arg(long)]
    pub focus: Option<String>,
}

fn parse_root(raw: &str) -> Result<(WorktreeId, PathBuf), String> {
    match raw.split_once('=') {
        Some((id, path)) if !id.is_empty() && !path.is_empty() => {
            Ok((WorktreeId::new(id), PathBuf::from(path)))
        }
        _ => Err(format!("expected <worktree>=<path>, got {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_argument_parses() {
        assert_eq!(
            parse_root("W1=/repo/a=b").expect("valid"),
            (WorktreeId::new("W1"), PathBuf::from("/repo/a=b"))
        );
        assert!(parse_root("/repo").is_err());
        assert!(parse_root("=/repo").is_err());
    }

    #[test]
    fn run_collects_repeated_roots() {
        let cli = Cli::try_parse_from([
            "panebus", "run", "--root", "W1=/a", "--root", "W2=/b", "--focus", "W2",
        ])
        .expect("parse");
        let Command::Run(opts) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(opts.roots.len(), 2);
        assert_eq!(opts.focus.as_deref(), Some("W2"));
    }
}
