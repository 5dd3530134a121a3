//! panebus: event coordination core for multi-pane workspaces.
//! Runs the workspace core in-process against real worktree roots.

use clap::Parser;

use panebus_runtime::CoreConfig;

mod cli;
mod cmd_run;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    let config = CoreConfig::resolve(args.config.as_deref())?;

    match args.command {
        cli::Command::Run(opts) => {
            let filter = std::env::var("PANEBUS_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .with_writer(std::io::stderr)
                .init();

            tracing::info!("panebus starting");
            cmd_run::cmd_run(config, opts).await?;
        }
        cli::Command::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
