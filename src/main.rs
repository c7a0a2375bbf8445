mod args;
mod commands;
mod init;

use args::{Cli, Commands};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    init::initialize_tracing(cli.verbose);

    match cli.command {
        Commands::Launch { project, command } => {
            commands::launch::cmd_launch(project, command).await?
        }
    }

    Ok(())
}
