use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "hotreload")]
#[command(version)]
#[command(
    about = "Apply code changes to running processes without restarting them",
    long_about = None
)]
pub(crate) struct Cli {
    /// Log debug output (HOTRELOAD_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Launch a process with hot reload enabled
    Launch {
        /// Project directory the process belongs to (default: current directory)
        #[arg(long)]
        project: Option<PathBuf>,

        /// Command to launch, followed by its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_takes_trailing_command() {
        let cli = Cli::try_parse_from([
            "hotreload", "-v", "launch", "--project", "/app", "--", "dotnet", "run", "--no-build",
        ])
        .unwrap();

        assert!(cli.verbose);
        let Commands::Launch { project, command } = cli.command;
        assert_eq!(project, Some(PathBuf::from("/app")));
        assert_eq!(command, vec!["dotnet", "run", "--no-build"]);
    }

    #[test]
    fn test_launch_requires_command() {
        assert!(Cli::try_parse_from(["hotreload", "launch"]).is_err());
    }

    #[test]
    fn test_launch_has_no_prompt_flags() {
        // launch never prompts; restart answers come from the config file or environment
        let parsed = Cli::try_parse_from(["hotreload", "launch", "--non-interactive", "--", "app"]);
        assert!(parsed.is_err());
    }
}
