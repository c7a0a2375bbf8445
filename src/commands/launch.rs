use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use hotreload::session::{LaunchSpec, ProcessOptions};
use hotreload::{SessionConfig, SessionCoordinator};
use tracing::{info, warn};

pub(crate) async fn cmd_launch(
    project: Option<PathBuf>,
    command: Vec<String>,
) -> anyhow::Result<()> {
    let config = SessionConfig::load().context("Failed to load hotreload config")?;

    let Some((program, args)) = command.split_first() else {
        bail!("No command given to launch");
    };
    let project = match project {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    let name = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.clone());

    let spec = LaunchSpec::new(program.as_str())
        .args(args.iter().cloned())
        .working_dir(&project);
    let options = ProcessOptions::new(&project, &name).root();

    let coordinator = SessionCoordinator::new(&config);
    let Some(root) = coordinator
        .start_process(spec, options)
        .await
        .with_context(|| format!("Failed to launch {name}"))?
    else {
        bail!("{name} exited before hot reload was established");
    };

    println!("Hot reload active for {} (pid {:?})", name, root.handle().pid());
    println!("Capabilities: {}", root.capabilities());

    tokio::select! {
        _ = root.handle().wait() => {
            info!(process = %name, exit_code = ?root.handle().exit_code(), "Process exited");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            for process in coordinator.shutdown().await {
                process.terminate().await;
            }
        }
    }

    Ok(())
}
