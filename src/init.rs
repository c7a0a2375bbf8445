use hotreload::clienv;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "hotreload=info";
const VERBOSE_DIRECTIVE: &str = "hotreload=debug";

/// HOTRELOAD_LOG (or RUST_LOG) wins over the --verbose default.
pub(crate) fn initialize_tracing(verbose: bool) {
    let directive = clienv::log_filter().unwrap_or_else(|| {
        if verbose {
            VERBOSE_DIRECTIVE.to_string()
        } else {
            DEFAULT_DIRECTIVE.to_string()
        }
    });

    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("Invalid log filter {directive:?}: {e}");
        EnvFilter::new(DEFAULT_DIRECTIVE)
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
