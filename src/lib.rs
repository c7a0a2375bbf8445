pub mod change;
pub mod clienv;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod update;
pub mod watch;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use session::SessionCoordinator;
pub use watch::{HotReloadLoop, LoopExit};
