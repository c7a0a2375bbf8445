//! Asking whether to restart the root process after a rude edit.

use async_trait::async_trait;
use dialoguer::{theme::ColorfulTheme, Select};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartAnswer {
    Yes,
    No,
    /// Yes, and never ask again this session.
    Always,
    /// No, and never ask again this session.
    Never,
}

impl RestartAnswer {
    pub fn restart(self) -> bool {
        matches!(self, RestartAnswer::Yes | RestartAnswer::Always)
    }

    fn remembered(self) -> Option<bool> {
        match self {
            RestartAnswer::Always => Some(true),
            RestartAnswer::Never => Some(false),
            RestartAnswer::Yes | RestartAnswer::No => None,
        }
    }
}

#[async_trait]
pub trait ConfirmInput: Send + Sync {
    async fn ask(&self, question: String) -> RestartAnswer;
}

/// Interactive terminal prompt.
pub struct ConsoleConfirm;

const CHOICES: [&str; 4] = ["Yes", "No", "Always", "Never"];

#[async_trait]
impl ConfirmInput for ConsoleConfirm {
    async fn ask(&self, question: String) -> RestartAnswer {
        let selected = tokio::task::spawn_blocking(move || {
            Select::with_theme(&ColorfulTheme::default())
                .with_prompt(question)
                .items(&CHOICES[..])
                .default(0)
                .interact()
        })
        .await;

        match selected {
            Ok(Ok(0)) => RestartAnswer::Yes,
            Ok(Ok(2)) => RestartAnswer::Always,
            Ok(Ok(3)) => RestartAnswer::Never,
            Ok(Ok(_)) => RestartAnswer::No,
            Ok(Err(e)) => {
                warn!("Restart prompt failed, not restarting: {}", e);
                RestartAnswer::No
            }
            Err(e) => {
                warn!("Restart prompt task failed, not restarting: {}", e);
                RestartAnswer::No
            }
        }
    }
}

/// Fixed answer, for non-interactive sessions.
pub struct AutoConfirm(pub RestartAnswer);

#[async_trait]
impl ConfirmInput for AutoConfirm {
    async fn ask(&self, question: String) -> RestartAnswer {
        debug!(answer = ?self.0, "{}", question);
        self.0
    }
}

pub struct RestartPrompt {
    input: Box<dyn ConfirmInput>,
    remembered: Mutex<Option<bool>>,
}

impl RestartPrompt {
    pub fn new(input: Box<dyn ConfirmInput>) -> Self {
        Self {
            input,
            remembered: Mutex::new(None),
        }
    }

    /// Prompt on the terminal unless the config already decided or forbids asking.
    /// Non-interactive sessions restart.
    pub fn from_config(config: &SessionConfig) -> Self {
        let input: Box<dyn ConfirmInput> = if config.non_interactive {
            Box::new(AutoConfirm(RestartAnswer::Yes))
        } else {
            Box::new(ConsoleConfirm)
        };
        Self {
            input,
            remembered: Mutex::new(config.restart_on_rude_edit),
        }
    }

    /// Whether to restart the named processes. "Always"/"Never" stick for the session.
    pub async fn confirm(&self, process_names: &[&str]) -> bool {
        let remembered = *self.remembered.lock();
        if let Some(answer) = remembered {
            debug!(restart = answer, "Using remembered restart answer");
            return answer;
        }

        let question = format!(
            "Unsupported changes require restarting {}. Restart?",
            process_names.join(", ")
        );
        let answer = self.input.ask(question).await;

        if let Some(remember) = answer.remembered() {
            *self.remembered.lock() = Some(remember);
        }
        answer.restart()
    }
}
