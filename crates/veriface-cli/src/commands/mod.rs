use std::any::Any;
use std::path::PathBuf;
use std::process::ExitCode;

use crate::cli::{Commands, OutputMode};
use crate::engine::VerificationRequest;
use crate::errors::AppResult;

/// Exit status when the cascade ran to completion but rejected the capture.
pub const REJECTED_EXIT_CODE: u8 = 5;

pub trait CommandHandler: Send + Sync {
    fn execute(&self, mode: OutputMode, verbose: bool) -> AppResult<ExitCode>;
    fn as_any(&self) -> &dyn Any;
}

mod enroll;
mod extract;
mod templates;
mod verify;

pub use enroll::EnrollHandler;
pub use extract::ExtractHandler;
pub use templates::{TemplatesHandler, TemplatesHandlerDeps};
pub use verify::VerifyHandler;

/// Build the handler for `command`; `config` is the `--config` override.
pub fn handler_for(command: Commands, config: Option<PathBuf>) -> Box<dyn CommandHandler> {
    match command {
        Commands::Extract(args) => Box::new(ExtractHandler::new(args, config)),
        Commands::Enroll(args) => Box::new(EnrollHandler::new(args, config)),
        Commands::Verify(args) => {
            Box::new(VerifyHandler::new(VerificationRequest::from(&args), config))
        }
        Commands::Confirm(args) => {
            Box::new(VerifyHandler::new(VerificationRequest::from(&args), config))
        }
        Commands::Templates(cmd) => Box::new(TemplatesHandler::new(cmd, config)),
    }
}
