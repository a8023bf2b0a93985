use std::any::Any;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use veriface_core::cascade::CascadeDecision;

use crate::cli::OutputMode;
use crate::commands::{CommandHandler, REJECTED_EXIT_CODE};
use crate::engine::{run_verification, VerificationRequest};
use crate::errors::AppResult;
use crate::output::render_decision;

type VerifyFn =
    dyn Fn(Option<&Path>, &VerificationRequest) -> AppResult<CascadeDecision> + Send + Sync;
type RenderFn = dyn Fn(&CascadeDecision, OutputMode) -> AppResult<()> + Send + Sync;

/// Runs `verify` and `confirm`; the request says which.
pub struct VerifyHandler {
    request: VerificationRequest,
    config: Option<PathBuf>,
    run: Box<VerifyFn>,
    render: Box<RenderFn>,
}

impl VerifyHandler {
    pub fn new(request: VerificationRequest, config: Option<PathBuf>) -> Self {
        Self::with_dependencies(request, config, run_verification, render_decision)
    }

    pub fn with_dependencies(
        request: VerificationRequest,
        config: Option<PathBuf>,
        run: impl Fn(Option<&Path>, &VerificationRequest) -> AppResult<CascadeDecision>
            + Send
            + Sync
            + 'static,
        render: impl Fn(&CascadeDecision, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            request,
            config,
            run: Box::new(run),
            render: Box::new(render),
        }
    }

    pub fn request(&self) -> &VerificationRequest {
        &self.request
    }
}

impl CommandHandler for VerifyHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let decision = (self.run)(self.config.as_deref(), &self.request)?;
        (self.render)(&decision, mode)?;
        Ok(if decision.success {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(REJECTED_EXIT_CODE)
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
