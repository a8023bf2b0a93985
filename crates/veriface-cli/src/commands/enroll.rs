use std::any::Any;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use veriface_core::faces::FaceEnrollmentOutcome;

use crate::cli::{EnrollArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::engine::run_enroll;
use crate::errors::AppResult;
use crate::output::render_enroll;

type EnrollFn = dyn Fn(Option<&Path>, &EnrollArgs) -> AppResult<FaceEnrollmentOutcome> + Send + Sync;
type RenderFn = dyn Fn(&FaceEnrollmentOutcome, OutputMode) -> AppResult<()> + Send + Sync;

pub struct EnrollHandler {
    args: EnrollArgs,
    config: Option<PathBuf>,
    run: Box<EnrollFn>,
    render: Box<RenderFn>,
}

impl EnrollHandler {
    pub fn new(args: EnrollArgs, config: Option<PathBuf>) -> Self {
        Self::with_dependencies(args, config, run_enroll, render_enroll)
    }

    pub fn with_dependencies(
        args: EnrollArgs,
        config: Option<PathBuf>,
        run: impl Fn(Option<&Path>, &EnrollArgs) -> AppResult<FaceEnrollmentOutcome>
            + Send
            + Sync
            + 'static,
        render: impl Fn(&FaceEnrollmentOutcome, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            config,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for EnrollHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let outcome = (self.run)(self.config.as_deref(), &self.args)?;
        (self.render)(&outcome, mode)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
