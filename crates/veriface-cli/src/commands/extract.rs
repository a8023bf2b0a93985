use std::any::Any;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use veriface_core::faces::FaceExtractionOutcome;

use crate::cli::{ExtractArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::engine::run_extract;
use crate::errors::AppResult;
use crate::output::render_extract;

type ExtractFn =
    dyn Fn(Option<&Path>, &ExtractArgs) -> AppResult<FaceExtractionOutcome> + Send + Sync;
type RenderFn = dyn Fn(&FaceExtractionOutcome, OutputMode) -> AppResult<()> + Send + Sync;

pub struct ExtractHandler {
    args: ExtractArgs,
    config: Option<PathBuf>,
    run: Box<ExtractFn>,
    render: Box<RenderFn>,
}

impl ExtractHandler {
    pub fn new(args: ExtractArgs, config: Option<PathBuf>) -> Self {
        Self::with_dependencies(args, config, run_extract, render_extract)
    }

    pub fn with_dependencies(
        args: ExtractArgs,
        config: Option<PathBuf>,
        run: impl Fn(Option<&Path>, &ExtractArgs) -> AppResult<FaceExtractionOutcome>
            + Send
            + Sync
            + 'static,
        render: impl Fn(&FaceExtractionOutcome, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            config,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for ExtractHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let outcome = (self.run)(self.config.as_deref(), &self.args)?;
        (self.render)(&outcome, mode)?;
        // An image without a face still produced a summary file.
        Ok(if outcome.summary.success {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(3)
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
