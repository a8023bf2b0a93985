use std::any::Any;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use veriface_core::faces::FaceRemovalOutcome;

use crate::cli::{OutputMode, TemplateRemoveArgs, TemplatesCommands};
use crate::commands::CommandHandler;
use crate::engine::{run_list_templates, run_remove_template, TemplateListing};
use crate::errors::AppResult;
use crate::output::{render_remove, render_templates};

type ListFn = dyn Fn(Option<&Path>) -> AppResult<Vec<TemplateListing>> + Send + Sync;
type RemoveFn =
    dyn Fn(Option<&Path>, &TemplateRemoveArgs) -> AppResult<FaceRemovalOutcome> + Send + Sync;
type RenderListFn = dyn Fn(&[TemplateListing], OutputMode) -> AppResult<()> + Send + Sync;
type RenderRemoveFn = dyn Fn(&FaceRemovalOutcome, OutputMode) -> AppResult<()> + Send + Sync;

pub struct TemplatesHandler {
    command: TemplatesCommands,
    config: Option<PathBuf>,
    deps: TemplatesHandlerDeps,
}

pub struct TemplatesHandlerDeps {
    pub list: Box<ListFn>,
    pub remove: Box<RemoveFn>,
    pub render_list: Box<RenderListFn>,
    pub render_remove: Box<RenderRemoveFn>,
}

impl TemplatesHandlerDeps {
    pub fn new(
        list: impl Fn(Option<&Path>) -> AppResult<Vec<TemplateListing>> + Send + Sync + 'static,
        remove: impl Fn(Option<&Path>, &TemplateRemoveArgs) -> AppResult<FaceRemovalOutcome>
            + Send
            + Sync
            + 'static,
        render_list: impl Fn(&[TemplateListing], OutputMode) -> AppResult<()> + Send + Sync + 'static,
        render_remove: impl Fn(&FaceRemovalOutcome, OutputMode) -> AppResult<()>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            list: Box::new(list),
            remove: Box::new(remove),
            render_list: Box::new(render_list),
            render_remove: Box::new(render_remove),
        }
    }
}

impl Default for TemplatesHandlerDeps {
    fn default() -> Self {
        Self::new(
            run_list_templates,
            run_remove_template,
            render_templates,
            render_remove,
        )
    }
}

impl TemplatesHandler {
    pub fn new(command: TemplatesCommands, config: Option<PathBuf>) -> Self {
        Self::with_dependencies(command, config, TemplatesHandlerDeps::default())
    }

    pub fn with_dependencies(
        command: TemplatesCommands,
        config: Option<PathBuf>,
        deps: TemplatesHandlerDeps,
    ) -> Self {
        Self {
            command,
            config,
            deps,
        }
    }
}

impl CommandHandler for TemplatesHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let config = self.config.as_deref();
        match &self.command {
            TemplatesCommands::List => {
                let templates = (self.deps.list)(config)?;
                (self.deps.render_list)(&templates, mode)?;
            }
            TemplatesCommands::Remove(args) => {
                let outcome = (self.deps.remove)(config, args)?;
                (self.deps.render_remove)(&outcome, mode)?;
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
