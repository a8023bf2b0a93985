use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use veriface_cli::cli::{OutputMode, TemplateRemoveArgs, TemplatesCommands};
use veriface_cli::commands::{CommandHandler, TemplatesHandler, TemplatesHandlerDeps};
use veriface_cli::engine::TemplateListing;
use veriface_core::faces::FaceRemovalOutcome;

fn listing(subject: &str) -> TemplateListing {
    TemplateListing {
        subject_id: subject.into(),
        captured_at: "2026-01-01T00:00:00+00:00".into(),
        embedding_len: 512,
        raw_image_ref: Some(format!("images/{subject}-1.png")),
    }
}

#[test]
fn list_renders_every_template() {
    let rendered = Arc::new(Mutex::new(0));
    let deps = TemplatesHandlerDeps::new(
        |_config| Ok(vec![listing("alice"), listing("bob")]),
        |_config, _args| panic!("remove should not run"),
        {
            let rendered = Arc::clone(&rendered);
            move |templates: &[TemplateListing], _mode| {
                *rendered.lock().unwrap() += templates.len();
                Ok(())
            }
        },
        |_outcome, _mode| panic!("remove render should not run"),
    );

    let handler = TemplatesHandler::with_dependencies(TemplatesCommands::List, None, deps);
    let code = handler.execute(OutputMode::Human, false).unwrap();
    assert_eq!(code, ExitCode::SUCCESS);
    assert_eq!(*rendered.lock().unwrap(), 2);
}

#[test]
fn remove_passes_subject_through() {
    let deps = TemplatesHandlerDeps::new(
        |_config| panic!("list should not run"),
        |_config, args: &TemplateRemoveArgs| {
            Ok(FaceRemovalOutcome {
                subject_id: args.subject.clone(),
                removed: true,
                logs: vec![format!("Removed template for subject {}", args.subject)],
            })
        },
        |_templates, _mode| panic!("list render should not run"),
        |outcome, _mode| {
            assert_eq!(outcome.subject_id, "bob");
            assert!(outcome.removed);
            Ok(())
        },
    );

    let handler = TemplatesHandler::with_dependencies(
        TemplatesCommands::Remove(TemplateRemoveArgs {
            subject: "bob".into(),
        }),
        None,
        deps,
    );
    assert_eq!(
        handler.execute(OutputMode::Json, false).unwrap(),
        ExitCode::SUCCESS
    );
}
