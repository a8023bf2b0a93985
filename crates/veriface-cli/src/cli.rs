use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "veriface",
    about = "Enroll faces and verify identity through a cascade of engines",
    version
)]
pub struct Cli {
    /// Emit structured JSON to stdout instead of human-readable logs
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase verbosity (may be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (defaults to /etc/veriface/config.toml, then /usr/local/etc/veriface/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Detect the primary face in an image and write its embedding to JSON
    Extract(ExtractArgs),
    /// Build and store a template for a subject from a series of frames
    Enroll(EnrollArgs),
    /// Identify the person in the given frames against every enrolled template
    Verify(VerifyArgs),
    /// Re-verify a known subject before a high-value action
    Confirm(ConfirmArgs),
    /// Inspect or remove enrolled templates
    #[command(subcommand)]
    Templates(TemplatesCommands),
}

#[derive(Debug, Clone, Subcommand)]
pub enum TemplatesCommands {
    /// List enrolled subjects
    List,
    /// Delete a subject's template and raw image
    Remove(TemplateRemoveArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ExtractArgs {
    /// Image containing the face to extract
    #[arg(long)]
    pub image: PathBuf,

    /// Output file for the extraction summary (defaults to captures/features/<timestamp>.json)
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct EnrollArgs {
    /// Subject id to enroll (ASCII letters, digits, '-' and '_')
    #[arg(long)]
    pub subject: String,

    /// Frames to enroll from, read in order
    #[arg(long, required = true, num_args = 1..)]
    pub images: Vec<PathBuf>,
}

/// The live capture shared by `verify` and `confirm`.
#[derive(Debug, Clone, Default, PartialEq, Args)]
pub struct CaptureArgs {
    /// Frames of the live capture; the first is sent to the engines
    #[arg(long, required = true, num_args = 1..)]
    pub frames: Vec<PathBuf>,

    /// JSON array of per-frame liveness observations (eye_aspect_ratio, yaw_deg, pitch_deg, quality)
    #[arg(long)]
    pub observations: Option<PathBuf>,

    /// Precomputed query embedding, as written by `extract`
    #[arg(long)]
    pub embedding: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub capture: CaptureArgs,
}

#[derive(Debug, Clone, Args)]
pub struct ConfirmArgs {
    /// Subject expected in front of the camera
    #[arg(long)]
    pub subject: String,

    /// Action being authorised (e.g. approve-payment)
    #[arg(long)]
    pub action: String,

    /// Optional reference for the action, recorded in logs
    #[arg(long)]
    pub reference: Option<String>,

    #[command(flatten)]
    pub capture: CaptureArgs,
}

#[derive(Debug, Clone, Args)]
pub struct TemplateRemoveArgs {
    /// Subject whose template should be removed
    #[arg(long)]
    pub subject: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl From<bool> for OutputMode {
    fn from(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        OutputMode::from(self.json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_parses_reference_and_frames() {
        let cli = Cli::parse_from([
            "veriface",
            "--json",
            "confirm",
            "--subject",
            "alice",
            "--action",
            "approve-payment",
            "--reference",
            "INV-7",
            "--frames",
            "a.png",
            "b.png",
        ]);
        assert_eq!(cli.output_mode(), OutputMode::Json);
        match cli.command {
            Commands::Confirm(args) => {
                assert_eq!(args.subject, "alice");
                assert_eq!(args.reference.as_deref(), Some("INV-7"));
                assert_eq!(args.capture.frames.len(), 2);
                assert!(args.capture.observations.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::parse_from(["veriface", "templates", "list", "-vv", "--config", "c.toml"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("c.toml")));
        assert!(matches!(
            cli.command,
            Commands::Templates(TemplatesCommands::List)
        ));
    }

    #[test]
    fn verify_accepts_client_signals() {
        let cli = Cli::parse_from([
            "veriface",
            "verify",
            "--frames",
            "a.png",
            "b.png",
            "--observations",
            "mesh.json",
            "--embedding",
            "AACAPw==",
        ]);
        match cli.command {
            Commands::Verify(args) => {
                assert_eq!(args.capture.frames.len(), 2);
                assert_eq!(args.capture.observations, Some(PathBuf::from("mesh.json")));
                assert_eq!(args.capture.embedding.as_deref(), Some("AACAPw=="));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn verify_requires_frames() {
        assert!(Cli::try_parse_from(["veriface", "verify"]).is_err());
    }
}
