use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "shade", version, about = "shade - compile annotated compute-shader effects")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Log at debug level (RUST_LOG still wins when set)
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write per-pass WGSL plus pipeline.json and metadata.json
    Build {
        /// Effect source file
        effect: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "build")]
        out: PathBuf,

        /// Rebuild whenever the effect file changes
        #[arg(long)]
        watch: bool,
    },
    /// Apply an effect to an image on the GPU and save the result
    Run {
        /// Effect source file
        effect: PathBuf,

        /// Image fed to INPUT
        #[arg(long)]
        input: PathBuf,

        /// Where to write OUTPUT (format from extension)
        #[arg(long)]
        output: PathBuf,

        /// OUTPUT width (defaults to the effect's own sizing)
        #[arg(long, requires = "height")]
        width: Option<u32>,

        /// OUTPUT height
        #[arg(long, requires = "width")]
        height: Option<u32>,

        /// Parameter values as NAME=VALUE
        #[arg(long = "set", value_parser = parse_assignment)]
        set: Vec<(String, f64)>,

        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Parse and generate without touching the GPU, then report
    Check {
        /// Effect source file
        effect: PathBuf,

        /// Report format
        #[arg(long, default_value = "text")]
        format: ReportFormat,
    },
}

#[derive(Args, Debug, Default)]
pub struct OverrideArgs {
    /// YAML file with `defines` and `textures` overrides
    #[arg(long)]
    pub overrides: Option<PathBuf>,

    /// Named constant for size expressions, as NAME=VALUE (repeatable)
    #[arg(long = "define", value_parser = parse_assignment)]
    pub defines: Vec<(String, f64)>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum ReportFormat {
    Text,
    Json,
}

/// Parse `NAME=VALUE` with a numeric value.
pub fn parse_assignment(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing name in '{}'", s));
    }
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("'{}' is not a number", value.trim()))?;
    Ok((name.to_string(), value))
}
