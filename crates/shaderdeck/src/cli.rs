use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "shaderdeck",
    author,
    version,
    about = "Seven-layer live shader compositor"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open a window and render the configured layer stack.
    Run(RunArgs),
    /// Build and validate a layer shader without touching the GPU.
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Print a layer shader's declared inputs and passes as JSON.
    Inputs {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Deck configuration file; defaults to `deck.toml` in the config directory.
    #[arg(long, value_name = "PATH", env = "SHADERDECK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the layer resolution (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_surface_size)]
    pub size: Option<(u32, u32)>,

    /// Optional FPS cap (0=uncapped).
    #[arg(long, value_name = "FPS")]
    pub fps: Option<f32>,

    /// Disable layer source hot reload.
    #[arg(long)]
    pub no_reload: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_surface_size(value: &str) -> Result<(u32, u32)> {
    let (width, height) = value
        .trim()
        .split_once(['x', 'X', '×'])
        .ok_or_else(|| anyhow::anyhow!("expected WxH format, e.g. 1920x1080"))?;

    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid width in size"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid height in size"))?;

    if width == 0 || height == 0 {
        anyhow::bail!("surface dimensions must be greater than zero");
    }

    Ok((width, height))
}
