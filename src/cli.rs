use std::path::PathBuf;

use clap::{Parser, Subcommand};

use gazovec::vectors::ScoreMode;

/// Parse and validate threshold value (must be between 0.0 and 1.0)
fn parse_threshold(s: &str) -> Result<f32, String> {
    let value: f32 = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid number", s))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!(
            "threshold must be between 0.0 and 1.0, got {}",
            value
        ));
    }
    Ok(value)
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Config file. Its folder also holds the vector file and models.
    #[clap(long, global = true, env = "GAZOVEC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[clap(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate api docs in markdown format
    #[cfg(feature = "markdown-docs")]
    #[clap(hide = true)]
    MarkdownDocs {},

    /// Compute and store vectors for every image in a folder.
    /// Ctrl-C stops after the current file and keeps what was computed.
    Vectorize {
        folder: PathBuf,

        /// Include subfolders
        #[clap(short, long, default_value = "false")]
        recursive: bool,

        /// Stop after this many seconds
        #[clap(long)]
        timeout: Option<u64>,
    },

    /// List images similar to a target image
    Similar {
        image: PathBuf,

        /// Folder to search. Defaults to the image's folder.
        #[clap(short, long)]
        folder: Option<PathBuf>,

        /// Minimum similarity [0.0, 1.0]
        #[clap(short, long, value_parser = parse_threshold)]
        threshold: Option<f32>,

        /// Move the matches into this folder
        #[clap(long)]
        move_to: Option<PathBuf>,

        /// Don't ask for confirmation before moving
        #[clap(short, long, default_value = "false")]
        yes: bool,

        /// Only compare against images that already have a vector
        #[clap(long, default_value = "false")]
        cached_only: bool,
    },

    /// Print a folder in similarity order
    Playlist {
        folder: PathBuf,

        /// Minimum similarity for chaining [0.0, 1.0]
        #[clap(short, long, value_parser = parse_threshold)]
        threshold: Option<f32>,

        /// Number of entries to print. Defaults to the folder size.
        #[clap(short, long)]
        count: Option<usize>,

        /// Print random picks instead
        #[clap(long, default_value = "false")]
        random: bool,
    },

    /// Cosine similarity of two images
    Compare { a: PathBuf, b: PathBuf },

    /// Print content fingerprints
    Hash {
        #[clap(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show the strongest dimensions of an image's vector
    Inspect {
        image: PathBuf,

        /// magnitude or contribution
        #[clap(short, long, default_value_t = ScoreMode::Magnitude)]
        mode: ScoreMode,

        /// Number of dimensions to show
        #[clap(long, default_value_t = 10)]
        top: usize,

        /// Minimum score for a dimension to be shown
        #[clap(long, default_value_t = 0.0)]
        min_score: f32,
    },

    /// Show vector file and config details
    Stats {},
}
