//! Command line args for the dataset controller

use clap::Parser;

/// Command line args
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The path to the controller config to load
    #[clap(short, long, default_value = "/etc/datasets/config.yml")]
    pub config: String,
}
