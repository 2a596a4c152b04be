//! The one shot loader that populates a dataset volume inside a loader job

use clap::Parser;
use tracing::{Level, event};
use tracing_subscriber::EnvFilter;

mod args;
mod bandwidth;
mod loaders;
mod secrets;

#[tokio::main]
async fn main() {
    // load command line args
    let args = args::Args::parse();
    // setup our subscriber
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    // read any mounted credentials
    let secrets = secrets::read_secrets(&args.secrets_dir);
    // build the loader for this source kind
    let loader = match args.build_loader(secrets) {
        Ok(loader) => loader,
        Err(error) => {
            event!(Level::ERROR, kind = %args.kind, error = error.msg(), "loader setup failed");
            eprintln!("{error}");
            std::process::exit(1);
        }
    };
    // sync this source into our root
    match loader.sync(&args.uri, &args.root).await {
        Ok(()) => {
            event!(Level::INFO, kind = %args.kind, uri = args.uri, "sync complete");
        }
        Err(error) => {
            event!(Level::ERROR, kind = %args.kind, error = error.msg(), "sync failed");
            eprintln!("{error}");
            std::process::exit(1);
        }
    }
}
