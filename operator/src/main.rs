//! Reconciles dataset resources into populated volumes

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod args;
mod k8s;

#[tokio::main]
async fn main() {
    // load command line args
    let args = args::Args::parse();
    // setup our subscriber
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    // run the dataset controller until we are signalled to stop
    if let Err(error) = k8s::controller::run(&args).await {
        eprintln!("dataset controller failed: {error}");
        std::process::exit(1);
    }
}
