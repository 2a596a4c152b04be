//! Command line args for the dataset loader

use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;

use datasets::Error;
use datasets::consts::{DATA_MOUNT_PATH, SECRETS_MOUNT_PATH};
use datasets::models::DatasetType;

use crate::loaders::{self, Loader, Options};
use crate::secrets::Secrets;

/// Command line args
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The kind of source to sync from
    #[clap(short, long)]
    pub kind: DatasetType,
    /// The uri to sync from
    #[clap(short, long)]
    pub uri: String,
    /// Source specific options as repeated key=value pairs
    #[clap(short, long)]
    pub options: Vec<String>,
    /// The directory any credentials are mounted at
    #[clap(short, long, default_value = SECRETS_MOUNT_PATH)]
    pub secrets_dir: PathBuf,
    /// The directory to sync data into
    #[clap(short, long, default_value = DATA_MOUNT_PATH)]
    pub root: PathBuf,
    /// An rclone style bandwidth limit to apply to network commands
    #[clap(short, long, default_value = "")]
    pub bandwidth_limit: String,
}

impl Args {
    /// Parse the repeated key=value option flags into a map
    pub fn options(&self) -> Result<BTreeMap<String, String>, Error> {
        let mut options = BTreeMap::default();
        for raw in &self.options {
            // each option must be a key=value pair
            match raw.split_once('=') {
                Some((key, value)) => {
                    options.insert(key.to_owned(), value.to_owned());
                }
                None => {
                    return Err(Error::new(format!(
                        "invalid option {raw}, expected key=value"
                    )));
                }
            }
        }
        Ok(options)
    }

    /// Build the loader for this source kind
    ///
    /// # Arguments
    ///
    /// * `secrets` - The credentials read from the mounted secret dir
    pub fn build_loader(&self, secrets: Secrets) -> Result<Box<dyn Loader>, Error> {
        // parse our repeated option flags
        let options = self.options()?;
        // build the shared loader options
        let shared = Options {
            root: self.root.clone(),
            uri: self.uri.clone(),
            kind: self.kind,
            bandwidth_limit: self.bandwidth_limit.clone(),
        };
        loaders::new_loader(options, shared, secrets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_parse_key_value_pairs() {
        let args = Args::parse_from([
            "datasets-loader",
            "--kind",
            "hdfs",
            "--uri",
            "hdfs://namenode:9000",
            "--options",
            "sourcePath=/data/foo",
            "--options",
            "replication=3",
        ]);
        let options = args.options().unwrap();
        assert_eq!(options.get("sourcePath").unwrap(), "/data/foo");
        assert_eq!(options.get("replication").unwrap(), "3");
        assert_eq!(args.root, PathBuf::from("/data"));
        assert_eq!(args.secrets_dir, PathBuf::from("/secrets"));
    }

    #[test]
    fn options_reject_bare_flags() {
        let args = Args::parse_from([
            "datasets-loader",
            "--kind",
            "git",
            "--uri",
            "https://example.com/repo.git",
            "--options",
            "not-a-pair",
        ]);
        assert!(args.options().is_err());
    }
}
