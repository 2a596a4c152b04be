//! The source specific loaders that populate a dataset volume

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{Level, event};

use datasets::Error;
use datasets::models::DatasetType;

use crate::secrets::Secrets;

mod conda;
mod database;
mod git;
mod hadoop;
pub mod hub;
mod rclone;

pub use conda::CondaLoader;
pub use database::DatabaseLoader;
pub use git::GitLoader;
pub use hadoop::HadoopLoader;
pub use hub::{HuggingfaceLoader, ModelscopeLoader};
pub use rclone::RcloneLoader;

/// The options every loader is constructed with
#[derive(Debug, Clone)]
pub struct Options {
    /// The directory to sync data into
    pub root: PathBuf,
    /// The uri to sync from
    pub uri: String,
    /// The kind of source being synced
    pub kind: DatasetType,
    /// An rclone style bandwidth limit, empty when unset
    pub bandwidth_limit: String,
}

/// A one shot synchronizer for a single source kind
#[async_trait]
pub trait Loader: Send + Sync {
    /// Sync a remote source into a local directory
    ///
    /// # Arguments
    ///
    /// * `from_uri` - The uri to sync from
    /// * `to_path` - The path to sync into
    async fn sync(&self, from_uri: &str, to_path: &Path) -> Result<(), Error>;
}

/// Build the loader for a source kind
///
/// Required options are validated eagerly so a bad spec fails before any
/// external command runs.
///
/// # Arguments
///
/// * `datasource_options` - The source specific option map
/// * `options` - The shared loader options
/// * `secrets` - The credentials read from the mounted secret dir
pub fn new_loader(
    datasource_options: std::collections::BTreeMap<String, String>,
    options: Options,
    secrets: Secrets,
) -> Result<Box<dyn Loader>, Error> {
    match options.kind {
        DatasetType::Git => Ok(Box::new(GitLoader::new(datasource_options, options, secrets)?)),
        DatasetType::Http | DatasetType::S3 => {
            Ok(Box::new(RcloneLoader::new(datasource_options, options, secrets)?))
        }
        DatasetType::Hdfs => Ok(Box::new(HadoopLoader::new(datasource_options, options, secrets)?)),
        DatasetType::Database => {
            Ok(Box::new(DatabaseLoader::new(datasource_options, options, secrets)?))
        }
        DatasetType::Conda => Ok(Box::new(CondaLoader::new(datasource_options, options, secrets)?)),
        DatasetType::Huggingface => {
            Ok(Box::new(HuggingfaceLoader::new(datasource_options, options, secrets)?))
        }
        DatasetType::Modelscope => {
            Ok(Box::new(ModelscopeLoader::new(datasource_options, options, secrets)?))
        }
        DatasetType::Reference => Err(Error::new(
            "reference datasets adopt another datasets volume and are not synced by a loader",
        )),
    }
}

/// Run a command to completion and capture its output
///
/// The commands stderr is folded into the error on a non zero exit.
///
/// # Arguments
///
/// * `cmd` - The command to run
pub(crate) async fn run_command(cmd: std::process::Command) -> Result<std::process::Output, Error> {
    // log the command we are about to run
    event!(
        Level::INFO,
        program = %cmd.get_program().to_string_lossy(),
        args = %cmd
            .get_args()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" "),
    );
    let mut cmd = tokio::process::Command::from(cmd);
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::new(format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output)
}
