//! Syncs http and s3 datasets with rclone

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use tracing::{Level, event, instrument};

use datasets::Error;
use datasets::models::DatasetType;

use super::{Loader, Options, run_command};
use crate::secrets::Secrets;

/// The scoped remote name used inside the generated config
const REMOTE: &str = "remote";

/// Syncs http and s3 datasets by shelling out to rclone
#[derive(Debug)]
pub struct RcloneLoader {
    /// The shared loader options
    options: Options,
    /// The source specific option map
    datasource_options: BTreeMap<String, String>,
    /// The mounted credentials
    secrets: Secrets,
}

impl RcloneLoader {
    /// Build a new rclone loader
    ///
    /// # Arguments
    ///
    /// * `datasource_options` - The source specific option map
    /// * `options` - The shared loader options
    /// * `secrets` - The mounted credentials
    pub fn new(
        datasource_options: BTreeMap<String, String>,
        options: Options,
        secrets: Secrets,
    ) -> Result<Self, Error> {
        match options.kind {
            DatasetType::Http | DatasetType::S3 => Ok(RcloneLoader {
                options,
                datasource_options,
                secrets,
            }),
            kind => Err(Error::new(format!(
                "rclone cannot sync {kind} sources"
            ))),
        }
    }

    /// Render the scoped rclone config for this source
    fn render_config(&self) -> String {
        let mut lines = vec![format!("[{REMOTE}]")];
        match self.options.kind {
            DatasetType::S3 => {
                lines.push("type = s3".to_owned());
                let provider = self
                    .datasource_options
                    .get("provider")
                    .map(String::as_str)
                    .unwrap_or("Other");
                lines.push(format!("provider = {provider}"));
                if let Some(access_key) = &self.secrets.access_key {
                    lines.push(format!("access_key_id = {}", access_key.trim()));
                }
                if let Some(secret_key) = &self.secrets.secret_key {
                    lines.push(format!("secret_access_key = {}", secret_key.trim()));
                }
                if let Some(endpoint) = self.datasource_options.get("endpoint") {
                    lines.push(format!("endpoint = {endpoint}"));
                }
                if let Some(region) = self.datasource_options.get("region") {
                    lines.push(format!("region = {region}"));
                }
            }
            _ => {
                lines.push("type = http".to_owned());
                lines.push(format!("url = {}", self.options.uri));
            }
        }
        lines.join("\n") + "\n"
    }

    /// Get the remote path rclone copies from
    fn remote_path(&self) -> String {
        match self.options.kind {
            // s3://bucket/path becomes remote:bucket/path
            DatasetType::S3 => {
                let trimmed = self.options.uri.trim_start_matches("s3://");
                format!("{REMOTE}:{trimmed}")
            }
            // the http base url lives in the config so copy the remote root
            _ => format!("{REMOTE}:"),
        }
    }
}

#[async_trait]
impl Loader for RcloneLoader {
    /// Copy the remote into a staging dir then rename into place
    ///
    /// # Arguments
    ///
    /// * `from_uri` - The uri to sync from
    /// * `to_path` - The path to sync into
    #[instrument(name = "RcloneLoader::sync", skip(self), err(Debug))]
    async fn sync(&self, from_uri: &str, to_path: &Path) -> Result<(), Error> {
        // materialize the scoped config for this run
        let config_path =
            std::env::temp_dir().join(format!("dataset-rclone-{}.conf", std::process::id()));
        std::fs::write(&config_path, self.render_config())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))?;
        }
        // copy into a staging dir so a failed run never leaves partial data
        // at the published path
        let staging = self
            .options
            .root
            .join(format!(".staging-{}", self.options.kind));
        std::fs::create_dir_all(&staging)?;
        let mut cmd = Command::new("rclone");
        cmd.arg("copy")
            .arg("--config")
            .arg(&config_path)
            .arg(self.remote_path())
            .arg(&staging);
        if !self.options.bandwidth_limit.is_empty() {
            cmd.arg("--bwlimit").arg(&self.options.bandwidth_limit);
        }
        let result = run_command(cmd).await;
        let _ = std::fs::remove_file(&config_path);
        result?;
        // publish the staged files into the root
        publish_staging(&staging, &self.options.root)?;
        event!(Level::INFO, root = %self.options.root.display(), "publish complete");
        Ok(())
    }
}

/// Rename everything inside a staging dir into its final home
///
/// # Arguments
///
/// * `staging` - The staging dir the copy landed in
/// * `root` - The final dir to publish into
pub(crate) fn publish_staging(staging: &Path, root: &Path) -> Result<(), Error> {
    for entry in std::fs::read_dir(staging)? {
        let entry = entry?;
        let target = root.join(entry.file_name());
        // replace any earlier rounds copy of this entry
        if target.exists() {
            if target.is_dir() {
                std::fs::remove_dir_all(&target)?;
            } else {
                std::fs::remove_file(&target)?;
            }
        }
        std::fs::rename(entry.path(), &target)?;
    }
    std::fs::remove_dir_all(staging)?;
    Ok(())
}
