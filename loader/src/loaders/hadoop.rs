//! Syncs a dataset from an HDFS cluster

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use tracing::{Level, event, instrument};

use datasets::Error;

use super::{Loader, Options, run_command};
use crate::secrets::Secrets;

/// Syncs a dataset from an HDFS cluster with the hdfs cli
#[derive(Debug)]
pub struct HadoopLoader {
    /// The shared loader options
    options: Options,
    /// The path inside the cluster to copy
    source_path: String,
}

impl HadoopLoader {
    /// Build a new hdfs loader
    ///
    /// # Arguments
    ///
    /// * `datasource_options` - The source specific option map
    /// * `options` - The shared loader options
    /// * `_secrets` - The mounted credentials (unused, hdfs auth is ambient)
    pub fn new(
        datasource_options: BTreeMap<String, String>,
        options: Options,
        _secrets: Secrets,
    ) -> Result<Self, Error> {
        let source_path = datasource_options
            .get("sourcePath")
            .map(|path| path.trim().to_owned())
            .unwrap_or_default();
        if source_path.is_empty() {
            return Err(Error::new(
                "sourcePath option is required and must not be empty",
            ));
        }
        Ok(HadoopLoader {
            options,
            source_path,
        })
    }
}

#[async_trait]
impl Loader for HadoopLoader {
    /// Copy the source path out of the cluster into our root
    ///
    /// # Arguments
    ///
    /// * `from_uri` - The uri to sync from
    /// * `to_path` - The path to sync into
    #[instrument(name = "HadoopLoader::sync", skip(self), err(Debug))]
    async fn sync(&self, from_uri: &str, to_path: &Path) -> Result<(), Error> {
        let parsed = url::Url::parse(&self.options.uri)?;
        if parsed.scheme() != "hdfs" {
            return Err(Error::new(format!(
                "invalid scheme {}, only hdfs is supported",
                parsed.scheme()
            )));
        }
        // the -- stops option injection through the source path and -f makes
        // overwriting an existing file succeed
        let mut cmd = Command::new("hdfs");
        cmd.arg("dfs")
            .arg("-get")
            .arg("-f")
            .arg("--")
            .arg(&self.source_path)
            .arg(&self.options.root);
        let output = run_command(cmd).await?;
        event!(
            Level::INFO,
            source_path = self.source_path,
            output = %String::from_utf8_lossy(&output.stdout),
            "hdfs get complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasets::models::DatasetType;
    use std::path::PathBuf;

    /// Build shared options for testing
    fn options(uri: &str) -> Options {
        Options {
            root: PathBuf::from("/tmp/test-root"),
            uri: uri.to_owned(),
            kind: DatasetType::Hdfs,
            bandwidth_limit: String::new(),
        }
    }

    #[test]
    fn new_with_valid_options() {
        let mut raw = BTreeMap::new();
        raw.insert("sourcePath".to_owned(), "/path/to/hdfs/data".to_owned());
        let loader =
            HadoopLoader::new(raw, options("hdfs://namenode:9000"), Secrets::default()).unwrap();
        assert_eq!(loader.source_path, "/path/to/hdfs/data");
    }

    #[test]
    fn new_with_missing_source_path() {
        let error =
            HadoopLoader::new(BTreeMap::new(), options("hdfs://namenode:9000"), Secrets::default())
                .unwrap_err();
        assert!(
            error
                .msg()
                .contains("sourcePath option is required and must not be empty")
        );
    }

    #[test]
    fn extra_options_are_ignored() {
        let mut raw = BTreeMap::new();
        raw.insert("sourcePath".to_owned(), "/path/to/hdfs/data".to_owned());
        raw.insert("extraField".to_owned(), "someValue".to_owned());
        let loader =
            HadoopLoader::new(raw, options("hdfs://namenode:9000"), Secrets::default()).unwrap();
        assert_eq!(loader.source_path, "/path/to/hdfs/data");
    }

    #[tokio::test]
    async fn sync_with_invalid_scheme() {
        let mut raw = BTreeMap::new();
        raw.insert("sourcePath".to_owned(), "/hdfs/source/path".to_owned());
        let loader =
            HadoopLoader::new(raw, options("http://example.com"), Secrets::default()).unwrap();
        let error = loader
            .sync("http://example.com/path", Path::new("/tmp/output"))
            .await
            .unwrap_err();
        assert!(
            error
                .msg()
                .contains("invalid scheme http, only hdfs is supported")
        );
    }

    #[tokio::test]
    async fn sync_with_malformed_uri() {
        let mut raw = BTreeMap::new();
        raw.insert("sourcePath".to_owned(), "/hdfs/source/path".to_owned());
        let loader = HadoopLoader::new(raw, options("://invalid-uri"), Secrets::default()).unwrap();
        assert!(
            loader
                .sync("://invalid-uri", Path::new("/tmp/output"))
                .await
                .is_err()
        );
    }
}
