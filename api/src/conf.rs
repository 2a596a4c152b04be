//! The shared config for the dataset controller

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Helps serde default a value to false
fn default_false() -> bool {
    false
}

/// Helps serde default the loader image
fn default_loader_image() -> String {
    "datasets/loader:latest".to_owned()
}

/// Helps serde default the loader job backoff limit
fn default_backoff_limit() -> i32 {
    3
}

/// Settings for the loader jobs the controller submits
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoaderConf {
    /// The image loader jobs run
    #[serde(default = "default_loader_image")]
    pub image: String,
    /// How many times k8s may retry a failed loader pod
    #[serde(default = "default_backoff_limit")]
    pub backoff_limit: i32,
}

impl Default for LoaderConf {
    /// Create a default `LoaderConf` object
    fn default() -> Self {
        LoaderConf {
            image: default_loader_image(),
            backoff_limit: default_backoff_limit(),
        }
    }
}

/// Helps serde default the requeue base to 5 seconds
fn default_requeue_base() -> u64 {
    5
}

/// Helps serde default the requeue cap to 300 seconds
fn default_requeue_max() -> u64 {
    300
}

/// Settings for how reconciles are requeued after errors
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequeueConf {
    /// The first backoff in seconds
    #[serde(default = "default_requeue_base")]
    pub base_secs: u64,
    /// The backoff cap in seconds
    #[serde(default = "default_requeue_max")]
    pub max_secs: u64,
}

impl Default for RequeueConf {
    /// Create a default `RequeueConf` object
    fn default() -> Self {
        RequeueConf {
            base_secs: default_requeue_base(),
            max_secs: default_requeue_max(),
        }
    }
}

/// The process wide config for the dataset controller
///
/// This is read once at startup and is read only afterwards. A reconcile in
/// flight always observes a single consistent snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Conf {
    /// Whether deleting a shared dataset also deletes its referencing datasets
    #[serde(default = "default_false")]
    pub enable_cascading_deletion: bool,
    /// Settings for the loader jobs the controller submits
    #[serde(default)]
    pub loader: LoaderConf,
    /// Settings for how reconciles are requeued after errors
    #[serde(default)]
    pub requeue: RequeueConf,
}

impl Conf {
    /// Creates a new [Conf] object
    ///
    /// # Arguments
    ///
    /// * `path` - The path to use when reading the config file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            // load from a file first
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Yaml))
            // then overlay any environment args ontop
            .add_source(
                config::Environment::with_prefix("datasets")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// Creates a new [Conf] object from raw yaml content
    ///
    /// # Arguments
    ///
    /// * `content` - The raw yaml to parse
    pub fn from_yaml(content: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()
    }
}
