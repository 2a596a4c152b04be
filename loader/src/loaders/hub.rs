//! Syncs datasets from model hub services over their git endpoints

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{Level, event, instrument};

use datasets::Error;

use super::git::GitLoader;
use super::{Loader, Options};
use crate::secrets::Secrets;

/// The default hugging face endpoint
const HUGGINGFACE_ENDPOINT: &str = "https://huggingface.co";
/// The default model scope endpoint
const MODELSCOPE_ENDPOINT: &str = "https://www.modelscope.cn";

/// The wrapper every hub api response comes in
#[derive(Debug, Clone, Deserialize)]
pub struct HubResponse<T> {
    /// The hub level status code
    #[serde(rename = "Code")]
    pub code: i64,
    /// A message describing any failure
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
    /// The payload of this response
    #[serde(rename = "Data", default)]
    pub data: Option<T>,
}

/// The payload of a login response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubLogin {
    /// The session token handed back by the hub
    #[serde(rename = "AccessToken", default)]
    pub access_token: Option<String>,
}

/// The capabilities a model hub exposes over https
#[async_trait]
pub trait HubApi: Send + Sync {
    /// Exchange an access token for a hub session
    ///
    /// # Arguments
    ///
    /// * `token` - The access token to log in with
    async fn login(&self, token: &str) -> Result<HubResponse<HubLogin>, Error>;
}

/// A reqwest backed client for a model hub
pub struct HubClient {
    /// The base url of the hub
    endpoint: String,
    /// The shared http client
    client: reqwest::Client,
}

impl HubClient {
    /// Build a new hub client
    ///
    /// # Arguments
    ///
    /// * `endpoint` - The base url of the hub
    pub fn new<T: Into<String>>(endpoint: T) -> Self {
        HubClient {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HubApi for HubClient {
    /// Exchange an access token for a hub session
    ///
    /// # Arguments
    ///
    /// * `token` - The access token to log in with
    async fn login(&self, token: &str) -> Result<HubResponse<HubLogin>, Error> {
        let response = self
            .client
            .post(format!("{}/api/v1/login", self.endpoint))
            .json(&serde_json::json!({ "AccessToken": token }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::new(format!(
                "login to {} failed with status {}",
                self.endpoint,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

/// Build the git url for a hub repo
///
/// Full urls pass through, bare `org/repo` paths are joined onto the
/// endpoint, dataset repos get the hubs dataset prefix.
///
/// # Arguments
///
/// * `endpoint` - The base url of the hub
/// * `uri` - The raw repo uri from the dataset spec
/// * `repo_type` - Whether this is a model or dataset repo
fn repo_url(endpoint: &str, uri: &str, repo_type: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.to_owned();
    }
    let path = match repo_type {
        "dataset" => format!("datasets/{uri}"),
        _ => uri.to_owned(),
    };
    format!("{endpoint}/{path}.git")
}

/// Syncs a hugging face repo by cloning its git endpoint
pub struct HuggingfaceLoader {
    /// The git loader doing the actual transfer
    git: GitLoader,
}

impl HuggingfaceLoader {
    /// Build a new hugging face loader
    ///
    /// # Arguments
    ///
    /// * `datasource_options` - The source specific option map
    /// * `options` - The shared loader options
    /// * `secrets` - The mounted credentials
    pub fn new(
        datasource_options: BTreeMap<String, String>,
        mut options: Options,
        secrets: Secrets,
    ) -> Result<Self, Error> {
        let endpoint = datasource_options
            .get("endpoint")
            .map(String::as_str)
            .unwrap_or(HUGGINGFACE_ENDPOINT);
        let repo_type = datasource_options
            .get("repoType")
            .map(String::as_str)
            .unwrap_or("model");
        options.uri = repo_url(endpoint, &options.uri, repo_type);
        let git = GitLoader::new(datasource_options, options, secrets)?;
        Ok(HuggingfaceLoader { git })
    }
}

#[async_trait]
impl Loader for HuggingfaceLoader {
    /// Clone the hub repo into our root
    ///
    /// # Arguments
    ///
    /// * `from_uri` - The uri to sync from
    /// * `to_path` - The path to sync into
    #[instrument(name = "HuggingfaceLoader::sync", skip(self), err(Debug))]
    async fn sync(&self, from_uri: &str, to_path: &Path) -> Result<(), Error> {
        self.git.sync(from_uri, to_path).await
    }
}

/// Syncs a model scope repo after logging into its hub api
pub struct ModelscopeLoader {
    /// The git loader doing the actual transfer
    git: GitLoader,
    /// The hub api used to log in
    hub: Box<dyn HubApi>,
    /// The access token read from the mounted secret
    token: Option<String>,
}

impl ModelscopeLoader {
    /// Build a new model scope loader
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
        let endpoint = datasource_options
            .get("endpoint")
            .cloned()
            .unwrap_or_else(|| MODELSCOPE_ENDPOINT.to_owned());
        let hub = Box::new(HubClient::new(endpoint));
        Self::with_hub(datasource_options, options, secrets, hub)
    }

    /// Build a new model scope loader against a specific hub api
    ///
    /// # Arguments
    ///
    /// * `datasource_options` - The source specific option map
    /// * `options` - The shared loader options
    /// * `secrets` - The mounted credentials
    /// * `hub` - The hub api to log in against
    pub fn with_hub(
        datasource_options: BTreeMap<String, String>,
        mut options: Options,
        secrets: Secrets,
        hub: Box<dyn HubApi>,
    ) -> Result<Self, Error> {
        let endpoint = datasource_options
            .get("endpoint")
            .map(String::as_str)
            .unwrap_or(MODELSCOPE_ENDPOINT);
        let repo_type = datasource_options
            .get("repoType")
            .map(String::as_str)
            .unwrap_or("model");
        options.uri = repo_url(endpoint, &options.uri, repo_type);
        let token = secrets.token.as_ref().map(|token| token.trim().to_owned());
        let git = GitLoader::new(datasource_options, options, secrets)?;
        Ok(ModelscopeLoader { git, hub, token })
    }

    /// Log into the hub when a token is mounted
    pub async fn login(&self) -> Result<(), Error> {
        let Some(token) = &self.token else {
            return Ok(());
        };
        let response = self.hub.login(token).await?;
        if response.code != 200 {
            return Err(Error::new(format!(
                "hub login failed with code {}: {}",
                response.code,
                response.message.unwrap_or_default()
            )));
        }
        event!(Level::INFO, "hub login succeeded");
        Ok(())
    }
}

#[async_trait]
impl Loader for ModelscopeLoader {
    /// Log into the hub then clone the repo into our root
    ///
    /// # Arguments
    ///
    /// * `from_uri` - The uri to sync from
    /// * `to_path` - The path to sync into
    #[instrument(name = "ModelscopeLoader::sync", skip(self), err(Debug))]
    async fn sync(&self, from_uri: &str, to_path: &Path) -> Result<(), Error> {
        self.login().await?;
        self.git.sync(from_uri, to_path).await
    }
}
