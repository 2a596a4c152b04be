//! Materializes a conda or pip environment into a dataset volume

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{Level, event, instrument};

use datasets::Error;

use super::{Loader, Options, run_command};
use crate::secrets::Secrets;

/// Where the environment.yml config map lands when none is set
const DEFAULT_ENVIRONMENT_YML_PATH: &str = "/conda-env/environment.yml";
/// Where the requirements.txt config map lands when none is set
const DEFAULT_REQUIREMENTS_TXT_PATH: &str = "/conda-env/requirements.txt";
/// Where the scratch volume for the environment build is mounted
const DEFAULT_CONDA_PREFIX_DIR: &str = "/conda-dir";

/// The parsed options for a conda source
#[derive(Debug, Clone, PartialEq)]
pub struct CondaLoaderOptions {
    /// The name of the environment to build
    pub name: String,
    /// The python version to pin
    pub python_version: String,
    /// The pip index url to install from
    pub pip_index_url: String,
    /// An extra pip index url to also install from
    pub pip_extra_index_url: String,
    /// Where the environment.yml lives if one was mounted
    pub conda_environment_yml_path: PathBuf,
    /// Where the requirements.txt lives if one was mounted
    pub pip_requirements_txt_path: PathBuf,
    /// The scratch dir the environment is built under
    pub conda_prefix_dir: PathBuf,
    /// The package cache dir inside the scratch dir
    pub prefixing_pkgs_dir: PathBuf,
    /// The environments dir inside the scratch dir
    pub prefixing_envs_dir: PathBuf,
}

impl CondaLoaderOptions {
    /// Parse the raw option map for a conda source
    ///
    /// # Arguments
    ///
    /// * `options` - The raw option map to parse
    pub fn parse(options: &BTreeMap<String, String>) -> Result<Self, Error> {
        let name = options.get("name").cloned().unwrap_or_default();
        if name.is_empty() {
            return Err(Error::new("missing required options --options name=<env-name>"));
        }
        let get_or = |key: &str, fallback: &str| {
            options
                .get(key)
                .filter(|value| !value.is_empty())
                .cloned()
                .unwrap_or_else(|| fallback.to_owned())
        };
        let conda_prefix_dir = PathBuf::from(get_or("condaPrefixDir", DEFAULT_CONDA_PREFIX_DIR));
        let scratch = conda_prefix_dir.join(&name).join("conda");
        Ok(CondaLoaderOptions {
            python_version: options.get("pythonVersion").cloned().unwrap_or_default(),
            pip_index_url: options.get("pipIndexUrl").cloned().unwrap_or_default(),
            pip_extra_index_url: options.get("pipExtraIndexUrl").cloned().unwrap_or_default(),
            conda_environment_yml_path: PathBuf::from(get_or(
                "condaEnvironmentYmlPath",
                DEFAULT_ENVIRONMENT_YML_PATH,
            )),
            pip_requirements_txt_path: PathBuf::from(get_or(
                "pipRequirementsTxtPath",
                DEFAULT_REQUIREMENTS_TXT_PATH,
            )),
            conda_prefix_dir,
            prefixing_pkgs_dir: scratch.join("pkgs"),
            prefixing_envs_dir: scratch.join("envs"),
            name,
        })
    }

    /// The prefix the environment itself is created at
    pub fn env_prefix(&self) -> PathBuf {
        self.prefixing_envs_dir.join(&self.name)
    }

    /// The extra index urls as a list
    fn extra_index_urls(&self) -> Vec<String> {
        if self.pip_extra_index_url.is_empty() {
            Vec::new()
        } else {
            vec![self.pip_extra_index_url.clone()]
        }
    }
}

/// Materializes a conda or pip environment with mamba, pip, and rclone
#[derive(Debug)]
pub struct CondaLoader {
    /// The shared loader options
    options: Options,
    /// The parsed conda options
    pub loader_options: CondaLoaderOptions,
}

impl CondaLoader {
    /// Build a new conda loader
    ///
    /// # Arguments
    ///
    /// * `datasource_options` - The source specific option map
    /// * `options` - The shared loader options
    /// * `_secrets` - The mounted credentials (indexes are configured by url)
    pub fn new(
        datasource_options: BTreeMap<String, String>,
        options: Options,
        _secrets: Secrets,
    ) -> Result<Self, Error> {
        let loader_options = CondaLoaderOptions::parse(&datasource_options)?;
        Ok(CondaLoader {
            options,
            loader_options,
        })
    }

    /// The published package cache dir inside the dataset volume
    fn final_pkgs_dir(&self) -> PathBuf {
        self.options.root.join("conda/pkgs")
    }

    /// The published environments dir inside the dataset volume
    fn final_envs_dir(&self) -> PathBuf {
        self.options.root.join("conda/envs")
    }

    /// Write content into a scratch file that cleans itself up
    ///
    /// # Arguments
    ///
    /// * `name` - The file name to write
    /// * `content` - The bytes to write
    fn write_temp(&self, name: &str, content: &[u8]) -> Result<TempFile, Error> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|since| since.subsec_nanos())
            .unwrap_or_default();
        let dir = std::env::temp_dir().join(format!(
            "dataset-conda-{}-{nanos}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, content)?;
        Ok(TempFile { path, dir })
    }

    /// Run a mamba subcommand and log its output
    ///
    /// # Arguments
    ///
    /// * `args` - The args to pass to mamba
    async fn run_mamba(&self, args: &[&str]) -> Result<(), Error> {
        let mut cmd = Command::new("mamba");
        cmd.args(args);
        let output = run_command(cmd).await?;
        event!(
            Level::INFO,
            args = args.join(" "),
            output = %String::from_utf8_lossy(&output.stdout),
        );
        Ok(())
    }

    /// Install the mounted requirements.txt into the environment
    async fn pip_install(&self) -> Result<(), Error> {
        let opts = &self.loader_options;
        // point pip at the configured indexes when any are set
        let pip_conf = if opts.pip_index_url.is_empty() && opts.pip_extra_index_url.is_empty() {
            None
        } else {
            let rendered = render_pip_config(&opts.pip_index_url, &opts.extra_index_urls())?;
            Some(self.write_temp("pip.conf", rendered.as_bytes())?)
        };
        let mut cmd = Command::new(opts.env_prefix().join("bin/pip"));
        cmd.arg("install")
            .arg("-r")
            .arg(&opts.pip_requirements_txt_path);
        if let Some(pip_conf) = &pip_conf {
            cmd.env("PIP_CONFIG_FILE", &pip_conf.path);
        }
        run_command(cmd).await?;
        Ok(())
    }

    /// Publish a built dir into the dataset volume with rclone
    ///
    /// # Arguments
    ///
    /// * `from` - The built dir to publish
    /// * `to` - The final dir inside the volume
    /// * `copy_links` - Whether to materialize symlinks as files
    async fn publish(&self, from: &Path, to: &Path, copy_links: bool) -> Result<(), Error> {
        let mut cmd = Command::new("rclone");
        cmd.arg("copyto").arg(from).arg(to);
        if copy_links {
            cmd.arg("--copy-links");
        }
        run_command(cmd).await?;
        Ok(())
    }

    /// Build the environment from a mounted environment.yml with mamba
    async fn sync_with_mamba(&self, requirements: bool) -> Result<(), Error> {
        let opts = &self.loader_options;
        // surface the resolver setup in the logs before building
        self.run_mamba(&["--version"]).await?;
        self.run_mamba(&["info", "--json"]).await?;
        self.run_mamba(&["env", "list", "--json"]).await?;
        // normalize the mounted environment before handing it to mamba
        let raw = std::fs::read_to_string(&opts.conda_environment_yml_path)?;
        let environment: Value = serde_yaml::from_str(&raw)?;
        let normalized = normalize_environment_yaml(
            environment,
            &opts.name,
            &opts.python_version,
            &opts.pip_index_url,
            &opts.extra_index_urls(),
            &opts.env_prefix().to_string_lossy(),
        )?;
        let rendered = serde_yaml::to_string(&normalized)?;
        let temp = self.write_temp("environment.yml", rendered.as_bytes())?;
        let temp_path = temp.path.to_string_lossy().into_owned();
        self.run_mamba(&["env", "create", "--file", &temp_path]).await?;
        if requirements {
            self.pip_install().await?;
        }
        self.run_mamba(&["clean", "--all", "-y"]).await?;
        self.publish(&opts.prefixing_pkgs_dir, &self.final_pkgs_dir(), false)
            .await?;
        self.publish(&opts.prefixing_envs_dir, &self.final_envs_dir(), false)
            .await
    }

    /// Build a plain virtual environment when only requirements.txt exists
    async fn sync_with_venv(&self) -> Result<(), Error> {
        let opts = &self.loader_options;
        let mut cmd = Command::new("python3");
        cmd.arg("-m").arg("venv").arg(opts.env_prefix());
        run_command(cmd).await?;
        self.pip_install().await?;
        // venvs have no package cache but readers still expect the dir
        std::fs::create_dir_all(self.final_pkgs_dir())?;
        self.publish(&opts.prefixing_envs_dir, &self.final_envs_dir(), true)
            .await
    }
}

#[async_trait]
impl Loader for CondaLoader {
    /// Build the environment and publish it into the dataset volume
    ///
    /// # Arguments
    ///
    /// * `from_uri` - The uri to sync from
    /// * `to_path` - The path to sync into
    #[instrument(name = "CondaLoader::sync", skip(self), err(Debug))]
    async fn sync(&self, from_uri: &str, to_path: &Path) -> Result<(), Error> {
        let opts = &self.loader_options;
        let environment = opts.conda_environment_yml_path.exists();
        let requirements = opts.pip_requirements_txt_path.exists();
        if !environment && !requirements {
            return Err(Error::new(format!(
                "neither {} nor {} exists, one is required",
                opts.conda_environment_yml_path.display(),
                opts.pip_requirements_txt_path.display()
            )));
        }
        std::fs::create_dir_all(&opts.prefixing_pkgs_dir)?;
        std::fs::create_dir_all(&opts.prefixing_envs_dir)?;
        if environment {
            self.sync_with_mamba(requirements).await
        } else {
            self.sync_with_venv().await
        }
    }
}

/// A scratch file removed along with its dir on drop
#[derive(Debug)]
struct TempFile {
    /// The scratch file itself
    path: PathBuf,
    /// The dir holding the scratch file
    dir: PathBuf,
}

impl Drop for TempFile {
    /// Remove the scratch dir
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Force an environment.yml into the shape the loader builds from
///
/// # Arguments
///
/// * `environment` - The parsed environment.yml
/// * `name` - The environment name to force
/// * `python_version` - The python version to pin
/// * `index_url` - The pip index url
/// * `extra_index_urls` - Any extra pip index urls
/// * `env_prefix` - The prefix the environment is created at
pub fn normalize_environment_yaml(
    environment: Value,
    name: &str,
    python_version: &str,
    index_url: &str,
    extra_index_urls: &[String],
    env_prefix: &str,
) -> Result<Value, Error> {
    let mut mapping = match environment {
        Value::Mapping(mapping) => mapping,
        Value::Null => Mapping::new(),
        _ => return Err(Error::new("environment.yml must be a yaml mapping")),
    };
    mapping.insert(Value::from("name"), Value::from(name));
    // channels default to the well known pair when none are set
    let channels_empty = match mapping.get("channels") {
        Some(Value::Sequence(seq)) => seq.is_empty(),
        _ => true,
    };
    if channels_empty {
        mapping.insert(
            Value::from("channels"),
            Value::Sequence(vec![Value::from("defaults"), Value::from("conda-forge")]),
        );
    }
    let mut mapping =
        assign_essential_dependencies(mapping, python_version, index_url, extra_index_urls)?;
    mapping.insert(Value::from("default_threads"), Value::from(4u64));
    mapping.insert(Value::from("prefix"), Value::from(env_prefix));
    Ok(Value::Mapping(mapping))
}

/// Pin the python and pip dependencies an environment always needs
///
/// Any `python=`/`pip=` entries the user supplied are stripped first so the
/// result carries exactly one of each.
///
/// # Arguments
///
/// * `environment` - The environment mapping to update
/// * `python_version` - The python version to pin
/// * `index_url` - The pip index url
/// * `extra_index_urls` - Any extra pip index urls
pub fn assign_essential_dependencies(
    mut environment: Mapping,
    python_version: &str,
    index_url: &str,
    extra_index_urls: &[String],
) -> Result<Mapping, Error> {
    let mut dependencies = match environment.remove("dependencies") {
        Some(Value::Sequence(seq)) => seq,
        _ => Vec::new(),
    };
    // strip any user pinned python/pip and any earlier run of ours so the
    // entries appended below exist exactly once
    dependencies.retain(|dep| match dep {
        Value::String(dep) => {
            !dep.starts_with("python=")
                && !dep.starts_with("pip=")
                && !matches!(dep.as_str(), "pip" | "ipykernel" | "nb_conda_kernels" | "notebook")
        }
        Value::Mapping(mapping) => mapping.get("pip").is_none(),
        _ => true,
    });
    dependencies.push(Value::from(format!("python={python_version}")));
    dependencies.push(Value::from("pip"));
    dependencies.push(Value::from("ipykernel"));
    dependencies.push(Value::from("nb_conda_kernels"));
    dependencies.push(Value::from("notebook"));
    // tell pip inside the environment where to install from
    let mut pip_options = Vec::new();
    if !index_url.is_empty() {
        pip_options.push(Value::from(format!("--index-url {index_url}")));
    }
    for extra in extra_index_urls {
        pip_options.push(Value::from(format!("--extra-index-url {extra}")));
    }
    for host in trusted_hosts(index_url, extra_index_urls) {
        pip_options.push(Value::from(format!("--trusted-host {host}")));
    }
    if !pip_options.is_empty() {
        let mut pip = Mapping::new();
        pip.insert(Value::from("pip"), Value::Sequence(pip_options));
        dependencies.push(Value::Mapping(pip));
    }
    environment.insert(Value::from("dependencies"), Value::Sequence(dependencies));
    Ok(environment)
}

/// Get the hosts of every configured index url in order
///
/// # Arguments
///
/// * `index_url` - The pip index url
/// * `extra_index_urls` - Any extra pip index urls
fn trusted_hosts(index_url: &str, extra_index_urls: &[String]) -> Vec<String> {
    let mut hosts = Vec::new();
    for raw in std::iter::once(index_url).chain(extra_index_urls.iter().map(String::as_str)) {
        if raw.is_empty() {
            continue;
        }
        if let Ok(parsed) = url::Url::parse(raw) {
            if let Some(host) = parsed.host_str() {
                hosts.push(host.to_owned());
            }
        }
    }
    hosts
}

/// Render the pip.conf matching the configured indexes
///
/// Single values render inline, lists render one per line, and empty
/// settings are omitted entirely.
///
/// # Arguments
///
/// * `index_url` - The pip index url
/// * `extra_index_urls` - Any extra pip index urls
pub fn render_pip_config(index_url: &str, extra_index_urls: &[String]) -> Result<String, Error> {
    let mut rendered = String::from("[global]\n");
    if !index_url.is_empty() {
        rendered.push_str(&format!("index-url = {index_url}\n"));
    }
    render_setting(&mut rendered, "extra-index-url", extra_index_urls);
    let hosts = trusted_hosts(index_url, extra_index_urls);
    render_setting(&mut rendered, "trusted-host", &hosts);
    Ok(rendered)
}

/// Render one pip.conf setting inline or as a list
///
/// # Arguments
///
/// * `rendered` - The config being built
/// * `key` - The setting name
/// * `values` - The values to render
fn render_setting(rendered: &mut String, key: &str, values: &[String]) {
    match values {
        [] => (),
        [single] => rendered.push_str(&format!("{key} = {single}\n")),
        many => {
            rendered.push_str(&format!("{key} =\n"));
            for value in many {
                rendered.push_str(&format!("    {value}\n"));
            }
        }
    }
}
