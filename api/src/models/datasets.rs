//! The Dataset custom resource and its helpers

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Error;

/// The condition set when a claim has been bound for a dataset
pub const CONDITION_CLAIM_READY: &str = "ClaimReady";
/// The condition set when a sync round reaches a terminal state
pub const CONDITION_SYNCED: &str = "SyncSucceeded";
/// The condition set when a dataset spec fails validation
pub const CONDITION_SPEC_VALID: &str = "SpecValid";
/// The warning condition set when a reference chain loops back on itself
pub const CONDITION_REFERENCE_CYCLE: &str = "ReferenceCycle";

/// The kinds of remote sources a dataset can be populated from
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DatasetType {
    /// A git repository
    Git,
    /// An http/https url
    Http,
    /// An s3 compatible object store
    S3,
    /// An HDFS cluster path
    Hdfs,
    /// A relational database
    Database,
    /// A conda/pip environment to materialize
    Conda,
    /// A hugging face hub repo
    Huggingface,
    /// A model scope hub repo
    Modelscope,
    /// A shared dataset in another namespace
    Reference,
}

/// Where a dataset gets its bytes from
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSource {
    /// The kind of source to pull from
    #[serde(rename = "type")]
    pub kind: DatasetType,
    /// The uri to pull from
    pub uri: String,
    /// Source specific options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// The name of the secret to mount into the loader job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

impl DatasetSource {
    /// Check this source is well formed before any claim or job is created
    ///
    /// The messages raised here are stable strings callers match on.
    pub fn validate(&self) -> Result<(), Error> {
        match self.kind {
            DatasetType::Git => {
                // git accepts urls we cannot parse (scp style) so only require one is set
                if self.uri.is_empty() {
                    return Err(Error::new("git source requires a uri"));
                }
            }
            DatasetType::Http => require_scheme(&self.uri, &["http", "https"])?,
            DatasetType::S3 => require_scheme(&self.uri, &["s3"])?,
            DatasetType::Hdfs => {
                require_scheme(&self.uri, &["hdfs"])?;
                if self
                    .options
                    .get("sourcePath")
                    .map(|path| path.trim().is_empty())
                    .unwrap_or(true)
                {
                    return Err(Error::new(
                        "sourcePath option is required and must not be empty",
                    ));
                }
            }
            DatasetType::Database => {
                require_scheme(&self.uri, &["database"])?;
                if self
                    .options
                    .get("tables")
                    .map(|tables| tables.trim().is_empty())
                    .unwrap_or(true)
                {
                    return Err(Error::new("no table specified"));
                }
            }
            DatasetType::Conda => {
                if self
                    .options
                    .get("name")
                    .map(|name| name.is_empty())
                    .unwrap_or(true)
                {
                    return Err(Error::new("missing required options --options name=<env-name>"));
                }
            }
            DatasetType::Huggingface | DatasetType::Modelscope => {
                if self.uri.is_empty() {
                    return Err(Error::new(format!("{} source requires a uri", self.kind)));
                }
            }
            DatasetType::Reference => {
                parse_reference_uri(&self.uri)?;
            }
        }
        Ok(())
    }
}

/// Require a uri to carry one of the given schemes
///
/// # Arguments
///
/// * `uri` - The uri to check
/// * `schemes` - The schemes this uri may carry
fn require_scheme(uri: &str, schemes: &[&str]) -> Result<(), Error> {
    let parsed = url::Url::parse(uri)?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(Error::new(format!(
            "invalid scheme {}, only {} is supported",
            parsed.scheme(),
            schemes.join("/")
        )));
    }
    Ok(())
}

/// Parse a `dataset://<namespace>/<name>` reference uri
///
/// # Arguments
///
/// * `uri` - The reference uri to parse
pub fn parse_reference_uri(uri: &str) -> Result<(String, String), Error> {
    let invalid = || {
        Error::new(format!(
            "invalid reference uri {uri}, expected dataset://<namespace>/<name>"
        ))
    };
    let trimmed = uri.strip_prefix("dataset://").ok_or_else(invalid)?;
    match trimmed.split_once('/') {
        Some((namespace, name))
            if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((namespace.to_owned(), name.to_owned()))
        }
        _ => Err(invalid()),
    }
}

/// Serde helper for the default claim access modes
fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteMany".to_owned()]
}

/// The storage asked for when a claim is created for a dataset
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatasetResources {
    /// The size to request on the claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    /// The access modes to request on the claim
    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,
}

impl Default for DatasetResources {
    /// Create a default `DatasetResources` object
    fn default() -> Self {
        DatasetResources {
            storage: None,
            access_modes: default_access_modes(),
        }
    }
}

/// The Dataset CRD definition
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "datasets.io",
    version = "v1alpha1",
    kind = "Dataset",
    namespaced,
    status = "DatasetStatus",
    shortname = "ds",
    doc = "Custom resource describing a volume to materialize from a remote source"
)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSpec {
    /// Where this dataset gets its bytes from
    pub source: DatasetSource,
    /// Whether other namespaces may reference this dataset
    #[serde(default)]
    pub share: bool,
    /// An already existing claim to adopt instead of creating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_ref: Option<String>,
    /// The storage to request when a claim is created
    #[serde(default)]
    pub resources: DatasetResources,
    /// The monotonic counter that requests a resync when incremented
    #[serde(default)]
    pub data_sync_round: i64,
    /// An rclone style bandwidth limit for the loader job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_limit: Option<String>,
}

/// The phases a dataset moves through
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DatasetPhase {
    /// The dataset has been seen but not yet validated
    #[default]
    Pending,
    /// A claim is being created or adopted
    Claiming,
    /// A loader job is running for the current round
    Syncing,
    /// The current round has been synced
    Ready,
    /// The spec is invalid or the last loader job failed
    Failed,
}

/// A single observation about a dataset
///
/// At most one condition exists per type.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatasetCondition {
    /// The type of this condition
    #[serde(rename = "type")]
    pub kind: String,
    /// Whether this condition holds (True/False)
    pub status: String,
    /// A machine readable reason for the last transition
    pub reason: String,
    /// A human readable message for the last transition
    pub message: String,
    /// When this conditions status last flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

/// The observed state of a dataset
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatasetStatus {
    /// The phase this dataset is currently in
    #[serde(default)]
    pub phase: DatasetPhase,
    /// The claim backing this dataset once one is bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_name: Option<String>,
    /// The set of observations about this dataset
    #[serde(default)]
    pub conditions: Vec<DatasetCondition>,
    /// The last round that reached a successful terminal sync
    #[serde(default)]
    pub last_synced_round: i64,
    /// The generation the controller last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl DatasetStatus {
    /// Set a condition, replacing any existing condition of the same type
    ///
    /// The transition time is only bumped when the status actually flips.
    ///
    /// # Arguments
    ///
    /// * `kind` - The type of condition to set
    /// * `status` - Whether this condition holds
    /// * `reason` - A machine readable reason
    /// * `message` - A human readable message
    pub fn set_condition<R: Into<String>, M: Into<String>>(
        &mut self,
        kind: &str,
        status: bool,
        reason: R,
        message: M,
    ) {
        let status = if status { "True" } else { "False" };
        // find any existing condition of this type
        if let Some(existing) = self.conditions.iter_mut().find(|cond| cond.kind == kind) {
            if existing.status != status {
                existing.last_transition_time = Some(Time(Utc::now()));
            }
            existing.status = status.to_owned();
            existing.reason = reason.into();
            existing.message = message.into();
        } else {
            self.conditions.push(DatasetCondition {
                kind: kind.to_owned(),
                status: status.to_owned(),
                reason: reason.into(),
                message: message.into(),
                last_transition_time: Some(Time(Utc::now())),
            });
        }
    }

    /// Get a condition by type if one is set
    ///
    /// # Arguments
    ///
    /// * `kind` - The type of condition to get
    pub fn condition(&self, kind: &str) -> Option<&DatasetCondition> {
        self.conditions.iter().find(|cond| cond.kind == kind)
    }
}

impl Dataset {
    /// Get the last segment of this datasets uid
    pub fn uid_suffix(&self) -> Option<String> {
        self.uid()
            .and_then(|uid| uid.rsplit('-').next().map(str::to_owned))
    }

    /// Get the name of the claim backing this dataset
    ///
    /// A claim named in the spec wins over the deterministic name.
    pub fn claim_name(&self) -> String {
        match &self.spec.volume_claim_ref {
            Some(claim) => claim.clone(),
            None => format!("dataset-{}", self.name_any()),
        }
    }

    /// Get the name a retained volume for this dataset carries
    pub fn retained_pv_name(&self) -> Option<String> {
        let namespace = self.namespace()?;
        let suffix = self.uid_suffix()?;
        Some(format!("dataset-{}-{}-{}", namespace, self.name_any(), suffix))
    }

    /// Get the uri other datasets use to reference this one
    pub fn reference_uri(&self) -> String {
        format!(
            "dataset://{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
