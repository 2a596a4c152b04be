//! Generates and observes the loader jobs that populate dataset volumes

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, SecretVolumeSource,
    Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{Level, event, instrument};

use datasets::Error;
use datasets::conf::Conf;
use datasets::consts::{DATA_MOUNT_PATH, DATASET_NAME_LABEL, SECRETS_MOUNT_PATH};
use datasets::models::Dataset;

use super::cluster::ClusterApi;

/// The observed state of a loader job
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    /// The job was just submitted
    NotYet,
    /// The job is still running
    Running,
    /// The job finished the round
    Succeeded,
    /// The job failed with a terminal message
    Failed(String),
}

/// Get the name of the loader job for a datasets current round
///
/// # Arguments
///
/// * `dataset` - The dataset being synced
pub fn loader_job_name(dataset: &Dataset) -> String {
    format!(
        "dataset-{}-r{}",
        dataset.name_any(),
        dataset.spec.data_sync_round
    )
}

/// Ensure a loader job exists for the current round and observe it
///
/// # Arguments
///
/// * `cluster` - The cluster api to go through
/// * `conf` - The controller config
/// * `dataset` - The dataset being synced
/// * `claim` - The bound claim to mount at the data path
#[instrument(name = "jobs::reconcile_loader_job", skip_all, err(Debug))]
pub async fn reconcile_loader_job<C: ClusterApi>(
    cluster: &C,
    conf: &Conf,
    dataset: &Dataset,
    claim: &str,
) -> Result<JobState, Error> {
    let namespace = dataset
        .namespace()
        .ok_or_else(|| Error::new("dataset has no namespace"))?;
    let name = loader_job_name(dataset);
    match cluster.get_job(&namespace, &name).await? {
        Some(job) => Ok(job_state(&job)),
        None => {
            let job = build_loader_job(conf, dataset, claim, &name, &namespace);
            cluster.create_job(&namespace, &job).await?;
            event!(Level::INFO, job = name, "submitted loader job");
            Ok(JobState::NotYet)
        }
    }
}

/// Read the terminal conditions off a job
///
/// # Arguments
///
/// * `job` - The job to inspect
pub fn job_state(job: &Job) -> JobState {
    let Some(status) = &job.status else {
        return JobState::Running;
    };
    if let Some(conditions) = &status.conditions {
        for condition in conditions {
            if condition.status != "True" {
                continue;
            }
            match condition.type_.as_str() {
                "Complete" => return JobState::Succeeded,
                "Failed" => {
                    return JobState::Failed(condition.message.clone().unwrap_or_else(|| {
                        "loader job failed without a message".to_owned()
                    }));
                }
                _ => (),
            }
        }
    }
    JobState::Running
}

/// Build the args handed to the loader binary
///
/// # Arguments
///
/// * `dataset` - The dataset being synced
fn build_loader_args(dataset: &Dataset) -> Vec<String> {
    let source = &dataset.spec.source;
    let mut args = vec![
        "--kind".to_owned(),
        source.kind.to_string(),
        "--uri".to_owned(),
        source.uri.clone(),
        "--root".to_owned(),
        DATA_MOUNT_PATH.to_owned(),
        "--secrets-dir".to_owned(),
        SECRETS_MOUNT_PATH.to_owned(),
    ];
    for (key, value) in &source.options {
        args.push("--options".to_owned());
        args.push(format!("{key}={value}"));
    }
    if let Some(limit) = &dataset.spec.bandwidth_limit {
        args.push("--bandwidth-limit".to_owned());
        args.push(limit.clone());
    }
    args
}

/// Build the one shot job that runs a loader invocation
///
/// The claim mounts at the data path and the secret, when one is named,
/// at the secrets path. Credential bytes never ride on the job spec.
///
/// # Arguments
///
/// * `conf` - The controller config
/// * `dataset` - The dataset being synced
/// * `claim` - The bound claim to mount at the data path
/// * `name` - The name to give the job
/// * `namespace` - The namespace to create the job in
fn build_loader_job(
    conf: &Conf,
    dataset: &Dataset,
    claim: &str,
    name: &str,
    namespace: &str,
) -> Job {
    let mut labels = BTreeMap::new();
    labels.insert(DATASET_NAME_LABEL.to_owned(), dataset.name_any());
    let mut volumes = vec![Volume {
        name: "data".to_owned(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_owned(),
            read_only: None,
        }),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: "data".to_owned(),
        mount_path: DATA_MOUNT_PATH.to_owned(),
        ..Default::default()
    }];
    if let Some(secret) = &dataset.spec.source.secret_ref {
        volumes.push(Volume {
            name: "secrets".to_owned(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "secrets".to_owned(),
            mount_path: SECRETS_MOUNT_PATH.to_owned(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels.clone()),
            owner_references: dataset.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(conf.loader.backoff_limit),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_owned()),
                    containers: vec![Container {
                        name: "loader".to_owned(),
                        image: Some(conf.loader.image.clone()),
                        command: Some(vec!["/app/datasets-loader".to_owned()]),
                        args: Some(build_loader_args(dataset)),
                        volume_mounts: Some(mounts),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
