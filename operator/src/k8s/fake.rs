//! An in memory cluster api for exercising the reconciler in tests

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimStatus, PersistentVolumeSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Mutex;

use datasets::Error;
use datasets::consts::DATASET_NAME_LABEL;
use datasets::models::{
    Dataset, DatasetResources, DatasetSource, DatasetSpec, DatasetStatus, DatasetType,
};

use super::cluster::ClusterApi;

/// An in memory cluster the reconciler can be driven against
#[derive(Default)]
pub struct FakeCluster {
    /// The datasets in the cluster keyed by namespace and name
    datasets: Mutex<BTreeMap<(String, String), Dataset>>,
    /// The claims in the cluster keyed by namespace and name
    claims: Mutex<BTreeMap<(String, String), PersistentVolumeClaim>>,
    /// The volumes in the cluster keyed by name
    volumes: Mutex<BTreeMap<String, PersistentVolume>>,
    /// The jobs in the cluster keyed by namespace and name
    jobs: Mutex<BTreeMap<(String, String), Job>>,
}

impl FakeCluster {
    /// Seed this cluster with a dataset
    ///
    /// # Arguments
    ///
    /// * `dataset` - The dataset to add
    pub fn with_dataset(self, dataset: Dataset) -> Self {
        let key = (dataset.namespace().unwrap_or_default(), dataset.name_any());
        self.datasets.lock().unwrap().insert(key, dataset);
        self
    }

    /// Seed this cluster with a claim
    ///
    /// # Arguments
    ///
    /// * `claim` - The claim to add
    pub fn with_claim(self, claim: PersistentVolumeClaim) -> Self {
        let key = (claim.namespace().unwrap_or_default(), claim.name_any());
        self.claims.lock().unwrap().insert(key, claim);
        self
    }

    /// Seed this cluster with a volume
    ///
    /// # Arguments
    ///
    /// * `volume` - The volume to add
    pub fn with_volume(self, volume: PersistentVolume) -> Self {
        self.volumes
            .lock()
            .unwrap()
            .insert(volume.name_any(), volume);
        self
    }

    /// Seed this cluster with a job
    ///
    /// # Arguments
    ///
    /// * `job` - The job to add
    pub fn with_job(self, job: Job) -> Self {
        let key = (job.namespace().unwrap_or_default(), job.name_any());
        self.jobs.lock().unwrap().insert(key, job);
        self
    }

    /// Mark a job as finished, the way the job controller would
    ///
    /// # Arguments
    ///
    /// * `namespace` - The namespace of the job
    /// * `name` - The name of the job
    /// * `succeeded` - Whether the job succeeded or failed
    pub fn finish_job(&self, namespace: &str, name: &str, succeeded: bool) {
        let key = (namespace.to_owned(), name.to_owned());
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&key).expect("no such job to finish");
        let condition = if succeeded {
            JobCondition {
                type_: "Complete".to_owned(),
                status: "True".to_owned(),
                ..Default::default()
            }
        } else {
            JobCondition {
                type_: "Failed".to_owned(),
                status: "True".to_owned(),
                message: Some("exit status 1".to_owned()),
                ..Default::default()
            }
        };
        job.status = Some(JobStatus {
            conditions: Some(vec![condition]),
            ..Default::default()
        });
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_dataset(&self, namespace: &str, name: &str) -> Result<Option<Dataset>, Error> {
        let key = (namespace.to_owned(), name.to_owned());
        Ok(self.datasets.lock().unwrap().get(&key).cloned())
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>, Error> {
        Ok(self.datasets.lock().unwrap().values().cloned().collect())
    }

    async fn update_dataset(&self, dataset: &Dataset) -> Result<Dataset, Error> {
        let key = (dataset.namespace().unwrap_or_default(), dataset.name_any());
        self.datasets
            .lock()
            .unwrap()
            .insert(key, dataset.clone());
        Ok(dataset.clone())
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatasetStatus,
    ) -> Result<(), Error> {
        let key = (namespace.to_owned(), name.to_owned());
        let mut datasets = self.datasets.lock().unwrap();
        let dataset = datasets
            .get_mut(&key)
            .ok_or_else(|| Error::new(format!("dataset {namespace}/{name} not found")))?;
        dataset.status = Some(status.clone());
        Ok(())
    }

    async fn delete_dataset(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let key = (namespace.to_owned(), name.to_owned());
        let mut datasets = self.datasets.lock().unwrap();
        if let Some(dataset) = datasets.get_mut(&key) {
            // finalized resources are only marked for deletion, matching the
            // api servers behavior
            if dataset
                .metadata
                .finalizers
                .as_ref()
                .map(|finalizers| !finalizers.is_empty())
                .unwrap_or(false)
            {
                dataset.metadata.deletion_timestamp = Some(Time(Utc::now()));
            } else {
                datasets.remove(&key);
            }
        }
        Ok(())
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let key = (namespace.to_owned(), name.to_owned());
        Ok(self.claims.lock().unwrap().get(&key).cloned())
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let key = (namespace.to_owned(), claim.name_any());
        let mut created = claim.clone();
        // the fake provisioner binds instantly
        created.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_owned()),
            ..Default::default()
        });
        self.claims.lock().unwrap().insert(key, created.clone());
        Ok(created)
    }

    async fn list_volumes(&self, selector: &str) -> Result<Vec<PersistentVolume>, Error> {
        // only equality selectors are ever used
        let (key, value) = selector
            .split_once('=')
            .ok_or_else(|| Error::new(format!("unsupported selector {selector}")))?;
        Ok(self
            .volumes
            .lock()
            .unwrap()
            .values()
            .filter(|volume| {
                volume
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(key))
                    .map(|label| label == value)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), Error> {
        self.volumes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        let key = (namespace.to_owned(), name.to_owned());
        Ok(self.jobs.lock().unwrap().get(&key).cloned())
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, Error> {
        let key = (namespace.to_owned(), job.name_any());
        self.jobs.lock().unwrap().insert(key, job.clone());
        Ok(job.clone())
    }
}

/// Build a dataset for testing
///
/// # Arguments
///
/// * `namespace` - The namespace the dataset lives in
/// * `name` - The name of the dataset
/// * `kind` - The kind of source it pulls from
/// * `uri` - The uri it pulls from
pub fn build_dataset(namespace: &str, name: &str, kind: DatasetType, uri: &str) -> Dataset {
    let mut dataset = Dataset::new(
        name,
        DatasetSpec {
            source: DatasetSource {
                kind,
                uri: uri.to_owned(),
                options: BTreeMap::default(),
                secret_ref: None,
            },
            share: false,
            volume_claim_ref: None,
            resources: DatasetResources::default(),
            data_sync_round: 0,
            bandwidth_limit: None,
        },
    );
    dataset.metadata.namespace = Some(namespace.to_owned());
    dataset
}

/// Build a bound claim labeled for a dataset
///
/// # Arguments
///
/// * `namespace` - The namespace the claim lives in
/// * `name` - The name of the claim
/// * `dataset_name` - The dataset name to label the claim with
pub fn bound_claim(namespace: &str, name: &str, dataset_name: &str) -> PersistentVolumeClaim {
    let mut labels = BTreeMap::new();
    labels.insert(DATASET_NAME_LABEL.to_owned(), dataset_name.to_owned());
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_owned()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build a retained volume labeled for a dataset
///
/// # Arguments
///
/// * `name` - The name of the volume
/// * `dataset_name` - The dataset name to label the volume with
pub fn retained_volume(name: &str, dataset_name: &str) -> PersistentVolume {
    let mut labels = BTreeMap::new();
    labels.insert(DATASET_NAME_LABEL.to_owned(), dataset_name.to_owned());
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            persistent_volume_reclaim_policy: Some("Retain".to_owned()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
