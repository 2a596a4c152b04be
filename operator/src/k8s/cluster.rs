//! The seam between the reconciler and the cluster api
//!
//! Every read or write the reconciler performs goes through this trait so
//! tests can drive the state machine against an in memory cluster.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};

use datasets::Error;
use datasets::models::{Dataset, DatasetStatus};

/// The cluster operations the reconciler relies on
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Get a dataset if it exists
    async fn get_dataset(&self, namespace: &str, name: &str) -> Result<Option<Dataset>, Error>;

    /// List every dataset in the cluster
    async fn list_datasets(&self) -> Result<Vec<Dataset>, Error>;

    /// Replace a dataset, conditional on its resource version
    async fn update_dataset(&self, dataset: &Dataset) -> Result<Dataset, Error>;

    /// Update the status subresource of a dataset
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatasetStatus,
    ) -> Result<(), Error>;

    /// Request the deletion of a dataset, tolerating ones already gone
    async fn delete_dataset(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a persistent volume claim if it exists
    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Create a persistent volume claim
    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error>;

    /// List the persistent volumes matching a label selector
    async fn list_volumes(&self, selector: &str) -> Result<Vec<PersistentVolume>, Error>;

    /// Delete a persistent volume, tolerating ones already gone
    async fn delete_volume(&self, name: &str) -> Result<(), Error>;

    /// Get a job if it exists
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error>;

    /// Create a job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, Error>;
}

/// The kube backed cluster api used outside of tests
#[derive(Clone)]
pub struct KubeCluster {
    /// kube API client
    client: Client,
}

impl KubeCluster {
    /// Build a new kube backed cluster api
    ///
    /// # Arguments
    ///
    /// * `client` - The kube client to wrap
    pub fn new(client: Client) -> Self {
        KubeCluster { client }
    }

    /// Get a namespaced api for datasets
    fn datasets(&self, namespace: &str) -> Api<Dataset> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_dataset(&self, namespace: &str, name: &str) -> Result<Option<Dataset>, Error> {
        Ok(self.datasets(namespace).get_opt(name).await?)
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>, Error> {
        let api: Api<Dataset> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_dataset(&self, dataset: &Dataset) -> Result<Dataset, Error> {
        let namespace = dataset
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::new("dataset has no namespace"))?;
        let name = dataset
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::new("dataset has no name"))?;
        Ok(self
            .datasets(namespace)
            .replace(name, &PostParams::default(), dataset)
            .await?)
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatasetStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        let _: Dataset = self
            .datasets(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_dataset(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .datasets(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            // something else already deleted it, which is what we wanted
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(Error::from(error)),
        }
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), claim).await?)
    }

    async fn list_volumes(&self, selector: &str) -> Result<Vec<PersistentVolume>, Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let params = ListParams::default().labels(selector);
        Ok(api.list(&params).await?.items)
    }

    async fn delete_volume(&self, name: &str) -> Result<(), Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(Error::from(error)),
        }
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), job).await?)
    }
}
