//! Cleans up the retained volumes a deleted dataset leaves behind

use kube::ResourceExt;
use tracing::{Level, event, instrument};

use datasets::Error;
use datasets::consts::DATASET_NAME_LABEL;
use datasets::models::Dataset;

use super::cluster::ClusterApi;

/// Delete every retained volume a dataset owns
///
/// A volume is eligible when it carries the datasets name label, its name
/// encodes the datasets uid suffix, and its reclaim policy is Retain.
/// Volumes still bound to a live claim are left alone.
///
/// # Arguments
///
/// * `cluster` - The cluster api to go through
/// * `dataset` - The dataset being deleted
#[instrument(name = "volumes::cleanup_retained_pv", skip_all, err(Debug))]
pub async fn cleanup_retained_pv<C: ClusterApi>(
    cluster: &C,
    dataset: &Dataset,
) -> Result<(), Error> {
    // without a uid we cannot tell our volumes apart from a recreated twins
    let Some(suffix) = dataset.uid_suffix() else {
        return Ok(());
    };
    let selector = format!("{}={}", DATASET_NAME_LABEL, dataset.name_any());
    let volumes = cluster.list_volumes(&selector).await?;
    for volume in volumes {
        let name = volume.name_any();
        if !name.contains(&suffix) {
            continue;
        }
        let retained = volume
            .spec
            .as_ref()
            .and_then(|spec| spec.persistent_volume_reclaim_policy.as_deref())
            == Some("Retain");
        if !retained {
            continue;
        }
        if volume
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Bound")
        {
            continue;
        }
        event!(Level::INFO, volume = name, "deleting retained volume");
        cluster.delete_volume(&name).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::{FakeCluster, build_dataset, retained_volume};
    use datasets::models::DatasetType;

    #[tokio::test]
    async fn retained_volumes_are_deleted() {
        let mut ds = build_dataset(
            "default",
            "test-dataset",
            DatasetType::Reference,
            "dataset://other/source-dataset",
        );
        ds.metadata.uid = Some("12345678-1234-1234-1234-123456789abc".to_owned());
        let volume = retained_volume("dataset-default-test-dataset-123456789abc", "test-dataset");
        let cluster = FakeCluster::default().with_volume(volume);
        cleanup_retained_pv(&cluster, &ds).await.unwrap();
        let remaining = cluster
            .list_volumes("dataset.name=test-dataset")
            .await
            .unwrap();
        assert!(remaining.is_empty(), "PV should be deleted");
    }

    #[tokio::test]
    async fn volumes_of_other_datasets_survive() {
        let mut ds = build_dataset(
            "default",
            "test-dataset",
            DatasetType::Git,
            "https://example.com/repo.git",
        );
        ds.metadata.uid = Some("12345678-1234-1234-1234-123456789abc".to_owned());
        // same label but a different uid suffix in the name
        let volume = retained_volume("dataset-default-test-dataset-aaaaaaaaaaaa", "test-dataset");
        let cluster = FakeCluster::default().with_volume(volume);
        cleanup_retained_pv(&cluster, &ds).await.unwrap();
        let remaining = cluster
            .list_volumes("dataset.name=test-dataset")
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn non_retained_volumes_survive() {
        let mut ds = build_dataset(
            "default",
            "test-dataset",
            DatasetType::Git,
            "https://example.com/repo.git",
        );
        ds.metadata.uid = Some("12345678-1234-1234-1234-123456789abc".to_owned());
        let mut volume =
            retained_volume("dataset-default-test-dataset-123456789abc", "test-dataset");
        volume
            .spec
            .as_mut()
            .unwrap()
            .persistent_volume_reclaim_policy = Some("Delete".to_owned());
        let cluster = FakeCluster::default().with_volume(volume);
        cleanup_retained_pv(&cluster, &ds).await.unwrap();
        let remaining = cluster
            .list_volumes("dataset.name=test-dataset")
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
