//! Creates, reuses, and validates the claim backing a dataset

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{Level, event, instrument};

use datasets::Error;
use datasets::consts::DATASET_NAME_LABEL;
use datasets::models::{Dataset, parse_reference_uri};

use super::cluster::ClusterApi;

/// The default storage request when a dataset does not name one
const DEFAULT_STORAGE: &str = "10Gi";

/// The outcome of resolving a reference datasets target
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceState {
    /// The targets claim was adopted
    Adopted(String),
    /// The target exists but has no bound claim yet
    Pending(String),
    /// The target is missing or not shared, the reference can never resolve
    Invalid(String),
}

/// Ensure a claim exists and is bound for a dataset
///
/// Returns the claim name on success. The error messages raised here are
/// stable strings callers match on.
///
/// # Arguments
///
/// * `cluster` - The cluster api to go through
/// * `dataset` - The dataset to ensure a claim for
#[instrument(name = "claims::reconcile_claim", skip_all, err(Debug))]
pub async fn reconcile_claim<C: ClusterApi>(
    cluster: &C,
    dataset: &Dataset,
) -> Result<String, Error> {
    let namespace = dataset
        .namespace()
        .ok_or_else(|| Error::new("dataset has no namespace"))?;
    // a claim named in the spec must already exist and be bound
    if let Some(claim_ref) = &dataset.spec.volume_claim_ref {
        let claim = cluster
            .get_claim(&namespace, claim_ref)
            .await
            .map_err(|error| {
                Error::new(format!(
                    "failed to get pvc {namespace}/{claim_ref}: {}",
                    error.msg()
                ))
            })?
            .ok_or_else(|| {
                Error::new(format!("failed to get pvc {namespace}/{claim_ref}: not found"))
            })?;
        check_ownership(dataset, &claim)?;
        if !is_bound(&claim) {
            return Err(Error::new(format!("pvc {claim_ref} is not bound yet")));
        }
        return Ok(claim_ref.clone());
    }
    // otherwise create or reuse the deterministically named claim
    let name = dataset.claim_name();
    match cluster.get_claim(&namespace, &name).await? {
        Some(claim) => {
            // a claim already labeled with our name is a reclaimable match
            check_ownership(dataset, &claim)?;
            if !is_bound(&claim) {
                return Err(Error::new(format!("pvc {name} is not bound yet")));
            }
            Ok(name)
        }
        None => {
            let claim = build_claim(dataset, &name, &namespace);
            cluster.create_claim(&namespace, &claim).await?;
            event!(Level::INFO, claim = name, "created claim");
            // the provisioner has not had a chance to bind it yet
            Err(Error::new(format!("pvc {name} is not bound yet")))
        }
    }
}

/// Resolve the target of a reference dataset and adopt its claim
///
/// # Arguments
///
/// * `cluster` - The cluster api to go through
/// * `dataset` - The reference dataset to resolve
#[instrument(name = "claims::adopt_reference", skip_all, err(Debug))]
pub async fn adopt_reference<C: ClusterApi>(
    cluster: &C,
    dataset: &Dataset,
) -> Result<ReferenceState, Error> {
    let uri = &dataset.spec.source.uri;
    let (namespace, name) = match parse_reference_uri(uri) {
        Ok(target) => target,
        Err(error) => return Ok(ReferenceState::Invalid(error.msg())),
    };
    let Some(target) = cluster.get_dataset(&namespace, &name).await? else {
        return Ok(ReferenceState::Invalid(format!(
            "referenced dataset {uri} does not exist"
        )));
    };
    if !target.spec.share {
        return Ok(ReferenceState::Invalid(format!("dataset {uri} is not sharable")));
    }
    match target.status.as_ref().and_then(|status| status.pvc_name.clone()) {
        Some(claim) => Ok(ReferenceState::Adopted(claim)),
        None => Ok(ReferenceState::Pending(format!(
            "referenced dataset {uri} has no bound claim yet"
        ))),
    }
}

/// Check whether a claim is bound
///
/// # Arguments
///
/// * `claim` - The claim to check
fn is_bound(claim: &PersistentVolumeClaim) -> bool {
    claim
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Bound")
}

/// Refuse claims that belong to a different dataset
///
/// A conflicting claim is surfaced as an error and never relabeled.
///
/// # Arguments
///
/// * `dataset` - The dataset trying to adopt the claim
/// * `claim` - The claim being adopted
fn check_ownership(dataset: &Dataset, claim: &PersistentVolumeClaim) -> Result<(), Error> {
    let claim_name = claim.name_any();
    // a label pointing at another dataset means this claim is not ours
    if let Some(owner) = claim
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(DATASET_NAME_LABEL))
    {
        if owner != &dataset.name_any() {
            return Err(Error::new(format!(
                "pvc {claim_name} belongs to dataset {owner}, refusing to adopt it"
            )));
        }
    }
    // an owner reference carrying a different uid is a conflict we report
    if let (Some(owners), Some(uid)) = (&claim.metadata.owner_references, dataset.uid()) {
        for owner in owners {
            if owner.kind == "Dataset" && owner.uid != uid {
                return Err(Error::new(format!(
                    "pvc {claim_name} is owned by another dataset (uid {})",
                    owner.uid
                )));
            }
        }
    }
    Ok(())
}

/// Build the claim for a dataset
///
/// # Arguments
///
/// * `dataset` - The dataset the claim backs
/// * `name` - The name to give the claim
/// * `namespace` - The namespace to create the claim in
fn build_claim(dataset: &Dataset, name: &str, namespace: &str) -> PersistentVolumeClaim {
    let mut labels = BTreeMap::new();
    labels.insert(DATASET_NAME_LABEL.to_owned(), dataset.name_any());
    let storage = dataset
        .spec
        .resources
        .storage
        .clone()
        .unwrap_or_else(|| DEFAULT_STORAGE.to_owned());
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_owned(), Quantity(storage));
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels),
            owner_references: dataset.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(dataset.spec.resources.access_modes.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::{FakeCluster, bound_claim, build_dataset};
    use datasets::models::DatasetType;

    #[tokio::test]
    async fn missing_named_claim_errors() {
        let mut ds = build_dataset("default", "demo", DatasetType::Git, "https://example.com/r.git");
        ds.spec.volume_claim_ref = Some("non-existent-pvc".to_owned());
        let cluster = FakeCluster::default();
        let error = reconcile_claim(&cluster, &ds).await.unwrap_err();
        assert!(error.msg().contains("get pvc"));
    }

    #[tokio::test]
    async fn pending_named_claim_errors() {
        let mut ds = build_dataset("default", "demo", DatasetType::Git, "https://example.com/r.git");
        ds.spec.volume_claim_ref = Some("pending-pvc".to_owned());
        let mut claim = bound_claim("default", "pending-pvc", "demo");
        claim.status.as_mut().unwrap().phase = Some("Pending".to_owned());
        let cluster = FakeCluster::default().with_claim(claim);
        let error = reconcile_claim(&cluster, &ds).await.unwrap_err();
        assert!(error.msg().contains("is not bound yet"));
    }

    #[tokio::test]
    async fn bound_named_claim_is_adopted() {
        let mut ds = build_dataset("default", "demo", DatasetType::Git, "https://example.com/r.git");
        ds.spec.volume_claim_ref = Some("dataset-pvc".to_owned());
        let cluster = FakeCluster::default().with_claim(bound_claim("default", "dataset-pvc", "demo"));
        let claim = reconcile_claim(&cluster, &ds).await.unwrap();
        assert_eq!(claim, "dataset-pvc");
    }

    #[tokio::test]
    async fn claims_of_other_datasets_are_not_overwritten() {
        let mut ds = build_dataset("default", "demo", DatasetType::Git, "https://example.com/r.git");
        ds.spec.volume_claim_ref = Some("stolen-pvc".to_owned());
        let cluster =
            FakeCluster::default().with_claim(bound_claim("default", "stolen-pvc", "other-dataset"));
        let error = reconcile_claim(&cluster, &ds).await.unwrap_err();
        assert!(error.msg().contains("belongs to dataset other-dataset"));
    }

    #[tokio::test]
    async fn reuse_converges_without_mutating_the_claim() {
        let ds = build_dataset("default", "demo", DatasetType::Git, "https://example.com/r.git");
        let claim = bound_claim("default", "dataset-demo", "demo");
        let cluster = FakeCluster::default().with_claim(claim.clone());
        // repeated reconciles settle on the same claim
        for _ in 0..3 {
            let name = reconcile_claim(&cluster, &ds).await.unwrap();
            assert_eq!(name, "dataset-demo");
        }
        let stored = cluster
            .get_claim("default", "dataset-demo")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, claim);
    }

    #[tokio::test]
    async fn fresh_claims_are_created_then_awaited() {
        let ds = build_dataset("default", "demo", DatasetType::Git, "https://example.com/r.git");
        let cluster = FakeCluster::default();
        // the first pass creates the claim and reports it pending
        let error = reconcile_claim(&cluster, &ds).await.unwrap_err();
        assert!(error.msg().contains("is not bound yet"));
        let created = cluster
            .get_claim("default", "dataset-demo")
            .await
            .unwrap()
            .unwrap();
        let labels = created.metadata.labels.unwrap();
        assert_eq!(labels.get(DATASET_NAME_LABEL).unwrap(), "demo");
    }

    #[tokio::test]
    async fn adopt_reference_requires_a_shared_target() {
        let ds = build_dataset(
            "ns1",
            "ref-dataset",
            DatasetType::Reference,
            "dataset://default/source-dataset",
        );
        let target = build_dataset(
            "default",
            "source-dataset",
            DatasetType::Git,
            "https://example.com/r.git",
        );
        let cluster = FakeCluster::default().with_dataset(target);
        let state = adopt_reference(&cluster, &ds).await.unwrap();
        assert_eq!(
            state,
            ReferenceState::Invalid(
                "dataset dataset://default/source-dataset is not sharable".to_owned()
            )
        );
    }

    #[tokio::test]
    async fn adopt_reference_waits_for_the_targets_claim() {
        let ds = build_dataset(
            "ns1",
            "ref-dataset",
            DatasetType::Reference,
            "dataset://default/source-dataset",
        );
        let mut target = build_dataset(
            "default",
            "source-dataset",
            DatasetType::Git,
            "https://example.com/r.git",
        );
        target.spec.share = true;
        let cluster = FakeCluster::default().with_dataset(target.clone());
        let state = adopt_reference(&cluster, &ds).await.unwrap();
        assert!(matches!(state, ReferenceState::Pending(_)));
        // once the target binds a claim the reference adopts it
        target.status = Some(datasets::models::DatasetStatus {
            pvc_name: Some("dataset-source-dataset".to_owned()),
            ..Default::default()
        });
        let cluster = FakeCluster::default().with_dataset(target);
        let state = adopt_reference(&cluster, &ds).await.unwrap();
        assert_eq!(
            state,
            ReferenceState::Adopted("dataset-source-dataset".to_owned())
        );
    }

    #[tokio::test]
    async fn adopt_reference_requires_an_existing_target() {
        let ds = build_dataset(
            "ns1",
            "ref-dataset",
            DatasetType::Reference,
            "dataset://default/missing",
        );
        let cluster = FakeCluster::default();
        let state = adopt_reference(&cluster, &ds).await.unwrap();
        assert!(matches!(state, ReferenceState::Invalid(_)));
    }
}
