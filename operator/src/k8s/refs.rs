//! Finds the datasets referencing a shared dataset

use kube::ResourceExt;
use tracing::instrument;

use datasets::Error;
use datasets::models::{Dataset, DatasetType, parse_reference_uri};

use super::cluster::ClusterApi;

/// How many reference hops are followed before assuming a cycle
const MAX_REFERENCE_HOPS: usize = 16;

/// Find every dataset whose source references the given dataset
///
/// The result never contains the source itself and callers must not rely
/// on its order.
///
/// # Arguments
///
/// * `cluster` - The cluster api to go through
/// * `dataset` - The dataset being referenced
#[instrument(name = "refs::find_referencing_datasets", skip_all, err(Debug))]
pub async fn find_referencing_datasets<C: ClusterApi>(
    cluster: &C,
    dataset: &Dataset,
) -> Result<Vec<Dataset>, Error> {
    let reference_uri = dataset.reference_uri();
    let all = cluster.list_datasets().await?;
    let referencing = all
        .into_iter()
        .filter(|candidate| candidate.spec.source.kind == DatasetType::Reference)
        .filter(|candidate| candidate.spec.source.uri == reference_uri)
        .filter(|candidate| {
            candidate.namespace() != dataset.namespace() || candidate.name_any() != dataset.name_any()
        })
        .collect();
    Ok(referencing)
}

/// Check whether a reference datasets chain loops back to itself
///
/// Cycles are ill formed but must not wedge the reconciler, so they are
/// only reported through a warning condition.
///
/// # Arguments
///
/// * `cluster` - The cluster api to go through
/// * `dataset` - The reference dataset to walk from
#[instrument(name = "refs::detect_reference_cycle", skip_all, err(Debug))]
pub async fn detect_reference_cycle<C: ClusterApi>(
    cluster: &C,
    dataset: &Dataset,
) -> Result<bool, Error> {
    if dataset.spec.source.kind != DatasetType::Reference {
        return Ok(false);
    }
    let origin = (dataset.namespace().unwrap_or_default(), dataset.name_any());
    let mut uri = dataset.spec.source.uri.clone();
    for _ in 0..MAX_REFERENCE_HOPS {
        // a malformed link ends the chain without a cycle
        let Ok((namespace, name)) = parse_reference_uri(&uri) else {
            return Ok(false);
        };
        if (namespace.as_str(), name.as_str()) == (origin.0.as_str(), origin.1.as_str()) {
            return Ok(true);
        }
        let Some(target) = cluster.get_dataset(&namespace, &name).await? else {
            return Ok(false);
        };
        if target.spec.source.kind != DatasetType::Reference {
            return Ok(false);
        }
        uri = target.spec.source.uri.clone();
    }
    // a chain deeper than any sane graph is treated as a cycle
    Ok(true)
}
