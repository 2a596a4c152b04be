//! The level triggered reconcile loop for datasets

use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::wait::await_condition;
use kube::runtime::{conditions, watcher};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tracing::{Level, event, instrument};

use datasets::conf::Conf;
use datasets::consts::DATASET_FINALIZER;
use datasets::models::{
    CONDITION_CLAIM_READY, CONDITION_REFERENCE_CYCLE, CONDITION_SPEC_VALID, CONDITION_SYNCED,
    Dataset, DatasetPhase, DatasetType,
};
use datasets::Error;

use super::claims::{self, ReferenceState};
use super::cluster::{ClusterApi, KubeCluster};
use super::jobs::{self, JobState};
use super::refs;
use super::volumes;
use crate::args::Args;

/// The name of the dataset CRD
const CRD_NAME: &str = "datasets.datasets.io";

/// How long to wait for the CRD to establish before giving up
const CRD_ESTABLISH_TIMEOUT_SECS: u64 = 30;

/// How quickly to requeue when the next step is already actionable
const STEP_REQUEUE_SECS: u64 = 1;

/// How long to wait between polls of external state
const POLL_REQUEUE_SECS: u64 = 10;

/// Per key exponential backoff for failed reconciles
pub struct Backoffs {
    /// The first delay in seconds
    base: u64,
    /// The delay cap in seconds
    max: u64,
    /// How many times each key has failed in a row
    attempts: Mutex<HashMap<String, u32>>,
}

impl Backoffs {
    /// Build a new backoff ledger
    ///
    /// # Arguments
    ///
    /// * `conf` - The controller config
    pub fn new(conf: &Conf) -> Self {
        Backoffs {
            base: conf.requeue.base_secs.max(1),
            max: conf.requeue.max_secs.max(1),
            attempts: Mutex::new(HashMap::default()),
        }
    }

    /// Get the next delay for a key and bump its attempt count
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key to back off
    pub fn next(&self, key: &str) -> Duration {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(key.to_owned()).or_insert(0);
        let exponent = (*count).min(31);
        let delay = self
            .base
            .saturating_mul(1u64 << exponent)
            .min(self.max);
        *count = count.saturating_add(1);
        Duration::from_secs(delay)
    }

    /// Forget the attempt count for a key after a clean reconcile
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key to reset
    pub fn reset(&self, key: &str) {
        self.attempts.lock().unwrap().remove(key);
    }
}

/// The shared state every reconcile observes
pub struct Context<C: ClusterApi> {
    /// The cluster api all reads and writes go through
    pub cluster: C,
    /// The process wide config, read only after startup
    pub conf: Conf,
    /// The backoff ledger for failed reconciles
    pub backoffs: Backoffs,
}

impl<C: ClusterApi> Context<C> {
    /// Build a new reconcile context
    ///
    /// # Arguments
    ///
    /// * `cluster` - The cluster api to go through
    /// * `conf` - The controller config
    pub fn new(cluster: C, conf: Conf) -> Self {
        let backoffs = Backoffs::new(&conf);
        Context {
            cluster,
            conf,
            backoffs,
        }
    }
}

/// Check whether a dataset carries our finalizer
///
/// # Arguments
///
/// * `dataset` - The dataset to check
fn has_finalizer(dataset: &Dataset) -> bool {
    dataset
        .finalizers()
        .iter()
        .any(|finalizer| finalizer == DATASET_FINALIZER)
}

/// Handle errors in the reconcile process
///
/// # Arguments
///
/// * `dataset` - The dataset that failed to reconcile
/// * `error` - The error it failed with
/// * `ctx` - The shared reconcile context
pub fn error_policy<C: ClusterApi>(
    dataset: Arc<Dataset>,
    error: &Error,
    ctx: Arc<Context<C>>,
) -> Action {
    let key = format!(
        "{}/{}",
        dataset.namespace().unwrap_or_default(),
        dataset.name_any()
    );
    let delay = ctx.backoffs.next(&key);
    event!(
        Level::ERROR,
        dataset = key,
        error = error.msg(),
        requeue_secs = delay.as_secs(),
        "reconcile failed"
    );
    Action::requeue(delay)
}

/// Reconcile one dataset towards its declared state
///
/// Each pass performs at most one externally visible mutation and then
/// requeues, so every step is observable and restartable.
///
/// # Arguments
///
/// * `dataset` - The dataset to reconcile
/// * `ctx` - The shared reconcile context
#[instrument(name = "controller::reconcile", skip_all, fields(dataset = %dataset.name_any()), err(Debug))]
pub async fn reconcile<C: ClusterApi>(
    dataset: Arc<Dataset>,
    ctx: Arc<Context<C>>,
) -> Result<Action, Error> {
    let namespace = dataset
        .namespace()
        .ok_or_else(|| Error::new("dataset has no namespace"))?;
    let name = dataset.name_any();
    // our finalizer goes on before anything else happens
    if dataset.metadata.deletion_timestamp.is_none() && !has_finalizer(&dataset) {
        let mut updated = (*dataset).clone();
        updated
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(DATASET_FINALIZER.to_owned());
        ctx.cluster.update_dataset(&updated).await?;
        return Ok(Action::requeue(Duration::from_secs(STEP_REQUEUE_SECS)));
    }
    // a deletion timestamp switches us onto the deletion path
    if dataset.metadata.deletion_timestamp.is_some() {
        if !has_finalizer(&dataset) {
            return Ok(Action::await_change());
        }
        return reconcile_deletion(&dataset, &ctx).await;
    }
    let action = reconcile_phase(&namespace, &name, &dataset, &ctx).await?;
    ctx.backoffs.reset(&format!("{namespace}/{name}"));
    Ok(action)
}

/// Drive one step of the phase machine
///
/// # Arguments
///
/// * `namespace` - The namespace of the dataset
/// * `name` - The name of the dataset
/// * `dataset` - The dataset to reconcile
/// * `ctx` - The shared reconcile context
async fn reconcile_phase<C: ClusterApi>(
    namespace: &str,
    name: &str,
    dataset: &Dataset,
    ctx: &Context<C>,
) -> Result<Action, Error> {
    let mut status = dataset.status.clone().unwrap_or_default();
    match status.phase {
        DatasetPhase::Pending => {
            // a bad spec is terminal until the spec changes
            if let Err(error) = dataset.spec.source.validate() {
                status.phase = DatasetPhase::Failed;
                status.set_condition(CONDITION_SPEC_VALID, false, "InvalidSpec", error.msg());
                status.observed_generation = dataset.metadata.generation;
                ctx.cluster.update_status(namespace, name, &status).await?;
                return Ok(Action::await_change());
            }
            status.set_condition(CONDITION_SPEC_VALID, true, "SpecValid", "spec validated");
            // a looping reference chain gets a warning but not a wedge
            if dataset.spec.source.kind == DatasetType::Reference
                && refs::detect_reference_cycle(&ctx.cluster, dataset).await?
            {
                status.set_condition(
                    CONDITION_REFERENCE_CYCLE,
                    true,
                    "ReferenceCycle",
                    format!(
                        "the reference chain starting at {} loops back to this dataset",
                        dataset.spec.source.uri
                    ),
                );
            }
            status.phase = DatasetPhase::Claiming;
            status.observed_generation = dataset.metadata.generation;
            ctx.cluster.update_status(namespace, name, &status).await?;
            Ok(Action::requeue(Duration::from_secs(STEP_REQUEUE_SECS)))
        }
        DatasetPhase::Claiming => {
            if dataset.spec.source.kind == DatasetType::Reference {
                return reconcile_reference_claim(namespace, name, dataset, ctx, status).await;
            }
            match claims::reconcile_claim(&ctx.cluster, dataset).await {
                Ok(claim) => {
                    status.pvc_name = Some(claim.clone());
                    status.set_condition(
                        CONDITION_CLAIM_READY,
                        true,
                        "ClaimBound",
                        format!("claim {claim} is bound"),
                    );
                    status.phase = DatasetPhase::Syncing;
                    ctx.cluster.update_status(namespace, name, &status).await?;
                    Ok(Action::requeue(Duration::from_secs(STEP_REQUEUE_SECS)))
                }
                // claim problems are conditions, not phase changes
                Err(error) => {
                    status.set_condition(
                        CONDITION_CLAIM_READY,
                        false,
                        "ClaimPending",
                        error.msg(),
                    );
                    ctx.cluster.update_status(namespace, name, &status).await?;
                    Ok(Action::requeue(Duration::from_secs(POLL_REQUEUE_SECS)))
                }
            }
        }
        DatasetPhase::Syncing => {
            let Some(claim) = status.pvc_name.clone() else {
                // the claim went missing, walk back a phase
                status.phase = DatasetPhase::Claiming;
                ctx.cluster.update_status(namespace, name, &status).await?;
                return Ok(Action::requeue(Duration::from_secs(STEP_REQUEUE_SECS)));
            };
            match jobs::reconcile_loader_job(&ctx.cluster, &ctx.conf, dataset, &claim).await? {
                JobState::NotYet => Ok(Action::requeue(Duration::from_secs(POLL_REQUEUE_SECS))),
                JobState::Running => Ok(Action::requeue(Duration::from_secs(POLL_REQUEUE_SECS))),
                JobState::Succeeded => {
                    status.last_synced_round = dataset.spec.data_sync_round;
                    status.phase = DatasetPhase::Ready;
                    status.set_condition(
                        CONDITION_SYNCED,
                        true,
                        "SyncSucceeded",
                        format!("round {} synced", dataset.spec.data_sync_round),
                    );
                    status.observed_generation = dataset.metadata.generation;
                    ctx.cluster.update_status(namespace, name, &status).await?;
                    Ok(Action::await_change())
                }
                JobState::Failed(message) => {
                    status.phase = DatasetPhase::Failed;
                    status.set_condition(CONDITION_SYNCED, false, "LoaderFailed", message);
                    status.observed_generation = dataset.metadata.generation;
                    ctx.cluster.update_status(namespace, name, &status).await?;
                    Ok(Action::await_change())
                }
            }
        }
        DatasetPhase::Ready | DatasetPhase::Failed => {
            // a bumped round restarts the sync from either terminal phase
            if dataset.spec.data_sync_round > status.last_synced_round
                && status.pvc_name.is_some()
            {
                // references have no loader job, they re-resolve their target
                status.phase = if dataset.spec.source.kind == DatasetType::Reference {
                    DatasetPhase::Claiming
                } else {
                    DatasetPhase::Syncing
                };
                ctx.cluster.update_status(namespace, name, &status).await?;
                return Ok(Action::requeue(Duration::from_secs(STEP_REQUEUE_SECS)));
            }
            // any other spec change goes back through validation
            if status.observed_generation != dataset.metadata.generation {
                status.phase = DatasetPhase::Pending;
                ctx.cluster.update_status(namespace, name, &status).await?;
                return Ok(Action::requeue(Duration::from_secs(STEP_REQUEUE_SECS)));
            }
            Ok(Action::await_change())
        }
    }
}

/// Drive the claiming phase for a reference dataset
///
/// References adopt the targets claim instead of running a loader, so a
/// successful adoption lands straight in Ready.
///
/// # Arguments
///
/// * `namespace` - The namespace of the dataset
/// * `name` - The name of the dataset
/// * `dataset` - The reference dataset to reconcile
/// * `ctx` - The shared reconcile context
/// * `status` - The status being built for this pass
async fn reconcile_reference_claim<C: ClusterApi>(
    namespace: &str,
    name: &str,
    dataset: &Dataset,
    ctx: &Context<C>,
    mut status: datasets::models::DatasetStatus,
) -> Result<Action, Error> {
    match claims::adopt_reference(&ctx.cluster, dataset).await? {
        ReferenceState::Adopted(claim) => {
            status.pvc_name = Some(claim.clone());
            status.set_condition(
                CONDITION_CLAIM_READY,
                true,
                "ClaimAdopted",
                format!("adopted claim {claim}"),
            );
            status.last_synced_round = dataset.spec.data_sync_round;
            status.phase = DatasetPhase::Ready;
            status.set_condition(
                CONDITION_SYNCED,
                true,
                "ReferenceAdopted",
                "reference target adopted, nothing to sync",
            );
            status.observed_generation = dataset.metadata.generation;
            ctx.cluster.update_status(namespace, name, &status).await?;
            Ok(Action::await_change())
        }
        ReferenceState::Pending(message) => {
            status.set_condition(CONDITION_CLAIM_READY, false, "TargetNotReady", message);
            ctx.cluster.update_status(namespace, name, &status).await?;
            Ok(Action::requeue(Duration::from_secs(POLL_REQUEUE_SECS)))
        }
        ReferenceState::Invalid(message) => {
            status.phase = DatasetPhase::Failed;
            status.set_condition(CONDITION_SPEC_VALID, false, "ReferenceInvalid", message);
            status.observed_generation = dataset.metadata.generation;
            ctx.cluster.update_status(namespace, name, &status).await?;
            Ok(Action::await_change())
        }
    }
}

/// Walk a dataset through the deletion path
///
/// Dependents are asked to delete first, then retained volumes go, and
/// only then is the finalizer released.
///
/// # Arguments
///
/// * `dataset` - The dataset being deleted
/// * `ctx` - The shared reconcile context
#[instrument(name = "controller::reconcile_deletion", skip_all, err(Debug))]
async fn reconcile_deletion<C: ClusterApi>(
    dataset: &Dataset,
    ctx: &Context<C>,
) -> Result<Action, Error> {
    // dependents get their deletion requested before our finalizer moves
    let remaining = reconcile_cascading_deletion(dataset, ctx).await?;
    if remaining {
        // dependents clear their own finalizers, check back later
        return Ok(Action::requeue(Duration::from_secs(POLL_REQUEUE_SECS)));
    }
    volumes::cleanup_retained_pv(&ctx.cluster, dataset).await?;
    let mut updated = dataset.clone();
    if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
        finalizers.retain(|finalizer| finalizer != DATASET_FINALIZER);
    }
    ctx.cluster.update_dataset(&updated).await?;
    event!(Level::INFO, dataset = updated.name_any(), "released finalizer");
    Ok(Action::await_change())
}

/// Request the deletion of every dataset referencing this one
///
/// A no-op unless cascading deletion is enabled. Returns whether any
/// dependents still exist, deleting is idempotent so datasets already on
/// their way out are skipped.
///
/// # Arguments
///
/// * `dataset` - The dataset being deleted
/// * `ctx` - The shared reconcile context
#[instrument(name = "controller::reconcile_cascading_deletion", skip_all, err(Debug))]
pub async fn reconcile_cascading_deletion<C: ClusterApi>(
    dataset: &Dataset,
    ctx: &Context<C>,
) -> Result<bool, Error> {
    if !ctx.conf.enable_cascading_deletion {
        return Ok(false);
    }
    let referencing = refs::find_referencing_datasets(&ctx.cluster, dataset).await?;
    if referencing.is_empty() {
        return Ok(false);
    }
    for dependent in &referencing {
        // already deleting dependents just need more time
        if dependent.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let namespace = dependent.namespace().unwrap_or_default();
        let name = dependent.name_any();
        event!(
            Level::INFO,
            dependent = format!("{namespace}/{name}"),
            "requesting deletion of referencing dataset"
        );
        ctx.cluster.delete_dataset(&namespace, &name).await?;
    }
    Ok(true)
}

/// Initialize the controller and run it until shutdown
///
/// # Arguments
///
/// * `args` - Arguments passed to the dataset controller
pub async fn run(args: &Args) -> Result<(), Error> {
    let conf = Conf::new(&args.config)?;
    let client = Client::try_default().await?;
    // the crd always has to exist before we can watch the resource
    ensure_crd(&client).await?;
    let datasets_api: Api<Dataset> = Api::all(client.clone());
    let context = Arc::new(Context::new(KubeCluster::new(client), conf));
    // watch for dataset changes until we are signalled to stop
    Controller::new(datasets_api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|result| async move { result.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}

/// Create or update the Dataset CRD
///
/// # Arguments
///
/// * `client` - The kube client to apply the CRD with
async fn ensure_crd(client: &Client) -> Result<(), Error> {
    let params = PatchParams::apply("dataset-controller").force();
    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    // create the CRD for this controller version or patch it if it exists
    crd_api
        .patch(CRD_NAME, &params, &Patch::Apply(Dataset::crd()))
        .await?;
    // wait for the crd to be established before watching it
    let established = await_condition(crd_api, CRD_NAME, conditions::is_crd_established());
    match tokio::time::timeout(
        Duration::from_secs(CRD_ESTABLISH_TIMEOUT_SECS),
        established,
    )
    .await
    {
        Ok(_) => Ok(()),
        Err(_) => Err(Error::new(
            "timed out waiting for the Dataset CRD to be established",
        )),
    }
}
