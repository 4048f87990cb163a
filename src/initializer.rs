//! The initializer state machine.
//!
//! A pod is only touched when [`INITIALIZER_NAME`] is the first entry of its
//! pending initializers. Ordering is a convention shared by all initializers
//! of the cluster and is not enforced by the apiserver: this controller never
//! reorders the list and never removes an entry other than its own at index 0.

use std::future::Future;

use kube_client::api::PostParams;
use kube_client::{Api, Client};

use crate::config::Configuration;
use crate::pod::InitializablePod;
use crate::sidecar::SidecarPatch;
use crate::subscriber::QualifiedName;

/// The name this controller is registered under in `metadata.initializers`.
pub const INITIALIZER_NAME: &str = "initializer.istio.io";

/// Write access to pods, abstracted for tests.
pub trait PodStore {
    /// Replaces the whole object, addressed by its namespace and name.
    ///
    /// The resource version carried by `pod` makes concurrent writers fail
    /// with a conflict instead of overwriting each other.
    fn replace(
        &self,
        pod: &InitializablePod,
    ) -> impl Future<Output = Result<InitializablePod, kube_client::Error>> + Send;
}

/// [`PodStore`] backed by the apiserver.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl PodStore for KubeStore {
    fn replace(
        &self,
        pod: &InitializablePod,
    ) -> impl Future<Output = Result<InitializablePod, kube_client::Error>> + Send {
        let api = Api::<InitializablePod>::namespaced(self.client.clone(), pod.namespace());
        let name = pod.name().to_owned();
        let pod = pod.clone();
        async move { api.replace(&name, &PostParams::default(), &pod).await }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Skipped(SkipReason),
    /// The marker was removed and the update committed.
    Initialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No `initializers` field: nothing is pending.
    NotPending,
    /// The field is present but lists nobody.
    NoPendingEntries,
    /// Another initializer is first in line.
    NotOurTurn,
}

/// Removes this controller from the head of the pending list.
///
/// Leaves the pod untouched and reports why when this controller is not first
/// in line. When its entry was the only one, the whole field is cleared rather
/// than left empty.
pub fn remove_self(pod: &mut InitializablePod) -> Result<(), SkipReason> {
    let Some(initializers) = pod.metadata.initializers.as_mut() else {
        return Err(SkipReason::NotPending);
    };
    let Some(first) = initializers.pending.first() else {
        return Err(SkipReason::NoPendingEntries);
    };
    if first.name != INITIALIZER_NAME {
        return Err(SkipReason::NotOurTurn);
    }

    initializers.pending.remove(0);
    if initializers.pending.is_empty() {
        pod.metadata.initializers = None;
    }
    Ok(())
}

/// Handles one observed pod.
///
/// Performs at most one write: none when skipping, one when this controller
/// is first in line. A failed write is returned, not retried.
pub async fn reconcile<S: PodStore>(
    mut pod: InitializablePod,
    config: &Configuration,
    store: &S,
) -> Result<Outcome, Error> {
    if let Err(reason) = remove_self(&mut pod) {
        return Ok(Outcome::Skipped(reason));
    }

    log::info!("initializing pod: {}", pod.name());

    let patch = SidecarPatch::new(config, &pod);
    if !patch.apply(&mut pod) {
        log::debug!("pod {} already carries a sidecar", pod.name());
    }

    store.replace(&pod).await.map_err(|source| Error::Update {
        pod: QualifiedName::from_resource(&pod),
        source,
    })?;
    Ok(Outcome::Initialized)
}

/// The error type returned by [`reconcile`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot update pod {pod}: {source}")]
    Update {
        pod: QualifiedName,
        #[source]
        source: kube_client::Error,
    },
}

impl Error {
    /// Whether the write lost against a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Update {
                source: kube_client::Error::Api(response),
                ..
            } => response.code == 409,
            Self::Update { .. } => false,
        }
    }
}
