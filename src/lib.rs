//! istio-initializer holds every new pod until the Istio sidecar is injected.
//!
//! Pods are created with `initializer.istio.io` in their pending
//! initializers. The controller watches pods across all namespaces,
//! uninitialized ones included, and when its name is first in a pod's pending
//! list it removes that entry and injects the sidecar in a single update.
//!
//! The pieces, leaves first:
//! [`config`] loads the tunables once at startup,
//! [`subscriber`] turns list and watch calls into a stream of pod events,
//! [`initializer`] decides and submits the update for one pod,
//! [`runner`] feeds events to the initializer one at a time,
//! and [`supervisor`] runs that loop in the background until shutdown.

pub mod config;
pub use config::Configuration;
pub mod initializer;
pub use initializer::{reconcile, KubeStore, Outcome, PodStore, INITIALIZER_NAME};
pub mod pod;
pub mod runner;
pub mod sidecar;
pub mod subscriber;
pub mod supervisor;
pub use supervisor::Supervisor;

#[cfg(test)]
mod tests;
