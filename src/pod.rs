//! Pod representation that keeps `metadata.initializers`.
//!
//! `k8s-openapi` no longer models the initializers field, so deserializing a
//! plain [`Pod`](k8s_openapi::api::core::v1::Pod) would silently drop the
//! pending list. [`InitializablePod`] wraps the typed metadata and spec and
//! carries the initializers alongside them.

use std::borrow::Cow;

use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use k8s_openapi::NamespaceResourceScope;
use kube_core::Resource;
use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "v1";
pub const KIND: &str = "Pod";

/// A pod as served when `includeUninitialized` is requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializablePod {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PodSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PodStatus>,
}

/// Object metadata extended with the pending initializers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    /// `None` means no initializers are outstanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializers: Option<Initializers>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Initializers {
    /// Ordered; only the entry at index 0 may act.
    #[serde(default)]
    pub pending: Vec<Initializer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Status>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initializer {
    pub name: String,
}

impl Initializer {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl InitializablePod {
    pub fn name(&self) -> &str {
        self.metadata.meta.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.meta.namespace.as_deref().unwrap_or_default()
    }

    /// Names of the pending initializers, `None` if the field is absent.
    pub fn pending(&self) -> Option<Vec<&str>> {
        self.metadata.initializers.as_ref().map(|initializers| {
            initializers
                .pending
                .iter()
                .map(|initializer| initializer.name.as_str())
                .collect()
        })
    }
}

impl Default for InitializablePod {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: Metadata::default(),
            spec: None,
            status: None,
        }
    }
}

fn default_api_version() -> String {
    API_VERSION.to_owned()
}

fn default_kind() -> String {
    KIND.to_owned()
}

impl Resource for InitializablePod {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        KIND.into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        API_VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "pods".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata.meta
    }
}
