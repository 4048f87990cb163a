//! Controller configuration read from the `istio-initializer` config map.

use std::collections::BTreeMap;
use std::str::FromStr;

use k8s_openapi::api::core::v1::ConfigMap;
use kube_client::{Api, Client};

/// Namespace holding the configuration resource.
pub const CONFIG_NAMESPACE: &str = "default";
/// Name of the configuration resource.
pub const CONFIG_NAME: &str = "istio-initializer";

pub const DEFAULT_HUB: &str = "docker.io/istio";
pub const DEFAULT_TAG: &str = "0.1";
pub const DEFAULT_ISTIO_SYSTEM: &str = "default";
pub const DEFAULT_MESH_CONFIG: &str = "istio";
pub const DEFAULT_SIDECAR_PROXY_UID: i64 = 1337;
pub const DEFAULT_VERBOSITY: i64 = 2;

/// Immutable snapshot of the tunables used to build the sidecar.
///
/// Every field holds a usable value: keys that are missing or fail to parse
/// fall back to their default in [`Configuration::from_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub enable_core_dump: bool,
    pub hub: String,
    pub include_ip_ranges: String,
    /// Namespace the mesh control plane runs in.
    pub istio_system: String,
    pub mesh_config: String,
    pub sidecar_proxy_uid: i64,
    pub tag: String,
    pub verbosity: i64,
    /// Version stamped onto injected pods.
    pub version: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            enable_core_dump: false,
            hub: DEFAULT_HUB.to_owned(),
            include_ip_ranges: String::new(),
            istio_system: DEFAULT_ISTIO_SYSTEM.to_owned(),
            mesh_config: DEFAULT_MESH_CONFIG.to_owned(),
            sidecar_proxy_uid: DEFAULT_SIDECAR_PROXY_UID,
            tag: DEFAULT_TAG.to_owned(),
            verbosity: DEFAULT_VERBOSITY,
            version: build_version().to_owned(),
        }
    }
}

impl Configuration {
    /// Builds a configuration from raw config map data. Never fails.
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let defaults = Self::default();

        Self {
            enable_core_dump: typed(data, "enableCoreDump", parse_bool)
                .unwrap_or(defaults.enable_core_dump),
            hub: string(data, "hub").unwrap_or(defaults.hub),
            include_ip_ranges: string(data, "includeIPRanges")
                .unwrap_or(defaults.include_ip_ranges),
            istio_system: string(data, "istioSystem").unwrap_or(defaults.istio_system),
            mesh_config: string(data, "meshConfig").unwrap_or(defaults.mesh_config),
            sidecar_proxy_uid: typed(data, "sidecarProxyUID", parse_int)
                .unwrap_or(defaults.sidecar_proxy_uid),
            tag: string(data, "tag").unwrap_or(defaults.tag),
            verbosity: typed(data, "verbosity", parse_int).unwrap_or(defaults.verbosity),
            version: string(data, "version").unwrap_or(defaults.version),
        }
    }

    /// Same as [`from_data`](Self::from_data), treating a config map without data as empty.
    pub fn from_config_map(cm: &ConfigMap) -> Self {
        cm.data
            .as_ref()
            .map(Self::from_data)
            .unwrap_or_default()
    }
}

/// Fetches `default/istio-initializer` and converts it.
///
/// Only the fetch can fail; conversion always succeeds.
pub async fn load(client: Client) -> Result<Configuration, Error> {
    let api = Api::<ConfigMap>::namespaced(client, CONFIG_NAMESPACE);
    let cm = api.get(CONFIG_NAME).await.map_err(|source| Error::Fetch {
        namespace: CONFIG_NAMESPACE,
        name: CONFIG_NAME,
        source,
    })?;
    Ok(Configuration::from_config_map(&cm))
}

/// The controller's own version, used when the config map does not pin one.
pub fn build_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// The error type returned by [`load`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot fetch config map {namespace}/{name}: {source}")]
    Fetch {
        namespace: &'static str,
        name: &'static str,
        #[source]
        source: kube_client::Error,
    },
}

fn string(data: &BTreeMap<String, String>, key: &str) -> Option<String> {
    data.get(key).filter(|value| !value.is_empty()).cloned()
}

fn typed<T>(
    data: &BTreeMap<String, String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = data.get(key)?;
    let parsed = parse(raw);
    if parsed.is_none() {
        log::debug!("ignoring malformed value {raw:?} for config key {key}");
    }
    parsed
}

/// Accepts the same literals as Go's `strconv.ParseBool`.
fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn parse_int<T: FromStr>(raw: &str) -> Option<T> {
    raw.parse().ok()
}
