//! Sidecar injection.
//!
//! [`SidecarPatch::new`] is a pure function of the [`Configuration`] and the
//! pod's identity; [`SidecarPatch::apply`] merges the result into a pod spec.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};

use crate::config::Configuration;
use crate::pod::InitializablePod;

pub const PROXY_CONTAINER: &str = "istio-proxy";
pub const INIT_CONTAINER: &str = "istio-init";
pub const CORE_DUMP_CONTAINER: &str = "enable-core-dump";
pub const STATUS_ANNOTATION: &str = "sidecar.istio.io/status";

const ENVOY_VOLUME: &str = "istio-envoy";
const CERTS_VOLUME: &str = "istio-certs";
const CONFIG_PATH: &str = "/etc/istio/proxy";
const CERTS_PATH: &str = "/etc/certs";
const PROXY_PORT: &str = "15001";
const DISCOVERY_PORT: u16 = 8080;

/// Containers, volumes and annotations to merge into a pod.
#[derive(Debug, Clone, PartialEq)]
pub struct SidecarPatch {
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
    pub annotations: BTreeMap<String, String>,
}

impl SidecarPatch {
    pub fn new(config: &Configuration, pod: &InitializablePod) -> Self {
        let mut init_containers = vec![init_container(config)];
        if config.enable_core_dump {
            init_containers.push(core_dump_container());
        }

        Self {
            init_containers,
            containers: vec![proxy_container(config, &service_cluster(pod))],
            volumes: vec![envoy_volume(), certs_volume(pod)],
            annotations: BTreeMap::from([(
                STATUS_ANNOTATION.to_owned(),
                format!("injected-version-{}", config.version),
            )]),
        }
    }

    /// Merges the patch into `pod`.
    ///
    /// Returns `false` without touching the pod if it already has a proxy.
    pub fn apply(self, pod: &mut InitializablePod) -> bool {
        if is_injected(pod) {
            return false;
        }

        let spec = pod.spec.get_or_insert_with(Default::default);
        spec.init_containers
            .get_or_insert_with(Vec::new)
            .extend(self.init_containers);
        spec.containers.extend(self.containers);
        spec.volumes
            .get_or_insert_with(Vec::new)
            .extend(self.volumes);

        pod.metadata
            .meta
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(self.annotations);
        true
    }
}

pub fn is_injected(pod: &InitializablePod) -> bool {
    pod.spec.as_ref().map_or(false, |spec| {
        spec.containers
            .iter()
            .any(|container| container.name == PROXY_CONTAINER)
    })
}

fn image(config: &Configuration, name: &str) -> String {
    format!("{}/{name}:{}", config.hub, config.tag)
}

fn service_cluster(pod: &InitializablePod) -> String {
    pod.metadata
        .meta
        .labels
        .as_ref()
        .and_then(|labels| labels.get("app"))
        .cloned()
        .unwrap_or_else(|| PROXY_CONTAINER.to_owned())
}

fn init_container(config: &Configuration) -> Container {
    let mut args = vec![
        "-p".to_owned(),
        PROXY_PORT.to_owned(),
        "-u".to_owned(),
        config.sidecar_proxy_uid.to_string(),
    ];
    if !config.include_ip_ranges.is_empty() {
        args.extend(["-i".to_owned(), config.include_ip_ranges.clone()]);
    }

    Container {
        name: INIT_CONTAINER.to_owned(),
        image: Some(image(config, "proxy_init")),
        image_pull_policy: Some("IfNotPresent".to_owned()),
        args: Some(args),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_owned()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn core_dump_container() -> Container {
    Container {
        name: CORE_DUMP_CONTAINER.to_owned(),
        image: Some("alpine".to_owned()),
        image_pull_policy: Some("IfNotPresent".to_owned()),
        command: Some(vec!["/bin/sh".to_owned()]),
        args: Some(vec![
            "-c".to_owned(),
            format!(
                "sysctl -w kernel.core_pattern={CONFIG_PATH}/core.%e.%p.%t && ulimit -c unlimited"
            ),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn proxy_container(config: &Configuration, service_cluster: &str) -> Container {
    let args = vec![
        "proxy".to_owned(),
        "sidecar".to_owned(),
        "-v".to_owned(),
        config.verbosity.to_string(),
        "--configPath".to_owned(),
        CONFIG_PATH.to_owned(),
        "--serviceCluster".to_owned(),
        service_cluster.to_owned(),
        "--discoveryAddress".to_owned(),
        format!("istio-pilot.{}:{DISCOVERY_PORT}", config.istio_system),
        "--meshConfig".to_owned(),
        config.mesh_config.clone(),
    ];

    Container {
        name: PROXY_CONTAINER.to_owned(),
        image: Some(image(config, "proxy_debug")),
        image_pull_policy: Some("IfNotPresent".to_owned()),
        args: Some(args),
        env: Some(vec![
            field_env("POD_NAME", "metadata.name"),
            field_env("POD_NAMESPACE", "metadata.namespace"),
            field_env("INSTANCE_IP", "status.podIP"),
        ]),
        security_context: Some(SecurityContext {
            run_as_user: Some(config.sidecar_proxy_uid),
            privileged: config.enable_core_dump.then_some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: ENVOY_VOLUME.to_owned(),
                mount_path: CONFIG_PATH.to_owned(),
                ..Default::default()
            },
            VolumeMount {
                name: CERTS_VOLUME.to_owned(),
                mount_path: CERTS_PATH.to_owned(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_owned(),
                api_version: None,
            }),
            ..Default::default()
        }),
    }
}

fn envoy_volume() -> Volume {
    Volume {
        name: ENVOY_VOLUME.to_owned(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some("Memory".to_owned()),
            size_limit: None,
        }),
        ..Default::default()
    }
}

fn certs_volume(pod: &InitializablePod) -> Volume {
    let account = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.service_account_name.as_deref())
        .unwrap_or("default");

    Volume {
        name: CERTS_VOLUME.to_owned(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(format!("istio.{account}")),
            optional: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodSpec;

    use super::*;

    fn app_pod() -> InitializablePod {
        let mut pod = InitializablePod::default();
        pod.metadata.meta.name = Some("web".into());
        pod.metadata.meta.namespace = Some("shop".into());
        pod.metadata.meta.labels = Some(BTreeMap::from([("app".into(), "storefront".into())]));
        pod.spec = Some(PodSpec {
            containers: vec![Container {
                name: "app".into(),
                image: Some("nginx".into()),
                ..Default::default()
            }],
            service_account_name: Some("shopper".into()),
            ..Default::default()
        });
        pod
    }

    fn container<'a>(containers: &'a [Container], name: &str) -> &'a Container {
        containers
            .iter()
            .find(|container| container.name == name)
            .unwrap()
    }

    #[test]
    fn injects_proxy_from_config() {
        let config = Configuration {
            hub: "myrepo/istio".into(),
            tag: "0.2".into(),
            sidecar_proxy_uid: 5000,
            istio_system: "istio-system".into(),
            version: "1.2.3".into(),
            ..Default::default()
        };
        let mut pod = app_pod();
        assert!(SidecarPatch::new(&config, &pod).apply(&mut pod));

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.containers[0].name, "app");

        let proxy = container(&spec.containers, PROXY_CONTAINER);
        assert_eq!(proxy.image.as_deref(), Some("myrepo/istio/proxy_debug:0.2"));
        assert_eq!(
            proxy.security_context.as_ref().unwrap().run_as_user,
            Some(5000)
        );
        let args = proxy.args.as_ref().unwrap();
        assert!(args.windows(2).any(|w| w == ["--serviceCluster", "storefront"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--discoveryAddress", "istio-pilot.istio-system:8080"]));
        assert!(args.windows(2).any(|w| w == ["-v", "2"]));

        let init = spec.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(
            init[0].args.as_deref().unwrap(),
            ["-p", "15001", "-u", "5000"]
        );

        let volumes = spec.volumes.as_ref().unwrap();
        let certs = volumes.iter().find(|v| v.name == CERTS_VOLUME).unwrap();
        assert_eq!(
            certs.secret.as_ref().unwrap().secret_name.as_deref(),
            Some("istio.shopper")
        );

        assert_eq!(
            pod.metadata.meta.annotations.as_ref().unwrap()[STATUS_ANNOTATION],
            "injected-version-1.2.3"
        );
    }

    #[test]
    fn core_dump_and_ip_ranges() {
        let config = Configuration {
            enable_core_dump: true,
            include_ip_ranges: "10.0.0.0/8".into(),
            ..Default::default()
        };
        let patch = SidecarPatch::new(&config, &app_pod());

        assert_eq!(patch.init_containers.len(), 2);
        assert_eq!(
            patch.init_containers[0].args.as_deref().unwrap(),
            ["-p", "15001", "-u", "1337", "-i", "10.0.0.0/8"]
        );
        let core_dump = container(&patch.init_containers, CORE_DUMP_CONTAINER);
        assert_eq!(
            core_dump.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
    }

    #[test]
    fn second_apply_is_a_no_op() {
        let config = Configuration::default();
        let mut pod = app_pod();
        assert!(SidecarPatch::new(&config, &pod).apply(&mut pod));
        let injected = pod.clone();

        assert!(!SidecarPatch::new(&config, &pod).apply(&mut pod));
        assert_eq!(pod, injected);
    }

    #[test]
    fn defaults_for_bare_pod() {
        let mut pod = InitializablePod::default();
        assert!(SidecarPatch::new(&Configuration::default(), &pod).apply(&mut pod));

        let spec = pod.spec.unwrap();
        let proxy = container(&spec.containers, PROXY_CONTAINER);
        assert!(proxy
            .args
            .as_ref()
            .unwrap()
            .windows(2)
            .any(|w| w == ["--serviceCluster", "istio-proxy"]));
        let certs = spec
            .volumes
            .unwrap()
            .into_iter()
            .find(|v| v.name == CERTS_VOLUME)
            .unwrap();
        assert_eq!(
            certs.secret.unwrap().secret_name.as_deref(),
            Some("istio.default")
        );
    }
}
