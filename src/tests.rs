use std::collections::BTreeMap;
use std::sync::Once;

use futures::stream;
use k8s_openapi::api::core::v1::ConfigMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::initializer::tests::RecordingStore;
use crate::subscriber::{decode, Event, EventKind, PodEvent};
use crate::{runner, sidecar, Configuration, INITIALIZER_NAME};

fn created(namespace: &str, name: &str, pending: &[&str]) -> PodEvent {
    let pending: Vec<_> = pending.iter().map(|name| json!({ "name": name })).collect();
    let pod = decode::pod(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "resourceVersion": "100",
            "initializers": { "pending": pending },
        },
        "spec": { "containers": [{ "name": "app", "image": "nginx:1.13" }] },
    }))
    .unwrap();
    Event::new(EventKind::Created, pod)
}

/// Process-wide logger that keeps every record for later inspection.
///
/// Tests run in parallel and share it, so assertions must filter on content
/// unique to the test.
struct CapturedLogs {
    records: parking_lot::Mutex<Vec<(log::Level, String)>>,
}

static LOGS: CapturedLogs = CapturedLogs {
    records: parking_lot::const_mutex(Vec::new()),
};

impl log::Log for CapturedLogs {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        self.records
            .lock()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

fn capture_logs() -> &'static CapturedLogs {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        log::set_logger(&LOGS).expect("no other logger is installed in tests");
        log::set_max_level(log::LevelFilter::Trace);
    });
    &LOGS
}

impl CapturedLogs {
    fn matching(&self, level: log::Level, needle: &str) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|(l, message)| *l == level && message.contains(needle))
            .map(|(_, message)| message.clone())
            .collect()
    }
}

async fn run_all(events: Vec<PodEvent>, store: &RecordingStore) {
    runner::run(
        stream::iter(events.into_iter().map(Ok)),
        &Configuration::default(),
        store,
        CancellationToken::new(),
    )
    .await;
}

#[test]
fn config_map_with_partial_data() {
    let cm = ConfigMap {
        data: Some(BTreeMap::from([
            ("hub".to_owned(), "myrepo/istio".to_owned()),
            ("sidecarProxyUID".to_owned(), "5000".to_owned()),
        ])),
        ..Default::default()
    };
    let config = Configuration::from_config_map(&cm);

    assert_eq!(config.hub, "myrepo/istio");
    assert_eq!(config.sidecar_proxy_uid, 5000);
    assert_eq!(config.tag, "0.1");
    assert_eq!(config.verbosity, 2);
    assert_eq!(config.mesh_config, "istio");
    assert_eq!(config.istio_system, "default");
    assert!(!config.enable_core_dump);
}

#[tokio::test]
async fn created_pod_gets_one_update() {
    let store = RecordingStore::default();
    run_all(vec![created("shop", "web", &[INITIALIZER_NAME])], &store).await;

    let updates = store.updates();
    assert_eq!(updates.len(), 1);
    let update = &updates[0];
    assert!(sidecar::is_injected(update));
    assert_eq!(update.metadata.initializers, None);

    let body = serde_json::to_value(update).unwrap();
    assert!(body["metadata"].get("initializers").is_none());
    assert_eq!(body["metadata"]["resourceVersion"], "100");
    assert_eq!(body["spec"]["containers"][0]["name"], "app");
    assert_eq!(body["spec"]["containers"][1]["name"], "istio-proxy");
}

#[tokio::test]
async fn other_initializers_are_left_in_order() {
    let store = RecordingStore::default();
    run_all(
        vec![
            created("shop", "first", &["other.example.com", INITIALIZER_NAME]),
            created("shop", "second", &[INITIALIZER_NAME, "other.example.com"]),
        ],
        &store,
    )
    .await;

    let updates = store.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].name(), "second");
    assert_eq!(updates[0].pending(), Some(vec!["other.example.com"]));
}

#[tokio::test]
async fn conflict_is_not_retried_and_loop_continues() {
    let logs = capture_logs();
    let store = RecordingStore::failing(409);
    run_all(
        vec![
            created("ledger", "web", &[INITIALIZER_NAME]),
            created("ledger", "db", &[INITIALIZER_NAME]),
        ],
        &store,
    )
    .await;

    let names: Vec<_> = store
        .updates()
        .iter()
        .map(|pod| pod.name().to_owned())
        .collect();
    assert_eq!(names, ["web", "db"]);

    for pod in ["ledger/web", "ledger/db"] {
        let errors = logs.matching(log::Level::Error, &format!("cannot update pod {pod}:"));
        assert_eq!(errors.len(), 1, "{pod}: {errors:?}");
        assert!(errors[0].contains("conflicting write"), "{}", errors[0]);
    }
}

/// A pod whose update never commits stays pending; the only retry is the next
/// resync, with no upper bound on how long that goes on.
#[tokio::test]
async fn failing_store_leaves_pod_pending_across_resyncs() {
    let store = RecordingStore::failing(503);
    let first = created("shop", "web", &[INITIALIZER_NAME]);
    let resync = |event: &PodEvent| Event {
        kind: EventKind::Resync,
        ..event.clone()
    };
    let events = vec![first.clone(), resync(&first), resync(&first)];

    run_all(events, &store).await;

    let updates = store.updates();
    assert_eq!(updates.len(), 3);
    assert!(updates
        .iter()
        .all(|pod| pod.metadata.initializers.is_none() && sidecar::is_injected(pod)));
}
