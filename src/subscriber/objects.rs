//! List-watch over all pods, uninitialized ones included.
//!
//! The stock [`kube_runtime::watcher`] cannot attach `includeUninitialized`
//! to its requests, so this module drives list and watch calls itself and
//! keeps a [reflector](kube_runtime::reflector) store to tell new objects
//! from known ones.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use kube_client::Client;
use kube_core::params::{ListParams, WatchParams};
use kube_core::{ObjectList, Request, Resource, WatchEvent};
use kube_runtime::reflector::{store::Writer, ObjectRef, Store};
use kube_runtime::watcher;
use serde_json::Value;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use super::{decode, Error, Event, EventKind, PodEvent};
use crate::pod::InitializablePod;

/// Interval between full replays of the cache.
pub const RESYNC_PERIOD: Duration = Duration::from_secs(30);
/// Pause before relisting after a failed list or watch.
pub const RELIST_DELAY: Duration = Duration::from_secs(5);
/// Server-side watch timeout, below the 295s limit of the apiserver.
const WATCH_TIMEOUT_SECS: u32 = 290;

const INCLUDE_UNINITIALIZED: &str = "includeUninitialized=true";

type RawWatch = BoxStream<'static, kube_client::Result<WatchEvent<Value>>>;

/// Subscribes to pod events across all namespaces.
///
/// The stream never ends. Errors are yielded as items and followed by a
/// relist, so the consumer only has to log them.
pub fn objects(
    client: Client,
    resync_period: Duration,
) -> impl Stream<Item = Result<PodEvent, Error>> + Send {
    stream::unfold(Source::new(client, resync_period), |mut source| async move {
        let item = source.next().await;
        Some((item, source))
    })
}

struct Source {
    client: Client,
    cache: Cache,
    queue: VecDeque<PodEvent>,
    watch: Option<RawWatch>,
    /// `None` forces a relist before the next watch.
    resource_version: Option<String>,
    resync: Interval,
    failed: bool,
}

enum Step {
    Resync,
    Watch(Option<kube_client::Result<WatchEvent<Value>>>),
}

impl Source {
    fn new(client: Client, resync_period: Duration) -> Self {
        let mut resync = time::interval_at(Instant::now() + resync_period, resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            client,
            cache: Cache::new(),
            queue: VecDeque::new(),
            watch: None,
            resource_version: None,
            resync,
            failed: false,
        }
    }

    async fn next(&mut self) -> Result<PodEvent, Error> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Ok(event);
            }

            let Some(watch) = self.watch.as_mut() else {
                if let Err(err) = self.connect().await {
                    return Err(self.fail(err));
                }
                continue;
            };

            let step = tokio::select! {
                _ = self.resync.tick() => Step::Resync,
                next = watch.next() => Step::Watch(next),
            };

            match step {
                Step::Resync => {
                    log::debug!("resyncing {} cached pods", self.cache.len());
                    self.queue.extend(self.cache.resync());
                }
                Step::Watch(None) => {
                    log::debug!("watch stream ended, resuming");
                    self.watch = None;
                }
                Step::Watch(Some(Ok(event))) => self.handle(event)?,
                Step::Watch(Some(Err(err))) => return Err(self.fail(Error::Watch(err))),
            }
        }
    }

    /// Relists if needed, then opens a watch from the known resource version.
    async fn connect(&mut self) -> Result<(), Error> {
        if self.failed {
            time::sleep(RELIST_DELAY).await;
            self.failed = false;
        }

        let resource_version = match self.resource_version.clone() {
            Some(version) => version,
            None => self.relist().await?,
        };

        let request = Request::new(InitializablePod::url_path(&(), None))
            .watch(
                &WatchParams::default().timeout(WATCH_TIMEOUT_SECS),
                &resource_version,
            )
            .map_err(|source| Error::Request {
                verb: "watch",
                source,
            })?;
        let watch = self
            .client
            .request_events::<Value>(include_uninitialized(request)?)
            .await
            .map_err(Error::Watch)?;

        self.resource_version = Some(resource_version);
        self.watch = Some(watch.boxed());
        Ok(())
    }

    async fn relist(&mut self) -> Result<String, Error> {
        let request = Request::new(InitializablePod::url_path(&(), None))
            .list(&ListParams::default())
            .map_err(|source| Error::Request {
                verb: "list",
                source,
            })?;
        let list: ObjectList<Value> = self
            .client
            .request(include_uninitialized(request)?)
            .await
            .map_err(Error::List)?;

        let pods = list
            .items
            .into_iter()
            .filter_map(|item| match decode::pod(item) {
                Ok(pod) => Some(pod),
                Err(err) => {
                    log::warn!("skipping list item: {err}");
                    None
                }
            })
            .collect();
        self.queue.extend(self.cache.replace(pods));

        Ok(list
            .metadata
            .resource_version
            .unwrap_or_else(|| "0".to_owned()))
    }

    fn handle(&mut self, event: WatchEvent<Value>) -> Result<(), Error> {
        match event {
            WatchEvent::Added(value) | WatchEvent::Modified(value) => {
                self.bump_version(&value);
                let pod = decode::pod(value)?;
                self.queue.push_back(self.cache.apply(pod));
            }
            WatchEvent::Deleted(value) => {
                self.bump_version(&value);
                let pod = decode::pod(value)?;
                self.queue.push_back(self.cache.delete(pod));
            }
            WatchEvent::Bookmark(bookmark) => {
                self.resource_version = Some(bookmark.metadata.resource_version);
            }
            WatchEvent::Error(status) => return Err(self.fail(Error::WatchStatus(status))),
        }
        Ok(())
    }

    fn bump_version(&mut self, value: &Value) {
        if let Some(version) = value
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            self.resource_version = Some(version.to_owned());
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        self.failed = true;
        self.watch = None;
        self.resource_version = None;
        err
    }
}

/// Appends the `includeUninitialized` flag to a list or watch request.
fn include_uninitialized(
    mut request: http::Request<Vec<u8>>,
) -> Result<http::Request<Vec<u8>>, Error> {
    let uri = with_include_uninitialized(&request.uri().to_string());
    *request.uri_mut() = uri
        .parse()
        .map_err(|source| Error::Uri { uri, source })?;
    Ok(request)
}

fn with_include_uninitialized(uri: &str) -> String {
    let separator = match uri.find('?') {
        None => "?",
        Some(_) if uri.ends_with('?') || uri.ends_with('&') => "",
        Some(_) => "&",
    };
    format!("{uri}{separator}{INCLUDE_UNINITIALIZED}")
}

/// Local view of the pods seen so far, backed by a reflector store.
struct Cache {
    writer: Writer<InitializablePod>,
    store: Store<InitializablePod>,
}

impl Cache {
    fn new() -> Self {
        let writer = Writer::new(());
        let store = writer.as_reader();
        Self { writer, store }
    }

    fn len(&self) -> usize {
        self.store.state().len()
    }

    fn contains(&self, pod: &InitializablePod) -> bool {
        self.store.get(&ObjectRef::from_obj(pod)).is_some()
    }

    fn apply(&mut self, pod: InitializablePod) -> PodEvent {
        let kind = if self.contains(&pod) {
            EventKind::Updated
        } else {
            EventKind::Created
        };
        self.writer
            .apply_watcher_event(&watcher::Event::Applied(pod.clone()));
        Event::new(kind, pod)
    }

    fn delete(&mut self, pod: InitializablePod) -> PodEvent {
        self.writer
            .apply_watcher_event(&watcher::Event::Deleted(pod.clone()));
        Event::new(EventKind::Deleted, pod)
    }

    /// Swaps in a fresh listing, reporting vanished objects as deleted.
    fn replace(&mut self, pods: Vec<InitializablePod>) -> Vec<PodEvent> {
        let listed: HashSet<ObjectRef<InitializablePod>> =
            pods.iter().map(ObjectRef::from_obj).collect();

        let mut events: Vec<PodEvent> = self
            .store
            .state()
            .into_iter()
            .filter(|cached| !listed.contains(&ObjectRef::from_obj(cached.as_ref())))
            .map(|cached| Event::new(EventKind::Deleted, (*cached).clone()))
            .collect();
        events.extend(pods.iter().map(|pod| {
            let kind = if self.contains(pod) {
                EventKind::Updated
            } else {
                EventKind::Created
            };
            Event::new(kind, pod.clone())
        }));

        self.writer
            .apply_watcher_event(&watcher::Event::Restarted(pods));
        events
    }

    fn resync(&self) -> Vec<PodEvent> {
        self.store
            .state()
            .into_iter()
            .map(|pod| Event::new(EventKind::Resync, (*pod).clone()))
            .collect()
    }
}
