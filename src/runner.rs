use futures::{pin_mut, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::initializer::{self, Outcome, PodStore};
use crate::subscriber::{self, EventKind, PodEvent};

/// Consumes pod events one at a time until `stop` fires or the source ends.
///
/// Errors from the source or from a single pod are logged and the loop moves
/// on; nothing here ends the process. A pod whose update keeps failing stays
/// pending until a later resync succeeds.
pub async fn run<Events, Store>(
    events: Events,
    config: &Configuration,
    store: &Store,
    stop: CancellationToken,
) where
    Events: Stream<Item = Result<PodEvent, subscriber::Error>>,
    Store: PodStore,
{
    pin_mut!(events);

    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = events.next() => event,
        };

        match event {
            Some(Ok(event)) => {
                handle(event, config, store).await;
            }
            Some(Err(err)) => log::error!("pod watch error: {err}"),
            None => {
                log::warn!("pod event source ended");
                break;
            }
        }
    }
}

/// Returns `None` for events that were not handed to the reconciler.
async fn handle<Store: PodStore>(
    event: PodEvent,
    config: &Configuration,
    store: &Store,
) -> Option<Outcome> {
    match event.kind {
        // Resync replays give failed updates another chance.
        EventKind::Created | EventKind::Resync => {}
        // TODO decide whether updates to a pod that is still pending should be handled
        EventKind::Updated | EventKind::Deleted => return None,
    }

    match initializer::reconcile(event.entry, config, store).await {
        Ok(outcome) => {
            if outcome == Outcome::Initialized {
                log::debug!("initialized pod {}", event.key);
            }
            Some(outcome)
        }
        Err(err) => {
            let cause = if err.is_conflict() {
                "conflicting write"
            } else {
                "write failed"
            };
            log::error!("{err} ({cause}, left pending until the next resync)");
            None
        }
    }
}
