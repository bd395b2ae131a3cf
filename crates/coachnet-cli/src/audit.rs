//! Audit task – persists safety events from the event bus.
//!
//! Frames are traffic, not safety history, and are skipped. Writes run on
//! the blocking pool so SQLite never stalls the runtime.

use std::sync::Arc;

use coachnet_kernel::SafetySnapshot;
use coachnet_middleware::TopicReceiver;
use coachnet_store::SafetyStore;
use coachnet_types::{Event, EventPayload, GatewayError};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Record every non-frame event until `shutdown` flips to `true`, then drain
/// what is already queued.
pub async fn run(store: Arc<SafetyStore>, mut events: TopicReceiver, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => record(&store, event).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "audit trail fell behind; events not recorded");
                }
                Err(RecvError::Closed) => return,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    loop {
        match events.try_recv() {
            Ok(event) => record(&store, event).await,
            Err(TryRecvError::Lagged(missed)) => {
                warn!(missed, "audit trail fell behind; events not recorded");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    debug!("audit task stopped");
}

async fn record(store: &Arc<SafetyStore>, event: Event) {
    if matches!(event.payload, EventPayload::Frame { .. }) {
        return;
    }
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.record_audit(&event)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(error = %e, "audit entry not written"),
        Err(e) => error!(error = %e, "audit write aborted"),
    }
}

/// Write every component's final state. Returns the number of rows written.
pub async fn record_final_states(
    store: Arc<SafetyStore>,
    snapshot: Arc<SafetySnapshot>,
) -> Result<usize, GatewayError> {
    tokio::task::spawn_blocking(move || {
        for component in snapshot.components.values() {
            store.record_final_state(&component.name, component.state)?;
        }
        Ok::<_, GatewayError>(snapshot.components.len())
    })
    .await
    .map_err(|e| GatewayError::Persistence(format!("final state write aborted: {e}")))?
}
