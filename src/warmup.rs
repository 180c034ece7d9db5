//! Warmup hook (spec.md §6 `warmup.{source-ext}`, SPEC_FULL.md §5): an
//! optional zero-or-one startup handler run once, with its own ambient
//! context, before a host adapter starts feeding it HTTP/WebSocket/queue
//! events. Registered the same way a route or queue is — `#[warmup]` on an
//! `async fn` — rather than discovered from a file named `warmup.ts`.

use crate::context::{Ambient, AmbientState};
use crate::error::Result;
use crate::host::Collaborators;
use std::future::Future;
use std::pin::Pin;

pub type WarmupFn = fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;

pub struct WarmupInfo {
    pub source: &'static str,
    pub handler: WarmupFn,
}

#[linkme::distributed_slice]
pub static WARMUP_REGISTRATIONS: [WarmupInfo];

/// Runs every registered warmup hook, in registration order, each inside
/// its own ambient scope. More than one `#[warmup]` function may be
/// registered — unlike the single-file `warmup.ts` the source system
/// allows, nothing here requires exactly one, so they all run. A hook that
/// fails is logged and does not prevent the others from running or the
/// listener from binding afterward; spec.md treats warmup failure as a
/// deploy-time signal for the host, not a dispatch-time error.
pub async fn run(collaborators: Collaborators) {
    for info in WARMUP_REGISTRATIONS.iter() {
        let state = AmbientState::new(collaborators.clone());
        let result = Ambient::enter(state, (info.handler)()).await;
        if let Err(e) = result {
            log::error!("warmup {} failed: {}", info.source, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{InMemoryWsHost, UrlTable};
    use std::sync::Arc;

    #[tokio::test]
    async fn run_with_no_registrations_is_a_no_op() {
        let host = Arc::new(InMemoryWsHost::new());
        let collaborators = Collaborators {
            services: Arc::new(crate::manifest::Services::build().unwrap()),
            connections: host.clone(),
            queue_backend: Arc::new(NullQueue),
            ws_transport: host,
            urls: UrlTable::default(),
        };
        run(collaborators).await;
    }

    struct NullQueue;

    #[async_trait::async_trait]
    impl crate::host::QueueBackend for NullQueue {
        async fn push(&self, _queue_name: &str, _group_id: Option<&str>, _payload: serde_json::Value) -> Result<String> {
            Ok("msg-1".to_string())
        }
        async fn delete_message(&self, _queue_name: &str, _receipt_handle: &str) -> Result<()> {
            Ok(())
        }
        fn is_local(&self) -> bool {
            true
        }
    }
}
