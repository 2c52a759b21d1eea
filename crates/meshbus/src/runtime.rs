//! Process-wide runtime state: the transport factory registry and the
//! live-attachment list.
//!
//! Nothing here is implicit: the host calls [`init`] before creating any
//! attachment and [`shutdown`] after the last one is gone. [`init`]
//! registers the bundled in-process router under the `null:` connect spec;
//! additional transports register factories keyed by their spec scheme.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use meshbus_core::status::Status;
use tracing::debug;

use crate::attachment::BusAttachment;
use crate::router::{BundledRouter, Router};

/// Connect spec of the bundled in-process router.
pub const BUNDLED_CONNECT_SPEC: &str = "null:";

/// Produces a router connection for a connect spec.
pub type TransportFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Router>, Status> + Send + Sync>;

struct RuntimeState {
    factories: HashMap<String, TransportFactory>,
    bundled: Arc<BundledRouter>,
    attachments: Vec<Weak<()>>,
}

fn cell() -> &'static Mutex<Option<RuntimeState>> {
    static CELL: OnceLock<Mutex<Option<RuntimeState>>> = OnceLock::new();
    CELL.get_or_init(|| Mutex::new(None))
}

/// Initializes the process-wide runtime. Idempotent.
pub fn init() {
    let mut state = cell().lock().unwrap();
    if state.is_some() {
        return;
    }
    let bundled = Arc::new(BundledRouter::new());
    let mut factories: HashMap<String, TransportFactory> = HashMap::new();
    let bundled_for_factory = bundled.clone();
    factories.insert(
        "null".to_string(),
        Arc::new(move |_spec| Ok(bundled_for_factory.clone() as Arc<dyn Router>)),
    );
    *state = Some(RuntimeState {
        factories,
        bundled,
        attachments: Vec::new(),
    });
    debug!("meshbus runtime initialized");
}

/// Tears down the process-wide runtime. The host must have stopped every
/// attachment first.
pub fn shutdown() {
    let mut state = cell().lock().unwrap();
    *state = None;
    debug!("meshbus runtime shut down");
}

/// True between [`init`] and [`shutdown`].
#[must_use]
pub fn is_initialized() -> bool {
    cell().lock().unwrap().is_some()
}

/// Registers a transport factory for a connect-spec scheme (the part
/// before the first `:`).
///
/// # Errors
///
/// [`Status::NotStarted`] before [`init`].
pub fn register_transport(scheme: &str, factory: TransportFactory) -> Result<(), Status> {
    let mut state = cell().lock().unwrap();
    let state = state.as_mut().ok_or(Status::NotStarted)?;
    state.factories.insert(scheme.to_string(), factory);
    Ok(())
}

/// Resolves a connect spec to a router via the registered factories.
///
/// # Errors
///
/// [`Status::NotStarted`] before [`init`];
/// [`Status::TransportUnavailable`] for an unknown scheme.
pub fn connect_transport(spec: &str) -> Result<Arc<dyn Router>, Status> {
    let factory = {
        let state = cell().lock().unwrap();
        let state = state.as_ref().ok_or(Status::NotStarted)?;
        let scheme = spec.split(':').next().unwrap_or_default();
        state
            .factories
            .get(scheme)
            .cloned()
            .ok_or(Status::TransportUnavailable)?
    };
    factory(spec)
}

/// The process's bundled router, used as the connect fallback.
///
/// # Errors
///
/// [`Status::NotStarted`] before [`init`].
pub fn bundled_router() -> Result<Arc<BundledRouter>, Status> {
    let state = cell().lock().unwrap();
    state
        .as_ref()
        .map(|state| state.bundled.clone())
        .ok_or(Status::NotStarted)
}

/// Records a live attachment for debugging. Dead entries are pruned as a
/// side effect.
pub(crate) fn track_attachment(token: &Arc<()>) {
    let mut state = cell().lock().unwrap();
    if let Some(state) = state.as_mut() {
        state.attachments.retain(|weak| weak.strong_count() > 0);
        state.attachments.push(Arc::downgrade(token));
    }
}

/// Number of live attachments (debugging aid).
#[must_use]
pub fn live_attachment_count() -> usize {
    let mut state = cell().lock().unwrap();
    match state.as_mut() {
        Some(state) => {
            state.attachments.retain(|weak| weak.strong_count() > 0);
            state.attachments.len()
        }
        None => 0,
    }
}

/// Convenience used by samples and tests: a started attachment connected
/// to a private bundled router.
///
/// # Errors
///
/// Propagates start/connect failures.
pub fn attach_to_private_router(
    app_name: &str,
    router: &Arc<BundledRouter>,
) -> Result<BusAttachment, Status> {
    let attachment = BusAttachment::new(app_name, crate::dispatch::DEFAULT_CONCURRENCY);
    attachment.start()?;
    attachment.connect_to_router(router.clone() as Arc<dyn Router>)?;
    Ok(attachment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_shutdown_cycle() {
        init();
        assert!(is_initialized());
        assert!(bundled_router().is_ok());
        // A second init is a no-op, not a reset.
        let first = bundled_router().unwrap().guid();
        init();
        assert_eq!(bundled_router().unwrap().guid(), first);
    }

    #[test]
    fn test_connect_transport_resolution() {
        init();
        assert!(connect_transport("null:").is_ok());
        assert_eq!(
            connect_transport("carrier-pigeon:addr=roof").unwrap_err(),
            Status::TransportUnavailable
        );
    }
}
