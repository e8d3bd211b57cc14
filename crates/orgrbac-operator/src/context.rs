//! Shared state handed to every reconcile pass

use std::sync::Arc;

use orgrbac_common::{CancellableStore, ObjectStore, OperatorConfig};
use orgrbac_engine::{SubjectPropagator, TemplateMaterializer};
use tokio_util::sync::CancellationToken;

/// Controller context
///
/// Generic over the store so the controllers run unchanged against
/// `KubeStore` in production and `MemoryStore` in tests.
pub struct Context<S> {
    /// Backing store, shared by all passes
    pub store: Arc<S>,
    /// Operator configuration
    pub config: OperatorConfig,
    /// Engine for RoleBindingTemplate passes
    pub materializer: TemplateMaterializer,
    /// Engine for Organization passes
    pub propagator: SubjectPropagator,
    /// Cancelled when the operator shuts down
    pub shutdown: CancellationToken,
}

impl<S: ObjectStore> Context<S> {
    /// Build a context, deriving both engines from `config`
    pub fn new(store: S, config: OperatorConfig, shutdown: CancellationToken) -> Self {
        Self {
            store: Arc::new(store),
            materializer: TemplateMaterializer::from_config(&config),
            propagator: SubjectPropagator::from_config(&config),
            config,
            shutdown,
        }
    }

    /// Store for a single pass, aborted once shutdown begins
    pub fn pass_store(&self) -> CancellableStore<Arc<S>> {
        CancellableStore::new(self.store.clone(), self.shutdown.child_token())
    }
}
