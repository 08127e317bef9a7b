use std::sync::Arc;

use tokio::task::JoinHandle;

use super::admin::AdminService;
use super::tracking::ApplicationTracker;
use super::views::{DatasetView, ViewSpec};
use crate::datastore::DataStore;
use crate::sync::{
    InvalidationBus, MutationInvalidator, Notifier, PollRegistry, QueryClient, RealtimeTransport,
    SyncConfig,
};

/// Process-wide wiring shared by every view and service.
///
/// Built once at start-up and handed out by reference; views in unrelated
/// parts of the portal reach each other only through the bus it owns.
#[derive(Clone)]
pub struct PortalContext {
    bus: InvalidationBus,
    client: QueryClient,
    notifier: Arc<Notifier>,
    invalidator: MutationInvalidator,
    polls: PollRegistry,
    store: Arc<dyn DataStore>,
    realtime: Arc<dyn RealtimeTransport>,
}

impl PortalContext {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn DataStore>,
        realtime: Arc<dyn RealtimeTransport>,
    ) -> Self {
        let bus = InvalidationBus::new();

        let client = QueryClient::new(config);
        client.attach_bus(&bus);

        let notifier = Arc::new(Notifier::new());
        notifier.attach(&bus);

        Self {
            invalidator: MutationInvalidator::new(bus.clone()),
            polls: PollRegistry::new(bus.clone()),
            bus,
            client,
            notifier,
            store,
            realtime,
        }
    }

    pub fn bus(&self) -> &InvalidationBus {
        &self.bus
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    pub fn config(&self) -> &SyncConfig {
        self.client.config()
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn polls(&self) -> &PollRegistry {
        &self.polls
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn realtime(&self) -> &Arc<dyn RealtimeTransport> {
        &self.realtime
    }

    /// Mount a dataset view. See [`DatasetView`] for the teardown contract.
    pub fn mount(&self, spec: ViewSpec) -> DatasetView {
        DatasetView::mount(self, spec)
    }

    /// Admin writes that invalidate derived keys on success.
    pub fn admin(&self) -> AdminService {
        AdminService::new(self.store.clone(), self.notifier.clone())
            .with_invalidator(self.invalidator.clone())
    }

    pub fn tracker(&self) -> ApplicationTracker {
        ApplicationTracker::new(self.client.clone(), self.store.clone())
    }

    /// Start the periodic cache sweep.
    pub fn spawn_gc(&self) -> JoinHandle<()> {
        self.client.spawn_gc()
    }
}
