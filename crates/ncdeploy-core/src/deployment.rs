//! One deployed unit: settings, registry and collaborators wired together.

use tracing::{info, warn};

use crate::backend::{PersistedState, StateBackend};
use crate::condition::LiveFacts;
use crate::config::Settings;
use crate::error::Result;
use crate::event::Event;
use crate::flags::FlagStore;
use crate::host::Host;
use crate::registry::ActionRegistry;
use crate::runner::{PassReport, Reconciler};
use crate::storage::MigrationState;
use crate::{nextcloud, storage};

/// The full action table in execution order.
pub fn default_registry(settings: &Settings) -> Result<ActionRegistry> {
    let builder = nextcloud::register(ActionRegistry::builder());
    storage::register(builder, settings).build()
}

pub struct Deployment<B, F, H> {
    settings: Settings,
    registry: ActionRegistry,
    backend: B,
    facts: F,
    host: H,
}

impl<B, F, H> Deployment<B, F, H>
where
    B: StateBackend,
    F: LiveFacts,
    H: Host,
{
    pub fn new(settings: Settings, backend: B, facts: F, host: H) -> Result<Self> {
        let registry = default_registry(&settings)?;
        Ok(Self::with_registry(settings, registry, backend, facts, host))
    }

    pub fn with_registry(
        settings: Settings,
        registry: ActionRegistry,
        backend: B,
        facts: F,
        host: H,
    ) -> Self {
        Self {
            settings,
            registry,
            backend,
            facts,
            host,
        }
    }

    /// Process one trigger: seed its facts, reconcile, then persist and
    /// publish the outcome.
    ///
    /// A diverged pass is still committed and published (as blocked); callers
    /// inspect `PassReport::outcome`. A persistence failure aborts before
    /// anything is published and leaves the stored state as it was.
    pub fn handle_event(&mut self, event: &Event) -> Result<PassReport> {
        let persisted = self.backend.load()?;
        let mut store = persisted.store();
        event.apply(&mut store, &self.settings)?;

        let trigger = event.to_string();
        info!(trigger = %trigger, "handling event");
        let report = Reconciler::new(&self.registry, &self.settings).run(
            &trigger,
            &mut store,
            &self.facts,
            &mut self.host,
            persisted.status.as_ref(),
        );

        let next = PersistedState::from_store(store, Some(report.status.clone()));
        self.backend.commit(&next)?;
        self.host.set_status(&report.status);

        if let Err(e) = self.backend.record_pass(&report) {
            warn!(error = %e, "could not record pass history");
        }
        Ok(report)
    }

    /// Current persisted flags and values.
    pub fn load(&self) -> Result<PersistedState> {
        self.backend.load()
    }

    /// Actions whose condition holds against the persisted flags right now.
    pub fn eligible(&self) -> Result<Vec<&str>> {
        let store: FlagStore = self.backend.load()?.store();
        Ok(Reconciler::new(&self.registry, &self.settings).eligible(&store, &self.facts))
    }

    pub fn migration_state(&self) -> Result<MigrationState> {
        let flags = self.backend.load()?.store().snapshot();
        Ok(MigrationState::derive(&flags, &self.settings.storage_name))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn facts(&self) -> &F {
        &self.facts
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
