//! Runtime registry: the single owner of the pane id → runtime map.
//!
//! Callers look runtimes up transiently to route a command; they never keep
//! a second long-lived handle. The registry also remembers the last epoch
//! used per pane id, so a pane re-opened under the same id continues with a
//! fresh epoch instead of reusing old sequence numbers.
//!
//! A runtime leaves the registry exactly once, on whichever path ends it
//! first: an explicit close, a fatal backend failure, or a command after
//! which its backend is no longer alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use panebus_core::types::ResourceId;
use panebus_core::{CommandAck, CommandError, PaneId, RuntimeCommandEnvelope};

use crate::runtime::PaneRuntime;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("pane {0} is already registered")]
    AlreadyRegistered(PaneId),

    #[error("pane {0} is not registered")]
    NotRegistered(PaneId),
}

#[derive(Debug, Default)]
struct RegistryState {
    runtimes: HashMap<PaneId, Arc<PaneRuntime>>,
    last_epochs: HashMap<PaneId, u64>,
}

#[derive(Debug)]
pub struct RuntimeRegistry {
    state: Mutex<RegistryState>,
    shutdown_timeout: Duration,
}

impl RuntimeRegistry {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            shutdown_timeout,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Epoch to use for a new runtime with this id: 0 for a never-seen id,
    /// otherwise one past the last epoch registered under it.
    pub async fn next_epoch(&self, pane_id: &PaneId) -> u64 {
        let state = self.state.lock().await;
        state
            .last_epochs
            .get(pane_id)
            .map_or(0, |epoch| epoch.saturating_add(1))
    }

    /// Register a runtime. At most one live runtime per pane id.
    pub async fn register(&self, runtime: Arc<PaneRuntime>) -> Result<(), RegistryError> {
        let pane_id = runtime.pane_id().clone();
        let epoch = runtime.snapshot().await.epoch;
        let mut state = self.state.lock().await;
        if state.runtimes.contains_key(&pane_id) {
            return Err(RegistryError::AlreadyRegistered(pane_id));
        }
        let last = state.last_epochs.entry(pane_id.clone()).or_insert(epoch);
        *last = (*last).max(epoch);
        state.runtimes.insert(pane_id.clone(), runtime);
        debug!(pane_id = %pane_id, epoch, "runtime registered");
        Ok(())
    }

    pub async fn lookup(&self, pane_id: &PaneId) -> Option<Arc<PaneRuntime>> {
        self.state.lock().await.runtimes.get(pane_id).cloned()
    }

    pub async fn contains(&self, pane_id: &PaneId) -> bool {
        self.state.lock().await.runtimes.contains_key(pane_id)
    }

    /// Every registered runtime, in id order.
    pub async fn runtimes(&self) -> Vec<Arc<PaneRuntime>> {
        let state = self.state.lock().await;
        let mut runtimes: Vec<Arc<PaneRuntime>> = state.runtimes.values().cloned().collect();
        runtimes.sort_by(|a, b| a.pane_id().cmp(b.pane_id()));
        runtimes
    }

    /// Remove the runtime without shutting it down.
    pub async fn unregister(&self, pane_id: &PaneId) -> Result<Arc<PaneRuntime>, RegistryError> {
        self.state
            .lock()
            .await
            .runtimes
            .remove(pane_id)
            .ok_or_else(|| RegistryError::NotRegistered(pane_id.clone()))
    }

    /// Unregister, then shut the runtime down. Only the first of several
    /// concurrent closes of the same pane performs the shutdown.
    pub async fn close(
        &self,
        pane_id: &PaneId,
        timeout: Duration,
    ) -> Result<Vec<ResourceId>, RegistryError> {
        let runtime = self.unregister(pane_id).await?;
        let released = runtime.shutdown(timeout).await;
        info!(pane_id = %pane_id, resources = released.len(), "runtime closed");
        Ok(released)
    }

    /// Sorted ids of every registered pane.
    pub async fn list(&self) -> Vec<PaneId> {
        let mut ids: Vec<PaneId> = self.state.lock().await.runtimes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.runtimes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Route a command to its target. A runtime that the command terminated
    /// (fatal backend failure or a backend that stopped) is closed and
    /// unregistered before the result is returned.
    pub async fn dispatch(
        &self,
        command: &RuntimeCommandEnvelope,
    ) -> Result<CommandAck, CommandError> {
        let pane_id = &command.target_pane_id;
        let runtime = self
            .lookup(pane_id)
            .await
            .ok_or_else(|| CommandError::UnknownPane(pane_id.clone()))?;
        let result = runtime.handle_command(command).await;
        let terminated = runtime.lifecycle().await.is_terminal();
        drop(runtime);

        match &result {
            Err(err) if err.is_fatal() => {
                warn!(pane_id = %pane_id, error = %err, "closing failed runtime");
            }
            _ if terminated => info!(pane_id = %pane_id, "closing terminated runtime"),
            _ => return result,
        }
        if let Err(e) = self.close(pane_id, self.shutdown_timeout).await {
            debug!(pane_id = %pane_id, error = %e, "runtime already closed");
        }
        result
    }

    /// Close every runtime, in id order.
    pub async fn close_all(&self, timeout: Duration) -> Vec<(PaneId, Vec<ResourceId>)> {
        let mut closed = Vec::new();
        for pane_id in self.list().await {
            if let Ok(released) = self.close(&pane_id, timeout).await {
                closed.push((pane_id, released));
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::backend_for_kind;
    use crate::bus::EventBus;
    use panebus_core::command::TerminalCommand;
    use panebus_core::types::{PaneKind, PaneMetadata};
    use panebus_core::{CapabilitySet, LifecycleState, ManualClock, PaneCommand};

    const TIMEOUT: Duration = Duration::from_secs(1);

    async fn runtime(registry: &RuntimeRegistry, id: &str) -> Arc<PaneRuntime> {
        let pane_id = PaneId::new(id);
        let epoch = registry.next_epoch(&pane_id).await;
        PaneRuntime::new(
            pane_id.clone(),
            backend_for_kind(PaneKind::Terminal, &pane_id),
            PaneMetadata::default(),
            CapabilitySet::for_kind(PaneKind::Terminal),
            epoch,
            16,
            EventBus::new(16),
            Arc::new(ManualClock::new(0)),
        )
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let registry = RuntimeRegistry::new(TIMEOUT);
        registry
            .register(runtime(&registry, "p1").await)
            .await
            .expect("first");
        let err = registry
            .register(runtime(&registry, "p1").await)
            .await
            .expect_err("duplicate");
        assert_eq!(err, RegistryError::AlreadyRegistered(PaneId::new("p1")));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_pane_dispatch() {
        let registry = RuntimeRegistry::new(TIMEOUT);
        let cmd = RuntimeCommandEnvelope::new(
            "c1",
            "ghost",
            PaneCommand::Terminal(TerminalCommand::Clear),
            0,
        );
        assert_eq!(
            registry.dispatch(&cmd).await.expect_err("unknown"),
            CommandError::UnknownPane(PaneId::new("ghost"))
        );
    }

    #[tokio::test]
    async fn close_unregisters_exactly_once() {
        let registry = RuntimeRegistry::new(TIMEOUT);
        let rt = runtime(&registry, "p1").await;
        rt.start().await.expect("start");
        registry.register(Arc::clone(&rt)).await.expect("register");

        let released = registry.close(&PaneId::new("p1"), TIMEOUT).await.expect("close");
        assert_eq!(released.len(), 2);
        assert_eq!(rt.lifecycle().await, LifecycleState::Terminated);
        assert_eq!(
            registry.close(&PaneId::new("p1"), TIMEOUT).await,
            Err(RegistryError::NotRegistered(PaneId::new("p1")))
        );
        assert!(registry.lookup(&PaneId::new("p1")).await.is_none());
    }

    #[tokio::test]
    async fn reopened_pane_gets_next_epoch() {
        let registry = RuntimeRegistry::new(TIMEOUT);
        let pane = PaneId::new("p1");
        assert_eq!(registry.next_epoch(&pane).await, 0);
        registry
            .register(runtime(&registry, "p1").await)
            .await
            .expect("register");
        registry.close(&pane, TIMEOUT).await.expect("close");

        assert_eq!(registry.next_epoch(&pane).await, 1);
        let reopened = runtime(&registry, "p1").await;
        reopened.start().await.expect("start");
        registry.register(reopened).await.expect("re-register");
        let rt = registry.lookup(&pane).await.expect("registered");
        let snapshot = rt.snapshot().await;
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.last_seq, 2);
    }

    #[tokio::test]
    async fn killed_terminal_unregisters_once() {
        let registry = RuntimeRegistry::new(TIMEOUT);
        let rt = runtime(&registry, "p1").await;
        rt.start().await.expect("start");
        registry.register(Arc::clone(&rt)).await.expect("register");
        let kill = RuntimeCommandEnvelope::new(
            "c1",
            "p1",
            PaneCommand::Terminal(TerminalCommand::Kill),
            0,
        );
        registry.dispatch(&kill).await.expect("kill acked");
        assert!(!registry.contains(&PaneId::new("p1")).await);
        assert_eq!(rt.lifecycle().await, LifecycleState::Terminated);
        assert!(rt.snapshot().await.failure.is_none());

        assert_eq!(
            registry.dispatch(&kill).await.expect_err("gone"),
            CommandError::UnknownPane(PaneId::new("p1"))
        );
        assert_eq!(
            registry.close(&PaneId::new("p1"), TIMEOUT).await,
            Err(RegistryError::NotRegistered(PaneId::new("p1")))
        );
        // Resources were released when the registry closed it.
        assert!(rt.shutdown(TIMEOUT).await.is_empty());
    }

    #[tokio::test]
    async fn runtimes_listed_in_id_order() {
        let registry = RuntimeRegistry::new(TIMEOUT);
        for id in ["b", "a"] {
            registry
                .register(runtime(&registry, id).await)
                .await
                .expect("register");
        }
        let ids: Vec<PaneId> = registry
            .runtimes()
            .await
            .iter()
            .map(|rt| rt.pane_id().clone())
            .collect();
        assert_eq!(ids, vec![PaneId::new("a"), PaneId::new("b")]);
    }

    #[tokio::test]
    async fn fatal_backend_error_unregisters() {
        use crate::backend::{BackendError, PaneBackend};
        use panebus_core::PaneEvent;

        #[derive(Debug)]
        struct BrokenPipe;

        impl PaneBackend for BrokenPipe {
            fn kind(&self) -> PaneKind {
                PaneKind::Terminal
            }
            fn start(&mut self, _: &PaneMetadata) -> Result<Vec<PaneEvent>, BackendError> {
                Ok(Vec::new())
            }
            fn apply(&mut self, _: &PaneCommand) -> Result<Vec<PaneEvent>, BackendError> {
                Err(BackendError::Fatal("broken pipe".to_string()))
            }
            fn shutdown(&mut self) -> Vec<ResourceId> {
                Vec::new()
            }
        }

        let registry = RuntimeRegistry::new(TIMEOUT);
        let rt = PaneRuntime::new(
            PaneId::new("p1"),
            Box::new(BrokenPipe),
            PaneMetadata::default(),
            CapabilitySet::for_kind(PaneKind::Terminal),
            0,
            16,
            EventBus::new(16),
            Arc::new(ManualClock::new(0)),
        );
        rt.start().await.expect("start");
        registry.register(Arc::clone(&rt)).await.expect("register");

        let cmd = RuntimeCommandEnvelope::new(
            "c1",
            "p1",
            PaneCommand::Terminal(TerminalCommand::Clear),
            0,
        );
        let err = registry.dispatch(&cmd).await.expect_err("fatal");
        assert!(err.is_fatal());
        assert!(registry.is_empty().await);
        assert_eq!(rt.lifecycle().await, LifecycleState::Terminated);
        assert_eq!(rt.snapshot().await.failure.as_deref(), Some("broken pipe"));
    }
}
