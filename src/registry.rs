//! Dependency-aware service registry.
//!
//! Services are started wave by wave: a wave holds every service whose
//! dependencies are all in earlier waves, ordered by registration. Stop runs
//! in strict reverse of the order services were actually started.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::RegistryError;
use crate::events::{Event, EventBus};
use crate::service::{Service, ServiceDescriptor, ServiceState};

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

struct Entry {
    descriptor: ServiceDescriptor,
    service: Arc<dyn Service>,
}

pub struct ServiceRegistry {
    entries: RwLock<Vec<Entry>>,
    /// Names in the order they reached Running. Also serializes lifecycle operations.
    started: Mutex<Vec<String>>,
    bus: EventBus,
    start_timeout: Duration,
    stop_timeout: Duration,
}

impl ServiceRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            bus,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, start: Duration, stop: Duration) -> Self {
        self.start_timeout = start;
        self.stop_timeout = stop;
        self
    }

    /// Registers a service. Dependencies may reference services registered later;
    /// they are resolved at start time.
    pub fn register(
        &self,
        descriptor: ServiceDescriptor,
        service: Arc<dyn Service>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());

        if entries.iter().any(|e| e.descriptor.name == descriptor.name) {
            return Err(RegistryError::DuplicateService(descriptor.name));
        }

        let graph: HashMap<&str, &[String]> = entries
            .iter()
            .map(|e| (e.descriptor.name.as_str(), e.descriptor.depends_on.as_slice()))
            .collect();
        if let Some(path) = find_cycle(&descriptor, &graph) {
            warn!(service = %descriptor.name, cycle = %path.join(" -> "), "Rejected service registration");
            return Err(RegistryError::CyclicDependency { path });
        }

        debug!(
            service = %descriptor.name,
            stateful = descriptor.stateful,
            depends_on = ?descriptor.depends_on,
            "Registered service"
        );
        let mut descriptor = descriptor;
        descriptor.state = ServiceState::Stopped;
        entries.push(Entry {
            descriptor,
            service,
        });
        Ok(())
    }

    /// Start waves in dependency order, ties broken by registration order.
    pub fn start_order(&self) -> Result<Vec<Vec<String>>, RegistryError> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let names: HashSet<&str> = entries.iter().map(|e| e.descriptor.name.as_str()).collect();

        for entry in entries.iter() {
            if let Some(missing) = entry
                .descriptor
                .depends_on
                .iter()
                .find(|d| !names.contains(d.as_str()))
            {
                return Err(RegistryError::DependencyUnmet {
                    service: entry.descriptor.name.clone(),
                    reason: format!("depends on unregistered service '{}'", missing),
                });
            }
        }

        let mut placed: HashSet<&str> = HashSet::new();
        let mut waves = Vec::new();
        while placed.len() < entries.len() {
            let wave: Vec<&str> = entries
                .iter()
                .map(|e| &e.descriptor)
                .filter(|d| !placed.contains(d.name.as_str()))
                .filter(|d| d.depends_on.iter().all(|dep| placed.contains(dep.as_str())))
                .map(|d| d.name.as_str())
                .collect();
            if wave.is_empty() {
                // Unreachable while registration rejects cycles.
                let rest = entries
                    .iter()
                    .map(|e| e.descriptor.name.clone())
                    .filter(|n| !placed.contains(n.as_str()))
                    .collect();
                return Err(RegistryError::CyclicDependency { path: rest });
            }
            placed.extend(wave.iter().copied());
            waves.push(wave.into_iter().map(String::from).collect());
        }
        Ok(waves)
    }

    /// Starts every service in dependency order.
    ///
    /// If one fails, the services started by this call are stopped in reverse
    /// order before the error is returned. Running services are left alone.
    pub async fn start_all(&self) -> Result<(), RegistryError> {
        let mut started = self.started.lock().await;
        let waves = self.start_order()?;
        let mut this_call: Vec<String> = Vec::new();

        info!(waves = waves.len(), "Starting services");
        for name in waves.iter().flatten() {
            if self.state_of(name).is_running() {
                debug!(service = %name, "Service already running");
                continue;
            }
            match self.start_one(name).await {
                Ok(()) => {
                    started.retain(|n| n != name);
                    started.push(name.clone());
                    this_call.push(name.clone());
                }
                Err(reason) => {
                    error!(service = %name, reason = %reason, "Service failed to start, rolling back");
                    for done in this_call.iter().rev() {
                        self.stop_one(done).await;
                        started.retain(|n| n != done);
                    }
                    return Err(RegistryError::DependencyUnmet {
                        service: name.clone(),
                        reason,
                    });
                }
            }
        }
        info!(count = this_call.len(), "Services started");
        Ok(())
    }

    /// Stops services in strict reverse start order. A no-op when nothing runs.
    pub async fn stop_all(&self) -> Result<(), RegistryError> {
        let mut started = self.started.lock().await;
        if started.is_empty() {
            debug!("stop_all: nothing running");
            return Ok(());
        }
        info!(count = started.len(), "Stopping services");
        while let Some(name) = started.pop() {
            self.stop_one(&name).await;
        }
        Ok(())
    }

    /// Restarts one service. A stateful service takes its dependents down and
    /// back up with it; a stateless one is restarted alone.
    pub async fn restart(&self, name: &str) -> Result<(), RegistryError> {
        let mut started = self.started.lock().await;
        let affected = {
            let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
            let entry = entries
                .iter()
                .find(|e| e.descriptor.name == name)
                .ok_or_else(|| RegistryError::UnknownService(name.to_string()))?;
            if entry.descriptor.stateful {
                dependents_closure(name, &entries)
            } else {
                HashSet::from([name.to_string()])
            }
        };

        let to_stop: Vec<String> = started
            .iter()
            .rev()
            .filter(|n| affected.contains(n.as_str()))
            .cloned()
            .collect();
        for n in &to_stop {
            self.stop_one(n).await;
            started.retain(|s| s != n);
        }

        let order = self.start_order()?;
        for n in order.into_iter().flatten().filter(|n| affected.contains(n)) {
            if let Err(reason) = self.start_one(&n).await {
                return Err(RegistryError::DependencyUnmet { service: n, reason });
            }
            started.push(n);
        }
        Ok(())
    }

    /// Current state as seen by the registry and the service itself.
    pub fn get_service_state(&self, name: &str) -> Result<ServiceState, RegistryError> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries
            .iter()
            .find(|e| e.descriptor.name == name)
            .map(effective_state)
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))
    }

    /// Snapshot of every descriptor in registration order.
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries
            .iter()
            .map(|e| {
                let mut d = e.descriptor.clone();
                d.state = effective_state(e);
                d
            })
            .collect()
    }

    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries
            .iter()
            .find(|e| e.descriptor.name == name)
            .map(|e| Arc::clone(&e.service))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|e| e.descriptor.name == name)
    }

    async fn start_one(&self, name: &str) -> Result<(), String> {
        let service = self
            .service(name)
            .ok_or_else(|| format!("service '{}' disappeared", name))?;

        self.set_state(name, ServiceState::Starting, None);
        match tokio::time::timeout(self.start_timeout, service.start()).await {
            Ok(Ok(())) => {
                self.set_state(name, ServiceState::Running, None);
                Ok(())
            }
            Ok(Err(e)) => {
                let reason = e.to_string();
                self.set_state(name, ServiceState::Failed, Some(reason.clone()));
                Err(reason)
            }
            Err(_) => {
                service.kill();
                let reason = format!("start did not complete within {:?}", self.start_timeout);
                self.set_state(name, ServiceState::Failed, Some(reason.clone()));
                Err(reason)
            }
        }
    }

    async fn stop_one(&self, name: &str) {
        let Some(service) = self.service(name) else {
            return;
        };

        self.set_state(name, ServiceState::Stopping, None);
        let reason = match tokio::time::timeout(self.stop_timeout, service.stop()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!(service = %name, error = %e, "Service stop failed, forcing");
                service.kill();
                Some(format!("forced after error: {}", e))
            }
            Err(_) => {
                warn!(service = %name, timeout = ?self.stop_timeout, "Service did not stop in time, forcing");
                service.kill();
                Some("forced after stop timeout".to_string())
            }
        };
        self.set_state(name, ServiceState::Stopped, reason);
    }

    fn state_of(&self, name: &str) -> ServiceState {
        self.get_service_state(name).unwrap_or(ServiceState::Stopped)
    }

    fn set_state(&self, name: &str, to: ServiceState, reason: Option<String>) {
        let from = {
            let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
            let Some(entry) = entries.iter_mut().find(|e| e.descriptor.name == name) else {
                return;
            };
            std::mem::replace(&mut entry.descriptor.state, to)
        };
        if from != to {
            self.bus.publish(Event::state_changed(name, from, to, reason));
        }
    }
}

/// The recorded state, unless the service failed or went down on its own since.
fn effective_state(entry: &Entry) -> ServiceState {
    match (entry.descriptor.state, entry.service.state()) {
        (_, ServiceState::Failed) => ServiceState::Failed,
        (ServiceState::Running, own) => own,
        (recorded, _) => recorded,
    }
}

/// DFS from the new node through known edges. Any cycle must pass through it.
fn find_cycle(new: &ServiceDescriptor, graph: &HashMap<&str, &[String]>) -> Option<Vec<String>> {
    fn visit(
        node: &str,
        target: &str,
        graph: &HashMap<&str, &[String]>,
        path: &mut Vec<String>,
        seen: &mut HashSet<String>,
    ) -> bool {
        path.push(node.to_string());
        if node == target {
            return true;
        }
        if seen.insert(node.to_string()) {
            if let Some(deps) = graph.get(node) {
                for dep in deps.iter() {
                    if visit(dep, target, graph, path, seen) {
                        return true;
                    }
                }
            }
        }
        path.pop();
        false
    }

    let mut seen = HashSet::new();
    for dep in &new.depends_on {
        let mut path = vec![new.name.clone()];
        if visit(dep, &new.name, graph, &mut path, &mut seen) {
            return Some(path);
        }
    }
    None
}

fn dependents_closure(root: &str, entries: &[Entry]) -> HashSet<String> {
    let mut out = HashSet::from([root.to_string()]);
    loop {
        let before = out.len();
        for e in entries {
            if e.descriptor.depends_on.iter().any(|d| out.contains(d)) {
                out.insert(e.descriptor.name.clone());
            }
        }
        if out.len() == before {
            return out;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    type Journal = Arc<StdMutex<Vec<String>>>;

    struct FakeService {
        name: String,
        journal: Journal,
        fail_start: bool,
        hang_stop: bool,
        report_failed: AtomicBool,
        running: AtomicBool,
    }

    impl FakeService {
        fn new(name: &str, journal: &Journal) -> Self {
            Self {
                name: name.to_string(),
                journal: Arc::clone(journal),
                fail_start: false,
                hang_stop: false,
                report_failed: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Service for FakeService {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> Result<(), ServiceError> {
            self.journal.lock().unwrap().push(format!("start:{}", self.name));
            if self.fail_start {
                return Err(ServiceError::Other("boom".into()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), ServiceError> {
            self.journal.lock().unwrap().push(format!("stop:{}", self.name));
            if self.hang_stop {
                std::future::pending::<()>().await;
            }
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn kill(&self) {
            self.journal.lock().unwrap().push(format!("kill:{}", self.name));
            self.running.store(false, Ordering::SeqCst);
        }

        fn state(&self) -> ServiceState {
            if self.report_failed.load(Ordering::SeqCst) {
                ServiceState::Failed
            } else if self.running.load(Ordering::SeqCst) {
                ServiceState::Running
            } else {
                ServiceState::Stopped
            }
        }
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(EventBus::new())
            .with_timeouts(Duration::from_secs(2), Duration::from_millis(100))
    }

    fn add(reg: &ServiceRegistry, journal: &Journal, name: &str, deps: &[&str]) {
        reg.register(
            ServiceDescriptor::new(name).depends_on(deps.iter().copied()),
            Arc::new(FakeService::new(name, journal)),
        )
        .unwrap();
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[test]
    fn rejects_duplicate_names() {
        let journal = Journal::default();
        let reg = registry();
        add(&reg, &journal, "process", &[]);
        let err = reg
            .register(
                ServiceDescriptor::new("process"),
                Arc::new(FakeService::new("process", &journal)),
            )
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateService("process".into()));
    }

    #[test]
    fn rejects_cycle_through_forward_reference() {
        let journal = Journal::default();
        let reg = registry();
        add(&reg, &journal, "a", &["b"]);
        let err = reg
            .register(
                ServiceDescriptor::new("b").depends_on(["a"]),
                Arc::new(FakeService::new("b", &journal)),
            )
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::CyclicDependency {
                path: vec!["b".into(), "a".into(), "b".into()]
            }
        );
        assert!(!reg.contains("b"));
    }

    #[test]
    fn rejects_self_dependency() {
        let journal = Journal::default();
        let reg = registry();
        let err = reg
            .register(
                ServiceDescriptor::new("a").depends_on(["a"]),
                Arc::new(FakeService::new("a", &journal)),
            )
            .unwrap_err();
        assert_eq!(err.as_label(), "cyclic_dependency");
    }

    #[test]
    fn waves_respect_dependencies_and_registration_order() {
        let journal = Journal::default();
        let reg = registry();
        add(&reg, &journal, "rcon", &["process"]);
        add(&reg, &journal, "logs", &["process"]);
        add(&reg, &journal, "process", &[]);
        let waves = reg.start_order().unwrap();
        assert_eq!(
            waves,
            vec![vec!["process".to_string()], vec!["rcon".into(), "logs".into()]]
        );
    }

    #[tokio::test]
    async fn start_then_stop_in_reverse() {
        let journal = Journal::default();
        let reg = registry();
        add(&reg, &journal, "process", &[]);
        add(&reg, &journal, "logs", &["process"]);
        add(&reg, &journal, "rcon", &["process"]);

        reg.start_all().await.unwrap();
        assert_eq!(reg.get_service_state("rcon").unwrap(), ServiceState::Running);
        reg.stop_all().await.unwrap();

        assert_eq!(
            entries(&journal),
            vec![
                "start:process",
                "start:logs",
                "start:rcon",
                "stop:rcon",
                "stop:logs",
                "stop:process"
            ]
        );
        for d in reg.services() {
            assert_eq!(d.state, ServiceState::Stopped);
        }
    }

    #[tokio::test]
    async fn failed_start_rolls_back_started_services() {
        let journal = Journal::default();
        let reg = registry();
        add(&reg, &journal, "process", &[]);
        add(&reg, &journal, "logs", &["process"]);
        let mut rcon = FakeService::new("rcon", &journal);
        rcon.fail_start = true;
        reg.register(ServiceDescriptor::new("rcon").depends_on(["process"]), Arc::new(rcon))
            .unwrap();

        let err = reg.start_all().await.unwrap_err();
        assert!(matches!(err, RegistryError::DependencyUnmet { ref service, .. } if service == "rcon"));
        assert_eq!(reg.get_service_state("process").unwrap(), ServiceState::Stopped);
        assert_eq!(reg.get_service_state("logs").unwrap(), ServiceState::Stopped);
        assert_eq!(reg.get_service_state("rcon").unwrap(), ServiceState::Failed);
        assert_eq!(
            entries(&journal),
            vec![
                "start:process",
                "start:logs",
                "start:rcon",
                "stop:logs",
                "stop:process"
            ]
        );
    }

    #[tokio::test]
    async fn unregistered_dependency_starts_nothing() {
        let journal = Journal::default();
        let reg = registry();
        add(&reg, &journal, "process", &[]);
        add(&reg, &journal, "rcon", &["network"]);
        let err = reg.start_all().await.unwrap_err();
        assert_eq!(err.as_label(), "dependency_unmet");
        assert!(entries(&journal).is_empty());
    }

    #[tokio::test]
    async fn stop_all_is_idempotent() {
        let journal = Journal::default();
        let reg = registry();
        add(&reg, &journal, "process", &[]);
        reg.stop_all().await.unwrap();
        reg.start_all().await.unwrap();
        reg.stop_all().await.unwrap();
        reg.stop_all().await.unwrap();
        assert_eq!(entries(&journal), vec!["start:process", "stop:process"]);
    }

    #[tokio::test]
    async fn stop_timeout_forces_kill_and_records_stop() {
        let journal = Journal::default();
        let bus = EventBus::new();
        let mut events = bus.subscribe(crate::events::EventKind::ServiceStateChanged);
        let reg = ServiceRegistry::new(bus)
            .with_timeouts(Duration::from_secs(2), Duration::from_millis(50));
        let mut stuck = FakeService::new("process", &journal);
        stuck.hang_stop = true;
        reg.register(ServiceDescriptor::new("process"), Arc::new(stuck)).unwrap();

        reg.start_all().await.unwrap();
        reg.stop_all().await.unwrap();

        assert_eq!(reg.get_service_state("process").unwrap(), ServiceState::Stopped);
        assert_eq!(
            entries(&journal),
            vec!["start:process", "stop:process", "kill:process"]
        );

        let mut last = None;
        while let Some(ev) = events.try_recv() {
            last = Some(ev);
        }
        match &last.unwrap().payload {
            crate::events::EventPayload::ServiceStateChanged { to, reason, .. } => {
                assert_eq!(*to, ServiceState::Stopped);
                assert!(reason.as_deref().unwrap().contains("timeout"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn runtime_failure_overrides_recorded_state() {
        let journal = Journal::default();
        let reg = registry();
        let svc = Arc::new(FakeService::new("process", &journal));
        reg.register(ServiceDescriptor::new("process"), svc.clone()).unwrap();
        reg.start_all().await.unwrap();
        svc.report_failed.store(true, Ordering::SeqCst);
        assert_eq!(reg.get_service_state("process").unwrap(), ServiceState::Failed);
        assert!(reg.get_service_state("nope").is_err());
    }

    #[tokio::test]
    async fn restart_of_stateful_service_cycles_dependents() {
        let journal = Journal::default();
        let reg = registry();
        add(&reg, &journal, "process", &[]);
        add(&reg, &journal, "rcon", &["process"]);
        reg.register(
            ServiceDescriptor::new("metrics").stateful(false),
            Arc::new(FakeService::new("metrics", &journal)),
        )
        .unwrap();
        reg.start_all().await.unwrap();
        journal.lock().unwrap().clear();

        reg.restart("process").await.unwrap();
        assert_eq!(
            entries(&journal),
            vec!["stop:rcon", "stop:process", "start:process", "start:rcon"]
        );

        journal.lock().unwrap().clear();
        reg.restart("metrics").await.unwrap();
        assert_eq!(entries(&journal), vec!["stop:metrics", "start:metrics"]);

        reg.stop_all().await.unwrap();
        let tail = entries(&journal);
        assert_eq!(&tail[2..], &["stop:metrics", "stop:rcon", "stop:process"]);
    }
}
