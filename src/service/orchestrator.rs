use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::service::{
    lifecycle::{ContainerRuntime, DEFAULT_STOP_TIMEOUT, LifecycleError},
    locks::RestartLocks,
    poller::{DEFAULT_MAX_WAIT, DEFAULT_POLL_INTERVAL, PollError, Poller},
    probe::{ConnectivityProbe, ProbeEndpoint},
};

pub const DEFAULT_SETTLE: Duration = Duration::from_secs(10);
/// Slack on top of the stop timeout for docker to start the container again.
pub const DEFAULT_RESTART_SLACK: Duration = Duration::from_secs(30);

/// Rendered in place of a prior identifier that could not be read.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartTimings {
    /// Graceful stop timeout handed to docker before it kills the container.
    pub stop_timeout: Duration,
    /// Upper bound on the whole restart call.
    pub restart_ceiling: Duration,
    /// Blind wait between the restart and the first probe.
    pub settle: Duration,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for RestartTimings {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            restart_ceiling: DEFAULT_STOP_TIMEOUT + DEFAULT_RESTART_SLACK,
            settle: DEFAULT_SETTLE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub container_name: String,
    pub probe_endpoint: ProbeEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityChange {
    Changed,
    Unchanged,
    /// The identity before the restart could not be read.
    Unknown,
}

impl IdentityChange {
    pub fn between(prior: Option<&str>, new: &str) -> Self {
        match prior {
            None => IdentityChange::Unknown,
            Some(prior) if prior == new => IdentityChange::Unchanged,
            Some(_) => IdentityChange::Changed,
        }
    }

    /// `None` when the change cannot be determined.
    pub fn changed(self) -> Option<bool> {
        match self {
            IdentityChange::Changed => Some(true),
            IdentityChange::Unchanged => Some(false),
            IdentityChange::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartOutcome {
    pub restart_id: Uuid,
    pub container_name: String,
    pub prior_identifier: Option<String>,
    pub new_identifier: String,
    pub change: IdentityChange,
    pub message: String,
}

impl RestartOutcome {
    pub fn prior_identifier_or_unknown(&self) -> &str {
        self.prior_identifier.as_deref().unwrap_or(UNKNOWN_IDENTIFIER)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("Error restarting container {container}: {source}")]
    Lifecycle {
        container: String,
        #[source]
        source: LifecycleError,
    },
    #[error(
        "Container {container} was restarted, but its connection could not be verified: {source}"
    )]
    VerificationTimeout {
        container: String,
        prior_identifier: Option<String>,
        #[source]
        source: PollError,
    },
    #[error(
        "Docker did not confirm the restart of container {container} within {after:?}, it may still be restarting"
    )]
    RestartUnconfirmed { container: String, after: Duration },
}

impl RestartError {
    /// Whether the container went through a restart before the failure.
    ///
    /// `None` when docker never answered, so the container may or may not
    /// have been restarted.
    pub fn container_restarted(&self) -> Option<bool> {
        match self {
            RestartError::Lifecycle { .. } => Some(false),
            RestartError::VerificationTimeout { .. } => Some(true),
            RestartError::RestartUnconfirmed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Restarting,
    Settling,
    Verifying,
}

/// Restarts a container and waits for its tunnel to report a public IP again.
pub struct RestartOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn ConnectivityProbe>,
    timings: RestartTimings,
    locks: RestartLocks,
}

impl RestartOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn ConnectivityProbe>,
        timings: RestartTimings,
    ) -> Self {
        Self {
            runtime,
            probe,
            timings,
            locks: RestartLocks::new(),
        }
    }

    pub fn is_restarting(&self, container: &str) -> bool {
        self.locks.is_locked(container)
    }

    pub async fn restart_and_verify(
        &self,
        request: &RestartRequest,
    ) -> Result<RestartOutcome, RestartError> {
        let restart_id = Uuid::now_v7();
        let container = request.container_name.as_str();
        let endpoint = &request.probe_endpoint;

        if self.locks.is_locked(container) {
            log::info!("[{restart_id}] Restart of {container} already in progress, waiting...");
        }
        let guard = self.locks.acquire(container).await;
        log::info!("[{restart_id}] Restarting {container}, probing {endpoint}");

        let prior_identifier = match self.probe.probe(endpoint).await {
            Ok(reading) => {
                log::info!("[{restart_id}] Current public IP: {}", reading.identifier);
                Some(reading.identifier)
            }
            Err(e) => {
                log::warn!("[{restart_id}] Could not read current public IP: {e}");
                None
            }
        };

        self.enter(restart_id, container, Phase::Restarting);
        let mut restart = {
            let runtime = Arc::clone(&self.runtime);
            let name = container.to_string();
            let stop_timeout = self.timings.stop_timeout;
            tokio::spawn(async move { runtime.restart(&name, stop_timeout).await })
        };
        match tokio::time::timeout(self.timings.restart_ceiling, &mut restart).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(source))) => {
                return Err(self.lifecycle_failure(restart_id, container, source));
            }
            Ok(Err(e)) => {
                log::error!("[{restart_id}] Restart task for {container} failed: {e}");
                return Err(RestartError::RestartUnconfirmed {
                    container: container.to_string(),
                    after: self.timings.restart_ceiling,
                });
            }
            Err(_) => {
                log::error!(
                    "[{restart_id}] Docker did not confirm the restart of {container} within {:?}",
                    self.timings.restart_ceiling
                );
                // Docker keeps going after we stop waiting, so the lock is
                // held until the daemon answers.
                let late_container = container.to_string();
                tokio::spawn(async move {
                    let _guard = guard;
                    match restart.await {
                        Ok(Ok(())) => {
                            log::info!("[{restart_id}] Late restart of {late_container} completed")
                        }
                        Ok(Err(e)) => {
                            log::warn!("[{restart_id}] Late restart of {late_container} failed: {e}")
                        }
                        Err(e) => {
                            log::warn!("[{restart_id}] Restart task for {late_container} failed: {e}")
                        }
                    }
                });
                return Err(RestartError::RestartUnconfirmed {
                    container: container.to_string(),
                    after: self.timings.restart_ceiling,
                });
            }
        }

        self.enter(restart_id, container, Phase::Settling);
        tokio::time::sleep(self.timings.settle).await;

        self.enter(restart_id, container, Phase::Verifying);
        let poller = Poller::new(self.timings.poll_interval, self.timings.max_wait);
        let reading = poller
            .wait_for_reading(self.probe.as_ref(), endpoint)
            .await
            .map_err(|source| {
                log::error!("[{restart_id}] Error waiting for {container} to reconnect: {source}");
                RestartError::VerificationTimeout {
                    container: container.to_string(),
                    prior_identifier: prior_identifier.clone(),
                    source,
                }
            })?;

        let change = IdentityChange::between(prior_identifier.as_deref(), &reading.identifier);
        let message = match change {
            IdentityChange::Changed => "Container restarted successfully, IP has changed",
            IdentityChange::Unchanged => "Container restarted successfully, IP has not changed",
            IdentityChange::Unknown => "Container restarted successfully, previous IP is unknown",
        };

        let outcome = RestartOutcome {
            restart_id,
            container_name: container.to_string(),
            prior_identifier,
            new_identifier: reading.identifier,
            change,
            message: message.to_string(),
        };
        log::info!(
            "[{restart_id}] Reconnected {container}. Old IP: {} New IP: {}",
            outcome.prior_identifier_or_unknown(),
            outcome.new_identifier
        );
        Ok(outcome)
    }

    fn enter(&self, restart_id: Uuid, container: &str, phase: Phase) {
        match phase {
            Phase::Restarting => log::info!(
                "[{restart_id}] Restarting {container} (waiting up to {:?})",
                self.timings.restart_ceiling
            ),
            Phase::Settling => log::info!(
                "[{restart_id}] Waiting for {container} to start ({:?})...",
                self.timings.settle
            ),
            Phase::Verifying => log::info!(
                "[{restart_id}] Verifying {container} (every {:?}, up to {:?})",
                self.timings.poll_interval,
                self.timings.max_wait
            ),
        }
    }

    fn lifecycle_failure(
        &self,
        restart_id: Uuid,
        container: &str,
        source: LifecycleError,
    ) -> RestartError {
        log::error!("[{restart_id}] Error restarting {container}: {source}");
        RestartError::Lifecycle {
            container: container.to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::probe::{ConnectivityReading, ProbeError};
    use crate::service::snapshot::ContainerSnapshot;
    use async_trait::async_trait;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Plays back a fixed script of probe results, failing once it runs out.
    #[derive(Default)]
    struct ScriptedProbe {
        script: Mutex<VecDeque<Option<&'static str>>>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(script: &[Option<&'static str>]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectivityProbe for ScriptedProbe {
        async fn probe(
            &self,
            endpoint: &ProbeEndpoint,
        ) -> Result<ConnectivityReading, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front().flatten() {
                Some(identifier) => Ok(ConnectivityReading {
                    identifier: identifier.to_string(),
                }),
                None => Err(ProbeError::Decode {
                    endpoint: endpoint.to_string(),
                    reason: "no public ip reported yet".to_string(),
                }),
            }
        }
    }

    /// Always answers with the same identifier.
    struct FixedProbe(&'static str);

    #[async_trait]
    impl ConnectivityProbe for FixedProbe {
        async fn probe(&self, _: &ProbeEndpoint) -> Result<ConnectivityReading, ProbeError> {
            Ok(ConnectivityReading {
                identifier: self.0.to_string(),
            })
        }
    }

    enum RestartBehaviour {
        Succeed,
        NotFound,
        Hang,
    }

    struct FakeRuntime {
        behaviour: RestartBehaviour,
        restart_duration: Duration,
        restarts: AtomicU32,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
    }

    impl FakeRuntime {
        fn new(behaviour: RestartBehaviour) -> Arc<Self> {
            Self::with_duration(behaviour, Duration::from_secs(1))
        }

        fn with_duration(behaviour: RestartBehaviour, restart_duration: Duration) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                restart_duration,
                restarts: AtomicU32::new(0),
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn inspect(&self, name: &str) -> Result<ContainerSnapshot, LifecycleError> {
            Err(LifecycleError::NotFound(name.to_string()))
        }

        async fn restart(&self, name: &str, stop_timeout: Duration) -> Result<(), LifecycleError> {
            assert_eq!(stop_timeout, DEFAULT_STOP_TIMEOUT);
            self.restarts.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let result = match self.behaviour {
                RestartBehaviour::Succeed => {
                    tokio::time::sleep(self.restart_duration).await;
                    Ok(())
                }
                RestartBehaviour::NotFound => Err(LifecycleError::NotFound(name.to_string())),
                RestartBehaviour::Hang => std::future::pending().await,
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn request(container: &str) -> RestartRequest {
        RestartRequest {
            container_name: container.to_string(),
            probe_endpoint: ProbeEndpoint::new("127.0.0.1", 8000),
        }
    }

    fn orchestrator(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> RestartOrchestrator {
        RestartOrchestrator::new(runtime, probe, RestartTimings::default())
    }

    #[quickcheck]
    fn prop_changed_only_when_both_known_and_different(prior: Option<String>, new: String) -> bool {
        let change = IdentityChange::between(prior.as_deref(), &new);
        match &prior {
            None => change.changed().is_none(),
            Some(prior) => change.changed() == Some(*prior != new),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_ip_is_unchanged() {
        let probe = Arc::new(FixedProbe("1.2.3.4"));
        let orchestrator = orchestrator(FakeRuntime::new(RestartBehaviour::Succeed), probe);

        let outcome = orchestrator
            .restart_and_verify(&request("gluetun"))
            .await
            .expect("Restart should succeed");

        assert_eq!(outcome.prior_identifier.as_deref(), Some("1.2.3.4"));
        assert_eq!(outcome.new_identifier, "1.2.3.4");
        assert_eq!(outcome.change, IdentityChange::Unchanged);
        assert_eq!(outcome.change.changed(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_ip_is_changed() {
        let probe = ScriptedProbe::new(&[Some("1.2.3.4"), None, Some("5.6.7.8")]);
        let orchestrator = orchestrator(FakeRuntime::new(RestartBehaviour::Succeed), probe.clone());

        let outcome = orchestrator.restart_and_verify(&request("gluetun")).await.unwrap();

        assert_eq!(outcome.new_identifier, "5.6.7.8");
        assert_eq!(outcome.change, IdentityChange::Changed);
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_prior_is_indeterminate() {
        let probe = ScriptedProbe::new(&[None, Some("5.6.7.8")]);
        let orchestrator = orchestrator(FakeRuntime::new(RestartBehaviour::Succeed), probe);

        let outcome = orchestrator.restart_and_verify(&request("gluetun")).await.unwrap();

        assert_eq!(outcome.prior_identifier, None);
        assert_eq!(outcome.prior_identifier_or_unknown(), UNKNOWN_IDENTIFIER);
        assert_eq!(outcome.new_identifier, "5.6.7.8");
        assert_eq!(outcome.change, IdentityChange::Unknown);
        assert_ne!(outcome.change.changed(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settles_before_first_verification_probe() {
        let probe = ScriptedProbe::new(&[Some("1.2.3.4"), Some("5.6.7.8")]);
        let orchestrator = orchestrator(FakeRuntime::new(RestartBehaviour::Succeed), probe);

        let start = tokio::time::Instant::now();
        orchestrator.restart_and_verify(&request("gluetun")).await.unwrap();

        // restart (1s) + settle (10s) + one poll interval (5s)
        assert_eq!(start.elapsed(), Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_failure_short_circuits() {
        let probe = ScriptedProbe::new(&[Some("1.2.3.4"), Some("5.6.7.8")]);
        let runtime = FakeRuntime::new(RestartBehaviour::NotFound);
        let orchestrator = orchestrator(runtime.clone(), probe.clone());

        let err = orchestrator
            .restart_and_verify(&request("gluetun"))
            .await
            .expect_err("Restart should fail");

        assert!(matches!(
            err,
            RestartError::Lifecycle {
                source: LifecycleError::NotFound(_),
                ..
            }
        ));
        assert_eq!(err.container_restarted(), Some(false));
        // Only the capture of the prior IP, nothing after the failed restart
        assert_eq!(probe.calls(), 1);
        assert_eq!(runtime.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_restart_hits_ceiling() {
        let probe = ScriptedProbe::new(&[Some("1.2.3.4")]);
        let orchestrator = orchestrator(FakeRuntime::new(RestartBehaviour::Hang), probe.clone());

        let start = tokio::time::Instant::now();
        let err = orchestrator
            .restart_and_verify(&request("gluetun"))
            .await
            .unwrap_err();

        match &err {
            RestartError::RestartUnconfirmed { container, after } => {
                assert_eq!(container, "gluetun");
                assert_eq!(*after, RestartTimings::default().restart_ceiling);
            }
            other => panic!("Expected unconfirmed restart, got {:?}", other),
        }
        assert_eq!(err.container_restarted(), None);
        assert_eq!(start.elapsed(), RestartTimings::default().restart_ceiling);
        assert_eq!(probe.calls(), 1);
        // Docker may still be restarting, so a second restart must keep waiting
        assert!(orchestrator.is_restarting("gluetun"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_timeout_reports_restart() {
        let probe = ScriptedProbe::new(&[Some("1.2.3.4")]);
        let runtime = FakeRuntime::new(RestartBehaviour::Succeed);
        let orchestrator = orchestrator(runtime.clone(), probe);

        let err = orchestrator
            .restart_and_verify(&request("gluetun"))
            .await
            .unwrap_err();

        match &err {
            RestartError::VerificationTimeout {
                container,
                prior_identifier,
                source: PollError::Timeout { elapsed, .. },
            } => {
                assert_eq!(container, "gluetun");
                assert_eq!(prior_identifier.as_deref(), Some("1.2.3.4"));
                assert!(*elapsed >= DEFAULT_MAX_WAIT);
            }
            other => panic!("Expected verification timeout, got {:?}", other),
        }
        assert_eq!(err.container_restarted(), Some(true));
        assert!(err.to_string().contains("was restarted"));
        assert_eq!(runtime.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_container_restarts_serialize() {
        let runtime = FakeRuntime::with_duration(RestartBehaviour::Succeed, Duration::from_secs(5));
        let orchestrator = orchestrator(runtime.clone(), Arc::new(FixedProbe("1.2.3.4")));

        let (first, second) = (request("gluetun"), request("gluetun"));
        let (a, b) = tokio::join!(
            orchestrator.restart_and_verify(&first),
            orchestrator.restart_and_verify(&second),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(runtime.restarts.load(Ordering::SeqCst), 2);
        assert_eq!(runtime.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(!orchestrator.is_restarting("gluetun"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_containers_restart_concurrently() {
        let runtime = FakeRuntime::with_duration(RestartBehaviour::Succeed, Duration::from_secs(5));
        let orchestrator = orchestrator(runtime.clone(), Arc::new(FixedProbe("1.2.3.4")));

        let (first, second) = (request("gluetun-1"), request("gluetun-2"));
        let (a, b) = tokio::join!(
            orchestrator.restart_and_verify(&first),
            orchestrator.restart_and_verify(&second),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(runtime.max_in_flight.load(Ordering::SeqCst), 2);
    }
}
