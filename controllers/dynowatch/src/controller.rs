//! Main controller implementation.
//!
//! The `Controller` registers one watch loop per configured watch, each feeding its own
//! [`Reconciler`], and supervises the loops until shutdown.
//!
//! Setup is fail-fast: the first watch that cannot be registered aborts the loops already
//! started and fails startup.

use crate::config::WatchDescriptor;
use crate::engine::{ObjectFetcher, ReconcileHandler, WatchEngine, WatchLoop};
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use cloudevents_client::EventSender;
use futures::FutureExt;
use futures::future::select_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Supervisor of the running watch loops.
pub struct Controller {
    loops: Vec<(String, WatchLoop)>,
}

impl Controller {
    /// Registers every watch with `engine`, in order.
    pub async fn setup<E>(
        engine: &E,
        watches: &[WatchDescriptor],
        sender: Arc<dyn EventSender>,
        source: &str,
        target: &str,
    ) -> Result<Self, ControllerError>
    where
        E: WatchEngine,
    {
        let mut loops: Vec<(String, WatchLoop)> = Vec::with_capacity(watches.len());

        for descriptor in watches {
            info!(
                watch = %descriptor.name,
                group = %descriptor.group,
                kind = %descriptor.kind,
                "Setup controller"
            );

            let bind = {
                let descriptor = descriptor.clone();
                let sender = Arc::clone(&sender);
                let source = source.to_string();
                let target = target.to_string();
                move |fetcher: Arc<dyn ObjectFetcher>| {
                    Arc::new(Reconciler::new(&descriptor, fetcher, sender, source, target))
                        as Arc<dyn ReconcileHandler>
                }
            };

            match engine.register(descriptor, bind).await {
                Ok(handle) => loops.push((descriptor.name.clone(), handle)),
                Err(e) => {
                    error!(watch = %descriptor.name, "Unable to create controller: {}", e);
                    for (_, handle) in &loops {
                        handle.abort();
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self { loops })
    }

    /// Names of the registered watches, in registration order.
    pub fn watch_names(&self) -> Vec<&str> {
        self.loops.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Waits for the loops to stop.
    ///
    /// Returns `Ok` once every loop has stopped after `shutdown` was canceled. A loop that fails,
    /// panics or stops on its own before shutdown is returned as an error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        if self.loops.is_empty() {
            info!("No watches configured, waiting for shutdown");
            shutdown.cancelled().await;
            return Ok(());
        }

        let mut pending: Vec<_> = self
            .loops
            .into_iter()
            .map(|(name, handle)| handle.map(move |result| (name, result)).boxed())
            .collect();

        while !pending.is_empty() {
            let ((name, result), _, rest) = select_all(pending).await;
            pending = rest;

            match result {
                Ok(Ok(())) if shutdown.is_cancelled() => {
                    info!(watch = %name, "Watch stopped");
                }
                Ok(Ok(())) => {
                    error!(watch = %name, "Watch stopped unexpectedly");
                    return Err(ControllerError::Watch(format!("watch {name} stopped unexpectedly")));
                }
                Ok(Err(e)) => {
                    error!(watch = %name, "Watch error: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!(watch = %name, "Watch panicked: {}", e);
                    return Err(ControllerError::Watch(format!("watch {name} panicked: {e}")));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReconcileRequest;
    use crate::envelope::{EVENT_TYPE, NotificationData};
    use crate::test_utils::{FakeCluster, FakeWatchEngine, jobs_descriptor};
    use cloudevents_client::MockEventSender;
    use std::time::Duration;

    const SOURCE: &str = "https://github.com/kubearchive/dynowatch";
    const TARGET: &str = "http://receiver.test";

    fn create_test_engine(cluster: &FakeCluster) -> FakeWatchEngine {
        FakeWatchEngine::new(cluster.clone())
            .with_kind("batch", "v1", "Job")
            .with_kind("apps", "v1", "Deployment")
            .with_kind("", "v1", "Pod")
    }

    async fn setup(
        engine: &FakeWatchEngine,
        watches: &[WatchDescriptor],
        sender: &MockEventSender,
    ) -> Result<Controller, ControllerError> {
        Controller::setup(engine, watches, Arc::new(sender.clone()), SOURCE, TARGET).await
    }

    #[tokio::test]
    async fn test_setup_registers_watches_in_order() {
        let cluster = FakeCluster::new();
        let engine = create_test_engine(&cluster);
        let watches = vec![
            WatchDescriptor::new("deployments", "apps", "v1", "Deployment"),
            jobs_descriptor(),
            WatchDescriptor::new("pods", "", "v1", "Pod"),
        ];

        let controller = setup(&engine, &watches, &MockEventSender::new())
            .await
            .expect("setup should succeed");

        assert_eq!(controller.watch_names(), vec!["deployments", "jobs", "pods"]);
        assert_eq!(engine.attempts(), vec!["deployments", "jobs", "pods"]);
    }

    #[tokio::test]
    async fn test_setup_fails_fast_on_unknown_kind() {
        let cluster = FakeCluster::new();
        let engine = create_test_engine(&cluster);
        let watches = vec![
            jobs_descriptor(),
            WatchDescriptor::new("widgets", "example.com", "v1", "Widget"),
            WatchDescriptor::new("pods", "", "v1", "Pod"),
        ];

        let result = setup(&engine, &watches, &MockEventSender::new()).await;

        assert!(matches!(result, Err(ControllerError::Registration(_))));
        assert_eq!(engine.attempts(), vec!["jobs", "widgets"], "later watches are not attempted");
    }

    #[tokio::test]
    async fn test_duplicate_watches_run_independently() {
        let cluster = FakeCluster::new();
        cluster.insert("default", "created-job");
        let engine = create_test_engine(&cluster);
        let sender = MockEventSender::new();
        let watches = vec![jobs_descriptor(), jobs_descriptor()];

        let controller = setup(&engine, &watches, &sender).await.expect("setup should succeed");
        assert_eq!(controller.watch_names(), vec!["jobs", "jobs"]);
        assert_eq!(engine.loop_count("jobs"), 2);

        let results = engine
            .trigger("jobs", &ReconcileRequest::new("default", "created-job"))
            .await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(sender.attempt_count(), 2);
    }

    #[tokio::test]
    async fn test_created_job_is_notified() {
        let cluster = FakeCluster::new();
        cluster.insert("default", "created-job");
        let engine = create_test_engine(&cluster);
        let sender = MockEventSender::new();
        let _controller = setup(&engine, &[jobs_descriptor()], &sender)
            .await
            .expect("setup should succeed");

        let results = engine
            .trigger("jobs", &ReconcileRequest::new("default", "created-job"))
            .await;

        assert!(results[0].is_ok());
        let events = sender.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_TYPE);
        assert_eq!(events[0].source, SOURCE);
        let data: NotificationData = events[0].json_data().expect("decode").expect("data");
        assert_eq!(
            data,
            NotificationData {
                kind: "Job".to_string(),
                api_version: "batch/v1".to_string(),
                namespace: "default".to_string(),
                name: "created-job".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_deleted_job_is_notified() {
        let cluster = FakeCluster::new();
        cluster.insert("default", "deleted-job");
        let engine = create_test_engine(&cluster);
        let sender = MockEventSender::new();
        let _controller = setup(&engine, &[jobs_descriptor()], &sender)
            .await
            .expect("setup should succeed");

        cluster.remove("default", "deleted-job");
        let results = engine
            .trigger("jobs", &ReconcileRequest::new("default", "deleted-job"))
            .await;

        assert!(results[0].is_ok());
        let data: NotificationData = sender.events()[0].json_data().expect("decode").expect("data");
        assert_eq!(data.name, "deleted-job");
        assert_eq!(data.namespace, "default");
    }

    #[tokio::test]
    async fn test_unreachable_receiver_fails_the_invocation() {
        let cluster = FakeCluster::new();
        cluster.insert("default", "created-job");
        let engine = create_test_engine(&cluster);
        let sender = MockEventSender::new();
        sender.fail_with("connection refused");
        let _controller = setup(&engine, &[jobs_descriptor()], &sender)
            .await
            .expect("setup should succeed");

        let results = engine
            .trigger("jobs", &ReconcileRequest::new("default", "created-job"))
            .await;

        assert!(matches!(results[0], Err(ControllerError::Undelivered(_))));
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let engine = create_test_engine(&FakeCluster::new());
        let controller = setup(&engine, &[jobs_descriptor()], &MockEventSender::new())
            .await
            .expect("setup should succeed");
        let shutdown = CancellationToken::new();

        shutdown.cancel();
        engine.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), controller.run(shutdown))
            .await
            .expect("run should return");

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_reports_loop_stopping_early() {
        let engine = create_test_engine(&FakeCluster::new());
        let controller = setup(&engine, &[jobs_descriptor()], &MockEventSender::new())
            .await
            .expect("setup should succeed");

        engine.stop();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            controller.run(CancellationToken::new()),
        )
        .await
        .expect("run should return");

        assert!(matches!(result, Err(ControllerError::Watch(_))));
    }

    #[tokio::test]
    async fn test_run_without_watches_waits_for_shutdown() {
        let engine = create_test_engine(&FakeCluster::new());
        let controller = setup(&engine, &[], &MockEventSender::new())
            .await
            .expect("setup should succeed");
        let shutdown = CancellationToken::new();

        let run = tokio::spawn(controller.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!run.is_finished());

        shutdown.cancel();
        run.await.expect("run task").expect("run should succeed");
    }
}
