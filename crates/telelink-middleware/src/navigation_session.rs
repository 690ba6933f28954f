//! [`NavigationSession`] – couples a [`NavigationClient`] with a
//! [`NavigationTracker`] so arrivals are detected where poses are consumed.
//!
//! | Call | Target afterwards |
//! |---|---|
//! | [`go_to`](NavigationSession::go_to) accepted | the new target |
//! | [`go_to`](NavigationSession::go_to) refused | unchanged |
//! | [`cancel`](NavigationSession::cancel) | none, whatever the request returned |
//! | pose within the arrival threshold | none; [`EventPayload::Arrived`] published |
//! | [`stop`](NavigationSession::stop) | none; pose forgotten as well |
//! | client drops to `disconnected` or `error` | none |
//!
//! An arrival while the registry is in `DELIVERY` fires
//! `complete_delivery`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use telelink_kernel::{NavigationTracker, PoseOutcome};
use telelink_types::{
    ConnectionStatus, EventPayload, LinkError, ModeEvent, NavTarget, OperatingMode, Pose,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hub::{Topic, TopicReceiver};
use crate::navigation_client::{NavigationClient, Strategy};
use crate::registry::ConnectionRegistry;

const SOURCE: &str = "telelink-middleware::navigation_session";

pub struct NavigationSession {
    client: NavigationClient,
    tracker: Arc<Mutex<NavigationTracker>>,
    registry: Arc<ConnectionRegistry>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NavigationSession {
    pub fn new(client: NavigationClient, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            client,
            tracker: Arc::new(Mutex::new(NavigationTracker::new())),
            registry,
            listener: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &NavigationClient {
        &self.client
    }

    pub fn status(&self) -> ConnectionStatus {
        self.client.status()
    }

    pub fn pose(&self) -> Option<Pose> {
        lock(&self.tracker).pose().copied()
    }

    pub fn target(&self) -> Option<NavTarget> {
        lock(&self.tracker).target().cloned()
    }

    pub fn is_navigating(&self) -> bool {
        lock(&self.tracker).is_navigating()
    }

    /// Connect the client and start tracking its poses.
    pub async fn start(&self) -> Result<Strategy, LinkError> {
        // Subscribe first so the pose delivered during connect is seen.
        let poses = self.registry.subscribe(Topic::Navigation);
        let strategy = self.client.connect().await?;

        let mut listener = lock(&self.listener);
        if listener.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(strategy);
        }
        *listener = Some(tokio::spawn(track(
            poses,
            self.client.watch_status(),
            Arc::clone(&self.tracker),
            Arc::clone(&self.registry),
        )));
        Ok(strategy)
    }

    /// Request navigation to `target`; it becomes the tracked target only
    /// once the request is accepted.
    pub async fn go_to(&self, target: NavTarget) -> Result<(), LinkError> {
        self.client.go_to(&target).await?;
        lock(&self.tracker).begin(target);
        Ok(())
    }

    /// Request cancellation. The local target is cleared even when the
    /// request fails.
    pub async fn cancel(&self) -> Result<(), LinkError> {
        let result = self.client.cancel_navigation().await;
        if let Some(target) = lock(&self.tracker).clear() {
            info!(x = target.x, y = target.y, "navigation target cleared");
        }
        result
    }

    /// Stop tracking and disconnect the client.
    pub fn stop(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        self.client.disconnect();
        lock(&self.tracker).reset();
    }
}

impl Drop for NavigationSession {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
    }
}

async fn track(
    mut poses: TopicReceiver,
    mut status: watch::Receiver<ConnectionStatus>,
    tracker: Arc<Mutex<NavigationTracker>>,
    registry: Arc<ConnectionRegistry>,
) {
    loop {
        tokio::select! {
            event = poses.next() => {
                let Some(event) = event else { break };
                let EventPayload::Pose(pose) = event.payload else {
                    continue;
                };
                let outcome = lock(&tracker).on_pose(pose);
                match outcome {
                    PoseOutcome::Arrived(target) => on_arrival(&registry, target),
                    PoseOutcome::Stale => debug!(timestamp = pose.timestamp, "stale pose ignored"),
                    PoseOutcome::Updated => {}
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                if matches!(current, ConnectionStatus::Disconnected | ConnectionStatus::Error)
                    && let Some(target) = lock(&tracker).clear()
                {
                    warn!(x = target.x, y = target.y, status = %current, "navigation link lost; target dropped");
                }
            }
        }
    }
}

fn on_arrival(registry: &ConnectionRegistry, target: NavTarget) {
    info!(x = target.x, y = target.y, label = ?target.label, "arrived at navigation target");
    registry.hub().emit(SOURCE, EventPayload::Arrived(target));
    if registry.mode() == OperatingMode::Delivery
        && let Err(rejected) = registry.dispatch(ModeEvent::CompleteDelivery)
    {
        warn!(mode = %rejected.mode, "could not complete delivery on arrival");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::stream::BoxStream;
    use serde_json::{Value, json};

    use super::*;
    use crate::config::{LinkConfig, NavigationConfig};
    use crate::hub::EventHub;
    use crate::navigation_client::NavigationBackend;

    /// Poll-only backend replaying a fixed pose script.
    struct ScriptedPoses {
        poses: Mutex<VecDeque<Value>>,
        accept_goals: bool,
    }

    #[async_trait]
    impl NavigationBackend for ScriptedPoses {
        async fn open_push(
            &self,
        ) -> Result<BoxStream<'static, Result<String, LinkError>>, LinkError> {
            Err(LinkError::Connection("no push".into()))
        }

        async fn fetch_pose(&self) -> Result<Value, LinkError> {
            lock(&self.poses)
                .pop_front()
                .ok_or_else(|| LinkError::Connection("offline".into()))
        }

        async fn start_navigation(&self, _goal: &Value) -> Result<(), LinkError> {
            if self.accept_goals {
                Ok(())
            } else {
                Err(LinkError::Http("409".into()))
            }
        }

        async fn cancel_navigation(&self) -> Result<(), LinkError> {
            Err(LinkError::Http("500".into()))
        }

        async fn fetch_path(&self) -> Result<Value, LinkError> {
            Ok(json!([]))
        }

        async fn fetch_map(&self) -> Result<Value, LinkError> {
            Err(LinkError::Http("404".into()))
        }
    }

    fn session(poses: &[(f64, i64)], accept_goals: bool) -> (NavigationSession, Arc<ConnectionRegistry>) {
        let hub = EventHub::default();
        let registry = Arc::new(ConnectionRegistry::new(LinkConfig::default(), hub.clone()));
        let backend = ScriptedPoses {
            poses: Mutex::new(
                poses
                    .iter()
                    .map(|(x, ts)| json!({ "x": x, "y": 0.0, "theta": 0.0, "timestamp": ts }))
                    .collect(),
            ),
            accept_goals,
        };
        let client = NavigationClient::new(NavigationConfig::default(), Arc::new(backend), hub);
        (NavigationSession::new(client, Arc::clone(&registry)), registry)
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_clears_target_and_completes_delivery() -> Result<(), Box<dyn std::error::Error>>
    {
        let (session, registry) = session(&[(5.0, 1), (3.0, 2), (0.1, 3)], true);
        let mut nav = registry.subscribe(Topic::Navigation);
        registry.dispatch(ModeEvent::StartDelivery)?;

        assert_eq!(session.start().await?, Strategy::Poll);
        session.go_to(NavTarget::new(0.0, 0.0).with_label("A")).await?;
        assert!(session.is_navigating());

        let arrived = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(event) = nav.recv().await
                    && let EventPayload::Arrived(target) = event.payload
                {
                    return target;
                }
            }
        })
        .await?;
        assert_eq!(arrived.label.as_deref(), Some("A"));

        tokio::task::yield_now().await;
        assert!(!session.is_navigating());
        assert_eq!(session.pose().map(|p| p.x), Some(0.1));
        assert_eq!(registry.mode(), OperatingMode::Idle);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn pose_outside_threshold_keeps_navigating() -> Result<(), Box<dyn std::error::Error>> {
        let (session, _registry) = session(&[(5.0, 1), (0.4, 2)], true);
        session.start().await?;
        session.go_to(NavTarget::new(0.0, 0.0)).await?;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(session.pose().map(|p| p.x), Some(0.4));
        assert!(session.is_navigating());
        Ok(())
    }

    #[tokio::test]
    async fn refused_goal_sets_no_target() -> Result<(), Box<dyn std::error::Error>> {
        let (session, _registry) = session(&[(5.0, 1)], false);
        session.start().await?;
        assert!(session.go_to(NavTarget::new(1.0, 1.0)).await.is_err());
        assert!(!session.is_navigating());
        Ok(())
    }

    #[tokio::test]
    async fn cancel_clears_target_even_when_request_fails() -> Result<(), Box<dyn std::error::Error>>
    {
        let (session, _registry) = session(&[(5.0, 1)], true);
        session.start().await?;
        session.go_to(NavTarget::new(1.0, 1.0)).await?;

        assert!(session.cancel().await.is_err());
        assert!(!session.is_navigating());
        assert_eq!(session.target(), None);
        Ok(())
    }

    #[tokio::test]
    async fn link_loss_drops_the_target() -> Result<(), Box<dyn std::error::Error>> {
        let (session, _registry) = session(&[(5.0, 1)], true);
        session.start().await?;
        session.go_to(NavTarget::new(1.0, 1.0)).await?;
        assert!(session.is_navigating());

        session.client().disconnect();
        tokio::time::timeout(Duration::from_secs(1), async {
            while session.is_navigating() {
                tokio::task::yield_now().await;
            }
        })
        .await?;
        assert_eq!(session.target(), None);
        Ok(())
    }

    #[tokio::test]
    async fn stop_forgets_pose_and_disconnects() -> Result<(), Box<dyn std::error::Error>> {
        let (session, _registry) = session(&[(5.0, 1)], true);
        session.start().await?;
        tokio::task::yield_now().await;
        session.go_to(NavTarget::new(1.0, 1.0)).await?;

        session.stop();
        assert_eq!(session.pose(), None);
        assert!(!session.is_navigating());
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        Ok(())
    }
}
