//! [`NavigationClient`] – pose and obstacle feed from the navigation (SLAM)
//! subsystem, plus goal and cancel requests.
//!
//! # Strategies
//!
//! | Strategy | When | Delivery |
//! |---|---|---|
//! | [`Strategy::Push`] | the push channel opens within `push_timeout` | every frame as it arrives |
//! | [`Strategy::Poll`] | push failed but `GET /api/pose` answered within `probe_timeout` | one round-trip per `poll_interval`; failed round-trips are skipped |
//!
//! Falling back from push to poll is not an error. Only when both fail does
//! the status become `Error`.
//!
//! Arrival detection is not done here; see
//! [`NavigationSession`][crate::navigation_session::NavigationSession].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;
use telelink_kernel::{validate_nav_frame, validate_outbound, validate_pose};
use telelink_types::{
    ConnectionStatus, EventPayload, LinkError, LinkKind, NavTarget, OccupancyMap, OutboundCommand,
    PathPoint, Pose, ValidationError,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::NavigationConfig;
use crate::connector::authorized_request;
use crate::hub::EventHub;

const SOURCE: &str = "telelink-middleware::navigation";

// ────────────────────────────────────────────────────────────────────────────
// Backend seam
// ────────────────────────────────────────────────────────────────────────────

/// Raw access to the navigation subsystem. Implementations return JSON
/// untouched; validation happens in [`NavigationClient`].
#[async_trait]
pub trait NavigationBackend: Send + Sync {
    /// Open the push channel. The stream yields one text frame per message
    /// and ends when the channel closes.
    async fn open_push(&self) -> Result<BoxStream<'static, Result<String, LinkError>>, LinkError>;

    /// `GET /api/pose`
    async fn fetch_pose(&self) -> Result<Value, LinkError>;

    /// `POST /api/navigation/goal`
    async fn start_navigation(&self, goal: &Value) -> Result<(), LinkError>;

    /// `POST /api/navigation/cancel`
    async fn cancel_navigation(&self) -> Result<(), LinkError>;

    /// `GET /api/navigation/path`
    async fn fetch_path(&self) -> Result<Value, LinkError>;

    /// `GET /api/map`
    async fn fetch_map(&self) -> Result<Value, LinkError>;
}

/// [`NavigationBackend`] over `reqwest` and a `tokio-tungstenite` push
/// channel.
pub struct HttpNavigationBackend {
    base_url: String,
    push_url: String,
    auth_token: Option<String>,
    http: reqwest::Client,
}

impl HttpNavigationBackend {
    pub fn new(config: &NavigationConfig) -> Result<Self, LinkError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LinkError::Http(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            push_url: config.push_url(),
            auth_token: config.auth_token.clone(),
            http,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value, LinkError> {
        self.authorize(self.http.get(self.endpoint(path)))
            .send()
            .await
            .map_err(http_error)?
            .error_for_status()
            .map_err(http_error)?
            .json()
            .await
            .map_err(http_error)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<(), LinkError> {
        self.authorize(self.http.post(self.endpoint(path)))
            .json(body)
            .send()
            .await
            .map_err(http_error)?
            .error_for_status()
            .map_err(http_error)?;
        Ok(())
    }
}

impl std::fmt::Debug for HttpNavigationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNavigationBackend")
            .field("base_url", &self.base_url)
            .field("push_url", &self.push_url)
            .finish_non_exhaustive()
    }
}

fn http_error(e: reqwest::Error) -> LinkError {
    if e.is_connect() || e.is_timeout() {
        LinkError::Connection(e.to_string())
    } else {
        LinkError::Http(e.to_string())
    }
}

#[async_trait]
impl NavigationBackend for HttpNavigationBackend {
    async fn open_push(&self) -> Result<BoxStream<'static, Result<String, LinkError>>, LinkError> {
        let request = authorized_request(&self.push_url, self.auth_token.as_deref())?;
        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| LinkError::Connection(format!("{}: {e}", self.push_url)))?;

        let frames = stream::unfold(ws, |mut ws| async move {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Some((Ok(text.as_str().to_owned()), ws));
                    }
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Some((Err(LinkError::Transport(e.to_string())), ws)),
                }
            }
        });
        Ok(frames.boxed())
    }

    async fn fetch_pose(&self) -> Result<Value, LinkError> {
        self.get_json("/api/pose").await
    }

    async fn start_navigation(&self, goal: &Value) -> Result<(), LinkError> {
        self.post("/api/navigation/goal", goal).await
    }

    async fn cancel_navigation(&self) -> Result<(), LinkError> {
        self.post("/api/navigation/cancel", &Value::Object(Default::default()))
            .await
    }

    async fn fetch_path(&self) -> Result<Value, LinkError> {
        self.get_json("/api/navigation/path").await
    }

    async fn fetch_map(&self) -> Result<Value, LinkError> {
        self.get_json("/api/map").await
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Client
// ────────────────────────────────────────────────────────────────────────────

/// How pose updates are currently obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Push,
    Poll,
}

#[derive(Default)]
struct NavState {
    strategy: Option<Strategy>,
    feed: Option<JoinHandle<()>>,
}

struct Inner {
    config: NavigationConfig,
    backend: Arc<dyn NavigationBackend>,
    hub: EventHub,
    status: watch::Sender<ConnectionStatus>,
    state: Mutex<NavState>,
}

pub struct NavigationClient {
    inner: Arc<Inner>,
}

impl NavigationClient {
    pub fn new(config: NavigationConfig, backend: Arc<dyn NavigationBackend>, hub: EventHub) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                hub,
                status,
                state: Mutex::new(NavState::default()),
            }),
        }
    }

    /// Client over [`HttpNavigationBackend`].
    pub fn http(config: NavigationConfig, hub: EventHub) -> Result<Self, LinkError> {
        let backend = HttpNavigationBackend::new(&config)?;
        Ok(Self::new(config, Arc::new(backend), hub))
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn strategy(&self) -> Option<Strategy> {
        self.inner.lock().strategy
    }

    /// Start the pose feed: push channel first, polling as fallback.
    ///
    /// Returns the strategy in use. A client whose feed is already running
    /// returns its current strategy without reconnecting.
    pub async fn connect(&self) -> Result<Strategy, LinkError> {
        let inner = &self.inner;
        {
            let state = inner.lock();
            if let Some(strategy) = state.strategy
                && state.feed.as_ref().is_some_and(|h| !h.is_finished())
            {
                debug!(?strategy, "navigation connect ignored; feed already running");
                return Ok(strategy);
            }
        }
        inner.set_status(ConnectionStatus::Connecting);

        match tokio::time::timeout(inner.config.push_timeout, inner.backend.open_push()).await {
            Ok(Ok(frames)) => {
                inner.start_feed(Strategy::Push, Arc::clone(inner).run_push(frames));
                info!("navigation push channel open");
                return Ok(Strategy::Push);
            }
            Ok(Err(e)) => info!(error = %e, "navigation push unavailable; probing"),
            Err(_) => info!(
                timeout_ms = inner.config.push_timeout.as_millis() as u64,
                "navigation push timed out; probing"
            ),
        }

        let probe = tokio::time::timeout(inner.config.probe_timeout, inner.backend.fetch_pose()).await;
        let raw = match probe {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(error = %e, "navigation subsystem unreachable");
                inner.set_status(ConnectionStatus::Error);
                return Err(e);
            }
            Err(_) => {
                let ms = inner.config.probe_timeout.as_millis() as u64;
                warn!(timeout_ms = ms, "navigation probe timed out");
                inner.set_status(ConnectionStatus::Error);
                return Err(LinkError::Timeout(ms));
            }
        };

        inner.start_feed(Strategy::Poll, Arc::clone(inner).run_poll());
        inner.deliver_pose(&raw);
        info!(
            interval_ms = inner.config.poll_interval.as_millis() as u64,
            "navigation polling started"
        );
        Ok(Strategy::Poll)
    }

    /// Ask the navigation subsystem to drive to `target`.
    ///
    /// `Ok` means the request was accepted, not that the robot arrived.
    pub async fn go_to(&self, target: &NavTarget) -> Result<(), LinkError> {
        let serialized = validate_outbound(&OutboundCommand::Navigate {
            x: target.x,
            y: target.y,
            theta: None,
            label: target.label.clone(),
        })?;
        self.inner
            .backend
            .start_navigation(&serialized.envelope.data)
            .await
            .inspect(|_| info!(x = target.x, y = target.y, "navigation goal accepted"))
            .inspect_err(|e| warn!(error = %e, "navigation goal rejected"))
    }

    pub async fn cancel_navigation(&self) -> Result<(), LinkError> {
        self.inner
            .backend
            .cancel_navigation()
            .await
            .inspect_err(|e| warn!(error = %e, "navigation cancel failed"))
    }

    /// One-off pose round-trip, independent of the feed.
    pub async fn current_pose(&self) -> Result<Pose, LinkError> {
        let raw = self.inner.backend.fetch_pose().await?;
        Ok(validate_pose(&raw, now_ms())?)
    }

    /// Planned path of the active navigation. Accepts a bare array or a
    /// `{"path": [...]}` wrapper.
    pub async fn current_path(&self) -> Result<Vec<PathPoint>, LinkError> {
        let mut raw = self.inner.backend.fetch_path().await?;
        if let Some(path) = raw.get_mut("path") {
            raw = path.take();
        }
        serde_json::from_value(raw)
            .map_err(|e| ValidationError::Malformed(format!("path: {e}")).into())
    }

    pub async fn map(&self) -> Result<OccupancyMap, LinkError> {
        let raw = self.inner.backend.fetch_map().await?;
        serde_json::from_value(raw).map_err(|e| ValidationError::Malformed(format!("map: {e}")).into())
    }

    /// Stop polling, close the push channel, status `Disconnected`.
    pub fn disconnect(&self) {
        let feed = {
            let mut state = self.inner.lock();
            state.strategy = None;
            state.feed.take()
        };
        if let Some(feed) = feed {
            feed.abort();
        }
        self.inner.set_status(ConnectionStatus::Disconnected);
        info!("navigation disconnected by request");
    }
}

impl Drop for NavigationClient {
    fn drop(&mut self) {
        if let Some(feed) = self.inner.lock().feed.take() {
            feed.abort();
        }
    }
}

impl std::fmt::Debug for NavigationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavigationClient")
            .field("base_url", &self.inner.config.base_url)
            .field("status", &self.status())
            .field("strategy", &self.strategy())
            .finish()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, NavState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            self.hub.emit(
                SOURCE,
                EventPayload::Status {
                    link: LinkKind::Navigation,
                    status,
                },
            );
        }
    }

    /// Install the feed task. Status turns `Connected` before the task can
    /// run, so a feed that ends at once still leaves a consistent state.
    fn start_feed<F>(&self, strategy: Strategy, feed: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.lock();
        state.strategy = Some(strategy);
        self.set_status(ConnectionStatus::Connected);
        if let Some(stale) = state.feed.replace(tokio::spawn(feed)) {
            stale.abort();
        }
    }

    fn deliver_pose(&self, raw: &Value) {
        match validate_pose(raw, now_ms()) {
            Ok(pose) => {
                self.hub.emit(SOURCE, EventPayload::Pose(pose));
            }
            Err(e) => warn!(error = %e, "discarding pose"),
        }
    }

    fn handle_frame(&self, text: &str) {
        let frame = serde_json::from_str::<Value>(text)
            .map_err(|e| ValidationError::Malformed(e.to_string()))
            .and_then(|raw| validate_nav_frame(&raw, now_ms()));
        match frame {
            Ok(frame) => {
                if let Some(pose) = frame.pose {
                    self.hub.emit(SOURCE, EventPayload::Pose(pose));
                }
                if !frame.obstacles.is_empty() {
                    self.hub.emit(SOURCE, EventPayload::Obstacles(frame.obstacles));
                }
            }
            Err(e) => warn!(error = %e, "discarding navigation frame"),
        }
    }

    async fn run_push(self: Arc<Self>, mut frames: BoxStream<'static, Result<String, LinkError>>) {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(text) => self.handle_frame(&text),
                Err(e) => {
                    warn!(error = %e, "navigation push channel failed");
                    break;
                }
            }
        }
        {
            let mut state = self.lock();
            state.strategy = None;
            state.feed = None;
        }
        self.set_status(ConnectionStatus::Disconnected);
        info!("navigation push channel closed");
    }

    async fn run_poll(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.poll_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick is immediate; the probe already delivered that pose.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.backend.fetch_pose().await {
                Ok(raw) => self.deliver_pose(&raw),
                Err(e) => debug!(error = %e, "pose poll failed; skipping"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::hub::Topic;

    enum Push {
        /// Never answers; exercises the push timeout.
        Hang,
        Refuse,
        Frames(Mutex<Option<mpsc::UnboundedReceiver<String>>>),
    }

    struct MockBackend {
        push: Push,
        poses: Mutex<VecDeque<Result<Value, LinkError>>>,
        pose_calls: AtomicUsize,
        goals: Mutex<Vec<Value>>,
        cancel_fails: bool,
        path: Value,
    }

    impl MockBackend {
        fn new(push: Push, poses: Vec<Result<Value, LinkError>>) -> Self {
            Self {
                push,
                poses: Mutex::new(poses.into()),
                pose_calls: AtomicUsize::new(0),
                goals: Mutex::default(),
                cancel_fails: false,
                path: json!([]),
            }
        }
    }

    #[async_trait]
    impl NavigationBackend for MockBackend {
        async fn open_push(
            &self,
        ) -> Result<BoxStream<'static, Result<String, LinkError>>, LinkError> {
            match &self.push {
                Push::Hang => std::future::pending().await,
                Push::Refuse => Err(LinkError::Connection("refused".into())),
                Push::Frames(rx) => {
                    let rx = rx.lock().unwrap().take().expect("push opened once");
                    Ok(stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|text| (Ok(text), rx))
                    })
                    .boxed())
                }
            }
        }

        async fn fetch_pose(&self) -> Result<Value, LinkError> {
            self.pose_calls.fetch_add(1, Ordering::SeqCst);
            self.poses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LinkError::Connection("offline".into())))
        }

        async fn start_navigation(&self, goal: &Value) -> Result<(), LinkError> {
            self.goals.lock().unwrap().push(goal.clone());
            Ok(())
        }

        async fn cancel_navigation(&self) -> Result<(), LinkError> {
            if self.cancel_fails {
                Err(LinkError::Http("500".into()))
            } else {
                Ok(())
            }
        }

        async fn fetch_path(&self) -> Result<Value, LinkError> {
            Ok(self.path.clone())
        }

        async fn fetch_map(&self) -> Result<Value, LinkError> {
            Ok(json!({
                "width": 2, "height": 1, "resolution": 0.05,
                "originX": -1.0, "originY": 0.0, "data": [0, 100]
            }))
        }
    }

    fn pose(x: f64, timestamp: i64) -> Result<Value, LinkError> {
        Ok(json!({ "x": x, "y": 0.0, "theta": 0.0, "timestamp": timestamp }))
    }

    fn client(backend: Arc<MockBackend>, hub: &EventHub) -> NavigationClient {
        NavigationClient::new(NavigationConfig::default(), backend, hub.clone())
    }

    async fn next_pose(rx: &mut crate::hub::TopicReceiver) -> Pose {
        loop {
            let event = rx.recv().await.expect("hub open");
            if let EventPayload::Pose(pose) = event.payload {
                return pose;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_polling_after_push_timeout() -> Result<(), Box<dyn std::error::Error>> {
        let backend = Arc::new(MockBackend::new(
            Push::Hang,
            vec![
                pose(1.0, 10),
                pose(2.0, 20),
                Err(LinkError::Http("502".into())),
                pose(4.0, 40),
            ],
        ));
        let hub = EventHub::default();
        let mut nav = hub.subscribe_to(Topic::Navigation);
        let client = client(Arc::clone(&backend), &hub);

        let started = tokio::time::Instant::now();
        assert_eq!(client.connect().await?, Strategy::Poll);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(client.status(), ConnectionStatus::Connected);

        // Probe pose is delivered straight away.
        assert_eq!(next_pose(&mut nav).await.x, 1.0);
        // First poll one interval later.
        assert_eq!(next_pose(&mut nav).await.x, 2.0);
        // The failed round-trip is skipped; polling carries on.
        assert_eq!(next_pose(&mut nav).await.x, 4.0);
        assert_eq!(backend.pose_calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_polling() -> Result<(), Box<dyn std::error::Error>> {
        let backend = Arc::new(MockBackend::new(Push::Refuse, vec![pose(1.0, 1)]));
        let client = client(Arc::clone(&backend), &EventHub::default());
        assert_eq!(client.connect().await?, Strategy::Poll);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let calls = backend.pose_calls.load(Ordering::SeqCst);
        assert_eq!(calls, 3, "probe plus two polls");

        client.disconnect();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.pose_calls.load(Ordering::SeqCst), calls);
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert_eq!(client.strategy(), None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_keeps_polling() -> Result<(), Box<dyn std::error::Error>> {
        let backend = Arc::new(MockBackend::new(
            Push::Refuse,
            vec![pose(1.0, 1), pose(2.0, 2), pose(3.0, 3)],
        ));
        let hub = EventHub::default();
        let mut nav = hub.subscribe_to(Topic::Navigation);
        let config = NavigationConfig {
            poll_interval: Duration::ZERO,
            ..NavigationConfig::default()
        };
        let client = NavigationClient::new(config, backend.clone(), hub);
        assert_eq!(client.connect().await?, Strategy::Poll);

        let poses = tokio::time::timeout(Duration::from_secs(1), async {
            [next_pose(&mut nav).await.x, next_pose(&mut nav).await.x, next_pose(&mut nav).await.x]
        })
        .await?;
        assert_eq!(poses, [1.0, 2.0, 3.0]);
        assert_eq!(client.status(), ConnectionStatus::Connected);
        Ok(())
    }

    #[tokio::test]
    async fn both_strategies_failing_is_an_error() {
        let backend = Arc::new(MockBackend::new(Push::Refuse, Vec::new()));
        let client = client(backend, &EventHub::default());
        assert!(client.connect().await.is_err());
        assert_eq!(client.status(), ConnectionStatus::Error);
        assert_eq!(client.strategy(), None);
    }

    #[tokio::test]
    async fn push_frames_are_validated_and_published() -> Result<(), Box<dyn std::error::Error>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(MockBackend::new(Push::Frames(Mutex::new(Some(rx))), Vec::new()));
        let hub = EventHub::default();
        let mut nav = hub.subscribe_to(Topic::Navigation);
        let mut status = hub.subscribe_to(Topic::Status);
        let client = client(backend, &hub);

        assert_eq!(client.connect().await?, Strategy::Push);
        tx.send("garbage".to_string())?;
        tx.send(json!({ "pose": { "x": 1.5, "y": 0.0, "theta": 0.0 } }).to_string())?;
        tx.send(
            json!({ "obstacles": [{ "type": "dynamic", "x": 2.0, "y": 1.0, "radius": 0.4 }] })
                .to_string(),
        )?;

        let pose = next_pose(&mut nav).await;
        assert_eq!(pose.x, 1.5);
        assert!(pose.timestamp > 0, "missing timestamp defaults to now");

        let EventPayload::Obstacles(obstacles) = nav.recv().await?.payload else {
            panic!("expected obstacles")
        };
        assert_eq!(obstacles.len(), 1);
        assert_eq!(obstacles[0].radius, Some(0.4));

        drop(tx);
        let mut watch = client.watch_status();
        watch
            .wait_for(|s| *s == ConnectionStatus::Disconnected)
            .await?;

        let mut seen = Vec::new();
        while let Ok(event) = status.recv().await {
            if let EventPayload::Status { status, .. } = event.payload {
                seen.push(status);
                if status == ConnectionStatus::Disconnected {
                    break;
                }
            }
        }
        assert_eq!(
            seen,
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn go_to_validates_before_requesting() -> Result<(), Box<dyn std::error::Error>> {
        let backend = Arc::new(MockBackend::new(Push::Refuse, Vec::new()));
        let client = client(Arc::clone(&backend), &EventHub::default());

        let too_long = NavTarget::new(1.0, 2.0).with_label("x".repeat(101));
        assert!(matches!(
            client.go_to(&too_long).await,
            Err(LinkError::Validation(_))
        ));
        assert!(backend.goals.lock().unwrap().is_empty());

        client.go_to(&NavTarget::new(1.0, 2.0).with_label(" dock ")).await?;
        let goals = backend.goals.lock().unwrap().clone();
        assert_eq!(goals, vec![json!({ "x": 1.0, "y": 2.0, "label": "dock" })]);
        Ok(())
    }

    #[tokio::test]
    async fn path_and_map_are_typed() -> Result<(), Box<dyn std::error::Error>> {
        let mut backend = MockBackend::new(Push::Refuse, Vec::new());
        backend.path = json!({ "path": [{ "x": 0.0, "y": 0.0 }, { "x": 1.0, "y": 0.5 }] });
        let client = client(Arc::new(backend), &EventHub::default());

        let path = client.current_path().await?;
        assert_eq!(path.len(), 2);
        assert_eq!(path[1].y, 0.5);

        let map = client.map().await?;
        assert_eq!((map.width, map.height), (2, 1));
        assert_eq!(map.data, vec![0, 100]);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_failure_is_reported() {
        let mut backend = MockBackend::new(Push::Refuse, Vec::new());
        backend.cancel_fails = true;
        let client = client(Arc::new(backend), &EventHub::default());
        assert!(client.cancel_navigation().await.is_err());
    }
}
