//! Per-client streaming sessions.
//!
//! Each session owns one producer thread and one frame channel. The manager
//! is the only place sessions are created, evicted or stopped; it caps the
//! number of sessions and evicts the oldest one (FIFO, not LRU) to make room.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::capture::{FrameLayout, FrameSource, RawFrame};
use crate::error::{ProducerExit, SourceError};
use crate::pipeline::producer::{spawn_producer, ProducerHandle, ProducerState};
use crate::pipeline::render::render_from_layout;
use crate::pipeline::FrameChannel;

/// Peer address and port; one session per TCP connection, roughly.
pub type ClientId = SocketAddr;

/// Opens a fresh source for a new producer.
pub type SourceFactory =
    Arc<dyn Fn() -> Result<Box<dyn FrameSource>, SourceError> + Send + Sync>;

/// Sleep while no camera is live.
const NOT_LIVE_PAUSE: Duration = Duration::from_secs(1);

/// Settings shared by every session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub quality: u8,
    pub idle_timeout: Duration,
}

pub struct Session {
    client: ClientId,
    created: Instant,
    options: SessionOptions,
    factory: SourceFactory,
    channel: Arc<FrameChannel>,
    producer: Mutex<Option<ProducerHandle>>,
    layout: ArcSwapOption<FrameLayout>,
    last_frame: ArcSwapOption<RawFrame>,
}

impl Session {
    fn new(client: ClientId, factory: SourceFactory, options: SessionOptions) -> Self {
        Self {
            client,
            created: Instant::now(),
            options,
            factory,
            channel: Arc::new(FrameChannel::new()),
            producer: Mutex::new(None),
            layout: ArcSwapOption::empty(),
            last_frame: ArcSwapOption::empty(),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn channel(&self) -> &FrameChannel {
        &self.channel
    }

    /// Producer state, or `None` if the session was never started.
    pub fn producer_state(&self) -> Option<ProducerState> {
        lock(&self.producer).as_ref().map(ProducerHandle::current)
    }

    /// Spawn the producer (unless one is already running) and return the
    /// stream of rendered JPEG frames for this client.
    ///
    /// The stream ends once the producer exits.
    #[instrument(skip(self), fields(client = %self.client))]
    pub fn start(self: &Arc<Self>) -> impl Stream<Item = Bytes> + Send + 'static {
        let state = self.ensure_producer();
        let cursor = Cursor {
            session: Arc::clone(self),
            state,
            pause: None,
            rendered: None,
        };
        stream::unfold(cursor, |mut cursor| async move {
            let jpeg = cursor.next_jpeg().await?;
            Some((jpeg, cursor))
        })
    }

    /// Stop the producer. The session's streams end shortly after.
    pub fn stop(&self) {
        if let Some(producer) = lock(&self.producer).take() {
            info!("Stopping producer for {}", self.client);
            producer.stop();
        }
        self.channel.close();
    }

    /// Latest frame this session has seen, rendered without transforms.
    pub fn last_frame_jpeg(&self) -> Option<Bytes> {
        let frame = self.last_frame.load_full()?;
        let layout = self.layout.load_full()?;
        render_from_layout(&frame, &layout, self.options.quality, true)
    }

    pub fn has_frame(&self) -> bool {
        self.last_frame.load().is_some() && self.layout.load().is_some()
    }

    fn is_finished(&self) -> bool {
        lock(&self.producer)
            .as_ref()
            .is_some_and(|p| p.current().exit().is_some())
    }

    fn ensure_producer(&self) -> watch::Receiver<ProducerState> {
        let mut producer = lock(&self.producer);
        if let Some(handle) = producer.as_ref() {
            if handle.current().exit().is_none() {
                return handle.state();
            }
        }

        // The idle clock still holds the previous producer's last drain
        self.channel.touch();
        let factory = Arc::clone(&self.factory);
        let spawned = spawn_producer(
            self.client.to_string(),
            move || factory(),
            Arc::clone(&self.channel),
            self.options.idle_timeout,
        );
        match spawned {
            Ok(handle) => {
                let state = handle.state();
                *producer = Some(handle);
                state
            }
            Err(e) => {
                warn!("Cannot spawn producer for {}: {}", self.client, e);
                let (_, state) =
                    watch::channel(ProducerState::Exited(ProducerExit::ConnectFailed(e.to_string())));
                state
            }
        }
    }
}

/// Consumer-side loop state for one streaming response.
struct Cursor {
    session: Arc<Session>,
    state: watch::Receiver<ProducerState>,
    pause: Option<Duration>,
    /// Last render, keyed by frame sequence and length
    rendered: Option<((u64, usize), Option<Bytes>)>,
}

impl Cursor {
    async fn next_jpeg(&mut self) -> Option<Bytes> {
        loop {
            if let Some(pause) = self.pause.take() {
                tokio::time::sleep(pause).await;
            }

            let current = self.state.borrow().clone();
            let layout = match current {
                ProducerState::Starting => {
                    self.state.changed().await.ok()?;
                    continue;
                }
                ProducerState::Exited(exit) => {
                    debug!("Stream for {} ends: {:?}", self.session.client, exit);
                    return None;
                }
                ProducerState::Running { live: false, .. } => {
                    // Still attached; keep the producer from idling out
                    self.session.channel.touch();
                    self.pause = Some(NOT_LIVE_PAUSE);
                    continue;
                }
                ProducerState::Running { layout, .. } => layout,
            };
            self.session.layout.store(Some(Arc::clone(&layout)));

            let frame = match self.session.channel.get_nowait() {
                Some(frame) => {
                    self.session.last_frame.store(Some(Arc::clone(&frame)));
                    Some(frame)
                }
                None => self.session.last_frame.load_full(),
            };
            let Some(frame) = frame else {
                self.pause = Some(layout.primary().poll_interval());
                continue;
            };

            let interval = layout
                .attribute(frame.data.len())
                .map(|d| d.exposure)
                .unwrap_or_else(|_| layout.primary().exposure);
            self.pause = Some(interval);

            if let Some(jpeg) = self.render(frame, layout).await {
                return Some(jpeg);
            }
        }
    }

    async fn render(&mut self, frame: Arc<RawFrame>, layout: Arc<FrameLayout>) -> Option<Bytes> {
        let key = (frame.sequence, frame.data.len());
        if let Some((cached, jpeg)) = &self.rendered {
            if *cached == key {
                return jpeg.clone();
            }
        }

        let quality = self.session.options.quality;
        let jpeg = tokio::task::spawn_blocking(move || {
            render_from_layout(&frame, &layout, quality, false)
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Render task failed: {}", e);
            None
        });
        self.rendered = Some((key, jpeg.clone()));
        jpeg
    }
}

struct Registry {
    sessions: HashMap<ClientId, Arc<Session>>,
    /// Creation order, oldest first
    order: VecDeque<ClientId>,
}

/// Owns every live session.
pub struct SessionManager {
    registry: Mutex<Registry>,
    max_sessions: usize,
    factory: SourceFactory,
    options: SessionOptions,
}

impl SessionManager {
    pub fn new(max_sessions: usize, factory: SourceFactory, options: SessionOptions) -> Self {
        Self {
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_sessions: max_sessions.max(1),
            factory,
            options,
        }
    }

    /// Session for `client`, creating it (and evicting the oldest session
    /// if at capacity) when none exists.
    pub fn acquire(&self, client: ClientId) -> Arc<Session> {
        let mut registry = lock(&self.registry);
        if let Some(session) = registry.sessions.get(&client) {
            return Arc::clone(session);
        }

        prune_finished(&mut registry);

        while registry.sessions.len() >= self.max_sessions {
            let Some(oldest) = registry.order.pop_front() else {
                break;
            };
            if let Some(evicted) = registry.sessions.remove(&oldest) {
                warn!(
                    "Reached maximum concurrent streams, closing stream of client {}",
                    oldest
                );
                metrics::counter!("sessions_evicted").increment(1);
                evicted.stop();
            }
        }

        info!("Starting new session for client {}", client);
        let session = Arc::new(Session::new(
            client,
            Arc::clone(&self.factory),
            self.options.clone(),
        ));
        registry.sessions.insert(client, Arc::clone(&session));
        registry.order.push_back(client);
        session
    }

    /// Stop and remove the session of `client`.
    pub fn stop(&self, client: ClientId) -> bool {
        let mut registry = lock(&self.registry);
        registry.order.retain(|c| *c != client);
        match registry.sessions.remove(&client) {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let mut registry = lock(&self.registry);
        registry.order.clear();
        for (_, session) in registry.sessions.drain() {
            session.stop();
        }
    }

    /// Most recently created session.
    pub fn latest(&self) -> Option<Arc<Session>> {
        let registry = lock(&self.registry);
        let client = registry.order.back()?;
        registry.sessions.get(client).cloned()
    }

    /// Newest session that has already seen a frame.
    pub fn latest_with_frame(&self) -> Option<Arc<Session>> {
        let registry = lock(&self.registry);
        registry
            .order
            .iter()
            .rev()
            .filter_map(|client| registry.sessions.get(client))
            .find(|session| session.has_frame())
            .cloned()
    }

    /// Clients in creation order.
    pub fn clients(&self) -> Vec<ClientId> {
        lock(&self.registry).order.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Forget sessions whose producer already exited (idle clients).
fn prune_finished(registry: &mut Registry) {
    let finished: Vec<ClientId> = registry
        .sessions
        .iter()
        .filter(|(_, s)| s.is_finished())
        .map(|(c, _)| *c)
        .collect();
    for client in finished {
        debug!("Dropping finished session of {}", client);
        registry.sessions.remove(&client);
        registry.order.retain(|c| *c != client);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
