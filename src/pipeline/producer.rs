//! Polling producer: one dedicated thread per session.
//!
//! The thread owns its source outright and talks to the rest of the server
//! only through its sink and a state watch. Device clients block, so the
//! loop never runs on the async runtime. A stop request is observed at the
//! next suspension point; the thread is never joined.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::capture::{FrameLayout, FrameSource};
use crate::error::{ProducerExit, SinkError, SourceError};
use crate::pipeline::channel::FrameSink;

/// What the session can observe about its producer.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ProducerState {
    /// Source still connecting.
    #[default]
    Starting,
    Running {
        layout: Arc<FrameLayout>,
        live: bool,
    },
    Exited(ProducerExit),
}

impl ProducerState {
    pub fn layout(&self) -> Option<&Arc<FrameLayout>> {
        match self {
            ProducerState::Running { layout, .. } => Some(layout),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ProducerState::Running { live: true, .. })
    }

    pub fn exit(&self) -> Option<&ProducerExit> {
        match self {
            ProducerState::Exited(exit) => Some(exit),
            _ => None,
        }
    }
}

/// Owner's side of a producer thread. Dropping it stops the producer.
pub struct ProducerHandle {
    name: String,
    stop: flume::Sender<()>,
    state: watch::Receiver<ProducerState>,
}

impl ProducerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the producer to stop at its next suspension point.
    pub fn stop(&self) {
        let _ = self.stop.try_send(());
    }

    pub fn state(&self) -> watch::Receiver<ProducerState> {
        self.state.clone()
    }

    pub fn current(&self) -> ProducerState {
        self.state.borrow().clone()
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a producer that opens its source with `open` and feeds `sink`
/// until stopped, idle for longer than `idle_timeout`, or refused by the sink.
pub fn spawn_producer<F, S>(
    name: impl Into<String>,
    open: F,
    sink: S,
    idle_timeout: Duration,
) -> std::io::Result<ProducerHandle>
where
    F: FnOnce() -> Result<Box<dyn FrameSource>, SourceError> + Send + 'static,
    S: FrameSink + 'static,
{
    let name = name.into();
    let (stop_tx, stop_rx) = flume::bounded(1);
    let (state_tx, state_rx) = watch::channel(ProducerState::Starting);

    let thread_name = name.clone();
    thread::Builder::new()
        .name(format!("producer-{}", name))
        .spawn(move || {
            let exit = match open() {
                Ok(source) => {
                    state_tx.send_replace(ProducerState::Running {
                        layout: Arc::new(source.layout()),
                        live: source.is_live(),
                    });
                    run(source, sink, &stop_rx, idle_timeout, &state_tx)
                }
                Err(e) => {
                    error!("Producer {} failed to open source: {}", thread_name, e);
                    ProducerExit::ConnectFailed(e.to_string())
                }
            };

            match &exit {
                ProducerExit::IdleTimeout(idle) => {
                    info!("Producer {} idle for {:?}, exiting", thread_name, idle)
                }
                other => debug!("Producer {} exited: {:?}", thread_name, other),
            }
            state_tx.send_replace(ProducerState::Exited(exit));
        })?;

    Ok(ProducerHandle {
        name,
        stop: stop_tx,
        state: state_rx,
    })
}

fn run<S: FrameSink>(
    mut source: Box<dyn FrameSource>,
    mut sink: S,
    stop: &flume::Receiver<()>,
    idle_timeout: Duration,
    state: &watch::Sender<ProducerState>,
) -> ProducerExit {
    loop {
        if let Some(idle) = sink.idle_for() {
            if idle > idle_timeout {
                return ProducerExit::IdleTimeout(idle);
            }
        }

        match source.poll_once() {
            Ok(Some(frame)) => match sink.accept(frame) {
                Ok(()) => {}
                Err(SinkError::Closed) => return ProducerExit::SinkClosed,
                Err(SinkError::Io(e)) => {
                    error!("Sink write failed: {}", e);
                    return ProducerExit::SinkClosed;
                }
            },
            Ok(None) => {}
            Err(e) => {
                metrics::counter!("poll_errors").increment(1);
                warn!("Poll failed: {}", e);
            }
        }

        let live = source.is_live();
        state.send_if_modified(|current| match current {
            ProducerState::Running { live: was, .. } if *was != live => {
                *was = live;
                true
            }
            _ => false,
        });

        // Interruptible sleep
        match stop.recv_timeout(source.next_poll_delay()) {
            Err(flume::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => return ProducerExit::Stopped,
        }
    }
}
