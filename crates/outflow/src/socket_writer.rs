//! # Buffered Socket Writer
//!
//! Decouples protocol writes from socket transmission. The send worker copies
//! framed bytes into a fixed-capacity ring; a dedicated drain thread pushes
//! them into a non-blocking [`Transport`].
//!
//! ```text
//!   send worker ──enqueue_bytes──► [ ring ] ──drain thread──► transport
//!        ▲                           │  ▲                        │
//!        └──── space_available ──────┘  └──── data_available ────┘
//! ```
//!
//! Enqueue blocks while the ring is full. Data larger than the ring is copied
//! in pieces, so an oversized write still completes once the drain catches up.
//! Every wait is a short timed wait that rechecks the exit flags and the drain
//! deadline, so nothing blocks past a shutdown.
//!
//! Shutdown sets the exit flag, wakes both sides and joins the drain thread
//! before the transport is handed back for closing. No write is ever left
//! half-submitted.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, warn};

use crate::error::{OutputError, WriterError};
use crate::estimator::StrainEstimator;
use crate::shutdown::ShutdownSignal;
use crate::transport::Transport;

/// Upper bound on any single blocking wait.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Largest slice handed to the transport per write.
const DRAIN_CHUNK: usize = 64 * 1024;

// ─── Shared State ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct Ring {
    buf: VecDeque<u8>,
    capacity: usize,
    /// Drain what is left, then stop.
    exit: bool,
    /// Stop now, leaving whatever is buffered.
    abort: bool,
    failure: Option<WriterError>,
}

struct WriterShared {
    ring: Mutex<Ring>,
    space_available: Condvar,
    data_available: Condvar,
    estimator: Arc<StrainEstimator>,
    shutdown: Arc<ShutdownSignal>,
}

impl WriterShared {
    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, cv: &Condvar, guard: MutexGuard<'a, Ring>, timeout: Duration) -> MutexGuard<'a, Ring> {
        match cv.wait_timeout(guard, timeout) {
            Ok((g, _)) => g,
            Err(e) => e.into_inner().0,
        }
    }

    fn fail(&self, ring: &mut Ring, err: WriterError) {
        ring.failure.get_or_insert(err);
        ring.abort = true;
        self.space_available.notify_all();
        self.data_available.notify_all();
    }
}

// ─── Gauge ──────────────────────────────────────────────────────────────────

/// Read-only view of ring occupancy, usable from any thread.
#[derive(Clone)]
pub struct WriterGauge {
    shared: Arc<WriterShared>,
}

impl WriterGauge {
    pub fn used(&self) -> usize {
        self.shared.lock().buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    pub fn fill_ratio(&self) -> f64 {
        let ring = self.shared.lock();
        if ring.capacity == 0 {
            return 0.0;
        }
        ring.buf.len() as f64 / ring.capacity as f64
    }
}

impl std::fmt::Debug for WriterGauge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.shared.lock();
        f.debug_struct("WriterGauge")
            .field("used", &ring.buf.len())
            .field("capacity", &ring.capacity)
            .finish()
    }
}

// ─── Writer ─────────────────────────────────────────────────────────────────

pub struct BufferedSocketWriter {
    shared: Arc<WriterShared>,
    drain: Option<JoinHandle<Box<dyn Transport>>>,
}

impl BufferedSocketWriter {
    /// Take ownership of a connected, non-blocking transport and start the
    /// drain thread.
    pub fn start(
        transport: Box<dyn Transport>,
        capacity: usize,
        estimator: Arc<StrainEstimator>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Result<Self, OutputError> {
        let capacity = capacity.max(1);
        let shared = Arc::new(WriterShared {
            ring: Mutex::new(Ring {
                buf: VecDeque::with_capacity(capacity),
                capacity,
                exit: false,
                abort: false,
                failure: None,
            }),
            space_available: Condvar::new(),
            data_available: Condvar::new(),
            estimator,
            shutdown,
        });

        let drain_shared = shared.clone();
        let drain = thread::Builder::new()
            .name("outflow-socket".into())
            .spawn(move || drain_loop(drain_shared, transport))
            .map_err(|e| OutputError::SpawnFailed(e.to_string()))?;

        debug!(capacity, "socket writer started");
        Ok(BufferedSocketWriter {
            shared,
            drain: Some(drain),
        })
    }

    pub fn gauge(&self) -> WriterGauge {
        WriterGauge {
            shared: self.shared.clone(),
        }
    }

    /// The first failure seen by the drain thread, if any.
    pub fn failure(&self) -> Option<WriterError> {
        self.shared.lock().failure.clone()
    }

    /// Copy `data` into the ring, blocking while it is full.
    ///
    /// Records a strain sample after every copy.
    pub fn enqueue_bytes(&self, data: &[u8]) -> Result<(), WriterError> {
        let shared = &self.shared;
        let mut ring = shared.lock();
        let mut offset = 0;

        while offset < data.len() {
            if let Some(err) = &ring.failure {
                return Err(err.clone());
            }
            if ring.exit || ring.abort {
                return Err(WriterError::Closed);
            }

            let remaining = data.len() - offset;
            let free = ring.capacity - ring.buf.len();
            // Whole write if it fits the ring at all, otherwise whatever is free.
            let needed = if remaining > ring.capacity { 1 } else { remaining };
            if free < needed {
                if shared.shutdown.expired(Instant::now()) {
                    return Err(WriterError::DeadlineElapsed);
                }
                ring = shared.wait(&shared.space_available, ring, POLL_INTERVAL);
                continue;
            }

            let n = remaining.min(free);
            ring.buf.extend(&data[offset..offset + n]);
            offset += n;

            shared
                .estimator
                .record_strain(ring.buf.len(), ring.capacity, Instant::now());
            shared.data_available.notify_one();
        }
        Ok(())
    }

    /// Stop the drain thread and hand back the transport.
    ///
    /// With `flush` the thread first empties the ring (bounded by the drain
    /// deadline); without it buffered bytes are discarded.
    pub fn shutdown(&mut self, flush: bool) -> (Option<Box<dyn Transport>>, Result<(), WriterError>) {
        {
            let mut ring = self.shared.lock();
            if flush {
                ring.exit = true;
            } else {
                ring.abort = true;
            }
            self.shared.space_available.notify_all();
            self.shared.data_available.notify_all();
        }

        let transport = match self.drain.take() {
            Some(handle) => match handle.join() {
                Ok(t) => Some(t),
                Err(_) => {
                    warn!("socket drain thread panicked");
                    None
                }
            },
            None => None,
        };

        let ring = self.shared.lock();
        let result = match &ring.failure {
            Some(err) => Err(err.clone()),
            None if flush && !ring.buf.is_empty() => Err(WriterError::Closed),
            None => Ok(()),
        };
        (transport, result)
    }
}

impl Drop for BufferedSocketWriter {
    fn drop(&mut self) {
        if self.drain.is_some() {
            if let (Some(mut transport), _) = self.shutdown(false) {
                transport.close();
            }
        }
    }
}

// ─── Drain Thread ───────────────────────────────────────────────────────────

fn drain_loop(shared: Arc<WriterShared>, mut transport: Box<dyn Transport>) -> Box<dyn Transport> {
    let mut chunk = Vec::with_capacity(DRAIN_CHUNK);

    loop {
        {
            let mut ring = shared.lock();
            loop {
                if ring.abort {
                    return transport;
                }
                if !ring.buf.is_empty() {
                    break;
                }
                if ring.exit {
                    return transport;
                }
                ring = shared.wait(&shared.data_available, ring, POLL_INTERVAL);
            }

            if shared.shutdown.expired(Instant::now()) {
                warn!(unsent = ring.buf.len(), "socket drain deadline elapsed");
                shared.fail(&mut ring, WriterError::DeadlineElapsed);
                return transport;
            }

            let n = ring.buf.len().min(DRAIN_CHUNK);
            chunk.clear();
            chunk.extend(ring.buf.iter().take(n));
        }

        // Only the drain thread removes bytes, so the copied prefix stays put
        // while the lock is released.
        match transport.write(&chunk) {
            Ok(0) => {
                let ring = shared.lock();
                let _ring = shared.wait(&shared.data_available, ring, Duration::from_millis(1));
            }
            Ok(n) => {
                let mut ring = shared.lock();
                ring.buf.drain(..n);
                shared.space_available.notify_all();
            }
            Err(e) => {
                warn!(error = %e, "socket write failed");
                let mut ring = shared.lock();
                shared.fail(&mut ring, WriterError::Failed(e.to_string()));
                return transport;
            }
        }
    }
}
