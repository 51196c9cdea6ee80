//! Connection broker
//! Maintains target concurrency: reaps closed records, tops up pending
//! connections under the configured limits, and signals run completion

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::cancel::{CancelReason, CancelToken, Event};
use crate::config::{Config, Protocol, Role};
use crate::connection::{self, ConnectionContext, ConnectionRecord, LifecycleObserver};
use crate::error::EngineError;
use crate::sockets::{Connector, TcpAcceptor, UdpAcceptor};
use crate::stats::GlobalStats;

/// Reap / refresh cadence
const TICK_INTERVAL: Duration = Duration::from_millis(333);

struct Slot {
    record: Arc<ConnectionRecord>,
    worker: Option<JoinHandle<()>>,
}

/// Everything the tick mutates, under the one broker lock
struct PoolState {
    slots: Vec<Slot>,
    pending_sockets: u64,
    active_sockets: u64,
    total_remaining: u64,
    next_id: u64,
}

pub struct BrokerCore {
    config: Arc<Config>,
    pool: Mutex<PoolState>,
    pending_limit: u64,
    done: Event,
    cancel: CancelToken,
    global: Arc<GlobalStats>,
    connector: Option<Arc<Connector>>,
    tcp_acceptor: Option<Arc<TcpAcceptor>>,
    udp_acceptor: Option<Arc<UdpAcceptor>>,
}

impl LifecycleObserver for BrokerCore {
    /// A pending connection has established and is about to pump I/O
    fn initiating_io(&self) {
        let mut pool = self.pool.lock();
        assert!(
            pool.pending_sockets > 0,
            "initiating_io with no pending sockets (active: {})",
            pool.active_sockets
        );
        pool.pending_sockets -= 1;
        pool.active_sockets += 1;
    }

    /// A connection finished; `was_active` tells which counter it occupied
    fn closing(&self, was_active: bool) {
        let mut pool = self.pool.lock();
        if was_active {
            assert!(
                pool.active_sockets > 0,
                "closing(active) with no active sockets (pending: {})",
                pool.pending_sockets
            );
            pool.active_sockets -= 1;
        } else {
            assert!(
                pool.pending_sockets > 0,
                "closing(pending) with no pending sockets (active: {})",
                pool.active_sockets
            );
            pool.pending_sockets -= 1;
        }
    }
}

impl BrokerCore {
    fn context(core: &Arc<Self>) -> ConnectionContext {
        ConnectionContext {
            config: Arc::clone(&core.config),
            observer: Arc::clone(core) as Arc<dyn LifecycleObserver>,
            connector: core.connector.clone(),
            tcp_acceptor: core.tcp_acceptor.clone(),
            udp_acceptor: core.udp_acceptor.clone(),
            global: Arc::clone(&core.global),
            cancel: core.cancel.clone(),
        }
    }

    /// One timer pass: reap, check completion, top up the pool.
    /// Everything happens under the broker lock.
    fn tick(core: &Arc<Self>) {
        let mut pool = core.pool.lock();

        pool.slots.retain_mut(|slot| {
            if slot.record.is_closed() {
                if let Some(worker) = slot.worker.take() {
                    let _ = worker.join();
                }
                false
            } else {
                true
            }
        });

        if pool.total_remaining == 0 && pool.pending_sockets == 0 && pool.active_sockets == 0 {
            core.done.set();
            return;
        }
        // no new work once the run is winding down
        if core.done.is_set() || core.cancel.is_cancelled() {
            return;
        }

        while pool.pending_sockets < core.pending_limit && pool.total_remaining > 0 {
            if core.config.is_client() {
                // connection total and connect throttle only bound the dialing side
                let limit = core.config.connection_limit as u64;
                if pool.pending_sockets + pool.active_sockets >= limit {
                    break;
                }
                if pool.pending_sockets >= core.config.throttle_limit as u64 {
                    break;
                }
            }

            let id = pool.next_id;
            let record = ConnectionRecord::new(id);
            match connection::spawn(Self::context(core), Arc::clone(&record)) {
                Ok(worker) => {
                    pool.next_id += 1;
                    pool.pending_sockets += 1;
                    pool.total_remaining -= 1;
                    pool.slots.push(Slot {
                        record,
                        worker: Some(worker),
                    });
                }
                Err(err) => {
                    // a failed slot is not retried; the next tick may fare better
                    error!(%err, "failed to start connection worker");
                    break;
                }
            }
        }
    }

    fn counters(&self) -> (u64, u64, u64) {
        let pool = self.pool.lock();
        (
            pool.pending_sockets,
            pool.active_sockets,
            pool.total_remaining,
        )
    }
}

/// Owns the pool and the periodic timer; the public face of the run
pub struct Broker {
    core: Arc<BrokerCore>,
    timer: Option<JoinHandle<()>>,
    timer_stop: Arc<AtomicBool>,
}

impl Broker {
    pub fn new(
        config: Arc<Config>,
        cancel: CancelToken,
        global: Arc<GlobalStats>,
    ) -> Result<Self, EngineError> {
        let mut connector = None;
        let mut tcp_acceptor = None;
        let mut udp_acceptor = None;
        match (config.role, config.protocol) {
            (Role::Connect, _) => connector = Some(Arc::new(Connector::new(Arc::clone(&config)))),
            (Role::Listen, Protocol::Tcp) => {
                tcp_acceptor = Some(Arc::new(TcpAcceptor::bind(&config)?))
            }
            (Role::Listen, Protocol::Udp) => {
                udp_acceptor = Some(Arc::new(UdpAcceptor::bind(&config)?))
            }
        }

        let total = config.total_connections();
        let pending_limit = config.pending_limit();
        info!(
            total_connections = total,
            pending_limit, "starting broker"
        );

        let core = Arc::new(BrokerCore {
            config: Arc::clone(&config),
            pool: Mutex::new(PoolState {
                slots: Vec::new(),
                pending_sockets: 0,
                active_sockets: 0,
                total_remaining: total,
                next_id: 0,
            }),
            pending_limit,
            done: Event::new(),
            cancel,
            global,
            connector,
            tcp_acceptor,
            udp_acceptor,
        });

        // fill the initial pool, then keep it topped up from the timer
        BrokerCore::tick(&core);

        let timer_stop = Arc::new(AtomicBool::new(false));
        let timer = {
            let core = Arc::clone(&core);
            let stop = Arc::clone(&timer_stop);
            let deadline = config.time_limit.map(|limit| Instant::now() + limit);
            let status_every = config.status_update;
            thread::Builder::new()
                .name("broker-timer".into())
                .spawn(move || {
                    let mut last_status = Instant::now();
                    while !stop.load(Ordering::Relaxed) {
                        thread::sleep(TICK_INTERVAL);
                        if let Some(deadline) = deadline {
                            if Instant::now() >= deadline {
                                core.cancel.cancel(CancelReason::TimeLimit);
                            }
                        }
                        BrokerCore::tick(&core);
                        if last_status.elapsed() >= status_every {
                            last_status = Instant::now();
                            let (pending, active, remaining) = core.counters();
                            let snap = core.global.snapshot();
                            info!(
                                pending,
                                active,
                                remaining,
                                completed = snap.connections_completed,
                                failed = snap.connections_failed,
                                mbps = format!("{:.2}", snap.mbps()),
                                "status"
                            );
                        }
                    }
                })
                .map_err(|e| EngineError::Thread(e.to_string()))?
        };

        Ok(Self {
            core,
            timer: Some(timer),
            timer_stop,
        })
    }

    /// Current (pending, active, remaining) counters
    pub fn counters(&self) -> (u64, u64, u64) {
        self.core.counters()
    }

    pub fn is_done(&self) -> bool {
        self.core.done.is_set()
    }

    /// Block until the done event, cancellation, or the timeout.
    /// Returns whether the caller should exit.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.core.done.is_set() || self.core.cancel.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(Duration::from_millis(50));
            if self.core.done.wait_timeout(slice) {
                return true;
            }
        }
    }

    /// Wait out the whole run, then tear down
    pub fn run_to_completion(&mut self) {
        while !self.wait(Duration::from_secs(1)) {}
        self.shutdown();
    }

    /// Stop the timer first so no new records appear, then drain the pool
    fn shutdown(&mut self) {
        self.timer_stop.store(true, Ordering::SeqCst);
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        loop {
            let workers: Vec<JoinHandle<()>> = {
                let mut pool = self.core.pool.lock();
                pool.slots
                    .iter_mut()
                    .filter_map(|slot| slot.worker.take())
                    .collect()
            };
            if workers.is_empty() {
                break;
            }
            for worker in workers {
                let _ = worker.join();
            }
        }
        debug!("broker drained");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
