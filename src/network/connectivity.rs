//! Connectivity manager
//!
//! Owns the association state machine. Link events are handled on one
//! thread; a second thread, the cooldown watcher, re-triggers association
//! after the immediate retries are exhausted. Everything else observes the
//! resulting [`ConnectionState`] through a [`ConnectivityReader`].

use crossbeam::atomic::AtomicCell;
use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ConnectivityConfig;
use crate::error::ConnectivityError;
use crate::network::link::{AccessPoint, Credentials, LinkEvent, LinkLayer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct CellShared {
    state: AtomicCell<ConnectionState>,
    lock: Mutex<()>,
    changed: Condvar,
}

/// Creates the connectivity cell: one writer, any number of readers
pub fn connectivity_cell() -> (ConnectivityWriter, ConnectivityReader) {
    let shared = Arc::new(CellShared {
        state: AtomicCell::new(ConnectionState::Disconnected),
        lock: Mutex::new(()),
        changed: Condvar::new(),
    });
    (
        ConnectivityWriter {
            shared: shared.clone(),
        },
        ConnectivityReader { shared },
    )
}

/// The only handle that can change the connection state. Not `Clone`.
pub struct ConnectivityWriter {
    shared: Arc<CellShared>,
}

impl ConnectivityWriter {
    pub fn set(&self, state: ConnectionState) {
        let _guard = self.shared.lock.lock();
        self.shared.state.store(state);
        self.shared.changed.notify_all();
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }
}

/// Read-only view of the connection state
#[derive(Clone)]
pub struct ConnectivityReader {
    shared: Arc<CellShared>,
}

impl ConnectivityReader {
    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Blocks until the state is `Connected`
    pub fn wait_connected(&self) {
        let mut guard = self.shared.lock.lock();
        while !self.is_connected() {
            self.shared.changed.wait(&mut guard);
        }
    }

    /// Returns whether the state became `Connected` within `timeout`
    pub fn wait_connected_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.lock.lock();
        while !self.is_connected() {
            if self
                .shared
                .changed
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return self.is_connected();
            }
        }
        true
    }
}

/// Source of delays for the cooldown watcher
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Default)]
struct CooldownFlag {
    active: Mutex<bool>,
    changed: Condvar,
}

impl CooldownFlag {
    fn enter(&self) {
        *self.active.lock() = true;
        self.changed.notify_all();
    }

    fn clear(&self) {
        *self.active.lock() = false;
    }

    fn is_active(&self) -> bool {
        *self.active.lock()
    }

    fn wait_active(&self) {
        let mut active = self.active.lock();
        while !*active {
            self.changed.wait(&mut active);
        }
    }
}

/// State shared by the event handler and the cooldown watcher
struct Association<L> {
    link: Mutex<L>,
    credentials: Credentials,
    max_scan_results: usize,
    cooldown: CooldownFlag,
}

impl<L: LinkLayer> Association<L> {
    /// Scans and associates with the strongest matching access point.
    /// The link lock serializes attempts, so at most one is in flight.
    fn associate_strongest(&self) -> Result<AccessPoint, ConnectivityError> {
        let mut link = self.link.lock();
        let results = link.scan(&self.credentials.ssid)?;
        let access_point =
            select_access_point(&results, &self.credentials.ssid, self.max_scan_results)
                .cloned()
                .ok_or_else(|| ConnectivityError::NoAccessPoint(self.credentials.ssid.clone()))?;
        link.associate(access_point.bssid)?;
        Ok(access_point)
    }
}

/// Strongest access point named `ssid` among the first `max_results`
/// scan results
pub fn select_access_point<'a>(
    results: &'a [AccessPoint],
    ssid: &str,
    max_results: usize,
) -> Option<&'a AccessPoint> {
    results
        .iter()
        .take(max_results)
        .filter(|ap| ap.ssid == ssid)
        .max_by_key(|ap| ap.rssi)
}

/// Association state machine
pub struct ConnectivityManager<L: LinkLayer> {
    association: Arc<Association<L>>,
    writer: ConnectivityWriter,
    reader: ConnectivityReader,
    retry_attempts: u32,
    max_retry_attempts: u32,
    cooldown: Duration,
}

impl<L: LinkLayer + 'static> ConnectivityManager<L> {
    pub fn new(link: L, credentials: Credentials, settings: &ConnectivityConfig) -> Self {
        let (writer, reader) = connectivity_cell();
        Self {
            association: Arc::new(Association {
                link: Mutex::new(link),
                credentials,
                max_scan_results: settings.max_scan_results,
                cooldown: CooldownFlag::default(),
            }),
            writer,
            reader,
            retry_attempts: 0,
            max_retry_attempts: settings.max_retry_attempts,
            cooldown: settings.cooldown(),
        }
    }

    pub fn reader(&self) -> ConnectivityReader {
        self.reader.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.writer.state()
    }

    pub fn is_cooling_down(&self) -> bool {
        self.association.cooldown.is_active()
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    /// Applies credentials. Failure here is a configuration error the
    /// caller must treat as fatal.
    pub fn start(&mut self) -> Result<(), ConnectivityError> {
        tracing::info!("Joining network {:?}", self.association.credentials.ssid);
        self.writer.set(ConnectionState::Connecting);
        self.association
            .link
            .lock()
            .configure(&self.association.credentials)
    }

    pub fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Started => {
                self.writer.set(ConnectionState::Connecting);
                self.associate();
            }
            LinkEvent::GotAddress(address) => {
                tracing::info!("Got address {}", address);
                self.writer.set(ConnectionState::Connected);
                self.association.cooldown.clear();
                self.retry_attempts = 0;
            }
            LinkEvent::Disassociated => {
                tracing::info!("Disassociated from access point");
                self.writer.set(ConnectionState::Disconnected);

                if self.association.cooldown.is_active() {
                    tracing::debug!("Cooldown pending, not reassociating");
                } else if self.retry_attempts < self.max_retry_attempts {
                    self.retry_attempts += 1;
                    self.writer.set(ConnectionState::Connecting);
                    self.associate();
                } else {
                    tracing::warn!(
                        "Could not reconnect after {} attempts, trying again in {}ms",
                        self.max_retry_attempts,
                        self.cooldown.as_millis()
                    );
                    self.retry_attempts = 0;
                    self.association.cooldown.enter();
                }
            }
        }
    }

    fn associate(&mut self) {
        match self.association.associate_strongest() {
            Ok(ap) => tracing::debug!("Associating with {} ({} dBm)", ap.bssid, ap.rssi),
            Err(e) => {
                tracing::warn!("Association failed: {}", e);
                self.writer.set(ConnectionState::Disconnected);
                self.association.cooldown.enter();
            }
        }
    }

    pub fn cooldown_watcher(&self) -> CooldownWatcher<L> {
        CooldownWatcher {
            association: self.association.clone(),
            cooldown: self.cooldown,
        }
    }

    /// Handles events until the link layer's channel closes.
    pub fn run(mut self, events: Receiver<LinkEvent>) {
        for event in events {
            self.handle_event(event);
        }
        tracing::debug!("Link event channel closed");
    }

    /// Applies credentials, then moves the event handler and the cooldown
    /// watcher onto their own threads.
    pub fn spawn(
        mut self,
        events: Receiver<LinkEvent>,
    ) -> crate::Result<(ConnectivityReader, JoinHandle<()>)> {
        self.start()?;
        let reader = self.reader();

        let watcher = self.cooldown_watcher();
        thread::Builder::new()
            .name("connectivity-cooldown".to_string())
            .spawn(move || watcher.run(&ThreadSleeper))?;

        let handle = thread::Builder::new()
            .name("connectivity".to_string())
            .spawn(move || self.run(events))?;

        Ok((reader, handle))
    }
}

/// Re-triggers association once the cooldown has elapsed
pub struct CooldownWatcher<L> {
    association: Arc<Association<L>>,
    cooldown: Duration,
}

impl<L: LinkLayer> CooldownWatcher<L> {
    /// Waits for a cooldown, sleeps it out, then attempts association.
    /// A failed attempt re-enters cooldown.
    pub fn step(&self, sleeper: &dyn Sleeper) {
        self.association.cooldown.wait_active();
        sleeper.sleep(self.cooldown);
        self.association.cooldown.clear();

        if let Err(e) = self.association.associate_strongest() {
            tracing::warn!("Association after cooldown failed: {}", e);
            self.association.cooldown.enter();
        }
    }

    pub fn run(&self, sleeper: &dyn Sleeper) {
        loop {
            self.step(sleeper);
        }
    }
}
