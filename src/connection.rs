//! Persistent connection to pvdd.
//!
//! [`PvddConnection`] owns the TCP socket, a reader thread that decodes the
//! inbound stream and publishes events on the connection's [`EventBus`], and
//! an optional reconnect timer.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ok──► Connected
//!      ▲                          │                  │
//!      │                       failure         peer close / I/O error
//!      │                          ▼                  ▼
//!      └──────────────────── Disconnected ◄──────────┘
//!                    (retry every second while auto-reconnect is set)
//! ```
//!
//! Writes and teardown share one lock, so a command can never be written to a
//! socket that is being closed.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::config::{ConnectOptions, RECONNECT_INTERVAL};
use crate::error::PvddError;
use crate::events::{EventBus, Listener, Signal};
use crate::protocol::{interpret, Command, FrameDecoder, LineBuffer, PvdEvent};

/// Size of one socket read.
const READ_CHUNK_SIZE: usize = 4096;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Log at `info` for verbose connections, `debug` otherwise.
fn lifecycle(verbose: bool, message: fmt::Arguments<'_>) {
    if verbose {
        info!("{}", message);
    } else {
        debug!("{}", message);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The open socket plus the generation it was opened in. Reader threads
/// compare generations to tell a peer close from an explicit disconnect or
/// a newer socket.
struct Link {
    stream: TcpStream,
    generation: u64,
}

impl Link {
    fn close(self) {
        // Shutting down unblocks the reader thread's pending read.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// One-shot delayed reconnection, cancelled by dropping or signalling the
/// sender.
struct ReconnectTimer {
    cancel: mpsc::Sender<()>,
}

impl ReconnectTimer {
    fn arm(inner: Weak<Inner>, delay: Duration) -> std::io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel::<()>();

        let _timer = thread::Builder::new()
            .name("pvdd-reconnect".to_string())
            .spawn(move || {
                if cancelled.recv_timeout(delay) != Err(RecvTimeoutError::Timeout) {
                    return;
                }
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                lock(&inner.reconnect).take();
                if inner.wanted.load(Ordering::SeqCst) {
                    debug!("Reconnect timer fired");
                    Inner::establish(&inner);
                }
            })?;

        Ok(Self { cancel })
    }

    fn cancel(self) {
        let _ = self.cancel.send(());
    }
}

/// State shared between the handle, the reader thread and the reconnect
/// timer.
struct Inner {
    bus: EventBus,
    options: Mutex<ConnectOptions>,
    /// The send/close lock.
    link: Mutex<Option<Link>>,
    state: Mutex<ConnectionState>,
    generation: AtomicU64,
    /// Cleared by `disconnect` so late timers and connects stand down.
    wanted: AtomicBool,
    reconnect: Mutex<Option<ReconnectTimer>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            bus: EventBus::new(),
            options: Mutex::new(ConnectOptions::default()),
            link: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            generation: AtomicU64::new(0),
            wanted: AtomicBool::new(false),
            reconnect: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    fn options(&self) -> ConnectOptions {
        lock(&self.options).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    /// One connection attempt. Schedules a retry on failure when
    /// auto-reconnect is enabled.
    fn establish(inner: &Arc<Inner>) {
        if lock(&inner.link).is_some() {
            return;
        }

        let options = inner.options();
        let port = options.resolve_port();
        inner.set_state(ConnectionState::Connecting);
        lifecycle(options.verbose, format_args!("Connecting to pvdd on port {}", port));

        let stream = match TcpStream::connect((Ipv4Addr::LOCALHOST, port)) {
            Ok(stream) => stream,
            Err(e) => {
                inner.fail(PvddError::Connect(Arc::new(e)));
                return;
            }
        };

        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                let _ = stream.shutdown(Shutdown::Both);
                inner.fail(PvddError::Connect(Arc::new(e)));
                return;
            }
        };

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut link = lock(&inner.link);
            if link.is_some() || !inner.wanted.load(Ordering::SeqCst) {
                // Lost a race with another attempt, or disconnected meanwhile.
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
            *link = Some(Link { stream, generation });
            inner.set_state(ConnectionState::Connected);
        }

        let reader_inner = Arc::clone(inner);
        let verbose = options.verbose;
        let spawned = thread::Builder::new()
            .name("pvdd-reader".to_string())
            .spawn(move || Inner::read_loop(reader_inner, reader_stream, generation, verbose));

        match spawned {
            Ok(handle) => {
                *lock(&inner.reader) = Some(handle);
            }
            Err(e) => {
                if let Some(link) = lock(&inner.link).take() {
                    link.close();
                }
                inner.fail(PvddError::Connect(Arc::new(e)));
                return;
            }
        }

        if options.control_connection {
            let _ = inner.send(&Command::PromoteControl.to_wire());
        }

        lifecycle(verbose, format_args!("Connected with pvdd on port {}", port));
        inner.bus.publish(&PvdEvent::Connected);
    }

    /// Report a transport failure and retry later if configured to.
    fn fail(self: &Arc<Self>, error: PvddError) {
        self.set_state(ConnectionState::Disconnected);
        warn!("pvdd connection error: {}", error);
        self.bus.publish(&PvdEvent::Error(error));
        self.schedule_reconnect();
    }

    /// Arm the reconnect timer unless a socket is open or a timer is already
    /// pending.
    fn schedule_reconnect(self: &Arc<Self>) {
        let options = self.options();
        if !options.auto_reconnect || !self.wanted.load(Ordering::SeqCst) {
            return;
        }
        if lock(&self.link).is_some() {
            return;
        }

        let mut pending = lock(&self.reconnect);
        if pending.is_some() {
            return;
        }
        match ReconnectTimer::arm(Arc::downgrade(self), RECONNECT_INTERVAL) {
            Ok(timer) => {
                debug!("Reconnecting in {:?}", RECONNECT_INTERVAL);
                *pending = Some(timer);
            }
            Err(e) => warn!("Failed to arm reconnect timer: {}", e),
        }
    }

    /// Write raw protocol text under the send/close lock.
    fn send(self: &Arc<Self>, text: &str) -> Result<(), PvddError> {
        let error = {
            let mut guard = lock(&self.link);
            let Some(link) = guard.as_mut() else {
                debug!("Dropping command, not connected: {}", text.trim_end());
                return Err(PvddError::NotConnected);
            };

            match link.stream.write_all(text.as_bytes()).and_then(|()| link.stream.flush()) {
                Ok(()) => {
                    trace!("-> {}", text.trim_end());
                    return Ok(());
                }
                Err(e) => {
                    if let Some(link) = guard.take() {
                        link.close();
                    }
                    PvddError::from_write(e)
                }
            }
        };

        self.fail(error.clone());
        Err(error)
    }

    /// Called by a reader thread whose socket stopped delivering data.
    fn connection_lost(self: &Arc<Self>, generation: u64, error: PvddError) {
        let was_current = {
            let mut guard = lock(&self.link);
            if guard.as_ref().map(|link| link.generation) == Some(generation) {
                if let Some(link) = guard.take() {
                    link.close();
                }
                true
            } else {
                false
            }
        };

        if was_current {
            self.fail(error);
        } else {
            debug!("Reader for connection #{} stopped", generation);
        }
    }

    fn read_loop(inner: Arc<Inner>, mut stream: TcpStream, generation: u64, verbose: bool) {
        let mut lines = LineBuffer::new();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; READ_CHUNK_SIZE];

        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => {
                    lifecycle(verbose, format_args!("Disconnected from pvdd"));
                    inner.connection_lost(generation, PvddError::ConnectionClosed);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    inner.connection_lost(generation, PvddError::Read(Arc::new(e)));
                    return;
                }
            };

            for line in lines.push(&buf[..n]) {
                let text = match line.map_err(PvddError::from).and_then(|line| {
                    String::from_utf8(line).map_err(PvddError::from)
                }) {
                    Ok(text) => text,
                    Err(e) => {
                        inner.protocol_error(&mut decoder, e);
                        continue;
                    }
                };
                if !text.is_empty() {
                    inner.dispatch_line(&mut decoder, text, verbose);
                }
            }
        }
    }

    /// Drop the offending data and any open block, keep the socket.
    fn protocol_error(&self, decoder: &mut FrameDecoder, error: PvddError) {
        decoder.reset();
        warn!("Discarding data from pvdd: {}", error);
        self.bus.publish(&PvdEvent::Error(error));
    }

    fn dispatch_line(&self, decoder: &mut FrameDecoder, text: String, verbose: bool) {
        self.bus.publish(&PvdEvent::Data(text.clone()));

        let frame = match decoder.feed_line(&text) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                self.protocol_error(decoder, e.into());
                return;
            }
        };
        trace!("Frame: {:?}", frame);

        if let Some(event) = interpret(&frame) {
            if verbose {
                info!("pvdd event: {:?}", event);
            }
            self.bus.publish(&event);
        }
    }
}

/// A connection to the local pvdd daemon.
///
/// # Example
///
/// ```ignore
/// use pvdd_client::{listener, ConnectOptions, PvdEvent, PvddConnection, Signal};
///
/// let connection = PvddConnection::new();
/// connection.subscribe(Signal::PvdList, listener(|event| {
///     if let PvdEvent::PvdList(names) = event {
///         println!("PvDs: {:?}", names);
///     }
/// }));
/// connection.connect(ConnectOptions::default().auto_reconnect(true));
/// connection.get_list()?;
/// ```
pub struct PvddConnection {
    inner: Arc<Inner>,
}

impl Default for PvddConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl PvddConnection {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Connect to pvdd. Does nothing if a socket is already open.
    ///
    /// Failures are reported as `error` events, never returned; with
    /// `auto_reconnect` set, attempts repeat every second until one succeeds
    /// or [`disconnect`](Self::disconnect) is called.
    pub fn connect(&self, options: ConnectOptions) {
        if self.is_connected() {
            return;
        }
        *lock(&self.inner.options) = options;
        self.inner.wanted.store(true, Ordering::SeqCst);
        Inner::establish(&self.inner);
    }

    /// Close the socket and cancel any pending reconnection. Idempotent.
    pub fn disconnect(&self) {
        self.inner.wanted.store(false, Ordering::SeqCst);

        if let Some(timer) = lock(&self.inner.reconnect).take() {
            timer.cancel();
        }

        let link = lock(&self.inner.link).take();
        if let Some(link) = link {
            lifecycle(
                self.inner.options().verbose,
                format_args!("Closing pvdd connection #{}", link.generation),
            );
            link.close();
        }
        self.inner.set_state(ConnectionState::Disconnected);

        let reader = lock(&self.inner.reader).take();
        if let Some(handle) = reader {
            // A listener may call disconnect from the reader thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link).is_some()
    }

    /// The options of the last `connect` call.
    pub fn options(&self) -> ConnectOptions {
        self.inner.options()
    }

    /// The connection's signal registry.
    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Register a listener. See [`EventBus::subscribe`].
    pub fn subscribe(&self, signal: Signal, listener: Listener) -> bool {
        self.inner.bus.subscribe(signal, listener)
    }

    /// Remove a listener. See [`EventBus::unsubscribe`].
    pub fn unsubscribe(&self, signal: &Signal, listener: &Listener) -> bool {
        self.inner.bus.unsubscribe(signal, listener)
    }

    /// Listen to updates of one attribute, whatever the PvD.
    pub fn on_attribute(&self, attr_name: &str, listener: Listener) -> bool {
        self.subscribe(Signal::Attribute(attr_name.to_string()), listener)
    }

    /// Write raw protocol text. A trailing newline is not added.
    ///
    /// A failed write closes the socket, emits an `error` event and, with
    /// auto-reconnect, schedules a new attempt.
    pub fn write(&self, text: &str) -> Result<(), PvddError> {
        self.inner.send(text)
    }

    pub fn send(&self, command: &Command) -> Result<(), PvddError> {
        self.inner.send(&command.to_wire())
    }

    pub fn create_pvd(&self, pvd: &str) -> Result<(), PvddError> {
        self.send(&Command::CreatePvd { pvd: pvd.to_string() })
    }

    pub fn remove_pvd(&self, pvd: &str) -> Result<(), PvddError> {
        self.send(&Command::RemovePvd { pvd: pvd.to_string() })
    }

    /// Set one attribute inside a daemon transaction.
    pub fn set_attribute(&self, pvd: &str, name: &str, value: &Value) -> Result<(), PvddError> {
        self.send(&Command::SetAttribute {
            pvd: pvd.to_string(),
            name: name.to_string(),
            value: value.clone(),
        })
    }

    pub fn unset_attribute(&self, pvd: &str, name: &str) -> Result<(), PvddError> {
        self.send(&Command::UnsetAttribute {
            pvd: pvd.to_string(),
            name: name.to_string(),
        })
    }

    pub fn get_list(&self) -> Result<(), PvddError> {
        self.send(&Command::GetList)
    }

    pub fn get_attributes(&self, pvd: &str) -> Result<(), PvddError> {
        self.send(&Command::GetAttributes { pvd: pvd.to_string() })
    }

    pub fn get_attribute(&self, pvd: &str, name: &str) -> Result<(), PvddError> {
        self.send(&Command::GetAttribute {
            pvd: pvd.to_string(),
            name: name.to_string(),
        })
    }

    /// Ask for updates of `name` (or `*` for all attributes).
    pub fn subscribe_attribute(&self, name: &str) -> Result<(), PvddError> {
        self.send(&Command::Subscribe { name: name.to_string() })
    }

    pub fn unsubscribe_attribute(&self, name: &str) -> Result<(), PvddError> {
        self.send(&Command::Unsubscribe { name: name.to_string() })
    }

    /// Ask for `PVD_NEW_PVD`/`PVD_DEL_PVD`/`PVD_LIST` notifications.
    pub fn subscribe_notifications(&self) -> Result<(), PvddError> {
        self.send(&Command::SubscribeNotifications)
    }

    pub fn unsubscribe_notifications(&self) -> Result<(), PvddError> {
        self.send(&Command::UnsubscribeNotifications)
    }
}

impl Drop for PvddConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
