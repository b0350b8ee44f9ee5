//! A scripted stand-in for pvdd, listening on an ephemeral localhost port.
//!
//! Every accepted connection runs the test's handler on its own thread with a
//! [`Session`]. Lines the client sends are recorded so tests can assert on
//! the exact wire text.

#![allow(dead_code)]

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pvdd_client::{listener, PvdEvent, PvddConnection, Signal};

/// Generous upper bound for anything that should happen "promptly".
pub const WAIT: Duration = Duration::from_secs(3);

/// One accepted client connection.
pub struct Session {
    /// Zero-based accept order.
    pub index: usize,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    received: Arc<Mutex<Vec<String>>>,
}

impl Session {
    /// Next line from the client without its newline; `None` once it hangs up.
    pub fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                self.received.lock().unwrap().push(line.clone());
                Some(line)
            }
        }
    }

    /// Write raw text as-is.
    pub fn send(&mut self, text: &str) -> io::Result<()> {
        self.writer.write_all(text.as_bytes())?;
        self.writer.flush()
    }

    /// Write raw text in pieces of `size` bytes with a short pause between
    /// them, so the client sees several reads.
    pub fn send_chunked(&mut self, text: &str, size: usize) -> io::Result<()> {
        for chunk in text.as_bytes().chunks(size) {
            self.writer.write_all(chunk)?;
            self.writer.flush()?;
            thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    /// Close both directions; the client reads zero bytes.
    pub fn close(self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

pub struct FakePvdd {
    port: u16,
    received: Arc<Mutex<Vec<String>>>,
    accepted: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FakePvdd {
    pub fn spawn<F>(handler: F) -> Self
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind fake pvdd");
        listener
            .set_nonblocking(true)
            .expect("fake pvdd nonblocking");
        let port = listener.local_addr().expect("local addr").port();

        let received = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(handler);

        let handle = {
            let received = Arc::clone(&received);
            let accepted = Arc::clone(&accepted);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            stream.set_nonblocking(false).expect("blocking session");
                            let session = Session {
                                index: accepted.fetch_add(1, Ordering::SeqCst),
                                reader: BufReader::new(stream.try_clone().expect("clone stream")),
                                writer: stream,
                                received: Arc::clone(&received),
                            };
                            let handler = Arc::clone(&handler);
                            thread::spawn(move || handler(session));
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(10));
                        }
                        Err(_) => return,
                    }
                }
            })
        };

        Self {
            port,
            received,
            accepted,
            stop,
            handle: Some(handle),
        }
    }

    /// A daemon that answers each received line through `reply`, until the
    /// client hangs up.
    pub fn answering<F>(reply: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self::spawn(move |mut session| {
            while let Some(line) = session.read_line() {
                if let Some(answer) = reply(&line) {
                    if session.send(&answer).is_err() {
                        return;
                    }
                }
            }
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Poll until `count` connections have been accepted or [`WAIT`] elapses.
    pub fn wait_for_accepted(&self, count: usize) -> usize {
        let deadline = Instant::now() + WAIT;
        while self.accepted() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        self.accepted()
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Poll until `count` lines have been received or [`WAIT`] elapses.
    pub fn wait_for_lines(&self, count: usize) -> Vec<String> {
        let deadline = Instant::now() + WAIT;
        loop {
            let lines = self.received();
            if lines.len() >= count || Instant::now() >= deadline {
                return lines;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for FakePvdd {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    listener.local_addr().expect("local addr").port()
}

/// Route every event of `signal` into a channel.
pub fn collect(connection: &PvddConnection, signal: Signal) -> Receiver<PvdEvent> {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    connection.subscribe(
        signal,
        listener(move |event| {
            let _ = tx.lock().unwrap().send(event.clone());
        }),
    );
    rx
}

/// Route events of several signals into one channel, in delivery order.
pub fn collect_all(connection: &PvddConnection, signals: &[Signal]) -> Receiver<PvdEvent> {
    let (tx, rx) = mpsc::channel();
    let tx = Arc::new(Mutex::new(tx));
    for signal in signals {
        let tx = Arc::clone(&tx);
        connection.subscribe(
            signal.clone(),
            listener(move |event| {
                let _ = tx.lock().unwrap().send(event.clone());
            }),
        );
    }
    rx
}
