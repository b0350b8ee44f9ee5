//! pvd-monitor - watch the PvDs known to a local pvdd daemon.
//!
//! The default mode subscribes to notifications and every attribute, then
//! prints updates as they arrive. `--sync` instead runs one round of blocking
//! queries and exits.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pvdd_client::{
    ConnectOptions, Listener, Propagation, PvdEvent, PvddConnection, Signal, SyncClient,
};

#[derive(Parser, Debug)]
#[command(name = "pvd-monitor", version, about = "Watch PvDs and their attributes through pvdd")]
struct Args {
    /// pvdd port (defaults to $PVDD_PORT, then 10101)
    #[arg(short, long)]
    port: Option<u16>,

    /// Open a control connection
    #[arg(long)]
    control: bool,

    /// Query once with blocking calls instead of streaming updates
    #[arg(long)]
    sync: bool,

    /// Timeout for each blocking call, in milliseconds
    #[arg(long, default_value_t = 100)]
    timeout: u64,

    /// Stop streaming after this many seconds (0 runs until killed)
    #[arg(long, default_value_t = 0)]
    duration: u64,

    /// Print one JSON object per line
    #[arg(long)]
    json: bool,

    /// Log connection lifecycle at info level
    #[arg(short, long)]
    verbose: bool,
}

/// One printed observation.
#[derive(Serialize, Debug)]
#[serde(tag = "event", rename_all = "camelCase")]
enum Record<'a> {
    Connected,
    Error { message: String },
    PvdList { pvds: &'a [String] },
    NewPvd { pvd: &'a str },
    DelPvd { pvd: &'a str },
    PvdAttributes { pvd: &'a str, attributes: &'a Value },
    PvdAttribute { pvd: &'a str, name: &'a str, value: &'a Value },
}

impl<'a> Record<'a> {
    fn from_event(event: &'a PvdEvent) -> Option<Self> {
        Some(match event {
            PvdEvent::Connected => Record::Connected,
            PvdEvent::Error(e) => Record::Error {
                message: e.to_string(),
            },
            PvdEvent::PvdList(pvds) => Record::PvdList { pvds },
            PvdEvent::NewPvd(pvd) => Record::NewPvd { pvd },
            PvdEvent::DelPvd(pvd) => Record::DelPvd { pvd },
            PvdEvent::PvdAttributes { pvd, attributes } => {
                Record::PvdAttributes { pvd, attributes }
            }
            PvdEvent::PvdAttribute { pvd, name, value } => {
                Record::PvdAttribute { pvd, name, value }
            }
            PvdEvent::Data(_) | PvdEvent::NamedAttribute { .. } => return None,
        })
    }

    fn print(&self, json: bool) {
        if json {
            match serde_json::to_string(self) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to encode record: {}", e),
            }
            return;
        }

        match self {
            Record::Connected => println!("Connected"),
            Record::Error { message } => println!("Disconnection: {}", message),
            Record::PvdList { pvds } => println!("PvDs: {}", pvds.join(" ")),
            Record::NewPvd { pvd } => println!("New PvD: {}", pvd),
            Record::DelPvd { pvd } => println!("{} vanishing", pvd),
            Record::PvdAttributes { pvd, attributes } => {
                println!("Attributes for {}: {}", pvd, pretty(attributes))
            }
            Record::PvdAttribute { pvd, name, value } => {
                println!("Attribute {} for {}: {}", name, pvd, pretty(value))
            }
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// A listener that forwards every event to the main thread.
fn forward(tx: &Sender<PvdEvent>) -> Listener {
    let tx = Mutex::new(tx.clone());
    Arc::new(move |event: &PvdEvent| {
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(event.clone());
        }
        Propagation::Continue
    })
}

fn stream(args: &Args, options: ConnectOptions) -> Result<()> {
    let connection = PvddConnection::new();
    let (tx, rx) = mpsc::channel();

    for signal in [
        Signal::Connected,
        Signal::Error,
        Signal::PvdList,
        Signal::NewPvd,
        Signal::DelPvd,
        Signal::PvdAttributes,
        Signal::PvdAttribute,
    ] {
        connection.subscribe(signal, forward(&tx));
    }
    drop(tx);

    connection.connect(options);

    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    loop {
        let wait = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => break,
            },
            None => Duration::from_secs(1),
        };

        let event = match rx.recv_timeout(wait) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if let Some(record) = Record::from_event(&event) {
            record.print(args.json);
        }

        // Follow-up requests; failures are reported through the error signal.
        match &event {
            PvdEvent::Connected => {
                let _ = connection.subscribe_notifications();
                let _ = connection.subscribe_attribute("*");
                let _ = connection.get_list();
            }
            PvdEvent::PvdList(pvds) => {
                for pvd in pvds {
                    let _ = connection.get_attributes(pvd);
                }
            }
            PvdEvent::NewPvd(pvd) => {
                let _ = connection.get_attributes(pvd);
            }
            _ => {}
        }
    }

    connection.disconnect();
    Ok(())
}

fn query(args: &Args, options: ConnectOptions) -> Result<()> {
    let client = SyncClient::new(Some(Duration::from_millis(args.timeout)));
    client.connect(options);

    let pvds = client
        .get_sync_list(None)
        .context("pvdd did not answer the PvD list request")?;
    Record::PvdList { pvds: &pvds }.print(args.json);

    for pvd in &pvds {
        match client.get_sync_attributes(pvd, None) {
            Some(attributes) => Record::PvdAttributes {
                pvd,
                attributes: &attributes,
            }
            .print(args.json),
            None => warn!("No attributes received for {}", pvd),
        }
    }

    client.disconnect();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pvdd_client=info,pvd_monitor=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let mut options = ConnectOptions::default()
        .auto_reconnect(!args.sync)
        .control_connection(args.control)
        .verbose(args.verbose);
    if let Some(port) = args.port {
        options = options.with_port(port);
    }

    info!(
        "pvd-monitor v{} using port {}",
        env!("CARGO_PKG_VERSION"),
        options.resolve_port()
    );

    if args.sync {
        query(&args, options)
    } else {
        stream(&args, options)
    }
}
