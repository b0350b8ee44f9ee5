//! Blocking request/reply calls on top of the pvdd event stream.
//!
//! pvdd replies carry no request identifier, so [`SyncClient`] matches replies
//! by key: the PvD name, plus the attribute name for single-attribute calls.
//! Requests go over a second, private connection so synchronous traffic never
//! interleaves with the subscriptions of the primary one.
//!
//! Two concurrent calls for the *same* key cannot be told apart; either may
//! take the other's reply. Callers that issue overlapping calls for one key
//! must tolerate that or serialize the calls themselves.
//!
//! ```ignore
//! let client = SyncClient::new(Some(Duration::from_millis(50)));
//! client.connect(ConnectOptions::default().auto_reconnect(true));
//!
//! if let Some(pvds) = client.get_sync_list(Some(Duration::from_millis(100))) {
//!     for pvd in pvds {
//!         println!("{}: {:?}", pvd, client.get_sync_attributes(&pvd, None));
//!     }
//! }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::config::ConnectOptions;
use crate::connection::PvddConnection;
use crate::error::PvddError;
use crate::events::{Listener, Propagation, Signal};
use crate::protocol::PvdEvent;

/// Replies are only kept while someone waits for them; past this many the
/// oldest unclaimed one is dropped.
const MAX_PENDING_REPLIES: usize = 32;

struct SlotState<T> {
    replies: VecDeque<T>,
    waiters: usize,
}

/// Unclaimed replies of one call kind, plus the condition its waiters sleep on.
struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                replies: VecDeque::new(),
                waiters: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a reply and wake every waiter of this kind. Nobody waiting means
    /// nobody asked, so the reply is dropped.
    fn fill(&self, value: T) {
        let mut state = self.lock();
        if state.waiters == 0 {
            return;
        }
        if state.replies.len() == MAX_PENDING_REPLIES {
            state.replies.pop_front();
        }
        state.replies.push_back(value);
        drop(state);
        self.ready.notify_all();
    }

    /// Send the request, then wait until `accept` claims a reply or the
    /// timeout budget is spent.
    ///
    /// The budget is one deadline for the whole call; spurious and
    /// non-matching wakeups only wait for what is left of it. A budget too
    /// large to represent as a deadline waits without one. Replies that
    /// `accept` rejects stay queued for the waiters they belong to.
    fn request<R>(
        &self,
        send: impl FnOnce() -> Result<(), PvddError>,
        timeout: Option<Duration>,
        accept: impl Fn(&T) -> Option<R>,
    ) -> Option<R> {
        let mut state = self.lock();
        if state.waiters == 0 {
            state.replies.clear();
        }

        if let Err(e) = send() {
            debug!("Synchronous request not sent: {}", e);
            return None;
        }
        state.waiters += 1;

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let result = loop {
            let claimed = state
                .replies
                .iter()
                .enumerate()
                .find_map(|(i, reply)| accept(reply).map(|r| (i, r)));
            if let Some((i, result)) = claimed {
                state.replies.remove(i);
                break Some(result);
            }

            state = match deadline {
                None => self
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break None;
                    }
                    self.ready
                        .wait_timeout(state, deadline - now)
                        .map(|(state, _)| state)
                        .unwrap_or_else(|e| e.into_inner().0)
                }
            };
        };

        state.waiters -= 1;
        if state.waiters == 0 {
            state.replies.clear();
        }
        result
    }
}

/// One slot per call kind, so calls of different kinds never contend.
struct SyncSlots {
    list: Slot<Vec<String>>,
    attributes: Slot<(String, Value)>,
    attribute: Slot<(String, String, Value)>,
}

impl SyncSlots {
    /// Subscribe the slots to the private connection's replies.
    fn attach(self: &Arc<Self>, connection: &PvddConnection) {
        let slots = Arc::clone(self);
        let on_list: Listener = Arc::new(move |event: &PvdEvent| {
            if let PvdEvent::PvdList(names) = event {
                slots.list.fill(names.clone());
            }
            Propagation::Handled
        });

        let slots = Arc::clone(self);
        let on_attributes: Listener = Arc::new(move |event: &PvdEvent| {
            if let PvdEvent::PvdAttributes { pvd, attributes } = event {
                slots.attributes.fill((pvd.clone(), attributes.clone()));
            }
            Propagation::Handled
        });

        let slots = Arc::clone(self);
        let on_attribute: Listener = Arc::new(move |event: &PvdEvent| {
            if let PvdEvent::PvdAttribute { pvd, name, value } = event {
                slots.attribute.fill((pvd.clone(), name.clone(), value.clone()));
            }
            Propagation::Handled
        });

        connection.subscribe(Signal::PvdList, on_list);
        connection.subscribe(Signal::PvdAttributes, on_attributes);
        connection.subscribe(Signal::PvdAttribute, on_attribute);
    }
}

/// A pvdd client offering both the event-driven API (through
/// [`connection`](Self::connection)) and blocking getters with timeouts.
pub struct SyncClient {
    connection: PvddConnection,
    sync: PvddConnection,
    slots: Arc<SyncSlots>,
    default_timeout: Option<Duration>,
}

impl SyncClient {
    /// Create a client. `default_timeout` applies to calls that pass no
    /// timeout of their own; `None` means wait indefinitely.
    pub fn new(default_timeout: Option<Duration>) -> Self {
        let slots = Arc::new(SyncSlots {
            list: Slot::new(),
            attributes: Slot::new(),
            attribute: Slot::new(),
        });
        let sync = PvddConnection::new();
        slots.attach(&sync);

        Self {
            connection: PvddConnection::new(),
            sync,
            slots,
            default_timeout,
        }
    }

    /// Open both the primary and the private connection.
    pub fn connect(&self, options: ConnectOptions) {
        self.connection.connect(options.clone());
        self.sync.connect(options);
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
        self.sync.disconnect();
    }

    /// The primary connection, for subscriptions and asynchronous commands.
    pub fn connection(&self) -> &PvddConnection {
        &self.connection
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub fn set_default_timeout(&mut self, timeout: Option<Duration>) {
        self.default_timeout = timeout;
    }

    fn budget(&self, timeout: Option<Duration>) -> Option<Duration> {
        timeout.or(self.default_timeout)
    }

    /// Fetch the PvD list. `None` on timeout.
    pub fn get_sync_list(&self, timeout: Option<Duration>) -> Option<Vec<String>> {
        self.slots.list.request(
            || self.sync.get_list(),
            self.budget(timeout),
            |names| Some(names.clone()),
        )
    }

    /// Fetch all attributes of `pvd`. `None` on timeout.
    pub fn get_sync_attributes(&self, pvd: &str, timeout: Option<Duration>) -> Option<Value> {
        self.slots.attributes.request(
            || self.sync.get_attributes(pvd),
            self.budget(timeout),
            |(rcvd_pvd, attributes)| (rcvd_pvd == pvd).then(|| attributes.clone()),
        )
    }

    /// Fetch attribute `name` of `pvd`. `None` on timeout.
    pub fn get_sync_attribute(
        &self,
        pvd: &str,
        name: &str,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        self.slots.attribute.request(
            || self.sync.get_attribute(pvd, name),
            self.budget(timeout),
            |(rcvd_pvd, rcvd_name, value)| {
                (rcvd_pvd == pvd && rcvd_name == name).then(|| value.clone())
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Barrier;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(100);

    #[test]
    fn test_slot_times_out_without_reply() {
        let slot: Slot<u32> = Slot::new();
        let start = Instant::now();
        let result = slot.request(|| Ok(()), Some(SHORT), |v| Some(*v));
        assert_eq!(result, None);
        assert!(start.elapsed() >= SHORT);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_slot_huge_timeout_waits_for_reply() {
        let slot = Arc::new(Slot::<u32>::new());
        let filler = Arc::clone(&slot);

        let result = slot.request(
            move || {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    filler.fill(3);
                });
                Ok(())
            },
            Some(Duration::MAX),
            |v| Some(*v),
        );
        assert_eq!(result, Some(3));
    }

    #[test]
    fn test_slot_returns_early_on_reply() {
        let slot = Arc::new(Slot::<u32>::new());
        let filler = Arc::clone(&slot);

        let start = Instant::now();
        let result = slot.request(
            move || {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    filler.fill(7);
                });
                Ok(())
            },
            Some(Duration::from_secs(5)),
            |v| Some(*v),
        );

        assert_eq!(result, Some(7));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_slot_skips_non_matching_reply() {
        let slot = Arc::new(Slot::<(String, Value)>::new());
        let filler = Arc::clone(&slot);

        let result = slot.request(
            move || {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    filler.fill(("other.example.com".into(), json!({"name": "other"})));
                    thread::sleep(Duration::from_millis(10));
                    filler.fill(("foo.example.com".into(), json!({"name": "foo"})));
                });
                Ok(())
            },
            Some(Duration::from_secs(5)),
            |(pvd, attrs)| (pvd == "foo.example.com").then(|| attrs.clone()),
        );

        assert_eq!(result, Some(json!({"name": "foo"})));
    }

    #[test]
    fn test_slot_back_to_back_replies_reach_both_waiters() {
        let slot: Slot<(String, u32)> = Slot::new();
        let barrier = Barrier::new(3);

        thread::scope(|scope| {
            let wait_for = |key: &'static str| {
                let slot = &slot;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    slot.request(
                        || Ok(()),
                        Some(Duration::from_secs(5)),
                        |(k, v)| (k == key).then_some(*v),
                    )
                })
            };
            let a = wait_for("a");
            let b = wait_for("b");

            barrier.wait();
            // Answer only once both requests are out, with no pause in between.
            while slot.lock().waiters < 2 {
                thread::sleep(Duration::from_millis(1));
            }
            slot.fill(("b".to_string(), 2));
            slot.fill(("a".to_string(), 1));

            assert_eq!(a.join().unwrap(), Some(1));
            assert_eq!(b.join().unwrap(), Some(2));
        });
        assert_eq!(slot.lock().replies.len(), 0);
    }

    #[test]
    fn test_slot_send_failure_returns_none_immediately() {
        let slot: Slot<u32> = Slot::new();
        let start = Instant::now();
        let result = slot.request(
            || Err(PvddError::NotConnected),
            Some(Duration::from_secs(5)),
            |v| Some(*v),
        );
        assert_eq!(result, None);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_slot_clears_stale_reply() {
        let slot: Slot<u32> = Slot::new();
        slot.fill(1);
        assert_eq!(slot.request(|| Ok(()), Some(SHORT), |v| Some(*v)), None);
    }

    #[test]
    fn test_unconnected_client_returns_none() {
        let client = SyncClient::new(Some(SHORT));
        assert_eq!(client.get_sync_list(None), None);
        assert_eq!(client.get_sync_attributes("foo.example.com", None), None);
        assert_eq!(client.get_sync_attribute("foo.example.com", "name", None), None);
    }

    #[test]
    fn test_timeout_resolution() {
        let mut client = SyncClient::new(Some(SHORT));
        assert_eq!(client.budget(None), Some(SHORT));
        assert_eq!(client.budget(Some(Duration::from_secs(1))), Some(Duration::from_secs(1)));

        client.set_default_timeout(None);
        assert_eq!(client.default_timeout(), None);
        assert_eq!(client.budget(None), None);
    }
}
