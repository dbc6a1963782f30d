/*
[INPUT]:  Stream specs with callback bundles, connection events
[OUTPUT]: Stream-to-connection placement and per-subscription dispatch
[POS]:    WebSocket layer - subscription registry
[UPDATE]: When changing grouping, routing or replay behavior
*/

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::http::{BinanceError, Result};
use crate::ws::callbacks::{CallbackBundle, HandlerResult};
use crate::ws::connection::{
    ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionState, DialPlan, DialTarget,
    spawn_connection,
};
use crate::ws::message::{InboundMessage, StreamEvent, decode_frame};
use crate::ws::sink::ErrorSink;
use crate::ws::stream::{StreamSpec, combined_stream_url, single_stream_url};
use crate::ws::transport::Connector;

/// Stream cap per combined connection
pub const DEFAULT_COMBINED_CAPACITY: usize = 200;

const HANDLER_FAIL_LOG_LIMIT: usize = 10;
const UNROUTABLE_LOG_LIMIT: usize = 5;
const FRAME_SAMPLE_LIMIT: usize = 3;
const RAW_LOG_MAX_BYTES: usize = 1024;

static HANDLER_FAIL_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static UNROUTABLE_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static FRAME_SAMPLE_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Load of one open connection, as seen by a grouping policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLoad {
    pub connection_id: String,
    pub members: usize,
    pub combined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Existing(String),
    NewCombined,
    NewDedicated,
}

/// Decides which physical connection carries a new stream
pub trait GroupingPolicy: Send + Sync + fmt::Debug {
    fn place(&self, spec: &StreamSpec, connections: &[ConnectionLoad]) -> Placement;
}

/// Multiplex streams onto combined connections up to `capacity` each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombinedPolicy {
    pub capacity: usize,
}

impl Default for CombinedPolicy {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_COMBINED_CAPACITY,
        }
    }
}

impl GroupingPolicy for CombinedPolicy {
    fn place(&self, spec: &StreamSpec, connections: &[ConnectionLoad]) -> Placement {
        if spec.is_dedicated() {
            return Placement::NewDedicated;
        }
        connections
            .iter()
            .find(|load| load.combined && load.members < self.capacity.max(1))
            .map(|load| Placement::Existing(load.connection_id.clone()))
            .unwrap_or(Placement::NewCombined)
    }
}

/// One raw-stream connection per subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedicatedPolicy;

impl GroupingPolicy for DedicatedPolicy {
    fn place(&self, _spec: &StreamSpec, _connections: &[ConnectionLoad]) -> Placement {
        Placement::NewDedicated
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub ws_base_url: String,
    pub connection: ConnectionConfig,
    /// Bounded queue between each reader and its dispatch worker
    pub dispatch_capacity: usize,
}

struct Subscription {
    spec: StreamSpec,
    bundle: Arc<CallbackBundle>,
    connection_id: String,
    seq: u64,
    active: Arc<AtomicBool>,
    /// Set once onConnect fired; later connects fire onReconnect
    announced: bool,
}

struct ConnectionSlot {
    id: String,
    handle: ConnectionHandle,
    combined: bool,
    /// Stream ids in registration order
    members: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    subscriptions: HashMap<String, Subscription>,
    /// Wire name to stream id
    by_name: HashMap<String, String>,
    connections: Vec<ConnectionSlot>,
    next_seq: u64,
}

impl RegistryState {
    fn slot(&self, connection_id: &str) -> Option<&ConnectionSlot> {
        self.connections.iter().find(|slot| slot.id == connection_id)
    }
}

struct Shared {
    state: Mutex<RegistryState>,
    policy: Arc<dyn GroupingPolicy>,
    connector: Arc<dyn Connector>,
    config: RegistryConfig,
    errors: ErrorSink,
}

/// Maps stream ids to callback bundles and owns the connections carrying them
///
/// A single mutex guards the mapping. It is never held while a callback
/// runs, so callbacks may subscribe and unsubscribe freely.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    shared: Arc<Shared>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("policy", &self.shared.policy)
            .field("subscriptions", &state.subscriptions.len())
            .field("connections", &state.connections.len())
            .finish()
    }
}

/// Returned by `subscribe`; dropping it does not unsubscribe
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    registry: Weak<Shared>,
    stream_id: String,
    seq: u64,
}

impl SubscriptionHandle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Safe to call repeatedly and from inside a callback
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(shared) => shared.remove(&self.stream_id, Some(self.seq)),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        let Some(shared) = self.registry.upgrade() else {
            return false;
        };
        let state = shared.lock();
        state
            .subscriptions
            .get(&self.stream_id)
            .is_some_and(|sub| sub.seq == self.seq)
    }
}

impl SubscriptionRegistry {
    pub fn new(
        config: RegistryConfig,
        policy: Arc<dyn GroupingPolicy>,
        connector: Arc<dyn Connector>,
        errors: ErrorSink,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState::default()),
                policy,
                connector,
                config,
                errors,
            }),
        }
    }

    /// Register `spec` with `bundle`
    ///
    /// Registering the same spec with the same `Arc` again returns the
    /// existing handle. Any other reuse of the stream id is a conflict.
    /// Must be called inside a tokio runtime.
    pub fn subscribe(
        &self,
        spec: StreamSpec,
        bundle: Arc<CallbackBundle>,
    ) -> Result<SubscriptionHandle> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(BinanceError::Config(
                "subscribe needs a running tokio runtime".to_string(),
            ));
        }

        let mut guard = self.shared.lock();
        let state = &mut *guard;

        if let Some(existing) = state.subscriptions.get(spec.id()) {
            if existing.spec == spec && Arc::ptr_eq(&existing.bundle, &bundle) {
                return Ok(self.handle_for(spec.id(), existing.seq));
            }
            return Err(BinanceError::AlreadySubscribed {
                stream: spec.id().to_string(),
            });
        }
        if let Some(owner) = state.by_name.get(spec.name()) {
            return Err(BinanceError::AlreadySubscribed {
                stream: owner.clone(),
            });
        }

        let loads: Vec<ConnectionLoad> = state
            .connections
            .iter()
            .map(|slot| ConnectionLoad {
                connection_id: slot.id.clone(),
                members: slot.members.len(),
                combined: slot.combined,
            })
            .collect();
        let placement = self.shared.policy.place(&spec, &loads);

        let existing = match &placement {
            Placement::Existing(id) => state
                .connections
                .iter()
                .position(|slot| slot.id == *id && slot.combined),
            _ => None,
        };
        // Bad bases and names fail here rather than in the connection task.
        let base = self.shared.config.ws_base_url.as_str();
        match (existing, &placement) {
            (None, Placement::NewDedicated) => single_stream_url(base, spec.name())?,
            _ => combined_stream_url(base, &[spec.name().to_string()])?,
        };

        state.next_seq += 1;
        let seq = state.next_seq;
        let connection_id = match (existing, placement) {
            (Some(index), _) => {
                let slot = &mut state.connections[index];
                slot.members.push(spec.id().to_string());
                slot.handle.join(spec.name());
                slot.id.clone()
            }
            (None, Placement::NewDedicated) => self.open_connection(state, false, spec.id()),
            (None, _) => self.open_connection(state, true, spec.id()),
        };

        info!(
            stream = %spec.id(),
            connection_id = %connection_id,
            "stream subscribed"
        );
        state
            .by_name
            .insert(spec.name().to_string(), spec.id().to_string());
        state.subscriptions.insert(
            spec.id().to_string(),
            Subscription {
                spec: spec.clone(),
                bundle,
                connection_id,
                seq,
                active: Arc::new(AtomicBool::new(true)),
                announced: false,
            },
        );

        Ok(self.handle_for(spec.id(), seq))
    }

    /// Remove `stream_id`; returns false when it was not registered
    pub fn unsubscribe(&self, stream_id: &str) -> bool {
        self.shared.remove(stream_id, None)
    }

    /// Active stream ids in registration order
    pub fn active_streams(&self) -> Vec<String> {
        let state = self.shared.lock();
        let mut streams: Vec<(u64, String)> = state
            .subscriptions
            .iter()
            .map(|(id, sub)| (sub.seq, id.clone()))
            .collect();
        streams.sort_unstable();
        streams.into_iter().map(|(_, id)| id).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock().connections.len()
    }

    /// Connection carrying `stream_id`
    pub fn connection_for(&self, stream_id: &str) -> Option<ConnectionHandle> {
        let state = self.shared.lock();
        let sub = state.subscriptions.get(stream_id)?;
        state.slot(&sub.connection_id).map(|slot| slot.handle.clone())
    }

    pub fn connection_state(&self, stream_id: &str) -> Option<ConnectionState> {
        self.connection_for(stream_id).map(|handle| handle.state())
    }

    /// Drop every subscription and wait for the connections to close
    pub async fn close_all(&self) {
        let handles: Vec<ConnectionHandle> = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            for sub in state.subscriptions.values() {
                sub.active.store(false, Ordering::SeqCst);
            }
            state.subscriptions.clear();
            state.by_name.clear();
            state.connections.drain(..).map(|slot| slot.handle).collect()
        };

        for handle in &handles {
            handle.close();
        }
        for handle in &handles {
            handle.wait_closed().await;
        }
        if !handles.is_empty() {
            info!(connections = handles.len(), "all stream connections closed");
        }
    }

    fn handle_for(&self, stream_id: &str, seq: u64) -> SubscriptionHandle {
        SubscriptionHandle {
            registry: Arc::downgrade(&self.shared),
            stream_id: stream_id.to_string(),
            seq,
        }
    }

    fn open_connection(&self, state: &mut RegistryState, combined: bool, first_member: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::channel(self.shared.config.dispatch_capacity.max(1));
        let target = Arc::new(RegistryDialTarget {
            registry: Arc::downgrade(&self.shared),
            connection_id: id.clone(),
        });

        let handle = spawn_connection(
            id.clone(),
            target,
            self.shared.connector.clone(),
            self.shared.config.connection.clone(),
            events_tx,
            self.shared.errors.clone(),
        );
        tokio::spawn(dispatch_loop(
            Arc::downgrade(&self.shared),
            id.clone(),
            events_rx,
        ));

        debug!(connection_id = %id, combined, "stream connection opened");
        state.connections.push(ConnectionSlot {
            id: id.clone(),
            handle,
            combined,
            members: vec![first_member.to_string()],
        });
        id
    }
}

/// Dispatch target resolved for one frame
struct Target {
    stream_id: String,
    bundle: Arc<CallbackBundle>,
    active: Arc<AtomicBool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, stream_id: &str, seq: Option<u64>) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;

        match state.subscriptions.get(stream_id) {
            Some(sub) if seq.is_none_or(|seq| seq == sub.seq) => {}
            _ => return false,
        }
        let Some(sub) = state.subscriptions.remove(stream_id) else {
            return false;
        };
        sub.active.store(false, Ordering::SeqCst);
        state.by_name.remove(sub.spec.name());

        if let Some(index) = state
            .connections
            .iter()
            .position(|slot| slot.id == sub.connection_id)
        {
            let emptied = {
                let slot = &mut state.connections[index];
                slot.members.retain(|member| member != stream_id);
                slot.members.is_empty()
            };
            if emptied {
                let slot = state.connections.remove(index);
                slot.handle.close();
            } else {
                state.connections[index].handle.leave(sub.spec.name());
            }
        }

        info!(stream = %stream_id, connection_id = %sub.connection_id, "stream unsubscribed");
        true
    }

    /// Fire onConnect or onReconnect for `streams`, in the order given
    ///
    /// With `joined` set only members not yet announced fire: a stream
    /// replayed by the dial that also sits behind a queued join stays at
    /// one onConnect.
    fn announce(&self, connection_id: &str, streams: &[String], joined: bool) {
        let mut targets = Vec::with_capacity(streams.len());
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            for name in streams {
                let Some(id) = state.by_name.get(name) else {
                    continue;
                };
                let Some(sub) = state.subscriptions.get_mut(id) else {
                    continue;
                };
                if sub.connection_id != connection_id || (joined && sub.announced) {
                    continue;
                }
                let reconnect = std::mem::replace(&mut sub.announced, true);
                targets.push((
                    Target {
                        stream_id: id.clone(),
                        bundle: sub.bundle.clone(),
                        active: sub.active.clone(),
                    },
                    reconnect,
                ));
            }
        }

        for (target, reconnect) in targets {
            if !target.active.load(Ordering::SeqCst) {
                continue;
            }
            let stream_id = target.stream_id.as_str();
            run_guarded(stream_id, &target.bundle, || {
                if reconnect {
                    target.bundle.fire_reconnect(stream_id);
                } else {
                    target.bundle.fire_connect(stream_id);
                }
                Ok(())
            });
        }
    }

    fn notify_disconnect(&self, connection_id: &str, reason: &str) {
        for target in self.members_of(connection_id) {
            if !target.active.load(Ordering::SeqCst) {
                continue;
            }
            let stream_id = target.stream_id.as_str();
            run_guarded(stream_id, &target.bundle, || {
                target.bundle.fire_disconnect(stream_id, reason);
                Ok(())
            });
        }
    }

    fn members_of(&self, connection_id: &str) -> Vec<Target> {
        let state = self.lock();
        let Some(slot) = state.slot(connection_id) else {
            return Vec::new();
        };
        slot.members
            .iter()
            .filter_map(|id| {
                let sub = state.subscriptions.get(id)?;
                Some(Target {
                    stream_id: id.clone(),
                    bundle: sub.bundle.clone(),
                    active: sub.active.clone(),
                })
            })
            .collect()
    }

    fn route(&self, connection_id: &str, text: &str) {
        log_frame_sample(connection_id, text);

        let message = match decode_frame(text) {
            Ok(message) => message,
            Err(err) => {
                self.route_decode_error(connection_id, err);
                return;
            }
        };

        match message {
            InboundMessage::Control(reply) => match reply.error {
                Some(error) => self.errors.report(BinanceError::Api {
                    code: error.code,
                    message: match reply.id {
                        Some(id) => format!("{} (request {id})", error.msg),
                        None => error.msg,
                    },
                }),
                None => debug!(connection_id, request_id = ?reply.id, "ws control reply"),
            },
            InboundMessage::Event { stream, event } => {
                match self.resolve(connection_id, stream.as_deref(), Some(&event)) {
                    Some(target) => deliver(&target, &event),
                    None => {
                        let stream = stream.or_else(|| event.route_key());
                        log_unroutable(connection_id, stream.as_deref());
                        self.errors.report(BinanceError::UnroutableFrame { stream });
                    }
                }
            }
        }
    }

    fn route_decode_error(&self, connection_id: &str, err: BinanceError) {
        let stream = match &err {
            BinanceError::Decode { stream, .. } => stream.clone(),
            _ => None,
        };
        match self.resolve(connection_id, stream.as_deref(), None) {
            Some(target) if target.active.load(Ordering::SeqCst) => {
                let delivered = panic::catch_unwind(AssertUnwindSafe(|| target.bundle.fire_error(&err)))
                    .unwrap_or(true);
                if !delivered {
                    debug!(stream = %target.stream_id, error = %err, "decode error without handler");
                }
            }
            _ => self.errors.report(err),
        }
    }

    /// Owner of a frame on `connection_id`
    ///
    /// The envelope name wins. Bare frames belong to the sole member of a
    /// dedicated connection, or are matched by symbol and kind on a combined one.
    fn resolve(
        &self,
        connection_id: &str,
        stream: Option<&str>,
        event: Option<&StreamEvent>,
    ) -> Option<Target> {
        let state = self.lock();
        let slot = state.slot(connection_id)?;
        let stream_id = match stream {
            Some(name) => state.by_name.get(name).cloned(),
            None if !slot.combined => slot.members.first().cloned(),
            None => {
                let key = event?.route_key()?;
                slot.members
                    .iter()
                    .find(|id| {
                        state
                            .subscriptions
                            .get(*id)
                            .is_some_and(|sub| matches_route(sub.spec.name(), &key))
                    })
                    .cloned()
            }
        }?;

        let sub = state.subscriptions.get(&stream_id)?;
        if sub.connection_id != connection_id {
            return None;
        }
        Some(Target {
            stream_id,
            bundle: sub.bundle.clone(),
            active: sub.active.clone(),
        })
    }

    /// Drop every subscription of a connection that gave up for good
    fn fail_connection(&self, connection_id: &str, err: BinanceError) {
        let removed: Option<Vec<Target>> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state
                .connections
                .iter()
                .position(|slot| slot.id == connection_id)
                .map(|index| {
                    let slot = state.connections.remove(index);
                    slot.members
                        .iter()
                        .filter_map(|id| {
                            let sub = state.subscriptions.remove(id)?;
                            state.by_name.remove(sub.spec.name());
                            sub.active.store(false, Ordering::SeqCst);
                            Some(Target {
                                stream_id: id.clone(),
                                bundle: sub.bundle,
                                active: sub.active,
                            })
                        })
                        .collect()
                })
        };
        let Some(removed) = removed else {
            self.errors.report(err);
            return;
        };

        warn!(
            connection_id,
            streams = removed.len(),
            error = %err,
            "stream connection failed permanently"
        );
        for target in &removed {
            let copy = duplicate_error(&err);
            let _ = panic::catch_unwind(AssertUnwindSafe(|| target.bundle.fire_error(&copy)));
        }
        self.errors.report(err);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in state.connections.drain(..) {
            slot.handle.close();
        }
    }
}

struct RegistryDialTarget {
    registry: Weak<Shared>,
    connection_id: String,
}

impl DialTarget for RegistryDialTarget {
    fn plan(&self) -> Result<Option<DialPlan>> {
        let Some(shared) = self.registry.upgrade() else {
            return Ok(None);
        };
        let state = shared.lock();
        let Some(slot) = state.slot(&self.connection_id) else {
            return Ok(None);
        };
        let streams: Vec<String> = slot
            .members
            .iter()
            .filter_map(|id| state.subscriptions.get(id))
            .map(|sub| sub.spec.name().to_string())
            .collect();

        let base = shared.config.ws_base_url.as_str();
        let url = match streams.first() {
            None => return Ok(None),
            Some(name) if !slot.combined => single_stream_url(base, name)?,
            Some(_) => combined_stream_url(base, &streams)?,
        };
        Ok(Some(DialPlan { url, streams }))
    }
}

/// One worker per connection; events are handled strictly in arrival order
async fn dispatch_loop(
    registry: Weak<Shared>,
    connection_id: String,
    mut events: mpsc::Receiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = registry.upgrade() else {
            break;
        };
        match event {
            ConnectionEvent::Connected { reconnect, streams } => {
                debug!(connection_id = %connection_id, reconnect, streams = streams.len(), "replaying subscriptions");
                shared.announce(&connection_id, &streams, false);
            }
            ConnectionEvent::Joined { stream } => {
                shared.announce(&connection_id, std::slice::from_ref(&stream), true);
            }
            ConnectionEvent::Disconnected { reason } => {
                shared.notify_disconnect(&connection_id, &reason);
            }
            ConnectionEvent::Frame(text) => shared.route(&connection_id, &text),
            ConnectionEvent::Fatal(err) => shared.fail_connection(&connection_id, err),
            ConnectionEvent::Closed => break,
        }
    }
    debug!(connection_id = %connection_id, "dispatch worker stopped");
}

fn deliver(target: &Target, event: &StreamEvent) {
    if !target.active.load(Ordering::SeqCst) {
        return;
    }
    if !target.bundle.handles(event.kind()) {
        return;
    }
    run_guarded(&target.stream_id, &target.bundle, || target.bundle.dispatch(event));
}

/// Run a callback, turning errors and panics into `onError` for that bundle only
fn run_guarded(stream_id: &str, bundle: &CallbackBundle, call: impl FnOnce() -> HandlerResult) {
    let message = match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };

    log_handler_failure(stream_id, &message);
    let error = BinanceError::Handler {
        stream: stream_id.to_string(),
        message,
    };
    let _ = panic::catch_unwind(AssertUnwindSafe(|| bundle.fire_error(&error)));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

/// `btcusdt@depth` also owns `btcusdt@depth@100ms`, not `btcusdt@depth10`
fn matches_route(name: &str, key: &str) -> bool {
    match name.strip_prefix(key) {
        Some(rest) => rest.is_empty() || rest.starts_with('@'),
        None => false,
    }
}

fn duplicate_error(err: &BinanceError) -> BinanceError {
    match err {
        BinanceError::ReconnectExhausted {
            attempts,
            last_error,
        } => BinanceError::ReconnectExhausted {
            attempts: *attempts,
            last_error: last_error.clone(),
        },
        BinanceError::Config(message) => BinanceError::Config(message.clone()),
        other => BinanceError::WebSocket(other.to_string()),
    }
}

fn log_handler_failure(stream_id: &str, message: &str) {
    let count = HANDLER_FAIL_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < HANDLER_FAIL_LOG_LIMIT {
        warn!(
            sample_index = count + 1,
            sample_limit = HANDLER_FAIL_LOG_LIMIT,
            stream = stream_id,
            error = message,
            "stream handler failed"
        );
    }
}

fn log_unroutable(connection_id: &str, stream: Option<&str>) {
    let count = UNROUTABLE_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < UNROUTABLE_LOG_LIMIT {
        warn!(
            sample_index = count + 1,
            sample_limit = UNROUTABLE_LOG_LIMIT,
            connection_id,
            stream = ?stream,
            "ws frame has no subscription"
        );
    }
}

fn log_frame_sample(connection_id: &str, raw: &str) {
    let count = FRAME_SAMPLE_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < FRAME_SAMPLE_LIMIT {
        debug!(
            sample_index = count + 1,
            sample_limit = FRAME_SAMPLE_LIMIT,
            connection_id,
            bytes = raw.len(),
            message = %truncate_for_log(raw, RAW_LOG_MAX_BYTES),
            "ws frame sample"
        );
    }
}

fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::transport::MemoryConnector;
    use rstest::rstest;
    use std::time::Duration;

    fn load(id: &str, members: usize, combined: bool) -> ConnectionLoad {
        ConnectionLoad {
            connection_id: id.to_string(),
            members,
            combined,
        }
    }

    #[rstest]
    #[case(StreamSpec::trade("btcusdt"), vec![], Placement::NewCombined)]
    #[case(StreamSpec::trade("btcusdt"), vec![load("a", 1, true)], Placement::Existing("a".to_string()))]
    #[case(StreamSpec::trade("btcusdt"), vec![load("a", 2, true)], Placement::NewCombined)]
    #[case(StreamSpec::trade("btcusdt"), vec![load("d", 1, false)], Placement::NewCombined)]
    #[case(StreamSpec::user_data("key"), vec![load("a", 1, true)], Placement::NewDedicated)]
    fn test_combined_policy_placement(
        #[case] spec: StreamSpec,
        #[case] loads: Vec<ConnectionLoad>,
        #[case] expected: Placement,
    ) {
        let policy = CombinedPolicy { capacity: 2 };
        assert_eq!(policy.place(&spec, &loads), expected);
    }

    #[test]
    fn test_dedicated_policy_always_opens() {
        let loads = vec![load("a", 1, true)];
        assert_eq!(
            DedicatedPolicy.place(&StreamSpec::trade("x"), &loads),
            Placement::NewDedicated
        );
    }

    #[rstest]
    #[case("btcusdt@depth", "btcusdt@depth", true)]
    #[case("btcusdt@depth@100ms", "btcusdt@depth", true)]
    #[case("btcusdt@depth10", "btcusdt@depth", false)]
    #[case("x@kline_1m", "x@kline_1m", true)]
    #[case("x@kline_1m", "x@kline_5m", false)]
    fn test_route_matching(#[case] name: &str, #[case] key: &str, #[case] expected: bool) {
        assert_eq!(matches_route(name, key), expected);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_for_log("abc", 8), "abc");
        assert_eq!(truncate_for_log("ééé", 3), "é...");
    }

    fn registry(connector: &MemoryConnector, policy: Arc<dyn GroupingPolicy>) -> SubscriptionRegistry {
        registry_at(connector, policy, "wss://stream.test")
    }

    fn registry_at(
        connector: &MemoryConnector,
        policy: Arc<dyn GroupingPolicy>,
        base: &str,
    ) -> SubscriptionRegistry {
        let (errors, _rx) = ErrorSink::channel(8);
        SubscriptionRegistry::new(
            RegistryConfig {
                ws_base_url: base.to_string(),
                connection: ConnectionConfig {
                    ping_interval: None,
                    idle_timeout: Duration::from_secs(3600),
                    ..ConnectionConfig::default()
                },
                dispatch_capacity: 16,
            },
            policy,
            Arc::new(connector.clone()),
            errors,
        )
    }

    #[test]
    fn test_subscribe_outside_runtime_is_config_error() {
        let connector = MemoryConnector::new();
        let registry = registry(&connector, Arc::new(CombinedPolicy::default()));
        let result = registry.subscribe(StreamSpec::trade("x"), CallbackBundle::builder().build());
        assert!(matches!(result, Err(BinanceError::Config(_))));
    }

    #[rstest]
    #[case(Arc::new(CombinedPolicy::default()) as Arc<dyn GroupingPolicy>)]
    #[case(Arc::new(DedicatedPolicy) as Arc<dyn GroupingPolicy>)]
    #[tokio::test(start_paused = true)]
    async fn test_subscribe_rejects_relative_base(#[case] policy: Arc<dyn GroupingPolicy>) {
        let connector = MemoryConnector::new();
        let registry = registry_at(&connector, policy, "stream.binance.com");
        let result = registry.subscribe(StreamSpec::trade("x"), CallbackBundle::builder().build());

        assert!(matches!(result, Err(BinanceError::UrlParse(_))));
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.active_streams().is_empty());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(connector.dialed_urls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_combined_streams_share_one_url() {
        let connector = MemoryConnector::new();
        let registry = registry(&connector, Arc::new(CombinedPolicy::default()));
        let bundle = CallbackBundle::builder().build();
        registry.subscribe("a@trade".into(), bundle.clone()).unwrap();
        registry.subscribe("b@trade".into(), bundle).unwrap();

        let session = connector.wait_for_sessions(1).await;
        assert_eq!(session.url().as_str(), "wss://stream.test/stream?streams=a@trade/b@trade");
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.active_streams(), vec!["a@trade", "b@trade"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedicated_policy_uses_raw_urls() {
        let connector = MemoryConnector::new();
        let registry = registry(&connector, Arc::new(DedicatedPolicy));
        let bundle = CallbackBundle::builder().build();
        registry.subscribe("a@trade".into(), bundle.clone()).unwrap();
        registry.subscribe("b@trade".into(), bundle).unwrap();

        connector.wait_for_sessions(2).await;
        let mut urls = connector.dialed_urls();
        urls.sort();
        assert_eq!(
            urls,
            vec!["wss://stream.test/ws/a@trade", "wss://stream.test/ws/b@trade"]
        );
        assert_eq!(registry.connection_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_idempotent_and_conflicting() {
        let connector = MemoryConnector::new();
        let registry = registry(&connector, Arc::new(CombinedPolicy::default()));
        let bundle = CallbackBundle::builder().build();

        let first = registry.subscribe("a@trade".into(), bundle.clone()).unwrap();
        let again = registry.subscribe("a@trade".into(), bundle).unwrap();
        assert_eq!(first.stream_id(), again.stream_id());
        assert_eq!(registry.active_streams().len(), 1);

        let other = CallbackBundle::builder().build();
        assert!(matches!(
            registry.subscribe("a@trade".into(), other),
            Err(BinanceError::AlreadySubscribed { stream }) if stream == "a@trade"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_last_member_closes_connection() {
        let connector = MemoryConnector::new();
        let registry = registry(&connector, Arc::new(CombinedPolicy::default()));
        let handle = registry
            .subscribe("a@trade".into(), CallbackBundle::builder().build())
            .unwrap();
        connector.wait_for_sessions(1).await;
        let connection = registry.connection_for("a@trade").unwrap();

        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        assert!(!handle.is_active());
        connection.wait_closed().await;
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.active_streams().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_handle_does_not_remove_new_subscription() {
        let connector = MemoryConnector::new();
        let registry = registry(&connector, Arc::new(CombinedPolicy::default()));
        let bundle = CallbackBundle::builder().build();
        let old = registry.subscribe("a@trade".into(), bundle.clone()).unwrap();
        assert!(old.unsubscribe());

        let fresh = registry.subscribe("a@trade".into(), bundle).unwrap();
        assert!(!old.unsubscribe());
        assert!(fresh.is_active());
    }
}
