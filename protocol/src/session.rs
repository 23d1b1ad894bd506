//! Request/response coordination over a shared link.
//!
//! The protocol carries no transaction identifiers. Replies are matched to
//! requests purely by arrival order, so a [`Session`] keeps at most one request
//! in flight and a FIFO of placeholders for the replies it expects.
//! Measurement [`Data`] frames are not part of that FIFO and are fanned out
//! as [`Event::Data`] to all subscribers.
//!
//! A single reader task per session decodes incoming frames and hands each
//! reply to the placeholder at the head of the queue. A caller that gives up
//! leaves its placeholders behind as abandoned entries, so a reply that arrives
//! too late is absorbed by them instead of being bound to the next request.
//! The next request waits a bounded time for such late replies and then forgets
//! the abandoned entries before sending, so a reply the device never sends
//! cannot take the replies of later requests.

use crate::{
    Error, Result, Timeout,
    frame::FrameReader,
    packet::PacketType,
    request::Request,
    response::{Ack, Data, Response},
    transport::{self, Link, PortDescriptor, Transport},
};
use log::{debug, info, trace, warn};
use parking_lot::Mutex as SyncMutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    sync::{Mutex, Notify, broadcast, oneshot},
    task::JoinHandle,
    time::{self, Duration, Instant},
};

/// Timing and buffering parameters of a [`Session`].
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct SessionConfig {
    /// Maximum time to wait for each expected reply.
    pub reply_timeout: Duration,
    /// Maximum time between bytes once a frame has started.
    pub frame_timeout: Duration,
    /// Maximum time a request waits for late replies to an earlier timed-out request.
    pub late_reply_window: Duration,
    /// Number of events buffered per subscriber before the oldest are dropped.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(1000),
            frame_timeout: Duration::from_millis(100),
            late_reply_window: Duration::from_millis(1000),
            event_capacity: 64,
        }
    }
}

/// Notification broadcast to all subscribers of a [`Session`].
#[derive(PartialEq, Clone, Debug)]
pub enum Event {
    /// The session has been opened and its reader is running.
    Opened,
    /// The session has been closed, either by the host or because the link failed.
    Closed,
    /// A measurement frame has been received.
    Data(Data),
    /// A request has completed.
    RequestResult(Result<()>),
}

/// Replies received for a successful request.
#[derive(PartialEq, Clone, Debug)]
pub struct Reply {
    /// Acknowledgement of the request, always OK.
    pub ack: Ack,
    /// Typed response preceding the acknowledgement, for queries only.
    pub response: Option<Response>,
}

/// Placeholder for an expected reply.
#[derive(Debug)]
struct Pending {
    kind: PacketType,
    seq: u64,
    since: Instant,
    tx: oneshot::Sender<Response>,
}

impl Pending {
    fn push(queue: &mut VecDeque<Self>, kind: PacketType, seq: u64) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();

        queue.push_back(Self {
            kind,
            seq,
            since: Instant::now(),
            tx,
        });

        rx
    }

    /// Returns whether the waiting caller has given up.
    fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// State shared between a session handle and its reader task.
struct Shared {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    queue: SyncMutex<VecDeque<Pending>>,
    // Signalled whenever the queue may have shrunk
    settled: Notify,
    events: broadcast::Sender<Event>,
    open: AtomicBool,
}

impl Shared {
    fn new(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> (Arc<Self>, broadcast::Receiver<Event>) {
        let (events, rx) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(Self {
            config,
            transport,
            queue: SyncMutex::new(VecDeque::new()),
            settled: Notify::new(),
            events,
            open: AtomicBool::new(true),
        });

        (shared, rx)
    }

    fn emit(&self, evt: Event) {
        if self.events.send(evt).is_err() {
            trace!("Event dropped without subscribers");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Marks the session as closed. Only the first call has an effect.
    async fn shutdown(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        self.transport.close().await;

        // Wakes all waiting callers
        self.queue.lock().clear();
        self.settled.notify_waiters();
        self.emit(Event::Closed);
        info!("Session closed");
    }

    /// Hands a decoded response to its placeholder or to the subscribers.
    fn dispatch(&self, resp: Response) {
        let kind = resp.kind();
        let mut queue = self.queue.lock();
        let stale = self.config.reply_timeout * 2;

        queue.retain(|p| {
            let keep = !p.is_abandoned() || p.since.elapsed() <= stale;

            if !keep {
                debug!("Forgetting abandoned {} placeholder #{}", p.kind, p.seq);
            }

            keep
        });

        while let Some(head) = queue.front() {
            if head.kind == kind {
                let Some(head) = queue.pop_front() else {
                    break;
                };

                if head.is_abandoned() {
                    debug!("Discarding late {kind} reply to request #{}", head.seq);
                } else if head.tx.send(resp).is_err() {
                    debug!("Caller of request #{} left before {kind} reply", head.seq);
                } else {
                    debug!("Bound {kind} reply to request #{}", head.seq);
                }

                return;
            }

            let seq = head.seq;
            let rejected = kind == PacketType::Ack
                && queue
                    .get(1)
                    .is_some_and(|next| next.seq == seq && next.kind == PacketType::Ack);

            if rejected {
                // Device answered a query with its Ack only
                if let Some(skipped) = queue.pop_front() {
                    debug!("Skipping {} reply to rejected request #{seq}", skipped.kind);
                }

                continue;
            }

            if kind == PacketType::Data {
                break;
            }

            if !head.is_abandoned() {
                warn!("Discarding unexpected {kind} reply, awaiting {}", head.kind);

                return;
            }

            if let Some(dropped) = queue.pop_front() {
                debug!("Dropping abandoned {} placeholder #{seq}", dropped.kind);
            }
        }

        drop(queue);

        match resp {
            Response::Data(data) => {
                trace!("Received data at {} ms", data.timestamp);
                self.emit(Event::Data(data));
            }
            resp => warn!("Discarding unsolicited {resp:?}"),
        }
    }
}

/// Runs until the link fails or the task is aborted.
async fn read_loop(shared: Arc<Shared>, mut reader: FrameReader<Link>) {
    loop {
        match reader.next_response().await {
            Ok(resp) => {
                shared.dispatch(resp);
                shared.settled.notify_waiters();
            }
            Err(Error::AccessFailed(reason)) => {
                if shared.is_open() {
                    warn!("Link lost: {reason}");
                }

                shared.shutdown().await;

                break;
            }
            Err(err) => warn!("Discarding frame: {err}"),
        }
    }
}

/// An open connection to an odor display.
///
/// Requests are serialized: concurrent calls to [`Session::request`] queue up
/// and are sent one at a time.
///
/// Dropping a session stops its reader task without emitting [`Event::Closed`],
/// use [`Session::close`] for an orderly shutdown.
pub struct Session {
    shared: Arc<Shared>,
    // Guards the round trip and counts requests
    exclusive: Mutex<u64>,
    reader: SyncMutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Opens the transport described by `desc` and starts a session on it.
    ///
    /// The returned receiver observes [`Event::Opened`] first.
    pub async fn open(
        desc: &PortDescriptor,
        config: SessionConfig,
    ) -> Result<(Self, broadcast::Receiver<Event>)> {
        let transport = transport::open(desc).await?;

        Ok(Self::with_transport(transport, config))
    }

    /// Starts a session on an already opened transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> (Self, broadcast::Receiver<Event>) {
        let reader = FrameReader::new(Link(Arc::clone(&transport)), config.frame_timeout);
        let (shared, rx) = Shared::new(transport, config);
        let task = tokio::spawn(read_loop(Arc::clone(&shared), reader));

        shared.emit(Event::Opened);
        info!("Session opened");

        let session = Self {
            shared,
            exclusive: Mutex::new(0),
            reader: SyncMutex::new(Some(task)),
        };

        (session, rx)
    }

    /// Returns whether the session is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Returns the configuration the session was started with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Returns a new receiver for session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Stops the reader and closes the transport.
    ///
    /// [`Event::Closed`] is emitted once, subsequent calls have no effect.
    pub async fn close(&self) {
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }

        self.shared.shutdown().await;
    }

    /// Sends a request and waits for its replies.
    ///
    /// A non-OK acknowledgement is returned as [`Error::Device`].
    /// Every call emits an [`Event::RequestResult`].
    pub async fn request(&self, req: &Request) -> Result<Reply> {
        let res = self.round_trip(req).await;

        match &res {
            Ok(_) => debug!("{} request succeeded", req.kind()),
            Err(err) => debug!("{} request failed: {err}", req.kind()),
        }

        self.shared
            .emit(Event::RequestResult(res.as_ref().map(|_| ()).map_err(Clone::clone)));

        res
    }

    async fn round_trip(&self, req: &Request) -> Result<Reply> {
        let mut count = self.exclusive.lock().await;

        if !self.is_open() {
            return Err(Error::NotOpen);
        }

        let frame = req.to_packet()?.encode();

        self.await_late_replies().await;

        if !self.is_open() {
            return Err(Error::NotOpen);
        }

        *count += 1;

        let seq = *count;
        let expected = req.expected_response();
        let (typed_rx, ack_rx) = {
            let mut queue = self.shared.queue.lock();
            let typed = expected.map(|kind| Pending::push(&mut queue, kind, seq));
            let ack = Pending::push(&mut queue, PacketType::Ack, seq);

            (typed, ack)
        };

        debug!("Sending {} request #{seq}", req.kind());

        if let Err(err) = self.shared.transport.write(&frame).await {
            self.shared.queue.lock().retain(|p| p.seq != seq);

            return Err(Error::AccessFailed(err.to_string()));
        }

        let response = match (expected, typed_rx) {
            (Some(kind), Some(rx)) => self.wait_for(kind, rx).await?,
            _ => None,
        };
        let ack = match self.wait_for(PacketType::Ack, ack_rx).await? {
            Some(Response::Ack(ack)) => ack,
            // Only the reader's rejection rule skips placeholders, never an Ack
            _ => return Err(Error::NotOpen),
        };

        drop(count);

        if !ack.is_ok() {
            return Err(Error::Device(ack.code));
        }

        match (expected, &response) {
            (Some(kind), None) => Err(Error::invalid(format!(
                "{} acknowledged without {kind} reply",
                req.kind()
            ))),
            _ => Ok(Reply { ack, response }),
        }
    }

    /// Gives abandoned placeholders a bounded time to absorb their late replies,
    /// then forgets the rest.
    ///
    /// Called with the exclusive section held, so every queued placeholder
    /// belongs to an earlier request.
    async fn await_late_replies(&self) {
        let deadline = Instant::now() + self.shared.config.late_reply_window;

        loop {
            let settled = self.shared.settled.notified();

            if !self.shared.queue.lock().iter().any(Pending::is_abandoned) {
                return;
            }

            debug!("Waiting for late replies");

            if time::timeout_at(deadline, settled).await.is_err() {
                break;
            }
        }

        self.shared.queue.lock().retain(|p| {
            if p.is_abandoned() {
                debug!("Giving up on {} reply to request #{}", p.kind, p.seq);
            }

            !p.is_abandoned()
        });
    }

    /// Waits for a single placeholder.
    ///
    /// Returns `None` if the placeholder was skipped by the reader.
    async fn wait_for(
        &self,
        kind: PacketType,
        rx: oneshot::Receiver<Response>,
    ) -> Result<Option<Response>> {
        match time::timeout(self.shared.config.reply_timeout, rx).await {
            Ok(Ok(resp)) => Ok(Some(resp)),
            Ok(Err(_)) if !self.is_open() => Err(Error::NotOpen),
            Ok(Err(_)) => Ok(None),
            Err(_) => Err(Error::Timeout(Timeout::Reply(kind))),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().take() {
            task.abort();
        }
    }
}
