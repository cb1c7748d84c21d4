//! One supervised connection task per relay endpoint.
//!
//! The task owns its socket and outbound queue. It walks
//! `Connecting -> Open -> Backoff -> Connecting ...`, flushing queued
//! publishes and re-issuing live subscriptions every time it reaches `Open`,
//! and parks in `Exhausted` after too many consecutive failures until reset.

use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{Error, Result},
    event::Event,
    filter::Filter,
    message::{ClientMessage, RelayMessage},
};

/// Which directions a relay is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    pub read: bool,
    pub write: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    Backoff,
    /// Gave up after `max_attempts` consecutive failures; waits for a reset.
    Exhausted,
}

/// Snapshot of a link's state and consecutive failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub attempts: u32,
}

/// Exponential reconnect policy: `base_delay * 2^attempt`, at most
/// `max_attempts` consecutive tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 8,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt number `attempt` (zero based), or
    /// `None` once the cap is reached.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }
}

/// Publishes a link buffers while it is not open, unless configured.
pub const DEFAULT_MAX_QUEUE: usize = 1024;

/// Per-link connection settings.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Upper bound for TCP + WebSocket handshake.
    pub connect_timeout: Duration,
    pub backoff: Backoff,
    /// Optional SOCKS5 proxy (host:port), e.g. Tor.
    pub proxy: Option<String>,
    /// Queued publishes kept while disconnected; the oldest is dropped first.
    pub max_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
            proxy: None,
            max_queue: DEFAULT_MAX_QUEUE,
        }
    }
}

/// Receiver side of a link: the pool's subscription table.
pub trait Inbound: Send + Sync + 'static {
    /// Subscriptions to re-issue when the link (re)opens.
    fn live_subscriptions(&self) -> Vec<(String, Vec<Filter>)>;
    /// Route one decoded frame from `relay`.
    fn deliver(&self, relay: &str, msg: RelayMessage);
}

#[derive(Debug)]
pub(crate) enum LinkCommand {
    Publish(Event),
    Subscribe { id: String, filters: Vec<Filter> },
    Close(String),
    Reset,
    Shutdown,
}

/// Handle to a running link task.
pub struct RelayLink {
    url: String,
    options: RelayOptions,
    commands: mpsc::UnboundedSender<LinkCommand>,
    status: watch::Receiver<LinkStatus>,
    task: JoinHandle<()>,
}

impl RelayLink {
    /// Spawn the link task on the current runtime. It starts connecting
    /// immediately.
    pub fn spawn(
        url: impl Into<String>,
        options: RelayOptions,
        config: LinkConfig,
        inbound: Arc<dyn Inbound>,
    ) -> Self {
        let url = url.into();
        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(LinkStatus {
            state: LinkState::Disconnected,
            attempts: 0,
        });
        let worker = Worker {
            url: url.clone(),
            options,
            config,
            inbound,
            commands: rx,
            status: status_tx,
            queue: VecDeque::new(),
            attempts: 0,
        };
        let task = tokio::spawn(worker.run());
        Self {
            url,
            options,
            commands,
            status,
            task,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options(&self) -> RelayOptions {
        self.options
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Wait until the link reports `state`, up to `limit`.
    pub async fn wait_for(&self, state: LinkState, limit: Duration) -> bool {
        let mut rx = self.status.clone();
        tokio::time::timeout(limit, rx.wait_for(|s| s.state == state))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Leave `Exhausted` (or cut a backoff short) and reconnect now.
    pub fn reset(&self) {
        self.send(LinkCommand::Reset);
    }

    pub fn shutdown(&self) {
        self.send(LinkCommand::Shutdown);
    }

    pub(crate) fn send(&self, cmd: LinkCommand) -> bool {
        self.commands.send(cmd).is_ok()
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            let _ = self.commands.send(LinkCommand::Shutdown);
        }
    }
}

/// Why the worker stopped waiting.
enum Wake {
    Ready,
    Reset,
    Shutdown,
}

struct Worker {
    url: String,
    options: RelayOptions,
    config: LinkConfig,
    inbound: Arc<dyn Inbound>,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    status: watch::Sender<LinkStatus>,
    queue: VecDeque<Event>,
    attempts: u32,
}

type Socket = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

impl Worker {
    async fn run(mut self) {
        loop {
            self.set_state(LinkState::Connecting);
            let (url, proxy) = (self.url.clone(), self.config.proxy.clone());
            let connect = tokio::time::timeout(self.config.connect_timeout, async move {
                connect_ws(&url, proxy.as_deref()).await
            });
            let (wake, socket) = self.idle_until(connect).await;
            match wake {
                Wake::Shutdown => break,
                Wake::Reset => {
                    self.attempts = 0;
                    continue;
                }
                Wake::Ready => {}
            }
            match socket {
                Some(Ok(Ok(ws))) => {
                    self.attempts = 0;
                    self.set_state(LinkState::Open);
                    info!(relay = %self.url, "relay connected");
                    if let Wake::Shutdown = self.session(ws).await {
                        break;
                    }
                    info!(relay = %self.url, "relay connection closed");
                }
                Some(Ok(Err(e))) => warn!(relay = %self.url, "connect failed: {e}"),
                Some(Err(_)) => warn!(relay = %self.url, "{}", Error::ConnectionTimeout),
                None => {}
            }

            match self.config.backoff.delay(self.attempts) {
                Some(delay) => {
                    self.attempts += 1;
                    self.set_state(LinkState::Backoff);
                    debug!(relay = %self.url, attempt = self.attempts, ?delay, "reconnect scheduled");
                    match self.idle_until(tokio::time::sleep(delay)).await.0 {
                        Wake::Shutdown => break,
                        Wake::Reset => self.attempts = 0,
                        Wake::Ready => {}
                    }
                }
                None => {
                    self.set_state(LinkState::Exhausted);
                    warn!(relay = %self.url, attempts = self.attempts, "giving up on relay until reset");
                    match self.idle_until(std::future::pending::<()>()).await.0 {
                        Wake::Reset => self.attempts = 0,
                        _ => break,
                    }
                }
            }
        }
        self.set_state(LinkState::Disconnected);
    }

    fn enqueue(&mut self, ev: Event) {
        if self.queue.len() >= self.config.max_queue {
            match self.queue.pop_front() {
                Some(old) => {
                    warn!(relay = %self.url, dropped = old.id(), "publish queue full, dropping oldest event")
                }
                None => {
                    warn!(relay = %self.url, id = ev.id(), "publish queue disabled, dropping event");
                    return;
                }
            }
        }
        self.queue.push_back(ev);
    }

    fn set_state(&self, state: LinkState) {
        self.status.send_replace(LinkStatus {
            state,
            attempts: self.attempts,
        });
    }

    /// Drive `fut` while servicing commands. Publishes are queued; REQ/CLOSE
    /// are dropped because subscriptions are re-issued from the table on open.
    async fn idle_until<F: Future>(&mut self, fut: F) -> (Wake, Option<F::Output>) {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return (Wake::Ready, Some(out)),
                cmd = self.commands.recv() => match cmd {
                    None | Some(LinkCommand::Shutdown) => return (Wake::Shutdown, None),
                    Some(LinkCommand::Reset) => return (Wake::Reset, None),
                    Some(LinkCommand::Publish(ev)) => self.enqueue(ev),
                    Some(LinkCommand::Subscribe { .. }) | Some(LinkCommand::Close(_)) => {}
                },
            }
        }
    }

    /// Serve an open socket until it drops or we are told to stop.
    async fn session(&mut self, ws: Socket) -> Wake {
        let (mut sink, mut stream) = ws.split();

        while let Some(ev) = self.queue.pop_front() {
            let Some(frame) = encode(&ClientMessage::Event(ev.clone())) else {
                continue;
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                self.queue.push_front(ev);
                return Wake::Ready;
            }
        }
        if self.options.read {
            for (id, filters) in self.inbound.live_subscriptions() {
                let Some(frame) = encode(&ClientMessage::Req {
                    subscription_id: id,
                    filters,
                }) else {
                    continue;
                };
                if sink.send(Message::Text(frame)).await.is_err() {
                    return Wake::Ready;
                }
            }
        }

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(txt))) => match RelayMessage::from_json(&txt) {
                        Some(RelayMessage::Notice(notice)) => {
                            info!(relay = %self.url, "notice: {notice}");
                        }
                        Some(msg) => self.inbound.deliver(&self.url, msg),
                        None => debug!(relay = %self.url, "dropping malformed frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => return Wake::Ready,
                    Some(Err(e)) => {
                        debug!(relay = %self.url, "socket error: {e}");
                        return Wake::Ready;
                    }
                    Some(Ok(_)) => {}
                },
                cmd = self.commands.recv() => {
                    let out = match cmd {
                        None | Some(LinkCommand::Shutdown) => {
                            let _ = sink.send(Message::Close(None)).await;
                            return Wake::Shutdown;
                        }
                        Some(LinkCommand::Reset) => continue,
                        Some(LinkCommand::Publish(ev)) => {
                            if let Some(frame) = encode(&ClientMessage::Event(ev.clone())) {
                                if sink.send(Message::Text(frame)).await.is_err() {
                                    self.enqueue(ev);
                                    return Wake::Ready;
                                }
                            }
                            continue;
                        }
                        Some(LinkCommand::Subscribe { id, filters }) if self.options.read => {
                            ClientMessage::Req { subscription_id: id, filters }
                        }
                        Some(LinkCommand::Close(id)) if self.options.read => ClientMessage::Close(id),
                        Some(_) => continue,
                    };
                    if let Some(frame) = encode(&out) {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            return Wake::Ready;
                        }
                    }
                }
            }
        }
    }
}

fn encode(msg: &ClientMessage) -> Option<String> {
    match msg.as_json() {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("failed to encode frame: {e}");
            None
        }
    }
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
pub async fn connect_ws(relay: &str, proxy: Option<&str>) -> Result<Socket> {
    let url = Url::parse(relay)?;
    let host = url
        .host_str()
        .ok_or(Error::InvalidPayload("relay url has no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or(Error::InvalidPayload("relay url has no port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = proxy {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::UnsignedEvent, keys::Keys};
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    #[derive(Default)]
    struct Recorder {
        subs: Mutex<Vec<(String, Vec<Filter>)>>,
        seen: Mutex<Vec<RelayMessage>>,
    }

    impl Inbound for Recorder {
        fn live_subscriptions(&self) -> Vec<(String, Vec<Filter>)> {
            self.subs.lock().unwrap().clone()
        }

        fn deliver(&self, _relay: &str, msg: RelayMessage) {
            self.seen.lock().unwrap().push(msg);
        }
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_millis(500),
            backoff: Backoff {
                base_delay: Duration::from_millis(10),
                max_attempts: 3,
            },
            ..LinkConfig::default()
        }
    }

    fn event(text: &str) -> Event {
        let keys = Keys::generate();
        UnsignedEvent::new(keys.public_key_hex(), 1, text)
            .sign(&keys)
            .unwrap()
    }

    #[test]
    fn backoff_delays_grow_until_cap() {
        let b = Backoff {
            base_delay: Duration::from_millis(100),
            max_attempts: 4,
        };
        let delays: Vec<_> = (0..6).map(|a| b.delay(a)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(400)),
                Some(Duration::from_millis(800)),
                None,
                None,
            ]
        );
        let huge = Backoff {
            base_delay: Duration::from_secs(1),
            max_attempts: u32::MAX,
        };
        assert!(huge.delay(40).is_some());
    }

    #[tokio::test]
    async fn connect_ws_invalid_url_errors() {
        assert!(connect_ws("not a url", None).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_relay_exhausts_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let inbound = Arc::new(Recorder::default());
        let link = RelayLink::spawn(
            format!("ws://{addr}"),
            RelayOptions::default(),
            fast_config(),
            inbound,
        );
        assert!(link.wait_for(LinkState::Exhausted, Duration::from_secs(5)).await);
        assert_eq!(link.status().attempts, 3);
        link.shutdown();
        assert!(link.wait_for(LinkState::Disconnected, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn open_flushes_queue_then_resubscribes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let inbound = Arc::new(Recorder::default());
        inbound
            .subs
            .lock()
            .unwrap()
            .push(("live".into(), vec![Filter::new().kind(1)]));

        let first = event("first");
        let second = event("second");
        let (first_id, second_id) = (first.id().to_string(), second.id().to_string());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut frames = vec![];
            while frames.len() < 3 {
                if let Some(Ok(TMsg::Text(t))) = ws.next().await {
                    frames.push(serde_json::from_str::<serde_json::Value>(&t).unwrap());
                }
            }
            ws.send(TMsg::Text(r#"["EOSE","live"]"#.into())).await.unwrap();
            ws.send(TMsg::Text("garbage".into())).await.unwrap();
            ws.send(TMsg::Text(r#"["NOTICE","hi"]"#.into())).await.unwrap();
            ws.send(TMsg::Text(r#"["OK","abc",true,""]"#.into())).await.unwrap();
            frames
        });

        // Publishes issued before the socket opens are queued.
        let link = RelayLink::spawn(
            format!("ws://{addr}"),
            RelayOptions::default(),
            fast_config(),
            inbound.clone(),
        );
        link.send(LinkCommand::Publish(first));
        link.send(LinkCommand::Publish(second));

        let frames = server.await.unwrap();
        assert_eq!(frames[0][0], "EVENT");
        assert_eq!(frames[0][1]["id"], first_id.as_str());
        assert_eq!(frames[1][1]["id"], second_id.as_str());
        assert_eq!(frames[2], serde_json::json!(["REQ", "live", {"kinds": [1]}]));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = inbound.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                RelayMessage::Eose("live".into()),
                RelayMessage::Ok {
                    event_id: "abc".into(),
                    accepted: true,
                    message: String::new(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn reconnects_and_resubscribes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let inbound = Arc::new(Recorder::default());
        inbound
            .subs
            .lock()
            .unwrap()
            .push(("s".into(), vec![Filter::new()]));

        let server = tokio::spawn(async move {
            let mut reqs = 0;
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                if let Some(Ok(TMsg::Text(t))) = ws.next().await {
                    if t.starts_with("[\"REQ\"") {
                        reqs += 1;
                    }
                }
                // Hang up without a close handshake.
                drop(ws);
            }
            reqs
        });

        let link = RelayLink::spawn(
            format!("ws://{addr}"),
            RelayOptions::default(),
            LinkConfig {
                backoff: Backoff {
                    base_delay: Duration::from_millis(10),
                    max_attempts: 50,
                },
                ..fast_config()
            },
            inbound,
        );
        assert_eq!(server.await.unwrap(), 2);
        link.shutdown();
        assert!(link.wait_for(LinkState::Disconnected, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn exhausted_link_recovers_after_reset() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let link = RelayLink::spawn(
            format!("ws://{addr}"),
            RelayOptions::default(),
            fast_config(),
            Arc::new(Recorder::default()),
        );
        assert!(link.wait_for(LinkState::Exhausted, Duration::from_secs(5)).await);

        let listener = TcpListener::bind(addr).await.unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, TMsg::Close(_)) {
                    break;
                }
            }
        });
        link.reset();
        assert!(link.wait_for(LinkState::Open, Duration::from_secs(5)).await);
        assert_eq!(link.status().attempts, 0);
        link.shutdown();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn queue_keeps_only_the_newest_publishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let link = RelayLink::spawn(
            format!("ws://{addr}"),
            RelayOptions::default(),
            LinkConfig {
                max_queue: 2,
                ..fast_config()
            },
            Arc::new(Recorder::default()),
        );
        assert!(link.wait_for(LinkState::Exhausted, Duration::from_secs(5)).await);

        let events: Vec<_> = ["a", "b", "c"].iter().map(|t| event(t)).collect();
        for ev in &events {
            link.send(LinkCommand::Publish(ev.clone()));
        }

        let listener = TcpListener::bind(addr).await.unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut ids = vec![];
            while let Ok(Some(Ok(msg))) =
                tokio::time::timeout(Duration::from_millis(500), ws.next()).await
            {
                if let TMsg::Text(t) = msg {
                    let frame: serde_json::Value = serde_json::from_str(&t).unwrap();
                    ids.push(frame[1]["id"].as_str().unwrap().to_string());
                }
            }
            ids
        });
        link.reset();
        let ids = server.await.unwrap();
        assert_eq!(ids, vec![events[1].id().to_string(), events[2].id().to_string()]);
        link.shutdown();
    }
}
