//! The server lifecycle state machine.
//!
//! One [`Runtime`] owns one managed HTTP server across its whole life:
//! `nil → running ⇄ failed → closed`. All state transitions happen on a
//! single event loop; the outside world only sends events ([`Runtime::reload`],
//! [`Runtime::close`]) and reads the atomic status surface. Every listener
//! (re)start bumps a round number, and serve failures stamped with an older
//! round are ignored; that is the only defense against a stale failure
//! poisoning a freshly restarted server.

use crate::error::{ServerError, ServerResult};
use crate::grace::{default_listen, ListenFn};
use crate::http3::Http3Server;
use crate::limit_listener::{LimitListener, LimitedStream};
use crate::metrics::{MetricLabels, ServerMetrics};
use crate::mux::{Mux, MuxMapper};
use crate::spec::ServerSpec;
use crate::stat::{HttpStat, StatSnapshot, TopN, TopNItem};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::{GracefulShutdown, Watcher};
use parking_lot::RwLock;
use prometheus::Registry;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Paths reported by the top-N block of the status.
const TOP_NUM: usize = 10;

/// How often a failed server retries its listen.
const CHECK_FAILED_INTERVAL: Duration = Duration::from_secs(10);

/// How long in-flight HTTP/1+2 requests get to drain on close or restart.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_CAPACITY: usize = 10;

/// Lifecycle state of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Created, never started.
    Nil = 0,
    /// Listener up and serving.
    Running = 1,
    /// Listen or serve failed; retried every ten seconds.
    Failed = 2,
    /// Terminal.
    Closed = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            1 => State::Running,
            2 => State::Failed,
            3 => State::Closed,
            _ => State::Nil,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Nil => "nil",
            State::Running => "running",
            State::Failed => "failed",
            State::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Events consumed by the runtime's state machine.
pub(crate) enum Event {
    /// Failed-state retry tick.
    CheckFailed,
    /// A serve task of generation `round_num` died.
    ServeFailed {
        round_num: u64,
        err: String,
    },
    /// New configuration, hot or cold.
    Reload {
        spec: Box<ServerSpec>,
        mapper: Arc<dyn MuxMapper>,
    },
    /// Terminal teardown; `done` fires after listener and mux teardown.
    Close { done: oneshot::Sender<()> },
}

/// Status surface of one managed server.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    /// Server name.
    pub name: String,
    /// Empty while healthy, the most recent serve error otherwise.
    pub health: String,
    /// Lifecycle state.
    pub state: State,
    /// Same as `health`, omitted when empty.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Request statistics.
    pub stat: StatSnapshot,
    /// Busiest request paths.
    pub top_n: Vec<TopNItem>,
}

struct Shared {
    name: String,
    state: AtomicU8,
    error: RwLock<String>,
    http_stat: Arc<HttpStat>,
    top_n: Arc<TopN>,
    metrics: Arc<ServerMetrics>,
}

impl Shared {
    fn set_state(&self, state: State) {
        self.metrics.set_health(state == State::Running);
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_error(&self, err: Option<String>) {
        *self.error.write() = err.unwrap_or_default();
    }

    fn error(&self) -> String {
        self.error.read().clone()
    }
}

/// Handle to a managed HTTP server.
///
/// Dropping the handle does not stop the server; call [`close`](Self::close).
/// Must be created inside a tokio runtime.
pub struct Runtime {
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<Event>,
}

impl Runtime {
    /// Create a server runtime in the `nil` state; the first
    /// [`reload`](Self::reload) starts it.
    pub fn new(name: &str, labels: MetricLabels, registry: &Registry) -> Runtime {
        Self::with_options(name, labels, registry, default_listen(), CHECK_FAILED_INTERVAL)
    }

    pub(crate) fn with_options(
        name: &str,
        labels: MetricLabels,
        registry: &Registry,
        listen: ListenFn,
        check_interval: Duration,
    ) -> Runtime {
        let http_stat = Arc::new(HttpStat::new());
        let top_n = Arc::new(TopN::new(TOP_NUM));
        let metrics = Arc::new(ServerMetrics::new(registry, name, &labels));
        let shared = Arc::new(Shared {
            name: name.to_string(),
            state: AtomicU8::new(State::Nil as u8),
            error: RwLock::new(String::new()),
            http_stat: Arc::clone(&http_stat),
            top_n: Arc::clone(&top_n),
            metrics: Arc::clone(&metrics),
        });
        shared.set_state(State::Nil);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Inner {
            shared: Arc::clone(&shared),
            event_tx: event_tx.clone(),
            listen,
            mux: Mux::new(http_stat, top_n, metrics),
            spec: None,
            round_num: 0,
            server: None,
            server3: None,
            limit: None,
        };
        tokio::spawn(fsm(inner, event_rx));
        tokio::spawn(check_failed_loop(
            Arc::clone(&shared),
            event_tx.clone(),
            check_interval,
        ));

        Runtime { shared, event_tx }
    }

    /// Apply a new spec. Compatible changes are applied in place; anything
    /// else restarts the listener under a new round number.
    pub async fn reload(&self, spec: ServerSpec, mapper: Arc<dyn MuxMapper>) {
        let event = Event::Reload {
            spec: Box::new(spec),
            mapper,
        };
        if self.event_tx.send(event).await.is_err() {
            warn!(server = %self.shared.name, "reload after close, ignored");
        }
    }

    /// Close the server and wait for listener and mux teardown.
    pub async fn close(&self) {
        let (done, done_rx) = oneshot::channel();
        if self.event_tx.send(Event::Close { done }).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Full status surface.
    pub fn status(&self) -> Status {
        let error = self.shared.error();
        Status {
            name: self.shared.name.clone(),
            health: error.clone(),
            state: self.shared.state(),
            error,
            stat: self.shared.http_stat.status(),
            top_n: self.shared.top_n.status(),
        }
    }

    #[cfg(test)]
    pub(crate) fn event_sender(&self) -> mpsc::Sender<Event> {
        self.event_tx.clone()
    }
}

struct ServeHandle {
    token: CancellationToken,
    graceful: Arc<GracefulShutdown>,
    task: JoinHandle<()>,
}

struct Inner {
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<Event>,
    listen: ListenFn,
    mux: Mux,
    spec: Option<ServerSpec>,
    round_num: u64,
    server: Option<ServeHandle>,
    server3: Option<Http3Server>,
    limit: Option<Arc<LimitListener>>,
}

async fn fsm(mut inner: Inner, mut events: mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::CheckFailed => inner.handle_check_failed().await,
            Event::ServeFailed { round_num, err } => inner.handle_serve_failed(round_num, err),
            Event::Reload { spec, mapper } => inner.handle_reload(*spec, mapper).await,
            Event::Close { done } => {
                inner.handle_close().await;
                let _ = done.send(());
                return;
            }
        }
    }
}

async fn check_failed_loop(
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<Event>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match shared.state() {
            State::Failed => {
                if event_tx.send(Event::CheckFailed).await.is_err() {
                    return;
                }
            }
            State::Closed => return,
            State::Nil | State::Running => {}
        }
    }
}

impl Inner {
    async fn handle_check_failed(&mut self) {
        if self.shared.state() == State::Failed {
            self.start_server().await;
        }
    }

    fn handle_serve_failed(&mut self, round_num: u64, err: String) {
        if round_num < self.round_num {
            debug!(
                server = %self.shared.name,
                stale_round = round_num,
                current_round = self.round_num,
                "ignoring a stale serve failure"
            );
            return;
        }
        warn!(server = %self.shared.name, error = %err, "serving failed");
        self.shared.set_state(State::Failed);
        self.shared.set_error(Some(err));
    }

    async fn handle_reload(&mut self, next: ServerSpec, mapper: Arc<dyn MuxMapper>) {
        self.mux.reload(&next, mapper);

        // The limit listener doesn't exist before the first start.
        if let Some(limit) = &self.limit {
            limit.set_max_connections(next.max_connections);
        }

        match &self.spec {
            None => {
                self.spec = Some(next);
                self.start_server().await;
            }
            Some(current) if current.needs_restart(&next) => {
                info!(
                    server = %self.shared.name,
                    "restarting the listener for an incompatible spec change"
                );
                self.spec = Some(next);
                self.close_server().await;
                self.start_server().await;
            }
            Some(_) => {
                debug!(server = %self.shared.name, "spec change applied in place");
                self.spec = Some(next);
            }
        }
    }

    async fn handle_close(&mut self) {
        self.shared.set_state(State::Closed);
        self.close_server().await;
        self.mux.close();
    }

    async fn start_server(&mut self) {
        let Some(spec) = self.spec.clone() else {
            error!(server = %self.shared.name, "BUG: no spec to start the server with");
            return;
        };

        self.drop_server_handles();
        self.round_num += 1;
        self.shared.set_state(State::Running);
        self.shared.set_error(None);

        let result = if spec.http3_enabled {
            self.start_http3_server(&spec)
        } else {
            self.start_http12_server(&spec)
        };
        if let Err(e) = result {
            warn!(server = %self.shared.name, error = %e, "starting the server failed");
            self.shared.set_state(State::Failed);
            self.shared.set_error(Some(e.to_string()));
        }
    }

    fn start_http12_server(&mut self, spec: &ServerSpec) -> ServerResult<()> {
        spec.validate()?;

        let addr = SocketAddr::from(([0, 0, 0, 0], spec.port));
        let std_listener = (self.listen)(addr).map_err(|source| ServerError::Listen { addr, source })?;
        let listener = TcpListener::from_std(std_listener)?;
        let limit = Arc::new(LimitListener::new(listener, spec.max_connections));
        self.limit = Some(Arc::clone(&limit));

        let tls = if spec.https_enabled {
            let mut config = spec.tls_config()?;
            config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
            Some(TlsAcceptor::from(Arc::new(config)))
        } else {
            None
        };

        let token = CancellationToken::new();
        let graceful = Arc::new(GracefulShutdown::new());

        let accept_token = token.clone();
        let graceful_for_loop = graceful.clone();
        let mux = self.mux.clone();
        let event_tx = self.event_tx.clone();
        let round_num = self.round_num;
        let keep_alive = spec.keep_alive;
        let keep_alive_timeout = spec.keep_alive_timeout;

        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = accept_token.cancelled() => break,
                    accepted = limit.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            // try_send: the event loop may be mid-close and
                            // not draining; never block the dying acceptor.
                            let _ = event_tx.try_send(Event::ServeFailed {
                                round_num,
                                err: e.to_string(),
                            });
                            break;
                        }
                    },
                };
                let mux = mux.clone();
                let tls = tls.clone();
                let watcher = graceful_for_loop.watcher();
                tokio::spawn(async move {
                    serve_connection(stream, peer, mux, tls, watcher, keep_alive, keep_alive_timeout)
                        .await;
                });
            }
        });

        self.server = Some(ServeHandle {
            token,
            graceful,
            task,
        });
        Ok(())
    }

    fn start_http3_server(&mut self, spec: &ServerSpec) -> ServerResult<()> {
        spec.validate()?;
        let server3 = Http3Server::start(
            spec,
            self.mux.clone(),
            self.event_tx.clone(),
            self.round_num,
        )?;
        self.server3 = Some(server3);
        Ok(())
    }

    /// Graceful teardown: stop accepting, then drain in-flight HTTP/1+2
    /// requests up to the thirty-second deadline. HTTP/3 closes immediately.
    async fn close_server(&mut self) {
        if let Some(server3) = self.server3.take() {
            server3.close();
        }
        if let Some(server) = self.server.take() {
            server.token.cancel();
            let _ = server.task.await;
            let graceful = Arc::try_unwrap(server.graceful)
                .expect("no other references to graceful shutdown handle after accept loop exits");
            if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, graceful.shutdown())
                .await
                .is_err()
            {
                warn!(
                    server = %self.shared.name,
                    "graceful shutdown timed out, dropping remaining connections"
                );
            }
        }
        self.limit = None;
    }

    /// Non-graceful teardown of whatever handles are left. A failed server
    /// has nothing to drain; the old listener must be gone before a rebind.
    fn drop_server_handles(&mut self) {
        if let Some(server) = self.server.take() {
            server.token.cancel();
            server.task.abort();
        }
        if let Some(server3) = self.server3.take() {
            server3.close();
        }
        self.limit = None;
    }
}

async fn serve_connection(
    stream: LimitedStream,
    peer: SocketAddr,
    mux: Mux,
    tls: Option<TlsAcceptor>,
    watcher: Watcher,
    keep_alive: bool,
    keep_alive_timeout: Duration,
) {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .keep_alive(keep_alive)
        .header_read_timeout(keep_alive_timeout);
    builder.http2().timer(TokioTimer::new()).keep_alive_interval(
        if keep_alive {
            Some(keep_alive_timeout)
        } else {
            None
        },
    );

    let service = service_fn(move |req: Request<Incoming>| {
        let mux = mux.clone();
        async move { Ok::<_, Infallible>(mux.serve(req, peer.ip()).await) }
    });

    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => {
                let conn = builder.serve_connection(TokioIo::new(stream), service);
                if let Err(e) = watcher.watch(conn.into_owned()).await {
                    debug!(peer = %peer, error = %e, "connection ended with an error");
                }
            }
            // Handshake probes and scanners are routine noise.
            Err(e) => debug!(peer = %peer, error = %e, "tls handshake failed"),
        },
        None => {
            let conn = builder.serve_connection(TokioIo::new(stream), service);
            if let Err(e) = watcher.watch(conn.into_owned()).await {
                debug!(peer = %peer, error = %e, "connection ended with an error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Handler;
    use crate::spec::{PathSpec, RuleSpec};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::Response;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct NamedHandler(&'static str);

    #[async_trait]
    impl Handler for NamedHandler {
        async fn handle(&self, _req: Request<Bytes>) -> Response<Full<Bytes>> {
            Response::new(Full::new(Bytes::from(self.0)))
        }
    }

    struct SingleMapper(&'static str);

    impl MuxMapper for SingleMapper {
        fn get_handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
            (name == self.0).then(|| Arc::new(NamedHandler(self.0)) as Arc<dyn Handler>)
        }
    }

    fn labels() -> MetricLabels {
        MetricLabels {
            cluster_name: "c1".to_string(),
            cluster_role: "Write".to_string(),
            instance_name: "node-1".to_string(),
        }
    }

    fn spec(port: u16, backend: &str) -> ServerSpec {
        ServerSpec {
            port,
            rules: vec![RuleSpec {
                host: None,
                paths: vec![PathSpec {
                    path: None,
                    path_prefix: Some("/".to_string()),
                    backend: backend.to_string(),
                }],
            }],
            ..ServerSpec::default()
        }
    }

    fn runtime(name: &str) -> Runtime {
        Runtime::with_options(
            name,
            labels(),
            &Registry::new(),
            default_listen(),
            Duration::from_millis(200),
        )
    }

    /// A runtime whose failed-state retry is effectively off, for tests
    /// that assert on the failed state itself.
    fn runtime_without_retry(name: &str) -> Runtime {
        Runtime::with_options(
            name,
            labels(),
            &Registry::new(),
            default_listen(),
            Duration::from_secs(3600),
        )
    }

    async fn http_get(port: u16, path: &str) -> Option<String> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.ok()?;
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.ok()?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.ok()?;
        Some(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn wait_for_state(rt: &Runtime, state: State) {
        for _ in 0..100 {
            if rt.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("server never reached state {state}, stuck at {}", rt.state());
    }

    async fn wait_for_body(port: u16, needle: &str) {
        for _ in 0..100 {
            if let Some(body) = http_get(port, "/").await {
                if body.contains(needle) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("port {port} never served a body containing {needle:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reload_starts_and_close_terminates() {
        let rt = runtime("edge");
        assert_eq!(rt.state(), State::Nil);

        rt.reload(spec(38731, "one"), Arc::new(SingleMapper("one"))).await;
        wait_for_state(&rt, State::Running).await;
        wait_for_body(38731, "one").await;

        let status = rt.status();
        assert_eq!(status.state, State::Running);
        assert!(status.health.is_empty());
        assert!(status.stat.total_requests >= 1);

        rt.close().await;
        assert_eq!(rt.state(), State::Closed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(TcpStream::connect(("127.0.0.1", 38731)).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hot_reload_swaps_handlers_in_place() {
        let rt = runtime_without_retry("edge-hot");
        rt.reload(spec(38741, "one"), Arc::new(SingleMapper("one"))).await;
        wait_for_body(38741, "one").await;

        // Only rules change: same port, no restart, new handlers.
        rt.reload(spec(38741, "two"), Arc::new(SingleMapper("two"))).await;
        wait_for_body(38741, "two").await;
        assert_eq!(rt.state(), State::Running);

        // The round number did not move: a failure stamped with the original
        // round is still current and must be honored, proving no restart
        // happened in between.
        rt.event_sender()
            .send(Event::ServeFailed {
                round_num: 1,
                err: "synthetic".to_string(),
            })
            .await
            .unwrap();
        wait_for_state(&rt, State::Failed).await;

        rt.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cold_reload_moves_the_listener() {
        let rt = runtime("edge-cold");
        rt.reload(spec(38751, "one"), Arc::new(SingleMapper("one"))).await;
        wait_for_body(38751, "one").await;

        rt.reload(spec(38752, "one"), Arc::new(SingleMapper("one"))).await;
        wait_for_body(38752, "one").await;
        assert_eq!(rt.state(), State::Running);
        assert!(TcpStream::connect(("127.0.0.1", 38751)).await.is_err());

        // After the restart, failures from the old round are stale.
        rt.event_sender()
            .send(Event::ServeFailed {
                round_num: 1,
                err: "stale".to_string(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rt.state(), State::Running);

        rt.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_listen_recovers_when_the_port_frees_up() {
        // Occupy the port first.
        let blocker = std::net::TcpListener::bind("0.0.0.0:38761").unwrap();

        let rt = runtime("edge-retry");
        rt.reload(spec(38761, "one"), Arc::new(SingleMapper("one"))).await;
        wait_for_state(&rt, State::Failed).await;
        assert!(!rt.status().health.is_empty());

        drop(blocker);
        // The failed-state ticker relistens within its interval.
        wait_for_state(&rt, State::Running).await;
        wait_for_body(38761, "one").await;
        assert!(rt.status().health.is_empty());

        rt.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serve_failure_then_check_failed_restarts() {
        let rt = runtime("edge-fsm");
        rt.reload(spec(38771, "one"), Arc::new(SingleMapper("one"))).await;
        wait_for_state(&rt, State::Running).await;

        // A stale failure is a no-op.
        rt.event_sender()
            .send(Event::ServeFailed {
                round_num: 0,
                err: "stale".to_string(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rt.state(), State::Running);

        // A current-round failure flips to failed, and the retry tick
        // brings it back without ever reaching closed.
        rt.event_sender()
            .send(Event::ServeFailed {
                round_num: 1,
                err: "listener died".to_string(),
            })
            .await
            .unwrap();
        wait_for_state(&rt, State::Failed).await;
        wait_for_state(&rt, State::Running).await;

        rt.close().await;
        assert_eq!(rt.state(), State::Closed);
    }
}
