//! HTTP/3 serving over QUIC.
//!
//! One [`Http3Server`] owns a quinn endpoint and an accept loop feeding
//! requests into the shared mux. Shutdown is an immediate endpoint close;
//! HTTP/3 carries no graceful-drain contract here.

use crate::error::{ServerError, ServerResult};
use crate::mux::Mux;
use crate::runtime::Event;
use crate::spec::ServerSpec;
use bytes::{Buf, Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::Response;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A running HTTP/3 listener.
pub(crate) struct Http3Server {
    endpoint: quinn::Endpoint,
    closing: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Http3Server {
    /// Bind the QUIC endpoint and start accepting.
    pub(crate) fn start(
        spec: &ServerSpec,
        mux: Mux,
        event_tx: mpsc::Sender<Event>,
        round_num: u64,
    ) -> ServerResult<Http3Server> {
        let mut tls = spec.tls_config()?;
        tls.alpn_protocols = vec![b"h3".to_vec()];
        let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
            .map_err(|e| ServerError::Http3(e.to_string()))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_tls));

        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(
            spec.keep_alive_timeout
                .try_into()
                .map_err(|_| ServerError::Http3("keep_alive_timeout too large".to_string()))?,
        ));
        if spec.keep_alive {
            transport.keep_alive_interval(Some(spec.keep_alive_timeout / 2));
        }
        server_config.transport_config(Arc::new(transport));

        let addr = SocketAddr::from(([0, 0, 0, 0], spec.port));
        let endpoint = quinn::Endpoint::server(server_config, addr)
            .map_err(|source| ServerError::Listen { addr, source })?;

        let closing = Arc::new(AtomicBool::new(false));
        let accept_endpoint = endpoint.clone();
        let accept_closing = Arc::clone(&closing);
        let task = tokio::spawn(async move {
            while let Some(incoming) = accept_endpoint.accept().await {
                let mux = mux.clone();
                tokio::spawn(async move {
                    let conn = match incoming.await {
                        Ok(conn) => conn,
                        Err(e) => {
                            debug!(error = %e, "http3 handshake failed");
                            return;
                        }
                    };
                    serve_h3_connection(conn, mux).await;
                });
            }
            // `accept` only drains after the endpoint closed; anything else
            // is a serve failure the runtime should see.
            if !accept_closing.load(Ordering::Acquire) {
                let _ = event_tx.try_send(Event::ServeFailed {
                    round_num,
                    err: "http3 endpoint closed unexpectedly".to_string(),
                });
            }
        });

        Ok(Http3Server {
            endpoint,
            closing,
            task,
        })
    }

    /// Close the endpoint immediately, dropping in-flight requests.
    pub(crate) fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.endpoint.close(0u32.into(), b"server closed");
        self.task.abort();
    }
}

async fn serve_h3_connection(conn: quinn::Connection, mux: Mux) {
    let peer = conn.remote_address().ip();
    let mut h3_conn: h3::server::Connection<_, Bytes> =
        match h3::server::Connection::new(h3_quinn::Connection::new(conn)).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "http3 connection setup failed");
                return;
            }
        };

    loop {
        match h3_conn.accept().await {
            Ok(Some(resolver)) => {
                let mux = mux.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_h3_request(resolver, mux, peer).await {
                        debug!(error = %e, "http3 request failed");
                    }
                });
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "http3 connection ended");
                break;
            }
        }
    }
}

async fn serve_h3_request(
    resolver: h3::server::RequestResolver<h3_quinn::Connection, Bytes>,
    mux: Mux,
    peer: IpAddr,
) -> Result<(), h3::error::StreamError> {
    let (req, mut stream) = resolver.resolve_request().await?;

    let mut body = BytesMut::new();
    while let Some(mut chunk) = stream.recv_data().await? {
        while chunk.has_remaining() {
            let piece = chunk.chunk();
            body.extend_from_slice(piece);
            let advanced = piece.len();
            chunk.advance(advanced);
        }
    }

    let req = req.map(|_| Full::new(body.freeze()));
    let resp = mux.serve(req, peer).await;
    let (parts, body) = resp.into_parts();
    let bytes = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    stream.send_response(Response::from_parts(parts, ())).await?;
    if !bytes.is_empty() {
        stream.send_data(bytes).await?;
    }
    stream.finish().await
}
