//! Transparent TLS-intercepting proxy.
//!
//! OS redirect rules deliver 80/443 flows to the listener. Port 80 is
//! parsed as plain HTTP/1.1. Port 443 peeks the ClientHello for the SNI,
//! mints (or fetches) a leaf certificate, terminates TLS toward the client,
//! and opens its own TLS connection upstream. Requests are parsed, checked
//! against policy, forwarded verbatim, and the finalized flow is decoded,
//! analyzed, persisted, and emitted. Parse failures and oversized bodies
//! downgrade the connection to opaque byte forwarding.

pub mod analyze;
pub mod http1;
pub mod sni;

use crate::ca::CertificateAuthority;
use crate::config::Config;
use crate::decode::ContentDecoder;
use crate::events::{Event, EventSink, FlowEventKind};
use crate::policy::SharedPolicy;
use crate::store::Store;
use crate::types::{now_rfc3339, FlowBody, HttpFlow};
use http1::{build_403, Http1Error, MessageKind, MessageReader};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use serde_json::json;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("listener bind failed: {0}")]
    Bind(#[source] io::Error),
    #[error("certificate error: {0}")]
    Ca(#[from] crate::ca::CaError),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A stream with already-read bytes replayed ahead of it (the peeked
/// ClientHello).
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Recover the pre-redirect destination of an accepted connection.
#[cfg(target_os = "linux")]
pub fn original_destination(stream: &TcpStream) -> Option<SocketAddr> {
    use std::os::fd::AsRawFd;
    const SO_ORIGINAL_DST: libc::c_int = 80;
    let fd = stream.as_raw_fd();
    unsafe {
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        );
        if rc != 0 {
            return None;
        }
        let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        Some(SocketAddr::from((ip, u16::from_be(addr.sin_port))))
    }
}

#[cfg(not(target_os = "linux"))]
pub fn original_destination(_stream: &TcpStream) -> Option<SocketAddr> {
    None
}

/// Upstream certificate verifier that records nothing and accepts
/// everything; used only after normal validation has failed and
/// `ssl_insecure` allows continuing. The flow is marked
/// `upstream_insecure`.
#[derive(Debug)]
struct AcceptAnyCert(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Per-session context shared by the HTTP service loop.
#[derive(Clone)]
pub struct SessionCtx {
    pub device_ip: String,
    pub scheme: &'static str,
    /// Host used when the request carries no Host header: the SNI, or the
    /// original destination.
    pub fallback_host: String,
    pub policy: SharedPolicy,
    pub store: Arc<Store>,
    pub sink: EventSink,
    pub max_body: usize,
    pub idle_timeout: Duration,
    pub upstream_insecure: bool,
}

pub struct TransparentProxy {
    cfg: Config,
    ca: Arc<CertificateAuthority>,
    policy: SharedPolicy,
    store: Arc<Store>,
    sink: EventSink,
    verified_tls: Arc<rustls::ClientConfig>,
    insecure_tls: Arc<rustls::ClientConfig>,
}

impl TransparentProxy {
    pub fn new(
        cfg: Config,
        ca: Arc<CertificateAuthority>,
        policy: SharedPolicy,
        store: Arc<Store>,
        sink: EventSink,
    ) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let verified = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let insecure = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();

        Self {
            cfg,
            ca,
            policy,
            store,
            sink,
            verified_tls: Arc::new(verified),
            insecure_tls: Arc::new(insecure),
        }
    }

    /// Bind the redirect listener. Failures here are startup failures.
    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        TcpListener::bind(("0.0.0.0", self.cfg.proxy_port))
            .await
            .map_err(ProxyError::Bind)
    }

    /// Serve an already-bound listener until `shutdown` flips.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), ProxyError> {
        let mut detail = serde_json::Map::new();
        detail.insert("port".to_string(), json!(self.cfg.proxy_port));
        detail.insert("mode".to_string(), json!("transparent"));
        self.sink.emit(Event::Started {
            component: "proxy".to_string(),
            detail,
        });
        info!("transparent proxy listening on {}", self.cfg.proxy_port);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let proxy = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = proxy.handle_connection(stream, peer).await {
                                    debug!("connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.sink.emit(Event::Stopped {
            component: "proxy".to_string(),
            detail: serde_json::Map::new(),
        });
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), ProxyError> {
        let orig = match original_destination(&stream).or_else(|| stream.local_addr().ok()) {
            Some(addr) => addr,
            None => return Ok(()),
        };
        let device_ip = peer.ip().to_string();

        if orig.port() == 443 {
            let (peeked, sni) = sni::peek_client_hello(&mut stream).await?;
            let host = match sni {
                Some(sni) => sni,
                // SNI-less clients get a certificate for the destination
                // address (reverse DNS when it resolves).
                None => {
                    let dst = orig.ip();
                    match dst {
                        std::net::IpAddr::V4(v4) => tokio::task::spawn_blocking(move || {
                            crate::net::scanner::reverse_dns(v4, v4)
                        })
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| dst.to_string()),
                        other => other.to_string(),
                    }
                }
            };

            // RSA key generation is slow; mint off the reactor.
            let ca = self.ca.clone();
            let leaf_host = host.clone();
            let leaf = tokio::task::spawn_blocking(move || ca.leaf_for(&leaf_host))
                .await
                .map_err(|e| ProxyError::Io(io::Error::other(e)))??;
            let mut server_cfg = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(
                    vec![
                        CertificateDer::from(leaf.cert_der.clone()),
                        CertificateDer::from(self.ca.export_der().to_vec()),
                    ],
                    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.clone())),
                )?;
            server_cfg.alpn_protocols = vec![b"http/1.1".to_vec()];

            let acceptor = TlsAcceptor::from(Arc::new(server_cfg));
            let client_tls = acceptor
                .accept(PrefixedStream::new(peeked, stream))
                .await?;

            let ctx = self.session_ctx(device_ip, "https", host.clone());
            let proxy = self.clone();
            let sni_host = host;
            run_session(client_tls, ctx, move || {
                let proxy = proxy.clone();
                let sni_host = sni_host.clone();
                async move { proxy.connect_tls_upstream(orig, &sni_host).await }
            })
            .await;
        } else {
            let ctx = self.session_ctx(device_ip, "http", orig.ip().to_string());
            run_session(stream, ctx, move || async move {
                Ok((TcpStream::connect(orig).await?, false))
            })
            .await;
        }
        Ok(())
    }

    fn session_ctx(&self, device_ip: String, scheme: &'static str, host: String) -> SessionCtx {
        SessionCtx {
            device_ip,
            scheme,
            fallback_host: host,
            policy: self.policy.clone(),
            store: self.store.clone(),
            sink: self.sink.clone(),
            max_body: self.cfg.max_body_size,
            idle_timeout: Duration::from_secs(self.cfg.idle_timeout_secs),
            upstream_insecure: false,
        }
    }

    /// TLS to the original destination, offering the SNI. Validation
    /// failures fall back to an unverified session when `ssl_insecure`,
    /// and the flow is marked.
    async fn connect_tls_upstream(
        &self,
        orig: SocketAddr,
        sni: &str,
    ) -> io::Result<(tokio_rustls::client::TlsStream<TcpStream>, bool)> {
        let name = ServerName::try_from(sni.to_string())
            .unwrap_or_else(|_| ServerName::IpAddress(orig.ip().into()));

        let tcp = TcpStream::connect(orig).await?;
        match TlsConnector::from(self.verified_tls.clone())
            .connect(name.clone(), tcp)
            .await
        {
            Ok(tls) => Ok((tls, false)),
            Err(verify_err) if self.cfg.ssl_insecure => {
                debug!(
                    "upstream validation for {} failed ({}), continuing insecurely",
                    sni, verify_err
                );
                let tcp = TcpStream::connect(orig).await?;
                let tls = TlsConnector::from(self.insecure_tls.clone())
                    .connect(name, tcp)
                    .await?;
                Ok((tls, true))
            }
            Err(e) => Err(e),
        }
    }
}

/// Serve one client connection: parse, check, forward, record, repeat
/// while keep-alive holds. `connect` opens the upstream lazily so blocked
/// requests never touch the network.
pub async fn run_session<C, U, F, Fut>(client: C, ctx: SessionCtx, connect: F)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = io::Result<(U, bool)>>,
{
    let mut ctx = ctx;
    let mut client = MessageReader::new(client);
    let mut upstream: Option<MessageReader<U>> = None;
    let mut connect = Some(connect);
    let decoder = ContentDecoder::default();

    loop {
        let request = match tokio::time::timeout(
            ctx.idle_timeout,
            client.read_message(MessageKind::Request, ctx.max_body),
        )
        .await
        {
            Ok(Ok(request)) => request,
            Ok(Err(Http1Error::Closed)) | Err(_) => break,
            Ok(Err(e)) => {
                // Parser failure: downgrade to opaque forwarding if the
                // upstream exists, otherwise drop the connection.
                debug!("request parse failed: {}; downgrading", e);
                if let Some(up) = upstream.take() {
                    opaque_relay(client, up).await;
                }
                return;
            }
        };

        let started = Instant::now();
        let host = request
            .header("host")
            .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase())
            .unwrap_or_else(|| ctx.fallback_host.clone());
        let mut flow = HttpFlow::new(&ctx.device_ip, ctx.scheme, &host);
        flow.device_id = ctx.store.device_id_for_ip(&ctx.device_ip);
        flow.method = request.method.clone();
        flow.path = request.path.clone();
        flow.url = format!("{}://{}{}", ctx.scheme, host, request.path);
        flow.request_headers = request.header_map();
        flow.category = analyze::categorize(&host, &request.path).map(str::to_string);
        flow.upstream_insecure = ctx.upstream_insecure;

        let request_decoded = decoder.decode(
            &request.body,
            request.header("content-type"),
            request.header("content-encoding"),
        );
        flow.request_body = FlowBody {
            text: request_decoded.text.clone(),
            body_type: Some(request_decoded.mime_type.clone()),
            raw_size: request.body.len() as u64,
            decoded_size: request_decoded.decoded_size as u64,
        };

        // Policy gate: blocked requests are answered locally and the
        // upstream is never opened.
        let decision = {
            let body_text = request_decoded.text.as_deref().unwrap_or("");
            let policy = ctx.policy.read().unwrap();
            policy.check(&host, &flow.url, body_text)
        };
        if decision.should_block {
            flow.blocked = true;
            flow.block_reason = Some(decision.reason.clone());
            if flow.category.is_none() {
                flow.category = decision.category.clone();
            }
            let _ = client.inner_mut().write_all(&build_403(&decision.reason)).await;
            let _ = client.inner_mut().flush().await;

            ctx.sink.emit(Event::Blocked {
                reason: decision.reason.clone(),
                host: host.clone(),
                url: Some(flow.url.clone()),
                device_ip: ctx.device_ip.clone(),
            });
            ctx.sink.emit(Event::FlowEvent {
                event_type: FlowEventKind::Blocked,
                flow_id: flow.id,
                data: json!({
                    "reason": decision.reason,
                    "host": host,
                    "url": flow.url,
                }),
            });
            persist_flow(&ctx, &flow);
            break;
        }

        // Open the upstream on first need.
        if upstream.is_none() {
            let factory = match connect.take() {
                Some(f) => f,
                None => break,
            };
            match factory().await {
                Ok((stream, insecure)) => {
                    ctx.upstream_insecure = insecure;
                    flow.upstream_insecure = insecure;
                    upstream = Some(MessageReader::new(stream));
                }
                Err(e) => {
                    ctx.sink.emit(Event::FlowEvent {
                        event_type: FlowEventKind::Error,
                        flow_id: flow.id,
                        data: json!({"error": e.to_string(), "phase": "connect", "host": host}),
                    });
                    flow.block_reason = Some(format!("upstream connect failed: {e}"));
                    persist_flow(&ctx, &flow);
                    return;
                }
            }
        }
        let up = upstream.as_mut().expect("upstream just connected");

        // Forward the request verbatim.
        if let Err(e) = up.inner_mut().write_all(&request.raw).await {
            ctx.sink.emit(Event::FlowEvent {
                event_type: FlowEventKind::Error,
                flow_id: flow.id,
                data: json!({"error": e.to_string(), "phase": "forward"}),
            });
            persist_flow(&ctx, &flow);
            return;
        }
        let _ = up.inner_mut().flush().await;

        // Keyword alerts over URL and request body.
        let keywords = ctx.policy.read().unwrap().keywords.clone();
        let (mut tags, mut alerts) =
            analyze::keyword_alerts(&keywords, &flow.url, analyze::FlowLocation::Url, &host, flow.id);
        if let Some(text) = &request_decoded.text {
            let (t, a) = analyze::keyword_alerts(
                &keywords,
                text,
                analyze::FlowLocation::RequestBody,
                &host,
                flow.id,
            );
            tags.extend(t);
            alerts.extend(a);
        }

        ctx.sink.emit(Event::FlowEvent {
            event_type: FlowEventKind::Request,
            flow_id: flow.id,
            data: json!({
                "method": flow.method,
                "url": flow.url,
                "host": host,
                "path": flow.path,
                "headers": flow.request_headers,
                "body_type": flow.request_body.body_type,
                "body_size": flow.request_body.decoded_size,
                "device_ip": ctx.device_ip,
            }),
        });

        if request.truncated {
            // Streaming threshold exceeded: relay the rest opaquely.
            let up = upstream.take().expect("upstream connected above");
            flow.alerts = tags;
            persist_flow(&ctx, &flow);
            emit_alerts(&ctx, alerts);
            opaque_relay(client, up).await;
            return;
        }

        // Mirror for the response.
        let response = match tokio::time::timeout(
            ctx.idle_timeout,
            up.read_message(MessageKind::Response, ctx.max_body),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                ctx.sink.emit(Event::FlowEvent {
                    event_type: FlowEventKind::Error,
                    flow_id: flow.id,
                    data: json!({"error": e.to_string(), "phase": "response"}),
                });
                flow.alerts = tags;
                persist_flow(&ctx, &flow);
                emit_alerts(&ctx, alerts);
                return;
            }
            Err(_) => {
                flow.alerts = tags;
                persist_flow(&ctx, &flow);
                emit_alerts(&ctx, alerts);
                return;
            }
        };

        if client.inner_mut().write_all(&response.raw).await.is_err() {
            flow.alerts = tags;
            persist_flow(&ctx, &flow);
            emit_alerts(&ctx, alerts);
            return;
        }
        let _ = client.inner_mut().flush().await;

        // Decode, analyze, finalize.
        let response_decoded = decoder.decode(
            &response.body,
            response.header("content-type"),
            response.header("content-encoding"),
        );
        flow.status_code = Some(response.status);
        flow.status_message = Some(response.reason.clone());
        flow.response_headers = response.header_map();
        flow.response_body = FlowBody {
            text: response_decoded.text.clone(),
            body_type: Some(response_decoded.mime_type.clone()),
            raw_size: response.body.len() as u64,
            decoded_size: response_decoded.decoded_size as u64,
        };
        flow.duration_ms = started.elapsed().as_millis() as u64;

        if let Some(text) = &response_decoded.text {
            let (t, a) = analyze::keyword_alerts(
                &keywords,
                text,
                analyze::FlowLocation::ResponseBody,
                &host,
                flow.id,
            );
            tags.extend(t);
            alerts.extend(a);
        }
        flow.alerts = tags;

        let request_text = request_decoded.text.as_deref().unwrap_or("");
        let response_text = response_decoded.text.as_deref().unwrap_or("");
        let (sensitivity, _) = analyze::analyze_sensitivity(
            &flow.url,
            &flow.request_headers,
            request_text,
            response_text,
        );
        flow.sensitivity = sensitivity;

        ctx.sink.emit(Event::FlowEvent {
            event_type: FlowEventKind::Response,
            flow_id: flow.id,
            data: json!({
                "status_code": response.status,
                "status_message": response.reason,
                "headers": flow.response_headers,
                "body_type": flow.response_body.body_type,
                "raw_size": flow.response_body.raw_size,
                "decoded_size": flow.response_body.decoded_size,
                "duration_ms": flow.duration_ms,
                "timestamp": now_rfc3339(),
            }),
        });
        emit_alerts(&ctx, alerts);
        persist_flow(&ctx, &flow);
        let _ = ctx.store.bump_device_stats(
            flow.device_id,
            1,
            (request.raw.len() + response.raw.len()) as u64,
        );

        if response.truncated {
            let up = upstream.take().expect("upstream connected above");
            opaque_relay(client, up).await;
            return;
        }
        if !request.keep_alive() || !response.keep_alive() {
            break;
        }
    }
}

fn persist_flow(ctx: &SessionCtx, flow: &HttpFlow) {
    if let Err(e) = ctx.store.insert_flow(flow) {
        ctx.sink.emit(Event::error("proxy", &e));
        warn!("failed to persist flow: {}", e);
        return;
    }
    ctx.sink.emit(Event::Traffic { flow: flow.clone() });
}

fn emit_alerts(ctx: &SessionCtx, alerts: Vec<crate::events::AlertPayload>) {
    for alert in alerts {
        ctx.sink.emit(Event::Alert { alert });
    }
}

/// Byte-forward both directions after a downgrade, replaying any bytes the
/// parsers had already buffered.
async fn opaque_relay<C, U>(client: MessageReader<C>, upstream: MessageReader<U>)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client, client_buffered) = client.into_parts();
    let (mut upstream, upstream_buffered) = upstream.into_parts();
    // Bytes read past the last parsed message belong to the peer.
    if !client_buffered.is_empty() && upstream.write_all(&client_buffered).await.is_err() {
        return;
    }
    if !upstream_buffered.is_empty() && client.write_all(&upstream_buffered).await.is_err() {
        return;
    }
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::engine::{shared, PolicyEngine};
    use crate::policy::keywords::{Keyword, MatchKind};
    use crate::types::Severity;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncReadExt;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn test_ctx(setup: impl FnOnce(&mut PolicyEngine)) -> (SessionCtx, Arc<Store>, EventSink) {
        let mut engine = PolicyEngine::new();
        setup(&mut engine);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let sink = EventSink::new();
        let ctx = SessionCtx {
            device_ip: "192.168.1.23".to_string(),
            scheme: "https",
            fallback_host: "example.com".to_string(),
            policy: shared(engine),
            store: store.clone(),
            sink: sink.clone(),
            max_body: 5 * 1024 * 1024,
            idle_timeout: Duration::from_secs(5),
            upstream_insecure: false,
        };
        (ctx, store, sink)
    }

    /// An origin that answers every request with a fixed response.
    fn spawn_origin(response: Vec<u8>) -> tokio::io::DuplexStream {
        let (near, mut far) = tokio::io::duplex(1 << 20);
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if far.write_all(&response).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        near
    }

    #[tokio::test]
    async fn test_blocked_request_gets_403_and_no_upstream() {
        let (ctx, store, sink) = test_ctx(|p| p.block_domain("blocked.test"));
        let (client, mut client_far) = tokio::io::duplex(1 << 16);

        let connect_called = Arc::new(AtomicBool::new(false));
        let called = connect_called.clone();
        let session = tokio::spawn(run_session(client, ctx, move || {
            called.store(true, Ordering::SeqCst);
            async move { Ok((spawn_origin(Vec::new()), false)) }
        }));

        client_far
            .write_all(b"GET / HTTP/1.1\r\nHost: blocked.test\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client_far.read_to_end(&mut response).await.unwrap();
        session.await.unwrap();

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 403"));
        assert!(text.contains("Domain blocked"));
        assert!(
            !connect_called.load(Ordering::SeqCst),
            "blocked requests must not open the upstream"
        );

        // Persisted, blocked flow plus blocked events on the stream.
        let flows = store
            .query_traffic(&crate::store::QueryFilter { blocked_only: true, limit: 10, ..Default::default() })
            .unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].host, "blocked.test");
        let lines = sink.drain();
        assert!(lines.iter().any(|l| l.contains("\"type\":\"blocked\"")));
    }

    #[tokio::test]
    async fn test_roundtrip_with_gzip_body() {
        // GET / returns 200 with a gzip body; one request event precedes
        // one response event; the decoded body is larger than the wire
        // body.
        let (ctx, store, sink) = test_ctx(|_| {});
        let body = "<html><body>hello hello hello hello hello</body></html>";
        let compressed = gzip(body.as_bytes());
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            compressed.len()
        )
        .into_bytes();
        response.extend_from_slice(&compressed);

        let (client, mut client_far) = tokio::io::duplex(1 << 20);
        let origin = spawn_origin(response);
        let session = tokio::spawn(run_session(client, ctx, move || async move {
            Ok((origin, false))
        }));

        client_far
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut got = Vec::new();
        client_far.read_to_end(&mut got).await.unwrap();
        session.await.unwrap();

        // Client got the exact upstream bytes (still compressed).
        let got_text = String::from_utf8_lossy(&got);
        assert!(got_text.starts_with("HTTP/1.1 200 OK"));
        assert!(got.windows(2).any(|w| w[0] == 0x1f && w[1] == 0x8b));

        let flows = store
            .query_traffic(&crate::store::QueryFilter { limit: 10, ..Default::default() })
            .unwrap();
        assert_eq!(flows.len(), 1);
        let flow = &flows[0];
        assert_eq!(flow.host, "example.com");
        assert_eq!(flow.method, "GET");
        assert_eq!(flow.path, "/");
        assert_eq!(flow.status_code, Some(200));
        assert_eq!(flow.response_body.body_type.as_deref(), Some("text/html"));
        assert!(flow.response_body.decoded_size > 0);
        assert!(flow.response_body.raw_size < flow.response_body.decoded_size);
        assert!(flow.response_body.text.as_deref().unwrap().contains("hello"));

        // request event strictly before response event.
        let lines = sink.drain();
        let req_idx = lines
            .iter()
            .position(|l| l.contains("\"event_type\":\"request\""))
            .expect("request event");
        let resp_idx = lines
            .iter()
            .position(|l| l.contains("\"event_type\":\"response\""))
            .expect("response event");
        assert!(req_idx < resp_idx);
    }

    #[tokio::test]
    async fn test_keyword_alert_on_response_body() {
        let (ctx, store, sink) = test_ctx(|p| {
            let mut kw = Keyword::new("kw1", "jackpot", MatchKind::Contains);
            kw.severity = Severity::High;
            kw.category = "gambling".to_string();
            p.keywords.add(kw);
        });
        let body = "spin to win the jackpot now";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes();

        let (client, mut client_far) = tokio::io::duplex(1 << 16);
        let origin = spawn_origin(response);
        let session = tokio::spawn(run_session(client, ctx, move || async move {
            Ok((origin, false))
        }));

        client_far
            .write_all(b"GET /promo HTTP/1.1\r\nHost: spins.test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut got = Vec::new();
        client_far.read_to_end(&mut got).await.unwrap();
        session.await.unwrap();

        let flows = store
            .query_traffic(&crate::store::QueryFilter { limit: 10, ..Default::default() })
            .unwrap();
        assert_eq!(flows[0].alerts, vec!["KEYWORD_RESPONSE:jackpot"]);

        let lines = sink.drain();
        assert!(lines.iter().any(|l| l.contains("\"type\":\"alert\"") && l.contains("jackpot")));
    }

    #[tokio::test]
    async fn test_sensitive_post_is_labeled() {
        let (ctx, store, _sink) = test_ctx(|_| {});
        let response = b"HTTP/1.1 204 No Content\r\n\r\n".to_vec();

        let (client, mut client_far) = tokio::io::duplex(1 << 16);
        let origin = spawn_origin(response);
        let session = tokio::spawn(run_session(client, ctx, move || async move {
            Ok((origin, false))
        }));

        let body = "user=kid&password=hunter2";
        let request = format!(
            "POST /login HTTP/1.1\r\nHost: a.com\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        client_far.write_all(request.as_bytes()).await.unwrap();
        let mut got = Vec::new();
        client_far.read_to_end(&mut got).await.unwrap();
        session.await.unwrap();

        let flows = store
            .query_traffic(&crate::store::QueryFilter { limit: 10, ..Default::default() })
            .unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].sensitivity, crate::types::Sensitivity::Sensitive);
        assert_eq!(
            flows[0].request_body.text.as_deref(),
            Some("user=kid&password=hunter2")
        );
    }

    #[tokio::test]
    async fn test_prefixed_stream_replays() {
        let (a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            b.write_all(b" world").await.unwrap();
        });
        let mut stream = PrefixedStream::new(b"hello".to_vec(), a);
        let mut out = vec![0u8; 11];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }
}
