//! Session machine.
//!
//! One long-lived task owns the connection lifecycle: it rotates
//! through the endpoint list, performs the session handshake, reads and
//! dispatches frames, pings on a fixed cadence, and reconnects on
//! failure. Auth entries are replayed and watches re-armed on every
//! successful handshake, so the logical session survives transport
//! loss until the server declares it expired.
//!
//! All session-identity fields (`session_id`, password, negotiated
//! timeout, state) are mutated only from this task; the public API
//! reads atomic snapshots.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{code, Result, ZkError};
use crate::paths;
use crate::pending::{Pending, PendingMap, Reply};
use crate::protocol::records::{self, OpCode};
use crate::protocol::wire;
use crate::transport::{self, FrameReader, WriterHandle};
use crate::watch::{
    EventType, KeeperState, WatchKind, WatchMode, WatchRegistration, WatchRegistry, WatchedEvent,
    Watcher,
};

/// Fixed heartbeat cadence while connected.
const PING_INTERVAL: Duration = Duration::from_secs(3);

/// Pause after a full unsuccessful round over the endpoint list.
const RETRY_ROUND_DELAY: Duration = Duration::from_secs(1);

/// The session machine's externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A connect or handshake is in flight; requests queue.
    Connecting,
    /// Handshake complete; requests flow.
    SyncConnected,
    /// No transport; requests fail fast until the next handshake.
    Disconnected,
    /// The server expired the session. Terminal.
    Expired,
    /// The server rejected the session's credentials. Terminal.
    AuthFailed,
    /// The caller closed the client. Terminal.
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) struct AuthEntry {
    pub scheme: String,
    pub auth: Vec<u8>,
}

pub(crate) struct SessionConfig {
    pub endpoints: Vec<String>,
    pub session_timeout: Duration,
    pub chroot: Option<String>,
    pub request_timeout: Option<Duration>,
}

/// State shared between the session task and the public API.
pub(crate) struct Shared {
    pub config: SessionConfig,
    pub pending: PendingMap,
    pub watches: WatchRegistry,
    pub auth: Mutex<Vec<AuthEntry>>,
    xid: AtomicI32,
    last_zxid: AtomicI64,
    protocol_version: AtomicI32,
    session_id: AtomicI64,
    passwd: Mutex<Vec<u8>>,
    negotiated_timeout_ms: AtomicI32,
    state_tx: watch::Sender<SessionState>,
    writer: Mutex<Option<WriterHandle>>,
}

impl Shared {
    /// Must be called from within a tokio runtime (the watch registry
    /// spawns its dispatcher).
    pub fn new(config: SessionConfig, default_watcher: Option<Arc<dyn Watcher>>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        Arc::new(Self {
            config,
            pending: PendingMap::new(),
            watches: WatchRegistry::new(default_watcher),
            auth: Mutex::new(Vec::new()),
            xid: AtomicI32::new(1),
            last_zxid: AtomicI64::new(0),
            protocol_version: AtomicI32::new(0),
            session_id: AtomicI64::new(0),
            passwd: Mutex::new(vec![0u8; records::PASSWD_LEN]),
            negotiated_timeout_ms: AtomicI32::new(0),
            state_tx,
            writer: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            tracing::debug!(?prev, ?state, "session state change");
        }
    }

    pub fn next_xid(&self) -> i32 {
        self.xid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn last_zxid(&self) -> i64 {
        self.last_zxid.load(Ordering::SeqCst)
    }

    fn observe_zxid(&self, zxid: i64) {
        self.last_zxid.fetch_max(zxid, Ordering::SeqCst);
    }

    pub fn session_id(&self) -> i64 {
        self.session_id.load(Ordering::SeqCst)
    }

    pub fn negotiated_timeout_ms(&self) -> i32 {
        self.negotiated_timeout_ms.load(Ordering::SeqCst)
    }

    pub fn writer(&self) -> Option<WriterHandle> {
        self.writer.lock().clone()
    }

    fn reset_session_identity(&self) {
        self.protocol_version.store(0, Ordering::SeqCst);
        self.session_id.store(0, Ordering::SeqCst);
        *self.passwd.lock() = vec![0u8; records::PASSWD_LEN];
        self.negotiated_timeout_ms.store(0, Ordering::SeqCst);
    }

    fn fail_session(&self, state: SessionState, keeper: KeeperState, err: fn() -> ZkError) {
        self.set_state(state);
        self.watches.fail_all(keeper);
        self.pending.fail_all(|_| err());
    }
}

/// Build an auth frame (xid -4) for one credential.
pub(crate) fn auth_frame(entry: &AuthEntry) -> Bytes {
    let mut frame = wire::new_frame();
    records::RequestHeader::new(records::AUTH_XID, OpCode::Auth).encode(&mut frame);
    records::AuthRequest {
        auth_type: 0,
        scheme: entry.scheme.clone(),
        auth: entry.auth.clone(),
    }
    .encode(&mut frame);
    wire::finish_frame(frame)
}

enum Handshake {
    Established {
        reader: FrameReader,
        writer_task: JoinHandle<()>,
    },
    Expired,
}

enum ConnEnd {
    Lost,
    Fatal,
    Closed,
}

enum FrameOutcome {
    Continue,
    Fatal,
}

/// The session task: connect loop plus per-connection frame loop.
pub(crate) async fn run(shared: Arc<Shared>, mut closed_rx: watch::Receiver<bool>) {
    let endpoint_count = shared.config.endpoints.len();
    let mut next_endpoint = 0usize;
    let mut failures_in_round = 0usize;

    loop {
        if *closed_rx.borrow() {
            break;
        }

        let addr = shared.config.endpoints[next_endpoint % endpoint_count].clone();
        next_endpoint = next_endpoint.wrapping_add(1);
        shared.set_state(SessionState::Connecting);

        let attempt = tokio::select! {
            attempt = establish(&shared, &addr) => attempt,
            _ = closed_rx.changed() => break,
        };
        match attempt {
            Ok(Handshake::Established {
                reader,
                writer_task,
            }) => {
                failures_in_round = 0;
                let end = run_connection(&shared, reader, &mut closed_rx).await;

                // Clearing the slot closes the writer channel once the
                // in-flight sends finish; the writer task drains what
                // was already queued and exits on its own.
                *shared.writer.lock() = None;
                drop(writer_task);

                match end {
                    ConnEnd::Lost => {
                        shared.set_state(SessionState::Disconnected);
                        shared.watches.notify_state(KeeperState::Disconnected);
                        shared
                            .pending
                            .fail_all(|path| ZkError::ConnectionLoss { path });
                    }
                    ConnEnd::Fatal | ConnEnd::Closed => break,
                }
            }
            Ok(Handshake::Expired) => break,
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "connection attempt failed");
                shared.set_state(SessionState::Disconnected);
                failures_in_round += 1;
                if failures_in_round >= endpoint_count {
                    failures_in_round = 0;
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_ROUND_DELAY) => {}
                        _ = closed_rx.changed() => {}
                    }
                }
            }
        }
    }

    if !matches!(
        shared.state(),
        SessionState::Expired | SessionState::AuthFailed
    ) {
        shared.set_state(SessionState::Closed);
    }
    shared
        .pending
        .fail_all(|path| ZkError::ConnectionLoss { path });
    tracing::debug!("session task stopped");
}

async fn establish(shared: &Arc<Shared>, addr: &str) -> Result<Handshake> {
    let deadline = shared.config.session_timeout;
    let (mut reader, writer, writer_task) = transport::connect(addr, deadline).await?;

    match handshake(shared, addr, &mut reader, &writer).await {
        Ok(true) => Ok(Handshake::Established {
            reader,
            writer_task,
        }),
        Ok(false) => {
            writer_task.abort();
            Ok(Handshake::Expired)
        }
        Err(e) => {
            writer_task.abort();
            Err(e)
        }
    }
}

/// Send the connect request and process the reply. Returns `false`
/// when the server expired the session (terminal).
async fn handshake(
    shared: &Arc<Shared>,
    addr: &str,
    reader: &mut FrameReader,
    writer: &WriterHandle,
) -> Result<bool> {
    let request = records::ConnectRequest {
        protocol_version: 0,
        last_zxid_seen: shared.last_zxid(),
        timeout_ms: shared.config.session_timeout.as_millis() as i32,
        session_id: shared.session_id(),
        passwd: shared.passwd.lock().clone(),
    };
    let mut frame = wire::new_frame();
    request.encode(&mut frame);
    writer.send(wire::finish_frame(frame)).await?;

    let deadline = shared.config.session_timeout;
    let mut payload = tokio::time::timeout(deadline, reader.next_frame())
        .await
        .map_err(|_| {
            ZkError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("handshake with {addr} timed out"),
            ))
        })??;
    let response = records::ConnectResponse::decode(&mut payload)?;

    if response.timeout_ms <= 0 {
        tracing::warn!(session_id = shared.session_id(), "session expired by server");
        shared.reset_session_identity();
        shared.fail_session(SessionState::Expired, KeeperState::Expired, || {
            ZkError::SessionExpired
        });
        return Ok(false);
    }

    shared
        .protocol_version
        .store(response.protocol_version, Ordering::SeqCst);
    shared.session_id.store(response.session_id, Ordering::SeqCst);
    *shared.passwd.lock() = response.passwd;
    shared
        .negotiated_timeout_ms
        .store(response.timeout_ms, Ordering::SeqCst);
    tracing::info!(
        addr = %addr,
        session_id = response.session_id,
        negotiated_ms = response.timeout_ms,
        "session established"
    );

    // Auth replay and watch re-arming are queued before the writer is
    // published, so user requests cannot overtake them on the wire.
    let auth_entries: Vec<AuthEntry> = shared.auth.lock().clone();
    for entry in &auth_entries {
        writer.send(auth_frame(entry)).await?;
    }

    let (data, exist, child) = shared.watches.snapshot();
    if !(data.is_empty() && exist.is_empty() && child.is_empty()) {
        let chroot = shared.config.chroot.as_deref();
        let prefixed = |list: Vec<String>| -> Vec<String> {
            list.into_iter()
                .map(|p| paths::prepend_chroot(chroot, &p))
                .collect()
        };
        let request = records::SetWatchesRequest {
            relative_zxid: shared.last_zxid(),
            data_watches: prefixed(data),
            exist_watches: prefixed(exist),
            child_watches: prefixed(child),
        };
        let mut frame = wire::new_frame();
        records::RequestHeader::new(records::SET_WATCHES_XID, OpCode::SetWatches)
            .encode(&mut frame);
        request.encode(&mut frame);
        writer.send(wire::finish_frame(frame)).await?;
    }

    *shared.writer.lock() = Some(writer.clone());
    shared.set_state(SessionState::SyncConnected);
    shared.watches.notify_state(KeeperState::SyncConnected);

    Ok(true)
}

async fn run_connection(
    shared: &Arc<Shared>,
    mut reader: FrameReader,
    closed_rx: &mut watch::Receiver<bool>,
) -> ConnEnd {
    let negotiated = Duration::from_millis(shared.negotiated_timeout_ms().max(0) as u64);
    let mut last_recv = Instant::now();
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_INTERVAL,
        PING_INTERVAL,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = reader.next_frame() => {
                match frame {
                    Ok(payload) => {
                        last_recv = Instant::now();
                        match handle_frame(shared, payload) {
                            Ok(FrameOutcome::Continue) => {}
                            Ok(FrameOutcome::Fatal) => return ConnEnd::Fatal,
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping connection on malformed frame");
                                return ConnEnd::Lost;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "read failed");
                        return ConnEnd::Lost;
                    }
                }
            }
            _ = ping.tick() => {
                if last_recv.elapsed() >= negotiated {
                    tracing::warn!(
                        timeout_ms = shared.negotiated_timeout_ms(),
                        "no frame within the negotiated timeout"
                    );
                    return ConnEnd::Lost;
                }
                if shared.config.request_timeout.is_some() {
                    let expired = shared.pending.expire_due(Instant::now());
                    if expired > 0 {
                        tracing::debug!(expired, "expired overdue requests");
                    }
                }
                if shared.state() == SessionState::SyncConnected {
                    let mut frame = wire::new_frame();
                    records::RequestHeader::new(records::PING_XID, OpCode::Ping)
                        .encode(&mut frame);
                    if let Some(writer) = shared.writer() {
                        if writer.send(wire::finish_frame(frame)).await.is_err() {
                            return ConnEnd::Lost;
                        }
                    }
                }
            }
            changed = closed_rx.changed() => {
                if changed.is_err() || *closed_rx.borrow() {
                    return ConnEnd::Closed;
                }
            }
        }
    }
}

fn handle_frame(shared: &Arc<Shared>, payload: Bytes) -> Result<FrameOutcome> {
    let mut buf = payload;
    let header = records::ReplyHeader::decode(&mut buf)?;
    shared.observe_zxid(header.zxid);

    match header.xid {
        records::WATCHER_EVENT_XID => {
            let event = records::WatcherEvent::decode(&mut buf)?;
            let path = if event.path.is_empty() {
                None
            } else {
                Some(paths::strip_chroot(
                    shared.config.chroot.as_deref(),
                    &event.path,
                ))
            };
            let watched = WatchedEvent {
                event_type: EventType::from_i32(event.event_type),
                keeper_state: KeeperState::from_i32(event.state),
                path,
            };
            tracing::debug!(?watched, "watch event");
            shared.watches.dispatch(watched);
            Ok(FrameOutcome::Continue)
        }
        records::PING_XID => Ok(FrameOutcome::Continue),
        records::AUTH_XID => {
            if header.err == code::AUTH_FAILED {
                tracing::error!("authentication rejected by server");
                shared.fail_session(SessionState::AuthFailed, KeeperState::AuthFailed, || {
                    ZkError::AuthFailed
                });
                return Ok(FrameOutcome::Fatal);
            }
            Ok(FrameOutcome::Continue)
        }
        records::SET_WATCHES_XID => {
            if header.err != code::OK {
                tracing::warn!(err = header.err, "set-watches replay failed");
            }
            Ok(FrameOutcome::Continue)
        }
        xid => {
            let Some(pending) = shared.pending.take(xid) else {
                tracing::warn!(xid, "response for unknown xid");
                return Ok(FrameOutcome::Continue);
            };
            // Arm the watch before any later frame is handled, so the
            // matching event cannot overtake the registration.
            if let Some(registration) = pending.watch {
                apply_watch_registration(shared, registration, header.err);
            }
            let _ = pending.tx.send(Ok(Reply {
                zxid: header.zxid,
                err: header.err,
                body: buf,
            }));
            match header.err {
                code::SESSION_EXPIRED => {
                    tracing::error!("server declared the session expired");
                    shared.reset_session_identity();
                    shared.fail_session(SessionState::Expired, KeeperState::Expired, || {
                        ZkError::SessionExpired
                    });
                    Ok(FrameOutcome::Fatal)
                }
                code::AUTH_FAILED => {
                    tracing::error!("server reported auth failure");
                    shared.fail_session(SessionState::AuthFailed, KeeperState::AuthFailed, || {
                        ZkError::AuthFailed
                    });
                    Ok(FrameOutcome::Fatal)
                }
                _ => Ok(FrameOutcome::Continue),
            }
        }
    }
}

fn apply_watch_registration(shared: &Arc<Shared>, registration: WatchRegistration, err: i32) {
    let WatchRegistration {
        watcher,
        path,
        mode,
    } = registration;
    match mode {
        WatchMode::Data if err == code::OK => {
            shared.watches.register(WatchKind::Data, &path, watcher);
        }
        WatchMode::Child if err == code::OK => {
            shared.watches.register(WatchKind::Child, &path, watcher);
        }
        WatchMode::Exists => match err {
            code::OK => shared.watches.register(WatchKind::Data, &path, watcher),
            code::NO_NODE => shared.watches.register(WatchKind::Exist, &path, watcher),
            _ => {}
        },
        _ => {}
    }
}

/// Serialize and send one request, returning its reply.
///
/// Requests issued mid-handshake wait for the connection to settle;
/// requests issued while plainly disconnected fail fast.
pub(crate) async fn submit(
    shared: &Arc<Shared>,
    opcode: OpCode,
    client_path: Option<&str>,
    watch: Option<WatchRegistration>,
    encode_body: impl FnOnce(&mut BytesMut),
) -> Result<Reply> {
    wait_until_connected(shared, client_path).await?;

    let xid = shared.next_xid();
    let mut frame = wire::new_frame();
    records::RequestHeader::new(xid, opcode).encode(&mut frame);
    encode_body(&mut frame);
    let frame = wire::finish_frame(frame);

    let (tx, rx) = oneshot::channel();
    let registered = shared.pending.register(Pending {
        xid,
        opcode,
        client_path: client_path.map(str::to_string),
        deadline: shared.config.request_timeout.map(|d| Instant::now() + d),
        watch,
        tx,
    });
    if registered.is_err() {
        tracing::error!(xid, "xid already in flight");
        return Err(ZkError::System {
            code: code::RUNTIME_INCONSISTENCY,
            path: client_path.map(str::to_string),
        });
    }

    match shared.writer() {
        Some(writer) => {
            if writer.send(frame).await.is_err() {
                shared.pending.fail(
                    xid,
                    ZkError::ConnectionLoss {
                        path: client_path.map(str::to_string),
                    },
                );
            }
        }
        None => shared.pending.fail(
            xid,
            ZkError::ConnectionLoss {
                path: client_path.map(str::to_string),
            },
        ),
    }

    match rx.await {
        Ok(result) => result,
        Err(_) => Err(ZkError::ConnectionLoss {
            path: client_path.map(str::to_string),
        }),
    }
}

async fn wait_until_connected(shared: &Arc<Shared>, client_path: Option<&str>) -> Result<()> {
    let mut state_rx = shared.subscribe_state();
    loop {
        let state = *state_rx.borrow_and_update();
        match state {
            SessionState::SyncConnected => return Ok(()),
            SessionState::Connecting => {
                if state_rx.changed().await.is_err() {
                    return Err(ZkError::Closed);
                }
            }
            SessionState::Disconnected => {
                return Err(ZkError::ConnectionLoss {
                    path: client_path.map(str::to_string),
                })
            }
            SessionState::Expired => return Err(ZkError::SessionExpired),
            SessionState::AuthFailed => return Err(ZkError::AuthFailed),
            SessionState::Closed => return Err(ZkError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            endpoints: vec!["127.0.0.1:2181".to_string()],
            session_timeout: Duration::from_secs(10),
            chroot: None,
            request_timeout: None,
        }
    }

    #[tokio::test]
    async fn xids_are_positive_and_strictly_increasing() {
        let shared = Shared::new(config(), None);
        let first = shared.next_xid();
        let second = shared.next_xid();
        assert!(first > 0);
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn last_zxid_is_monotonic() {
        let shared = Shared::new(config(), None);
        shared.observe_zxid(10);
        assert_eq!(shared.last_zxid(), 10);
        shared.observe_zxid(5);
        assert_eq!(shared.last_zxid(), 10);
        shared.observe_zxid(11);
        assert_eq!(shared.last_zxid(), 11);
    }

    #[tokio::test]
    async fn reset_clears_session_identity() {
        let shared = Shared::new(config(), None);
        shared.session_id.store(0xAB, Ordering::SeqCst);
        *shared.passwd.lock() = vec![0x11; records::PASSWD_LEN];
        shared.negotiated_timeout_ms.store(10_000, Ordering::SeqCst);

        shared.reset_session_identity();

        assert_eq!(shared.session_id(), 0);
        assert_eq!(*shared.passwd.lock(), vec![0u8; records::PASSWD_LEN]);
        assert_eq!(shared.negotiated_timeout_ms(), 0);
    }

    #[tokio::test]
    async fn submit_fails_fast_when_disconnected() {
        let shared = Shared::new(config(), None);
        shared.set_state(SessionState::Disconnected);

        let result = submit(&shared, OpCode::GetData, Some("/p"), None, |_| {}).await;
        assert!(matches!(
            result,
            Err(ZkError::ConnectionLoss { path: Some(p) }) if p == "/p"
        ));
    }

    #[tokio::test]
    async fn submit_fails_with_terminal_errors() {
        let shared = Shared::new(config(), None);

        shared.set_state(SessionState::Expired);
        assert!(matches!(
            submit(&shared, OpCode::GetData, None, None, |_| {}).await,
            Err(ZkError::SessionExpired)
        ));

        shared.set_state(SessionState::AuthFailed);
        assert!(matches!(
            submit(&shared, OpCode::GetData, None, None, |_| {}).await,
            Err(ZkError::AuthFailed)
        ));

        shared.set_state(SessionState::Closed);
        assert!(matches!(
            submit(&shared, OpCode::GetData, None, None, |_| {}).await,
            Err(ZkError::Closed)
        ));
    }

    #[tokio::test]
    async fn handle_frame_updates_last_zxid_only_forward() {
        let shared = Shared::new(config(), None);

        let mut frame = BytesMut::new();
        records::ReplyHeader {
            xid: records::PING_XID,
            zxid: 9,
            err: 0,
        }
        .encode(&mut frame);
        handle_frame(&shared, frame.freeze()).unwrap();
        assert_eq!(shared.last_zxid(), 9);

        let mut frame = BytesMut::new();
        records::ReplyHeader {
            xid: records::PING_XID,
            zxid: 4,
            err: 0,
        }
        .encode(&mut frame);
        handle_frame(&shared, frame.freeze()).unwrap();
        assert_eq!(shared.last_zxid(), 9);
    }

    #[tokio::test]
    async fn truncated_frame_is_a_decode_error() {
        let shared = Shared::new(config(), None);
        let result = handle_frame(&shared, Bytes::from_static(&[0, 0, 0]));
        assert!(matches!(result, Err(ZkError::Decode(_))));
    }
}
