//! Client builder and public request surface.
//!
//! [`ZkClientBuilder`] configures the session (connect string, timeout,
//! chroot, default watcher) and [`ZkClient`] exposes the tree
//! operations. Every path operation validates the client path, rewrites
//! it under the session chroot, and submits through the session
//! machine; responses are decoded back into client-side shapes with the
//! chroot stripped from any returned path.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use zkwire::{Acl, CreateMode, ZkClient};
//!
//! #[tokio::main]
//! async fn main() -> zkwire::Result<()> {
//!     let zk = ZkClient::builder("127.0.0.1:2181")
//!         .session_timeout(Duration::from_secs(10))
//!         .connect()
//!         .await?;
//!
//!     let path = zk
//!         .create("/task", b"payload".to_vec(), Acl::open_unsafe(), CreateMode::Persistent)
//!         .await?;
//!     let (data, stat) = zk.get_data(&path, false).await?;
//!     println!("{} bytes at version {}", data.len(), stat.version);
//!     zk.close().await
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{code, Result, ZkError};
use crate::paths;
use crate::pending::Reply;
use crate::protocol::records::{self, Acl, CreateMode, OpCode, Stat};
use crate::protocol::wire;
use crate::session::{self, AuthEntry, SessionConfig, SessionState, Shared};
use crate::watch::{WatchMode, WatchRegistration, Watcher};

/// Builder for configuring and connecting a [`ZkClient`].
pub struct ZkClientBuilder {
    connect_string: String,
    session_timeout: Duration,
    chroot: Option<String>,
    default_watcher: Option<Arc<dyn Watcher>>,
    request_timeout: Option<Duration>,
}

impl ZkClientBuilder {
    /// Start a builder for the given comma-separated `host:port` list.
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
            session_timeout: Duration::from_secs(30),
            chroot: None,
            default_watcher: None,
            request_timeout: None,
        }
    }

    /// Session timeout requested from the server.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Path prefix virtualizing the namespace root for this session.
    pub fn chroot(mut self, chroot: impl Into<String>) -> Self {
        self.chroot = Some(chroot.into());
        self
    }

    /// Watcher receiving session state transitions and the events of
    /// boolean-flavored watch registrations.
    pub fn default_watcher<W: Watcher + 'static>(mut self, watcher: W) -> Self {
        self.default_watcher = Some(Arc::new(watcher));
        self
    }

    /// Optional per-operation deadline. Overdue requests fail with
    /// `OperationTimeout`. Off by default.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Spawn the session machine and return the client.
    ///
    /// Returns immediately; the first connection is established in the
    /// background and requests queue until the handshake settles.
    pub async fn connect(self) -> Result<ZkClient> {
        let endpoints: Vec<String> = self
            .connect_string
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(ZkError::System {
                code: code::BAD_ARGUMENTS,
                path: None,
            });
        }

        let chroot = match self.chroot.as_deref() {
            None | Some("") | Some("/") => None,
            Some(chroot) => {
                paths::validate_path(chroot, false)?;
                Some(chroot.to_string())
            }
        };

        let config = SessionConfig {
            endpoints,
            session_timeout: self.session_timeout,
            chroot,
            request_timeout: self.request_timeout,
        };
        let shared = Shared::new(config, self.default_watcher);
        let (closed_tx, closed_rx) = watch::channel(false);
        let task = tokio::spawn(session::run(shared.clone(), closed_rx));

        Ok(ZkClient {
            shared,
            closed_tx,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Handle to one logical session against the cluster.
///
/// Cheap to share behind an `Arc`; all operations take `&self`.
pub struct ZkClient {
    shared: Arc<Shared>,
    closed_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ZkClient {
    /// Create a builder for the given connect string.
    pub fn builder(connect_string: impl Into<String>) -> ZkClientBuilder {
        ZkClientBuilder::new(connect_string)
    }

    /// Connect with default options.
    pub async fn connect(connect_string: &str, session_timeout: Duration) -> Result<ZkClient> {
        ZkClientBuilder::new(connect_string)
            .session_timeout(session_timeout)
            .connect()
            .await
    }

    /// Current session machine state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Server-assigned session id (0 before the first handshake).
    pub fn session_id(&self) -> i64 {
        self.shared.session_id()
    }

    /// Highest transaction id seen on this session.
    pub fn last_zxid(&self) -> i64 {
        self.shared.last_zxid()
    }

    /// Session timeout the server actually granted, in milliseconds.
    pub fn negotiated_timeout_ms(&self) -> i32 {
        self.shared.negotiated_timeout_ms()
    }

    /// Create a znode. Resolves to the created path, which differs from
    /// the requested one for sequential modes.
    pub async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        paths::validate_path(path, mode.is_sequential())?;
        let request = records::CreateRequest {
            path: self.server_path(path),
            data,
            acl,
            flags: mode as i32,
        };
        let reply = session::submit(&self.shared, OpCode::Create, Some(path), None, |buf| {
            request.encode(buf)
        })
        .await?;

        let mut body = self.checked(reply, path)?;
        let response = records::CreateResponse::decode(&mut body)?;
        Ok(self.client_path(&response.path))
    }

    /// Delete a znode. `None` version matches any version.
    pub async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        paths::validate_path(path, false)?;
        let request = records::DeleteRequest {
            path: self.server_path(path),
            version: version.unwrap_or(-1),
        };
        let reply = session::submit(&self.shared, OpCode::Delete, Some(path), None, |buf| {
            request.encode(buf)
        })
        .await?;

        self.checked(reply, path)?;
        Ok(())
    }

    /// Stat a znode, or `None` if it does not exist. With `watch`, the
    /// default watcher is armed: as a data watch when the node exists,
    /// as an existence watch otherwise.
    pub async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>> {
        self.exists_impl(path, self.flag_watcher(watch)).await
    }

    /// Like [`exists`](Self::exists) with a dedicated watcher.
    pub async fn exists_w<W: Watcher + 'static>(
        &self,
        path: &str,
        watcher: W,
    ) -> Result<Option<Stat>> {
        self.exists_impl(path, Some(Arc::new(watcher))).await
    }

    async fn exists_impl(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Option<Stat>> {
        paths::validate_path(path, false)?;
        let request = records::ExistsRequest {
            path: self.server_path(path),
            watch: watcher.is_some(),
        };
        let watch = self.registration(path, watcher, WatchMode::Exists);
        let reply = session::submit(&self.shared, OpCode::Exists, Some(path), watch, |buf| {
            request.encode(buf)
        })
        .await?;

        match reply.err {
            code::OK => {
                let mut body = reply.body;
                Ok(Some(records::ExistsResponse::decode(&mut body)?.stat))
            }
            code::NO_NODE => Ok(None),
            err => Err(ZkError::from_server_code(err, Some(path))),
        }
    }

    /// Read a znode's payload and stat. On success with `watch`, the
    /// default watcher is armed as a data watch.
    pub async fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat)> {
        self.get_data_impl(path, self.flag_watcher(watch)).await
    }

    /// Like [`get_data`](Self::get_data) with a dedicated watcher.
    pub async fn get_data_w<W: Watcher + 'static>(
        &self,
        path: &str,
        watcher: W,
    ) -> Result<(Vec<u8>, Stat)> {
        self.get_data_impl(path, Some(Arc::new(watcher))).await
    }

    async fn get_data_impl(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<(Vec<u8>, Stat)> {
        paths::validate_path(path, false)?;
        let request = records::GetDataRequest {
            path: self.server_path(path),
            watch: watcher.is_some(),
        };
        let watch = self.registration(path, watcher, WatchMode::Data);
        let reply = session::submit(&self.shared, OpCode::GetData, Some(path), watch, |buf| {
            request.encode(buf)
        })
        .await?;

        let mut body = self.checked(reply, path)?;
        let response = records::GetDataResponse::decode(&mut body)?;
        Ok((response.data, response.stat))
    }

    /// Write a znode's payload. `None` version matches any version.
    pub async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat> {
        paths::validate_path(path, false)?;
        let request = records::SetDataRequest {
            path: self.server_path(path),
            data,
            version: version.unwrap_or(-1),
        };
        let reply = session::submit(&self.shared, OpCode::SetData, Some(path), None, |buf| {
            request.encode(buf)
        })
        .await?;

        let mut body = self.checked(reply, path)?;
        Ok(records::SetDataResponse::decode(&mut body)?.stat)
    }

    /// Read a znode's ACL and stat.
    pub async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat)> {
        paths::validate_path(path, false)?;
        let request = records::GetAclRequest {
            path: self.server_path(path),
        };
        let reply = session::submit(&self.shared, OpCode::GetAcl, Some(path), None, |buf| {
            request.encode(buf)
        })
        .await?;

        let mut body = self.checked(reply, path)?;
        let response = records::GetAclResponse::decode(&mut body)?;
        Ok((response.acl, response.stat))
    }

    /// Replace a znode's ACL. `None` version matches any version.
    pub async fn set_acl(&self, path: &str, acl: Vec<Acl>, version: Option<i32>) -> Result<Stat> {
        paths::validate_path(path, false)?;
        let request = records::SetAclRequest {
            path: self.server_path(path),
            acl,
            version: version.unwrap_or(-1),
        };
        let reply = session::submit(&self.shared, OpCode::SetAcl, Some(path), None, |buf| {
            request.encode(buf)
        })
        .await?;

        let mut body = self.checked(reply, path)?;
        Ok(records::SetAclResponse::decode(&mut body)?.stat)
    }

    /// List a znode's children. On success with `watch`, the default
    /// watcher is armed as a child watch.
    pub async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>> {
        self.get_children_impl(path, self.flag_watcher(watch)).await
    }

    /// Like [`get_children`](Self::get_children) with a dedicated
    /// watcher.
    pub async fn get_children_w<W: Watcher + 'static>(
        &self,
        path: &str,
        watcher: W,
    ) -> Result<Vec<String>> {
        self.get_children_impl(path, Some(Arc::new(watcher))).await
    }

    async fn get_children_impl(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Vec<String>> {
        paths::validate_path(path, false)?;
        let request = records::GetChildrenRequest {
            path: self.server_path(path),
            watch: watcher.is_some(),
        };
        let watch = self.registration(path, watcher, WatchMode::Child);
        let reply = session::submit(&self.shared, OpCode::GetChildren, Some(path), watch, |buf| {
            request.encode(buf)
        })
        .await?;

        let mut body = self.checked(reply, path)?;
        let response = records::GetChildrenResponse::decode(&mut body)?;
        Ok(response.children)
    }

    /// List a znode's children together with its stat.
    pub async fn get_children2(&self, path: &str, watch: bool) -> Result<(Vec<String>, Stat)> {
        self.get_children2_impl(path, self.flag_watcher(watch))
            .await
    }

    /// Like [`get_children2`](Self::get_children2) with a dedicated
    /// watcher.
    pub async fn get_children2_w<W: Watcher + 'static>(
        &self,
        path: &str,
        watcher: W,
    ) -> Result<(Vec<String>, Stat)> {
        self.get_children2_impl(path, Some(Arc::new(watcher))).await
    }

    async fn get_children2_impl(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<(Vec<String>, Stat)> {
        paths::validate_path(path, false)?;
        let request = records::GetChildrenRequest {
            path: self.server_path(path),
            watch: watcher.is_some(),
        };
        let watch = self.registration(path, watcher, WatchMode::Child);
        let reply = session::submit(&self.shared, OpCode::GetChildren2, Some(path), watch, |buf| {
            request.encode(buf)
        })
        .await?;

        let mut body = self.checked(reply, path)?;
        let response = records::GetChildren2Response::decode(&mut body)?;
        Ok((response.children, response.stat))
    }

    /// Attach a credential to the session. The credential is stored and
    /// replayed on every reconnect; the auth frame itself is sent
    /// best-effort if a connection is up.
    pub async fn add_auth(&self, scheme: &str, auth: Vec<u8>) -> Result<()> {
        let entry = AuthEntry {
            scheme: scheme.to_string(),
            auth,
        };
        let frame = session::auth_frame(&entry);
        self.shared.auth.lock().push(entry);

        if let Some(writer) = self.shared.writer() {
            if writer.send(frame).await.is_err() {
                tracing::debug!("auth frame not sent, will replay on reconnect");
            }
        }
        Ok(())
    }

    /// Close the session: send one CloseSession frame, stop the session
    /// machine, and fail any still-pending requests. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if *self.closed_tx.borrow() {
            return Ok(());
        }

        if let Some(writer) = self.shared.writer() {
            let mut frame = wire::new_frame();
            records::RequestHeader::new(self.shared.next_xid(), OpCode::CloseSession)
                .encode(&mut frame);
            let _ = writer.send(wire::finish_frame(frame)).await;
        }

        let _ = self.closed_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    fn flag_watcher(&self, watch: bool) -> Option<Arc<dyn Watcher>> {
        if watch {
            self.shared.watches.default_watcher()
        } else {
            None
        }
    }

    fn registration(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
        mode: WatchMode,
    ) -> Option<WatchRegistration> {
        watcher.map(|watcher| WatchRegistration {
            watcher,
            path: path.to_string(),
            mode,
        })
    }

    fn checked(&self, reply: Reply, path: &str) -> Result<Bytes> {
        if reply.err != code::OK {
            return Err(ZkError::from_server_code(reply.err, Some(path)));
        }
        Ok(reply.body)
    }

    fn server_path(&self, client_path: &str) -> String {
        paths::prepend_chroot(self.shared.config.chroot.as_deref(), client_path)
    }

    fn client_path(&self, server_path: &str) -> String {
        paths::strip_chroot(self.shared.config.chroot.as_deref(), server_path)
    }
}

impl Drop for ZkClient {
    fn drop(&mut self) {
        let _ = self.closed_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_connect_string_is_rejected() {
        let result = ZkClientBuilder::new("").connect().await;
        assert!(matches!(
            result,
            Err(ZkError::System {
                code: code::BAD_ARGUMENTS,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn invalid_chroot_is_rejected() {
        let result = ZkClientBuilder::new("127.0.0.1:2181")
            .chroot("app")
            .connect()
            .await;
        assert!(matches!(result, Err(ZkError::InvalidPath { .. })));
    }

    #[tokio::test]
    async fn root_chroot_is_treated_as_none() {
        let client = ZkClientBuilder::new("127.0.0.1:1") // nothing listens
            .chroot("/")
            .connect()
            .await
            .unwrap();
        assert_eq!(client.server_path("/x"), "/x");
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_path_fails_before_anything_is_sent() {
        let client = ZkClient::connect("127.0.0.1:1", Duration::from_secs(1))
            .await
            .unwrap();
        let result = client.get_data("no-slash", false).await;
        assert!(matches!(result, Err(ZkError::InvalidPath { .. })));
        client.close().await.unwrap();
    }
}
