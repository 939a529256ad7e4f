//! Pending request table.
//!
//! Maps in-flight xids to the oneshot sink that will receive the
//! matching response. At most one entry per xid exists at any time; a
//! registration against an occupied xid is refused and handed back to
//! the caller.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::ZkError;
use crate::protocol::OpCode;
use crate::watch::WatchRegistration;

/// A decoded reply header plus the undecoded body, as completed into a
/// waiting request's sink. Error translation happens at the API layer,
/// which knows the operation's return shape.
#[derive(Debug)]
pub(crate) struct Reply {
    pub zxid: i64,
    pub err: i32,
    pub body: Bytes,
}

/// One in-flight request.
pub(crate) struct Pending {
    pub xid: i32,
    pub opcode: OpCode,
    /// Original (pre-chroot) client path, attached to failures.
    pub client_path: Option<String>,
    pub deadline: Option<Instant>,
    /// Watcher to arm depending on the response outcome.
    pub watch: Option<WatchRegistration>,
    pub tx: oneshot::Sender<Result<Reply, ZkError>>,
}

/// Serialized table of in-flight requests.
#[derive(Default)]
pub(crate) struct PendingMap {
    inner: Mutex<HashMap<i32, Pending>>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight request. Returns the rejected entry if the
    /// xid is already occupied.
    pub fn register(&self, pending: Pending) -> Result<(), Pending> {
        let mut inner = self.inner.lock();
        if inner.contains_key(&pending.xid) {
            return Err(pending);
        }
        inner.insert(pending.xid, pending);
        Ok(())
    }

    /// Remove and return the request waiting on `xid`, or `None` when
    /// the xid is unknown. The caller completes the entry's sink.
    pub fn take(&self, xid: i32) -> Option<Pending> {
        self.inner.lock().remove(&xid)
    }

    /// Fail the single request waiting on `xid`, if still present.
    pub fn fail(&self, xid: i32, err: ZkError) {
        if let Some(pending) = self.inner.lock().remove(&xid) {
            let _ = pending.tx.send(Err(err));
        }
    }

    /// Fail every in-flight request, constructing each error from the
    /// request's own client path.
    pub fn fail_all(&self, make_err: impl Fn(Option<String>) -> ZkError) {
        let drained: Vec<Pending> = self.inner.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let err = make_err(pending.client_path.clone());
            let _ = pending.tx.send(Err(err));
        }
    }

    /// Fail every request whose deadline has passed. Returns how many
    /// were expired.
    pub fn expire_due(&self, now: Instant) -> usize {
        let due: Vec<Pending> = {
            let mut inner = self.inner.lock();
            let due_xids: Vec<i32> = inner
                .iter()
                .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
                .map(|(xid, _)| *xid)
                .collect();
            due_xids
                .into_iter()
                .filter_map(|xid| inner.remove(&xid))
                .collect()
        };

        let count = due.len();
        for pending in due {
            tracing::debug!(xid = pending.xid, opcode = ?pending.opcode, "request deadline passed");
            let path = pending.client_path.clone();
            let _ = pending.tx.send(Err(ZkError::OperationTimeout { path }));
        }
        count
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(xid: i32) -> (Pending, oneshot::Receiver<Result<Reply, ZkError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Pending {
                xid,
                opcode: OpCode::GetData,
                client_path: Some("/p".to_string()),
                deadline: None,
                watch: None,
                tx,
            },
            rx,
        )
    }

    #[test]
    fn register_then_take_completes_once() {
        let map = PendingMap::new();
        let (pending, mut rx) = entry(1);
        map.register(pending).ok().unwrap();

        let taken = map.take(1).unwrap();
        assert_eq!(map.len(), 0);
        let _ = taken.tx.send(Ok(Reply {
            zxid: 7,
            err: 0,
            body: Bytes::new(),
        }));

        let reply = rx.try_recv().unwrap().unwrap();
        assert_eq!(reply.zxid, 7);

        // A second response for the same xid finds nothing.
        assert!(map.take(1).is_none());
    }

    #[test]
    fn duplicate_xid_is_refused() {
        let map = PendingMap::new();
        let (first, _rx1) = entry(5);
        let (second, _rx2) = entry(5);

        map.register(first).ok().unwrap();
        assert!(map.register(second).is_err());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn unknown_xid_yields_nothing() {
        let map = PendingMap::new();
        assert!(map.take(42).is_none());
    }

    #[test]
    fn fail_all_carries_each_request_path() {
        let map = PendingMap::new();
        let (a, mut rx_a) = entry(1);
        let (b, mut rx_b) = entry(2);
        map.register(a).ok().unwrap();
        map.register(b).ok().unwrap();

        map.fail_all(|path| ZkError::ConnectionLoss { path });

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                Err(ZkError::ConnectionLoss { path }) => {
                    assert_eq!(path.as_deref(), Some("/p"));
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn expire_due_only_fails_past_deadlines() {
        let map = PendingMap::new();
        let now = Instant::now();

        let (mut due, mut rx_due) = entry(1);
        due.deadline = Some(now - Duration::from_millis(1));
        let (mut live, _rx_live) = entry(2);
        live.deadline = Some(now + Duration::from_secs(60));

        map.register(due).ok().unwrap();
        map.register(live).ok().unwrap();

        assert_eq!(map.expire_due(now), 1);
        assert_eq!(map.len(), 1);
        assert!(matches!(
            rx_due.try_recv().unwrap(),
            Err(ZkError::OperationTimeout { .. })
        ));
    }
}
