//! Watches: one-shot change notifications.
//!
//! The registry maps znode paths to the watchers armed on them, split by
//! watch kind. Materializing an incoming event removes the matching
//! watchers atomically (the one-shot contract) and hands them to a
//! dispatcher task, so a slow watcher never stalls protocol reads.
//! Events are delivered in the order they were received.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// The kind of change an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

impl EventType {
    pub fn from_i32(v: i32) -> EventType {
        match v {
            -1 => EventType::None,
            1 => EventType::NodeCreated,
            2 => EventType::NodeDeleted,
            3 => EventType::NodeDataChanged,
            4 => EventType::NodeChildrenChanged,
            other => {
                tracing::warn!(value = other, "unknown event type, treating as None");
                EventType::None
            }
        }
    }
}

/// The session's externally visible connection condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperState {
    Disconnected,
    NoSyncConnected,
    SyncConnected,
    AuthFailed,
    Expired,
    Unknown,
}

impl KeeperState {
    pub fn from_i32(v: i32) -> KeeperState {
        match v {
            0 => KeeperState::Disconnected,
            1 => KeeperState::NoSyncConnected,
            3 => KeeperState::SyncConnected,
            4 => KeeperState::AuthFailed,
            -112 => KeeperState::Expired,
            _ => KeeperState::Unknown,
        }
    }

    /// States after which no further events can arrive.
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, KeeperState::Expired | KeeperState::AuthFailed)
    }
}

/// A change notification as handed to watchers.
///
/// `path` is `None` for session-level (state change) events and carries
/// the client-side path (chroot stripped) otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub keeper_state: KeeperState,
    pub path: Option<String>,
}

/// Callback capability fired for watch and state-change events.
///
/// Watchers registered on a node fire at most once per registration;
/// re-register to keep watching. The default watcher additionally
/// receives session state transitions.
pub trait Watcher: Send + Sync {
    fn on_event(&self, event: WatchedEvent);
}

impl<F> Watcher for F
where
    F: Fn(WatchedEvent) + Send + Sync,
{
    fn on_event(&self, event: WatchedEvent) {
        self(event)
    }
}

/// Which registration table a watcher lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchKind {
    Data,
    Exist,
    Child,
}

/// How an operation arms its watcher once the response outcome is
/// known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchMode {
    /// Arm a data watch on success.
    Data,
    /// Arm a child watch on success.
    Child,
    /// Arm a data watch if the node exists, an existence watch if the
    /// server reported no-node.
    Exists,
}

/// A watcher waiting on an in-flight request's outcome.
///
/// Applied by the session reader when the response completes, before
/// any later frame is processed, so an event arriving right behind the
/// response cannot slip past an unarmed watcher.
pub(crate) struct WatchRegistration {
    pub watcher: Arc<dyn Watcher>,
    /// Client-side path the watcher is armed under.
    pub path: String,
    pub mode: WatchMode,
}

#[derive(Default)]
struct Tables {
    data: HashMap<String, Vec<Arc<dyn Watcher>>>,
    exist: HashMap<String, Vec<Arc<dyn Watcher>>>,
    child: HashMap<String, Vec<Arc<dyn Watcher>>>,
}

impl Tables {
    fn table_mut(&mut self, kind: WatchKind) -> &mut HashMap<String, Vec<Arc<dyn Watcher>>> {
        match kind {
            WatchKind::Data => &mut self.data,
            WatchKind::Exist => &mut self.exist,
            WatchKind::Child => &mut self.child,
        }
    }

    fn take(&mut self, kind: WatchKind, path: &str, into: &mut Vec<Arc<dyn Watcher>>) {
        if let Some(watchers) = self.table_mut(kind).remove(path) {
            for w in watchers {
                if !into.iter().any(|seen| Arc::ptr_eq(seen, &w)) {
                    into.push(w);
                }
            }
        }
    }
}

struct Delivery {
    event: WatchedEvent,
    targets: Vec<Arc<dyn Watcher>>,
}

/// Path-keyed registry of armed watchers plus the default watcher slot.
pub(crate) struct WatchRegistry {
    tables: Mutex<Tables>,
    default_watcher: Option<Arc<dyn Watcher>>,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl WatchRegistry {
    /// Create the registry and spawn its dispatcher task. Must be
    /// called from within a tokio runtime.
    pub fn new(default_watcher: Option<Arc<dyn Watcher>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                for watcher in &delivery.targets {
                    watcher.on_event(delivery.event.clone());
                }
            }
        });
        Self {
            tables: Mutex::new(Tables::default()),
            default_watcher,
            tx,
        }
    }

    /// The watcher holding the default slot, if one was configured.
    pub fn default_watcher(&self) -> Option<Arc<dyn Watcher>> {
        self.default_watcher.clone()
    }

    /// Arm a watcher under `(kind, path)`. Re-registering the same
    /// watcher collapses to one entry.
    pub fn register(&self, kind: WatchKind, path: &str, watcher: Arc<dyn Watcher>) {
        let mut tables = self.tables.lock();
        let entry = tables.table_mut(kind).entry(path.to_string()).or_default();
        if !entry.iter().any(|w| Arc::ptr_eq(w, &watcher)) {
            entry.push(watcher);
        }
    }

    /// Remove and return the watchers a node event fires, per the
    /// one-shot contract. Session-level events (`EventType::None`)
    /// target only the default watcher and remove nothing.
    fn materialize(&self, event: &WatchedEvent) -> Vec<Arc<dyn Watcher>> {
        let mut targets = Vec::new();

        if event.event_type == EventType::None {
            targets.extend(self.default_watcher.clone());
            return targets;
        }

        let Some(path) = event.path.as_deref() else {
            tracing::warn!(?event, "node event without a path, dropping");
            return targets;
        };

        let mut tables = self.tables.lock();
        match event.event_type {
            EventType::NodeCreated | EventType::NodeDataChanged => {
                tables.take(WatchKind::Data, path, &mut targets);
                tables.take(WatchKind::Exist, path, &mut targets);
            }
            EventType::NodeDeleted => {
                tables.take(WatchKind::Data, path, &mut targets);
                tables.take(WatchKind::Exist, path, &mut targets);
                tables.take(WatchKind::Child, path, &mut targets);
            }
            EventType::NodeChildrenChanged => {
                tables.take(WatchKind::Child, path, &mut targets);
            }
            EventType::None => unreachable!(),
        }
        targets
    }

    /// Route an incoming event to its watchers, off the I/O path.
    pub fn dispatch(&self, event: WatchedEvent) {
        let targets = self.materialize(&event);
        if targets.is_empty() {
            tracing::debug!(?event, "no watcher armed for event");
            return;
        }
        let _ = self.tx.send(Delivery { event, targets });
    }

    /// Tell the default watcher the session state changed.
    pub fn notify_state(&self, state: KeeperState) {
        self.dispatch(WatchedEvent {
            event_type: EventType::None,
            keeper_state: state,
            path: None,
        });
    }

    /// Fire a synthesized state event at every armed watcher. Terminal
    /// states (Expired / AuthFailed) also clear the registry.
    pub fn fail_all(&self, state: KeeperState) {
        let mut targets: Vec<Arc<dyn Watcher>> = Vec::new();
        {
            let mut guard = self.tables.lock();
            let tables = &mut *guard;
            for table in [&tables.data, &tables.exist, &tables.child] {
                for watchers in table.values() {
                    for w in watchers {
                        if !targets.iter().any(|seen| Arc::ptr_eq(seen, w)) {
                            targets.push(w.clone());
                        }
                    }
                }
            }
            if state.is_terminal() {
                *tables = Tables::default();
            }
        }
        targets.extend(self.default_watcher.clone());

        if !targets.is_empty() {
            let event = WatchedEvent {
                event_type: EventType::None,
                keeper_state: state,
                path: None,
            };
            let _ = self.tx.send(Delivery { event, targets });
        }
    }

    /// The armed paths per kind (data, exist, child), for re-arming
    /// watches after a reconnect.
    pub fn snapshot(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        let tables = self.tables.lock();
        let paths = |t: &HashMap<String, Vec<Arc<dyn Watcher>>>| {
            t.iter()
                .filter(|(_, w)| !w.is_empty())
                .map(|(p, _)| p.clone())
                .collect()
        };
        (paths(&tables.data), paths(&tables.exist), paths(&tables.child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting(AtomicUsize);

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self(AtomicUsize::new(0)))
        }

        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Watcher for Counting {
        fn on_event(&self, _event: WatchedEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn node_event(event_type: EventType, path: &str) -> WatchedEvent {
        WatchedEvent {
            event_type,
            keeper_state: KeeperState::SyncConnected,
            path: Some(path.to_string()),
        }
    }

    #[tokio::test]
    async fn data_change_fires_data_and_exist_watchers() {
        let registry = WatchRegistry::new(None);
        let data = Counting::new();
        let exist = Counting::new();
        let child = Counting::new();
        registry.register(WatchKind::Data, "/k", data.clone());
        registry.register(WatchKind::Exist, "/k", exist.clone());
        registry.register(WatchKind::Child, "/k", child.clone());

        let targets = registry.materialize(&node_event(EventType::NodeDataChanged, "/k"));
        assert_eq!(targets.len(), 2);

        // The child watcher survives; data and exist are consumed.
        let (d, e, c) = registry.snapshot();
        assert!(d.is_empty());
        assert!(e.is_empty());
        assert_eq!(c, vec!["/k".to_string()]);
    }

    #[tokio::test]
    async fn delete_fires_all_three_kinds() {
        let registry = WatchRegistry::new(None);
        registry.register(WatchKind::Data, "/k", Counting::new());
        registry.register(WatchKind::Exist, "/k", Counting::new());
        registry.register(WatchKind::Child, "/k", Counting::new());

        let targets = registry.materialize(&node_event(EventType::NodeDeleted, "/k"));
        assert_eq!(targets.len(), 3);
    }

    #[tokio::test]
    async fn children_change_fires_only_child_watchers() {
        let registry = WatchRegistry::new(None);
        registry.register(WatchKind::Data, "/k", Counting::new());
        registry.register(WatchKind::Child, "/k", Counting::new());

        let targets = registry.materialize(&node_event(EventType::NodeChildrenChanged, "/k"));
        assert_eq!(targets.len(), 1);
    }

    #[tokio::test]
    async fn one_shot_watcher_fires_once() {
        let registry = WatchRegistry::new(None);
        let w = Counting::new();
        registry.register(WatchKind::Data, "/k", w.clone());

        registry.dispatch(node_event(EventType::NodeDataChanged, "/k"));
        registry.dispatch(node_event(EventType::NodeDataChanged, "/k"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(w.count(), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_collapses() {
        let registry = WatchRegistry::new(None);
        let w = Counting::new();
        registry.register(WatchKind::Data, "/k", w.clone());
        registry.register(WatchKind::Data, "/k", w.clone());

        let targets = registry.materialize(&node_event(EventType::NodeDataChanged, "/k"));
        assert_eq!(targets.len(), 1);
    }

    #[tokio::test]
    async fn watcher_on_both_data_and_exist_fires_once_per_event() {
        let registry = WatchRegistry::new(None);
        let w = Counting::new();
        registry.register(WatchKind::Data, "/k", w.clone());
        registry.register(WatchKind::Exist, "/k", w.clone());

        let targets = registry.materialize(&node_event(EventType::NodeCreated, "/k"));
        assert_eq!(targets.len(), 1);
    }

    #[tokio::test]
    async fn state_events_reach_only_the_default_watcher() {
        let default = Counting::new();
        let registry = WatchRegistry::new(Some(default.clone()));
        let node = Counting::new();
        registry.register(WatchKind::Data, "/k", node.clone());

        registry.notify_state(KeeperState::Disconnected);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(default.count(), 1);
        assert_eq!(node.count(), 0);
        // Node watcher still armed.
        let (d, _, _) = registry.snapshot();
        assert_eq!(d, vec!["/k".to_string()]);
    }

    #[tokio::test]
    async fn fail_all_fires_everyone_and_terminal_state_clears() {
        let default = Counting::new();
        let registry = WatchRegistry::new(Some(default.clone()));
        let w = Counting::new();
        registry.register(WatchKind::Data, "/a", w.clone());
        registry.register(WatchKind::Child, "/b", w.clone());

        registry.fail_all(KeeperState::Expired);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Deduped across kinds: one event each.
        assert_eq!(w.count(), 1);
        assert_eq!(default.count(), 1);

        let (d, e, c) = registry.snapshot();
        assert!(d.is_empty() && e.is_empty() && c.is_empty());
    }

    #[tokio::test]
    async fn snapshot_lists_armed_paths_by_kind() {
        let registry = WatchRegistry::new(None);
        registry.register(WatchKind::Data, "/a", Counting::new());
        registry.register(WatchKind::Child, "/b", Counting::new());

        let (d, e, c) = registry.snapshot();
        assert_eq!(d, vec!["/a".to_string()]);
        assert!(e.is_empty());
        assert_eq!(c, vec!["/b".to_string()]);
    }
}
