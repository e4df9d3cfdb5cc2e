//! The shared value graph: nodes indexed by id, dependency-ordered record
//! application, and depth-scoped listener propagation. Grounded on
//! `pypipboy/datamanager.py::PipboyDataManager` and `PipboyValue`.

use crate::codec::localmap::LocalMapUpdate;
use crate::codec::record::{Record, RecordPayload};
use crate::error::{Error, Result};
use crate::tree::node::{
    DepthListener, ListenerId, Node, NodeKind, ObjectChildren, ParentKey, PrimitiveValue,
    UserCacheEntry, ValueEvent,
};
use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    New,
    Updated,
}

struct Inner {
    nodes: HashMap<u32, Node>,
    root: Option<u32>,
}

type GlobalListener = Arc<dyn Fn(u32, UpdateKind) + Send + Sync>;
type RootListener = Arc<dyn Fn(u32) + Send + Sync>;
type LocalMapListener = Arc<dyn Fn(&LocalMapUpdate) + Send + Sync>;

pub struct TreeStore {
    inner: Mutex<Inner>,
    next_listener_id: AtomicU64,
    global_listeners: Mutex<Vec<(ListenerId, GlobalListener)>>,
    root_listeners: Mutex<Vec<(ListenerId, RootListener)>>,
    local_map_listeners: Mutex<Vec<(ListenerId, LocalMapListener)>>,
}

impl Default for TreeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeStore {
    pub fn new() -> TreeStore {
        TreeStore {
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                root: None,
            }),
            next_listener_id: AtomicU64::new(1),
            global_listeners: Mutex::new(Vec::new()),
            root_listeners: Mutex::new(Vec::new()),
            local_map_listeners: Mutex::new(Vec::new()),
        }
    }

    fn alloc_listener_id(&self) -> ListenerId {
        self.next_listener_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Drops all nodes and the root pointer. Used before `import` and on
    /// fresh connection establishment.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.clear();
        inner.root = None;
    }

    pub fn root_id(&self) -> Option<u32> {
        self.inner.lock().unwrap().root
    }

    pub fn node(&self, id: u32) -> Option<Node> {
        self.inner.lock().unwrap().nodes.get(&id).cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.inner.lock().unwrap().nodes.contains_key(&id)
    }

    /// Applies one decoded record, following the ordering from
    /// `SPEC_FULL.md` §4.E: mutate, then fire the global event, then (for
    /// pre-existing nodes) propagate node-scoped events up to the root.
    pub fn apply_record(&self, record: Record) -> Result<()> {
        let id = record.id;

        let (became_root, kind, events) = {
            let mut inner = self.inner.lock().unwrap();
            let existed = inner.nodes.contains_key(&id);

            match record.payload {
                RecordPayload::Array(ids) => apply_array(&mut inner.nodes, id, &ids)?,
                RecordPayload::Object { added, removed } => {
                    apply_object(&mut inner.nodes, id, &added, &removed)?
                }
                scalar => {
                    let value = to_primitive(scalar);
                    apply_primitive(&mut inner.nodes, id, value)?;
                }
            }

            let became_root = id == 0 && inner.root.is_none();
            if became_root {
                inner.root = Some(0);
            }

            let kind = if existed {
                UpdateKind::Updated
            } else {
                UpdateKind::New
            };
            let events = if existed {
                propagate(&mut inner.nodes, id)
            } else {
                Vec::new()
            };

            (became_root, kind, events)
        };

        for (_, callback) in self.global_listeners.lock().unwrap().iter() {
            callback(id, kind);
        }

        for (callback, event) in events {
            callback(event);
        }

        if became_root {
            log::debug!("root object established (id 0)");
            for (_, callback) in self.root_listeners.lock().unwrap().iter() {
                callback(id);
            }
        }

        Ok(())
    }

    /// Breadth-first, root-first snapshot of the whole tree. The result is
    /// NOT directly re-appliable in this order — a node's payload can name
    /// children discovered later in the walk. Callers (the relay, or a
    /// manual round trip) must reverse it before replaying; `import` does
    /// this automatically.
    pub fn export(&self) -> Vec<Record> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        if let Some(root) = inner.root {
            queue.push_back(root);
            visited.insert(root);
        }

        while let Some(id) = queue.pop_front() {
            let node = match inner.nodes.get(&id) {
                Some(n) => n,
                None => continue,
            };

            let payload = match &node.kind {
                NodeKind::Primitive(v) => primitive_to_payload(v),
                NodeKind::Array(ids) => {
                    for child in ids {
                        if visited.insert(*child) {
                            queue.push_back(*child);
                        }
                    }
                    RecordPayload::Array(ids.clone())
                }
                NodeKind::Object(children) => {
                    let added: Vec<(String, u32)> = children
                        .order
                        .iter()
                        .map(|k| (k.clone(), children.by_key[k]))
                        .collect();
                    for (_, child) in &added {
                        if visited.insert(*child) {
                            queue.push_back(*child);
                        }
                    }
                    RecordPayload::Object {
                        added,
                        removed: Vec::new(),
                    }
                }
            };

            out.push(Record { id, payload });
        }

        out
    }

    /// Replays a snapshot produced by `export`, applying it bottom-up (the
    /// reverse of BFS root-first order) so every reference resolves against
    /// an already-inserted child. Clears existing state first.
    pub fn import(&self, records: &[Record]) -> Result<()> {
        self.clear();
        for record in records.iter().rev() {
            self.apply_record(record.clone())?;
        }
        Ok(())
    }

    pub fn register_value_updated_listener<F>(&self, node_id: u32, depth: i64, callback: F) -> Option<ListenerId>
    where
        F: Fn(ValueEvent) + Send + Sync + 'static,
    {
        let id = self.alloc_listener_id();
        let mut inner = self.inner.lock().unwrap();
        let node = inner.nodes.get_mut(&node_id)?;
        node.listeners.push(DepthListener {
            id,
            depth,
            callback: Arc::new(callback),
        });
        Some(id)
    }

    pub fn unregister_value_updated_listener(&self, node_id: u32, listener_id: ListenerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&node_id) {
            node.listeners.retain(|l| l.id != listener_id);
        }
    }

    pub fn register_global_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(u32, UpdateKind) + Send + Sync + 'static,
    {
        let id = self.alloc_listener_id();
        self.global_listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unregister_global_listener(&self, listener_id: ListenerId) {
        self.global_listeners
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != listener_id);
    }

    pub fn register_root_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        let id = self.alloc_listener_id();
        self.root_listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unregister_root_listener(&self, listener_id: ListenerId) {
        self.root_listeners
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != listener_id);
    }

    pub fn register_local_map_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&LocalMapUpdate) + Send + Sync + 'static,
    {
        let id = self.alloc_listener_id();
        self.local_map_listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unregister_local_map_listener(&self, listener_id: ListenerId) {
        self.local_map_listeners
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != listener_id);
    }

    pub fn fire_local_map(&self, update: &LocalMapUpdate) {
        for (_, callback) in self.local_map_listeners.lock().unwrap().iter() {
            callback(update);
        }
    }

    pub fn set_user_cache(&self, node_id: u32, key: &str, entry: UserCacheEntry) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&node_id) {
            node.user_cache.insert(key.to_string(), entry);
        }
    }

    pub fn get_user_cache(&self, node_id: u32, key: &str) -> Option<UserCacheEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .get(&node_id)
            .and_then(|n| n.user_cache.get(key))
            .cloned()
    }
}

fn to_primitive(payload: RecordPayload) -> PrimitiveValue {
    match payload {
        RecordPayload::Bool(v) => PrimitiveValue::Bool(v),
        RecordPayload::Int8(v) => PrimitiveValue::Int8(v),
        RecordPayload::UInt8(v) => PrimitiveValue::UInt8(v),
        RecordPayload::Int32(v) => PrimitiveValue::Int32(v),
        RecordPayload::UInt32(v) => PrimitiveValue::UInt32(v),
        RecordPayload::Float(v) => PrimitiveValue::Float(v),
        RecordPayload::String(v) => PrimitiveValue::String(v),
        RecordPayload::Array(_) | RecordPayload::Object { .. } => {
            unreachable!("array/object records are dispatched before to_primitive")
        }
    }
}

fn primitive_to_payload(value: &PrimitiveValue) -> RecordPayload {
    match value.clone() {
        PrimitiveValue::Bool(v) => RecordPayload::Bool(v),
        PrimitiveValue::Int8(v) => RecordPayload::Int8(v),
        PrimitiveValue::UInt8(v) => RecordPayload::UInt8(v),
        PrimitiveValue::Int32(v) => RecordPayload::Int32(v),
        PrimitiveValue::UInt32(v) => RecordPayload::UInt32(v),
        PrimitiveValue::Float(v) => RecordPayload::Float(v),
        PrimitiveValue::String(v) => RecordPayload::String(v),
    }
}

fn apply_primitive(nodes: &mut HashMap<u32, Node>, id: u32, value: PrimitiveValue) -> Result<()> {
    match nodes.get_mut(&id) {
        Some(node) => match node.kind {
            NodeKind::Primitive(_) => node.kind = NodeKind::Primitive(value),
            _ => return Err(Error::TransportError(format!("node {} changed value type", id))),
        },
        None => {
            nodes.insert(id, Node::new(id, NodeKind::Primitive(value)));
        }
    }
    Ok(())
}

fn apply_array(nodes: &mut HashMap<u32, Node>, id: u32, ids: &[u32]) -> Result<()> {
    for child_id in ids {
        if !nodes.contains_key(child_id) {
            return Err(Error::DanglingReference(*child_id));
        }
    }

    if !nodes.contains_key(&id) {
        nodes.insert(id, Node::new(id, NodeKind::Array(Vec::new())));
    }
    match &nodes.get(&id).unwrap().kind {
        NodeKind::Array(_) => {}
        _ => return Err(Error::TransportError(format!("node {} changed value type", id))),
    }
    if let Some(node) = nodes.get_mut(&id) {
        node.kind = NodeKind::Array(ids.to_vec());
    }

    for (index, child_id) in ids.iter().enumerate() {
        if let Some(child) = nodes.get_mut(child_id) {
            child.parent = Some(id);
            child.parent_key = ParentKey::Index(index as u32);
            child.parent_index = index as u32;
        }
    }

    Ok(())
}

fn apply_object(
    nodes: &mut HashMap<u32, Node>,
    id: u32,
    added: &[(String, u32)],
    removed: &[u32],
) -> Result<()> {
    for (_, child_id) in added {
        if !nodes.contains_key(child_id) {
            return Err(Error::DanglingReference(*child_id));
        }
    }

    if !nodes.contains_key(&id) {
        nodes.insert(id, Node::new(id, NodeKind::Object(ObjectChildren::default())));
    }

    let mut children = match &nodes.get(&id).unwrap().kind {
        NodeKind::Object(c) => c.clone(),
        _ => return Err(Error::TransportError(format!("node {} changed value type", id))),
    };

    for (key, child_id) in added {
        children.upsert(key.clone(), *child_id);
    }

    // Deletion leaks by design: deleting here historically caused crashes in
    // downstream consumers. The ids stay reachable through the global map.
    for removed_id in removed {
        log::debug!("object {} marks child {} removed (not deleted)", id, removed_id);
    }

    let order = children.order.clone();
    if let Some(node) = nodes.get_mut(&id) {
        node.kind = NodeKind::Object(children);
    }

    for (index, key) in order.iter().enumerate() {
        let child_id = match &nodes.get(&id).unwrap().kind {
            NodeKind::Object(c) => c.by_key.get(key).copied(),
            _ => None,
        };
        if let Some(child_id) = child_id {
            if let Some(child) = nodes.get_mut(&child_id) {
                child.parent = Some(id);
                child.parent_key = ParentKey::Key(key.clone());
                child.parent_index = index as u32;
            }
        }
    }

    Ok(())
}

/// Walks from `origin` up to the root, marking user-cache entries dirty and
/// collecting listener invocations to run once the store lock is released.
fn propagate(
    nodes: &mut HashMap<u32, Node>,
    origin: u32,
) -> Vec<(Arc<dyn Fn(ValueEvent) + Send + Sync>, ValueEvent)> {
    let mut events = Vec::new();
    let mut current = origin;
    let mut depth: u32 = 0;
    let mut path: Vec<u32> = Vec::new();

    loop {
        let parent = {
            let node = match nodes.get_mut(&current) {
                Some(n) => n,
                None => break,
            };

            for entry in node.user_cache.values_mut() {
                if entry.invalidate_depth < 0 || entry.invalidate_depth as u32 <= depth {
                    entry.dirty = true;
                }
            }

            for listener in &node.listeners {
                if listener.depth < 0 || listener.depth as u32 >= depth {
                    events.push((
                        listener.callback.clone(),
                        ValueEvent {
                            on_node: current,
                            origin,
                            depth,
                            path: path.clone(),
                        },
                    ));
                }
            }

            node.parent
        };

        match parent {
            Some(parent_id) => {
                path.push(current);
                current = parent_id;
                depth += 1;
            }
            None => break,
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn obj(id: u32, added: &[(&str, u32)]) -> Record {
        Record {
            id,
            payload: RecordPayload::Object {
                added: added.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                removed: vec![],
            },
        }
    }

    fn num(id: u32, v: u32) -> Record {
        Record {
            id,
            payload: RecordPayload::UInt32(v),
        }
    }

    #[test]
    fn scenario_1_initial_object_build() {
        let store = TreeStore::new();
        store.apply_record(num(1, 42)).unwrap();
        store.apply_record(num(2, 7)).unwrap();
        store.apply_record(obj(0, &[("a", 1), ("b", 2)])).unwrap();

        assert_eq!(store.root_id(), Some(0));
        let root = store.node(0).unwrap();
        match &root.kind {
            NodeKind::Object(children) => {
                assert_eq!(children.order, vec!["a".to_string(), "b".to_string()]);
            }
            _ => panic!("expected object"),
        }
        let a = store.node(1).unwrap();
        assert_eq!(a.parent_key, ParentKey::Key("a".to_string()));
        assert_eq!(a.parent_index, 0);
    }

    #[test]
    fn scenario_2_update_propagates_with_depth() {
        let store = TreeStore::new();
        store.apply_record(num(1, 42)).unwrap();
        store.apply_record(num(2, 7)).unwrap();
        store.apply_record(obj(0, &[("a", 1), ("b", 2)])).unwrap();

        let depth_on_1 = Arc::new(AtomicUsize::new(999));
        let depth_on_1_clone = depth_on_1.clone();
        store.register_value_updated_listener(1, -1, move |event| {
            depth_on_1_clone.store(event.depth as usize, Ordering::SeqCst);
        });

        let depth_on_0 = Arc::new(AtomicUsize::new(999));
        let depth_on_0_clone = depth_on_0.clone();
        store.register_value_updated_listener(0, -1, move |event| {
            depth_on_0_clone.store(event.depth as usize, Ordering::SeqCst);
        });

        store.apply_record(num(1, 99)).unwrap();

        assert_eq!(store.node(1).unwrap().kind_as_u32(), Some(99));
        assert_eq!(depth_on_1.load(Ordering::SeqCst), 0);
        assert_eq!(depth_on_0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scenario_3_dangling_reference_is_fatal() {
        let store = TreeStore::new();
        let err = store
            .apply_record(Record {
                id: 5,
                payload: RecordPayload::Array(vec![9999]),
            })
            .unwrap_err();
        assert!(matches!(err, Error::DanglingReference(9999)));
        assert!(!store.contains(5));
    }

    #[test]
    fn value_type_change_on_primitive_is_fatal() {
        let store = TreeStore::new();
        store.apply_record(num(1, 42)).unwrap();

        let err = store
            .apply_record(Record {
                id: 1,
                payload: RecordPayload::Array(vec![]),
            })
            .unwrap_err();
        assert!(matches!(err, Error::TransportError(_)));
        assert_eq!(store.node(1).unwrap().kind_as_u32(), Some(42));
    }

    #[test]
    fn value_type_change_on_array_is_fatal() {
        let store = TreeStore::new();
        store.apply_record(num(1, 42)).unwrap();
        store.apply_record(Record {
            id: 2,
            payload: RecordPayload::Array(vec![1]),
        }).unwrap();

        let err = store.apply_record(num(2, 7)).unwrap_err();
        assert!(matches!(err, Error::TransportError(_)));
    }

    #[test]
    fn scenario_4_export_import_roundtrip() {
        let store = TreeStore::new();
        store.apply_record(num(1, 42)).unwrap();
        store.apply_record(num(2, 7)).unwrap();
        store.apply_record(obj(0, &[("a", 1), ("b", 2)])).unwrap();

        let exported = store.export();

        let fresh = TreeStore::new();
        fresh.import(&exported).unwrap();

        assert_eq!(fresh.root_id(), Some(0));
        assert_eq!(fresh.node(1).unwrap().kind_as_u32(), Some(42));
        assert_eq!(fresh.node(2).unwrap().kind_as_u32(), Some(7));
    }

    #[test]
    fn sorted_presentation_order_invariant() {
        let store = TreeStore::new();
        store.apply_record(num(10, 1)).unwrap();
        store.apply_record(num(11, 1)).unwrap();
        store.apply_record(num(12, 1)).unwrap();
        store
            .apply_record(obj(0, &[("zebra", 10), ("apple", 11), ("mango", 12)]))
            .unwrap();

        let root = store.node(0).unwrap();
        match &root.kind {
            NodeKind::Object(children) => {
                assert_eq!(
                    children.order,
                    vec!["apple".to_string(), "mango".to_string(), "zebra".to_string()]
                );
                for (i, key) in children.order.iter().enumerate() {
                    let id = children.by_key[key];
                    assert_eq!(store.node(id).unwrap().parent_index, i as u32);
                }
            }
            _ => panic!("expected object"),
        }
    }
}
