use crate::codec::record::ValueType;
use std::sync::Arc;

/// A scalar value held by a `Primitive` node. Kept distinct from
/// `codec::record::RecordPayload` so the tree can't accidentally hold an
/// `Array`/`Object` payload where a scalar is expected.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveValue {
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int32(i32),
    UInt32(u32),
    Float(f32),
    String(String),
}

impl PrimitiveValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            PrimitiveValue::Bool(_) => ValueType::Bool,
            PrimitiveValue::Int8(_) => ValueType::Int8,
            PrimitiveValue::UInt8(_) => ValueType::UInt8,
            PrimitiveValue::Int32(_) => ValueType::Int32,
            PrimitiveValue::UInt32(_) => ValueType::UInt32,
            PrimitiveValue::Float(_) => ValueType::Float,
            PrimitiveValue::String(_) => ValueType::String,
        }
    }
}

/// How a node is addressed from its parent.
#[derive(Debug, Clone, PartialEq)]
pub enum ParentKey {
    None,
    Key(String),
    Index(u32),
}

/// An object's children, keyed by name, with a presentation order kept
/// sorted lexicographically. `parent_index` on each child tracks its
/// position in `order` and is reassigned whenever `order` is rebuilt.
#[derive(Debug, Clone, Default)]
pub struct ObjectChildren {
    pub by_key: hashbrown::HashMap<String, u32>,
    pub order: Vec<String>,
}

impl ObjectChildren {
    /// Inserts or overwrites a key, then rebuilds the sorted order.
    pub fn upsert(&mut self, key: String, id: u32) {
        self.by_key.insert(key, id);
        self.rebuild_order();
    }

    fn rebuild_order(&mut self) {
        self.order = self.by_key.keys().cloned().collect();
        self.order.sort();
    }

    pub fn index_of(&self, key: &str) -> Option<u32> {
        self.order.iter().position(|k| k == key).map(|i| i as u32)
    }

    pub fn id_by_index(&self, index: usize) -> Option<u32> {
        self.order.get(index).and_then(|k| self.by_key.get(k)).copied()
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Primitive(PrimitiveValue),
    Array(Vec<u32>),
    Object(ObjectChildren),
}

impl NodeKind {
    pub fn value_type(&self) -> ValueType {
        match self {
            NodeKind::Primitive(v) => v.value_type(),
            NodeKind::Array(_) => ValueType::Array,
            NodeKind::Object(_) => ValueType::Object,
        }
    }
}

/// An auxiliary, application-defined cache entry attached to a node. The
/// tree store only performs bookkeeping (marking dirty on propagation); the
/// stored value and its interpretation belong to the caller.
#[derive(Debug, Clone)]
pub struct UserCacheEntry {
    pub value: serde_json::Value,
    pub invalidate_depth: i64,
    pub dirty: bool,
}

pub type ListenerId = u64;

#[derive(Clone)]
pub struct DepthListener {
    pub id: ListenerId,
    /// Negative means "any depth".
    pub depth: i64,
    pub callback: Arc<dyn Fn(ValueEvent) + Send + Sync>,
}

/// Delivered to a node-scoped listener when a change propagates to it.
#[derive(Debug, Clone)]
pub struct ValueEvent {
    /// The node the listener is registered on.
    pub on_node: u32,
    /// The node that actually changed.
    pub origin: u32,
    /// Number of edges between `origin` and `on_node`.
    pub depth: u32,
    /// Ancestor ids walked so far, nearest first, not including `on_node`.
    pub path: Vec<u32>,
}

#[derive(Clone)]
pub struct Node {
    pub id: u32,
    pub parent: Option<u32>,
    pub parent_key: ParentKey,
    pub parent_index: u32,
    pub kind: NodeKind,
    pub listeners: Vec<DepthListener>,
    pub user_cache: hashbrown::HashMap<String, UserCacheEntry>,
}

impl Node {
    pub fn new(id: u32, kind: NodeKind) -> Node {
        Node {
            id,
            parent: None,
            parent_key: ParentKey::None,
            parent_index: 0,
            kind,
            listeners: Vec::new(),
            user_cache: hashbrown::HashMap::new(),
        }
    }

    pub fn value_type(&self) -> ValueType {
        self.kind.value_type()
    }

    /// Looks up a child by object key. `None` if this node is not an object
    /// or has no such key.
    pub fn child_id(&self, key: &str) -> Option<u32> {
        match &self.kind {
            NodeKind::Object(children) => children.by_key.get(key).copied(),
            _ => None,
        }
    }

    /// The full ordered child id list of an array node.
    pub fn array_ids(&self) -> Option<&[u32]> {
        match &self.kind {
            NodeKind::Array(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn as_primitive(&self) -> Option<&PrimitiveValue> {
        match &self.kind {
            NodeKind::Primitive(v) => Some(v),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn kind_as_u32(&self) -> Option<u32> {
        match &self.kind {
            NodeKind::Primitive(PrimitiveValue::UInt32(v)) => Some(*v),
            _ => None,
        }
    }
}
