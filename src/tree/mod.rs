pub mod node;
pub mod store;

pub use node::{
    DepthListener, ListenerId, Node, NodeKind, ObjectChildren, ParentKey, PrimitiveValue,
    UserCacheEntry, ValueEvent,
};
pub use store::{TreeStore, UpdateKind};
