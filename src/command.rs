//! Command plane: numbered JSON RPC requests correlated to per-request
//! callbacks, plus typed helpers that validate required tree fields before
//! building a request. Grounded on
//! `pypipboy/datamanager.py::PipboyDataManager.rpcSendRequest` and its
//! `rpc*` helpers.

use crate::error::{Error, Result};
use crate::tree::TreeStore;
use hashbrown::HashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Opaque request kind codes. The numeric values are the wire contract, not
/// an implementation detail — they must match `eRequestType` exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    UseItem = 0,
    DropItem = 1,
    SetFavorite = 2,
    ToggleComponentFavorite = 3,
    SortInventory = 4,
    ToggleQuestActive = 5,
    SetCustomMapMarker = 6,
    RemoveCustomMapMarker = 7,
    CheckFastTravel = 8,
    FastTravel = 9,
    MoveLocalMap = 10,
    ZoomLocalMap = 11,
    ToggleRadioStation = 12,
    RequestLocalMapSnapshot = 13,
    ClearIdle = 14,
}

impl RequestType {
    pub fn code(self) -> u32 {
        self as u32
    }
}

type Callback = Box<dyn FnOnce(Value) + Send>;

/// Tracks in-flight request ids and their callbacks. Does not itself know
/// how to reach the wire — `client` owns the socket and calls `build`/
/// `resolve` around it.
pub struct CommandPlane {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, Callback>>,
}

impl Default for CommandPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandPlane {
    pub fn new() -> CommandPlane {
        CommandPlane {
            next_id: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a request id and serializes the JSON envelope. Registers
    /// `callback` under that id if one was supplied.
    pub fn build_request(
        &self,
        req_type: RequestType,
        args: Vec<Value>,
        callback: Option<Callback>,
    ) -> Result<(u32, Vec<u8>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        if let Some(callback) = callback {
            self.pending.lock().unwrap().insert(id, callback);
        }

        let envelope = json!({
            "id": id,
            "type": req_type.code(),
            "args": args,
        });

        Ok((id, serde_json::to_vec(&envelope)?))
    }

    /// Routes a `COMMAND_RESULT` payload to its callback. Unmatched ids are
    /// logged and dropped, matching the original's silent-ignore behavior.
    pub fn resolve(&self, response: Value) -> Result<()> {
        let id = response
            .get("id")
            .and_then(Value::as_u64)
            .map(|v| v as u32);

        match id.and_then(|id| self.pending.lock().unwrap().remove(&id)) {
            Some(callback) => {
                callback(response);
                Ok(())
            }
            None => {
                log::debug!("dropping command result with unmatched id: {:?}", id);
                Ok(())
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

fn missing(field: &str) -> Error {
    Error::MissingField(field.to_string())
}

fn require_child(store: &TreeStore, node_id: u32, field: &str) -> Result<u32> {
    store
        .node(node_id)
        .and_then(|n| n.child_id(field))
        .ok_or_else(|| missing(field))
}

/// Validates `componentFormID` and an inventory `Version` child on
/// `inventory_id`, then builds the args for `ToggleComponentFavorite`.
pub fn toggle_component_favorite_args(
    store: &TreeStore,
    inventory_id: u32,
    component_form_id: u32,
) -> Result<Vec<Value>> {
    let version_id = require_child(store, inventory_id, "Version")?;
    let version = store
        .node(version_id)
        .and_then(|n| n.as_primitive().cloned())
        .ok_or_else(|| missing("Version"))?;

    Ok(vec![json!(component_form_id), primitive_to_json(&version)])
}

/// Validates `HandleID`, `StackID.child(0)` and the inventory `Version`
/// before building `UseItem` args.
pub fn use_item_args(store: &TreeStore, item_id: u32, inventory_id: u32) -> Result<Vec<Value>> {
    let handle_id = require_child(store, item_id, "HandleID")?;
    let stack_id_node = require_child(store, item_id, "StackID")?;
    let stack_entry = store
        .node(stack_id_node)
        .and_then(|n| n.array_ids().and_then(|ids| ids.first().copied()))
        .ok_or_else(|| missing("StackID"))?;
    let version_id = require_child(store, inventory_id, "Version")?;

    let handle = store
        .node(handle_id)
        .and_then(|n| n.as_primitive().cloned())
        .ok_or_else(|| missing("HandleID"))?;
    let version = store
        .node(version_id)
        .and_then(|n| n.as_primitive().cloned())
        .ok_or_else(|| missing("Version"))?;

    Ok(vec![
        primitive_to_json(&handle),
        json!(stack_entry),
        primitive_to_json(&version),
    ])
}

/// Validates `formID`, `instance` and `type` on the referenced quest node
/// before building `ToggleQuestActive` args.
pub fn toggle_quest_active_args(store: &TreeStore, quest_id: u32) -> Result<Vec<Value>> {
    let form_id = require_child(store, quest_id, "formID")?;
    let instance = require_child(store, quest_id, "instance")?;
    let type_id = require_child(store, quest_id, "type")?;

    let get = |id: u32, field: &str| -> Result<Value> {
        store
            .node(id)
            .and_then(|n| n.as_primitive().cloned())
            .map(|v| primitive_to_json(&v))
            .ok_or_else(|| missing(field))
    };

    Ok(vec![
        get(form_id, "formID")?,
        get(instance, "instance")?,
        get(type_id, "type")?,
    ])
}

/// Values of every child in an array node, in order. Used for `StackID`
/// arrays, which carry one scalar per stack entry.
fn array_values(store: &TreeStore, array_node_id: u32, field: &str) -> Result<Vec<Value>> {
    let ids = store
        .node(array_node_id)
        .and_then(|n| n.array_ids().map(|ids| ids.to_vec()))
        .ok_or_else(|| missing(field))?;

    ids.iter()
        .map(|id| {
            store
                .node(*id)
                .and_then(|n| n.as_primitive().cloned())
                .map(|v| primitive_to_json(&v))
                .ok_or_else(|| missing(field))
        })
        .collect()
}

/// Validates `HandleID` and a non-empty `StackID` array on `item_id`, plus
/// the inventory `Version`, before building `DropItem` args.
pub fn drop_item_args(store: &TreeStore, item_id: u32, inventory_id: u32, count: u32) -> Result<Vec<Value>> {
    let handle_id = require_child(store, item_id, "HandleID")?;
    let stack_id_node = require_child(store, item_id, "StackID")?;
    let version_id = require_child(store, inventory_id, "Version")?;

    let handle = store
        .node(handle_id)
        .and_then(|n| n.as_primitive().cloned())
        .ok_or_else(|| missing("HandleID"))?;
    let stack_values = array_values(store, stack_id_node, "StackID")?;
    if stack_values.is_empty() {
        return Err(missing("StackID"));
    }
    let version = store
        .node(version_id)
        .and_then(|n| n.as_primitive().cloned())
        .ok_or_else(|| missing("Version"))?;

    Ok(vec![
        primitive_to_json(&handle),
        json!(count),
        primitive_to_json(&version),
        Value::Array(stack_values),
    ])
}

/// Validates `HandleID` and a non-empty `StackID` array on `item_id`, plus
/// the inventory `Version`, before building `SetFavorite` args.
pub fn set_favorite_args(
    store: &TreeStore,
    item_id: u32,
    inventory_id: u32,
    quick_key_slot: u32,
) -> Result<Vec<Value>> {
    let handle_id = require_child(store, item_id, "HandleID")?;
    let stack_id_node = require_child(store, item_id, "StackID")?;
    let version_id = require_child(store, inventory_id, "Version")?;

    let handle = store
        .node(handle_id)
        .and_then(|n| n.as_primitive().cloned())
        .ok_or_else(|| missing("HandleID"))?;
    let stack_values = array_values(store, stack_id_node, "StackID")?;
    if stack_values.is_empty() {
        return Err(missing("StackID"));
    }
    let version = store
        .node(version_id)
        .and_then(|n| n.as_primitive().cloned())
        .ok_or_else(|| missing("Version"))?;

    Ok(vec![
        primitive_to_json(&handle),
        Value::Array(stack_values),
        json!(quick_key_slot),
        primitive_to_json(&version),
    ])
}

pub fn fast_travel_args(location_form_id: u32) -> Vec<Value> {
    vec![json!(location_form_id)]
}

pub fn check_fast_travel_args(location_form_id: u32) -> Vec<Value> {
    vec![json!(location_form_id)]
}

pub fn toggle_radio_station_args(station_form_id: u32) -> Vec<Value> {
    vec![json!(station_form_id)]
}

/// The third argument's meaning is not documented by the host; observed
/// traffic always carries `true`.
pub fn set_custom_marker_args(x: f32, y: f32) -> Vec<Value> {
    vec![json!(x), json!(y), json!(true)]
}

pub fn sort_inventory_args(sort_index: u32) -> Vec<Value> {
    vec![json!(sort_index)]
}

pub fn move_local_map_args(dx: f32, dy: f32) -> Vec<Value> {
    vec![json!(dx), json!(dy)]
}

pub fn zoom_local_map_args(factor: f32) -> Vec<Value> {
    vec![json!(factor)]
}

fn primitive_to_json(value: &crate::tree::PrimitiveValue) -> Value {
    use crate::tree::PrimitiveValue as P;
    match value {
        P::Bool(v) => json!(v),
        P::Int8(v) => json!(v),
        P::UInt8(v) => json!(v),
        P::Int32(v) => json!(v),
        P::UInt32(v) => json!(v),
        P::Float(v) => json!(v),
        P::String(v) => json!(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::record::{Record, RecordPayload};
    use std::sync::atomic::{AtomicBool, Ordering as AOrdering};
    use std::sync::Arc;

    #[test]
    fn request_envelope_round_trips_through_json() {
        let plane = CommandPlane::new();
        let (id, bytes) = plane
            .build_request(RequestType::SortInventory, vec![json!(1)], None)
            .unwrap();
        let decoded: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded["id"], json!(id));
        assert_eq!(decoded["type"], json!(4));
    }

    #[test]
    fn callback_fires_on_matching_result() {
        let plane = CommandPlane::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let (id, _bytes) = plane
            .build_request(
                RequestType::ClearIdle,
                vec![],
                Some(Box::new(move |_resp| {
                    fired_clone.store(true, AOrdering::SeqCst);
                })),
            )
            .unwrap();

        plane.resolve(json!({"id": id})).unwrap();
        assert!(fired.load(AOrdering::SeqCst));
        assert_eq!(plane.pending_count(), 0);
    }

    #[test]
    fn unmatched_result_is_dropped_silently() {
        let plane = CommandPlane::new();
        assert!(plane.resolve(json!({"id": 12345})).is_ok());
    }

    #[test]
    fn use_item_args_requires_handle_id() {
        let store = TreeStore::new();
        store
            .apply_record(Record {
                id: 1,
                payload: RecordPayload::Object {
                    added: vec![],
                    removed: vec![],
                },
            })
            .unwrap();

        let err = use_item_args(&store, 1, 1).unwrap_err();
        assert!(matches!(err, Error::MissingField(_)));
    }

    #[test]
    fn drop_item_args_carries_full_stack_list() {
        let store = TreeStore::new();
        store
            .apply_record(Record {
                id: 10,
                payload: RecordPayload::UInt32(100),
            })
            .unwrap();
        store
            .apply_record(Record {
                id: 11,
                payload: RecordPayload::UInt32(7),
            })
            .unwrap();
        store
            .apply_record(Record {
                id: 12,
                payload: RecordPayload::UInt32(8),
            })
            .unwrap();
        store.apply_record(Record { id: 13, payload: RecordPayload::Array(vec![11, 12]) }).unwrap();
        store
            .apply_record(Record {
                id: 1,
                payload: RecordPayload::Object {
                    added: vec![("HandleID".into(), 10), ("StackID".into(), 13)],
                    removed: vec![],
                },
            })
            .unwrap();
        store
            .apply_record(Record {
                id: 20,
                payload: RecordPayload::UInt32(3),
            })
            .unwrap();
        store
            .apply_record(Record {
                id: 2,
                payload: RecordPayload::Object {
                    added: vec![("Version".into(), 20)],
                    removed: vec![],
                },
            })
            .unwrap();

        let args = drop_item_args(&store, 1, 2, 5).unwrap();
        assert_eq!(args[0], json!(100));
        assert_eq!(args[1], json!(5));
        assert_eq!(args[2], json!(3));
        assert_eq!(args[3], json!([7, 8]));
    }
}
