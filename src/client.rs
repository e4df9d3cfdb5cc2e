//! Public facade wiring the channel, tree store and command plane together.
//! Grounded on `pypipboy/datamanager.py::PipboyDataManager`, which plays the
//! same top-level role in the original.

use crate::channel::{Channel, ListenerId as ChannelListenerId};
use crate::codec::localmap;
use crate::codec::record::{decode_records, encode_records, Record};
use crate::command::{CommandPlane, RequestType};
use crate::discovery::{self, HostDesc};
use crate::error::{Error, Result};
use crate::frame::{Frame, MessageType};
use crate::relay::RelayController;
use crate::tree::node::{ListenerId as TreeListenerId, ValueEvent};
use crate::tree::store::UpdateKind;
use crate::tree::{Node, TreeStore};
use serde_json::Value;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PIPBOYAPP_PORT: u16 = 27000;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type ConnectionListener = Arc<dyn Fn(bool, i32, &str) + Send + Sync>;

/// A connected or disconnected Pip-Boy client session. One instance owns
/// one tree, one command plane, and at most one live `Channel`.
pub struct PipboyClient {
    tree: Arc<TreeStore>,
    commands: Arc<CommandPlane>,
    channel: Arc<Mutex<Option<Channel>>>,
    connecting: Mutex<Option<TcpStream>>,
    /// Connection listeners outlive any single `Channel`: registered here,
    /// re-attached to each freshly spawned `Channel` in `wire_channel`, so
    /// registration works regardless of current connection state.
    connection_listeners: Mutex<Vec<(ChannelListenerId, ConnectionListener)>>,
    next_connection_listener_id: AtomicU64,
}

impl Default for PipboyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PipboyClient {
    pub fn new() -> PipboyClient {
        PipboyClient {
            tree: Arc::new(TreeStore::new()),
            commands: Arc::new(CommandPlane::new()),
            channel: Arc::new(Mutex::new(None)),
            connecting: Mutex::new(None),
            connection_listeners: Mutex::new(Vec::new()),
            next_connection_listener_id: AtomicU64::new(1),
        }
    }

    pub fn tree(&self) -> &TreeStore {
        &self.tree
    }

    pub fn is_connected(&self) -> bool {
        self.channel.lock().unwrap().is_some()
    }

    pub fn discover_hosts(&self, timeout: Option<Duration>) -> Result<Vec<HostDesc>> {
        discovery::discover_hosts(timeout)
    }

    /// Connects and performs the handshake. Returns `Ok(true)` once a
    /// session is live; `Err(Error::Refused)` if the host declined.
    pub fn connect(&self, addr: &str, port: Option<u16>, timeout: Option<Duration>) -> Result<bool> {
        let port = port.unwrap_or(PIPBOYAPP_PORT);
        let timeout = timeout.unwrap_or(CONNECT_TIMEOUT);

        let socket_addr = format!("{}:{}", addr, port)
            .parse()
            .map_err(|_| Error::TransportError(format!("invalid address {}:{}", addr, port)))?;

        let stream = TcpStream::connect_timeout(&socket_addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        *self.connecting.lock().unwrap() = Some(stream.try_clone()?);

        let mut handshake_stream = stream.try_clone()?;
        let handshake = crate::frame::read_frame(&mut handshake_stream);
        self.connecting.lock().unwrap().take();

        let frame = handshake?;

        match frame.message_type {
            MessageType::ConnectionAccepted => {
                let body: Value = serde_json::from_slice(&frame.payload)?;
                let host_lang = body
                    .get("lang")
                    .and_then(Value::as_str)
                    .unwrap_or("xx")
                    .to_string();
                let host_version = body
                    .get("version")
                    .and_then(Value::as_str)
                    .unwrap_or("1.1.30.0")
                    .to_string();

                stream.set_read_timeout(None)?;
                self.tree.clear();

                let channel = Channel::spawn(stream, host_lang, host_version)?;
                self.wire_channel(&channel);
                *self.channel.lock().unwrap() = Some(channel);

                log::info!("connected to {}:{}", addr, port);

                for (_, callback) in self.connection_listeners.lock().unwrap().iter() {
                    callback(true, 0, "");
                }

                Ok(true)
            }
            MessageType::ConnectionRefused => Err(Error::Refused),
            _ => Err(Error::TransportError(format!(
                "unexpected handshake message type {:?}",
                frame.message_type
            ))),
        }
    }

    /// Registers the internal listener that routes inbound frames to the
    /// tree store and command plane.
    fn wire_channel(&self, channel: &Channel) {
        let tree = self.tree.clone();
        let commands = self.commands.clone();

        channel.register_message_listener(None, move |frame| match frame.message_type {
            MessageType::DataUpdate => {
                if let Err(e) = decode_records(&frame.payload, |record| {
                    if let Err(e) = tree.apply_record(record) {
                        log::error!("failed to apply record: {}", e);
                    }
                }) {
                    log::error!("malformed DATA_UPDATE frame: {}", e);
                }
            }
            MessageType::LocalMapUpdate => match localmap::decode_localmap(&frame.payload) {
                Ok(update) => tree.fire_local_map(&update),
                Err(e) => log::error!("malformed LOCAL_MAP_UPDATE frame: {}", e),
            },
            MessageType::CommandResult => match serde_json::from_slice::<Value>(&frame.payload) {
                Ok(response) => {
                    if let Err(e) = commands.resolve(response) {
                        log::error!("failed to resolve command result: {}", e);
                    }
                }
                Err(e) => log::error!("malformed COMMAND_RESULT frame: {}", e),
            },
            _ => {}
        });

        for (_, callback) in self.connection_listeners.lock().unwrap().iter() {
            let callback = callback.clone();
            channel.register_connection_listener(move |connected, status, msg| callback(connected, status, msg));
        }
    }

    /// Wires a `RelayController` to this (already connected) session: every
    /// non-keep-alive upstream frame is mirrored to the relay's downstream
    /// clients, and the relay's downstream-to-upstream traffic is sent back
    /// out over this session's channel.
    pub fn attach_relay(&self, relay: Arc<RelayController>) -> Result<()> {
        let guard = self.channel.lock().unwrap();
        let channel = guard.as_ref().ok_or(Error::NotConnected)?;
        relay.set_upstream_info(channel.host_lang.clone(), channel.host_version.clone());

        let relay_for_mirror = relay.clone();
        channel.register_message_listener(None, move |frame| {
            relay_for_mirror.mirror_upstream_frame(frame);
        });
        drop(guard);

        let upstream_channel = self.channel.clone();
        relay.set_upstream_sender(move |frame| {
            let guard = upstream_channel.lock().unwrap();
            let channel = guard.as_ref().ok_or(Error::NotConnected)?;
            channel.send_frame(frame)
        });

        Ok(())
    }

    /// Forcibly aborts an in-progress `connect` call running on another
    /// thread, causing its blocking read/connect to fail.
    pub fn cancel_connection_attempt(&self) {
        if let Some(stream) = self.connecting.lock().unwrap().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn disconnect(&self) {
        if let Some(channel) = self.channel.lock().unwrap().take() {
            channel.disconnect();
        }
    }

    pub fn join(&self) {
        if let Some(channel) = self.channel.lock().unwrap().as_mut() {
            channel.join();
        }
    }

    pub fn register_message_listener(
        &self,
        message_type: Option<MessageType>,
        callback: impl Fn(&Frame) + Send + Sync + 'static,
    ) -> Option<ChannelListenerId> {
        self.channel
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.register_message_listener(message_type, callback))
    }

    /// Registers regardless of connection state; re-attached to every
    /// subsequent `Channel` by `wire_channel`.
    pub fn register_connection_listener(
        &self,
        callback: impl Fn(bool, i32, &str) + Send + Sync + 'static,
    ) -> ChannelListenerId {
        let id = self.next_connection_listener_id.fetch_add(1, Ordering::SeqCst);
        let callback: ConnectionListener = Arc::new(callback);

        if let Some(channel) = self.channel.lock().unwrap().as_ref() {
            let callback = callback.clone();
            channel.register_connection_listener(move |connected, status, msg| callback(connected, status, msg));
        }

        self.connection_listeners.lock().unwrap().push((id, callback));
        id
    }

    pub fn unregister_connection_listener(&self, id: ChannelListenerId) {
        self.connection_listeners.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    pub fn register_root_object_listener(&self, callback: impl Fn(u32) + Send + Sync + 'static) -> TreeListenerId {
        self.tree.register_root_listener(callback)
    }

    pub fn unregister_root_object_listener(&self, id: TreeListenerId) {
        self.tree.unregister_root_listener(id);
    }

    pub fn register_value_updated_listener(
        &self,
        node_id: u32,
        depth: i64,
        callback: impl Fn(ValueEvent) + Send + Sync + 'static,
    ) -> Option<TreeListenerId> {
        self.tree.register_value_updated_listener(node_id, depth, callback)
    }

    pub fn unregister_value_updated_listener(&self, node_id: u32, id: TreeListenerId) {
        self.tree.unregister_value_updated_listener(node_id, id);
    }

    pub fn register_global_value_updated_listener(
        &self,
        callback: impl Fn(u32, UpdateKind) + Send + Sync + 'static,
    ) -> TreeListenerId {
        self.tree.register_global_listener(callback)
    }

    pub fn register_local_map_listener(
        &self,
        callback: impl Fn(&localmap::LocalMapUpdate) + Send + Sync + 'static,
    ) -> TreeListenerId {
        self.tree.register_local_map_listener(callback)
    }

    pub fn get_pip_value_by_id(&self, id: u32) -> Option<Node> {
        self.tree.node(id)
    }

    /// Exports the live tree. Works regardless of connection state.
    pub fn export_data(&self) -> Vec<Record> {
        self.tree.export()
    }

    /// Replays an exported snapshot. Only permitted while disconnected, to
    /// avoid racing the dispatch thread's own writes to the tree.
    pub fn import_data(&self, records: &[Record]) -> Result<()> {
        if self.is_connected() {
            return Err(Error::TransportError(
                "import_data is not permitted while connected".into(),
            ));
        }
        self.tree.import(records)
    }

    fn send_command(&self, req_type: RequestType, args: Vec<Value>) -> Result<u32> {
        let channel = self.channel.lock().unwrap();
        let channel = channel.as_ref().ok_or(Error::NotConnected)?;

        let (id, bytes) = self.commands.build_request(req_type, args, None)?;
        channel.send_frame(&Frame::new(MessageType::Command, bytes))?;
        Ok(id)
    }

    pub fn rpc_use_item(&self, item_id: u32, inventory_id: u32) -> Result<u32> {
        let args = crate::command::use_item_args(&self.tree, item_id, inventory_id)?;
        self.send_command(RequestType::UseItem, args)
    }

    pub fn rpc_toggle_component_favorite(&self, inventory_id: u32, component_form_id: u32) -> Result<u32> {
        let args =
            crate::command::toggle_component_favorite_args(&self.tree, inventory_id, component_form_id)?;
        self.send_command(RequestType::ToggleComponentFavorite, args)
    }

    pub fn rpc_toggle_quest_active(&self, quest_id: u32) -> Result<u32> {
        let args = crate::command::toggle_quest_active_args(&self.tree, quest_id)?;
        self.send_command(RequestType::ToggleQuestActive, args)
    }

    pub fn rpc_drop_item(&self, item_id: u32, inventory_id: u32, count: u32) -> Result<u32> {
        let args = crate::command::drop_item_args(&self.tree, item_id, inventory_id, count)?;
        self.send_command(RequestType::DropItem, args)
    }

    pub fn rpc_set_favorite(&self, item_id: u32, inventory_id: u32, quick_key_slot: u32) -> Result<u32> {
        let args = crate::command::set_favorite_args(&self.tree, item_id, inventory_id, quick_key_slot)?;
        self.send_command(RequestType::SetFavorite, args)
    }

    pub fn rpc_fast_travel(&self, location_form_id: u32) -> Result<u32> {
        self.send_command(RequestType::FastTravel, crate::command::fast_travel_args(location_form_id))
    }

    pub fn rpc_check_fast_travel(&self, location_form_id: u32) -> Result<u32> {
        self.send_command(
            RequestType::CheckFastTravel,
            crate::command::check_fast_travel_args(location_form_id),
        )
    }

    pub fn rpc_toggle_radio_station(&self, station_form_id: u32) -> Result<u32> {
        self.send_command(
            RequestType::ToggleRadioStation,
            crate::command::toggle_radio_station_args(station_form_id),
        )
    }

    pub fn rpc_set_custom_map_marker(&self, x: f32, y: f32) -> Result<u32> {
        self.send_command(RequestType::SetCustomMapMarker, crate::command::set_custom_marker_args(x, y))
    }

    pub fn rpc_remove_custom_map_marker(&self) -> Result<u32> {
        self.send_command(RequestType::RemoveCustomMapMarker, vec![])
    }

    pub fn rpc_move_local_map(&self, dx: f32, dy: f32) -> Result<u32> {
        self.send_command(RequestType::MoveLocalMap, crate::command::move_local_map_args(dx, dy))
    }

    pub fn rpc_zoom_local_map(&self, factor: f32) -> Result<u32> {
        self.send_command(RequestType::ZoomLocalMap, crate::command::zoom_local_map_args(factor))
    }

    pub fn rpc_request_local_map_snapshot(&self) -> Result<u32> {
        self.send_command(RequestType::RequestLocalMapSnapshot, vec![])
    }

    pub fn rpc_clear_idle(&self) -> Result<u32> {
        self.send_command(RequestType::ClearIdle, vec![])
    }

    pub fn rpc_sort_inventory(&self, sort_index: u32) -> Result<u32> {
        self.send_command(RequestType::SortInventory, crate::command::sort_inventory_args(sort_index))
    }
}

pub fn encode_data_update(records: &[Record]) -> Vec<u8> {
    encode_records(records)
}
