//! Multi-client fan-out: a UDP autodiscover responder plus a TCP server that
//! re-serves the current tree to each new downstream and mirrors the live
//! upstream feed. Grounded on `pypipboy/relayserver.py::RelayController`.

use crate::codec::record::encode_records;
use crate::discovery::AUTODISCOVER_PORT;
use crate::error::Result;
use crate::frame::{self, Frame, MessageType};
use crate::tree::TreeStore;
use std::net::{Shutdown, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const RELAY_PORT: u16 = 27000;
const AUTODISCOVER_RESPONSE: &str = r#"{"IsBusy":false,"MachineType":"PC"}"#;

type UpstreamSender = Arc<dyn Fn(&Frame) -> Result<()> + Send + Sync>;

struct ServiceHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Owns the set of currently attached downstream clients and the two
/// background services (autodiscover responder, relay server).
pub struct RelayController {
    tree: Arc<TreeStore>,
    clients: Arc<Mutex<Vec<Arc<Mutex<TcpStream>>>>>,
    host_lang: Arc<Mutex<String>>,
    host_version: Arc<Mutex<String>>,
    upstream_send: Mutex<Option<UpstreamSender>>,
    autodiscover: Mutex<Option<ServiceHandle>>,
    relay: Mutex<Option<ServiceHandle>>,
    keepalive: Mutex<Option<ServiceHandle>>,
}

impl RelayController {
    pub fn new(tree: Arc<TreeStore>) -> RelayController {
        RelayController {
            tree,
            clients: Arc::new(Mutex::new(Vec::new())),
            host_lang: Arc::new(Mutex::new("xx".to_string())),
            host_version: Arc::new(Mutex::new("1.1.30.0".to_string())),
            upstream_send: Mutex::new(None),
            autodiscover: Mutex::new(None),
            relay: Mutex::new(None),
            keepalive: Mutex::new(None),
        }
    }

    /// Supplies the real host's handshake fields, so newly attached
    /// downstream clients see the actual `lang`/`version` rather than the
    /// fallback. An official client crashes on most other version strings,
    /// which is why the fallback exists at all.
    pub fn set_upstream_info(&self, lang: String, version: String) {
        *self.host_lang.lock().unwrap() = lang;
        *self.host_version.lock().unwrap() = version;
    }

    /// Registers the closure used to relay a non-keep-alive downstream
    /// frame back upstream. Typically `move |f| client_channel.send_frame(f)`.
    pub fn set_upstream_sender(&self, sender: impl Fn(&Frame) -> Result<()> + Send + Sync + 'static) {
        *self.upstream_send.lock().unwrap() = Some(Arc::new(sender));
    }

    pub fn start_autodiscover_service(&self, port: Option<u16>) -> Result<()> {
        let port = port.unwrap_or(AUTODISCOVER_PORT);
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let loop_shutdown = shutdown.clone();

        let join = thread::Builder::new()
            .name("pipboy-relay-autodiscover".into())
            .spawn(move || {
                let mut buf = [0u8; 512];
                while !loop_shutdown.load(Ordering::SeqCst) {
                    match socket.recv_from(&mut buf) {
                        Ok((_, from)) => {
                            let _ = socket.send_to(AUTODISCOVER_RESPONSE.as_bytes(), from);
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            log::warn!("autodiscover responder error: {}", e);
                            break;
                        }
                    }
                }
            })?;

        *self.autodiscover.lock().unwrap() = Some(ServiceHandle { shutdown, join });
        Ok(())
    }

    pub fn stop_autodiscover_service(&self) {
        if let Some(handle) = self.autodiscover.lock().unwrap().take() {
            handle.shutdown.store(true, Ordering::SeqCst);
            let _ = handle.join.join();
        }
    }

    pub fn start_relay_service(&self, bind_addr: &str, port: Option<u16>) -> Result<()> {
        let port = port.unwrap_or(RELAY_PORT);
        let listener = TcpListener::bind((bind_addr, port))?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let loop_shutdown = shutdown.clone();

        let tree = self.tree.clone();
        let clients = self.clients.clone();
        let host_lang = self.host_lang.clone();
        let host_version = self.host_version.clone();
        let upstream_send = self.upstream_send.lock().unwrap().clone();

        let join = thread::Builder::new()
            .name("pipboy-relay-server".into())
            .spawn(move || {
                while !loop_shutdown.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            log::info!("relay: client connected from {}", addr);
                            let tree = tree.clone();
                            let clients = clients.clone();
                            let lang = host_lang.lock().unwrap().clone();
                            let version = host_version.lock().unwrap().clone();
                            let upstream_send = upstream_send.clone();
                            thread::spawn(move || {
                                handle_relay_client(stream, tree, clients, lang, version, upstream_send);
                            });
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(100));
                        }
                        Err(e) => {
                            log::warn!("relay accept error: {}", e);
                            break;
                        }
                    }
                }
            })?;

        *self.relay.lock().unwrap() = Some(ServiceHandle { shutdown, join });

        self.start_keepalive_thread();
        Ok(())
    }

    fn start_keepalive_thread(&self) {
        let clients = self.clients.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let loop_shutdown = shutdown.clone();

        if let Ok(join) = thread::Builder::new()
            .name("pipboy-relay-keepalive".into())
            .spawn(move || loop {
                if loop_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(Duration::from_secs(1));
                let mut clients = clients.lock().unwrap();
                clients.retain(|client| {
                    let mut stream = client.lock().unwrap();
                    frame::write_frame(&mut *stream, &Frame::keep_alive()).is_ok()
                });
            })
        {
            *self.keepalive.lock().unwrap() = Some(ServiceHandle { shutdown, join });
        }
    }

    pub fn stop_relay_service(&self) {
        if let Some(handle) = self.relay.lock().unwrap().take() {
            handle.shutdown.store(true, Ordering::SeqCst);
            let _ = handle.join.join();
        }
        if let Some(handle) = self.keepalive.lock().unwrap().take() {
            handle.shutdown.store(true, Ordering::SeqCst);
            let _ = handle.join.join();
        }
        for client in self.clients.lock().unwrap().drain(..) {
            let _ = client.lock().unwrap().shutdown(Shutdown::Both);
        }
    }

    /// Mirrors a non-keep-alive upstream frame to every attached downstream
    /// client. Call this from the message listener registered on the
    /// upstream `Channel`.
    pub fn mirror_upstream_frame(&self, frame: &Frame) {
        if frame.message_type == MessageType::KeepAlive {
            return;
        }
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|client| {
            let mut stream = client.lock().unwrap();
            frame::write_frame(&mut *stream, frame).is_ok()
        });
    }

    pub fn join(&self) {
        self.stop_relay_service();
        self.stop_autodiscover_service();
    }
}

fn handle_relay_client(
    stream: TcpStream,
    tree: Arc<TreeStore>,
    clients: Arc<Mutex<Vec<Arc<Mutex<TcpStream>>>>>,
    host_lang: String,
    host_version: String,
    upstream_send: Option<UpstreamSender>,
) {
    let shared = Arc::new(Mutex::new(stream));

    let accepted_payload = serde_json::json!({ "lang": host_lang, "version": host_version });
    let accepted_bytes = match serde_json::to_vec(&accepted_payload) {
        Ok(b) => b,
        Err(e) => {
            log::error!("relay: failed to encode CONNECTION_ACCEPTED: {}", e);
            return;
        }
    };

    {
        let mut stream = shared.lock().unwrap();
        if frame::write_frame(&mut *stream, &Frame::new(MessageType::ConnectionAccepted, accepted_bytes)).is_err() {
            return;
        }
    }

    let mut snapshot = tree.export();
    snapshot.reverse();
    let initial_payload = encode_records(&snapshot);
    {
        let mut stream = shared.lock().unwrap();
        if frame::write_frame(&mut *stream, &Frame::new(MessageType::DataUpdate, initial_payload)).is_err() {
            return;
        }
    }

    clients.lock().unwrap().push(shared.clone());

    let mut read_stream = match shared.lock().unwrap().try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };

    loop {
        match frame::read_frame(&mut read_stream) {
            Ok(frame) => {
                if frame.message_type == MessageType::KeepAlive {
                    continue;
                }
                if let Some(send) = &upstream_send {
                    if let Err(e) = send(&frame) {
                        log::warn!("relay: failed to forward downstream frame upstream: {}", e);
                    }
                }
            }
            Err(e) => {
                log::info!("relay: downstream client disconnected: {}", e);
                break;
            }
        }
    }

    clients
        .lock()
        .unwrap()
        .retain(|c| !Arc::ptr_eq(c, &shared));
}
