//! The receive/dispatch state machine for an established connection.
//! Grounded on `pypipboy/network.py::NetworkChannel` (the established-session
//! half; handshake and cancellation live in `client`, which owns the
//! in-progress socket).

use crate::error::Result;
use crate::frame::{self, Frame, MessageType};
use std::io;
use std::net::{Shutdown, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const KEEP_ALIVE_TIMER: Duration = Duration::from_secs(2);

pub type ListenerId = u64;

type MessageListener = Arc<dyn Fn(&Frame) + Send + Sync>;
type ConnectionListener = Arc<dyn Fn(bool, i32, &str) + Send + Sync>;

struct ListenerRegistry {
    message: Mutex<Vec<(ListenerId, Option<MessageType>, MessageListener)>>,
    connection: Mutex<Vec<(ListenerId, ConnectionListener)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    fn new() -> ListenerRegistry {
        ListenerRegistry {
            message: Mutex::new(Vec::new()),
            connection: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc(&self) -> ListenerId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// An established, running session: one receive thread, one dispatch
/// thread, and the socket they share with the public API's send path.
pub struct Channel {
    write_stream: Arc<Mutex<TcpStream>>,
    shutdown: Arc<AtomicBool>,
    queue_tx: Sender<Option<Frame>>,
    listeners: Arc<ListenerRegistry>,
    receive_handle: Option<JoinHandle<()>>,
    dispatch_handle: Option<JoinHandle<()>>,
    pub host_lang: String,
    pub host_version: String,
}

impl Channel {
    /// Wraps an already-handshaked stream and starts the receive/dispatch
    /// threads. `host_lang`/`host_version` come from the `CONNECTION_ACCEPTED`
    /// payload the caller already parsed.
    pub fn spawn(stream: TcpStream, host_lang: String, host_version: String) -> Result<Channel> {
        let read_stream = stream.try_clone()?;
        let write_stream = Arc::new(Mutex::new(stream));
        let shutdown = Arc::new(AtomicBool::new(false));
        let listeners = Arc::new(ListenerRegistry::new());
        let last_keepalive = Arc::new(Mutex::new(Instant::now()));

        let (queue_tx, queue_rx) = mpsc::channel::<Option<Frame>>();

        let receive_handle = {
            let write_stream = write_stream.clone();
            let shutdown = shutdown.clone();
            let listeners = listeners.clone();
            let queue_tx = queue_tx.clone();
            let last_keepalive = last_keepalive.clone();

            thread::Builder::new()
                .name("pipboy-receive".into())
                .spawn(move || {
                    receive_loop(read_stream, write_stream, queue_tx, shutdown, listeners, last_keepalive);
                })?
        };

        let dispatch_handle = {
            let listeners = listeners.clone();
            thread::Builder::new()
                .name("pipboy-dispatch".into())
                .spawn(move || {
                    dispatch_loop(queue_rx, listeners);
                })?
        };

        Ok(Channel {
            write_stream,
            shutdown,
            queue_tx,
            listeners,
            receive_handle: Some(receive_handle),
            dispatch_handle: Some(dispatch_handle),
            host_lang,
            host_version,
        })
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut stream = self.write_stream.lock().unwrap();
        frame::write_frame(&mut *stream, frame)
    }

    pub fn register_message_listener(
        &self,
        message_type: Option<MessageType>,
        callback: impl Fn(&Frame) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.listeners.alloc();
        self.listeners
            .message
            .lock()
            .unwrap()
            .push((id, message_type, Arc::new(callback)));
        id
    }

    pub fn unregister_message_listener(&self, id: ListenerId) {
        self.listeners.message.lock().unwrap().retain(|(lid, _, _)| *lid != id);
    }

    pub fn register_connection_listener(
        &self,
        callback: impl Fn(bool, i32, &str) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.listeners.alloc();
        self.listeners
            .connection
            .lock()
            .unwrap()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unregister_connection_listener(&self, id: ListenerId) {
        self.listeners.connection.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    /// Closes the socket, stops the receive loop, and wakes the dispatch
    /// loop with the shutdown sentinel. Idempotent: only the first call
    /// fires connection listeners.
    pub fn disconnect(&self) {
        let already_shutting_down = self.shutdown.swap(true, Ordering::SeqCst);
        if let Ok(stream) = self.write_stream.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let _ = self.queue_tx.send(None);

        if !already_shutting_down {
            for (_, callback) in self.listeners.connection.lock().unwrap().iter() {
                callback(false, 0, "");
            }
        }
    }

    /// Waits for both background threads to finish.
    pub fn join(&mut self) {
        if let Some(handle) = self.receive_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatch_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn receive_loop(
    mut read_stream: TcpStream,
    write_stream: Arc<Mutex<TcpStream>>,
    queue_tx: Sender<Option<Frame>>,
    shutdown: Arc<AtomicBool>,
    listeners: Arc<ListenerRegistry>,
    last_keepalive: Arc<Mutex<Instant>>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        match frame::read_frame(&mut read_stream) {
            Ok(frame) => {
                if frame.message_type == MessageType::KeepAlive {
                    log::trace!("received keep-alive, replying immediately");
                    send_keep_alive(&write_stream, &last_keepalive);
                    continue;
                }

                let due = {
                    let last = last_keepalive.lock().unwrap();
                    last.elapsed() >= KEEP_ALIVE_TIMER
                };
                if due {
                    send_keep_alive(&write_stream, &last_keepalive);
                }

                if queue_tx.send(Some(frame)).is_err() {
                    break;
                }
            }
            Err(e) => {
                if shutdown.swap(true, Ordering::SeqCst) {
                    break;
                }
                log::warn!("transport error on receive loop: {}", e);
                let _ = queue_tx.send(None);
                for (_, callback) in listeners.connection.lock().unwrap().iter() {
                    callback(false, -1, &e.to_string());
                }
                break;
            }
        }
    }
}

fn send_keep_alive(write_stream: &Arc<Mutex<TcpStream>>, last_keepalive: &Arc<Mutex<Instant>>) {
    let result: io::Result<()> = (|| {
        let mut stream = write_stream.lock().unwrap();
        frame::write_frame(&mut *stream, &Frame::keep_alive()).map_err(|_| io::ErrorKind::Other.into())
    })();
    if result.is_ok() {
        *last_keepalive.lock().unwrap() = Instant::now();
    }
}

fn dispatch_loop(queue_rx: mpsc::Receiver<Option<Frame>>, listeners: Arc<ListenerRegistry>) {
    loop {
        match queue_rx.recv() {
            Ok(Some(frame)) => {
                let snapshot: Vec<MessageListener> = listeners
                    .message
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(_, filter, _)| filter.is_none() || *filter == Some(frame.message_type))
                    .map(|(_, _, cb)| cb.clone())
                    .collect();

                for callback in snapshot {
                    let frame_ref = &frame;
                    if catch_unwind(AssertUnwindSafe(|| callback(frame_ref))).is_err() {
                        log::error!("message listener panicked; dispatch loop continues");
                    }
                }
            }
            Ok(None) => {
                log::debug!("dispatch loop received shutdown sentinel");
                break;
            }
            Err(_) => break,
        }
    }
}
