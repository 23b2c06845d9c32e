// TCP server and main event loop for the hub.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts connections,
//   assigns each a `ConnectionId`, and spawns its reader thread.
// - **Reader threads** (one per connection): read the `Hello` handshake under
//   a timeout and forward it with the stream as `InternalEvent::Handshake`;
//   then loop on `framing::read_message()`, forwarding each `ClientMessage` as
//   `InternalEvent::MessageFrom`. On error/EOF, send `Disconnected`. The
//   handshake happens off the main thread, so a slow client never stalls
//   other sessions.
// - **Main thread**: owns the `Hub`, receives events from the channel, and
//   dispatches them. Uses `recv_timeout` with the sweep interval as the
//   timeout, so the liveness sweep runs even when nothing is arriving.
//
// The main thread is the only writer to client TCP streams. Reader threads
// only read. A rejected handshake is answered by the main thread too.
//
// Shutdown: `HubHandle::stop` clears `keep_running`. The main loop breaks
// out, shuts down every client stream (unblocking the reader threads), and
// returns.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use turnhub_protocol::framing::read_message;
use turnhub_protocol::message::{ClientMessage, PROTOCOL_VERSION, RejectReason, ServerMessage};

use crate::config::HubConfig;
use crate::hub::{ConnectionId, Hub, send_message};

/// Events sent from listener/reader threads to the main thread.
enum InternalEvent {
    Handshake {
        conn: ConnectionId,
        hello: ClientMessage,
        stream: TcpStream,
    },
    MessageFrom {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Disconnected {
        conn: ConnectionId,
    },
}

/// Handle returned by `start_hub` to control the running server.
pub struct HubHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl HubHandle {
    /// Signal the hub to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Block until the hub exits on its own.
    pub fn wait(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Start the hub on a background thread. Returns a handle for stopping it
/// and the actual bound address (useful when port 0 is used to let the OS
/// pick a free port).
pub fn start_hub(config: HubConfig) -> std::io::Result<(HubHandle, SocketAddr)> {
    let listener = TcpListener::bind(&config.bind)?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();

    info!(%addr, "hub listening");
    let thread = thread::spawn(move || {
        run_hub(listener, config, keep_running_clone);
    });

    Ok((
        HubHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Main hub loop. Runs until `keep_running` is set to false.
fn run_hub(listener: TcpListener, config: HubConfig, keep_running: Arc<AtomicBool>) {
    let mut hub = Hub::new(config.queue_capacity).with_write_timeout(config.write_timeout());
    let (tx, rx): (Sender<InternalEvent>, Receiver<InternalEvent>) = mpsc::channel();

    // Non-blocking so the accept thread can check keep_running periodically.
    listener.set_nonblocking(true).ok();

    let keep_running_listener = keep_running.clone();
    let handshake_timeout = config.handshake_timeout();
    thread::spawn(move || {
        let mut next_id = 0u64;
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false).ok();
                    let conn = ConnectionId(next_id);
                    next_id += 1;
                    debug!(connection = conn.0, %peer, "accepted connection");
                    let tx_reader = tx.clone();
                    let keep_running_reader = keep_running_listener.clone();
                    thread::spawn(move || {
                        connection_loop(
                            stream,
                            conn,
                            handshake_timeout,
                            tx_reader,
                            keep_running_reader,
                        );
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed, listener exiting");
                    break;
                }
            }
        }
    });

    let sweep_interval = config.sweep_interval();
    let liveness_timeout = config.liveness_timeout();
    let mut last_sweep = Instant::now();

    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(sweep_interval) {
            Ok(event) => {
                handle_event(&mut hub, event);
                // Drain any additional events that arrived during handling.
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut hub, event);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        let now = Instant::now();
        if now.duration_since(last_sweep) >= sweep_interval {
            hub.sweep(now, liveness_timeout);
            last_sweep = now;
        }
    }

    hub.shutdown();
    info!("hub stopped");
}

fn handle_event(hub: &mut Hub, event: InternalEvent) {
    let now = Instant::now();
    match event {
        InternalEvent::Handshake {
            conn,
            hello,
            stream,
        } => handle_handshake(hub, conn, hello, stream, now),
        InternalEvent::MessageFrom { conn, message } => match message {
            ClientMessage::Send { to, payload } => hub.send(conn, to, payload, now),
            ClientMessage::Resolve { id } => hub.resolve(conn, id, now),
            ClientMessage::Heartbeat => hub.heartbeat(conn, now),
            ClientMessage::Goodbye => hub.leave(conn),
            ClientMessage::Hello { .. } => {
                debug!(connection = conn.0, "ignoring repeated Hello");
            }
        },
        InternalEvent::Disconnected { conn } => hub.disconnect(conn),
    }
}

fn handle_handshake(
    hub: &mut Hub,
    conn: ConnectionId,
    hello: ClientMessage,
    stream: TcpStream,
    now: Instant,
) {
    let result = match hello {
        ClientMessage::Hello {
            protocol_version,
            session_id,
            participant_id,
            role,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                Err(RejectReason::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    got: protocol_version,
                })
            } else {
                match stream.try_clone() {
                    Ok(write_half) => hub
                        .connect(conn, session_id, participant_id, role, write_half, now)
                        .map(|_| ()),
                    Err(e) => {
                        debug!(connection = conn.0, error = %e, "could not clone stream");
                        return;
                    }
                }
            }
        }
        _ => Err(RejectReason::ExpectedHello),
    };

    if let Err(reason) = result {
        info!(connection = conn.0, %reason, "handshake rejected");
        let mut writer = BufWriter::new(stream);
        let _ = send_message(&mut writer, &ServerMessage::Rejected { reason });
        let _ = writer.get_ref().shutdown(std::net::Shutdown::Both);
    }
}

/// Per-connection reader. Runs in its own thread.
fn connection_loop(
    stream: TcpStream,
    conn: ConnectionId,
    handshake_timeout: Duration,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    // Bound the wait for Hello so idle sockets don't pin a thread forever.
    stream.set_read_timeout(Some(handshake_timeout)).ok();
    let mut reader = match stream.try_clone() {
        Ok(s) => BufReader::new(s),
        Err(_) => return,
    };

    let hello = match read_message(&mut reader)
        .map_err(|e| e.to_string())
        .and_then(|bytes| {
            serde_json::from_slice::<ClientMessage>(&bytes).map_err(|e| e.to_string())
        }) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(connection = conn.0, error = %e, "no valid handshake");
            return;
        }
    };
    stream.set_read_timeout(None).ok();
    let _ = tx.send(InternalEvent::Handshake {
        conn,
        hello,
        stream,
    });

    while keep_running.load(Ordering::SeqCst) {
        match read_message(&mut reader) {
            Ok(bytes) => match serde_json::from_slice::<ClientMessage>(&bytes) {
                Ok(message) => {
                    let leaving = message == ClientMessage::Goodbye;
                    let _ = tx.send(InternalEvent::MessageFrom { conn, message });
                    if leaving {
                        break;
                    }
                }
                Err(e) => {
                    debug!(connection = conn.0, error = %e, "malformed message");
                    let _ = tx.send(InternalEvent::Disconnected { conn });
                    break;
                }
            },
            Err(_) => {
                let _ = tx.send(InternalEvent::Disconnected { conn });
                break;
            }
        }
    }
}
