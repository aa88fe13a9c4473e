//! TCP transport: the multi-client accept loop, the single-peer server used
//! by small utilities, and the two connection handlers (frame intake and
//! result delivery) that speak the framed protocol.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::frame::Frame;
use crate::processor::dispatch_frame;
use crate::protocol::FramedChannel;
use crate::registry::ServerContext;

/// Idle wait between scans for Pending results when nothing was sent.
const SEND_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Per-connection logic run on its own thread by [`ThreadedServer`].
///
/// Three-phase lifecycle: `setup` arms the termination signal and acquires
/// per-connection resources, `handle` runs the connection's main loop until
/// the signal fires, `finish` releases resources and raises the signal.
pub trait ConnectionHandler: Send {
    fn setup(&mut self) {}

    /// The connection's main receive or send loop. Errors are the handler's
    /// to log; returning means the connection is done.
    fn handle(&mut self);

    fn finish(&mut self) {}
}

pub type HandlerFactory =
    dyn Fn(TcpStream, SocketAddr) -> Box<dyn ConnectionHandler> + Send + Sync;

// ===========================================================================
// Accepting servers
// ===========================================================================

/// Accepts any number of clients, one handler thread per connection.
pub struct ThreadedServer {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ThreadedServer {
    pub fn bind(addr: &str, name: &'static str, factory: Arc<HandlerFactory>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        log::info!("{name}: listening on {local_addr}");

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = thread::Builder::new()
            .name(format!("accept-{name}"))
            .spawn(move || loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        if accept_shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        log::info!("{name}: connection from {peer}");
                        let factory = Arc::clone(&factory);
                        let spawned = thread::Builder::new()
                            .name(format!("{name}-conn"))
                            .spawn(move || {
                                let mut handler = factory(stream, peer);
                                handler.setup();
                                handler.handle();
                                handler.finish();
                                log::info!("{name}: {peer} disconnected");
                            });
                        if let Err(e) = spawned {
                            log::error!("{name}: failed to spawn handler: {e}");
                        }
                    }
                    Err(e) => {
                        if accept_shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        log::warn!("{name}: accept failed: {e}");
                    }
                }
            })?;

        Ok(Self {
            name,
            local_addr,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and join the accept thread. Already-running
    /// connection handlers finish on their own.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Nudge the blocking accept so it observes the flag.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(t) = self.accept_thread.take() {
            if t.join().is_err() {
                log::error!("{}: accept thread panicked", self.name);
            }
        }
    }
}

impl Drop for ThreadedServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serves exactly one peer at a time. Used by diagnostic tools that want a
/// framed channel without the handler machinery.
pub struct SinglePeerServer {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    stream: Option<TcpStream>,
}

impl SinglePeerServer {
    pub fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Some(listener),
            local_addr,
            stream: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until one peer connects, then hand back its channel.
    pub fn start(&mut self) -> io::Result<FramedChannel<TcpStream>> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "listener already closed")
        })?;
        let (stream, peer) = listener.accept()?;
        log::info!("peer connected from {peer}");
        self.stream = Some(stream.try_clone()?);
        Ok(FramedChannel::new(stream))
    }

    /// Drop the current peer; keep or close the listening socket.
    pub fn stop(&mut self, keep_listening: bool) {
        if let Some(s) = self.stream.take() {
            let _ = s.shutdown(Shutdown::Both);
        }
        if !keep_listening {
            self.listener = None;
        }
    }

    /// Drop the current peer and wait for the next one.
    pub fn restart(&mut self) -> io::Result<FramedChannel<TcpStream>> {
        self.stop(true);
        self.start()
    }
}

// ===========================================================================
// Connection handlers
// ===========================================================================

/// Frame intake: image, then property bag, then dispatch. A malformed
/// message drops that frame and keeps the connection; a transport error
/// ends it.
pub struct ReceiveHandler {
    chan: FramedChannel<TcpStream>,
    peer_ip: String,
    ctx: Arc<ServerContext>,
    terminated: Arc<AtomicBool>,
}

impl ReceiveHandler {
    pub fn new(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) -> Self {
        Self {
            chan: FramedChannel::new(stream),
            peer_ip: peer.ip().to_string(),
            ctx,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connection-scoped termination signal; raised on transport failure
    /// or by `finish`.
    pub fn termination_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminated)
    }
}

impl ConnectionHandler for ReceiveHandler {
    fn setup(&mut self) {
        self.terminated.store(false, Ordering::SeqCst);
    }

    fn handle(&mut self) {
        while !self.terminated.load(Ordering::SeqCst) {
            let image = match self.chan.recv_image() {
                Ok(image) => image,
                Err(e) if e.is_transport() => {
                    log::info!("{}: receive channel closed: {e}", self.peer_ip);
                    self.terminated.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    log::warn!("{}: dropping frame: {e}", self.peer_ip);
                    continue;
                }
            };
            let props = match self.chan.recv_props() {
                Ok(props) => props,
                Err(e) if e.is_transport() => {
                    log::info!("{}: receive channel closed: {e}", self.peer_ip);
                    self.terminated.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    log::warn!("{}: dropping frame: {e}", self.peer_ip);
                    continue;
                }
            };
            dispatch_frame(&self.ctx, &Frame::new(image, props), &self.peer_ip);
        }
    }

    fn finish(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

/// Result delivery: scan for processors Pending for this peer, emit their
/// results, and reset them to Available whether or not the payload made it
/// out (no result stays Pending forever).
pub struct SendHandler {
    chan: FramedChannel<TcpStream>,
    peer_ip: String,
    ctx: Arc<ServerContext>,
    terminated: Arc<AtomicBool>,
}

impl SendHandler {
    pub fn new(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) -> Self {
        Self {
            chan: FramedChannel::new(stream),
            peer_ip: peer.ip().to_string(),
            ctx,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn termination_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminated)
    }
}

impl ConnectionHandler for SendHandler {
    fn setup(&mut self) {
        self.terminated.store(false, Ordering::SeqCst);
    }

    fn handle(&mut self) {
        let mut seen = 0u64;
        while !self.terminated.load(Ordering::SeqCst) {
            let mut sent_any = false;
            for processor in &self.ctx.processors {
                if !processor.is_pending_for(&self.peer_ip) {
                    continue;
                }
                let outcome = processor.base_send(&mut self.chan);
                processor.reset_available();
                sent_any = true;
                if let Err(e) = outcome {
                    log::info!("{}: send channel closed: {e}", self.peer_ip);
                    self.terminated.store(true, Ordering::SeqCst);
                    break;
                }
            }
            if !sent_any {
                seen = self.ctx.pending.wait_for_change(seen, SEND_IDLE_WAIT);
            }
        }
    }

    fn finish(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}
