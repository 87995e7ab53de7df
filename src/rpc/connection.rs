//! Connection lifecycle and frame transport.
//!
//! Every node pair shares at most one TCP connection. A connection walks
//! `Connecting -> Connected(auth none/stage1) -> Established -> Closing`;
//! its generation is drawn from a monotonic counter, so replies belonging
//! to a closed generation are discarded and a reconnected peer is
//! distinguishable from its previous life. One reader thread per
//! connection demultiplexes frames: replies wake the waiting caller
//! through the pending table, requests go to the network pool.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::Sender;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::node::Node;

use super::proto::{Direction, Procedure};
use super::MAX_FRAME_LEN;

/// How long a connect attempt may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Back-off window between connect attempts to one node.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(15);

/// Stall before closing a connection that failed authentication.
pub const AUTH_FAILURE_DELAY: Duration = Duration::from_secs(1);

/// Authentication progress of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthStage {
    None,
    Stage1,
    Established,
}

/// Mutable connection state behind the connection mutex.
#[derive(Debug)]
pub struct ConnInfo {
    /// Peer SID, known after stage 1.
    pub sid: u32,
    pub auth: AuthStage,
    /// Link speed hint from stage 2.
    pub speed: u8,
    /// The generation the peer reported for this connection in stage 2.
    /// Reintegration leases record it, so a reconnecting owner's higher
    /// generation marks its old lease as stealable.
    pub peer_generation: u64,
}

/// One live connection.
#[derive(Debug)]
pub struct Connection {
    /// Generation this connection was created under; never reused.
    pub generation: u64,
    writer: Mutex<TcpStream>,
    reader_stream: Mutex<Option<TcpStream>>,
    pub info: Mutex<ConnInfo>,
    closed: AtomicBool,
}

impl Connection {
    fn new(stream: TcpStream, generation: u64) -> std::io::Result<Arc<Connection>> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        Ok(Arc::new(Connection {
            generation,
            writer: Mutex::new(stream),
            reader_stream: Mutex::new(Some(reader)),
            info: Mutex::new(ConnInfo {
                sid: 0,
                auth: AuthStage::None,
                speed: 0,
                peer_generation: 0,
            }),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn auth(&self) -> AuthStage {
        self.info.lock().auth
    }

    pub fn sid(&self) -> u32 {
        self.info.lock().sid
    }

    /// Send one frame. A write failure closes the connection.
    pub fn send_frame(
        &self,
        direction: Direction,
        request_id: u32,
        procedure: Option<Procedure>,
        body: &[u8],
    ) -> Result<()> {
        if self.is_closed() {
            return Err(ZfsError::ConnectionClosed);
        }
        let payload_len = 1 + 4 + procedure.map_or(0, |_| 4) + body.len();
        if payload_len > MAX_FRAME_LEN {
            return Err(ZfsError::RequestTooLong);
        }
        let mut frame = Vec::with_capacity(4 + payload_len);
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, payload_len as u32);
        frame.extend_from_slice(&len_buf);
        frame.push(direction as u8);
        let mut id_buf = [0u8; 4];
        LittleEndian::write_u32(&mut id_buf, request_id);
        frame.extend_from_slice(&id_buf);
        if let Some(procedure) = procedure {
            let mut fn_buf = [0u8; 4];
            LittleEndian::write_u32(&mut fn_buf, procedure as u32);
            frame.extend_from_slice(&fn_buf);
        }
        frame.extend_from_slice(body);
        let mut writer = self.writer.lock();
        writer.write_all(&frame).map_err(|err| {
            debug!(%err, "frame write failed");
            ZfsError::ConnectionClosed
        })
    }

    fn shut(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.writer.lock().shutdown(std::net::Shutdown::Both);
    }
}

struct PendingCall {
    tx: Sender<Result<Vec<u8>>>,
    generation: u64,
}

/// The connection registry and request matching state.
pub struct Network {
    /// Established or authenticating connections by peer SID.
    connections: Mutex<HashMap<u32, Arc<Connection>>>,
    /// Accepted connections that have not finished stage 1 yet.
    embryos: Mutex<Vec<Arc<Connection>>>,
    pending: DashMap<u32, PendingCall>,
    next_request_id: AtomicU32,
    next_generation: AtomicU64,
    /// Served requests per function number.
    call_stats: [AtomicU64; 30],
    terminating: AtomicBool,
}

impl Network {
    pub fn new() -> Network {
        Network {
            connections: Mutex::new(HashMap::new()),
            embryos: Mutex::new(Vec::new()),
            pending: DashMap::new(),
            next_request_id: AtomicU32::new(0),
            next_generation: AtomicU64::new(1),
            call_stats: std::array::from_fn(|_| AtomicU64::new(0)),
            terminating: AtomicBool::new(false),
        }
    }

    /// Count one served request of `procedure`.
    pub fn record_call(&self, procedure: Procedure) {
        self.call_stats[procedure as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// How many requests of `procedure` this daemon has served.
    pub fn calls_served(&self, procedure: Procedure) -> u64 {
        self.call_stats[procedure as usize].load(Ordering::Relaxed)
    }

    /// Assign the next request id.
    pub fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The generation a node reported for its current connection, for
    /// lease fencing. `None` while the node has no live connection.
    pub fn peer_generation_of(&self, sid: u32) -> Option<u64> {
        let conn = self.connections.lock().get(&sid).cloned()?;
        (!conn.is_closed()).then(|| conn.info.lock().peer_generation)
    }

    /// The established connection to a node, if one exists.
    pub fn established(&self, sid: u32) -> Option<Arc<Connection>> {
        let conn = self.connections.lock().get(&sid).cloned()?;
        (!conn.is_closed() && conn.auth() == AuthStage::Established).then_some(conn)
    }

    /// Register a pending call and hand back the receive side.
    pub(super) fn register_call(
        &self,
        request_id: u32,
        generation: u64,
    ) -> crossbeam_channel::Receiver<Result<Vec<u8>>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.pending.insert(request_id, PendingCall { tx, generation });
        rx
    }

    pub(super) fn forget_call(&self, request_id: u32) {
        self.pending.remove(&request_id);
    }

    /// Bind an authenticated peer SID to its connection. An older
    /// connection for the same SID is closed first.
    pub fn bind_sid(&self, zfsd: &Zfsd, conn: &Arc<Connection>, sid: u32) {
        let old = {
            let mut connections = self.connections.lock();
            let old = connections.insert(sid, conn.clone());
            self.embryos.lock().retain(|c| !Arc::ptr_eq(c, conn));
            old
        };
        if let Some(old) = old {
            if !Arc::ptr_eq(&old, conn) {
                self.close(zfsd, &old);
            }
        }
    }

    /// Adopt an accepted socket: spawn its reader and keep it as an embryo
    /// until authentication names the peer.
    pub fn adopt(&self, zfsd: &Arc<Zfsd>, stream: TcpStream) -> Result<Arc<Connection>> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(stream, generation).map_err(|_| ZfsError::CouldNotConnect)?;
        self.embryos.lock().push(conn.clone());
        spawn_reader(zfsd, &conn);
        Ok(conn)
    }

    /// Open a connection to a node, without authentication.
    pub fn open(&self, zfsd: &Arc<Zfsd>, node: &Arc<Node>) -> Result<Arc<Connection>> {
        if self.terminating.load(Ordering::Acquire) {
            return Err(ZfsError::Exiting);
        }
        if !node.may_connect(RECONNECT_BACKOFF) {
            return Err(ZfsError::CouldNotConnect);
        }
        let address = node.address();
        let addr: SocketAddr = address
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or(ZfsError::CouldNotConnect)?;
        info!(node = node.id, %address, "connecting");
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|_| ZfsError::CouldNotConnect)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(stream, generation).map_err(|_| ZfsError::CouldNotConnect)?;
        {
            let mut info = conn.info.lock();
            info.sid = node.id;
        }
        spawn_reader(zfsd, &conn);
        Ok(conn)
    }

    /// Close a connection: fail its in-flight calls, drop it from the
    /// registry and shut the socket down.
    pub fn close(&self, zfsd: &Zfsd, conn: &Arc<Connection>) {
        if conn.is_closed() {
            return;
        }
        conn.shut();
        let sid = conn.sid();
        {
            let mut connections = self.connections.lock();
            if let Some(current) = connections.get(&sid) {
                if Arc::ptr_eq(current, conn) {
                    connections.remove(&sid);
                }
            }
            self.embryos.lock().retain(|c| !Arc::ptr_eq(c, conn));
        }
        self.fail_generation(conn.generation, ZfsError::ConnectionClosed);
        let _ = zfsd;
        debug!(sid, generation = conn.generation, "connection closed");
    }

    /// Fail every pending call routed through `generation`.
    fn fail_generation(&self, generation: u64, error: ZfsError) {
        let stale: Vec<u32> = self
            .pending
            .iter()
            .filter(|entry| entry.value().generation == generation)
            .map(|entry| *entry.key())
            .collect();
        for request_id in stale {
            if let Some((_, call)) = self.pending.remove(&request_id) {
                let _ = call.tx.send(Err(error));
            }
        }
    }

    /// Shutdown: fail every wait with `Exiting` and close every socket.
    pub fn shutdown(&self, zfsd: &Zfsd) {
        self.terminating.store(true, Ordering::Release);
        let all: Vec<Arc<Connection>> = {
            let connections = self.connections.lock();
            let embryos = self.embryos.lock();
            connections.values().cloned().chain(embryos.iter().cloned()).collect()
        };
        let ids: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
        for request_id in ids {
            if let Some((_, call)) = self.pending.remove(&request_id) {
                let _ = call.tx.send(Err(ZfsError::Exiting));
            }
        }
        for conn in all {
            self.close(zfsd, &conn);
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::new()
    }
}

fn spawn_reader(zfsd: &Arc<Zfsd>, conn: &Arc<Connection>) {
    let zfsd = zfsd.clone();
    let conn = conn.clone();
    std::thread::Builder::new()
        .name("zfs-net-reader".into())
        .spawn(move || {
            let stream = conn.reader_stream.lock().take();
            if let Some(stream) = stream {
                reader_loop(&zfsd, &conn, stream);
            }
            zfsd.net.close(&zfsd, &conn);
        })
        .expect("spawning connection reader");
}

/// Read frames until the peer goes away or a protocol error forces a
/// resync by disconnect.
fn reader_loop(zfsd: &Arc<Zfsd>, conn: &Arc<Connection>, mut stream: TcpStream) {
    let mut len_buf = [0u8; 4];
    loop {
        if stream.read_exact(&mut len_buf).is_err() {
            return;
        }
        let len = LittleEndian::read_u32(&len_buf) as usize;
        if len < 5 || len > MAX_FRAME_LEN {
            warn!(len, "bad frame length, dropping connection");
            return;
        }
        let mut payload = vec![0u8; len];
        if stream.read_exact(&mut payload).is_err() {
            return;
        }
        let direction = payload[0];
        let request_id = LittleEndian::read_u32(&payload[1..5]);
        match num_traits::FromPrimitive::from_u8(direction) {
            Some(Direction::Reply) => {
                deliver_reply(zfsd, conn, request_id, payload[5..].to_vec());
            }
            Some(Direction::Request) | Some(Direction::Oneway) => {
                if payload.len() < 9 {
                    warn!("truncated request header, dropping connection");
                    return;
                }
                let function = LittleEndian::read_u32(&payload[5..9]);
                let body = payload[9..].to_vec();
                let direction = if direction == Direction::Oneway as u8 {
                    Direction::Oneway
                } else {
                    Direction::Request
                };
                if !dispatch_request(zfsd, conn, direction, request_id, function, body) {
                    return;
                }
            }
            None => {
                warn!(direction, "unknown frame direction, dropping connection");
                return;
            }
        }
    }
}

fn deliver_reply(zfsd: &Arc<Zfsd>, conn: &Arc<Connection>, request_id: u32, body: Vec<u8>) {
    let Some((_, call)) = zfsd.net.pending.remove(&request_id) else {
        trace!(request_id, "reply with no waiter, discarded");
        return;
    };
    if call.generation != conn.generation {
        trace!(request_id, "reply from stale generation, discarded");
        return;
    }
    let _ = call.tx.send(Ok(body));
}

/// Queue a decoded-enough request on the network pool. Returns false when
/// the frame is bad enough that the connection must drop.
fn dispatch_request(
    zfsd: &Arc<Zfsd>,
    conn: &Arc<Connection>,
    direction: Direction,
    request_id: u32,
    function: u32,
    body: Vec<u8>,
) -> bool {
    let procedure: Option<Procedure> = num_traits::FromPrimitive::from_u32(function);
    let Some(procedure) = procedure else {
        warn!(function, "unknown function");
        if direction == Direction::Request {
            let mut reply = Vec::new();
            super::coding::put_i32(&mut reply, ZfsError::UnknownFunction.to_wire());
            let _ = conn.send_frame(Direction::Reply, request_id, None, &reply);
        }
        return false;
    };
    let pool_zfsd = zfsd.clone();
    let pool_conn = conn.clone();
    let submitted = zfsd.pools.network.submit(Box::new(move || {
        super::server::serve(&pool_zfsd, &pool_conn, direction, request_id, procedure, &body);
    }));
    if submitted.is_err() {
        // shutting down; tell the caller and keep the socket for the
        // remaining frames
        if direction == Direction::Request {
            let mut reply = Vec::new();
            super::coding::put_i32(&mut reply, ZfsError::Exiting.to_wire());
            let _ = conn.send_frame(Direction::Reply, request_id, None, &reply);
        }
    }
    true
}

/// Request deadline from the link speed hint and the request kind.
pub fn deadline_for(speed: u8, procedure: Procedure) -> Duration {
    let base = match procedure {
        Procedure::Read
        | Procedure::Write
        | Procedure::ReadDir
        | Procedure::Md5Sum
        | Procedure::Ping => Duration::from_secs(40),
        _ => Duration::from_secs(20),
    };
    // speed 0 is unknown, 1 a slow link
    if speed == 1 {
        base * 4
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::master_daemon;

    /// A connected socket pair; the far ends stay alive so the reader
    /// threads do not see EOF mid-test.
    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let near = TcpStream::connect(addr).unwrap();
        let (far, _) = listener.accept().unwrap();
        (near, far)
    }

    #[test]
    fn generations_grow_and_stale_replies_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let zfsd = master_daemon(1, 7, dir.path());
        let (sock_a, _keep_a) = loopback_pair();
        let (sock_b, _keep_b) = loopback_pair();

        let first = zfsd.net.adopt(&zfsd, sock_a).unwrap();
        let second = zfsd.net.adopt(&zfsd, sock_b).unwrap();
        assert!(second.generation > first.generation);

        // a reply arriving on a newer connection for a wait registered
        // under an older generation is dropped
        let stale = zfsd.net.register_call(7, first.generation);
        deliver_reply(&zfsd, &second, 7, vec![1, 2, 3]);
        assert!(stale.try_recv().is_err());

        // the matching generation delivers
        let live = zfsd.net.register_call(8, second.generation);
        deliver_reply(&zfsd, &second, 8, vec![1, 2, 3]);
        assert_eq!(live.try_recv().unwrap().unwrap(), vec![1, 2, 3]);

        zfsd.net.shutdown(&zfsd);
    }

    #[test]
    fn closing_a_connection_fails_only_its_generation() {
        let dir = tempfile::tempdir().unwrap();
        let zfsd = master_daemon(1, 7, dir.path());
        let (sock_a, _keep_a) = loopback_pair();
        let (sock_b, _keep_b) = loopback_pair();
        let doomed = zfsd.net.adopt(&zfsd, sock_a).unwrap();
        let survivor = zfsd.net.adopt(&zfsd, sock_b).unwrap();

        let failed_one = zfsd.net.register_call(1, doomed.generation);
        let failed_two = zfsd.net.register_call(2, doomed.generation);
        let untouched = zfsd.net.register_call(3, survivor.generation);

        zfsd.net.close(&zfsd, &doomed);
        assert!(doomed.is_closed());
        assert_eq!(failed_one.try_recv().unwrap(), Err(ZfsError::ConnectionClosed));
        assert_eq!(failed_two.try_recv().unwrap(), Err(ZfsError::ConnectionClosed));
        assert!(untouched.try_recv().is_err());

        // shutdown releases whatever is still waiting
        zfsd.net.shutdown(&zfsd);
        assert_eq!(untouched.recv().unwrap(), Err(ZfsError::Exiting));
    }

    #[test]
    fn frames_too_large_are_rejected_before_the_wire() {
        let (sock, _keep) = loopback_pair();
        let conn = Connection::new(sock, 1).unwrap();
        let oversized = vec![0u8; MAX_FRAME_LEN];
        let err = conn
            .send_frame(Direction::Request, 1, Some(Procedure::Ping), &oversized)
            .unwrap_err();
        assert_eq!(err, ZfsError::RequestTooLong);
    }
}
