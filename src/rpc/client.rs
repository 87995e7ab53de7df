//! Outgoing calls: connect, authenticate, send, wait for the reply.

use std::io::Cursor;
use std::sync::Arc;

use tracing::{debug, info};

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::node::Node;

use super::coding;
use super::connection::{deadline_for, AuthStage, Connection};
use super::proto::{Direction, Request};

/// Reply body of a successful call, positioned after the status word.
pub type Reply = Cursor<Vec<u8>>;

/// Call `request` on `node`, connecting and authenticating first when no
/// established connection exists.
pub fn call(zfsd: &Arc<Zfsd>, node: &Arc<Node>, request: &Request) -> Result<Reply> {
    let conn = connect_and_authenticate(zfsd, node)?;
    call_on(zfsd, &conn, request)
}

/// Send a one-way request; no reply is ever delivered.
pub fn oneway(zfsd: &Arc<Zfsd>, node: &Arc<Node>, request: &Request) -> Result<()> {
    let conn = connect_and_authenticate(zfsd, node)?;
    let request_id = zfsd.net.next_request_id();
    let mut body = Vec::new();
    request.encode_args(&mut body);
    debug!(request_id, procedure = ?request.procedure(), "sending oneway request");
    conn.send_frame(Direction::Oneway, request_id, Some(request.procedure()), &body)
}

/// Call `request` over an already chosen connection.
pub fn call_on(zfsd: &Arc<Zfsd>, conn: &Arc<Connection>, request: &Request) -> Result<Reply> {
    let procedure = request.procedure();
    let request_id = zfsd.net.next_request_id();
    let mut body = Vec::new();
    request.encode_args(&mut body);
    debug!(request_id, ?procedure, "sending request");

    let rx = zfsd.net.register_call(request_id, conn.generation);
    if let Err(err) = conn.send_frame(Direction::Request, request_id, Some(procedure), &body) {
        zfsd.net.forget_call(request_id);
        zfsd.net.close(zfsd, conn);
        return Err(err);
    }

    let speed = conn.info.lock().speed;
    match rx.recv_timeout(deadline_for(speed, procedure)) {
        Ok(Ok(reply)) => finish_reply(reply),
        Ok(Err(err)) => Err(err),
        Err(_) => {
            zfsd.net.forget_call(request_id);
            Err(ZfsError::RequestTimeout)
        }
    }
}

/// Split the leading status word off a raw reply body.
fn finish_reply(body: Vec<u8>) -> Result<Reply> {
    let mut cursor = Cursor::new(body);
    let status = coding::i32(&mut cursor).map_err(|_| ZfsError::InvalidReply)?;
    if status != 0 {
        return Err(ZfsError::from_wire(status));
    }
    Ok(cursor)
}

/// The established connection to `node`, running the two-stage handshake
/// when none exists yet. Stage 1 exchanges node names, stage 2 carries the
/// link speed hint and our connection generation for lease fencing. A
/// failed handshake closes the socket; reconnects are throttled by the
/// node's back-off window.
pub fn connect_and_authenticate(zfsd: &Arc<Zfsd>, node: &Arc<Node>) -> Result<Arc<Connection>> {
    if node.id == zfsd.this_sid() {
        return Err(ZfsError::InvalidArgument);
    }
    if let Some(conn) = zfsd.net.established(node.id) {
        return Ok(conn);
    }

    let conn = zfsd.net.open(zfsd, node)?;
    match handshake(zfsd, node, &conn) {
        Ok(()) => {
            zfsd.net.bind_sid(zfsd, &conn, node.id);
            info!(node = node.id, generation = conn.generation, "connection established");
            crate::reintegrate::kick_reintegration(zfsd, node.id);
            Ok(conn)
        }
        Err(err) => {
            zfsd.net.close(zfsd, &conn);
            Err(err)
        }
    }
}

fn handshake(zfsd: &Arc<Zfsd>, node: &Arc<Node>, conn: &Arc<Connection>) -> Result<()> {
    let this_name = zfsd.this_name().to_owned();
    let mut reply = call_on(zfsd, conn, &Request::AuthStage1 { node: this_name })
        .map_err(auth_failure)?;
    let peer_name = coding::name(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
    if peer_name != node.data.lock().name {
        return Err(ZfsError::CouldNotAuth);
    }
    {
        let mut info = conn.info.lock();
        info.auth = AuthStage::Stage1;
    }

    call_on(
        zfsd,
        conn,
        &Request::AuthStage2 { speed: zfsd.link_speed(), generation: conn.generation },
    )
    .map_err(auth_failure)?;
    {
        let mut info = conn.info.lock();
        info.auth = AuthStage::Established;
    }
    Ok(())
}

fn auth_failure(err: ZfsError) -> ZfsError {
    if err.is_connection_error() {
        err
    } else {
        ZfsError::CouldNotAuth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{peer_daemon, started_master};

    #[test]
    fn handshake_establishes_once_and_reuses_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let master = started_master(1, 7, dir.path());
        let peer = peer_daemon(2, &master);
        let node = peer.node(1).unwrap();

        let conn = connect_and_authenticate(&peer, &node).unwrap();
        assert_eq!(conn.auth(), AuthStage::Established);
        assert!(peer.net.established(1).is_some());

        // a second call reuses the established connection
        let again = connect_and_authenticate(&peer, &node).unwrap();
        assert!(Arc::ptr_eq(&conn, &again));

        // ping echoes through the live link
        let mut reply =
            call(&peer, &node, &Request::Ping { payload: b"are you there".to_vec() }).unwrap();
        let echoed = coding::data_buffer(&mut reply).unwrap();
        assert_eq!(echoed, b"are you there");

        // stage 2 left our generation on record for lease fencing
        assert_eq!(master.net.peer_generation_of(2), Some(conn.generation));

        peer.shutdown();
        master.shutdown();
    }

    #[test]
    fn calling_ourselves_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let master = started_master(1, 7, dir.path());
        let this_node = master.node(1).unwrap();
        let err = connect_and_authenticate(&master, &this_node).unwrap_err();
        assert_eq!(err, ZfsError::InvalidArgument);
        master.shutdown();
    }
}
