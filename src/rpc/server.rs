//! Incoming request dispatch.
//!
//! A network pool worker gets one decoded-enough frame, runs the handler
//! to completion and sends the status-first reply. Undecodable arguments
//! are a protocol error: the sender gets `invalid request` and the
//! connection drops to resync.

use std::io::Cursor;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::ops;

use super::coding;
use super::connection::{AuthStage, Connection, AUTH_FAILURE_DELAY};
use super::proto::{self, Direction, Procedure, Request};

/// Handle one incoming frame on a pool worker.
pub fn serve(
    zfsd: &Arc<Zfsd>,
    conn: &Arc<Connection>,
    direction: Direction,
    request_id: u32,
    procedure: Procedure,
    body: &[u8],
) {
    let request = match Request::decode(procedure, &mut Cursor::new(body)) {
        Ok(request) => request,
        Err(err) => {
            warn!(?procedure, ?err, "undecodable request, dropping connection");
            reply(conn, direction, request_id, Err(ZfsError::InvalidRequest));
            zfsd.net.close(zfsd, conn);
            return;
        }
    };
    debug!(request_id, ?procedure, "serving request");
    zfsd.net.record_call(procedure);

    // everything but liveness probes and the handshake needs an
    // authenticated peer
    let authenticated = conn.auth() == AuthStage::Established;
    if !authenticated
        && !matches!(
            procedure,
            Procedure::Null | Procedure::Ping | Procedure::AuthStage1 | Procedure::AuthStage2
        )
    {
        reply(conn, direction, request_id, Err(ZfsError::CouldNotAuth));
        zfsd.net.close(zfsd, conn);
        return;
    }

    match request {
        Request::AuthStage1 { node } => {
            serve_auth_stage1(zfsd, conn, direction, request_id, &node);
            return;
        }
        Request::AuthStage2 { speed, generation } => {
            serve_auth_stage2(zfsd, conn, direction, request_id, speed, generation);
            return;
        }
        _ => {}
    }

    if zfsd.is_terminating() {
        reply(conn, direction, request_id, Err(ZfsError::Exiting));
        return;
    }

    let from_sid = conn.sid();
    let outcome = dispatch(zfsd, from_sid, request);
    reply(conn, direction, request_id, outcome);
}

fn dispatch(zfsd: &Arc<Zfsd>, from_sid: u32, request: Request) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match request {
        Request::Null => {}
        Request::Ping { payload } => {
            // the receiver sends back what the sender sent
            coding::put_bytes(&mut out, &payload);
        }
        Request::Root => {
            let res = ops::zfs_root(zfsd)?;
            proto::put_fh(&mut out, &res.file);
        }
        Request::VolumeRoot { vid } => {
            ops::zfs_volume_root(zfsd, vid)?.encode(&mut out);
        }
        Request::GetAttr { file } => {
            proto::put_fattr(&mut out, &ops::zfs_getattr(zfsd, &file)?);
        }
        Request::SetAttr { file, attr } => {
            proto::put_fattr(&mut out, &ops::zfs_setattr(zfsd, &file, &attr)?);
        }
        Request::Lookup(dir_op) => {
            ops::zfs_lookup(zfsd, &dir_op.dir, &dir_op.name)?.encode(&mut out);
        }
        Request::Create { dir_op, flags, attr } => {
            ops::zfs_create(zfsd, &dir_op.dir, &dir_op.name, flags, &attr)?.encode(&mut out);
        }
        Request::Open { file, flags } => {
            ops::zfs_open(zfsd, &file, flags)?.encode(&mut out);
        }
        Request::Close { cap } => {
            ops::zfs_close(zfsd, &cap)?;
        }
        Request::ReadDir { cap, cookie, count } => {
            ops::zfs_readdir(zfsd, &cap, cookie, count)?.encode(&mut out);
        }
        Request::MkDir { dir_op, attr } => {
            ops::zfs_mkdir(zfsd, &dir_op.dir, &dir_op.name, &attr)?.encode(&mut out);
        }
        Request::RmDir(dir_op) => {
            ops::zfs_rmdir(zfsd, &dir_op.dir, &dir_op.name)?;
        }
        Request::Rename { from, to } => {
            ops::zfs_rename(zfsd, &from.dir, &from.name, &to.dir, &to.name)?;
        }
        Request::Link { from, to } => {
            ops::zfs_link(zfsd, &from, &to.dir, &to.name)?;
        }
        Request::Unlink(dir_op) => {
            ops::zfs_unlink(zfsd, &dir_op.dir, &dir_op.name)?;
        }
        Request::Read { cap, offset, count } => {
            ops::zfs_read(zfsd, &cap, offset, count)?.encode(&mut out);
        }
        Request::Write { cap, offset, data } => {
            ops::zfs_write(zfsd, &cap, offset, &data)?.encode(&mut out);
        }
        Request::ReadLink { file } => {
            coding::put_string(&mut out, &ops::zfs_readlink(zfsd, &file)?);
        }
        Request::SymLink { dir_op, to, attr } => {
            ops::zfs_symlink(zfsd, &dir_op.dir, &dir_op.name, &to, &attr)?.encode(&mut out);
        }
        Request::MkNod { dir_op, attr, ftype, rdev } => {
            ops::zfs_mknod(zfsd, &dir_op.dir, &dir_op.name, &attr, ftype, rdev)?
                .encode(&mut out);
        }
        Request::Md5Sum { cap, ignore_changes: _, ranges } => {
            ops::local_md5sum(zfsd, &cap, &ranges)?.encode(&mut out);
        }
        Request::FileInfo { file } => {
            coding::put_string(&mut out, &ops::zfs_file_info(zfsd, &file)?);
        }
        Request::RereadConfig { path } => {
            // one-way: queue for the configuration reader, never reply
            let _ = zfsd.request_config_reread(&path, from_sid);
        }
        Request::Reintegrate { fh, acquire } => {
            crate::reintegrate::zfs_reintegrate(zfsd, from_sid, &fh, acquire)?;
        }
        Request::ReintegrateAdd { fh, dir, name } => {
            crate::reintegrate::zfs_reintegrate_add(zfsd, from_sid, &fh, &dir, &name)?;
        }
        Request::ReintegrateDel { fh, dir, name, destroy } => {
            crate::reintegrate::zfs_reintegrate_del(zfsd, from_sid, &fh, &dir, &name, destroy)?;
        }
        Request::ReintegrateVer { fh, version_inc } => {
            crate::reintegrate::zfs_reintegrate_ver(zfsd, from_sid, &fh, version_inc)?;
        }
        Request::AuthStage1 { .. } | Request::AuthStage2 { .. } => unreachable!(),
    }
    Ok(out)
}

fn serve_auth_stage1(
    zfsd: &Arc<Zfsd>,
    conn: &Arc<Connection>,
    direction: Direction,
    request_id: u32,
    peer_name: &str,
) {
    let node = zfsd.nodes.lock().lookup_name(peer_name);
    match node {
        Some(node) => {
            info!(peer = %peer_name, sid = node.id, "peer authenticated, stage 1");
            {
                let mut info = conn.info.lock();
                info.sid = node.id;
                info.auth = AuthStage::Stage1;
            }
            zfsd.net.bind_sid(zfsd, conn, node.id);
            let mut out = Vec::new();
            coding::put_string(&mut out, zfsd.this_name());
            reply(conn, direction, request_id, Ok(out));
        }
        None => {
            warn!(peer = %peer_name, "unknown node name in handshake");
            // throttle brute reconnect loops before closing
            std::thread::sleep(AUTH_FAILURE_DELAY);
            zfsd.net.close(zfsd, conn);
        }
    }
}

fn serve_auth_stage2(
    zfsd: &Arc<Zfsd>,
    conn: &Arc<Connection>,
    direction: Direction,
    request_id: u32,
    speed: u8,
    generation: u64,
) {
    let stage1_done = conn.auth() == AuthStage::Stage1;
    if !stage1_done {
        std::thread::sleep(AUTH_FAILURE_DELAY);
        zfsd.net.close(zfsd, conn);
        return;
    }
    let sid = {
        let mut info = conn.info.lock();
        info.auth = AuthStage::Established;
        info.speed = speed;
        info.peer_generation = generation;
        info.sid
    };
    info!(sid, speed, "peer authenticated, stage 2");
    reply(conn, direction, request_id, Ok(Vec::new()));
    // the link is usable both ways now; push what that peer is owed
    crate::reintegrate::kick_reintegration(zfsd, sid);
}

/// Send the status-first reply body; one-way requests get none.
fn reply(conn: &Arc<Connection>, direction: Direction, request_id: u32, outcome: Result<Vec<u8>>) {
    if direction == Direction::Oneway {
        return;
    }
    let mut frame = Vec::new();
    match outcome {
        Ok(body) => {
            coding::put_i32(&mut frame, 0);
            frame.extend_from_slice(&body);
        }
        Err(err) => {
            coding::put_i32(&mut frame, err.to_wire());
        }
    }
    let _ = conn.send_frame(Direction::Reply, request_id, None, &frame);
}

#[cfg(test)]
mod tests {
    use std::io::{Read as _, Write as _};
    use std::time::Instant;

    use byteorder::{ByteOrder, LittleEndian};

    use super::*;
    use crate::config::LocalConfig;
    use crate::fh::ZfsFh;
    use crate::rpc::client;
    use crate::testing::started_master;

    #[test]
    fn unknown_peer_name_stalls_then_drops() {
        let dir = tempfile::tempdir().unwrap();
        let master = started_master(1, 7, dir.path());
        let port = master.listener_addr().unwrap().port();

        // a node the master has never heard of
        let stranger = Zfsd::new(
            LocalConfig::parse(
                r#"
                [local_node]
                id = 9
                name = "n9"
                port = 0
                "#,
            )
            .unwrap(),
        )
        .unwrap();
        stranger.nodes.lock().try_create(1, "n1", "127.0.0.1", port).unwrap();
        let node = stranger.node(1).unwrap();

        let started = Instant::now();
        let err = client::connect_and_authenticate(&stranger, &node).unwrap_err();
        assert!(started.elapsed() >= AUTH_FAILURE_DELAY);
        assert!(err == ZfsError::CouldNotAuth || err.is_connection_error(), "got {err:?}");
        assert!(stranger.net.established(1).is_none());

        stranger.shutdown();
        master.shutdown();
    }

    #[test]
    fn requests_before_authentication_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let master = started_master(1, 7, dir.path());
        let addr = master.listener_addr().unwrap();

        let mut sock = std::net::TcpStream::connect(addr).unwrap();
        sock.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();

        // a getattr frame straight onto a fresh connection
        let mut body = Vec::new();
        proto::put_fh(&mut body, &ZfsFh::new(1, 7, 1, 1, 1));
        let mut frame = Vec::new();
        let payload_len = 1 + 4 + 4 + body.len();
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, payload_len as u32);
        frame.extend_from_slice(&buf);
        frame.push(Direction::Request as u8);
        LittleEndian::write_u32(&mut buf, 42);
        frame.extend_from_slice(&buf);
        LittleEndian::write_u32(&mut buf, Procedure::GetAttr as u32);
        frame.extend_from_slice(&buf);
        frame.extend_from_slice(&body);
        sock.write_all(&frame).unwrap();

        // the reply carries the auth failure status...
        let mut len_buf = [0u8; 4];
        sock.read_exact(&mut len_buf).unwrap();
        let len = LittleEndian::read_u32(&len_buf) as usize;
        let mut payload = vec![0u8; len];
        sock.read_exact(&mut payload).unwrap();
        assert_eq!(payload[0], Direction::Reply as u8);
        assert_eq!(LittleEndian::read_u32(&payload[1..5]), 42);
        let status = LittleEndian::read_i32(&payload[5..9]);
        assert_eq!(status, ZfsError::CouldNotAuth.to_wire());

        // ...and the connection is dropped to resync
        let eof = sock.read(&mut len_buf).unwrap();
        assert_eq!(eof, 0);

        master.shutdown();
    }
}
