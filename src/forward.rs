use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::Snapshot;
use crate::haproxy;
use crate::protocol::{self, PacketContext};
use crate::routing;

/// Drive one accepted client connection through handshake, routing, backend
/// dial and the bidirectional copy. Every failure path simply drops both
/// sockets; nothing is reported back to the client.
pub async fn handle_connection(mut client: TcpStream, peer: SocketAddr, snapshot: Snapshot) {
    // The connection timeout bounds the handshake read and the backend dial.
    // It does not apply once forwarding starts.
    let body = match timeout(
        snapshot.connection_timeout,
        protocol::read_framed_packet(&mut client),
    )
    .await
    {
        Ok(Ok(body)) => body,
        Ok(Err(err)) => {
            debug!(client = %peer, error = %err, "malformed handshake");
            return;
        }
        Err(_) => {
            debug!(client = %peer, "handshake read timed out");
            return;
        }
    };

    let mut pc = match PacketContext::decode(body) {
        Ok(pc) => pc,
        Err(err) => {
            debug!(client = %peer, error = %err, "malformed handshake");
            return;
        }
    };

    if pc.handshake.next_status != protocol::NEXT_STATE_STATUS
        && pc.handshake.next_status != protocol::NEXT_STATE_LOGIN
    {
        debug!(client = %peer, next_status = pc.handshake.next_status, "invalid next state");
        return;
    }

    let cleared = routing::clear_virtual_host(&pc.handshake.server_address).to_string();

    let Some((pattern, route)) = routing::find_route(&cleared, &snapshot.routes) else {
        debug!(client = %peer, host = %cleared, "no route for host");
        return;
    };

    let Some(raw_backend) = routing::pick_backend(route) else {
        info!(client = %peer, host = %cleared, route = %pattern, "route has no backend configured");
        return;
    };
    let Some(backend) = routing::backend_addr(raw_backend) else {
        info!(client = %peer, host = %cleared, backend = %raw_backend, "invalid backend address");
        return;
    };

    let mut upstream = match timeout(snapshot.connection_timeout, TcpStream::connect(&backend)).await
    {
        Ok(Ok(s)) => s,
        Ok(Err(err)) => {
            info!(client = %peer, backend = %backend, error = %err, "failed to connect to backend");
            return;
        }
        Err(_) => {
            info!(client = %peer, backend = %backend, "backend dial timed out");
            return;
        }
    };

    if route.proxy_protocol {
        let dst = match upstream.peer_addr() {
            Ok(a) => a,
            Err(err) => {
                info!(client = %peer, backend = %backend, error = %err, "backend address unavailable");
                return;
            }
        };
        let header = haproxy::encode_v2(peer, dst);
        if let Err(err) = upstream.write_all(&header).await {
            info!(client = %peer, backend = %backend, error = %err, "failed to write proxy protocol header");
            return;
        }
    }

    if route.real_ip && routing::is_real_ip(&pc.handshake.server_address) {
        pc.handshake.server_address =
            routing::real_ip_address(&pc.handshake.server_address, peer.ip(), now_unix_ms());
        pc.rewrite_payload();
    }

    // Replay the captured handshake, then hand over to raw byte copies.
    let mut framed = Vec::with_capacity(pc.payload.len() + 5);
    protocol::write_varint(&mut framed, pc.payload.len() as i32);
    framed.extend_from_slice(&pc.payload);
    if let Err(err) = upstream.write_all(&framed).await {
        debug!(client = %peer, backend = %backend, error = %err, "failed to write handshake to backend");
        return;
    }

    info!(client = %peer, host = %cleared, route = %pattern, backend = %backend, "forwarding connection");

    // Either direction finishing tears down the other; dropping the halves
    // closes both sockets.
    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();

    let mut client_to_backend =
        tokio::spawn(async move { tokio::io::copy(&mut client_rd, &mut upstream_wr).await });

    tokio::select! {
        res = &mut client_to_backend => {
            if let Ok(Err(err)) = res {
                debug!(client = %peer, error = %err, "client to backend copy failed");
            }
        }
        res = tokio::io::copy(&mut upstream_rd, &mut client_wr) => {
            if let Err(err) = res {
                debug!(client = %peer, error = %err, "backend to client copy failed");
            }
        }
    }
    client_to_backend.abort();
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
