//! One transit connection: handshake parsing, pairing, and the splice loop.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::transit::matcher::{Matcher, PairMsg, Verdict};

const OLD_PREFIX: &str = "please relay ";
const NEW_INFIX: &str = " for side ";
const TOKEN_LEN: usize = 64;
const SIDE_LEN: usize = 16;

/// `please relay <64-hex>\n`
pub const OLD_HANDSHAKE_LEN: usize = OLD_PREFIX.len() + TOKEN_LEN + 1;
/// `please relay <64-hex> for side <16-hex>\n`
pub const NEW_HANDSHAKE_LEN: usize = OLD_PREFIX.len() + TOKEN_LEN + NEW_INFIX.len() + SIDE_LEN + 1;

#[derive(Debug, PartialEq, Eq)]
pub enum Handshake {
    Accepted {
        token: String,
        side: String,
        /// Bytes that arrived in the same read, past the handshake line.
        residual: Vec<u8>,
    },
    Rejected,
    Incomplete,
}

/// Decide what to do with the bytes accumulated so far.
///
/// The old form is checked as soon as enough bytes exist for it; a line that
/// has a newline but matches neither form is rejected without waiting for
/// more input.
pub fn parse_handshake(buf: &[u8]) -> Handshake {
    if buf.len() >= OLD_HANDSHAKE_LEN {
        if let Some(token) = parse_old(&buf[..OLD_HANDSHAKE_LEN]) {
            return Handshake::Accepted {
                token,
                side: String::new(),
                residual: buf[OLD_HANDSHAKE_LEN..].to_vec(),
            };
        }
    }

    if buf.len() >= NEW_HANDSHAKE_LEN {
        return match parse_new(&buf[..NEW_HANDSHAKE_LEN]) {
            Some((token, side)) => Handshake::Accepted {
                token,
                side,
                residual: buf[NEW_HANDSHAKE_LEN..].to_vec(),
            },
            None => Handshake::Rejected,
        };
    }

    // A complete line too short for either form can never become valid.
    if buf.contains(&b'\n') {
        return Handshake::Rejected;
    }

    Handshake::Incomplete
}

fn parse_old(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(line).ok()?;
    let rest = line.strip_prefix(OLD_PREFIX)?;
    let (token, tail) = rest.split_at(TOKEN_LEN);
    if tail != "\n" || !is_hex(token) {
        return None;
    }
    Some(token.to_string())
}

fn parse_new(line: &[u8]) -> Option<(String, String)> {
    let line = std::str::from_utf8(line).ok()?;
    let rest = line.strip_prefix(OLD_PREFIX)?;
    let (token, rest) = rest.split_at(TOKEN_LEN);
    let rest = rest.strip_prefix(NEW_INFIX)?;
    let (side, tail) = rest.split_at(SIDE_LEN);
    if tail != "\n" || !is_hex(token) || !is_hex(side) {
        return None;
    }
    Some((token.to_string(), side.to_string()))
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Drive one accepted TCP connection through handshake, pairing, and (for
/// the waiting end) the splice.
pub async fn handle_connection(mut stream: TcpStream, matcher: Arc<Matcher>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let (token, side, residual) = loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "failed to read transit handshake");
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        match parse_handshake(&buf) {
            Handshake::Accepted {
                token,
                side,
                residual,
            } => break (token, side, residual),
            Handshake::Rejected => {
                debug!("rejecting transit handshake");
                let _ = stream.write_all(b"bad handshake\n").await;
                return;
            }
            Handshake::Incomplete => continue,
        }
    };

    if side.is_empty() {
        info!(token = %token, "accepting old version token");
    } else {
        info!(token = %token, side = %side, "accepting token");
    }

    let (parked_tx, parked_rx) = oneshot::channel();
    match matcher.process_token(&token, &side, parked_tx) {
        Verdict::Matched(winner) => {
            // Hand our socket to the waiting task; it writes `ok` to both
            // ends and runs the pipe. A dead channel means the token was
            // already consumed.
            if let Err(PairMsg::Peer { mut stream, .. }) =
                winner.send(PairMsg::Peer { stream, residual })
            {
                debug!(token = %token, "token already consumed, dismissing connection");
                let _ = stream.write_all(b"redundant\n").await;
            }
        }
        Verdict::Parked => wait_for_peer(stream, residual, parked_rx).await,
    }
}

/// Park until a counterpart shows up, while still watching our own socket:
/// bytes sent before pairing are impatience, EOF abandons the slot.
async fn wait_for_peer(
    mut stream: TcpStream,
    residual: Vec<u8>,
    parked_rx: oneshot::Receiver<PairMsg>,
) {
    if !residual.is_empty() {
        let _ = stream.write_all(b"impatient\n").await;
        return;
    }

    enum Waited {
        Paired(TcpStream, Vec<u8>),
        Redundant,
        /// Our pending-list entry was displaced by a newer waiter; nobody
        /// will ever pair us.
        Displaced,
        EarlyBytes,
        SocketGone,
    }

    let mut probe = [0u8; 64];
    let waited = tokio::select! {
        outcome = parked_rx => match outcome {
            Ok(PairMsg::Peer { stream, residual }) => Waited::Paired(stream, residual),
            Ok(PairMsg::Redundant) => Waited::Redundant,
            Err(_) => Waited::Displaced,
        },
        read = stream.read(&mut probe) => match read {
            Ok(0) | Err(_) => Waited::SocketGone,
            Ok(_) => Waited::EarlyBytes,
        },
    };

    match waited {
        Waited::Paired(peer, residual) => splice(stream, peer, residual).await,
        Waited::Redundant => {
            let _ = stream.write_all(b"redundant\n").await;
        }
        Waited::Displaced => idle_watch(stream).await,
        Waited::EarlyBytes => {
            let _ = stream.write_all(b"impatient\n").await;
        }
        Waited::SocketGone => {}
    }
}

async fn idle_watch(mut stream: TcpStream) {
    let mut probe = [0u8; 64];
    loop {
        match stream.read(&mut probe).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                let _ = stream.write_all(b"impatient\n").await;
                return;
            }
        }
    }
}

/// Confirm both ends and pump bytes until either socket closes or errors,
/// which closes both. `residual` is data the peer sent ahead of the `ok`.
async fn splice(mut ours: TcpStream, mut peer: TcpStream, residual: Vec<u8>) {
    if ours.write_all(b"ok\n").await.is_err() {
        return;
    }
    if peer.write_all(b"ok\n").await.is_err() {
        return;
    }
    if !residual.is_empty() && ours.write_all(&residual).await.is_err() {
        return;
    }

    debug!("transit pipe established");

    let (mut ours_read, mut ours_write) = ours.into_split();
    let (mut peer_read, mut peer_write) = peer.into_split();

    // First direction to finish tears down the whole pipe: dropping both
    // halves on return closes both sockets.
    tokio::select! {
        _ = tokio::io::copy(&mut ours_read, &mut peer_write) => {}
        _ = tokio::io::copy(&mut peer_read, &mut ours_write) => {}
    }

    debug!("transit pipe closed");
}
