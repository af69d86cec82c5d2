//! Pairs transit connections by handshake token.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

/// What a parked connection eventually hears from the matcher.
pub enum PairMsg {
    /// A counterpart arrived; here is its socket plus any bytes it had
    /// already pipelined after its handshake.
    Peer {
        stream: TcpStream,
        residual: Vec<u8>,
    },
    /// Someone else won the pairing; go away.
    Redundant,
}

struct Waiter {
    side: String,
    tx: oneshot::Sender<PairMsg>,
}

/// Outcome of presenting a token.
pub enum Verdict {
    /// A matching waiter exists; hand it your socket via this channel. A
    /// failed send means the entry was stale (its token already consumed)
    /// and the caller is redundant.
    Matched(oneshot::Sender<PairMsg>),
    /// No counterpart yet; wait on the receiver paired with the sender you
    /// handed in.
    Parked,
}

/// Process-wide pending map, one lock. Entries are held in memory only.
#[derive(Default)]
pub struct Matcher {
    pending: Mutex<HashMap<String, Vec<Waiter>>>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Vec<Waiter>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Present a token and side. Two connections match when either side is
    /// empty or the sides differ. On a match, every other candidate under
    /// the token is evicted as redundant and the entry is dropped. The
    /// newest arrival then takes over the token's slot unconditionally, so
    /// only the newest waiter ever survives.
    pub fn process_token(&self, token: &str, side: &str, parked: oneshot::Sender<PairMsg>) -> Verdict {
        let mut pending = self.pending();

        let mut matched = None;
        if let Some(mut waiters) = pending.remove(token) {
            debug!(
                token = %token,
                candidates = waiters.len(),
                "searching pending connections"
            );

            let position = waiters
                .iter()
                .position(|w| w.side.is_empty() || side.is_empty() || w.side != side);

            if let Some(position) = position {
                let winner = waiters.swap_remove(position);
                for redundant in waiters {
                    let _ = redundant.tx.send(PairMsg::Redundant);
                }
                matched = Some(winner.tx);
            }
            // Unmatched candidates are displaced by the replacement below;
            // their tasks keep watching their own sockets.
        }

        pending.insert(
            token.to_string(),
            vec![Waiter {
                side: side.to_string(),
                tx: parked,
            }],
        );

        match matched {
            Some(tx) => Verdict::Matched(tx),
            None => Verdict::Parked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (oneshot::Sender<PairMsg>, oneshot::Receiver<PairMsg>) {
        oneshot::channel()
    }

    #[test]
    fn first_arrival_parks() {
        let matcher = Matcher::new();
        let (tx, _rx) = channel();
        assert!(matches!(
            matcher.process_token("tok", "", tx),
            Verdict::Parked
        ));
    }

    #[test]
    fn empty_sides_match() {
        let matcher = Matcher::new();
        let (tx1, mut rx1) = channel();
        matcher.process_token("tok", "", tx1);

        let (tx2, _rx2) = channel();
        let Verdict::Matched(winner) = matcher.process_token("tok", "", tx2) else {
            panic!("expected a match");
        };

        // The winner channel is the first waiter's.
        winner.send(PairMsg::Redundant).ok();
        assert!(rx1.try_recv().is_ok());
    }

    #[test]
    fn same_nonempty_sides_do_not_match() {
        let matcher = Matcher::new();
        let (tx1, mut rx1) = channel();
        matcher.process_token("tok", "aaaa", tx1);

        let (tx2, _rx2) = channel();
        assert!(matches!(
            matcher.process_token("tok", "aaaa", tx2),
            Verdict::Parked
        ));

        // The first waiter was displaced: its channel is dead.
        assert!(matches!(
            rx1.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn different_sides_match() {
        let matcher = Matcher::new();
        let (tx1, _rx1) = channel();
        matcher.process_token("tok", "aaaa", tx1);

        let (tx2, _rx2) = channel();
        assert!(matches!(
            matcher.process_token("tok", "bbbb", tx2),
            Verdict::Matched(_)
        ));
    }

    #[test]
    fn consumed_token_leaves_a_dead_entry() {
        let matcher = Matcher::new();
        let (tx1, _rx1) = channel();
        matcher.process_token("tok", "", tx1);

        let (tx2, rx2) = channel();
        let Verdict::Matched(_winner) = matcher.process_token("tok", "", tx2) else {
            panic!("expected a match");
        };
        // The second arrival's own slot replaced the entry; once its
        // receiver is gone the entry is stale.
        drop(rx2);

        let (tx3, _rx3) = channel();
        let Verdict::Matched(stale) = matcher.process_token("tok", "", tx3) else {
            panic!("expected a (stale) match");
        };
        // Pairing with it fails, which is how the caller learns it is
        // redundant.
        assert!(stale.send(PairMsg::Redundant).is_err());
    }
}
