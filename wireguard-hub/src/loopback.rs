//! C2: the synthetic "loopback" tun. A single-packet rendezvous in each
//! direction between the crypto engine and the hub's own upper layer (C4's
//! netstack). Traffic between two ordinary peers never touches this device;
//! only packets destined for the hub's own overlay address do.
//!
//! Implemented as two capacity-1 `tokio::mpsc` channels: a full channel makes
//! the writer wait, an empty one makes the reader wait, and closing either
//! end makes the other side's next call return a "closed" error.

use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
#[error("loopback device closed")]
pub struct Closed;

/// The engine's half: deliver decrypted packets bound for the hub, and pull
/// packets the hub's upper layer wants sent back out (to be re-encrypted).
pub struct EngineSide {
    up_tx: mpsc::Sender<Vec<u8>>,
    down_rx: mpsc::Receiver<Vec<u8>>,
}

/// The upper layer's half (C4's netstack): pull packets the engine decrypted
/// for the hub, and hand back replies to be encrypted and sent out.
pub struct UpperSide {
    up_rx: mpsc::Receiver<Vec<u8>>,
    down_tx: Option<mpsc::Sender<Vec<u8>>>,
}

/// Creates a connected pair. `Up` is implicit at construction: both halves are
/// immediately usable, matching the "emits a single `Up` at construction" rule.
pub fn channel() -> (EngineSide, UpperSide) {
    let (up_tx, up_rx) = mpsc::channel(1);
    let (down_tx, down_rx) = mpsc::channel(1);

    (EngineSide { up_tx, down_rx }, UpperSide { up_rx, down_tx: Some(down_tx) })
}

impl EngineSide {
    /// Hands a decrypted packet destined for the hub up to C4. Blocks while
    /// the single slot is occupied.
    pub async fn send_up(&self, packet: Vec<u8>) -> Result<(), Closed> {
        self.up_tx.send(packet).await.map_err(|_| Closed)
    }

    /// Pulls a packet the upper layer wants sent back out through the
    /// engine. Blocks while the slot is empty.
    pub async fn recv_down(&mut self) -> Result<Vec<u8>, Closed> {
        self.down_rx.recv().await.ok_or(Closed)
    }
}

impl UpperSide {
    /// Pulls a packet the engine decrypted for the hub.
    pub async fn recv_up(&mut self) -> Result<Vec<u8>, Closed> {
        self.up_rx.recv().await.ok_or(Closed)
    }

    /// Hands a reply down to the engine, to be re-encrypted and sent out.
    pub async fn send_down(&self, packet: Vec<u8>) -> Result<(), Closed> {
        match &self.down_tx {
            Some(down_tx) => down_tx.send(packet).await.map_err(|_| Closed),
            None => Err(Closed),
        }
    }

    /// Closes both directions; any blocked or future read/write on either
    /// side observes [`Closed`]. Dropping `down_tx` is what wakes a blocked
    /// `EngineSide::recv_down()` — `mpsc::Sender` has no `close()` of its own.
    pub fn close(&mut self) {
        self.up_rx.close();
        self.down_tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_a_packet_each_direction() {
        let (engine, mut upper) = channel();

        engine.send_up(vec![1, 2, 3]).await.unwrap();
        assert_eq!(upper.recv_up().await.unwrap(), vec![1, 2, 3]);

        upper.send_down(vec![4, 5]).await.unwrap();
        let mut engine = engine;
        assert_eq!(engine.recv_down().await.unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    async fn closing_surfaces_as_closed_error() {
        let (mut engine, upper) = channel();
        drop(upper);

        assert!(engine.send_up(vec![1]).await.is_err());
        assert!(engine.recv_down().await.is_err());
    }

    #[tokio::test]
    async fn explicit_close_wakes_both_sides() {
        let (mut engine, mut upper) = channel();
        upper.close();

        assert!(engine.send_up(vec![1]).await.is_err());
        assert!(engine.recv_down().await.is_err());
        assert!(upper.recv_up().await.is_err());
        assert!(upper.send_down(vec![2]).await.is_err());
    }
}
