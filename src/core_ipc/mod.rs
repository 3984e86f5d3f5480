//! Message passing between the control session and the data worker.
//!
//! Two independent rendezvous channels exist per data worker: one carrying
//! commands in, one carrying replies out. Both sides follow a strict
//! ping-pong, so neither channel ever sees two senders competing.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::core_path::VirtualPath;

/// Commands sent from the control session to the data worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataCommand {
    List(VirtualPath),
    Retr(VirtualPath),
    Stor(VirtualPath),
    Continue,
    Close,
}

/// Replies sent from the data worker back to the control session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataReply {
    /// The bound listening port, or `None` when no port could be opened.
    /// Sent exactly once, before anything else.
    Port(Option<u16>),
    /// A reply line to relay verbatim to the client.
    Reply(String),
}

/// The peer hung up; no further messages can be exchanged.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("rendezvous channel closed")]
pub struct ChannelClosed;

/// Creates a single-slot handoff channel. `send` blocks while a prior
/// message sits unconsumed in the slot; `recv` blocks until a message
/// exists. No message is dropped or duplicated.
pub fn rendezvous_channel<T>() -> (RendezvousSender<T>, RendezvousReceiver<T>) {
    let (tx, rx) = mpsc::channel(1);
    (RendezvousSender(tx), RendezvousReceiver(rx))
}

pub struct RendezvousSender<T>(mpsc::Sender<T>);

pub struct RendezvousReceiver<T>(mpsc::Receiver<T>);

impl<T> RendezvousSender<T> {
    pub async fn send(&self, message: T) -> Result<(), ChannelClosed> {
        self.0.send(message).await.map_err(|_| ChannelClosed)
    }
}

impl<T> RendezvousReceiver<T> {
    pub async fn recv(&mut self) -> Result<T, ChannelClosed> {
        self.0.recv().await.ok_or(ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn delivers_in_order() {
        let (tx, mut rx) = rendezvous_channel();
        tx.send(1u32).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 1);
        tx.send(2).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn second_send_blocks_until_consumed() {
        let (tx, mut rx) = rendezvous_channel();
        tx.send(1u32).await.unwrap();
        // The slot is occupied, so this send cannot complete yet.
        assert!(timeout(Duration::from_millis(50), tx.send(2)).await.is_err());
        assert_eq!(rx.recv().await.unwrap(), 1);
        tx.send(2).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn recv_blocks_until_sent() {
        let (tx, mut rx) = rendezvous_channel::<u32>();
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        tx.send(7).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn closed_channel_reports_error() {
        let (tx, rx) = rendezvous_channel::<u32>();
        drop(rx);
        assert_eq!(tx.send(1).await, Err(ChannelClosed));

        let (tx, mut rx) = rendezvous_channel::<u32>();
        drop(tx);
        assert_eq!(rx.recv().await, Err(ChannelClosed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ping_pong_never_drops_or_duplicates() {
        const ROUNDS: u64 = 1000;
        let (ping_tx, mut ping_rx) = rendezvous_channel();
        let (pong_tx, mut pong_rx) = rendezvous_channel();

        let echo = tokio::spawn(async move {
            while let Ok(value) = ping_rx.recv().await {
                pong_tx.send(value).await.unwrap();
            }
        });

        for round in 0..ROUNDS {
            ping_tx.send(round).await.unwrap();
            assert_eq!(pong_rx.recv().await.unwrap(), round);
        }
        drop(ping_tx);
        echo.await.unwrap();
    }
}
