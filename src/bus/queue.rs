//! Bounded in-process queues between adapters and the agent core

use super::message::{InboundMessage, OutboundMessage};
use crate::error::{Error, Result};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Default queue capacity per direction.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Two bounded FIFO queues: inbound (platform → agent) and outbound
/// (agent → platform). Each direction has exactly one consumer.
///
/// Publishing to a full queue waits until the consumer catches up.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
}

impl MessageBus {
    /// Create a bus with the given per-direction capacities
    pub fn new(inbound_capacity: usize, outbound_capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity.max(1));
        Self {
            inbound_tx,
            outbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    /// Publish a message from a platform toward the agent core
    pub async fn publish_inbound(&self, message: InboundMessage) -> Result<()> {
        self.inbound_tx
            .send(message)
            .await
            .map_err(|_| Error::Bus("inbound consumer is gone".to_string()))
    }

    /// Publish a message from the agent core toward a platform
    pub async fn publish_outbound(&self, message: OutboundMessage) -> Result<()> {
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| Error::Bus("outbound consumer is gone".to_string()))
    }

    /// Take the inbound stream. Only the first call succeeds.
    pub fn subscribe_inbound(&self) -> Result<InboundReceiver> {
        take_receiver(&self.inbound_rx, "inbound").map(|rx| InboundReceiver { rx })
    }

    /// Take the outbound stream. Only the first call succeeds.
    pub fn subscribe_outbound(&self) -> Result<OutboundReceiver> {
        take_receiver(&self.outbound_rx, "outbound").map(|rx| OutboundReceiver { rx })
    }

    /// Cloneable handle adapters use to publish inbound messages
    pub fn inbound_publisher(&self) -> InboundPublisher {
        InboundPublisher {
            tx: self.inbound_tx.clone(),
        }
    }

    /// Cloneable handle the agent core uses to publish replies
    pub fn outbound_publisher(&self) -> OutboundPublisher {
        OutboundPublisher {
            tx: self.outbound_tx.clone(),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, DEFAULT_QUEUE_CAPACITY)
    }
}

fn take_receiver<T>(slot: &Mutex<Option<mpsc::Receiver<T>>>, direction: &str) -> Result<mpsc::Receiver<T>> {
    let mut slot = slot
        .lock()
        .map_err(|_| Error::Bus(format!("{} subscription lock poisoned", direction)))?;
    slot.take()
        .ok_or_else(|| Error::Bus(format!("{} stream already has a subscriber", direction)))
}

/// Publishing half handed to adapters
#[derive(Clone)]
pub struct InboundPublisher {
    tx: mpsc::Sender<InboundMessage>,
}

impl InboundPublisher {
    /// Publish one inbound message, waiting if the queue is full
    pub async fn publish(&self, message: InboundMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::Bus("inbound consumer is gone".to_string()))
    }
}

/// Publishing half handed to the agent core
#[derive(Clone)]
pub struct OutboundPublisher {
    tx: mpsc::Sender<OutboundMessage>,
}

impl OutboundPublisher {
    /// Publish one outbound message, waiting if the queue is full
    pub async fn publish(&self, message: OutboundMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::Bus("outbound consumer is gone".to_string()))
    }
}

/// The single inbound consumer
pub struct InboundReceiver {
    rx: mpsc::Receiver<InboundMessage>,
}

impl InboundReceiver {
    /// Receive the next message; `None` once every publisher is dropped
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    /// Convert into a `Stream`
    pub fn into_stream(self) -> ReceiverStream<InboundMessage> {
        ReceiverStream::new(self.rx)
    }
}

/// The single outbound consumer
pub struct OutboundReceiver {
    rx: mpsc::Receiver<OutboundMessage>,
}

impl OutboundReceiver {
    /// Receive the next message; `None` once every publisher is dropped
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.rx.recv().await
    }

    /// Convert into a `Stream`
    pub fn into_stream(self) -> ReceiverStream<OutboundMessage> {
        ReceiverStream::new(self.rx)
    }
}
