use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use crate::error::Error;
use crate::types::ChangeEvent;

/// Receiving end of a subscription.
///
/// Calls for one subscription never overlap and arrive in native order. They
/// run on the native callback thread without any bridge lock held, so a sink
/// may attach or detach the bridge that feeds it. A blocking sink only stalls
/// its own subscription.
pub trait ChangeSink: Send {
    fn on_event(&mut self, event: &ChangeEvent);

    /// Terminal failure. No further calls follow except `on_close`.
    fn on_error(&mut self, error: &Error);

    /// The subscription ended: detach, replacement by a newer attach, or
    /// shutdown.
    fn on_close(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Event(ChangeEvent),
    Failed(String),
}

/// Sink half of a [`ChangeStream`]. Closing drops the sender, which the
/// stream observes as disconnection.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<Sender<StreamItem>>,
}

impl ChannelSink {
    fn send(&mut self, item: StreamItem) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(item).is_err() {
            // Receiver dropped; nothing left to deliver to.
            self.tx = None;
        }
    }
}

impl ChangeSink for ChannelSink {
    fn on_event(&mut self, event: &ChangeEvent) {
        self.send(StreamItem::Event(event.clone()));
    }

    fn on_error(&mut self, error: &Error) {
        self.send(StreamItem::Failed(error.to_string()));
        self.tx = None;
    }

    fn on_close(&mut self) {
        self.tx = None;
    }
}

#[derive(Debug)]
pub struct ChangeStream {
    rx: Receiver<StreamItem>,
}

pub fn channel() -> (ChannelSink, ChangeStream) {
    let (tx, rx) = mpsc::channel();
    (ChannelSink { tx: Some(tx) }, ChangeStream { rx })
}

impl ChangeStream {
    /// Blocks for the next item. `None` once the subscription is closed and
    /// everything delivered before closure has been read.
    pub fn recv(&self) -> Option<StreamItem> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<StreamItem, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<StreamItem, TryRecvError> {
        self.rx.try_recv()
    }

    /// Everything currently queued, up to `max` items.
    pub fn drain(&self, max: usize) -> Vec<StreamItem> {
        self.rx.try_iter().take(max).collect()
    }
}

impl Iterator for ChangeStream {
    type Item = StreamItem;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

/// Push-style sink around a closure, for hosts that poll nothing.
pub struct CallbackSink<F>
where
    F: FnMut(ChangeEvent) + Send,
{
    on_event: F,
    on_end: Option<Box<dyn FnOnce(Option<String>) + Send>>,
}

impl<F> CallbackSink<F>
where
    F: FnMut(ChangeEvent) + Send,
{
    pub fn new(on_event: F) -> Self {
        Self {
            on_event,
            on_end: None,
        }
    }

    /// Called once when the subscription ends, with the failure message if it
    /// ended in error.
    pub fn on_end(mut self, on_end: impl FnOnce(Option<String>) + Send + 'static) -> Self {
        self.on_end = Some(Box::new(on_end));
        self
    }
}

impl<F> ChangeSink for CallbackSink<F>
where
    F: FnMut(ChangeEvent) + Send,
{
    fn on_event(&mut self, event: &ChangeEvent) {
        (self.on_event)(event.clone());
    }

    fn on_error(&mut self, error: &Error) {
        if let Some(on_end) = self.on_end.take() {
            on_end(Some(error.to_string()));
        }
    }

    fn on_close(&mut self) {
        if let Some(on_end) = self.on_end.take() {
            on_end(None);
        }
    }
}
