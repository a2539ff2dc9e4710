//! Typed application events and their dispatch hub.
//!
//! Events are delivered in the order the service produced them, on the poll
//! thread, to an explicit observer list. Consumers that need thread-affine
//! delivery subscribe a channel instead and drain it on their own thread.
//! Lifecycle events (`Init`, `Connected`) replay to late subscribers.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::anatomy::Frame;
use crate::device::Device;
use crate::image::{DistortionData, Image};
use crate::service::{LogSeverity, ServiceResult};

/// Why an image request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFailureReason {
    /// The reserved buffer was too small; the event carries the size the
    /// service needs.
    InsufficientBuffer,
    /// The requested frame is no longer (or not yet) available.
    Unavailable,
    /// Image streaming is disabled by policy.
    ImagesDisabled,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ImageRequestFailure {
    pub frame_id: i64,
    pub reason: ImageFailureReason,
    pub message: String,
    pub required_buffer_len: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum SdkEvent {
    /// The connection object finished initializing.
    Init,
    Connected,
    Disconnected,
    FrameReady(Arc<Frame>),
    DeviceAttached(Device),
    DeviceLost(Device),
    DeviceFailure { handle: u32, code: ServiceResult },
    ImageReady(Image),
    ImageRequestFailed(ImageRequestFailure),
    DistortionChange(Arc<DistortionData>),
    PolicyChange { active: u64, requested: u64 },
    ConfigChange { request_id: u32, success: bool },
    LogMessage { severity: LogSeverity, message: String },
}

/// Handle returned by [`EventHub::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Callback = Box<dyn FnMut(&SdkEvent) + Send>;

struct HubInner {
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
    channels: Vec<Sender<SdkEvent>>,
    /// Remembered lifecycle events, replayed to late subscribers.
    init_seen: bool,
    connected: bool,
    /// Ids of callbacks currently out of the list for dispatch.
    dispatching_ids: Vec<u64>,
    /// Unsubscribes recorded against in-flight callbacks, applied when the
    /// dispatch merges back.
    removed: Vec<u64>,
}

pub struct EventHub {
    inner: Mutex<HubInner>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner {
                next_id: 1,
                callbacks: Vec::new(),
                channels: Vec::new(),
                init_seen: false,
                connected: false,
                dispatching_ids: Vec::new(),
                removed: Vec::new(),
            }),
        }
    }

    /// Registers a callback, replaying any remembered lifecycle events to it
    /// immediately. Subscription is serialized against dispatch, so a new
    /// subscriber never observes a torn event stream.
    pub fn subscribe(&self, mut callback: impl FnMut(&SdkEvent) + Send + 'static) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        if inner.init_seen {
            callback(&SdkEvent::Init);
        }
        if inner.connected {
            callback(&SdkEvent::Connected);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.callbacks.push((id, Box::new(callback)));
        SubscriptionId(id)
    }

    /// Safe to call from inside a callback; a callback that unsubscribes
    /// itself mid-dispatch receives no further events.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.callbacks.len();
        inner.callbacks.retain(|(cb_id, _)| *cb_id != id.0);
        if inner.callbacks.len() != before {
            return true;
        }
        // The callback may be out of the list for an in-flight dispatch;
        // record the removal for the merge-back.
        if inner.dispatching_ids.contains(&id.0) && !inner.removed.contains(&id.0) {
            inner.removed.push(id.0);
            return true;
        }
        false
    }

    /// Registers a channel subscriber. Events are cloned into the channel;
    /// the consumer drains them on a thread of its choosing.
    pub fn channel(&self) -> Receiver<SdkEvent> {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.inner.lock().unwrap();
        if inner.init_seen {
            let _ = tx.send(SdkEvent::Init);
        }
        if inner.connected {
            let _ = tx.send(SdkEvent::Connected);
        }
        inner.channels.push(tx);
        rx
    }

    /// Dispatches to every subscriber in registration order. Subscriber
    /// panics are not isolated; they propagate to the dispatching thread.
    ///
    /// The hub lock is not held while a callback runs, so handlers may
    /// subscribe or unsubscribe from inside a callback. A handler subscribed
    /// mid-dispatch first sees the next event; one unsubscribed mid-dispatch
    /// receives no further events, including the in-flight one.
    pub fn publish(&self, event: SdkEvent) {
        let (mut callbacks, taken_ids) = {
            let mut inner = self.inner.lock().unwrap();
            match &event {
                SdkEvent::Init => inner.init_seen = true,
                SdkEvent::Connected => inner.connected = true,
                SdkEvent::Disconnected => inner.connected = false,
                _ => {}
            }
            let callbacks = std::mem::take(&mut inner.callbacks);
            let taken_ids: Vec<u64> = callbacks.iter().map(|(id, _)| *id).collect();
            inner.dispatching_ids.extend(&taken_ids);
            (callbacks, taken_ids)
        };

        for (id, callback) in callbacks.iter_mut() {
            let skip = self.inner.lock().unwrap().removed.contains(id);
            if !skip {
                callback(&event);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.dispatching_ids.retain(|id| !taken_ids.contains(id));
        let removed: Vec<u64> = inner
            .removed
            .iter()
            .filter(|id| taken_ids.contains(id))
            .copied()
            .collect();
        inner.removed.retain(|id| !taken_ids.contains(id));
        callbacks.retain(|(id, _)| !removed.contains(id));
        // Handlers subscribed during dispatch landed in the fresh list; they
        // go behind the survivors.
        callbacks.append(&mut inner.callbacks);
        inner.callbacks = callbacks;
        // Disconnected receivers are dropped on the way through.
        inner.channels.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
