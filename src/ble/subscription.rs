//! Notification fan-out per characteristic
//!
//! One hardware notify toggle serves any number of subscribers. The first
//! subscriber enables notifications, later ones share the result, and the last
//! one to leave disables them again. A disconnect closes every channel with an
//! error so nobody is left waiting.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use uuid::Uuid;

use super::adapter::{BleError, PeerId};

/// Hardware side of a subscription: the notify toggle of one connection
#[async_trait]
pub trait NotifyLink: Send + Sync {
    /// Enable notifications and wait for the host to confirm
    async fn enable_notifications(&self, characteristic: Uuid) -> Result<(), BleError>;

    /// Disable notifications, best effort. Returns whether the request reached
    /// the host, in which case a confirmation will follow.
    fn disable_notifications(&self, characteristic: Uuid) -> bool;
}

/// Outer stream returned by subscribe: yields one [`Notifications`] stream once
/// enabled, or the error that prevented it
pub type SubscriptionStream = BoxStream<'static, Result<Notifications, BleError>>;

#[derive(Debug, Clone)]
enum Notification {
    Value(Vec<u8>),
    Closed(BleError),
}

type Readiness = Option<Result<(), BleError>>;

struct Channel {
    /// Distinguishes this channel from an earlier one for the same characteristic
    generation: u64,
    subscribers: usize,
    enabled: bool,
    notifications: broadcast::Sender<Notification>,
    ready: watch::Sender<Readiness>,
}

#[derive(Default)]
struct MuxState {
    channels: HashMap<Uuid, Channel>,
    /// Characteristics whose disable request awaits the host's confirmation
    disabling: HashSet<Uuid>,
    next_generation: u64,
}

/// Per-device map of characteristic subscriptions
pub struct SubscriptionMultiplexer {
    peer: PeerId,
    buffer: usize,
    state: Mutex<MuxState>,
}

impl SubscriptionMultiplexer {
    pub fn new(peer: PeerId, buffer: usize) -> Self {
        Self {
            peer,
            buffer: buffer.max(1),
            state: Mutex::new(MuxState::default()),
        }
    }

    /// Subscribe to a characteristic.
    ///
    /// Only the first subscriber of a channel asks `link` to enable
    /// notifications. The returned stream yields a single inner stream once the
    /// host confirms, or an error if enabling fails or the device disconnects
    /// first. After an error, subscribing again starts over.
    pub fn subscribe(
        self: &Arc<Self>,
        link: Arc<dyn NotifyLink>,
        characteristic: Uuid,
    ) -> SubscriptionStream {
        let (generation, receiver, mut ready, first) = {
            let mut state = self.state.lock();
            let generation = state.next_generation;
            let buffer = self.buffer;
            let mut first = false;
            let channel = state.channels.entry(characteristic).or_insert_with(|| {
                first = true;
                let (notifications, _) = broadcast::channel(buffer);
                let (ready, _) = watch::channel(None);
                Channel {
                    generation,
                    subscribers: 0,
                    enabled: false,
                    notifications,
                    ready,
                }
            });
            channel.subscribers += 1;
            let subscribed = (
                channel.generation,
                channel.notifications.subscribe(),
                channel.ready.subscribe(),
                first,
            );
            if first {
                state.next_generation += 1;
            }
            subscribed
        };

        let guard = SubscriberGuard {
            mux: self.clone(),
            link: link.clone(),
            characteristic,
            generation,
        };

        if first {
            tracing::debug!("🔔 Enabling notifications for {} on {}", characteristic, self.peer);
            let mux = self.clone();
            tokio::spawn(async move {
                let result = link.enable_notifications(characteristic).await;
                mux.finish_enable(link.as_ref(), characteristic, generation, result);
            });
        }

        stream::once(async move {
            let readiness = match ready.wait_for(Option::is_some).await {
                Ok(readiness) => readiness.clone(),
                Err(_) => None,
            };
            match readiness {
                Some(Ok(())) => Ok(Notifications {
                    inner: BroadcastStream::new(receiver),
                    _guard: guard,
                    finished: false,
                }),
                Some(Err(e)) => Err(e),
                None => Err(BleError::Disconnected),
            }
        })
        .boxed()
    }

    /// Route a value update to the characteristic's subscribers.
    /// Returns `false` when nobody is subscribed.
    pub fn deliver(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
        let state = self.state.lock();
        match state.channels.get(&characteristic) {
            Some(channel) => {
                let _ = channel.notifications.send(Notification::Value(value));
                true
            }
            None => false,
        }
    }

    /// Host confirmed (or refused) a disable request. Returns `false` if none
    /// was outstanding for `characteristic`.
    pub fn finish_disable(&self, characteristic: Uuid, error: Option<String>) -> bool {
        if !self.state.lock().disabling.remove(&characteristic) {
            return false;
        }
        match error {
            Some(cause) => tracing::warn!(
                "⚠️ Failed to disable notifications for {} on {}: {}",
                characteristic,
                self.peer,
                cause
            ),
            None => tracing::debug!("🔕 Notifications off for {} on {}", characteristic, self.peer),
        }
        true
    }

    /// Close every channel with `error`, regardless of subscriber count
    pub fn close_all(&self, error: BleError) {
        let channels = {
            let mut state = self.state.lock();
            state.disabling.clear();
            std::mem::take(&mut state.channels)
        };
        if channels.is_empty() {
            return;
        }
        tracing::debug!(
            "🔕 Closing {} subscription(s) on {}: {}",
            channels.len(),
            self.peer,
            error
        );
        for (_, channel) in channels {
            channel.ready.send_if_modified(|readiness| {
                if readiness.is_none() {
                    *readiness = Some(Err(error.clone()));
                    true
                } else {
                    false
                }
            });
            let _ = channel
                .notifications
                .send(Notification::Closed(error.clone()));
        }
    }

    pub fn subscriber_count(&self, characteristic: Uuid) -> usize {
        self.state
            .lock()
            .channels
            .get(&characteristic)
            .map_or(0, |channel| channel.subscribers)
    }

    pub fn is_enabled(&self, characteristic: Uuid) -> bool {
        self.state
            .lock()
            .channels
            .get(&characteristic)
            .is_some_and(|channel| channel.enabled)
    }

    pub fn is_disabling(&self, characteristic: Uuid) -> bool {
        self.state.lock().disabling.contains(&characteristic)
    }

    pub fn active_characteristics(&self) -> Vec<Uuid> {
        self.state.lock().channels.keys().copied().collect()
    }

    fn finish_enable(
        &self,
        link: &dyn NotifyLink,
        characteristic: Uuid,
        generation: u64,
        result: Result<(), BleError>,
    ) {
        let mut state = self.state.lock();
        let current = state
            .channels
            .get(&characteristic)
            .is_some_and(|channel| channel.generation == generation);

        if !current {
            drop(state);
            // Every subscriber left (or the link closed) while enabling
            if result.is_ok() {
                tracing::debug!("🔕 Subscribers gone, disabling {}", characteristic);
                self.disable(link, characteristic);
            }
            return;
        }

        match &result {
            Ok(()) => {
                if let Some(channel) = state.channels.get_mut(&characteristic) {
                    channel.enabled = true;
                    channel.ready.send_replace(Some(Ok(())));
                }
            }
            Err(e) => {
                tracing::warn!(
                    "⚠️ Failed to enable notifications for {} on {}: {}",
                    characteristic,
                    self.peer,
                    e
                );
                if let Some(channel) = state.channels.remove(&characteristic) {
                    channel.ready.send_replace(Some(result.clone()));
                }
            }
        }
    }

    fn release(&self, link: &dyn NotifyLink, characteristic: Uuid, generation: u64) {
        let disable = {
            let mut state = self.state.lock();
            let Some(channel) = state.channels.get_mut(&characteristic) else {
                return;
            };
            if channel.generation != generation {
                return;
            }
            channel.subscribers = channel.subscribers.saturating_sub(1);
            if channel.subscribers > 0 {
                return;
            }
            state
                .channels
                .remove(&characteristic)
                .is_some_and(|channel| channel.enabled)
        };
        if disable {
            tracing::debug!("🔕 Last subscriber left, disabling {}", characteristic);
            self.disable(link, characteristic);
        }
    }

    /// Track the request before issuing it so an immediate confirmation finds it
    fn disable(&self, link: &dyn NotifyLink, characteristic: Uuid) {
        self.state.lock().disabling.insert(characteristic);
        if !link.disable_notifications(characteristic) {
            self.state.lock().disabling.remove(&characteristic);
        }
    }
}

/// Keeps one subscriber registered while alive
struct SubscriberGuard {
    mux: Arc<SubscriptionMultiplexer>,
    link: Arc<dyn NotifyLink>,
    characteristic: Uuid,
    generation: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.mux
            .release(self.link.as_ref(), self.characteristic, self.generation);
    }
}

/// Stream of notified values for one subscriber.
///
/// Ends with an error if the subscription is force-closed.
pub struct Notifications {
    inner: BroadcastStream<Notification>,
    _guard: SubscriberGuard,
    finished: bool,
}

impl Stream for Notifications {
    type Item = Result<Vec<u8>, BleError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Notification::Value(value))) => return Poll::Ready(Some(Ok(value))),
                Some(Ok(Notification::Closed(error))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!("🔔 Subscriber lagged, {} notification(s) dropped", skipped);
                }
                None => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}
