//! Reconnecting subscriptions.
//!
//! A [`Subscription`] is a long-lived stream of messages from one queue. Behind it
//! a pump task binds the queue, registers a consumer and forwards deliveries. When
//! the channel or connection goes away the pump resolves a fresh context, binds
//! again and keeps forwarding into the same stream; the consumer sees a gap, not
//! an end.
//!
//! ```text
//! Pending -> Bound -> Rebinding -> Bound -> ... -> Terminated
//! ```

use crate::broker::{Consumer, ConsumerMessage};
use crate::connection::flag_raised;
use crate::context::{Context, ContextCache};
use crate::error::{OperationError, SessionError, TopologyError};
use crate::message::{ActiveContext, Message};
use crate::options::{ConsumeOptions, TopicFilters};
use crate::topology::{self, TopologyDescriptor};
use futures::Stream;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No subscription exists yet.
    Unbound,
    /// Setting up the first consumer.
    Pending,
    /// A consumer is registered and deliveries are flowing.
    Bound,
    /// The previous channel closed; setting up a new consumer.
    Rebinding,
    /// The stream has ended and will yield nothing more.
    Terminated,
}

/// Item yielded by a subscription. An `Err` is always the last item.
pub type SubscriptionItem = Result<Message, SessionError>;

/// Handle to a subscription. Clones share the same stream.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<Shared>,
}

struct Shared {
    receiver: Mutex<mpsc::Receiver<SubscriptionItem>>,
    state: watch::Receiver<SubscriptionState>,
    cancel: watch::Sender<bool>,
}

impl Subscription {
    pub(crate) fn spawn(
        cache: Arc<ContextCache>,
        descriptor: Arc<TopologyDescriptor>,
        options: ConsumeOptions,
        filters: TopicFilters,
        capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (output, receiver) = mpsc::channel(capacity.max(1));
        let (state, state_rx) = watch::channel(SubscriptionState::Pending);
        let (cancel, cancel_rx) = watch::channel(false);

        let pump = Pump {
            binder: Binder {
                cache,
                descriptor,
                options,
                filters,
            },
            output,
            state,
            cancel: cancel_rx,
            shutdown,
            active: ActiveContext::default(),
        };
        tokio::spawn(pump.run());

        Self {
            shared: Arc::new(Shared {
                receiver: Mutex::new(receiver),
                state: state_rx,
                cancel,
            }),
        }
    }

    /// Next message, or `None` once the subscription has terminated.
    pub async fn next(&self) -> Option<SubscriptionItem> {
        self.shared.receiver.lock().await.recv().await
    }

    /// Consume the handle as a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = SubscriptionItem> + Send + 'static {
        futures::stream::unfold(self, |subscription| async move {
            let item = subscription.next().await?;
            Some((item, subscription))
        })
    }

    pub fn state(&self) -> SubscriptionState {
        *self.shared.state.borrow()
    }

    /// Wait until a consumer is registered (or the subscription has ended).
    pub async fn wait_until_bound(&self) -> SubscriptionState {
        let mut state = self.shared.state.clone();
        let result = state
            .wait_for(|state| {
                matches!(
                    state,
                    SubscriptionState::Bound | SubscriptionState::Terminated
                )
            })
            .await
            .map(|state| *state);
        result.unwrap_or(SubscriptionState::Terminated)
    }

    /// Stop consuming. Messages already buffered can still be read, and
    /// settled while their channel stays open.
    pub fn unsubscribe(&self) {
        self.shared.cancel.send_replace(true);
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SubscriptionState::Terminated
    }
}

// ============================================================================
// Pump
// ============================================================================

struct Binder {
    cache: Arc<ContextCache>,
    descriptor: Arc<TopologyDescriptor>,
    options: ConsumeOptions,
    filters: TopicFilters,
}

impl Binder {
    async fn bind(&self) -> Result<(Arc<Context>, Consumer), SessionError> {
        let context = self.cache.resolve(&self.descriptor).await?;
        let queue = context
            .queue_name()
            .ok_or_else(|| TopologyError::Invalid {
                message: "subscriptions require a queue".to_string(),
            })?
            .to_string();

        topology::bind_topics(&context, &self.filters).await?;

        let channel = context.channel();
        if let Some(prefetch) = self.options.prefetch {
            debug!(prefetch, "channel.prefetch");
            channel
                .qos(prefetch)
                .await
                .map_err(OperationError::Consume)?;
        }

        debug!(queue = %queue, no_ack = self.options.no_ack, "channel.consume");
        let consumer = channel
            .consume(&queue, &self.options)
            .await
            .map_err(OperationError::Consume)?;

        Ok((context, consumer))
    }
}

enum Flow {
    /// The channel went away; bind again.
    Rebind,
    /// The consumer was cancelled by the broker.
    Ended,
    /// Unsubscribed, shut down, or every handle was dropped.
    Stopped,
}

struct Pump {
    binder: Binder,
    output: mpsc::Sender<SubscriptionItem>,
    state: watch::Sender<SubscriptionState>,
    cancel: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    active: ActiveContext,
}

impl Pump {
    async fn run(self) {
        let Pump {
            binder,
            output,
            state,
            mut cancel,
            mut shutdown,
            active,
        } = self;

        let mut rebinding = false;
        loop {
            state.send_replace(if rebinding {
                SubscriptionState::Rebinding
            } else {
                SubscriptionState::Pending
            });

            let outcome = tokio::select! {
                _ = flag_raised(&mut cancel) => break,
                _ = flag_raised(&mut shutdown) => break,
                _ = output.closed() => break,
                outcome = binder.bind() => outcome,
            };

            let (context, mut consumer) = match outcome {
                Ok(bound) => bound,
                Err(err) if err.is_transient() => {
                    debug!(error = %err, "subscription setup interrupted, rebinding");
                    rebinding = true;
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(err) => {
                    error!(error = %err, "subscription setup failed");
                    let _ = output.send(Err(err)).await;
                    break;
                }
            };

            active.set(Arc::clone(&context));
            state.send_replace(SubscriptionState::Bound);
            info!(
                queue = ?context.queue_name(),
                consumer_tag = %consumer.tag(),
                "subscription bound"
            );

            let flow = loop {
                let event = tokio::select! {
                    _ = flag_raised(&mut cancel) => break Flow::Stopped,
                    _ = flag_raised(&mut shutdown) => break Flow::Stopped,
                    _ = output.closed() => break Flow::Stopped,
                    event = consumer.recv() => event,
                };

                match event {
                    Some(ConsumerMessage::Delivery(delivery)) => {
                        let message = Message::new(
                            delivery,
                            Arc::clone(&context),
                            active.clone(),
                            binder.options.no_ack,
                        );
                        tokio::select! {
                            _ = flag_raised(&mut cancel) => break Flow::Stopped,
                            _ = flag_raised(&mut shutdown) => break Flow::Stopped,
                            sent = output.send(Ok(message)) => {
                                if sent.is_err() {
                                    break Flow::Stopped;
                                }
                            }
                        }
                    }
                    Some(ConsumerMessage::Cancelled) => break Flow::Ended,
                    Some(ConsumerMessage::ChannelClosed)
                    | Some(ConsumerMessage::ConnectionClosed)
                    | None => break Flow::Rebind,
                }
            };

            match flow {
                Flow::Rebind => {
                    // Deliveries from this channel can no longer be settled.
                    active.clear();
                    warn!(queue = ?context.queue_name(), "subscription channel closed, rebinding");
                    if !context.is_open() {
                        binder.cache.invalidate(&context);
                    }
                    rebinding = true;
                }
                Flow::Ended => {
                    info!(queue = ?context.queue_name(), "consumer cancelled by broker");
                    break;
                }
                Flow::Stopped => {
                    if context.is_open() {
                        debug!(consumer_tag = %consumer.tag(), "channel.cancel");
                        if let Err(err) = context.channel().cancel(consumer.tag()).await {
                            debug!(error = %err, "cancelling consumer failed");
                        }
                    }
                    break;
                }
            }
        }

        state.send_replace(SubscriptionState::Terminated);
        debug!("subscription terminated");
    }
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
