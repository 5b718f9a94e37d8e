use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{InboundEndpoint, Topology};
use crate::connector::{
    AmqpConnector, BrokerChannel, BrokerConnection, BrokerConnector, Connector, Pull, RawDelivery,
};
use crate::consumer::envelope::DeliveryEnvelope;
use crate::consumer::handler::InjectHandler;
use crate::consumer::state::{StateCell, WorkerState};
use crate::consumer::topology::{self, Subscription};
use crate::utils::error::{InboundError, Result};

/// Pause after the handler fails, so a poisonous message cannot spin the loop.
pub const DEFAULT_MEDIATION_BACKOFF: Duration = Duration::from_millis(2_000);

type ChannelOf<C> = <<C as Connector>::Connection as BrokerConnection>::Channel;

/// Connection and subscription owned by one run.
struct Link<C: Connector> {
    connection: Option<C::Connection>,
    subscription: Option<Subscription<ChannelOf<C>>>,
}

impl<C: Connector> Link<C> {
    fn connection_open(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_open())
    }

    async fn drop_subscription(&mut self, name: &str) {
        if let Some(subscription) = self.subscription.take() {
            debug!(inbound = %name, consumer_tag = %subscription.consumer_tag, "Dropping subscription");
            if subscription.channel.is_open() {
                if let Err(e) = subscription.channel.close().await {
                    debug!(inbound = %name, error = %e, "Could not close consumer channel");
                }
            }
        }
    }

    async fn close(&mut self, name: &str) {
        self.drop_subscription(name).await;
        if let Some(connection) = self.connection.take() {
            match connection.close().await {
                Ok(()) => info!(inbound = %name, "Closed connection to RabbitMQ broker"),
                Err(e) => error!(inbound = %name, error = %e, "Error while closing connection"),
            }
        }
    }
}

enum Step {
    Continue,
    Reconnect(String),
}

/// Consumes one inbound endpoint: connects, subscribes and runs the
/// transactional receive, inject, commit or rollback loop until shutdown or
/// until a broker outage outlasts the retry budget.
pub struct ConsumerEngine<C: Connector> {
    name: String,
    connector: BrokerConnector<C>,
    topology: Topology,
    handler: Arc<dyn InjectHandler>,
    state: StateCell,
    shutdown: watch::Sender<()>,
    idle: AtomicBool,
    mediation_backoff: Duration,
}

impl ConsumerEngine<AmqpConnector> {
    /// Engine for a configured endpoint on top of lapin.
    pub fn from_endpoint(endpoint: &InboundEndpoint, handler: Arc<dyn InjectHandler>) -> Result<Self> {
        let connector = AmqpConnector::new(&endpoint.connection)?;
        Ok(Self::new(
            BrokerConnector::new(&endpoint.name, connector, endpoint.connection.retry),
            endpoint.topology.clone(),
            handler,
        ))
    }
}

impl<C: Connector> ConsumerEngine<C> {
    pub fn new(connector: BrokerConnector<C>, topology: Topology, handler: Arc<dyn InjectHandler>) -> Self {
        let (shutdown, _) = watch::channel(());
        Self {
            name: connector.name().to_string(),
            connector,
            topology,
            handler,
            state: StateCell::default(),
            shutdown,
            idle: AtomicBool::new(true),
            mediation_backoff: DEFAULT_MEDIATION_BACKOFF,
        }
    }

    pub fn with_mediation_backoff(mut self, backoff: Duration) -> Self {
        self.mediation_backoff = backoff;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state.load()
    }

    /// True while no delivery is being processed.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Asks a running engine to stop. Safe to call from anywhere, any number
    /// of times. The in-flight delivery, if any, is finished first.
    pub fn request_shutdown(&self) {
        if self.state.request_shutdown() {
            info!(inbound = %self.name, "Shutdown requested for RabbitMQ inbound consumer");
        }
        self.shutdown.send_replace(());
    }

    /// Runs the engine to completion.
    ///
    /// Returns `Ok` after a requested shutdown. Returns an error when the
    /// first connection or the topology setup fails (the engine ends STOPPED)
    /// or when a later outage exhausts the retry budget (the engine ends
    /// FAULTY).
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if let Err(current) = self.state.start() {
            return match current {
                WorkerState::ShuttingDown => {
                    self.state.finish();
                    info!(inbound = %self.name, "Shutdown requested before start, not consuming");
                    Ok(())
                }
                WorkerState::Faulty => Err(InboundError::Faulty {
                    name: self.name.clone(),
                    attempts: 0,
                }),
                WorkerState::Started | WorkerState::Stopped => {
                    Err(InboundError::AlreadyRunning(self.name.clone()))
                }
            };
        }
        info!(inbound = %self.name, queue = %self.topology.queue, "Starting RabbitMQ inbound consumer");

        let mut link = Link::<C> {
            connection: None,
            subscription: None,
        };
        let outcome = self.consume(&mut link, &mut shutdown).await;
        link.close(&self.name).await;
        self.idle.store(true, Ordering::Release);

        let state = self.state.finish();
        match &outcome {
            Ok(()) => info!(inbound = %self.name, %state, "RabbitMQ inbound consumer stopped"),
            Err(e) => error!(inbound = %self.name, %state, error = %e, "RabbitMQ inbound consumer terminated"),
        }
        outcome
    }

    async fn consume(&self, link: &mut Link<C>, shutdown: &mut watch::Receiver<()>) -> Result<()> {
        let connection = tokio::select! {
            biased;
            _ = stop_signal(&self.state, shutdown) => {
                info!(inbound = %self.name, "Shutdown requested while connecting");
                return Ok(());
            }
            connection = self.connector.connect() => connection?,
        };
        link.connection = Some(connection);
        if !self.subscribe(link, shutdown).await? {
            info!(inbound = %self.name, "Shutdown requested while subscribing");
            return Ok(());
        }

        while self.state.is_started() {
            match self.consume_one(link, shutdown).await {
                Step::Continue => {}
                Step::Reconnect(reason) => {
                    if !self.state.is_started() {
                        break;
                    }
                    warn!(inbound = %self.name, reason = %reason, "Lost subscription to RabbitMQ broker, reconnecting");
                    self.reconnect(link, shutdown).await?;
                }
            }
        }
        Ok(())
    }

    /// Subscribes on the current connection. `Ok(false)` means the engine
    /// stopped first.
    async fn subscribe(&self, link: &mut Link<C>, shutdown: &mut watch::Receiver<()>) -> Result<bool> {
        let Some(connection) = link.connection.as_ref() else {
            return Err(InboundError::disconnected("no connection to subscribe on"));
        };
        let subscription = tokio::select! {
            biased;
            _ = stop_signal(&self.state, shutdown) => return Ok(false),
            subscription = topology::subscribe(connection, &self.topology, &self.name) => subscription?,
        };
        link.subscription = Some(subscription);
        Ok(true)
    }

    /// One iteration of the delivery loop.
    async fn consume_one(&self, link: &mut Link<C>, shutdown: &mut watch::Receiver<()>) -> Step {
        let Some(subscription) = link.subscription.as_mut() else {
            return Step::Reconnect("no active subscription".into());
        };
        let channel = &mut subscription.channel;

        if let Err(e) = channel.tx_select().await {
            return Step::Reconnect(e.to_string());
        }

        let pull = tokio::select! {
            biased;
            _ = stop_signal(&self.state, shutdown) => None,
            pull = channel.next_delivery() => Some(pull),
        };

        match pull {
            None => {
                self.idle.store(true, Ordering::Release);
                Step::Continue
            }
            Some(Pull::Delivery(raw)) => {
                self.idle.store(false, Ordering::Release);
                self.process(channel, raw, shutdown).await;
                self.idle.store(true, Ordering::Release);
                Step::Continue
            }
            Some(Pull::Cancelled) => {
                self.idle.store(true, Ordering::Release);
                Step::Reconnect("consumer cancelled by broker".into())
            }
            Some(Pull::Disconnected(reason)) => {
                self.idle.store(true, Ordering::Release);
                Step::Reconnect(reason)
            }
        }
    }

    async fn process(
        &self,
        channel: &ChannelOf<C>,
        raw: RawDelivery,
        shutdown: &mut watch::Receiver<()>,
    ) {
        let envelope = DeliveryEnvelope::from_delivery(raw, self.topology.content_type.as_deref());
        let tag = envelope.delivery_tag;
        debug!(
            inbound = %self.name,
            delivery_tag = tag,
            redelivered = envelope.redelivered,
            message_id = ?envelope.message_id,
            "Received message from RabbitMQ queue"
        );

        match self.handler.invoke(&envelope, &self.name).await {
            Ok(true) => self.commit(channel, tag).await,
            Ok(false) => {
                warn!(inbound = %self.name, delivery_tag = tag, "Message was not processed, rolling back for redelivery");
                self.rollback(channel, tag).await;
            }
            Err(e) => {
                error!(
                    inbound = %self.name,
                    delivery_tag = tag,
                    error = %e,
                    "Error while mediating message, rolling back and pausing {} ms",
                    self.mediation_backoff.as_millis()
                );
                self.rollback(channel, tag).await;
                self.pause(self.mediation_backoff, shutdown).await;
            }
        }
    }

    async fn commit(&self, channel: &ChannelOf<C>, tag: u64) {
        if !self.topology.auto_ack {
            if let Err(e) = channel.basic_ack(tag).await {
                error!(
                    inbound = %self.name,
                    delivery_tag = tag,
                    error = %e,
                    "Could not acknowledge message, rolling back for redelivery"
                );
                self.rollback(channel, tag).await;
                return;
            }
        }
        match channel.tx_commit().await {
            Ok(()) => debug!(inbound = %self.name, delivery_tag = tag, "Committed message"),
            Err(e) => error!(inbound = %self.name, delivery_tag = tag, error = %e, "Could not commit transaction"),
        }
    }

    async fn rollback(&self, channel: &ChannelOf<C>, tag: u64) {
        if self.topology.auto_ack {
            warn!(
                inbound = %self.name,
                delivery_tag = tag,
                "Message was auto-acknowledged and cannot be redelivered"
            );
        }
        if let Err(e) = channel.tx_rollback().await {
            error!(inbound = %self.name, delivery_tag = tag, error = %e, "Could not roll back transaction");
            return;
        }
        if let Err(e) = channel.basic_recover().await {
            error!(inbound = %self.name, delivery_tag = tag, error = %e, "Could not request redelivery");
        }
    }

    /// Sleeps for `delay` unless the engine stops first. Returns whether the
    /// full delay elapsed.
    async fn pause(&self, delay: Duration, shutdown: &mut watch::Receiver<()>) -> bool {
        tokio::select! {
            biased;
            _ = stop_signal(&self.state, shutdown) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Restores connection and subscription after an outage.
    ///
    /// While the connection is down, waits the retry interval before each
    /// attempt, at most as many times as the retry policy allows. An open
    /// connection is re-subscribed right away.
    async fn reconnect(&self, link: &mut Link<C>, shutdown: &mut watch::Receiver<()>) -> Result<()> {
        link.drop_subscription(&self.name).await;
        let mut backoff = self.connector.policy().backoff();

        while self.state.is_started() {
            if link.connection_open() {
                match self.subscribe(link, shutdown).await {
                    Ok(false) => break,
                    Ok(true) => {
                        info!(
                            inbound = %self.name,
                            attempts = backoff.attempts(),
                            "Resumed consuming from RabbitMQ broker"
                        );
                        return Ok(());
                    }
                    Err(e) if link.connection_open() => return Err(e),
                    Err(e) => {
                        warn!(inbound = %self.name, error = %e, "Connection lost while subscribing");
                        link.drop_subscription(&self.name).await;
                        continue;
                    }
                }
            }

            let Some(delay) = backoff.next_delay() else {
                let attempts = backoff.attempts();
                error!(
                    inbound = %self.name,
                    attempts,
                    "Could not reconnect to RabbitMQ broker, giving up"
                );
                if self.state.mark_faulty() {
                    return Err(InboundError::Faulty {
                        name: self.name.clone(),
                        attempts,
                    });
                }
                return Ok(());
            };

            info!(
                inbound = %self.name,
                attempt = backoff.attempts(),
                "Attempting to reconnect to RabbitMQ broker in {} ms",
                delay.as_millis()
            );
            if !self.pause(delay, shutdown).await {
                break;
            }
            let opened = tokio::select! {
                biased;
                _ = stop_signal(&self.state, shutdown) => None,
                opened = self.connector.open_once() => Some(opened),
            };
            let Some(opened) = opened else {
                info!(inbound = %self.name, "Shutdown requested while reconnecting");
                break;
            };
            match opened {
                Ok(connection) => {
                    info!(inbound = %self.name, "Reconnected to RabbitMQ broker");
                    if let Some(stale) = link.connection.replace(connection) {
                        let _ = stale.close().await;
                    }
                }
                Err(e) => error!(
                    inbound = %self.name,
                    attempt = backoff.attempts(),
                    error = %e,
                    "Error while trying to reconnect to RabbitMQ broker"
                ),
            }
        }
        Ok(())
    }
}

/// Resolves once the engine has left STARTED.
async fn stop_signal(state: &StateCell, shutdown: &mut watch::Receiver<()>) {
    while state.is_started() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
