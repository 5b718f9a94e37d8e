//! Queue and exchange declaration plus subscription.
//!
//! Existence is checked with passive declares, each on a throwaway channel
//! because the broker closes a channel whose passive declare fails. Only
//! missing entities are declared, and that happens on the consumer channel.

use tracing::{debug, info};

use crate::config::{ExchangeSpec, Topology};
use crate::connector::{BrokerChannel, BrokerConnection};
use crate::utils::error::{InboundError, Result};

/// A channel with an active subscription.
pub struct Subscription<Ch> {
    pub channel: Ch,
    pub consumer_tag: String,
}

/// Declares what is missing, binds, applies QoS and starts consuming.
pub async fn subscribe<B: BrokerConnection>(
    connection: &B,
    topology: &Topology,
    name: &str,
) -> Result<Subscription<B::Channel>> {
    let queue_exists = queue_exists(connection, topology, name).await?;
    let exchange_exists = match &topology.exchange {
        Some(exchange) => exchange_exists(connection, exchange, name).await?,
        None => true,
    };

    let mut channel = connection.create_channel().await?;

    if !queue_exists {
        info!(inbound = %name, queue = %topology.queue, "Queue not found, declaring it");
        channel
            .queue_declare(&topology.queue, topology.queue_flags, false)
            .await?;
    }

    if let Some(exchange) = &topology.exchange {
        if !exchange_exists {
            info!(
                inbound = %name,
                exchange = %exchange.name,
                kind = %exchange.kind,
                "Exchange not found, declaring it"
            );
            channel.exchange_declare(exchange, false).await?;
        }
        channel
            .queue_bind(&topology.queue, &exchange.name, &topology.routing_key)
            .await?;
        debug!(
            inbound = %name,
            queue = %topology.queue,
            exchange = %exchange.name,
            routing_key = %topology.routing_key,
            "Bound queue to exchange"
        );
    }

    if let Some(prefetch) = topology.prefetch_count {
        channel.basic_qos(prefetch).await?;
    }

    let consumer_tag = channel
        .basic_consume(
            &topology.queue,
            topology.consumer_tag.as_deref(),
            topology.auto_ack,
        )
        .await
        .map_err(|e| InboundError::topology(format!("cannot consume from '{}': {e}", topology.queue)))?;

    info!(
        inbound = %name,
        queue = %topology.queue,
        consumer_tag = %consumer_tag,
        auto_ack = topology.auto_ack,
        "Subscribed to RabbitMQ queue"
    );

    Ok(Subscription {
        channel,
        consumer_tag,
    })
}

async fn queue_exists<B: BrokerConnection>(
    connection: &B,
    topology: &Topology,
    name: &str,
) -> Result<bool> {
    let probe = connection.create_channel().await?;
    let found = probe
        .queue_declare(&topology.queue, topology.queue_flags, true)
        .await;
    finish_probe(probe, found, name).await
}

async fn exchange_exists<B: BrokerConnection>(
    connection: &B,
    exchange: &ExchangeSpec,
    name: &str,
) -> Result<bool> {
    let probe = connection.create_channel().await?;
    let found = probe.exchange_declare(exchange, true).await;
    finish_probe(probe, found, name).await
}

/// A failed passive declare means "absent". The broker has already closed
/// the probe channel in that case.
async fn finish_probe<Ch: BrokerChannel>(probe: Ch, found: Result<()>, name: &str) -> Result<bool> {
    match found {
        Ok(()) => {
            if let Err(e) = probe.close().await {
                debug!(inbound = %name, error = %e, "Could not close probe channel");
            }
            Ok(true)
        }
        Err(e) => {
            debug!(inbound = %name, error = %e, "Passive declare failed");
            Ok(false)
        }
    }
}
