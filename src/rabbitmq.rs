//! RabbitMQ event consumer for ldk-server events
//!
//! This module consumes events from ldk-server's RabbitMQ exchange and
//! publishes inbound payments as invoice settlements on the
//! [`InvoiceEventHub`].

use crate::{
    config::RabbitMqConfig,
    node::{InvoiceEvent, InvoiceEventHub, InvoiceState},
};
use futures::StreamExt;
use lapin::{options::*, types::FieldTable, Connection, ConnectionProperties, Consumer};
use ldk_server_protos::events::{event_envelope::Event, EventEnvelope};
use prost::Message;
use tracing::{debug, error, info, warn};

/// RabbitMQ event consumer
pub struct RabbitMqConsumer {
    /// Configuration
    config: RabbitMqConfig,
    /// Where settlements are published
    hub: InvoiceEventHub,
    /// Consumer task, once started
    task: Option<tokio::task::JoinHandle<()>>,
}

impl RabbitMqConsumer {
    /// Create a new RabbitMQ consumer
    pub fn new(config: RabbitMqConfig, hub: InvoiceEventHub) -> Self {
        Self { config, hub, task: None }
    }

    /// Start consuming events from RabbitMQ
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.task.is_some() {
            return Ok(());
        }

        info!("Connecting to RabbitMQ at {}...", self.config.connection_string);

        let conn = Connection::connect(&self.config.connection_string, ConnectionProperties::default()).await?;

        info!("Connected to RabbitMQ");

        let channel = conn.create_channel().await?;

        channel
            .exchange_declare(
                &self.config.exchange_name,
                lapin::ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        // A fixed name keeps undelivered settlements across restarts
        let queue_name = self
            .config
            .queue_name
            .clone()
            .unwrap_or_else(|| "ldk-ledger-events".to_string());

        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!("Declared queue: {}", queue_name);

        channel
            .queue_bind(
                &queue_name,
                &self.config.exchange_name,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer = channel
            .basic_consume(
                &queue_name,
                "ldk-ledger-consumer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!("Started consuming events from RabbitMQ");

        let hub = self.hub.clone();
        self.task = Some(tokio::spawn(Self::consume(consumer, hub)));

        Ok(())
    }

    async fn consume(mut consumer: Consumer, hub: InvoiceEventHub) {
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    Self::process_event(&hub, &delivery.data);

                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        error!("Failed to ack message: {}", e);
                    }
                }
                Err(e) => {
                    error!("Error receiving message: {}", e);
                }
            }
        }
        warn!("RabbitMQ consumer stopped");
    }

    /// Decode one event and publish what the ledger needs
    fn process_event(hub: &InvoiceEventHub, data: &[u8]) {
        if data.is_empty() {
            error!("Received empty message from RabbitMQ");
            return;
        }

        let envelope = match EventEnvelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    "Failed to decode protobuf event: {}. Data length: {} bytes. Raw hex: {}",
                    e,
                    data.len(),
                    hex::encode(data)
                );
                return;
            }
        };

        match envelope.event {
            Some(Event::PaymentReceived(received)) => {
                if let Some(payment) = received.payment {
                    // payment ids of bolt11 receives are the payment hash
                    hub.publish(InvoiceEvent {
                        payment_hash: payment.id,
                        state: InvoiceState::Settled,
                        amount_paid_msat: payment.amount_msat.unwrap_or(0),
                    });
                }
            }
            Some(Event::PaymentSuccessful(successful)) => {
                if let Some(payment) = successful.payment {
                    debug!("Payment successful: hash={}", payment.id);
                }
            }
            Some(Event::PaymentFailed(failed)) => {
                if let Some(payment) = failed.payment {
                    debug!("Payment failed: hash={}", payment.id);
                }
            }
            Some(_) => debug!("Ignoring non-payment event"),
            None => debug!("Received event envelope with no event data"),
        }
    }
}
