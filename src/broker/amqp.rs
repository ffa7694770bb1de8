//! RabbitMQ broker over AMQP 0.9.1.
//!
//! # Responsibilities
//! - Own the connection and the publishing channel for the process lifetime
//! - Map envelopes onto AMQP properties (`correlation_id`, `reply_to`)
//! - Give each consumer its own channel so `basic_qos` applies per consumer
//!
//! # Design Decisions
//! - Publisher confirms are enabled; `publish` returns only once the broker
//!   has taken responsibility for the message
//! - Replies use the direct reply-to pseudo-queue unless disabled, in which
//!   case a server-named exclusive queue is declared
//! - The reply consumer lives on the publishing channel, as direct reply-to
//!   requires
//! - There is no reconnect; a connection error is surfaced through
//!   `connection_lost` and the process is expected to restart

use async_trait::async_trait;
use futures_util::{future, StreamExt};
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::watch;

use crate::broker::{
    Acknowledge, Broker, BrokerError, BrokerResult, Delivery, DeliveryStream, ReplyChannel,
    Settlement, DIRECT_REPLY_TO,
};
use crate::config::BrokerConfig;
use crate::rpc::envelope::Envelope;
use crate::rpc::token::CorrelationToken;

const CONTENT_TYPE: &str = "application/json";

/// Broker handle backed by a lapin connection.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    direct_reply: bool,
    consumer_tag: String,
    lost: watch::Receiver<bool>,
}

impl AmqpBroker {
    /// Connect and open the publishing channel.
    pub async fn connect(config: &BrokerConfig) -> BrokerResult<Self> {
        let uri = config
            .connection_uri()
            .ok_or_else(|| BrokerError::Connect("no broker address configured".to_string()))?;

        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;

        let (lost_tx, lost) = watch::channel(false);
        connection.on_error(move |err| {
            tracing::error!(error = %err, "Broker connection error");
            lost_tx.send_replace(true);
        });

        tracing::info!(broker = %config.redacted_uri(), "Connected to broker");

        Ok(Self {
            connection,
            channel,
            direct_reply: config.direct_reply,
            consumer_tag: String::new(),
            lost,
        })
    }

    /// Consumer tag announced to the broker. Empty lets the broker pick one.
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub async fn close(&self) -> BrokerResult<()> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))
    }
}

/// Connection-level failures become `Closed`; everything else goes through `otherwise`.
fn classify(err: lapin::Error, otherwise: impl FnOnce(String) -> BrokerError) -> BrokerError {
    match err {
        lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::IOError(_) => BrokerError::Closed,
        other => otherwise(other.to_string()),
    }
}

fn properties_for(envelope: &Envelope) -> BasicProperties {
    let mut properties =
        BasicProperties::default().with_content_type(ShortString::from(CONTENT_TYPE.to_string()));
    if let Some(token) = &envelope.correlation_token {
        properties = properties.with_correlation_id(ShortString::from(token.as_str().to_string()));
    }
    if let Some(target) = &envelope.reply_target {
        properties = properties.with_reply_to(ShortString::from(target.clone()));
    }
    properties
}

fn envelope_from(properties: &BasicProperties, data: Vec<u8>) -> Envelope {
    Envelope {
        correlation_token: properties
            .correlation_id()
            .as_ref()
            .map(|id| CorrelationToken::from(id.as_str())),
        reply_target: properties
            .reply_to()
            .as_ref()
            .map(|target| target.as_str().to_string()),
        payload: data,
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(self: Box<Self>) -> BrokerResult<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|err| classify(err, BrokerError::Settle))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> BrokerResult<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.0
            .nack(options)
            .await
            .map_err(|err| classify(err, BrokerError::Settle))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()> {
        self.channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|err| {
                classify(err, |reason| BrokerError::Declare {
                    queue: queue.to_owned(),
                    reason,
                })
            })?;
        Ok(())
    }

    async fn publish(&self, routing_key: &str, envelope: Envelope) -> BrokerResult<()> {
        let publish_error = |reason| BrokerError::Publish {
            routing_key: routing_key.to_owned(),
            reason,
        };

        let confirm = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &envelope.payload,
                properties_for(&envelope),
            )
            .await
            .map_err(|err| classify(err, publish_error))?;

        let confirmation = confirm.await.map_err(|err| classify(err, publish_error))?;
        if confirmation.is_nack() {
            return Err(publish_error("broker rejected the message".to_string()));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> BrokerResult<DeliveryStream> {
        let consume_error = |reason| BrokerError::Consume {
            queue: queue.to_owned(),
            reason,
        };

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|err| classify(err, consume_error))?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| classify(err, consume_error))?;
        let consumer = channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| classify(err, consume_error))?;

        let queue = queue.to_owned();
        let deliveries = consumer.map(move |result| {
            // The stream owns the consumer channel.
            let _channel = &channel;
            match result {
                Ok(delivery) => Ok(Delivery {
                    envelope: envelope_from(&delivery.properties, delivery.data),
                    redelivered: delivery.redelivered,
                    settlement: Settlement::new(AmqpAcker(delivery.acker)),
                }),
                Err(err) => Err(classify(err, |reason| BrokerError::Consume {
                    queue: queue.clone(),
                    reason,
                })),
            }
        });

        Ok(deliveries.boxed())
    }

    async fn open_reply_channel(&self) -> BrokerResult<ReplyChannel> {
        let target = if self.direct_reply {
            DIRECT_REPLY_TO.to_string()
        } else {
            let options = QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            };
            let queue = self
                .channel
                .queue_declare("", options, FieldTable::default())
                .await
                .map_err(|err| {
                    classify(err, |reason| BrokerError::Declare {
                        queue: "<server-named>".to_string(),
                        reason,
                    })
                })?;
            queue.name().as_str().to_string()
        };

        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .channel
            .basic_consume(&target, "", options, FieldTable::default())
            .await
            .map_err(|err| {
                classify(err, |reason| BrokerError::Consume {
                    queue: target.clone(),
                    reason,
                })
            })?;

        let replies = consumer
            .take_while(|result| future::ready(result.is_ok()))
            .filter_map(|result| {
                future::ready(
                    result
                        .ok()
                        .map(|delivery| envelope_from(&delivery.properties, delivery.data)),
                )
            });

        Ok(ReplyChannel {
            target,
            replies: replies.boxed(),
        })
    }

    async fn connection_lost(&self) -> BrokerError {
        let mut lost = self.lost.clone();
        let _ = lost.wait_for(|lost| *lost).await;
        BrokerError::Closed
    }

    fn name(&self) -> &'static str {
        "amqp"
    }
}
