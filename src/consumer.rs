//! Event Consumer (C8). Subscribes to the upstream event stream,
//! classifies each message into an `Event`, dispatches it to the
//! Coordinator inside a panic-isolated boundary, and survives per-event
//! failure without losing the stream cursor.

use crate::coordinator::Coordinator;
use crate::event::{EntityRef, Event, EventKind, MarketData, OptionType};
use crate::sla::SlaMonitor;
use crate::store::{StoreAdapter, StreamMessage};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct EventConsumer {
    store: Arc<dyn StoreAdapter>,
    coordinator: Arc<Coordinator>,
    sla: Arc<SlaMonitor>,
    stream: String,
    group: String,
    consumer_id: String,
    batch_size: usize,
}

impl EventConsumer {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        coordinator: Arc<Coordinator>,
        sla: Arc<SlaMonitor>,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            coordinator,
            sla,
            stream: stream.into(),
            group: group.into(),
            consumer_id: consumer_id.into(),
            batch_size: 10,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.store.stream_group_create(&self.stream, &self.group).await {
            error!(stream = %self.stream, error = %err, "failed to create consumer group");
        }

        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(60);

        loop {
            if *shutdown.borrow() {
                info!("event consumer received shutdown signal, exiting");
                break;
            }

            let messages = tokio::select! {
                result = self.store.stream_read_group(
                    &self.stream,
                    &self.group,
                    &self.consumer_id,
                    self.batch_size,
                    Duration::from_millis(1000),
                ) => result,
                _ = shutdown.changed() => {
                    info!("shutdown observed while awaiting stream read, finishing in-flight batch then exiting");
                    break;
                }
            };

            match messages {
                Ok(messages) => {
                    backoff = Duration::from_secs(1);
                    for message in messages {
                        self.handle_message(message).await;
                    }
                }
                Err(err) => {
                    warn!(error = %err, backoff_ms = backoff.as_millis(), "stream read failed, backing off");
                    let jitter_ms: u64 = rand::thread_rng().gen_range(0..250);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn handle_message(&self, message: StreamMessage) {
        let event = match parse_event(&message) {
            Ok(event) => event,
            Err(err) => {
                // Permanent failure: malformed event. Ack so the stream
                // advances; record via SLA as an invalidation failure is
                // not applicable here, so we just log loudly.
                error!(id = %message.id, error = %err, "malformed event, acknowledging and dropping");
                if let Err(ack_err) = self.store.stream_ack(&self.stream, &self.group, &message.id).await {
                    warn!(id = %message.id, error = %ack_err, "failed to ack malformed event");
                }
                return;
            }
        };

        // Dispatch runs in its own task so a panic inside a participant
        // (or a calculator it calls) is caught at the `JoinHandle` instead
        // of taking down the consumer loop.
        let coordinator = self.coordinator.clone();
        let dispatch_event = event.clone();
        let joined = tokio::spawn(async move { coordinator.dispatch(&dispatch_event).await }).await;

        let result = match joined {
            Ok(result) => result,
            Err(join_err) => {
                error!(id = %message.id, error = %join_err, "dispatch panicked, not acknowledging for redelivery");
                return;
            }
        };

        if result.coordination_success() {
            debug!(id = %message.id, participants = result.participants_succeeded, "event dispatched");
            if let Err(err) = self.store.stream_ack(&self.stream, &self.group, &message.id).await {
                warn!(id = %message.id, error = %err, "failed to ack dispatched event");
            }
        } else {
            warn!(id = %message.id, "all participants failed, not acknowledging for redelivery");
        }

        let duration_s = result.duration_ms as f64 / 1000.0;
        self.sla.record_invalidation_completion("coordinator", duration_s).await;
    }
}

#[derive(Debug, thiserror::Error)]
enum EventParseError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unknown event_type: {0}")]
    UnknownEventType(String),
}

fn parse_event(message: &StreamMessage) -> Result<Event, EventParseError> {
    let event_type = message
        .fields
        .get("event_type")
        .ok_or(EventParseError::MissingField("event_type"))?;
    let kind = match event_type.as_str() {
        "instrument.updated" => EventKind::InstrumentUpdate,
        "chain.rebalance" => EventKind::ChainRebalance,
        "subscription.profile.changed" => EventKind::SubscriptionChange,
        "expiry.rollover" => EventKind::ExpiryRollover,
        "market.close" => EventKind::MarketClose,
        "corporate.action" => EventKind::CorporateAction,
        other => return Err(EventParseError::UnknownEventType(other.to_string())),
    };

    let data_raw = message
        .fields
        .get("data")
        .ok_or(EventParseError::MissingField("data"))?;
    let data: serde_json::Value = serde_json::from_str(data_raw)?;

    let entity_ref = match kind {
        EventKind::SubscriptionChange => EntityRef::User(
            data.get("user_id")
                .and_then(|v| v.as_str())
                .ok_or(EventParseError::MissingField("user_id"))?
                .to_string(),
        ),
        EventKind::ChainRebalance | EventKind::ExpiryRollover | EventKind::CorporateAction => {
            EntityRef::Underlying(
                data.get("underlying")
                    .and_then(|v| v.as_str())
                    .ok_or(EventParseError::MissingField("underlying"))?
                    .to_string(),
            )
        }
        EventKind::InstrumentUpdate | EventKind::MarketClose => EntityRef::Instrument(
            data.get("id")
                .or_else(|| data.get("instrument_id"))
                .and_then(|v| v.as_str())
                .ok_or(EventParseError::MissingField("id"))?
                .to_string(),
        ),
    };

    let market_data = data.get("market_data").map(|md| MarketData {
        spot: md.get("spot").and_then(|v| v.as_f64()),
        previous_spot: md.get("previous_spot").and_then(|v| v.as_f64()),
        volume: md.get("volume").and_then(|v| v.as_f64()),
        previous_volume: md.get("previous_volume").and_then(|v| v.as_f64()),
        implied_vol: md.get("iv").or_else(|| md.get("implied_vol")).and_then(|v| v.as_f64()),
        previous_implied_vol: md.get("previous_implied_vol").and_then(|v| v.as_f64()),
        time_to_expiry_days: md.get("time_to_expiry").or_else(|| md.get("time_to_expiry_days")).and_then(|v| v.as_f64()),
        option_type: md.get("option_type").and_then(|v| v.as_str()).and_then(|s| match s {
            "call" => Some(OptionType::Call),
            "put" => Some(OptionType::Put),
            _ => None,
        }),
    });

    let affected_expiries = data
        .get("affected_expiries")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();

    let mut metadata = BTreeMap::new();
    if let Some(obj) = data.get("metadata").and_then(|v| v.as_object()) {
        for (k, v) in obj {
            if let Some(s) = v.as_str() {
                metadata.insert(k.clone(), s.to_string());
            }
        }
    }

    Ok(Event {
        kind,
        entity_ref,
        market_data,
        metadata,
        affected_expiries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn message(event_type: &str, data: serde_json::Value) -> StreamMessage {
        let mut fields = HashMap::new();
        fields.insert("event_type".to_string(), event_type.to_string());
        fields.insert("data".to_string(), data.to_string());
        StreamMessage { id: "1".to_string(), fields }
    }

    #[test]
    fn parses_instrument_update() {
        let msg = message(
            "instrument.updated",
            serde_json::json!({"id": "NSE:RELIANCE", "market_data": {"spot": 2445.0, "iv": 0.18}}),
        );
        let event = parse_event(&msg).unwrap();
        assert_eq!(event.kind, EventKind::InstrumentUpdate);
        assert_eq!(event.entity_ref.as_str(), "NSE:RELIANCE");
        assert_eq!(event.market_data.unwrap().spot, Some(2445.0));
    }

    #[test]
    fn parses_subscription_change() {
        let msg = message("subscription.profile.changed", serde_json::json!({"user_id": "u-123"}));
        let event = parse_event(&msg).unwrap();
        assert_eq!(event.kind, EventKind::SubscriptionChange);
        assert_eq!(event.entity_ref.as_str(), "u-123");
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let msg = message("widget.frobnicated", serde_json::json!({}));
        assert!(parse_event(&msg).is_err());
    }

    #[test]
    fn missing_data_field_is_rejected() {
        let mut fields = HashMap::new();
        fields.insert("event_type".to_string(), "instrument.updated".to_string());
        let msg = StreamMessage { id: "1".to_string(), fields };
        assert!(parse_event(&msg).is_err());
    }
}
