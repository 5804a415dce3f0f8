//! Event codec.
//!
//! Converts typed domain events to flat string field maps (wire records) and
//! back. The codec owns a type registry mapping the `eventType` discriminator
//! to a payload decoder; entries are added by static registration at startup
//! or on first serialization of a type.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Wire field holding the type discriminator.
pub const EVENT_TYPE_FIELD: &str = "eventType";
/// Wire field holding the event id.
pub const EVENT_ID_FIELD: &str = "eventId";
/// Wire field holding the owning aggregate id.
pub const AGGREGATE_ID_FIELD: &str = "aggregateId";
/// Wire field holding the per-aggregate version.
pub const VERSION_FIELD: &str = "version";
/// Wire field holding the RFC 3339 timestamp.
pub const TIMESTAMP_FIELD: &str = "timestamp";
/// Wire field holding the JSON payload.
pub const EVENT_DATA_FIELD: &str = "eventData";

/// Field name and value of the sentinel record.
pub const SENTINEL_FIELD: &str = "init";

/// Event type given to payloads decoded by a lenient codec without a registration.
pub const RAW_EVENT_TYPE: &str = "RawEvent";

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors that can occur while encoding or decoding wire records.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for field {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A payload type that can be stored in the log.
///
/// `EVENT_TYPE` is the discriminator written to the `eventType` field and used
/// to route records back to this type on decode.
pub trait DomainEvent: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
}

/// Untyped payload produced by a lenient codec for unregistered event types.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RawEvent(pub serde_json::Value);

impl DomainEvent for RawEvent {
    const EVENT_TYPE: &'static str = RAW_EVENT_TYPE;
}

/// Decodes a JSON payload into its concrete type.
pub type PayloadDecoder = fn(&str) -> serde_json::Result<Arc<dyn Payload>>;

fn decode_payload<T: DomainEvent>(data: &str) -> serde_json::Result<Arc<dyn Payload>> {
    let payload: T = serde_json::from_str(data)?;
    Ok(Arc::new(payload))
}

/// Type-erased payload carried by an [`Event`].
pub trait Payload: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn to_json(&self) -> serde_json::Result<String>;
    fn decoder(&self) -> PayloadDecoder;
}

impl<T: DomainEvent> Payload for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    fn decoder(&self) -> PayloadDecoder {
        decode_payload::<T>
    }
}

/// An immutable event: envelope metadata plus a typed payload.
#[derive(Clone)]
pub struct Event {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub version: i64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    payload: Arc<dyn Payload>,
}

impl Event {
    /// Create an event with a fresh id and the current time.
    pub fn new<T: DomainEvent>(aggregate_id: Uuid, version: i64, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id,
            version,
            event_type: T::EVENT_TYPE.to_string(),
            timestamp: Utc::now(),
            payload: Arc::new(payload),
        }
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Borrow the payload as `T`, if that is its concrete type.
    pub fn payload<T: DomainEvent>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }

    /// Payload serialized as JSON.
    pub fn payload_json(&self) -> serde_json::Result<String> {
        self.payload.to_json()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("event_id", &self.event_id)
            .field("aggregate_id", &self.aggregate_id)
            .field("version", &self.version)
            .field("event_type", &self.event_type)
            .field("timestamp", &self.timestamp)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Flat string field map as stored in a stream entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct WireRecord(BTreeMap<String, String>);

impl WireRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// The placeholder entry used to make group creation possible.
    pub fn sentinel() -> Self {
        let mut record = Self::new();
        record.insert(SENTINEL_FIELD, SENTINEL_FIELD);
        record
    }

    /// True for the `init -> init` placeholder and nothing else.
    pub fn is_sentinel(&self) -> bool {
        self.0.len() == 1 && self.get(SENTINEL_FIELD) == Some(SENTINEL_FIELD)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn require(&self, field: &'static str) -> Result<&str> {
        self.get(field).ok_or(CodecError::MissingField(field))
    }

    fn parse_uuid(&self, field: &'static str) -> Result<Uuid> {
        let value = self.require(field)?;
        Uuid::parse_str(value).map_err(|_| CodecError::InvalidField {
            field,
            value: value.to_string(),
        })
    }

    pub fn event_type(&self) -> Result<&str> {
        self.require(EVENT_TYPE_FIELD)
    }

    pub fn event_id(&self) -> Result<Uuid> {
        self.parse_uuid(EVENT_ID_FIELD)
    }

    pub fn aggregate_id(&self) -> Result<Uuid> {
        self.parse_uuid(AGGREGATE_ID_FIELD)
    }

    pub fn version(&self) -> Result<i64> {
        let value = self.require(VERSION_FIELD)?;
        value.parse().map_err(|_| CodecError::InvalidField {
            field: VERSION_FIELD,
            value: value.to_string(),
        })
    }

    pub fn timestamp(&self) -> Result<DateTime<Utc>> {
        let value = self.require(TIMESTAMP_FIELD)?;
        DateTime::parse_from_rfc3339(value)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| CodecError::InvalidField {
                field: TIMESTAMP_FIELD,
                value: value.to_string(),
            })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for WireRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Encoder/decoder between [`Event`] and [`WireRecord`].
#[derive(Default)]
pub struct EventCodec {
    registry: RwLock<HashMap<String, PayloadDecoder>>,
    lenient: bool,
}

impl EventCodec {
    /// Strict codec: unregistered event types fail to decode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec that decodes unregistered event types into [`RawEvent`] payloads.
    pub fn lenient() -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            lenient: true,
        }
    }

    /// Register `T` under its discriminator.
    pub fn register<T: DomainEvent>(&self) {
        self.insert_decoder(T::EVENT_TYPE, decode_payload::<T>);
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.registry.read().contains_key(event_type)
    }

    fn insert_decoder(&self, event_type: &str, decoder: PayloadDecoder) {
        let mut registry = self.registry.write();
        if !registry.contains_key(event_type) {
            registry.insert(event_type.to_string(), decoder);
            debug!(event_type = %event_type, "Registered event type");
        }
    }

    /// Encode an event; registers its payload type on first use.
    pub fn serialize(&self, event: &Event) -> Result<WireRecord> {
        if !self.is_registered(&event.event_type) {
            self.insert_decoder(&event.event_type, event.payload.decoder());
        }

        let mut record = WireRecord::new();
        record.insert(EVENT_TYPE_FIELD, event.event_type.as_str());
        record.insert(EVENT_ID_FIELD, event.event_id.to_string());
        record.insert(AGGREGATE_ID_FIELD, event.aggregate_id.to_string());
        record.insert(VERSION_FIELD, event.version.to_string());
        record.insert(
            TIMESTAMP_FIELD,
            event.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        record.insert(EVENT_DATA_FIELD, event.payload.to_json()?);
        Ok(record)
    }

    /// Decode a wire record into an event.
    pub fn deserialize(&self, record: &WireRecord) -> Result<Event> {
        let event_type = record.event_type()?;
        let decoder = match self.registry.read().get(event_type).copied() {
            Some(decoder) => decoder,
            None if self.lenient => decode_payload::<RawEvent>,
            None => return Err(CodecError::UnknownEventType(event_type.to_string())),
        };

        let data = record.require(EVENT_DATA_FIELD)?;
        Ok(Event {
            event_id: record.event_id()?,
            aggregate_id: record.aggregate_id()?,
            version: record.version()?,
            event_type: event_type.to_string(),
            timestamp: record.timestamp()?,
            payload: decoder(data)?,
        })
    }
}
