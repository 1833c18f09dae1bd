// src/webhook.rs
//
// Payment webhook verification and decoding.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::WebhookSignatureError;

pub const SIGNATURE_HEADER: &str = "stripe-signature";
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// HMAC-SHA256 in hex.
pub fn sign_hmac_sha256_hex(secret: &str, data: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Header value for `payload` signed at `timestamp`.
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut signed = format!("{timestamp}.").into_bytes();
    signed.extend_from_slice(payload);
    format!("t={},v1={}", timestamp, sign_hmac_sha256_hex(secret, &signed))
}

/// Checks a `t=<unix>,v1=<hex>[,v1=<hex>…]` header against the raw body.
pub fn verify_signature(
    payload: &[u8],
    header: Option<&str>,
    secret: &str,
    now: i64,
    tolerance_secs: i64,
) -> Result<(), WebhookSignatureError> {
    let header = header.ok_or(WebhookSignatureError::MissingHeader)?;

    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookSignatureError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(WebhookSignatureError::MalformedHeader);
    }
    let age = now
        .checked_sub(timestamp)
        .map(i64::unsigned_abs)
        .ok_or(WebhookSignatureError::Expired)?;
    if age > tolerance_secs.unsigned_abs() {
        return Err(WebhookSignatureError::Expired);
    }

    let mut signed = format!("{timestamp}.").into_bytes();
    signed.extend_from_slice(payload);

    let matches = signatures.iter().any(|candidate| {
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(&signed);
        mac.verify_slice(candidate).is_ok()
    });

    if matches {
        Ok(())
    } else {
        Err(WebhookSignatureError::Mismatch)
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

/// A verified payment notification, keyed by what it means for us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    ProjectPaid {
        event_id: String,
        session_id: String,
        project_id: Uuid,
        payment_intent_id: Option<String>,
    },
    CreditPackPaid {
        event_id: String,
        session_id: String,
        customer_id: Option<String>,
        credits: i32,
        pack_id: Option<String>,
    },
    PaymentFailed {
        event_id: String,
        customer_id: Option<String>,
    },
    SubscriptionCancelled {
        event_id: String,
        customer_id: Option<String>,
    },
    Ignored {
        event_id: String,
        kind: String,
    },
}

impl PaymentEvent {
    pub fn event_id(&self) -> &str {
        match self {
            PaymentEvent::ProjectPaid { event_id, .. }
            | PaymentEvent::CreditPackPaid { event_id, .. }
            | PaymentEvent::PaymentFailed { event_id, .. }
            | PaymentEvent::SubscriptionCancelled { event_id, .. }
            | PaymentEvent::Ignored { event_id, .. } => event_id,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            PaymentEvent::ProjectPaid { .. } => "project_paid",
            PaymentEvent::CreditPackPaid { .. } => "credit_pack_paid",
            PaymentEvent::PaymentFailed { .. } => "payment_failed",
            PaymentEvent::SubscriptionCancelled { .. } => "subscription_cancelled",
            PaymentEvent::Ignored { .. } => "ignored",
        }
    }
}

fn str_field(object: &Value, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

fn metadata_field(object: &Value, key: &str) -> Option<String> {
    object
        .get("metadata")
        .and_then(|m| m.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Decodes a verified event body.
pub fn parse_event(payload: &[u8]) -> Result<PaymentEvent, WebhookSignatureError> {
    let raw: RawEvent = serde_json::from_slice(payload)
        .map_err(|e| WebhookSignatureError::InvalidPayload(e.to_string()))?;
    let object = &raw.data.object;
    let event_id = raw.id;

    let event = match raw.kind.as_str() {
        "checkout.session.completed" => {
            let session_id = str_field(object, "id").unwrap_or_default();
            let credits = metadata_field(object, "credits_pack_size")
                .and_then(|v| v.parse::<i32>().ok())
                .filter(|c| *c > 0);
            let project_id = metadata_field(object, "project_id")
                .and_then(|v| Uuid::parse_str(&v).ok());

            match (credits, project_id) {
                (Some(credits), _) => PaymentEvent::CreditPackPaid {
                    event_id,
                    session_id,
                    customer_id: str_field(object, "customer"),
                    credits,
                    pack_id: metadata_field(object, "pack_id"),
                },
                (None, Some(project_id)) => PaymentEvent::ProjectPaid {
                    event_id,
                    session_id,
                    project_id,
                    payment_intent_id: str_field(object, "payment_intent"),
                },
                (None, None) => PaymentEvent::Ignored {
                    event_id,
                    kind: raw.kind,
                },
            }
        }
        "payment_intent.payment_failed" => PaymentEvent::PaymentFailed {
            event_id,
            customer_id: str_field(object, "customer"),
        },
        "customer.subscription.deleted" => PaymentEvent::SubscriptionCancelled {
            event_id,
            customer_id: str_field(object, "customer"),
        },
        _ => PaymentEvent::Ignored {
            event_id,
            kind: raw.kind,
        },
    };

    Ok(event)
}
