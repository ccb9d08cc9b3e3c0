use serde::{Deserialize, Serialize};
use uuid::Uuid;

use payalloc_core::{CompanyId, UserId};

use crate::event::Event;

/// Envelope for an audit event, carrying tenant and attribution metadata.
///
/// - `company_id` scopes the event to one tenant; subscribers must not mix them.
/// - `subject_id`/`subject_type` name the record the event is about (a payment
///   or an allocation).
/// - `sequence_number` is the event's position within the unit of work that
///   produced it, starting at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    company_id: CompanyId,

    subject_id: Uuid,
    subject_type: String,

    actor: Option<UserId>,

    sequence_number: u64,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        company_id: CompanyId,
        subject_id: impl Into<Uuid>,
        subject_type: impl Into<String>,
        actor: Option<UserId>,
        sequence_number: u64,
        payload: E,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            company_id,
            subject_id: subject_id.into(),
            subject_type: subject_type.into(),
            actor,
            sequence_number,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn company_id(&self) -> CompanyId {
        self.company_id
    }

    pub fn subject_id(&self) -> Uuid {
        self.subject_id
    }

    pub fn subject_type(&self) -> &str {
        &self.subject_type
    }

    pub fn actor(&self) -> Option<UserId> {
        self.actor
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl<E: Event> EventEnvelope<E> {
    /// Shorthand for `self.payload().event_type()`.
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use payalloc_core::PaymentId;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Touched {
        at: DateTime<Utc>,
    }

    impl Event for Touched {
        fn event_type(&self) -> &'static str {
            "test.touched"
        }

        fn version(&self) -> u32 {
            1
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[test]
    fn envelope_serializes_with_tenant_metadata() {
        let company = CompanyId::new();
        let payment = PaymentId::new();
        let env = EventEnvelope::new(
            company,
            payment,
            "payment",
            None,
            1,
            Touched { at: Utc::now() },
        );

        assert_eq!(env.event_type(), "test.touched");
        assert_eq!(env.subject_id(), *payment.as_uuid());

        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["company_id"], serde_json::json!(company.to_string()));
        assert_eq!(json["subject_type"], "payment");

        let back: EventEnvelope<Touched> = serde_json::from_value(json).unwrap();
        assert_eq!(back, env);
    }
}
