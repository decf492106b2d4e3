//! Binding declarations and the allow-list gate.
//!
//! A consumer or exchange owns exactly one [`BindingSet`]: the queue it sends
//! through plus an ordered list of message definitions it declares. The gate
//! answers a single question: may this envelope leave through that queue?

use serde::{Deserialize, Serialize};

use dmq_core::{DomainError, DomainResult, QueueId};

use crate::definition::MessageDefinition;
use crate::envelope::Envelope;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

/// A declared pairing of direction and message definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub direction: Direction,
    pub message: MessageDefinition,
}

impl Binding {
    pub fn inbound(message: MessageDefinition) -> Self {
        Self {
            direction: Direction::In,
            message,
        }
    }

    pub fn outbound(message: MessageDefinition) -> Self {
        Self {
            direction: Direction::Out,
            message,
        }
    }
}

/// Whether the gate takes a binding's direction into account.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionPolicy {
    /// Any declared binding for the message type authorizes sending.
    #[default]
    AnyDirection,
    /// Only `out` bindings authorize sending.
    OutboundOnly,
}

impl DirectionPolicy {
    fn admits(self, direction: Direction) -> bool {
        match self {
            DirectionPolicy::AnyDirection => true,
            DirectionPolicy::OutboundOnly => direction == Direction::Out,
        }
    }
}

/// The allow-list owned by a consumer or exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSet {
    queue_id: QueueId,
    bindings: Vec<Binding>,
    #[serde(default)]
    policy: DirectionPolicy,
}

impl BindingSet {
    pub fn new(queue_id: QueueId) -> Self {
        Self {
            queue_id,
            bindings: Vec::new(),
            policy: DirectionPolicy::default(),
        }
    }

    pub fn bind(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_direction_policy(mut self, policy: DirectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn policy(&self) -> DirectionPolicy {
        self.policy
    }

    /// True iff some binding admitted by the policy declares the envelope's
    /// message type.
    pub fn is_allowed<T>(&self, envelope: &Envelope<T>) -> bool {
        self.bindings.iter().any(|b| {
            self.policy.admits(b.direction) && b.message.event_type() == envelope.event_type()
        })
    }

    /// Like [`BindingSet::is_allowed`], but as a domain result.
    pub fn authorize<T>(&self, envelope: &Envelope<T>) -> DomainResult<()> {
        if self.is_allowed(envelope) {
            Ok(())
        } else {
            Err(DomainError::not_allowed(
                envelope.event_type(),
                self.queue_id.as_str(),
            ))
        }
    }
}

/// Free-function form of [`BindingSet::is_allowed`].
pub fn is_allowed<T>(bindings: &BindingSet, envelope: &Envelope<T>) -> bool {
    bindings.is_allowed(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    use crate::envelope::build;
    use crate::schema::MessageSchema;

    fn message_a() -> MessageDefinition {
        MessageDefinition::command("test.message.a")
    }

    fn message_b() -> MessageDefinition {
        MessageDefinition::command("test.message.b")
    }

    fn envelope_of(definition: &MessageDefinition) -> Envelope<serde_json::Value> {
        build(
            definition,
            &MessageSchema::envelope_default(),
            "tenantId",
            "",
            json!({}),
        )
        .unwrap()
    }

    fn consumer() -> BindingSet {
        BindingSet::new(QueueId::new("test-queue").unwrap()).bind(Binding::inbound(message_a()))
    }

    #[test]
    fn bound_type_is_allowed() {
        assert!(consumer().is_allowed(&envelope_of(&message_a())));
        assert!(is_allowed(&consumer(), &envelope_of(&message_a())));
    }

    #[test]
    fn unbound_type_is_rejected() {
        let set = consumer();
        let envelope = envelope_of(&message_b());
        assert!(!set.is_allowed(&envelope));

        let err = set.authorize(&envelope).unwrap_err();
        assert_eq!(
            err,
            DomainError::not_allowed("test.message.b", "test-queue")
        );
    }

    #[test]
    fn empty_set_allows_nothing() {
        let set = BindingSet::new(QueueId::new("q").unwrap());
        assert!(!set.is_allowed(&envelope_of(&message_a())));
    }

    #[test]
    fn outbound_only_policy_ignores_inbound_bindings() {
        let set = consumer().with_direction_policy(DirectionPolicy::OutboundOnly);
        assert!(!set.is_allowed(&envelope_of(&message_a())));

        let set = set.bind(Binding::outbound(message_a()));
        assert!(set.is_allowed(&envelope_of(&message_a())));
    }

    #[test]
    fn matching_compares_type_not_content_type() {
        let set = consumer();
        let other = MessageDefinition::event("test.message.a").with_data_content_type("text/plain");
        assert!(set.is_allowed(&envelope_of(&other)));
    }

    proptest! {
        #[test]
        fn allowed_iff_type_is_declared(
            declared in proptest::collection::vec("[a-z]{1,4}", 0..6),
            candidate in "[a-z]{1,4}",
        ) {
            let set = declared.iter().fold(
                BindingSet::new(QueueId::new("q").unwrap()),
                |set, t| set.bind(Binding::outbound(MessageDefinition::event(t.clone()))),
            );
            let envelope = envelope_of(&MessageDefinition::event(candidate.clone()));
            prop_assert_eq!(set.is_allowed(&envelope), declared.contains(&candidate));
        }
    }
}
