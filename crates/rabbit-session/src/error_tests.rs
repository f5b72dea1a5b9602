//! Tests for error types.

use super::*;

#[test]
fn test_closed_channel_failures_are_transient() {
    let err = SessionError::from(OperationError::Publish(BrokerError::ChannelClosed));
    assert!(err.is_transient());

    let err = SessionError::from(TopologyError::Bind {
        queue: "q".to_string(),
        exchange: "logs".to_string(),
        pattern: "".to_string(),
        source: BrokerError::ConnectionClosed,
    });
    assert!(err.is_transient());
}

#[test]
fn test_rejections_are_not_transient() {
    let err = SessionError::from(TopologyError::ExchangeDeclare {
        name: "logs".to_string(),
        source: BrokerError::Rejected {
            code: 406,
            text: "PRECONDITION_FAILED".to_string(),
        },
    });
    assert!(!err.is_transient());

    assert!(!SessionError::Closed.is_transient());
    assert!(!SessionError::from(OperationError::StaleDelivery { delivery_tag: 3 }).is_transient());
    assert!(!SessionError::from(SerializationError::InvalidUtf8).is_transient());
}

#[test]
fn test_error_messages_name_the_resource() {
    let err = TopologyError::QueueDeclare {
        name: "tasks".to_string(),
        source: BrokerError::Rejected {
            code: 405,
            text: "RESOURCE_LOCKED".to_string(),
        },
    };

    let message = err.to_string();
    assert!(message.contains("tasks"));
    assert!(message.contains("RESOURCE_LOCKED"));
}

#[test]
fn test_settle_errors_are_never_retried() {
    let err = OperationError::Settle {
        delivery_tag: 9,
        source: BrokerError::ChannelClosed,
    };
    assert!(!err.is_transient());
    assert!(err.to_string().contains('9'));
}
