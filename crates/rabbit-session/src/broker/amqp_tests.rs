use super::*;
use serde_json::json;

#[test]
fn test_header_values_survive_conversion() {
    let mut headers = FieldTable::new();
    headers.insert("retries".to_string(), json!(3));
    headers.insert("ratio".to_string(), json!(0.5));
    headers.insert("urgent".to_string(), json!(true));
    headers.insert("source".to_string(), json!("billing"));

    let converted = field_table(&headers);
    let back: FieldTable = converted
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), json_value(value)))
        .collect();

    assert_eq!(back, headers);
}

#[test]
fn test_structured_header_values_are_sent_as_json_text() {
    assert_eq!(
        json_value(&amqp_value(&json!({"a": 1}))),
        json!(r#"{"a":1}"#)
    );
    assert_eq!(json_value(&amqp_value(&Value::Null)), Value::Null);
}

#[test]
fn test_message_properties_round_trip() {
    let properties = MessageProperties {
        content_type: Some("application/json".to_string()),
        headers: FieldTable::from([("x-trace".to_string(), json!("abc"))]),
        persistent: true,
        correlation_id: Some("42".to_string()),
        reply_to: Some("replies".to_string()),
        expiration: Some("60000".to_string()),
        message_id: Some("m-1".to_string()),
    };

    assert_eq!(message_properties(&basic_properties(&properties)), properties);
}

#[test]
fn test_default_properties_are_empty() {
    let basic = basic_properties(&MessageProperties::default());
    assert!(basic.headers().is_none());
    assert!(basic.delivery_mode().is_none());
    assert_eq!(message_properties(&basic), MessageProperties::default());
}

#[test]
fn test_failed_stream_is_reported_as_channel_closed() {
    assert_eq!(end_of_stream_notice(true, true), ConsumerMessage::ChannelClosed);
    assert_eq!(end_of_stream_notice(true, false), ConsumerMessage::ChannelClosed);
}

#[test]
fn test_clean_stream_end_is_a_cancel_only_while_connected() {
    assert_eq!(end_of_stream_notice(false, true), ConsumerMessage::Cancelled);
    assert_eq!(end_of_stream_notice(false, false), ConsumerMessage::ChannelClosed);
}
