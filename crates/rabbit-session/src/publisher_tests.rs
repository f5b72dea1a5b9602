use super::*;
use serde_json::json;
use std::collections::HashMap;

#[test]
fn test_text_and_bytes_are_sent_verbatim() {
    assert_eq!(
        Payload::from("Hello World!").into_bytes().unwrap(),
        Bytes::from_static(b"Hello World!")
    );
    assert_eq!(
        Payload::from(vec![0u8, 159, 146, 150]).into_bytes().unwrap(),
        Bytes::from_static(&[0, 159, 146, 150])
    );
}

#[test]
fn test_json_values_are_encoded() {
    let payload = Payload::from(json!({"id": 7, "tags": ["a"]}));
    let bytes = payload.into_bytes().unwrap();
    let decoded: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(decoded, json!({"id": 7, "tags": ["a"]}));

    assert_eq!(
        Payload::from(json!(42)).into_bytes().unwrap(),
        Bytes::from_static(b"42")
    );
}

#[test]
fn test_unserializable_values_are_rejected() {
    let mut map = HashMap::new();
    map.insert((1, 2), "tuple keys are not valid JSON object keys");

    let result = Payload::json(&map);
    assert!(matches!(result, Err(SerializationError::Json(_))));
}

#[test]
fn test_payload_from_serializable_struct() {
    #[derive(Serialize)]
    struct Trip {
        id: u32,
        action: &'static str,
    }

    let payload = Payload::json(&Trip {
        id: 1,
        action: "create",
    })
    .unwrap();
    assert_eq!(payload, Payload::Json(json!({"id": 1, "action": "create"})));
}
