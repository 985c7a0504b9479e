//! JSON shapes exchanged with WebSocket clients.

use arbor_engine::{Command, RemoveMode, StoreSync, StructuralOp, SyncMode, WireMessage};
use serde_json::json;

#[cfg(test)]
mod client_message_tests {
    use super::*;

    #[test]
    fn test_store_ack_deserialization() {
        let json = r#"{"type": "store_ack", "storeId": "world", "snapshotId": 7}"#;

        let msg = WireMessage::decode(json.as_bytes()).unwrap();
        assert_eq!(
            msg,
            WireMessage::StoreAck {
                store_id: "world".into(),
                snapshot_id: 7,
            }
        );
    }

    #[test]
    fn test_resync_request_deserialization() {
        let json = r#"{"type": "store_resync_request", "storeId": "world", "haveSnapshotId": 0}"#;

        match WireMessage::decode(json.as_bytes()).unwrap() {
            WireMessage::StoreResyncRequest {
                store_id,
                have_snapshot_id,
            } => {
                assert_eq!(store_id, "world");
                assert_eq!(have_snapshot_id, 0);
            }
            other => panic!("Expected resync request, got {:?}", other),
        }
    }

    #[test]
    fn test_command_deserialization() {
        let payload = serde_json::to_vec(&json!({"action": "despawn", "id": 3})).unwrap();
        let json = json!({
            "type": "command",
            "storeId": "world",
            "tick": 12,
            "seq": 4,
            "sender": 99,
            "payload": payload,
        });

        match WireMessage::decode(json.to_string().as_bytes()).unwrap() {
            WireMessage::Command(command) => {
                assert_eq!(command.seq, 4);
                assert_eq!(command.tick, 12);
                let action: serde_json::Value = command.decode().unwrap();
                assert_eq!(action["action"], "despawn");
            }
            other => panic!("Expected command, got {:?}", other),
        }
    }

    #[test]
    fn test_debug_hash_request_deserialization() {
        let json = r#"{"type": "debug_hash_request", "storeId": "world"}"#;
        let msg = WireMessage::decode(json.as_bytes()).unwrap();
        assert_eq!(msg.kind(), "debug_hash_request");
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let json = r#"{"type": "push", "operations": []}"#;
        assert!(WireMessage::decode(json.as_bytes()).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(WireMessage::decode(b"not json").is_err());
    }
}

#[cfg(test)]
mod server_message_tests {
    use super::*;

    #[test]
    fn test_delta_sync_deserialization() {
        let json = r#"{
            "type": "store_sync",
            "storeId": "world",
            "snapshotId": 3,
            "mode": "delta",
            "baselineSnapshotId": 2,
            "structural": [
                {"op": "reparent", "id": 5, "parentId": 2, "index": 0},
                {"op": "remove", "id": 9, "mode": "subtree"}
            ]
        }"#;

        match WireMessage::decode(json.as_bytes()).unwrap() {
            WireMessage::StoreSync(sync) => {
                assert_eq!(sync.mode, SyncMode::Delta);
                assert_eq!(sync.snapshot_id, 3);
                assert_eq!(sync.baseline_snapshot_id, Some(2));
                assert!(sync.component_struct.is_empty());
                assert!(sync.component_values.is_empty());
                assert_eq!(
                    sync.structural,
                    vec![
                        StructuralOp::Reparent {
                            id: 5,
                            parent_id: 2,
                            index: 0,
                        },
                        StructuralOp::Remove {
                            id: 9,
                            mode: RemoveMode::Subtree,
                        },
                    ]
                );
            }
            other => panic!("Expected store sync, got {:?}", other),
        }
    }

    #[test]
    fn test_full_sync_omits_baseline() {
        let msg = WireMessage::StoreSync(StoreSync::full("world", 4, Vec::new()));

        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["mode"], "full");
        assert_eq!(value["snapshotId"], 4);
        assert!(value.get("baselineSnapshotId").is_none());
    }

    #[test]
    fn test_debug_hash_serialization() {
        let msg = WireMessage::DebugHash {
            store_id: "world".into(),
            hash: 42,
            valid: true,
            error: None,
        };

        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "debug_hash");
        assert_eq!(value["storeId"], "world");
        assert_eq!(value["hash"], 42);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_command_serialization() {
        let mut command = Command::new("world", b"{}".to_vec());
        command.seq = 1;

        let value: serde_json::Value =
            serde_json::from_slice(&WireMessage::Command(command).encode().unwrap()).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["storeId"], "world");
        assert_eq!(value["seq"], 1);
        assert_eq!(value["sender"], 0);
    }
}
