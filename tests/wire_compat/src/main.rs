fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    use fireside_protocol::{ControlMessage, TransferStatus};
    use fireside_registry::RegistryConfig;
    use fireside_transfer::{ReceiverSnapshot, TransferSummary, UploadSnapshot};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON values so that integer-valued floats compare equal.
    ///
    /// Browsers write every number as a double; `2713600` and `2713600.0`
    /// must compare equal.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => {
                let normalized: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect();
                serde_json::Value::Object(normalized)
            }
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent, float-normalized comparison).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  Rust:    {reserialized}"
        );
        parsed
    }

    // --- Peer control messages ---

    #[test]
    fn fixture_request_metadata() {
        let msg = roundtrip_test::<ControlMessage>("control_request_metadata.json");
        assert_eq!(msg, ControlMessage::RequestMetadata);
    }

    #[test]
    fn fixture_metadata() {
        let msg = roundtrip_test::<ControlMessage>("control_metadata.json");
        let ControlMessage::Metadata { metadata } = msg else {
            panic!("expected metadata, got {msg:?}");
        };
        assert_eq!(metadata.size, 2_713_600);
        assert_eq!(metadata.mime_type, "video/webm");
    }

    #[test]
    fn fixture_request_chunks() {
        let msg = roundtrip_test::<ControlMessage>("control_request_chunks.json");
        assert_eq!(msg, ControlMessage::RequestChunks { index: 128 });
    }

    #[test]
    fn request_chunks_requires_index() {
        let msg = ControlMessage::from_json(r#"{"type":"requestChunks","index":64}"#).unwrap();
        assert_eq!(msg, ControlMessage::RequestChunks { index: 64 });
        assert!(ControlMessage::from_json(r#"{"type":"requestChunks"}"#).is_err());
    }

    // --- Persisted snapshots ---

    #[test]
    fn fixture_receiver_snapshot() {
        let snap = roundtrip_test::<ReceiverSnapshot>("receiver_snapshot.json");
        assert_eq!(snap.num_saved_chunks, 128);
        assert!(snap.metadata.is_some());
    }

    #[test]
    fn legacy_receiver_snapshot_without_metadata() {
        let snap: ReceiverSnapshot = serde_json::from_str(r#"{"numSavedChunks":0}"#).unwrap();
        assert_eq!(snap, ReceiverSnapshot::default());
    }

    #[test]
    fn fixture_upload_snapshot() {
        let snap = roundtrip_test::<UploadSnapshot>("upload_snapshot.json");
        assert_eq!(snap.num_uploaded_chunks, 5);
        assert_eq!(snap.upload_id.as_deref(), Some("X"));
    }

    #[test]
    fn fixture_upload_snapshot_before_initiate() {
        let snap = roundtrip_test::<UploadSnapshot>("upload_snapshot_new.json");
        assert_eq!(snap, UploadSnapshot::default());
    }

    #[test]
    fn fixture_room_transfers() {
        let list = roundtrip_test::<Vec<TransferSummary>>("room_transfers.json");
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].status(), TransferStatus::Completed);
        assert!(matches!(
            &list[2],
            TransferSummary::HttpSender { file_id, status: TransferStatus::Disconnected }
                if file_id == "local-7"
        ));
    }

    #[test]
    fn room_entry_without_uid() {
        let entry: TransferSummary =
            serde_json::from_str(r#"{"type":"p2pReceiver","fileId":"a","status":"disconnected"}"#)
                .unwrap();
        assert!(matches!(entry, TransferSummary::PeerReceiver { uid: None, .. }));
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            serde_json::json!({"type": "p2pReceiver", "fileId": "a", "status": "disconnected"})
        );
    }

    #[test]
    fn unknown_room_entry_type_is_rejected() {
        let result: Result<TransferSummary, _> =
            serde_json::from_str(r#"{"type":"ftpSender","fileId":"a","status":"completed"}"#);
        assert!(result.is_err());
    }

    // --- Configuration ---

    #[test]
    fn fixture_registry_config() {
        let json = load_fixture("registry_config.json");
        let config: RegistryConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.room_id, "r42");
        assert_eq!(config.peer.block_cache_size, 2);
        assert_eq!(config.bitrate_config().window, Duration::from_secs(5));
        assert_eq!(config.bitrate_config().max_samples, 10);
        assert_eq!(config.retry_config().max_delay, Duration::from_secs(30));
    }
}
