use std::path::Path;

use chrono::Utc;
use tempfile::TempDir;

use segcast_core::{RenditionKind, StreamRecord, StreamStore};

fn temp_store(dir: &Path) -> StreamStore {
    let store = StreamStore::builder()
        .path(dir.join("segcast.sqlite"))
        .create_if_missing(true)
        .build()
        .expect("create store");
    store.initialize().expect("initialize store");
    store
}

fn record(stream_id: &str, title: &str) -> StreamRecord {
    StreamRecord {
        stream_id: stream_id.into(),
        title: Some(title.into()),
        uploader: Some("channel-a".into()),
        description: None,
        start_time: Utc::now(),
        file_path: "/recordings/channel-a/2026-08-25/12-00-00".into(),
    }
}

#[test]
fn upsert_creates_then_refreshes() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());

    store.upsert_stream(&record("s1", "first title")).unwrap();
    store.upsert_stream(&record("s1", "corrected title")).unwrap();

    assert_eq!(store.stream_count().unwrap(), 1);
    let loaded = store.get_stream("s1").unwrap().expect("stream exists");
    assert_eq!(loaded.title.as_deref(), Some("corrected title"));
    assert!(store.get_stream("missing").unwrap().is_none());
}

#[test]
fn rendition_mapping_is_order_independent() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    store.upsert_stream(&record("s1", "t")).unwrap();

    // Out-of-order arrival, as with concurrent processors.
    store.set_rendition("s1", 3, RenditionKind::Watermarked, "/r/video_002.mp4").unwrap();
    store.set_rendition("s1", 1, RenditionKind::Watermarked, "/r/video_000.mp4").unwrap();
    store.set_rendition("s1", 2, RenditionKind::Watermarked, "/r/video_001.mp4").unwrap();
    // Re-setting the same ordinal converges rather than duplicating.
    store.set_rendition("s1", 2, RenditionKind::Watermarked, "/r/video_001.mp4").unwrap();

    let map = store.renditions("s1", RenditionKind::Watermarked).unwrap();
    assert_eq!(map.len(), 3);
    assert_eq!(
        map.keys().copied().collect::<Vec<_>>(),
        vec![1, 2, 3],
        "ordinals come back sorted"
    );
    assert_eq!(map[&1], "/r/video_000.mp4");
}

#[test]
fn rendition_kinds_are_kept_separate() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    store.upsert_stream(&record("s1", "t")).unwrap();

    store.set_rendition("s1", 1, RenditionKind::Watermarked, "/r/video_000.mp4").unwrap();
    store.set_rendition("s1", 1, RenditionKind::Original, "/r/video_000_orig.mp4").unwrap();

    let watermarked = store.renditions("s1", RenditionKind::Watermarked).unwrap();
    let original = store.renditions("s1", RenditionKind::Original).unwrap();
    assert_eq!(watermarked[&1], "/r/video_000.mp4");
    assert_eq!(original[&1], "/r/video_000_orig.mp4");
}
