use sbtv::store::Store;

async fn store() -> Store {
    Store::connect("sqlite::memory:").await.unwrap()
}

async fn put_setting(store: &Store, key: &str, value: &str) {
    sqlx::query("INSERT INTO settings(key, value) VALUES(?, ?)")
        .bind(key)
        .bind(value)
        .execute(store.pool())
        .await
        .unwrap();
}

async fn put_device(store: &Store, screen_id: &str, name: &str, offset: i64, overrides: &str) {
    sqlx::query("INSERT INTO devices(screen_id, name, offset, overrides) VALUES(?, ?, ?, ?)")
        .bind(screen_id)
        .bind(name)
        .bind(offset)
        .bind(overrides)
        .execute(store.pool())
        .await
        .unwrap();
}

#[tokio::test]
async fn empty_store_yields_defaults() {
    let store = store().await;
    let config = store.load_config().await.unwrap();

    assert_eq!(config.api_key, "");
    assert!(config.skip_count_tracking);
    assert!(!config.mute_ads);
    assert!(!config.skip_ads);
    assert_eq!(config.minimum_skip_length, 1);
    assert!(config.auto_play);
    assert_eq!(config.join_name, "sbtv");
    assert!(!config.use_proxy);
    // never run with an empty category set
    assert_eq!(config.skip_categories, vec!["sponsor".to_string()]);
    assert!(config.channel_whitelist.is_empty());
}

#[tokio::test]
async fn settings_rows_are_json_encoded() {
    let store = store().await;
    put_setting(&store, "api_key", "\"abc123\"").await;
    put_setting(&store, "mute_ads", "true").await;
    put_setting(&store, "minimum_skip_length", "5").await;
    put_setting(&store, "join_name", "\"Living room remote\"").await;
    put_setting(&store, "use_proxy", "true").await;

    let config = store.load_config().await.unwrap();
    assert_eq!(config.api_key, "abc123");
    assert!(config.mute_ads);
    assert_eq!(config.minimum_skip_length, 5);
    assert_eq!(config.join_name, "Living room remote");
    assert!(config.use_proxy);
}

#[tokio::test]
async fn malformed_and_unknown_settings_are_ignored() {
    let store = store().await;
    put_setting(&store, "mute_ads", "{not json").await;
    put_setting(&store, "frobnicate", "true").await;
    put_setting(&store, "auto_play", "\"not a bool\"").await;

    let config = store.load_config().await.unwrap();
    assert!(!config.mute_ads);
    assert!(config.auto_play);
}

#[tokio::test]
async fn configured_categories_replace_the_default() {
    let store = store().await;
    for category in ["sponsor", "intro", "outro"] {
        sqlx::query("INSERT INTO skip_categories(category) VALUES(?)")
            .bind(category)
            .execute(store.pool())
            .await
            .unwrap();
    }

    let config = store.load_config().await.unwrap();
    assert_eq!(config.skip_categories.len(), 3);
    assert!(config.skip_categories.contains(&"outro".to_string()));
}

#[tokio::test]
async fn channel_whitelist_rows_load() {
    let store = store().await;
    sqlx::query("INSERT INTO channel_whitelist(id, name) VALUES('UC1', 'beta'), ('UC2', 'Alpha')")
        .execute(store.pool())
        .await
        .unwrap();

    let config = store.load_config().await.unwrap();
    assert_eq!(config.channel_whitelist.len(), 2);
    // name ordering is case-insensitive
    assert_eq!(config.channel_whitelist[0].id, "UC2");
}

#[tokio::test]
async fn device_snapshots_load_and_sanitize() {
    let store = store().await;
    put_device(&store, "d1", "Kitchen", 300, r#"{"automation":{"mute_ads":true}}"#).await;
    put_device(&store, "d2", "", 0, "{bad json").await;
    put_device(&store, "   ", "ignored", 0, "{}").await;
    put_device(&store, "d3", "Clamped", -50, "{}").await;

    let snapshots = store.load_device_snapshots().await.unwrap();
    assert_eq!(snapshots.len(), 3);

    let d1 = &snapshots["d1"];
    assert_eq!(d1.name, "Kitchen");
    assert_eq!(d1.offset_ms, 300);
    assert!((d1.offset_seconds() - 0.3).abs() < 1e-9);
    assert_eq!(
        d1.overrides.automation.as_ref().unwrap().mute_ads,
        Some(true)
    );

    // blank name falls back to the screen id; bad overrides drop to default
    let d2 = &snapshots["d2"];
    assert_eq!(d2.name, "d2");
    assert_eq!(d2.overrides, Default::default());

    assert_eq!(snapshots["d3"].offset_ms, 0);
}

#[tokio::test]
async fn reopening_a_store_is_idempotent() {
    let dir = std::env::temp_dir().join(format!("sbtv-store-{}", std::process::id()));
    let first = Store::open(&dir).await.unwrap();
    put_device(&first, "d1", "Kitchen", 0, "{}").await;
    drop(first);

    let second = Store::open(&dir).await.unwrap();
    let snapshots = second.load_device_snapshots().await.unwrap();
    assert_eq!(snapshots.len(), 1);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}
