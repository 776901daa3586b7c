// Administrative operations on streams and routes
mod common;

use common::{manual_context, temp_config};
use momentum_core::{MomentumError, Registry, StreamSpec, STREAM_HEADER_SIZE};

#[test]
fn test_list_reports_creation_parameters() {
    let (_dir, config) = temp_config();
    let registry = Registry::new(config);

    registry.create_stream(&StreamSpec::new("mx://b", 1024, 4)).unwrap();
    let mut latest = StreamSpec::new("a", 65536, 16);
    latest.broadcast = false;
    registry.create_stream(&latest).unwrap();

    let streams = registry.list_streams().unwrap();
    assert_eq!(streams.len(), 2);
    assert_eq!(streams[0].name, "a");
    assert_eq!(streams[0].buffer_size, 65536);
    assert_eq!(streams[0].buffer_count, 16);
    assert!(!streams[0].broadcast);
    assert_eq!(streams[0].total_memory, 65536 * 16 + STREAM_HEADER_SIZE);
    assert_eq!(streams[1].name, "b");
    assert_eq!(streams[1].total_memory, 1024 * 4 + STREAM_HEADER_SIZE);
}

#[test]
fn test_create_then_remove_leaves_nothing() {
    let (_dir, config) = temp_config();
    let registry = Registry::new(config.clone());

    registry.create_stream(&StreamSpec::new("gone", 64, 2)).unwrap();
    assert!(config.data_path.join("gone").exists());
    registry.remove_stream("mx://gone").unwrap();

    assert!(!config.data_path.join("gone").exists());
    assert!(registry.list_streams().unwrap().is_empty());
}

#[test]
fn test_duplicate_stream_rejected() {
    let (_dir, config) = temp_config();
    let registry = Registry::new(config);
    registry.create_stream(&StreamSpec::new("dup", 64, 2)).unwrap();

    for spec in [StreamSpec::new("dup", 64, 2), StreamSpec::new("dup", 128, 2)] {
        assert!(matches!(
            registry.create_stream(&spec),
            Err(MomentumError::AlreadyExists { .. })
        ));
    }
}

#[test]
fn test_remove_attached_stream_is_busy() {
    let (_dir, config) = temp_config();
    let registry = Registry::new(config.clone());
    registry.create_stream(&StreamSpec::new("held", 64, 2)).unwrap();

    let ctx = manual_context(&config);
    let _stream = ctx.open_stream("held").unwrap();
    assert!(matches!(
        registry.remove_stream("held"),
        Err(MomentumError::ResourceBusy(_))
    ));

    ctx.close();
    drop(_stream);
    registry.remove_stream("held").unwrap();
}

#[test]
fn test_removing_missing_resources_is_not_found() {
    let (_dir, config) = temp_config();
    let registry = Registry::new(config);
    assert!(registry.remove_stream("nothing").unwrap_err().is_not_found());
    assert!(registry.remove_route("nothing").unwrap_err().is_not_found());
}

#[test]
fn test_routes_do_not_touch_streams() {
    let (_dir, config) = temp_config();
    let registry = Registry::new(config);
    registry.create_stream(&StreamSpec::new("cam", 64, 2)).unwrap();

    registry.create_route("video", &["mx://cam"]).unwrap();
    registry.attach_stream("video", "audio").unwrap();
    assert_eq!(registry.list_routes().unwrap(), vec!["video"]);
    assert_eq!(registry.routes().resolve("video").unwrap(), vec!["cam", "audio"]);

    registry.remove_route("video").unwrap();
    assert!(registry.list_routes().unwrap().is_empty());
    assert_eq!(registry.list_streams().unwrap().len(), 1);
}

#[test]
fn test_foreign_files_are_skipped_in_listing() {
    let (_dir, config) = temp_config();
    let registry = Registry::new(config.clone());
    std::fs::write(config.data_path.join("junk"), b"not a stream").unwrap();
    registry.create_stream(&StreamSpec::new("real", 64, 1)).unwrap();

    let names: Vec<String> = registry
        .list_streams()
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["real"]);
}
