use std::fs;

use warden_nvr::config::Config;

fn write(dir: &std::path::Path, rel: &str, contents: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_a_minimal_config_directory() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "storage.conf",
        r#"
        [local-archive]
        kind = "local"
        root = "/var/lib/warden/local-archive"
        segment_length_secs = 60
        retention_days = 30
        "#,
    );
    write(
        dir.path(),
        "cameras.d/front-door.conf",
        r#"
        name = "front-door"
        url = "rtsp://10.0.0.5:554/stream"
        log_path = "/var/log/warden/front-door.log"
        sinks = ["local-archive"]
        "#,
    );

    let config = Config::load_dir(dir.path()).unwrap();
    assert_eq!(config.cameras.len(), 1);
    assert_eq!(config.cameras[0].transport, "tcp");
    assert_eq!(config.cameras[0].connect_timeout_secs, 30);
    assert!(config.storage.contains_key("local-archive"));
}

#[test]
fn rejects_a_camera_referencing_an_unknown_sink() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "storage.conf",
        r#"
        [local-archive]
        kind = "local"
        root = "/var/lib/warden/local-archive"
        segment_length_secs = 60
        retention_days = 30
        "#,
    );
    write(
        dir.path(),
        "cameras.d/front-door.conf",
        r#"
        name = "front-door"
        url = "rtsp://10.0.0.5:554/stream"
        log_path = "/var/log/warden/front-door.log"
        sinks = ["nonexistent"]
        "#,
    );

    assert!(Config::load_dir(dir.path()).is_err());
}

#[test]
fn rejects_duplicate_camera_names() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "storage.conf",
        r#"
        [local-archive]
        kind = "local"
        root = "/var/lib/warden/local-archive"
        segment_length_secs = 60
        retention_days = 30
        "#,
    );
    for file in ["a.conf", "b.conf"] {
        write(
            dir.path(),
            &format!("cameras.d/{file}"),
            r#"
            name = "front-door"
            url = "rtsp://10.0.0.5:554/stream"
            log_path = "/var/log/warden/front-door.log"
            sinks = ["local-archive"]
            "#,
        );
    }

    assert!(Config::load_dir(dir.path()).is_err());
}

#[test]
fn missing_warden_conf_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "storage.conf",
        r#"
        [local-archive]
        kind = "local"
        root = "/var/lib/warden/local-archive"
        segment_length_secs = 60
        retention_days = 30
        "#,
    );
    write(
        dir.path(),
        "cameras.d/front-door.conf",
        r#"
        name = "front-door"
        url = "rtsp://10.0.0.5:554/stream"
        log_path = "/var/log/warden/front-door.log"
        sinks = ["local-archive"]
        "#,
    );

    let config = Config::load_dir(dir.path()).unwrap();
    assert_eq!(
        config.supervisor.socket_path,
        std::path::PathBuf::from("/run/warden/warden.sock")
    );
}
