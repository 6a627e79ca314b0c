use emberd::Config;

fn write_temp(name: &str, contents: &str) -> String {
    let path = std::env::temp_dir().join(format!("emberd-test-{}-{name}", std::process::id()));
    std::fs::write(&path, contents).expect("write temp config");
    path.to_string_lossy().into_owned()
}

#[test]
fn defaults_apply_to_an_empty_file() {
    let path = write_temp("empty.toml", "");
    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.port, emberd::DEFAULT_PORT);
    assert_eq!(config.binds, vec!["0.0.0.0".to_string()]);
    assert_eq!(config.repl_port, None);
    assert_eq!(config.backlog, 1024);
    assert_eq!(config.maxclients, 10000);
    assert_eq!(config.timeout, 0);
    assert!(config.workers >= 1);
    assert_eq!(config.aof_file, None);
    std::fs::remove_file(path).ok();
}

#[test]
fn explicit_values_override_defaults() {
    let path = write_temp(
        "full.toml",
        r#"
port = 6400
repl_port = 6401
binds = ["127.0.0.1"]
repl_binds = ["127.0.0.1"]
backlog = 128
maxclients = 64
timeout = 30
workers = 2
aof_file = "test.aof"
"#,
    );
    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.port, 6400);
    assert_eq!(config.repl_port, Some(6401));
    assert_eq!(config.maxclients, 64);
    assert_eq!(config.timeout, 30);
    assert_eq!(config.workers, 2);
    assert_eq!(config.aof_file.as_deref(), Some("test.aof"));
    std::fs::remove_file(path).ok();
}

#[test]
fn repl_binds_fall_back_to_binds() {
    let config = Config::default();
    assert_eq!(config.effective_repl_binds(), &config.binds[..]);

    let path = write_temp("replbinds.toml", "repl_binds = [\"127.0.0.2\"]\n");
    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.effective_repl_binds(), vec!["127.0.0.2".to_string()]);
    std::fs::remove_file(path).ok();
}

#[test]
fn invalid_configs_are_rejected() {
    for (name, contents) in [
        ("workers.toml", "workers = 0\n"),
        ("maxclients.toml", "maxclients = 0\n"),
        ("binds.toml", "binds = []\n"),
        ("badbind.toml", "binds = [\"not-an-ip\"]\n"),
        ("unknown.toml", "no_such_option = true\n"),
    ] {
        let path = write_temp(name, contents);
        assert!(Config::from_file(&path).is_err(), "{name} should fail");
        std::fs::remove_file(path).ok();
    }
}

#[test]
fn missing_file_is_an_error() {
    assert!(Config::from_file("/nonexistent/emberd.toml").is_err());
}
