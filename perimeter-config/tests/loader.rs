use std::fs;

use perimeter_config::{
    ConfigGuardRailError, ConfigLoadError, ConfigLoader, ConfigSource,
};
use tempfile::TempDir;

fn loader(root: &TempDir) -> ConfigLoader {
    ConfigLoader::new()
        .without_env_file()
        .with_search_root(root.path())
        .with_env_vars(Vec::<(String, String)>::new())
}

#[test]
fn defaults_when_nothing_is_configured() {
    let root = TempDir::new().unwrap();
    let load = loader(&root).load().unwrap();
    assert_eq!(load.config.metadata.source, ConfigSource::Default);
    assert_eq!(load.config.redis.prefix, "perimeter");
    assert_eq!(load.config.pipeline.batcher.batch_size, 100);
    assert!(load.warnings.is_empty());
}

#[test]
fn default_toml_candidate_is_picked_up() {
    let root = TempDir::new().unwrap();
    fs::create_dir_all(root.path().join("config")).unwrap();
    fs::write(
        root.path().join("config/perimeter.toml"),
        r#"
[redis]
prefix = "staging"

[pipeline.batcher]
batch_size = 50

[pipeline.dispatcher]
pop_batch_size = 20
"#,
    )
    .unwrap();

    let load = loader(&root).load().unwrap();
    let config = load.config;
    assert!(matches!(config.metadata.source, ConfigSource::File(_)));
    assert_eq!(config.redis.prefix, "staging");
    assert_eq!(config.pipeline.batcher.batch_size, 50);
    // Untouched fields keep their defaults.
    assert_eq!(config.pipeline.batcher.flush_interval_ms, 1_000);
    assert_eq!(config.pipeline.dispatcher.pop_batch_size, 20);
}

#[test]
fn explicit_path_wins_over_candidates() {
    let root = TempDir::new().unwrap();
    fs::write(
        root.path().join("perimeter.toml"),
        "[pipeline.batcher]\nbatch_size = 10\n",
    )
    .unwrap();
    let explicit = root.path().join("custom.json");
    fs::write(&explicit, r#"{"pipeline":{"batcher":{"batch_size":7}}}"#)
        .unwrap();

    let load = loader(&root)
        .with_env_vars([(
            "PERIMETER_CONFIG_PATH",
            explicit.display().to_string(),
        )])
        .load()
        .unwrap();
    assert_eq!(load.config.pipeline.batcher.batch_size, 7);
    assert_eq!(load.config.metadata.source, ConfigSource::EnvPath(explicit));
}

#[test]
fn inline_json_and_redis_overrides() {
    let root = TempDir::new().unwrap();
    let load = loader(&root)
        .with_env_vars([
            (
                "PERIMETER_CONFIG_JSON",
                r#"{"redis":{"url":"redis://file:6379"},"pipeline":{"retry":{"max_attempts":3}}}"#,
            ),
            ("REDIS_URL", "redis://env:6380/2"),
            ("PERIMETER_REDIS_PREFIX", "prod"),
        ])
        .load()
        .unwrap();
    let config = load.config;
    assert_eq!(config.metadata.source, ConfigSource::EnvInline);
    assert_eq!(config.redis.url, "redis://env:6380/2");
    assert_eq!(config.redis.prefix, "prod");
    assert!(config.metadata.redis_url_from_env);
    assert_eq!(config.pipeline.retry.max_attempts, 3);
}

#[test]
fn env_file_supplies_missing_variables() {
    let root = TempDir::new().unwrap();
    let env_file = root.path().join(".env");
    fs::write(&env_file, "PERIMETER_REDIS_PREFIX=from-dotenv\n").unwrap();

    let load = ConfigLoader::new()
        .with_env_file(&env_file)
        .with_search_root(root.path())
        .with_env_vars(Vec::<(String, String)>::new())
        .load()
        .unwrap();
    assert!(load.config.metadata.env_file_loaded);
    assert_eq!(load.config.redis.prefix, "from-dotenv");
}

#[test]
fn zero_flush_interval_is_rejected() {
    let root = TempDir::new().unwrap();
    fs::write(
        root.path().join("perimeter.toml"),
        "[pipeline.batcher]\nflush_interval_ms = 0\n",
    )
    .unwrap();
    let err = loader(&root).load().unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::Zero {
            field: "batcher.flush_interval_ms"
        })
    ));
}

#[test]
fn unparsable_file_reports_origin() {
    let root = TempDir::new().unwrap();
    let path = root.path().join("broken.conf");
    fs::write(&path, "this is = = not valid").unwrap();
    let err = loader(&root)
        .with_env_vars([("PERIMETER_CONFIG_PATH", path.display().to_string())])
        .load()
        .unwrap_err();
    match err {
        ConfigLoadError::Parse { origin, .. } => {
            assert!(origin.ends_with("broken.conf"))
        }
        other => panic!("unexpected error: {other}"),
    }
}
