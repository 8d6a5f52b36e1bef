// tests/settings.rs
use std::{env, fs};

use std::time::Duration;

use news_harvester::config::{days, LogFormat, Settings, SinkKind, MAX_INTERVAL_MINUTES};
use news_harvester::error::ConfigError;
use news_harvester::ingest::pipeline::PipelineCfg;
use news_harvester::ingest::providers::AdapterSet;
use news_harvester::ingest::scheduler::SchedulerCfg;

const ENV_KEYS: &[&str] = &[
    "HARVESTER_CONFIG",
    "SCRAPE_INTERVAL",
    "HARVESTER_SINK",
    "HARVESTER_DB_PATH",
    "HARVESTER_SOURCES",
];

fn clear_env() {
    for k in ENV_KEYS {
        env::remove_var(k);
    }
}

#[serial_test::serial]
#[test]
fn file_values_then_env_overrides() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("harvester.toml");
    fs::write(
        &path,
        r#"
sources_path = "feeds.toml"

[scraping]
interval_minutes = 15
max_concurrent_fetches = 0

[output]
sink = "discord"

[dedup]
similarity_threshold = 140

[logging]
format = "json"
"#,
    )
    .unwrap();

    let s = Settings::load(Some(path.as_path())).unwrap();
    assert_eq!(s.scraping.interval_minutes, 15);
    assert_eq!(s.scraping.max_concurrent_fetches, 1, "clamped to at least one");
    assert_eq!(s.output.sink, SinkKind::Discord);
    assert_eq!(s.dedup.similarity_threshold, Some(100));
    assert_eq!(s.logging.format, LogFormat::Json);
    assert_eq!(s.sources_path.as_deref(), Some(std::path::Path::new("feeds.toml")));

    env::set_var("SCRAPE_INTERVAL", "3");
    env::set_var("HARVESTER_SINK", "stdout");
    env::set_var("HARVESTER_DB_PATH", "/tmp/other.db");
    let s = Settings::load(Some(path.as_path())).unwrap();
    assert_eq!(s.scraping.interval_minutes, 3);
    assert_eq!(s.output.sink, SinkKind::Log);
    assert_eq!(s.storage.database_path, std::path::PathBuf::from("/tmp/other.db"));

    clear_env();
}

#[serial_test::serial]
#[test]
fn unknown_sink_is_a_startup_error() {
    clear_env();
    env::set_var("HARVESTER_SINK", "carrier-pigeon");
    let err = Settings::load(None).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("carrier-pigeon")));
    clear_env();
}

#[serial_test::serial]
#[test]
fn bad_interval_is_rejected() {
    clear_env();
    env::set_var("SCRAPE_INTERVAL", "soon");
    assert!(matches!(Settings::load(None), Err(ConfigError::Invalid(_))));
    clear_env();
}

#[serial_test::serial]
#[test]
fn resolution_falls_back_to_cwd_then_defaults() {
    clear_env();
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();

    // Nothing anywhere: built-in defaults.
    let s = Settings::load(None).unwrap();
    assert_eq!(s.scraping.interval_minutes, 10);
    assert_eq!(s.output.sink, SinkKind::Log);

    // ./config/harvester.toml
    fs::create_dir_all(tmp.path().join("config")).unwrap();
    fs::write(
        tmp.path().join("config/harvester.toml"),
        "[scraping]\ninterval_minutes = 20\n",
    )
    .unwrap();
    assert_eq!(Settings::load(None).unwrap().scraping.interval_minutes, 20);

    // $HARVESTER_CONFIG wins over the cwd file.
    let env_file = tmp.path().join("env.json");
    fs::write(&env_file, r#"{"scraping": {"interval_minutes": 30}}"#).unwrap();
    env::set_var("HARVESTER_CONFIG", &env_file);
    assert_eq!(Settings::load(None).unwrap().scraping.interval_minutes, 30);

    // ...and must exist.
    env::set_var("HARVESTER_CONFIG", tmp.path().join("missing.toml"));
    assert!(matches!(Settings::load(None), Err(ConfigError::Invalid(_))));

    clear_env();
    env::set_current_dir(old).unwrap();
}

#[test]
fn malformed_file_names_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[scraping\ninterval_minutes = ").unwrap();
    match Settings::load_from_file(&path) {
        Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[serial_test::serial]
#[test]
fn extreme_values_saturate_everywhere() {
    clear_env();
    env::set_var("SCRAPE_INTERVAL", u64::MAX.to_string());
    let mut s = Settings::load(None).unwrap();
    assert_eq!(s.scraping.interval_minutes, u64::MAX);
    assert_eq!(s.scraping.interval(), Duration::from_secs(MAX_INTERVAL_MINUTES * 60));

    s.storage.keep_days = u64::MAX;
    s.scraping.request_timeout_secs = u64::MAX;
    s.browser.render_timeout_secs = u64::MAX;
    s.dedup.similarity_threshold = Some(90);
    s.dedup.similarity_window_hours = u64::MAX;

    let sched = SchedulerCfg::from_settings(&s);
    assert_eq!(sched.retention, Duration::from_secs(u64::MAX));
    assert_eq!(sched.interval, Duration::from_secs(MAX_INTERVAL_MINUTES * 60));

    let pipeline = PipelineCfg::from_settings(&s);
    let rule = pipeline.similarity.expect("similarity enabled");
    assert_eq!(rule.window, Duration::from_secs(u64::MAX));

    assert!(AdapterSet::from_settings(&s).is_ok());
    assert_eq!(days(u64::MAX / 1000), Duration::from_secs(u64::MAX));
    clear_env();
}
