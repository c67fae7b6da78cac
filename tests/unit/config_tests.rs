use context_relay::{config::GlobalConfig, AppError};

fn sample_toml() -> &'static str {
    r#"
db_path = "data/relay.db"
retention_days = 14

[gate]
primary_objectives = ["Optimize delivery routing by zone demand"]
excluded_objectives = ["Rebuild the payroll system"]
capabilities = ["analytics"]
clarity_threshold = 0.8

[scheduler]
min_agents = 2
max_agents = 4
cycle_interval_ms = 250
task_timeout_seconds = 60

[session]
budget_limit = 1000
delegation_threshold = 0.9
max_depth = 3

[persistence]
compression_threshold_bytes = 512
checkpoint_interval_seconds = 0

[executors]
analytics = "python3 run_analytics.py"
default = "cat"
"#
}

#[test]
fn parses_full_config() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("config parses");

    assert_eq!(config.db_path.to_string_lossy(), "data/relay.db");
    assert_eq!(config.retention_days, 14);
    assert_eq!(config.gate.primary_objectives.len(), 1);
    assert_eq!(config.gate.capabilities, vec!["analytics".to_owned()]);
    assert!((config.gate.clarity_threshold - 0.8).abs() < f64::EPSILON);
    assert_eq!(config.scheduler.max_agents, 4);
    assert_eq!(config.scheduler.task_timeout_seconds, 60);
    assert_eq!(config.session.budget_limit, 1000);
    assert_eq!(config.session.max_depth, 3);
    assert_eq!(config.persistence.compression_threshold_bytes, 512);
    assert_eq!(config.persistence.checkpoint_interval_seconds, 0);
    assert_eq!(config.executors.get("default").map(String::as_str), Some("cat"));
}

#[test]
fn omitted_fields_fall_back_to_defaults() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("config parses");

    // Untouched gate knobs keep their defaults.
    assert_eq!(config.gate.min_word_count, 10);
    assert!((config.gate.relevance_threshold - 0.6).abs() < f64::EPSILON);
    assert!(config.gate.vague_terms.iter().any(|t| t == "algo"));
    assert_eq!(config.scheduler.pause_after_failures, 3);
    assert_eq!(config.session.default_task_cost, 1000);
    assert_eq!(config.persistence.write_retries, 2);
}

#[test]
fn empty_document_yields_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config parses");
    assert_eq!(config, GlobalConfig::default());
    assert_eq!(config.scheduler.min_agents, 3);
    assert_eq!(config.scheduler.max_agents, 12);
    assert_eq!(config.session.budget_limit, 950_000);
    assert!((config.session.delegation_threshold - 0.85).abs() < f64::EPSILON);
    assert_eq!(config.retention_days, 30);
}

#[test]
fn min_agents_above_max_is_rejected() {
    let raw = "[scheduler]\nmin_agents = 5\nmax_agents = 2\n";
    let err = GlobalConfig::from_toml_str(raw).expect_err("must reject");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("min_agents")));
}

#[test]
fn zero_max_agents_is_rejected() {
    let raw = "[scheduler]\nmin_agents = 0\nmax_agents = 0\n";
    let err = GlobalConfig::from_toml_str(raw).expect_err("must reject");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn zero_task_history_limit_is_rejected() {
    let raw = "[scheduler]\ntask_history_limit = 0\n";
    let err = GlobalConfig::from_toml_str(raw).expect_err("must reject");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("task_history_limit")));
}

#[test]
fn delegation_threshold_outside_unit_interval_is_rejected() {
    let raw = "[session]\ndelegation_threshold = 1.5\n";
    let err = GlobalConfig::from_toml_str(raw).expect_err("must reject");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("delegation_threshold")));
}

#[test]
fn zero_budget_is_rejected() {
    let raw = "[session]\nbudget_limit = 0\n";
    assert!(GlobalConfig::from_toml_str(raw).is_err());
}

#[test]
fn gate_threshold_outside_unit_interval_is_rejected() {
    let raw = "[gate]\nclarity_threshold = 2.0\n";
    let err = GlobalConfig::from_toml_str(raw).expect_err("must reject");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("clarity_threshold")));
}

#[test]
fn malformed_toml_is_a_config_error() {
    let err = GlobalConfig::from_toml_str("[scheduler\nmax_agents = 3").expect_err("must reject");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn loads_from_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, sample_toml()).expect("write config");

    let config = GlobalConfig::load_from_path(&path).expect("load");
    assert_eq!(config.scheduler.min_agents, 2);
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::load_from_path(dir.path().join("absent.toml")).expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)));
}
