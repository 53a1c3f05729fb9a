use super::*;
use std::collections::HashMap;

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_match_documented_values() {
    let config = Config::default();
    assert_eq!(config.retrieval.max_results, 5);
    assert!((config.retrieval.confidence_threshold - 0.7).abs() < 1e-12);
    let w = config.retrieval.weights;
    assert!((w.semantic - 0.5).abs() < 1e-12);
    assert!((w.keyword - 0.2).abs() < 1e-12);
    assert!((w.pattern - 0.2).abs() < 1e-12);
    assert!((w.historical - 0.1).abs() < 1e-12);
    validate_config(&config).expect("defaults validate");
}

#[test]
fn partial_config_file_fills_defaults() {
    let raw = r#"{
        "schema_version": 1,
        "provider": {"kind": "ollama", "base_url": "http://localhost:11434", "model": "qwen3"},
        "retrieval": {"max_results": 3}
    }"#;
    let config: Config = serde_json::from_str(raw).expect("parse config");
    assert_eq!(config.retrieval.max_results, 3);
    assert!((config.retrieval.confidence_threshold - 0.7).abs() < 1e-12);
    assert_eq!(config.generation, GenerationConfig::default());
    assert!(matches!(config.provider, ProviderConfig::Ollama { .. }));
    validate_config(&config).expect("valid");
}

#[test]
fn unknown_fields_are_rejected() {
    let raw = r#"{"schema_version": 1, "retrieval": {"top_k": 3}}"#;
    assert!(serde_json::from_str::<Config>(raw).is_err());
}

#[test]
fn wrong_schema_version_is_rejected() {
    let config = Config {
        schema_version: 9,
        ..Config::default()
    };
    let err = validate_config(&config).expect_err("schema mismatch");
    assert!(err.to_string().contains("schema_version"));
}

#[test]
fn out_of_range_values_are_rejected() {
    let mut config = Config::default();
    config.retrieval.max_results = 0;
    assert!(validate_config(&config).is_err());

    let mut config = Config::default();
    config.retrieval.confidence_threshold = 1.5;
    assert!(validate_config(&config).is_err());

    let mut config = Config::default();
    config.feedback.learning_rate = 0.0;
    assert!(validate_config(&config).is_err());

    let mut config = Config::default();
    config.retrieval.weights.semantic = 0.9;
    assert!(validate_config(&config).is_err());

    let mut config = Config::default();
    config.generation.review_threshold = -0.1;
    assert!(validate_config(&config).is_err());

    let mut config = Config::default();
    config.generation.review_attempts = 0;
    let err = validate_config(&config).expect_err("zero attempts");
    assert!(err.to_string().contains("review_attempts"));
}

#[test]
fn structure_review_can_be_switched_off() {
    let raw = r#"{"schema_version": 1, "generation": {"structure_review": false, "review_attempts": 2}}"#;
    let config: Config = serde_json::from_str(raw).expect("parse config");
    assert!(!config.generation.structure_review);
    assert_eq!(config.generation.review_attempts, 2);
    assert!((config.generation.review_threshold - 0.7).abs() < 1e-12);
    let settings = crate::workflow::WorkflowSettings::from_config(&config);
    assert!(!settings.review.enabled);
    assert_eq!(settings.review.max_attempts, 2);
}

#[test]
fn env_overrides_apply() {
    let mut config = Config::default();
    let env = env_of(&[
        (ENV_LM_COMMAND, "sh mock.sh"),
        (ENV_RETRIEVAL_WEIGHTS, "0.4, 0.3, 0.2, 0.1"),
        (ENV_MAX_RESULTS, "2"),
        (ENV_CONFIDENCE_THRESHOLD, "0.55"),
    ]);
    apply_env_overrides(&mut config, env).expect("apply env");
    assert_eq!(
        config.provider,
        ProviderConfig::Command {
            command: "sh mock.sh".to_string()
        }
    );
    assert!((config.retrieval.weights.semantic - 0.4).abs() < 1e-12);
    assert!((config.retrieval.weights.keyword - 0.3).abs() < 1e-12);
    assert_eq!(config.retrieval.max_results, 2);
    assert!((config.retrieval.confidence_threshold - 0.55).abs() < 1e-12);
}

#[test]
fn malformed_weights_are_rejected() {
    assert!(parse_weights("0.5,0.5").is_err());
    assert!(parse_weights("a,b,c,d").is_err());
    assert!(parse_weights("0.5,0.5,0.5,0.5").is_err());
    assert!(parse_weights("1,0,0,0").is_ok());
}

#[test]
fn config_round_trips_through_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("config.json");
    let mut config = Config::default();
    config.static_rules = vec!["Use BASE_CYCLE from the end date".to_string()];
    write_config(&path, &config).expect("write");
    let layer = read_config_value(&path).expect("read");
    let loaded = resolve_config(Some(layer), |_| None).expect("resolve");
    assert_eq!(loaded, config);
}

#[test]
fn file_values_win_over_environment() {
    let layer = serde_json::json!({
        "schema_version": 1,
        "retrieval": {"max_results": 3}
    });
    let env = env_of(&[
        (ENV_MAX_RESULTS, "8"),
        (ENV_CONFIDENCE_THRESHOLD, "0.5"),
    ]);
    let config = resolve_config(Some(layer), env).expect("resolve");
    assert_eq!(config.retrieval.max_results, 3);
    assert!((config.retrieval.confidence_threshold - 0.5).abs() < 1e-12);
}

#[test]
fn tagged_sections_replace_rather_than_merge() {
    let layer = serde_json::json!({
        "schema_version": 1,
        "provider": {"kind": "ollama", "base_url": "http://localhost:11434", "model": "qwen3"}
    });
    let env = env_of(&[(ENV_LM_COMMAND, "sh mock.sh")]);
    let config = resolve_config(Some(layer), env).expect("resolve");
    assert!(matches!(config.provider, ProviderConfig::Ollama { .. }));

    let config = resolve_config(None, env_of(&[(ENV_LM_COMMAND, "sh mock.sh")])).expect("resolve");
    assert_eq!(
        config.provider,
        ProviderConfig::Command {
            command: "sh mock.sh".to_string()
        }
    );
}
