//! Configuration loading tests.

use quicd_streams::{ReadyPolicy, StreamsConfig};

#[test]
fn test_config_round_trip() {
    let config = StreamsConfig {
        send_buffer_size: 128 * 1024,
        receive_window: 4 * 1024 * 1024,
        ready_policy: Some(ReadyPolicy::LowestIdFirst),
        ..StreamsConfig::default()
    };
    let text = toml::to_string(&config).unwrap();
    assert!(text.contains("ready_policy = \"lowest_id_first\""));

    let parsed: StreamsConfig = toml::from_str(&text).unwrap();
    assert_eq!(parsed, config);
    assert!(parsed.validate().is_ok());
}

#[test]
fn test_empty_config_uses_defaults() {
    let parsed: StreamsConfig = toml::from_str("").unwrap();
    assert_eq!(parsed, StreamsConfig::default());
    assert_eq!(parsed.ready_policy_for(true), ReadyPolicy::RoundRobin);
    assert_eq!(parsed.ready_policy_for(false), ReadyPolicy::LowestIdFirst);
}

#[test]
fn test_invalid_config_reports_every_problem() {
    let parsed: StreamsConfig = toml::from_str(
        r#"
        send_buffer_size = 0
        receive_window = 0
        max_out_of_order_fragments = 0
        "#,
    )
    .unwrap();
    let errors = parsed.validate().unwrap_err();
    assert_eq!(errors.len(), 3);
}
