use fm_domain::config::KernelConfig;

#[test]
fn default_well_known_is_feed() {
    let config = KernelConfig::default();
    assert!(config.is_well_known("feed"));
    assert_eq!(config.scheduler.default_conversation, "feed");
}

#[test]
fn explicit_windows_parse() {
    let toml_str = r#"
message_dedup_window_secs = 120
recent_conversation_window_secs = 30

[scheduler]
tick_secs = 15
"#;
    let config = KernelConfig::from_toml_str(toml_str).unwrap();
    assert_eq!(config.dedup_window().as_secs(), 120);
    assert_eq!(config.recent_conversation_window().as_secs(), 30);
    assert_eq!(config.scheduler.tick_secs, 15);
}
