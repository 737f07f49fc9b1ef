//! Basic smoke test to verify the public surface is reachable.

#[test]
fn test_crate_compiles() {
    let _ = std::any::type_name::<patchflow::PatchflowConfig>();
    let _ = std::any::type_name::<patchflow::PatchflowError>();
    let _ = std::any::type_name::<patchflow::UpdateOrchestrator>();
}

#[test]
fn test_default_config_is_valid() {
    let config = patchflow::PatchflowConfig::new("app-secret");
    assert!(config.validate().is_ok());
    assert!(config.user_agent().contains("patchflow/"));
}
