//! Basic smoke test to verify crate compiles.

#[test]
fn crate_compiles() {
    // If this test runs, the public surface is wired up.
    let _ = std::any::type_name::<keywarden::KeywardenConfig>();
    let _ = std::any::type_name::<keywarden::KeywardenError>();
    let _ = std::any::type_name::<keywarden::Gatekeeper>();
    let _ = std::any::type_name::<keywarden::QuotaResetJob>();
}

#[test]
fn default_config_validates() {
    assert!(keywarden::KeywardenConfig::default().validate().is_ok());
}
