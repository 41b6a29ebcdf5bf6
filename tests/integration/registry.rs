//! Stage registry validation before any project exists.

use testforge::config::Config;
use testforge::core::{StageDef, StageRegistry};
use testforge::orchestration::{AgentGateway, Capability};
use testforge::store::StateStore;
use testforge::Error;

use crate::fixtures::{gateway, Scripted, TestStore};

#[test]
fn test_cycle_is_rejected_before_any_project() {
    let store = TestStore::new();
    let result = StageRegistry::new(vec![
        StageDef::new("parse", Capability::Parse).after(&["generate"]),
        StageDef::new("scan", Capability::SecurityScan).after(&["parse"]),
        StageDef::new("generate", Capability::FrameworkGeneration).after(&["scan"]),
    ]);

    assert!(matches!(result, Err(Error::CycleDetected { .. })));
    assert!(store.store.list_projects().unwrap().is_empty());
}

#[test]
fn test_configured_stages_with_cycle_fail_fast() {
    let config: Config = toml::from_str(
        r#"
[[stages]]
id = "parse"
capability = "parse"
depends_on = ["scan"]

[[stages]]
id = "scan"
capability = "security_scan"
depends_on = ["parse"]
"#,
    )
    .unwrap();

    assert!(matches!(config.registry(), Err(Error::CycleDetected { .. })));
}

#[test]
fn test_unknown_dependency_is_rejected() {
    let result = StageRegistry::new(vec![
        StageDef::new("scan", Capability::SecurityScan).after(&["parse"]),
    ]);
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[test]
fn test_gateway_reports_capabilities_without_provider() {
    let registry = StageRegistry::default_pipeline().unwrap();
    let empty = AgentGateway::new(std::time::Duration::from_secs(1));
    assert_eq!(empty.missing_capabilities(&registry).len(), 4);

    let partial = gateway()
        .with_provider(Scripted::ok(Capability::Parse))
        .with_provider(Scripted::ok(Capability::SecurityScan));
    let mut missing = partial.missing_capabilities(&registry);
    missing.sort();
    assert_eq!(
        missing,
        vec![Capability::FrameworkGeneration, Capability::DevopsGeneration]
    );
}

#[test]
fn test_snapshot_survives_registry_change() {
    let store = TestStore::new();
    let original = StageRegistry::default_pipeline().unwrap();
    let project = store.create("snapshot", &original);

    let smaller = StageRegistry::new(vec![StageDef::new("parse", Capability::Parse)]).unwrap();
    store.create("other", &smaller);

    let tasks = store.store.list_tasks(&project.id).unwrap();
    assert_eq!(tasks.len(), original.len());
    let devops = tasks.iter().find(|t| t.stage_id.as_str() == "devops_generation").unwrap();
    assert!(!devops.fatal);
    assert_eq!(devops.depends_on.len(), 2);
}
