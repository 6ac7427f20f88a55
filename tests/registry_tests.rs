use autoqa::registry::{AgentDefinition, DefinitionStatus, DocumentFormat};
use autoqa::{AgentRegistry, Event, EventPriority, MemoryStore, SkillRegistry};
use std::sync::Arc;

const QA_MOBILE: &str = r#"
id: qa-mobile
name: QA Mobile Agent
version: 1.0.0
author: qa-team
description: Investigates mobile alerts
nickname: QAM
selectable: true
default: false
goal:
  type: continuous
  description: Watch mobile alerts and investigate
triggers:
  - event_type: alert.blackscreen
    priority: critical
    filters: {platform: mobile}
event_pools: [mobile_tasks]
subagents: []
available_skills: [exploration-mobile]
default_tools: [list_interfaces]
permissions:
  devices: [acquire, release]
config:
  max_parallel_tasks: 2
  timeout_seconds: 600
  auto_retry: true
"#;

fn skills_with(names: &[&str]) -> Arc<SkillRegistry> {
    let mut skills = SkillRegistry::new();
    for name in names {
        skills
            .load_from_yaml(&format!(
                "name: {}\nsystem_prompt: prompt\ntools: []\n",
                name
            ))
            .unwrap();
    }
    Arc::new(skills)
}

fn registry(skills: Arc<SkillRegistry>) -> AgentRegistry {
    let _ = env_logger::builder().is_test(true).try_init();
    AgentRegistry::new(Arc::new(MemoryStore::new()), skills)
}

fn blackscreen(platform: &str) -> Event {
    Event::new(
        "alert.blackscreen",
        serde_json::json!({"platform": platform, "device_id": "d1"}),
        EventPriority::Critical,
    )
}

#[tokio::test]
async fn register_publish_resolve_with_payload_filters() {
    let registry = registry(skills_with(&["exploration-mobile"]));
    let (agent_id, version) = registry
        .import_from_text(QA_MOBILE, DocumentFormat::Yaml)
        .await
        .unwrap();
    assert_eq!(agent_id, "qa-mobile");
    assert_eq!(version, "1.0.0");

    // Draft versions never resolve.
    assert!(registry
        .resolve_for_event(&blackscreen("mobile"))
        .await
        .unwrap()
        .is_empty());

    registry.publish("qa-mobile", "1.0.0").await.unwrap();

    let matched = registry
        .resolve_for_event(&blackscreen("mobile"))
        .await
        .unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].id, "qa-mobile");

    // The filter rejects web alerts.
    assert!(registry
        .resolve_for_event(&blackscreen("web"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn resolution_uses_latest_published_semver() {
    let registry = registry(skills_with(&["exploration-mobile"]));
    registry
        .import_from_text(QA_MOBILE, DocumentFormat::Yaml)
        .await
        .unwrap();
    let newer = QA_MOBILE.replace("version: 1.0.0", "version: 1.2.0");
    registry
        .import_from_text(&newer, DocumentFormat::Yaml)
        .await
        .unwrap();

    registry.publish("qa-mobile", "1.0.0").await.unwrap();
    registry.publish("qa-mobile", "1.2.0").await.unwrap();

    let matched = registry
        .resolve_for_event(&blackscreen("mobile"))
        .await
        .unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].version, "1.2.0");

    assert_eq!(
        registry.list_versions("qa-mobile").await.unwrap(),
        vec!["1.0.0".to_string(), "1.2.0".to_string()]
    );
}

#[tokio::test]
async fn deprecated_versions_do_not_resolve() {
    let registry = registry(skills_with(&["exploration-mobile"]));
    registry
        .import_from_text(QA_MOBILE, DocumentFormat::Yaml)
        .await
        .unwrap();
    registry.publish("qa-mobile", "1.0.0").await.unwrap();
    registry.deprecate("qa-mobile", "1.0.0").await.unwrap();

    assert!(registry
        .resolve_for_event(&blackscreen("mobile"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn yaml_roundtrip_is_semantically_stable() {
    let registry = registry(skills_with(&["exploration-mobile"]));
    registry
        .import_from_text(QA_MOBILE, DocumentFormat::Yaml)
        .await
        .unwrap();

    let exported = registry
        .export_to_text("qa-mobile", Some("1.0.0"), DocumentFormat::Yaml)
        .await
        .unwrap();

    let original: AgentDefinition = serde_yaml::from_str(QA_MOBILE).unwrap();
    let roundtripped: AgentDefinition = serde_yaml::from_str(&exported).unwrap();

    assert_eq!(roundtripped.id, original.id);
    assert_eq!(roundtripped.version, original.version);
    assert_eq!(roundtripped.triggers.len(), original.triggers.len());
    assert_eq!(
        roundtripped.triggers[0].filters,
        original.triggers[0].filters
    );
    assert_eq!(roundtripped.event_pools, original.event_pools);
    assert_eq!(roundtripped.available_skills, original.available_skills);
    assert_eq!(roundtripped.permissions, original.permissions);
    assert_eq!(
        roundtripped.config.max_parallel_tasks,
        original.config.max_parallel_tasks
    );
    assert_eq!(roundtripped.config.auto_retry, original.config.auto_retry);
}

#[tokio::test]
async fn exported_documents_roundtrip_through_files() {
    let source = registry(skills_with(&["exploration-mobile"]));
    source
        .import_from_text(QA_MOBILE, DocumentFormat::Yaml)
        .await
        .unwrap();

    // Write the exported document the way an operator would keep agent
    // definitions on disk, then import it into a second deployment.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qa-mobile.yaml");
    let exported = source
        .export_to_text("qa-mobile", Some("1.0.0"), DocumentFormat::Yaml)
        .await
        .unwrap();
    std::fs::write(&path, &exported).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let target = registry(skills_with(&["exploration-mobile"]));
    let (agent_id, version) = target
        .import_from_text(&text, DocumentFormat::Yaml)
        .await
        .unwrap();
    assert_eq!(agent_id, "qa-mobile");
    assert_eq!(version, "1.0.0");

    let record = target.get("qa-mobile", None).await.unwrap();
    assert_eq!(record.definition.triggers[0].event_type, "alert.blackscreen");
    assert_eq!(record.definition.config.timeout_seconds, 600);
    assert_eq!(record.definition.event_pools, vec!["mobile_tasks".to_string()]);
}

#[tokio::test]
async fn json_export_parses_back() {
    let registry = registry(skills_with(&["exploration-mobile"]));
    registry
        .import_from_text(QA_MOBILE, DocumentFormat::Yaml)
        .await
        .unwrap();

    let exported = registry
        .export_to_text("qa-mobile", None, DocumentFormat::Json)
        .await
        .unwrap();
    let parsed: AgentDefinition = serde_json::from_str(&exported).unwrap();
    assert_eq!(parsed.id, "qa-mobile");
    assert_eq!(parsed.goal.description.as_deref(), Some("Watch mobile alerts and investigate"));
}

#[tokio::test]
async fn bad_semver_is_rejected() {
    let registry = registry(skills_with(&[]));
    let doc = QA_MOBILE.replace("version: 1.0.0", "version: one-point-oh");
    let err = registry
        .import_from_text(&doc, DocumentFormat::Yaml)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn bad_trigger_priority_is_rejected() {
    let registry = registry(skills_with(&[]));
    let doc = QA_MOBILE.replace("priority: critical", "priority: urgent");
    let err = registry
        .import_from_text(&doc, DocumentFormat::Yaml)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn empty_event_pool_entries_are_rejected() {
    let registry = registry(skills_with(&[]));
    let doc = QA_MOBILE.replace("event_pools: [mobile_tasks]", "event_pools: [\"\"]");
    let err = registry
        .import_from_text(&doc, DocumentFormat::Yaml)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn unknown_skills_are_warnings_not_errors() {
    let registry = registry(skills_with(&[]));
    registry
        .import_from_text(QA_MOBILE, DocumentFormat::Yaml)
        .await
        .unwrap();

    let record = registry.get("qa-mobile", None).await.unwrap();
    assert_eq!(record.unknown_skills, vec!["exploration-mobile".to_string()]);
}

#[tokio::test]
async fn unresolved_subagents_need_forward_declarations() {
    let registry = registry(skills_with(&[]));
    let doc = QA_MOBILE.replace(
        "subagents: []",
        "subagents:\n  - id: qa-mobile-manager\n    delegate_for: [mobile_navigation]",
    );
    let err = registry
        .import_from_text(&doc, DocumentFormat::Yaml)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");

    let forward = QA_MOBILE.replace(
        "subagents: []",
        "subagents:\n  - id: qa-mobile-manager\n    delegate_for: [mobile_navigation]\n    forward: true",
    );
    registry
        .import_from_text(&forward, DocumentFormat::Yaml)
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_versions_conflict_and_delete_removes() {
    let registry = registry(skills_with(&["exploration-mobile"]));
    registry
        .import_from_text(QA_MOBILE, DocumentFormat::Yaml)
        .await
        .unwrap();

    let err = registry
        .import_from_text(QA_MOBILE, DocumentFormat::Yaml)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");

    registry.delete("qa-mobile", "1.0.0").await.unwrap();
    let err = registry.get("qa-mobile", None).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn list_filters_by_status() {
    let registry = registry(skills_with(&["exploration-mobile"]));
    registry
        .import_from_text(QA_MOBILE, DocumentFormat::Yaml)
        .await
        .unwrap();
    registry.publish("qa-mobile", "1.0.0").await.unwrap();

    assert_eq!(
        registry.list(Some(DefinitionStatus::Published)).await.unwrap().len(),
        1
    );
    assert!(registry
        .list(Some(DefinitionStatus::Draft))
        .await
        .unwrap()
        .is_empty());
}
