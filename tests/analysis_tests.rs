use async_trait::async_trait;
use autoqa::analysis::{AnalysisTask, ArtifactFetcher, ResultClassification};
use autoqa::config::AnalysisConfig;
use autoqa::llm::{LlmResponse, StopReason, ToolSpec};
use autoqa::{
    AnalysisWorker, ChatMessage, Event, EventBus, EventPriority, LlmClient, MemoryStore, PushEvent,
    PushSink, SkillRegistry, Store, TokenUsage,
};
use chrono::Utc;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct MockLlm {
    response: String,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockLlm {
    fn replying(response: &str) -> Arc<Self> {
        Arc::new(Self {
            response: response.to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolSpec],
    ) -> Result<LlmResponse, Box<dyn Error + Send + Sync>> {
        self.prompts.lock().await.push(messages.to_vec());
        Ok(LlmResponse {
            content: self.response.clone(),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: Some(TokenUsage {
                input_tokens: 500,
                output_tokens: 40,
                total_tokens: 540,
            }),
        })
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

struct CannedFetcher {
    report: String,
}

#[async_trait]
impl ArtifactFetcher for CannedFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(self.report.clone())
    }
}

struct DownFetcher;

#[async_trait]
impl ArtifactFetcher for DownFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        Err("connection refused".into())
    }
}

struct CollectingSink {
    frames: Mutex<Vec<(String, PushEvent)>>,
}

impl CollectingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl PushSink for CollectingSink {
    async fn push(&self, room: &str, event: &PushEvent) {
        self.frames
            .lock()
            .await
            .push((room.to_string(), event.clone()));
    }
}

fn config() -> AnalysisConfig {
    AnalysisConfig {
        queue: "script_completions".to_string(),
        poll_interval: Duration::from_millis(50),
        max_attempts: 3,
        concurrency: 2,
        progress_room: "background_tasks".to_string(),
        classifier_skill: "result-analysis".to_string(),
    }
}

fn completion_task(id: &str) -> AnalysisTask {
    AnalysisTask {
        script_result_id: id.to_string(),
        script_name: "goto_live".to_string(),
        report_url: Some(format!("http://reports/{}", id)),
        logs_url: None,
        success: false,
        enqueued_at: Utc::now(),
        attempts: 0,
    }
}

#[tokio::test]
async fn selector_timeout_is_classified_script_issue_with_discard() {
    let store = Arc::new(MemoryStore::new());
    let llm = MockLlm::replying(
        "Classification: SCRIPT_ISSUE\nThe selector 'login-btn' timed out; the product behaved.",
    );
    let sink = CollectingSink::new();
    let worker = Arc::new(
        AnalysisWorker::new(
            store.clone(),
            llm.clone(),
            Arc::new(SkillRegistry::new()),
            Arc::new(CannedFetcher {
                report: "step 4 FAILED: Element \"login-btn\" timeout after 10s".to_string(),
            }),
            config(),
        )
        .with_sink(sink.clone()),
    );

    worker.enqueue(completion_task("r-1")).await.unwrap();
    worker.run_pending().await;

    let row: ResultClassification = store.get_classification("r-1").await.unwrap().unwrap();
    assert_eq!(row.label, "SCRIPT_ISSUE");
    assert!(row.discard);
    assert_eq!(row.script_result_id, "r-1");

    // The artifact contents were folded verbatim into the prompt.
    let prompts = llm.prompts.lock().await;
    assert!(prompts[0]
        .iter()
        .any(|m| m.content.contains("Element \"login-btn\" timeout")));

    // A progress frame reached the background_tasks room.
    let frames = sink.frames.lock().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, "background_tasks");
    match &frames[0].1 {
        PushEvent::AgentEvent { payload } => {
            assert_eq!(payload["classification"], serde_json::json!("SCRIPT_ISSUE"));
            assert_eq!(payload["discard"], serde_json::json!(true));
        }
        other => panic!("expected AgentEvent frame, got {:?}", other),
    }
}

#[tokio::test]
async fn valid_pass_keeps_discard_false() {
    let store = Arc::new(MemoryStore::new());
    let worker = Arc::new(AnalysisWorker::new(
        store.clone(),
        MockLlm::replying("Classification: VALID_PASS\nEverything matches the expectation."),
        Arc::new(SkillRegistry::new()),
        Arc::new(CannedFetcher {
            report: "all steps green".to_string(),
        }),
        config(),
    ));

    worker.enqueue(completion_task("r-2")).await.unwrap();
    worker.run_pending().await;

    let row = store.get_classification("r-2").await.unwrap().unwrap();
    assert_eq!(row.label, "VALID_PASS");
    assert!(!row.discard);
}

#[tokio::test]
async fn fetch_failures_retry_up_to_the_bound_then_drop() {
    let store = Arc::new(MemoryStore::new());
    let worker = Arc::new(AnalysisWorker::new(
        store.clone(),
        MockLlm::replying("Classification: VALID_PASS"),
        Arc::new(SkillRegistry::new()),
        Arc::new(DownFetcher),
        config(),
    ));

    worker.enqueue(completion_task("r-3")).await.unwrap();
    worker.run_pending().await;

    // Dropped after max_attempts; nothing persisted, queue drained.
    assert!(store.get_classification("r-3").await.unwrap().is_none());
    assert_eq!(
        store.analysis_queue_len("script_completions").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn duplicate_completions_for_classified_results_are_dropped() {
    let store = Arc::new(MemoryStore::new());
    store
        .put_classification(ResultClassification {
            script_result_id: "r-4".to_string(),
            script_name: "goto_live".to_string(),
            label: "VALID_PASS".to_string(),
            discard: false,
            explanation: String::new(),
            classified_at: Utc::now(),
        })
        .await
        .unwrap();

    let worker = Arc::new(AnalysisWorker::new(
        store.clone(),
        MockLlm::replying("Classification: VALID_PASS"),
        Arc::new(SkillRegistry::new()),
        Arc::new(CannedFetcher {
            report: String::new(),
        }),
        config(),
    ));

    worker.enqueue(completion_task("r-4")).await.unwrap();
    assert_eq!(
        store.analysis_queue_len("script_completions").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn completion_events_on_the_bus_feed_the_queue() {
    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::new(store.clone(), Default::default());
    let worker = Arc::new(AnalysisWorker::new(
        store.clone(),
        MockLlm::replying("Classification: SYSTEM_ISSUE\nBlackscreen throughout."),
        Arc::new(SkillRegistry::new()),
        Arc::new(CannedFetcher {
            report: "frames are black".to_string(),
        }),
        config(),
    ));
    worker.attach(&bus).await;

    bus.publish(Event::new(
        "script.completed",
        serde_json::json!({
            "script_result_id": "r-5",
            "script_name": "zap_check",
            "report_url": "http://reports/r-5",
            "logs_url": null,
            "success": false,
        }),
        EventPriority::Normal,
    ))
    .await
    .unwrap();

    // Hand the spawned subscriber time to enqueue.
    for _ in 0..50 {
        if store.analysis_queue_len("script_completions").await.unwrap() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    worker.run_pending().await;
    let row = store.get_classification("r-5").await.unwrap().unwrap();
    assert_eq!(row.label, "SYSTEM_ISSUE");
    assert!(row.discard);
}

#[tokio::test]
async fn classifier_skill_prompt_is_used_when_registered() {
    let store = Arc::new(MemoryStore::new());
    let mut skills = SkillRegistry::new();
    skills
        .load_from_yaml(
            "name: result-analysis\nsystem_prompt: You are the execution-result classifier.\ntools: [write_classification]\n",
        )
        .unwrap();
    let llm = MockLlm::replying("Classification: BUG\nThe report contradicts the pass verdict.");
    let worker = Arc::new(AnalysisWorker::new(
        store.clone(),
        llm.clone(),
        Arc::new(skills),
        Arc::new(CannedFetcher {
            report: "declared success but login never happened".to_string(),
        }),
        config(),
    ));

    worker.enqueue(completion_task("r-6")).await.unwrap();
    worker.run_pending().await;

    let prompts = llm.prompts.lock().await;
    assert!(prompts[0][0]
        .content
        .contains("You are the execution-result classifier."));
    let row = store.get_classification("r-6").await.unwrap().unwrap();
    assert_eq!(row.label, "BUG");
    assert!(!row.discard);
}
