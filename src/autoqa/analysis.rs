//! Execution-result analysis worker.
//!
//! Completion signals (`script.completed`, `testcase.completed`,
//! `deployment.execution_done`) are enqueued on a durable queue; a
//! background worker drains it, pre-fetches the referenced artifacts
//! (report, logs) and folds them verbatim into the classifier prompt so
//! the model never has to call fetch tools, then runs the classifier
//! skill and persists the verdict keyed by the original execution id.
//!
//! Classification semantics:
//!
//! | label | meaning | discard |
//! |---|---|---|
//! | `VALID_PASS` | test passed, expected | false |
//! | `VALID_FAIL` | legitimate product defect | false |
//! | `BUG` | artifact evidence contradicts declared outcome | false |
//! | `SCRIPT_ISSUE` | selector/timing/test-code fault | true |
//! | `SYSTEM_ISSUE` | blackscreen, no-signal, device offline | true |
//!
//! Progress is broadcast to the `background_tasks` push room and,
//! optionally, to a chat [`Notifier`]. Failed analyses are re-enqueued up
//! to a bounded attempt count; per-task processing is independent and up
//! to `concurrency` classifications run in parallel.

use crate::autoqa::config::AnalysisConfig;
use crate::autoqa::control::{analysis_progress, Notifier, PushSink};
use crate::autoqa::event::Event;
use crate::autoqa::event_bus::{EventBus, EventHandler};
use crate::autoqa::llm::{ChatMessage, LlmClient};
use crate::autoqa::skill::SkillRegistry;
use crate::autoqa::store::{Store, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Result classes assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    ValidPass,
    ValidFail,
    Bug,
    ScriptIssue,
    SystemIssue,
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Classification::ValidPass => "VALID_PASS",
            Classification::ValidFail => "VALID_FAIL",
            Classification::Bug => "BUG",
            Classification::ScriptIssue => "SCRIPT_ISSUE",
            Classification::SystemIssue => "SYSTEM_ISSUE",
        }
    }

    /// Whether results with this class are filtered out of aggregate
    /// reporting.
    pub fn discard(&self) -> bool {
        matches!(self, Classification::ScriptIssue | Classification::SystemIssue)
    }

    /// Parse a classifier response. The `Classification: <LABEL>` line is
    /// authoritative; a bare label anywhere in the text is the fallback.
    pub fn parse(text: &str) -> Option<Self> {
        let all = [
            Classification::ValidPass,
            Classification::ValidFail,
            Classification::ScriptIssue,
            Classification::SystemIssue,
            Classification::Bug,
        ];
        for line in text.lines() {
            if let Some(rest) = line.trim().strip_prefix("Classification:") {
                let rest = rest.trim();
                for class in &all {
                    if rest.starts_with(class.label()) {
                        return Some(*class);
                    }
                }
            }
        }
        all.iter().find(|c| text.contains(c.label())).copied()
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One queued completion signal awaiting analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub script_result_id: String,
    #[serde(default)]
    pub script_name: String,
    #[serde(default)]
    pub report_url: Option<String>,
    #[serde(default)]
    pub logs_url: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

/// Persisted verdict for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultClassification {
    pub script_result_id: String,
    pub script_name: String,
    pub label: String,
    pub discard: bool,
    pub explanation: String,
    pub classified_at: DateTime<Utc>,
}

/// Fetches report/log artifacts referenced by completion payloads.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// Default fetcher over HTTP.
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
}

impl HttpArtifactFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpArtifactFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(&self, url: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

/// Analysis worker errors.
#[derive(Debug)]
pub enum AnalysisError {
    Fetch(String),
    Llm(String),
    Unclassifiable(String),
    Storage(StoreError),
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::Fetch(msg) => write!(f, "Artifact fetch failed: {}", msg),
            AnalysisError::Llm(msg) => write!(f, "Classifier call failed: {}", msg),
            AnalysisError::Unclassifiable(text) => {
                write!(f, "Classifier output had no classification: {}", text)
            }
            AnalysisError::Storage(err) => write!(f, "Storage failure: {}", err),
        }
    }
}

impl Error for AnalysisError {}

impl From<StoreError> for AnalysisError {
    fn from(err: StoreError) -> Self {
        AnalysisError::Storage(err)
    }
}

impl AnalysisError {
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::Fetch(_) => "transient",
            AnalysisError::Llm(_) => "transient",
            AnalysisError::Unclassifiable(_) => "transient",
            AnalysisError::Storage(_) => "storage",
        }
    }
}

/// The completion-queue worker.
pub struct AnalysisWorker {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    skills: Arc<SkillRegistry>,
    fetcher: Arc<dyn ArtifactFetcher>,
    sink: Option<Arc<dyn PushSink>>,
    notifier: Option<Arc<dyn Notifier>>,
    config: AnalysisConfig,
    permits: Arc<Semaphore>,
}

impl AnalysisWorker {
    pub fn new(
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmClient>,
        skills: Arc<SkillRegistry>,
        fetcher: Arc<dyn ArtifactFetcher>,
        config: AnalysisConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            store,
            llm,
            skills,
            fetcher,
            sink: None,
            notifier: None,
            config,
            permits,
        }
    }

    /// Attach the live-progress push channel (builder pattern).
    pub fn with_sink(mut self, sink: Arc<dyn PushSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Attach the optional chat notifier (builder pattern).
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Subscribe the worker's enqueuer to the completion signals.
    pub async fn attach(self: &Arc<Self>, bus: &EventBus) {
        for event_type in crate::autoqa::event::event_types::COMPLETION_SIGNALS.iter() {
            bus.subscribe(
                *event_type,
                Arc::new(CompletionSubscriber {
                    worker: Arc::downgrade(self),
                }),
            )
            .await;
        }
    }

    /// Enqueue one completion payload. Duplicate deliveries for an already
    /// classified execution are dropped here (idempotent consumer).
    pub async fn enqueue(&self, task: AnalysisTask) -> Result<(), AnalysisError> {
        if self
            .store
            .get_classification(&task.script_result_id)
            .await?
            .is_some()
        {
            log::debug!(
                "execution {} already classified; dropping duplicate completion",
                task.script_result_id
            );
            return Ok(());
        }
        self.store.enqueue_analysis(&self.config.queue, task).await?;
        Ok(())
    }

    /// Spawn the poll loop. Runs until the handle is aborted.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(worker.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                worker.drain_available().await;
            }
        })
    }

    /// Pop everything currently queued and process each entry under the
    /// concurrency semaphore.
    pub async fn drain_available(self: &Arc<Self>) {
        loop {
            let task = match self.store.pop_analysis(&self.config.queue).await {
                Ok(Some(task)) => task,
                Ok(None) => return,
                Err(err) => {
                    log::error!("analysis queue read failed: {}", err);
                    return;
                }
            };
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let worker = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                worker.process_with_retry(task).await;
            });
        }
    }

    /// Drain the queue sequentially until empty. Test/maintenance helper.
    pub async fn run_pending(self: &Arc<Self>) {
        loop {
            let task = match self.store.pop_analysis(&self.config.queue).await {
                Ok(Some(task)) => task,
                _ => return,
            };
            self.process_with_retry(task).await;
        }
    }

    async fn process_with_retry(&self, mut task: AnalysisTask) {
        match self.process(&task).await {
            Ok(()) => {}
            Err(err) => {
                task.attempts += 1;
                if task.attempts < self.config.max_attempts {
                    log::warn!(
                        "analysis of {} failed (attempt {}), re-enqueueing: {}",
                        task.script_result_id,
                        task.attempts,
                        err
                    );
                    if let Err(err) =
                        self.store.enqueue_analysis(&self.config.queue, task).await
                    {
                        log::error!("could not re-enqueue analysis task: {}", err);
                    }
                } else {
                    log::error!(
                        "analysis of {} dropped after {} attempts: {}",
                        task.script_result_id,
                        task.attempts,
                        err
                    );
                }
            }
        }
    }

    async fn process(&self, task: &AnalysisTask) -> Result<(), AnalysisError> {
        let report = match &task.report_url {
            Some(url) => Some(
                self.fetcher
                    .fetch(url)
                    .await
                    .map_err(|e| AnalysisError::Fetch(e.to_string()))?,
            ),
            None => None,
        };
        let logs = match &task.logs_url {
            Some(url) => Some(
                self.fetcher
                    .fetch(url)
                    .await
                    .map_err(|e| AnalysisError::Fetch(e.to_string()))?,
            ),
            None => None,
        };

        let system_prompt = self
            .skills
            .get(&self.config.classifier_skill)
            .map(|s| s.system_prompt.clone())
            .unwrap_or_else(|| {
                "You classify QA execution results. Reply with a line \
                 `Classification: <VALID_PASS|VALID_FAIL|BUG|SCRIPT_ISSUE|SYSTEM_ISSUE>` \
                 followed by a one-paragraph justification."
                    .to_string()
            });

        let mut prompt = format!(
            "Execution '{}' (id {}) finished with declared success = {}.\n",
            task.script_name, task.script_result_id, task.success
        );
        if let Some(report) = &report {
            prompt.push_str("\n--- REPORT ---\n");
            prompt.push_str(report);
            prompt.push('\n');
        }
        if let Some(logs) = &logs {
            prompt.push_str("\n--- LOGS ---\n");
            prompt.push_str(logs);
            prompt.push('\n');
        }
        prompt.push_str("\nClassify this result.");

        let messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(prompt)];
        let response = self
            .llm
            .complete(&messages, &[])
            .await
            .map_err(|e| AnalysisError::Llm(e.to_string()))?;

        let classification = Classification::parse(&response.content)
            .ok_or_else(|| AnalysisError::Unclassifiable(response.content.clone()))?;

        let row = ResultClassification {
            script_result_id: task.script_result_id.clone(),
            script_name: task.script_name.clone(),
            label: classification.label().to_string(),
            discard: classification.discard(),
            explanation: response.content.clone(),
            classified_at: Utc::now(),
        };
        self.store.put_classification(row).await?;

        log::info!(
            "execution {} classified {} (discard = {})",
            task.script_result_id,
            classification,
            classification.discard()
        );

        if let Some(sink) = &self.sink {
            sink.push(
                &self.config.progress_room,
                &analysis_progress(serde_json::json!({
                    "kind": "analysis_completed",
                    "script_result_id": task.script_result_id,
                    "script_name": task.script_name,
                    "classification": classification.label(),
                    "discard": classification.discard(),
                })),
            )
            .await;
        }
        if let Some(notifier) = &self.notifier {
            let text = format!(
                "Analysis: {} → {}{}",
                task.script_name,
                classification,
                if classification.discard() {
                    " (discarded)"
                } else {
                    ""
                }
            );
            if let Err(err) = notifier.notify(&text).await {
                log::warn!("analysis notification failed: {}", err);
            }
        }
        Ok(())
    }
}

/// Bus handler that turns completion events into queued analysis tasks.
struct CompletionSubscriber {
    worker: Weak<AnalysisWorker>,
}

#[async_trait]
impl EventHandler for CompletionSubscriber {
    async fn handle(&self, event: &Event) -> Result<(), Box<dyn Error + Send + Sync>> {
        let worker = match self.worker.upgrade() {
            Some(worker) => worker,
            None => return Ok(()),
        };
        let task: AnalysisTask = serde_json::from_value(event.payload.clone())
            .map_err(|e| Box::new(e) as Box<dyn Error + Send + Sync>)?;
        worker
            .enqueue(task)
            .await
            .map_err(|e| Box::new(e) as Box<dyn Error + Send + Sync>)
    }
}
