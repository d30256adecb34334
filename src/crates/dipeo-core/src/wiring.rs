//! Default service wiring.
//!
//! [`wire_container`] assembles the standard in-process container: event
//! bus, cache-first state store with its flusher, handler registry, the
//! observer set, and the default service implementations. With
//! `DIPEO_MINIMAL_WIRING=1` only the services the engine itself needs are
//! registered; `DIPEO_FEATURES` adds optional groups (`llm` wires the
//! deterministic echo model, useful for dry runs and tests - real providers
//! are registered by the embedding application).

use crate::config::EnvSettings;
use crate::diagram::format::load_diagram;
use crate::diagram::{DiagramFormat, DomainDiagram};
use crate::error::{DipeoError, Result};
use crate::events::{ExecutionUpdate, InProcessEventBus};
use crate::expr;
use crate::handlers::HandlerRegistry;
use crate::observers::{
    LoggingObserver, MetricsObserver, StatePersistenceSubscriber, StreamingMonitor,
    METRICS_OBSERVER,
};
use crate::registry::ServiceRegistry;
use crate::services::{
    ApiKeyService, CodeRunner, DiagramPort, FileSystemPort, LlmRequest, LlmResponse, LlmService,
    MessageRouter, PromptBuilder, TemplateProcessor, API_KEY_SERVICE, CODE_RUNNER, DIAGRAM_PORT,
    EVENT_BUS, FILE_SYSTEM, LLM_SERVICE, MESSAGE_ROUTER, NODE_REGISTRY, PROMPT_BUILDER,
    STATE_STORE, TEMPLATE_PROCESSOR,
};
use async_trait::async_trait;
use dipeo_state::{CacheFirstStateStore, ExecutionStateRepository, LlmUsage, StateStoreConfig};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// The assembled in-process runtime.
pub struct Container {
    pub registry: Arc<ServiceRegistry>,
    pub bus: Arc<InProcessEventBus>,
    pub store: Arc<CacheFirstStateStore>,
    pub metrics: Arc<MetricsObserver>,
    /// Background tasks owned by the container (state flusher, keepalive).
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Container {
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Build the standard container over the given durable repository.
pub fn wire_container(
    repository: Arc<dyn ExecutionStateRepository>,
    settings: &EnvSettings,
    diagram_dir: impl Into<PathBuf>,
) -> Container {
    let registry = Arc::new(ServiceRegistry::new());
    let bus = InProcessEventBus::with_defaults();
    let store = CacheFirstStateStore::new(repository, StateStoreConfig::default());
    let mut tasks = vec![store.spawn_flusher()];

    // Engine-required services.
    registry.register(STATE_STORE, store.clone());
    registry.register(EVENT_BUS, bus.clone());
    registry.register(NODE_REGISTRY, HandlerRegistry::with_builtins());
    registry.register(CODE_RUNNER, Arc::new(InlineCodeRunner) as Arc<dyn CodeRunner>);
    registry.register(
        TEMPLATE_PROCESSOR,
        Arc::new(SimpleTemplateProcessor) as Arc<dyn TemplateProcessor>,
    );
    registry.register(
        PROMPT_BUILDER,
        Arc::new(TemplatePromptBuilder) as Arc<dyn PromptBuilder>,
    );

    // Persistence must observe before anyone else.
    StatePersistenceSubscriber::new(store.clone()).attach(&bus);

    let metrics = MetricsObserver::new();
    metrics.attach(&bus);
    registry.register(METRICS_OBSERVER, metrics.clone());

    LoggingObserver::new().attach(&bus);

    if !settings.minimal_wiring {
        registry.register(
            FILE_SYSTEM,
            Arc::new(LocalFileSystem) as Arc<dyn FileSystemPort>,
        );
        registry.register(
            API_KEY_SERVICE,
            Arc::new(EnvApiKeyService::new()) as Arc<dyn ApiKeyService>,
        );
        registry.register(
            DIAGRAM_PORT,
            Arc::new(FileDiagramPort::new(diagram_dir)) as Arc<dyn DiagramPort>,
        );
        registry.register(
            MESSAGE_ROUTER,
            Arc::new(TracingMessageRouter) as Arc<dyn MessageRouter>,
        );
        let monitor = StreamingMonitor::new(
            registry
                .resolve(MESSAGE_ROUTER)
                .expect("message router registered above"),
            Duration::from_secs(15),
        );
        monitor.attach(&bus, Some(Arc::new(crate::events::filter::TransportScopeFilter)));
        tasks.push(monitor.spawn_keepalive());

        if settings.has_feature("llm") {
            registry.register(LLM_SERVICE, Arc::new(EchoLlm) as Arc<dyn LlmService>);
        }
    }

    Container {
        registry,
        bus,
        store,
        metrics,
        tasks,
    }
}

// ---------------------------------------------------------------------------
// Default implementations
// ---------------------------------------------------------------------------

/// Expression-based code runner. Accepts an optional `return ` prefix on the
/// final expression.
pub struct InlineCodeRunner;

#[async_trait]
impl CodeRunner for InlineCodeRunner {
    async fn run(&self, code: &str, scope: &HashMap<String, Value>) -> Result<Value> {
        let expression = code
            .trim()
            .trim_start_matches("return ")
            .trim_end_matches(';')
            .trim();
        expr::evaluate(expression, scope)
    }
}

/// `{{path}}` substitution with dotted lookups. Unknown placeholders render
/// empty, mirroring how missing variables evaluate to null elsewhere.
pub struct SimpleTemplateProcessor;

impl TemplateProcessor for SimpleTemplateProcessor {
    fn render(&self, template: &str, scope: &HashMap<String, Value>) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(DipeoError::Validation(format!(
                    "Unclosed '{{{{' in template: '{template}'"
                )));
            };
            let path = after[..end].trim();
            if let Some(value) = expr::lookup(scope, path) {
                match value {
                    Value::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Prompt builder that renders through the same template syntax.
pub struct TemplatePromptBuilder;

impl PromptBuilder for TemplatePromptBuilder {
    fn build(&self, template: &str, scope: &HashMap<String, Value>) -> Result<String> {
        SimpleTemplateProcessor.render(template, scope)
    }
}

/// API keys resolved from the process environment (key id == variable name),
/// with an in-memory override map for tests.
pub struct EnvApiKeyService {
    overrides: parking_lot::RwLock<HashMap<String, String>>,
}

impl EnvApiKeyService {
    pub fn new() -> Self {
        Self {
            overrides: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn set_key(&self, key_id: impl Into<String>, value: impl Into<String>) {
        self.overrides.write().insert(key_id.into(), value.into());
    }
}

impl Default for EnvApiKeyService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiKeyService for EnvApiKeyService {
    async fn get_key(&self, key_id: &str) -> Result<Option<String>> {
        if let Some(value) = self.overrides.read().get(key_id) {
            return Ok(Some(value.clone()));
        }
        Ok(std::env::var(key_id).ok())
    }
}

/// Filesystem port over tokio::fs.
pub struct LocalFileSystem;

#[async_trait]
impl FileSystemPort for LocalFileSystem {
    async fn read_to_string(&self, path: &str) -> Result<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn write(&self, path: &str, contents: &str) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(tokio::fs::write(path, contents).await?)
    }

    async fn append(&self, path: &str, contents: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(contents.as_bytes()).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}

/// Diagram port loading named diagrams from a base directory, trying each
/// known extension.
pub struct FileDiagramPort {
    base_dir: PathBuf,
}

impl FileDiagramPort {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl DiagramPort for FileDiagramPort {
    async fn load(&self, name: &str) -> Result<DomainDiagram> {
        let direct = self.base_dir.join(name);
        if direct.is_file() {
            return load_diagram(&direct, None);
        }
        for extension in [
            "light.yaml",
            "light.yml",
            "yaml",
            "yml",
            "json",
            "readable.yaml",
            "readable.yml",
        ] {
            let candidate = self.base_dir.join(format!("{name}.{extension}"));
            if candidate.is_file() {
                return load_diagram(&candidate, None);
            }
        }
        Err(DipeoError::Validation(format!(
            "Diagram '{name}' not found under '{}'",
            self.base_dir.display()
        )))
    }
}

/// Deterministic stand-in LLM: echoes the last message. Wire a real provider
/// for production runs.
pub struct EchoLlm;

#[async_trait]
impl LlmService for EchoLlm {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let input_tokens = prompt.split_whitespace().count() as u64;
        Ok(LlmResponse {
            text: prompt,
            usage: LlmUsage {
                input_tokens,
                output_tokens: input_tokens,
                cached_tokens: None,
            },
        })
    }
}

/// Router that logs frames instead of pushing them to a transport.
pub struct TracingMessageRouter;

#[async_trait]
impl MessageRouter for TracingMessageRouter {
    async fn route(&self, frame: ExecutionUpdate) -> Result<()> {
        tracing::debug!(
            execution_id = %frame.execution_id,
            update_type = %frame.update_type,
            seq = frame.seq,
            "execution update"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_inline_code_runner_strips_return() {
        let runner = InlineCodeRunner;
        let scope: HashMap<String, Value> = [("x".to_string(), json!(1))].into_iter().collect();
        assert_eq!(runner.run("return x + 1", &scope).await.unwrap(), json!(2));
        assert_eq!(runner.run("x * 3;", &scope).await.unwrap(), json!(3));
    }

    #[test]
    fn test_template_substitution() {
        let scope: HashMap<String, Value> = [
            ("name".to_string(), json!("dipeo")),
            ("stats".to_string(), json!({"count": 3})),
        ]
        .into_iter()
        .collect();
        let rendered = SimpleTemplateProcessor
            .render("{{name}} ran {{stats.count}} times{{missing}}.", &scope)
            .unwrap();
        assert_eq!(rendered, "dipeo ran 3 times.");
    }

    #[test]
    fn test_template_unclosed_fails() {
        assert!(SimpleTemplateProcessor
            .render("{{oops", &HashMap::new())
            .is_err());
    }

    #[tokio::test]
    async fn test_container_wires_engine_services() {
        let repo = Arc::new(dipeo_state::InMemoryStateRepository::new());
        let container = wire_container(repo, &EnvSettings::default(), ".");
        assert!(container.registry.has(STATE_STORE));
        assert!(container.registry.has(EVENT_BUS));
        assert!(container.registry.has(NODE_REGISTRY));
        assert!(container.registry.has(FILE_SYSTEM));
        // llm is feature-gated.
        assert!(!container.registry.has(LLM_SERVICE));

        let with_llm = EnvSettings {
            features: vec!["llm".into()],
            ..Default::default()
        };
        let repo = Arc::new(dipeo_state::InMemoryStateRepository::new());
        let container = wire_container(repo, &with_llm, ".");
        assert!(container.registry.has(LLM_SERVICE));
    }

    #[tokio::test]
    async fn test_minimal_wiring_skips_adapters() {
        let repo = Arc::new(dipeo_state::InMemoryStateRepository::new());
        let settings = EnvSettings {
            minimal_wiring: true,
            ..Default::default()
        };
        let container = wire_container(repo, &settings, ".");
        assert!(container.registry.has(CODE_RUNNER));
        assert!(!container.registry.has(FILE_SYSTEM));
        assert!(!container.registry.has(DIAGRAM_PORT));
    }
}
