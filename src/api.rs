use crate::core::aggregator::{PersistFn, PersistingStream};
use crate::core::engine::{spawn_turn, TurnOutcome};
use crate::core::upstream::{AuditedUpstream, Upstream, UpstreamError, UpstreamRequest};
use crate::server::logger::{AuditEntry, AuditLog};
use crate::server::streaming::Streamer;
pub use crate::server::{ChatMessage, TurnRequest};
use crate::store::{ProjectStore, StoreError};
use crate::tools::sourcebook::SourcebookTools;
use crate::tools::story::StoryTools;
use crate::tools::{RegistryError, RequestContext, ToolFormat, ToolRegistry};
use crate::utils::config::{AppConfig, ConfigError, ModelSelection, ResolvedModel};
use futures::FutureExt;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("story generation needs a project")]
    NoProject,
}

/// A running turn: the caller-facing stream plus the task's eventual outcome.
pub struct Turn<S = Streamer> {
    pub stream: S,
    pub outcome: JoinHandle<TurnOutcome>,
    pub model: ResolvedModel,
}

pub type ChapterTurn = Turn<PersistingStream<Streamer, PersistFn>>;

/// Service context shared by every request.
pub struct Engine {
    config: AppConfig,
    registry: Arc<ToolRegistry>,
    store: Arc<ProjectStore>,
    audit: Arc<AuditLog>,
    upstream: Box<dyn Upstream>,
}

impl Engine {
    pub fn new(config: AppConfig, upstream: impl Upstream + 'static) -> Result<Self, EngineError> {
        config.validate()?;
        let store = Arc::new(ProjectStore::new(&config.projects_root));
        let audit = Arc::new(AuditLog::new(config.audit_capacity));
        let registry = ToolRegistry::builder()
            .register(StoryTools::new(Arc::clone(&store)))
            .register(SourcebookTools::new(Arc::clone(&store)))
            .build()?;
        crate::log_info!(
            "Engine ready with {} tools: {:?}",
            registry.names().len(),
            registry.names()
        );
        Ok(Self {
            config,
            registry: Arc::new(registry),
            store,
            upstream: Box::new(AuditedUpstream::new(upstream, Arc::clone(&audit))),
            audit,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn store(&self) -> Arc<ProjectStore> {
        Arc::clone(&self.store)
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.entries()
    }

    pub fn clear_audit(&self) {
        self.audit.clear();
    }

    /// Resolve the model and build the upstream request, tool prompt first.
    pub fn build_request(
        &self,
        messages: Vec<ChatMessage>,
        selection: &ModelSelection,
    ) -> Result<(UpstreamRequest, ResolvedModel), EngineError> {
        let model = self.config.resolve(selection)?;
        let tools = self.registry.tools();
        let mut full = Vec::with_capacity(messages.len() + 1);
        full.push(ChatMessage::system(ToolFormat::tool_prompt(&model.tags, &tools)));
        full.extend(messages);
        let request = UpstreamRequest {
            model: model.model_id.clone(),
            messages: full,
            params: model.params.clone(),
            tools,
        };
        Ok((request, model))
    }

    /// Start a chat turn. Must be called within a tokio runtime.
    pub fn chat_turn(&self, request: TurnRequest) -> Result<Turn, EngineError> {
        let ctx = self.context(&request);
        let (upstream_request, model) = self.build_request(request.messages, &request.selection)?;
        crate::log_info!(
            "[{}] Chat turn on {} ({} messages)",
            ctx.request_id,
            model.name,
            upstream_request.messages.len()
        );
        let deltas = self.upstream.open(&upstream_request)?;
        let (stream, outcome) = spawn_turn(deltas, model.tags.clone(), self.registry(), ctx);
        Ok(Turn {
            stream,
            outcome,
            model,
        })
    }

    /// Start a story-generation turn whose prose is appended to the project
    /// once the stream completes. A cancelled or failed stream persists nothing.
    pub fn generate_chapter(&self, request: TurnRequest) -> Result<ChapterTurn, EngineError> {
        let project = request.project_id.clone().ok_or(EngineError::NoProject)?;
        let story = self.store.load_story(&project)?;
        let chapter = request.chapter;
        if let Some(index) = chapter {
            if index >= story.chapters.len() {
                return Err(StoreError::NotFound(format!("chapter {index}")).into());
            }
        }

        let Turn {
            stream,
            outcome,
            model,
        } = self.chat_turn(request)?;
        let store = self.store();
        let persist: PersistFn = Box::new(move |text: String| {
            async move {
                let index = tokio::task::spawn_blocking(move || {
                    store.append_generated(&project, chapter, &text)
                })
                .await
                .map_err(|e| StoreError::Background(e.to_string()))??;
                crate::log_info!("Saved generated text to chapter {}", index);
                Ok::<(), StoreError>(())
            }
            .boxed()
        });
        Ok(Turn {
            stream: PersistingStream::new(|| stream, persist),
            outcome,
            model,
        })
    }

    fn context(&self, request: &TurnRequest) -> RequestContext {
        RequestContext {
            request_id: uuid::Uuid::new_v4().to_string(),
            project_id: request.project_id.clone(),
            chapter: request.chapter,
            model: request.selection.model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::upstream::ScriptedUpstream;
    use crate::server::logger::AuditStatus;
    use crate::tools::SOURCEBOOK_CHANGED;
    use futures::StreamExt;
    use std::time::Duration;

    fn engine(script: &str, upstream_chunk: usize) -> (tempfile::TempDir, Engine) {
        engine_with(ScriptedUpstream::new(script, upstream_chunk))
    }

    fn engine_with(upstream: ScriptedUpstream) -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            projects_root: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let engine = Engine::new(config, upstream).unwrap();
        engine.store().create_project("saga", "Saga").unwrap();
        (dir, engine)
    }

    fn request(text: &str) -> TurnRequest {
        TurnRequest {
            messages: vec![ChatMessage::user(text)],
            project_id: Some("saga".to_string()),
            ..TurnRequest::default()
        }
    }

    #[test]
    fn request_starts_with_tool_prompt() {
        let (_dir, engine) = engine("", 1);
        let (req, model) = engine
            .build_request(vec![ChatMessage::user("hi")], &ModelSelection::default())
            .unwrap();
        assert_eq!(model.name, "default");
        assert_eq!(req.messages[0].role, "system");
        assert!(req.messages[0].content.contains("upsert_sourcebook_entry"));
        assert_eq!(req.messages[1], ChatMessage::user("hi"));
        assert_eq!(req.tools.len(), 8);
    }

    #[test]
    fn unknown_model_is_rejected() {
        let (_dir, engine) = engine("", 1);
        let selection = ModelSelection {
            model: Some("missing".to_string()),
            ..ModelSelection::default()
        };
        assert!(matches!(
            engine.build_request(Vec::new(), &selection),
            Err(EngineError::Config(ConfigError::UnknownModel(_)))
        ));
    }

    #[tokio::test]
    async fn chat_turn_dispatches_tools_and_audits() {
        let script = "Noted.<tool_call>{\"name\": \"upsert_sourcebook_entry\", \"arguments\": \
            {\"name\": \"Ilse\", \"description\": \"Lighthouse keeper\"}}</tool_call>";
        let (_dir, engine) = engine(script, 5);
        let turn = engine.chat_turn(request("Add Ilse")).unwrap();
        let text: Vec<String> = turn.stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(text.concat(), "Noted.");

        let outcome = turn.outcome.await.unwrap();
        assert!(outcome.mutations.get(SOURCEBOOK_CHANGED));
        let history: Vec<ChatMessage> =
            outcome.tool_results.into_iter().map(ChatMessage::from).collect();
        assert_eq!(history[0].name.as_deref(), Some("upsert_sourcebook_entry"));

        let book = engine.store().load_sourcebook("saga").unwrap();
        assert_eq!(book.entries[0].description, "Lighthouse keeper");

        let audit = engine.audit_entries();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, AuditStatus::Completed);
        assert_eq!(audit[0].response, script);
        engine.clear_audit();
        assert!(engine.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn generated_chapter_is_persisted_once() {
        let (_dir, engine) = engine("The tide turned.", 3);
        let turn = engine.generate_chapter(request("Write")).unwrap();
        let text: Vec<String> = turn.stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(text.concat(), "The tide turned.");
        turn.outcome.await.unwrap();

        let story = engine.store().load_story("saga").unwrap();
        assert_eq!(story.chapters.len(), 1);
        assert_eq!(story.chapters[0].content, "The tide turned.");
    }

    #[tokio::test]
    async fn cancelled_generation_is_discarded() {
        let (_dir, engine) = engine_with(
            ScriptedUpstream::new("word ".repeat(100), 5).with_delay(Duration::from_millis(5)),
        );
        let mut turn = engine.generate_chapter(request("Write")).unwrap();
        assert_eq!(turn.stream.next().await.unwrap().unwrap(), "word ");
        drop(turn.stream);
        assert!(turn.outcome.await.unwrap().cancelled);

        assert!(engine.store().load_story("saga").unwrap().chapters.is_empty());
        assert_eq!(engine.audit_entries()[0].status, AuditStatus::Cancelled);
    }

    #[tokio::test]
    async fn generation_rejects_a_missing_chapter_up_front() {
        let (_dir, engine) = engine("Lost words.", 4);
        let mut req = request("Write");
        req.chapter = Some(3);
        assert!(matches!(
            engine.generate_chapter(req),
            Err(EngineError::Store(StoreError::NotFound(_)))
        ));
        assert!(engine.audit_entries().is_empty());

        engine.store().append_generated("saga", None, "Opening.").unwrap();
        let mut req = request("Write");
        req.chapter = Some(0);
        let turn = engine.generate_chapter(req).unwrap();
        let text: Vec<String> = turn.stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(text.concat(), "Lost words.");
        let story = engine.store().load_story("saga").unwrap();
        assert_eq!(story.chapters[0].content, "Opening.Lost words.");
    }

    #[tokio::test]
    async fn generation_requires_a_project() {
        let (_dir, engine) = engine("x", 1);
        let mut req = request("Write");
        req.project_id = None;
        assert!(matches!(engine.generate_chapter(req), Err(EngineError::NoProject)));

        let mut req = request("Write");
        req.project_id = Some("ghost".to_string());
        assert!(matches!(
            engine.generate_chapter(req),
            Err(EngineError::Store(StoreError::NotFound(_)))
        ));
    }
}
