//! Conversation state and the chat turn.
//!
//! [`ChatServices`] holds everything that is shared by all sessions of a
//! process: configuration, the document cache, the lazily loaded index,
//! the generator, and the prompt and post-processing rules. A
//! [`ChatSession`] owns one conversation and the document it is about,
//! and is passed explicitly to whatever serves the user (the CLI REPL or
//! one HTTP session).
//!
//! # Turn
//!
//! ```text
//! question ──▶ blank? ──yes──▶ InvalidInput (nothing recorded)
//!                │ no
//!                ▼
//!        push user message
//!                │
//!                ▼
//!   context (full text | top-k chunks) ──▶ system instruction
//!                │
//!                ▼
//!   generate (single-shot | streamed + post-processed)
//!                │
//!       ok ──────┴────── err
//!        ▼                ▼
//!  push assistant    return error; user message stays,
//!                    session remains usable
//! ```

use std::sync::Arc;
use uuid::Uuid;

use crate::config::{Config, ContextMode};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{DocentError, Result};
use crate::extract::{DocumentLoader, DocumentSource};
use crate::generation::{self, GenerationRequest, Generator, SamplingParams};
use crate::index::IndexProvider;
use crate::models::{Message, PromptContext};
use crate::postprocess::Postprocessor;
use crate::prompt::PromptAssembler;
use crate::retrieve::Retriever;
use crate::secrets;

/// Ordered, append-only message log.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// A conversation opened by an assistant greeting.
    pub fn with_welcome(welcome: Option<&str>) -> Self {
        let mut conversation = Self::new();
        if let Some(text) = welcome.map(str::trim).filter(|t| !t.is_empty()) {
            conversation.push_assistant(text);
        }
        conversation
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> &Message {
        self.push(Message::user(content))
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) -> &Message {
        self.push(Message::assistant(content))
    }

    fn push(&mut self, message: Message) -> &Message {
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Process-wide collaborators shared by every session.
pub struct ChatServices {
    config: Config,
    loader: DocumentLoader,
    index: IndexProvider,
    retriever: Option<Retriever>,
    generator: Arc<dyn Generator>,
    assembler: PromptAssembler,
    postprocessor: Postprocessor,
}

impl ChatServices {
    /// Wires up the hosted providers named in `config`. The API key is
    /// read here, once.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let api_key = secrets::load_api_key(&config.secrets)?;
        let generator = generation::create_generator(&config.generation, api_key.clone())?;

        let embedder = if config.context.mode == ContextMode::Retrieval {
            let key = embedding::needs_api_key(&config.embedding.provider).then_some(&api_key);
            Some(embedding::create_provider(&config.embedding, key)?)
        } else {
            None
        };

        Self::new(config, generator, embedder)
    }

    /// Builds services around explicit providers. `embedder` is required
    /// in retrieval mode and ignored otherwise.
    pub fn new(
        config: Config,
        generator: Arc<dyn Generator>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> anyhow::Result<Self> {
        let retriever = match (config.context.mode, embedder) {
            (ContextMode::Retrieval, Some(provider)) => Some(Retriever::new(
                provider,
                config.index.metric,
                config.index.top_k,
            )),
            (ContextMode::Retrieval, None) => {
                anyhow::bail!("retrieval mode needs an embedding provider")
            }
            (ContextMode::FullText, _) => None,
        };

        Ok(Self {
            loader: DocumentLoader::new(),
            index: IndexProvider::new(config.index.dir.clone()),
            retriever,
            generator,
            assembler: PromptAssembler::from_config(&config.prompt),
            postprocessor: Postprocessor::new(&config.postprocess, &config.prompt)?,
            config,
        })
    }

    /// Replaces the document loader (and so its cache and parser).
    pub fn with_loader(mut self, loader: DocumentLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The document configured under `[document] path`.
    pub fn default_document(&self) -> DocumentSource {
        DocumentSource::File(self.config.document.path.clone())
    }

    /// Gathers what the answer may be grounded on.
    ///
    /// Full-text mode reads the whole document; retrieval mode asks the
    /// index for the chunks nearest to `question` and never falls back to
    /// full text.
    pub async fn build_context(
        &self,
        document: &DocumentSource,
        question: &str,
    ) -> Result<PromptContext> {
        let context = match &self.retriever {
            None => PromptContext::FullText(self.loader.load(document).await?),
            Some(retriever) => {
                let index = self.index.get().await?;
                if index.is_empty() {
                    return Err(DocentError::Index(format!(
                        "{} contains no chunks",
                        index.path.display()
                    )));
                }
                PromptContext::Retrieved(retriever.retrieve(&index, question, None).await?)
            }
        };
        if context.is_empty() {
            return Err(DocentError::Extraction(
                "no document text available to answer from".to_string(),
            ));
        }
        Ok(context)
    }

    async fn request(
        &self,
        document: &DocumentSource,
        question: &str,
    ) -> Result<GenerationRequest> {
        let context = self.build_context(document, question).await?;
        Ok(GenerationRequest {
            system_instruction: self.assembler.assemble(&context),
            user_content: question.to_string(),
            params: SamplingParams::from_config(&self.config.generation),
        })
    }
}

/// One user's chat: a conversation about one document.
pub struct ChatSession {
    id: Uuid,
    services: Arc<ChatServices>,
    document: DocumentSource,
    conversation: Conversation,
}

impl ChatSession {
    /// Opens a session on the configured document, seeded with the
    /// welcome message if one is configured.
    pub fn new(services: Arc<ChatServices>) -> Self {
        let document = services.default_document();
        let conversation = Conversation::with_welcome(services.config.prompt.welcome.as_deref());
        Self {
            id: Uuid::new_v4(),
            services,
            document,
            conversation,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn document(&self) -> &DocumentSource {
        &self.document
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation.messages()
    }

    /// Switches the session to `source` after extracting it successfully;
    /// on failure the previous document stays in place. Returns the text.
    pub async fn set_document(&mut self, source: DocumentSource) -> Result<Arc<str>> {
        let text = self.services.loader.load(&source).await?;
        tracing::info!(
            session = %self.id,
            document = %source.display_name(),
            chars = text.chars().count(),
            "document switched"
        );
        self.document = source;
        Ok(text)
    }

    /// Single-shot turn: the whole answer is generated, then recorded
    /// unmodified.
    pub async fn ask(&mut self, question: &str) -> Result<Message> {
        let question = self.begin_turn(question)?;
        let result = self.answer(&question).await;
        self.finish_turn(result)
    }

    /// Streaming turn: each fragment is post-processed, handed to
    /// `on_fragment` as it arrives, and the post-processed text is what
    /// gets recorded.
    pub async fn ask_streaming<F>(&mut self, question: &str, mut on_fragment: F) -> Result<Message>
    where
        F: FnMut(&str),
    {
        let question = self.begin_turn(question)?;
        let result = self.answer_streaming(&question, &mut on_fragment).await;
        self.finish_turn(result)
    }

    fn begin_turn(&mut self, question: &str) -> Result<String> {
        let question = question.trim();
        if question.is_empty() {
            return Err(DocentError::InvalidInput(
                "question must not be empty".to_string(),
            ));
        }
        self.conversation.push_user(question);
        tracing::debug!(session = %self.id, chars = question.chars().count(), "turn started");
        Ok(question.to_string())
    }

    async fn answer(&self, question: &str) -> Result<String> {
        let request = self.services.request(&self.document, question).await?;
        self.services
            .generator
            .generate(&request)
            .await
            .map_err(DocentError::generation)
    }

    async fn answer_streaming<F>(&self, question: &str, on_fragment: &mut F) -> Result<String>
    where
        F: FnMut(&str),
    {
        let request = self.services.request(&self.document, question).await?;
        let mut stream = self
            .services
            .generator
            .stream(&request)
            .await
            .map_err(DocentError::generation)?;

        let mut answer = String::new();
        while let Some(fragment) = stream.next().await {
            let fragment = fragment.map_err(DocentError::generation)?;
            let shown = self.services.postprocessor.apply(&fragment);
            on_fragment(&shown);
            answer.push_str(&shown);
        }
        Ok(answer)
    }

    fn finish_turn(&mut self, result: Result<String>) -> Result<Message> {
        let answer = result.and_then(|answer| {
            if answer.trim().is_empty() {
                Err(DocentError::Generation("the model returned an empty answer".to_string()))
            } else {
                Ok(answer)
            }
        });

        match answer {
            Ok(answer) => Ok(self.conversation.push_assistant(answer).clone()),
            Err(e) => {
                tracing::warn!(session = %self.id, code = e.code(), error = %e, "turn failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_seeds_an_assistant_message() {
        let conversation = Conversation::with_welcome(Some("  무엇을 도와드릴까요? "));
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation.messages()[0].content, "무엇을 도와드릴까요?");
        assert_eq!(
            conversation.messages()[0].role,
            crate::models::Role::Assistant
        );
    }

    #[test]
    fn blank_welcome_is_skipped() {
        assert!(Conversation::with_welcome(Some("   ")).is_empty());
        assert!(Conversation::with_welcome(None).is_empty());
    }

    #[test]
    fn messages_keep_insertion_order() {
        let mut conversation = Conversation::new();
        conversation.push_user("q1");
        conversation.push_assistant("a1");
        conversation.push_user("q2");
        let contents: Vec<&str> = conversation
            .messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["q1", "a1", "q2"]);
    }
}
