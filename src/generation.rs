//! Answer generation: a grounding prompt, an optional hosted tier, and a local
//! tier that always answers.

use crate::embeddings::tokenize;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// What a model must say when the context does not contain the answer
pub const UNKNOWN_ANSWER: &str = "I don't know.";

/// Most sentences the local tier quotes back
const MAX_EXTRACTED_SENTENCES: usize = 2;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "could", "did", "do", "does",
    "for", "from", "had", "has", "have", "how", "i", "if", "in", "into", "is", "it", "its", "me",
    "my", "of", "on", "or", "our", "should", "so", "that", "the", "their", "them", "there",
    "these", "they", "this", "to", "was", "we", "were", "what", "when", "where", "which", "who",
    "whom", "why", "will", "with", "would", "you", "your",
];

/// One question and the chunks it should be answered from
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub query: &'a str,
    pub contexts: &'a [String],
    /// The grounding prompt built from `query` and `contexts`
    pub prompt: String,
}

impl<'a> GenerationRequest<'a> {
    pub fn new(query: &'a str, contexts: &'a [String]) -> Self {
        GenerationRequest {
            query,
            contexts,
            prompt: build_prompt(query, contexts),
        }
    }
}

/// Build the prompt that restricts a model to the retrieved context
pub fn build_prompt(query: &str, contexts: &[String]) -> String {
    format!(
        "Answer the question using ONLY the context below.\n\
         If the answer is not in the context, say \"{}\"\n\n\
         Context:\n{}\n\n\
         Question:\n{}\n",
        UNKNOWN_ANSWER,
        contexts.join("\n\n"),
        query
    )
}

/// A model that can answer a grounded question
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String>;
}

/// Result of trying the hosted tier for one request
#[derive(Debug)]
pub enum PrimaryOutcome {
    /// No hosted model configured, or offline mode
    Disabled,
    Answered(String),
    Failed(anyhow::Error),
}

/// Two-tier answer generation: hosted model first when enabled, local model otherwise
#[derive(Clone)]
pub struct AnswerGenerator {
    primary: Option<Arc<dyn Generator>>,
    fallback: Arc<dyn Generator>,
}

impl AnswerGenerator {
    pub fn new(fallback: Arc<dyn Generator>) -> Self {
        AnswerGenerator {
            primary: None,
            fallback,
        }
    }

    pub fn with_primary(mut self, primary: Arc<dyn Generator>) -> Self {
        self.primary = Some(primary);
        self
    }

    /// Answer `query` from `contexts`.
    ///
    /// A failing hosted model is logged and the local model answers instead;
    /// only a failure of the local model is returned as an error.
    pub async fn generate(&self, query: &str, contexts: &[String]) -> Result<String> {
        if contexts.is_empty() {
            bail!("Cannot generate an answer without context");
        }

        let request = GenerationRequest::new(query, contexts);

        match self.try_primary(&request).await {
            PrimaryOutcome::Answered(answer) => return Ok(answer),
            PrimaryOutcome::Failed(e) => {
                warn!("Primary model failed, using local model: {:#}", e)
            }
            PrimaryOutcome::Disabled => debug!("Primary model disabled"),
        }

        let answer = self
            .fallback
            .generate(&request)
            .await
            .with_context(|| format!("Local model {} failed", self.fallback.name()))?;

        if answer.trim().is_empty() {
            bail!("Local model {} produced no output", self.fallback.name());
        }
        Ok(answer)
    }

    /// One attempt at the hosted tier, never retried
    pub async fn try_primary(&self, request: &GenerationRequest<'_>) -> PrimaryOutcome {
        let Some(primary) = &self.primary else {
            return PrimaryOutcome::Disabled;
        };

        match primary.generate(request).await {
            Ok(answer) if !answer.trim().is_empty() => PrimaryOutcome::Answered(answer),
            Ok(_) => {
                PrimaryOutcome::Failed(anyhow!("{} returned an empty answer", primary.name()))
            }
            Err(e) => {
                PrimaryOutcome::Failed(e.context(format!("{} request failed", primary.name())))
            }
        }
    }
}

/// Local answerer that quotes the context sentences sharing the most content
/// words with the question, or says it does not know.
#[derive(Debug, Default, Clone)]
pub struct ExtractiveGenerator;

impl ExtractiveGenerator {
    pub fn new() -> Self {
        ExtractiveGenerator
    }

    fn answer(&self, query: &str, contexts: &[String]) -> String {
        let query_terms = content_words(query);
        if query_terms.is_empty() {
            return UNKNOWN_ANSWER.to_string();
        }

        let mut seen = HashSet::new();
        let mut scored: Vec<(usize, usize, &str)> = contexts
            .iter()
            .flat_map(|context| split_sentences(context))
            .filter(|sentence| seen.insert(sentence.to_lowercase()))
            .enumerate()
            .filter_map(|(position, sentence)| {
                let words = content_words(sentence);
                let score = query_terms
                    .iter()
                    .filter(|term| words.iter().any(|word| terms_match(term, word)))
                    .count();
                (score > 0).then_some((score, position, sentence))
            })
            .collect();

        if scored.is_empty() {
            return UNKNOWN_ANSWER.to_string();
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(MAX_EXTRACTED_SENTENCES);
        // quote in reading order
        scored.sort_by_key(|(_, position, _)| *position);

        scored
            .into_iter()
            .map(|(_, _, sentence)| sentence)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Generator for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
        Ok(self.answer(request.query, request.contexts))
    }
}

/// Distinct non-stopword tokens, in order of first appearance
fn content_words(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .filter(|word| word.chars().count() > 1 && !STOPWORDS.contains(&word.as_str()))
        .filter(|word| seen.insert(word.clone()))
        .collect()
}

/// Exact match, or a shared stem of at least four characters ("colors" / "color")
fn terms_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.chars().count() >= 4 && long.starts_with(short)
}

/// Sentences end at `.`, `!`, `?` or a line break; the terminator is kept
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}
