//! Script Planner: ask an LLM for the clip plan and parse its answer.
//!
//! The request carries the extracted paper text, the optional steering
//! prompt and a few page images of the upload copy. Prompt wording lives in
//! [`crate::prompts`]; this module owns the retry loop and the tolerant
//! parsing of the response.
//!
//! ## Retry Strategy
//!
//! Provider errors (HTTP 429/503, timeouts) are retried with exponential
//! backoff, `retry_backoff_ms * 2^(attempt-1)`. A response that arrives but
//! cannot be parsed is not retried; it fails the job with a plan parse error.
//!
//! ## Parsing
//!
//! Models wrap JSON in prose or code fences. The parser walks the response
//! for balanced `{…}` spans (string- and escape-aware) and takes the first
//! one that deserializes into `{"clips": [...]}`.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::output::ClipPlan;
use crate::pipeline::encode;
use crate::pipeline::fetch::SourceDocument;
use crate::pipeline::pdf;
use crate::prompts::{planner_system_prompt, planner_user_message};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Longest edge of page images attached to the planner request.
const PAGE_IMAGE_MAX_PIXELS: u32 = 1024;

/// A parsed plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptPlan {
    /// Renderable clips, in order, truncated to the clip limit.
    pub clips: Vec<ClipPlan>,
    /// Entries the model returned before filtering and truncation.
    pub planned: usize,
}

/// Produces a clip plan for a fetched paper.
#[async_trait]
pub trait ScriptPlanner: Send + Sync {
    async fn plan(
        &self,
        doc: &SourceDocument,
        steering: Option<&str>,
    ) -> Result<ScriptPlan, PipelineError>;
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    clips: Vec<ClipPlan>,
}

/// Planner backed by an `edgequake-llm` provider.
pub struct LlmPlanner {
    provider: Arc<dyn LLMProvider>,
    config: PipelineConfig,
}

impl LlmPlanner {
    pub fn new(provider: Arc<dyn LLMProvider>, config: PipelineConfig) -> Self {
        Self { provider, config }
    }

    /// Resolve the provider from the config/environment chain.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Ok(Self::new(resolve_provider(config)?, config.clone()))
    }

    async fn page_images(&self, doc: &SourceDocument) -> Vec<ImageData> {
        let images = match pdf::render_page_images(
            &doc.upload.path,
            self.config.planner_page_images,
            PAGE_IMAGE_MAX_PIXELS,
        )
        .await
        {
            Ok(images) => images,
            Err(e) => {
                warn!("Planner: page images unavailable, sending text only: {}", e);
                return Vec::new();
            }
        };
        images
            .iter()
            .filter_map(|img| match encode::encode_page(img) {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!("Planner: failed to encode page image: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl ScriptPlanner for LlmPlanner {
    async fn plan(
        &self,
        doc: &SourceDocument,
        steering: Option<&str>,
    ) -> Result<ScriptPlan, PipelineError> {
        let start = Instant::now();
        let config = &self.config;

        let system = planner_system_prompt(config.system_prompt.as_deref(), config.max_clips);
        let text = truncate_chars(&doc.text, config.max_source_chars);
        let user = planner_user_message(text, steering);
        let images = self.page_images(doc).await;

        let messages = vec![
            ChatMessage::system(system),
            if images.is_empty() {
                ChatMessage::user(user)
            } else {
                ChatMessage::user_with_images(user, images)
            },
        ];
        let options = build_options(config);

        let mut last_err: Option<String> = None;
        for attempt in 0..=config.max_retries {
            if attempt > 0 {
                let backoff = config.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Planner: retry {}/{} after {}ms",
                    attempt, config.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "Planner: {} input tokens, {} output tokens, {:?}",
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    let plan = parse_plan(&response.content, config.max_clips)?;
                    info!(
                        "Planner: {} clips planned, {} kept",
                        plan.planned,
                        plan.clips.len()
                    );
                    return Ok(plan);
                }
                Err(e) => {
                    let msg = e.to_string();
                    warn!("Planner: attempt {} failed: {}", attempt + 1, msg);
                    last_err = Some(msg);
                }
            }
        }

        Err(PipelineError::PlannerFailed {
            retries: config.max_retries,
            detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
        })
    }
}

fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Parse a planner response into at most `max_clips` renderable clips.
pub fn parse_plan(response: &str, max_clips: usize) -> Result<ScriptPlan, PipelineError> {
    let mut found_object = false;
    let mut parse_error: Option<String> = None;

    for candidate in json_objects(response) {
        found_object = true;
        match serde_json::from_str::<PlanResponse>(candidate) {
            Ok(parsed) => {
                let planned = parsed.clips.len();
                let clips: Vec<ClipPlan> = parsed
                    .clips
                    .into_iter()
                    .filter(ClipPlan::is_renderable)
                    .take(max_clips)
                    .collect();
                if clips.is_empty() {
                    return Err(PipelineError::PlanParse {
                        reason: format!("plan has no usable clips ({planned} entries)"),
                    });
                }
                return Ok(ScriptPlan { clips, planned });
            }
            Err(e) => {
                parse_error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    let reason = if found_object {
        format!(
            "no JSON object with a 'clips' list: {}",
            parse_error.unwrap_or_default()
        )
    } else {
        "no JSON object found in the response".to_string()
    };
    Err(PipelineError::PlanParse { reason })
}

/// The first balanced `{…}` span of `s`, ignoring braces inside strings.
pub fn extract_first_json_object(s: &str) -> Option<&str> {
    json_objects(s).next()
}

/// Every balanced `{…}` span, in order of its opening brace.
fn json_objects(s: &str) -> impl Iterator<Item = &str> {
    s.char_indices()
        .filter(|(_, c)| *c == '{')
        .filter_map(move |(start, _)| balanced_end(s, start).map(|end| &s[start..end]))
}

/// Byte index just past the brace closing the object opened at `start`.
fn balanced_end(s: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`); the factory reads
///    the matching API key from the environment.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **Auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(default_model(name));
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set ANTHROPIC_API_KEY, OPENAI_API_KEY or GEMINI_API_KEY, or pass --provider.\n\
                Error: {e}"
            ),
        })?;

    Ok(llm_provider)
}

/// Model used when a provider is named without a model.
fn default_model(provider: &str) -> &'static str {
    match provider {
        "anthropic" => "claude-sonnet-4-20250514",
        "gemini" => "gemini-2.5-pro",
        _ => "gpt-4.1",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ClipKind;

    fn clip_json(n: usize) -> String {
        let clips: Vec<String> = (0..n)
            .map(|i| {
                format!(
                    r#"{{"type":"manim","code":"class SimpleScene(Scene):\n    pass # {i}","voice_over":"Clip {i}"}}"#
                )
            })
            .collect();
        format!(r#"{{"clips":[{}]}}"#, clips.join(","))
    }

    #[test]
    fn extracts_object_surrounded_by_prose() {
        let resp = format!("Sure! Here is the plan:\n```json\n{}\n```\nEnjoy.", clip_json(1));
        let obj = extract_first_json_object(&resp).unwrap();
        assert!(obj.starts_with("{\"clips\""));
        assert!(obj.ends_with("]}"));
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let s = r#"{"code":"d = {'a': 1}  # } unbalanced in string","voice_over":"\"{\""} tail }"#;
        let obj = extract_first_json_object(s).unwrap();
        assert!(obj.ends_with(r#""\"{\""}"#));
        let v: serde_json::Value = serde_json::from_str(obj).unwrap();
        assert!(v.get("code").is_some());
    }

    #[test]
    fn unbalanced_returns_none() {
        assert_eq!(extract_first_json_object("{\"clips\": ["), None);
        assert_eq!(extract_first_json_object("no json here"), None);
    }

    #[test]
    fn six_clips_truncated_to_four() {
        let plan = parse_plan(&clip_json(6), 4).unwrap();
        assert_eq!(plan.planned, 6);
        assert_eq!(plan.clips.len(), 4);
        assert_eq!(plan.clips[3].voice_over.as_deref(), Some("Clip 3"));
    }

    #[test]
    fn skips_leading_non_plan_object() {
        let resp = format!("{{\"note\": \"draft\"}} then {}", clip_json(2));
        let plan = parse_plan(&resp, 4).unwrap();
        assert_eq!(plan.clips.len(), 2);
    }

    #[test]
    fn non_renderable_clips_are_dropped() {
        let resp = r#"{"clips":[{"type":"veo","code":"x"},{"type":"manim","code":"  "},{"type":"manim","code":"ok"}]}"#;
        let plan = parse_plan(resp, 4).unwrap();
        assert_eq!(plan.clips.len(), 1);
        assert_eq!(plan.clips[0].kind, ClipKind::Manim);
        assert_eq!(plan.planned, 3);
    }

    #[test]
    fn empty_clip_list_is_a_parse_error() {
        let err = parse_plan(r#"{"clips":[]}"#, 4).unwrap_err();
        assert!(matches!(err, PipelineError::PlanParse { .. }));
    }

    #[test]
    fn missing_json_is_a_parse_error() {
        let err = parse_plan("I cannot help with that.", 4).unwrap_err();
        assert!(err.to_string().contains("no JSON object"));
    }

    #[test]
    fn wrong_shape_is_a_parse_error() {
        let err = parse_plan(r#"{"scenes":[1,2]}"#, 4).unwrap_err();
        assert!(err.to_string().contains("'clips'"));
    }

    #[test]
    fn truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn build_options_defaults() {
        let opts = build_options(&PipelineConfig::default());
        assert_eq!(opts.temperature, Some(0.7));
        assert_eq!(opts.max_tokens, Some(8192));
    }
}
