//! ============================================================================
//! Memory Hooks - Summarization and importance scoring
//! ============================================================================
//! Both hooks are pluggable. Callers treat every failure as "use the input
//! unchanged" / "use the rule-based score"; a hook can never fail a save.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{MAX_IMPORTANCE, MIN_IMPORTANCE};

/// Score used when no rule fires
pub const BASE_IMPORTANCE: i32 = 3;

/// Inputs longer than this are cut before being sent to the model
pub const MAX_SUMMARY_INPUT_CHARS: usize = 2000;

const SUMMARY_PROMPT: &str = r#"Please help me extract key information about the content of the conversation, here is an example of extracting key information:
input:"alan说你好，爱莉，很高兴认识你，我是一名程序员，我喜欢吃川菜，;爱莉说我们是兼容的
output:{"Summary": "alan向爱莉表示自己是一名程序员，alan喜欢吃川菜，爱莉认为和alan是兼容的"}
Please export the conversation summary in Chinese.
Please use JSON format strictly and output the result:
{"Summary": "A summary of the conversation you generated"}"#;

/// External LLM hook consumed by the driver
#[async_trait]
pub trait LlmHook: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String>;

    async fn score_importance(&self, text: &str) -> Result<i32>;
}

/// Strategy deciding how important a memory is (1..=10)
#[async_trait]
pub trait ImportanceScorer: Send + Sync {
    async fn score(&self, text: &str) -> Result<i32>;
}

/// Black-box chat model: system prompt + input in, text out
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system_prompt: &str, input: &str) -> Result<String>;
}

// ============================================================================
// Rule-based importance
// ============================================================================

/// Hand-tuned keyword / emotion / time tables
#[derive(Debug, Clone)]
pub struct RuleBasedImportance {
    keywords: Vec<(&'static str, i32)>,
    emotions: Vec<(&'static str, i32)>,
    time_related: Vec<(&'static str, i32)>,
}

impl Default for RuleBasedImportance {
    fn default() -> Self {
        Self {
            keywords: vec![
                ("分手", 9),
                ("结婚", 8),
                ("求婚", 8),
                ("表白", 7),
                ("吵架", 6),
                ("道歉", 5),
                ("礼物", 4),
                ("约会", 4),
                ("吃饭", 3),
                ("睡觉", 2),
                ("早安", 1),
                ("晚安", 1),
            ],
            emotions: vec![
                ("爱", 7),
                ("喜欢", 6),
                ("讨厌", 6),
                ("生气", 5),
                ("开心", 4),
                ("难过", 5),
                ("害怕", 4),
                ("担心", 4),
            ],
            time_related: vec![
                ("永远", 6),
                ("一直", 5),
                ("每天", 3),
                ("经常", 3),
                ("偶尔", 2),
                ("今天", 1),
            ],
        }
    }
}

impl RuleBasedImportance {
    pub fn evaluate(&self, text: &str) -> i32 {
        let mut score = BASE_IMPORTANCE;

        for (word, value) in &self.keywords {
            if text.contains(word) {
                score = score.max(*value);
            }
        }

        let emotion: i32 = table_sum(&self.emotions, text);
        if emotion > 0 {
            score = score.max((emotion / 2).min(8));
        }

        let time: i32 = table_sum(&self.time_related, text);
        if time > 0 {
            score = score.max((time / 2).min(7));
        }

        if text.chars().count() > 50 {
            score += 1;
        }
        if text.contains('?') || text.contains('？') {
            score += 1;
        }
        if text.contains('!') || text.contains('！') {
            score += 1;
        }

        score.clamp(MIN_IMPORTANCE, MAX_IMPORTANCE)
    }
}

fn table_sum(table: &[(&'static str, i32)], text: &str) -> i32 {
    table
        .iter()
        .filter(|(word, _)| text.contains(word))
        .map(|(_, value)| value)
        .sum()
}

#[async_trait]
impl ImportanceScorer for RuleBasedImportance {
    async fn score(&self, text: &str) -> Result<i32> {
        Ok(self.evaluate(text))
    }
}

/// Asks an `LlmHook` first and falls back to the rule tables
pub struct LlmImportance {
    hook: Arc<dyn LlmHook>,
    rules: RuleBasedImportance,
}

impl LlmImportance {
    pub fn new(hook: Arc<dyn LlmHook>) -> Self {
        Self {
            hook,
            rules: RuleBasedImportance::default(),
        }
    }
}

#[async_trait]
impl ImportanceScorer for LlmImportance {
    async fn score(&self, text: &str) -> Result<i32> {
        match self.hook.score_importance(text).await {
            Ok(score) if (MIN_IMPORTANCE..=MAX_IMPORTANCE).contains(&score) => Ok(score),
            Ok(score) => {
                warn!("LLM importance {} out of range, using rules", score);
                Ok(self.rules.evaluate(text))
            }
            Err(e) => {
                warn!("LLM importance failed: {}, using rules", e);
                Ok(self.rules.evaluate(text))
            }
        }
    }
}

// ============================================================================
// Hook implementations
// ============================================================================

/// Identity summary, rule-based importance
#[derive(Debug, Default, Clone)]
pub struct PassthroughHook {
    rules: RuleBasedImportance,
}

#[async_trait]
impl LlmHook for PassthroughHook {
    async fn summarize(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }

    async fn score_importance(&self, text: &str) -> Result<i32> {
        Ok(self.rules.evaluate(text))
    }
}

#[derive(Debug, Deserialize)]
struct SummaryReply {
    #[serde(rename = "Summary", alias = "summary")]
    summary: String,
}

/// Prompt-driven hook over a `ChatModel`
pub struct PromptLlmHook<M: ChatModel> {
    model: M,
    rules: RuleBasedImportance,
}

impl<M: ChatModel> PromptLlmHook<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            rules: RuleBasedImportance::default(),
        }
    }
}

#[async_trait]
impl<M: ChatModel> LlmHook for PromptLlmHook<M> {
    async fn summarize(&self, text: &str) -> Result<String> {
        let input: String = text.chars().take(MAX_SUMMARY_INPUT_CHARS).collect();
        if input.len() < text.len() {
            debug!("Summary input truncated to {} chars", MAX_SUMMARY_INPUT_CHARS);
        }

        let reply = self
            .model
            .complete(SUMMARY_PROMPT, &format!("input:{}", input))
            .await?;
        debug!("Summary reply: {}", reply);

        parse_summary(&reply).ok_or_else(|| anyhow!("No JSON summary in model reply"))
    }

    async fn score_importance(&self, text: &str) -> Result<i32> {
        Ok(self.rules.evaluate(text))
    }
}

/// Pull `"Summary"` out of the first `{...}` span of a model reply
pub fn parse_summary(reply: &str) -> Option<String> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<SummaryReply>(&reply[start..=end])
        .ok()
        .map(|r| r.summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marriage_keyword_floor() {
        let rules = RuleBasedImportance::default();
        assert!(rules.evaluate("alan说我们结婚吧;R说好") >= 8);
    }

    #[test]
    fn test_base_score() {
        let rules = RuleBasedImportance::default();
        assert_eq!(rules.evaluate("hello"), BASE_IMPORTANCE);
    }

    #[test]
    fn test_punctuation_and_length_bonuses() {
        let rules = RuleBasedImportance::default();
        assert_eq!(rules.evaluate("really?"), BASE_IMPORTANCE + 1);
        assert_eq!(rules.evaluate("really?!"), BASE_IMPORTANCE + 2);
        let long = "x".repeat(51);
        assert_eq!(rules.evaluate(&long), BASE_IMPORTANCE + 1);
    }

    #[test]
    fn test_emotion_sum_capped() {
        let rules = RuleBasedImportance::default();
        // 爱 7 + 喜欢 6 + 讨厌 6 = 19 -> 9 -> capped at 8
        assert_eq!(rules.evaluate("爱喜欢讨厌"), 8);
    }

    #[test]
    fn test_never_exceeds_ten() {
        let rules = RuleBasedImportance::default();
        let text = format!("分手了！为什么？{}", "永远".repeat(40));
        assert_eq!(rules.evaluate(&text), MAX_IMPORTANCE);
    }

    #[test]
    fn test_parse_summary() {
        let reply = r#"Sure! {"Summary": "alan是程序员"} hope this helps"#;
        assert_eq!(parse_summary(reply), Some("alan是程序员".to_string()));
        assert_eq!(parse_summary("no json here"), None);
        assert_eq!(parse_summary(r#"{"other": 1}"#), None);
    }

    struct FailingHook;

    #[async_trait]
    impl LlmHook for FailingHook {
        async fn summarize(&self, _text: &str) -> Result<String> {
            Err(anyhow!("model offline"))
        }

        async fn score_importance(&self, _text: &str) -> Result<i32> {
            Err(anyhow!("model offline"))
        }
    }

    #[tokio::test]
    async fn test_llm_importance_falls_back() {
        let scorer = LlmImportance::new(Arc::new(FailingHook));
        assert!(scorer.score("我们结婚吧").await.unwrap() >= 8);
    }

    struct EchoModel(&'static str);

    #[async_trait]
    impl ChatModel for EchoModel {
        async fn complete(&self, _system_prompt: &str, _input: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_prompt_hook_summarizes() {
        let hook = PromptLlmHook::new(EchoModel(r#"{"Summary": "short"}"#));
        assert_eq!(hook.summarize("a long conversation").await.unwrap(), "short");

        let broken = PromptLlmHook::new(EchoModel("I cannot do that"));
        assert!(broken.summarize("text").await.is_err());
    }
}
