use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{GenerationError, Generator};

/// Canned-response [`Generator`] for dry runs and tests.
///
/// Responses are keyed by a marker substring searched for in the prompt and
/// then the system context.  Rules are checked in registration order.  Each
/// rule replays its queued responses in order and keeps repeating the last
/// one.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    rules: Mutex<Vec<Rule>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
}

#[derive(Debug)]
struct Rule {
    marker: String,
    responses: VecDeque<Result<String, GenerationError>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `response` for prompts containing `marker`.
    pub fn on(self, marker: impl Into<String>, response: impl Into<String>) -> Self {
        self.push(marker.into(), Ok(response.into()))
    }

    pub fn on_error(self, marker: impl Into<String>, error: GenerationError) -> Self {
        self.push(marker.into(), Err(error))
    }

    /// Response for prompts no rule matches.  Without one, unmatched prompts
    /// fail with `InvalidResponse`.
    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = Some(response.into());
        self
    }

    /// Every prompt received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }

    fn push(self, marker: String, response: Result<String, GenerationError>) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            match rules.iter_mut().find(|rule| rule.marker == marker) {
                Some(rule) => rule.responses.push_back(response),
                None => rules.push(Rule {
                    marker,
                    responses: VecDeque::from([response]),
                }),
            }
        }
        self
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        system_context: &str,
        _temperature: f32,
    ) -> Result<String, GenerationError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let mut rules = self
            .rules
            .lock()
            .map_err(|_| GenerationError::InvalidResponse("script lock poisoned".into()))?;
        let index = rules
            .iter()
            .position(|rule| prompt.contains(&rule.marker))
            .or_else(|| {
                rules
                    .iter()
                    .position(|rule| system_context.contains(&rule.marker))
            });
        let rule = match index {
            Some(index) => Some(&mut rules[index]),
            None => None,
        };

        match rule {
            Some(rule) if rule.responses.len() > 1 => rule
                .responses
                .pop_front()
                .unwrap_or_else(|| Err(GenerationError::InvalidResponse("empty script".into()))),
            Some(rule) => rule
                .responses
                .front()
                .cloned()
                .unwrap_or_else(|| Err(GenerationError::InvalidResponse("empty script".into()))),
            None => self.fallback.clone().ok_or_else(|| {
                GenerationError::InvalidResponse("no scripted response for prompt".into())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_repeats_last() {
        let generator = ScriptedGenerator::new()
            .on("SUMMARIZE", "first")
            .on("SUMMARIZE", "second");
        assert_eq!(generator.generate("SUMMARIZE a", "", 0.0).await.unwrap(), "first");
        assert_eq!(generator.generate("SUMMARIZE b", "", 0.0).await.unwrap(), "second");
        assert_eq!(generator.generate("SUMMARIZE c", "", 0.0).await.unwrap(), "second");
        assert_eq!(generator.prompts().len(), 3);
    }

    #[tokio::test]
    async fn unmatched_prompt_uses_fallback_or_fails() {
        let strict = ScriptedGenerator::new().on("A", "a");
        assert!(strict.generate("B", "", 0.0).await.is_err());

        let lenient = ScriptedGenerator::new().with_fallback("ok");
        assert_eq!(lenient.generate("B", "", 0.0).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn marker_may_live_in_system_context() {
        let generator = ScriptedGenerator::new().on("role:editor", "revised");
        assert_eq!(
            generator.generate("text", "role:editor", 0.0).await.unwrap(),
            "revised"
        );
    }

    #[tokio::test]
    async fn scripted_errors_surface() {
        let generator = ScriptedGenerator::new().on_error(
            "X",
            GenerationError::InvalidResponse("boom".into()),
        );
        assert_eq!(
            generator.generate("X", "", 0.0).await.unwrap_err().code(),
            "invalid_response"
        );
    }
}
