//! Prompt Assembler: builds the system instruction for one request.
//!
//! The instruction is the persona, a numbered list of behavioral rules,
//! and a `[문서 내용]` block holding either the full document text or the
//! retrieved chunks in rank order. Assembly is pure templating; the same
//! inputs always give the same string.

use crate::config::PromptConfig;
use crate::models::PromptContext;

const CONTEXT_HEADER: &str = "[문서 내용]";
const CHUNK_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone)]
pub struct PromptAssembler {
    persona: String,
    refusal: String,
    office_code: String,
    extra_rules: Vec<String>,
}

impl PromptAssembler {
    pub fn from_config(config: &PromptConfig) -> Self {
        Self {
            persona: config.persona.trim().to_string(),
            refusal: config.refusal.trim().to_string(),
            office_code: config.office_code.trim().to_string(),
            extra_rules: config
                .extra_rules
                .iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    /// The sentence the model must use when the context lacks an answer.
    pub fn refusal(&self) -> &str {
        &self.refusal
    }

    /// Behavioral rules, in the order they are numbered in the prompt.
    pub fn rules(&self) -> Vec<String> {
        let mut rules = vec![
            format!(
                "민원인의 질문에 제공된 {}을 바탕으로 출처를 밝히지 않고 답변하세요.",
                CONTEXT_HEADER
            ),
            format!(
                "문서에 없는 정보는 지어내지 말고 \"{}\"라고 안내하세요.",
                self.refusal
            ),
            format!(
                "전화번호가 네 자리 내선번호로만 적혀 있으면 앞에 \"{code}-\"를 붙여 안내하세요. (예: 2000 → {code}-2000)",
                code = self.office_code
            ),
            "URL을 그대로 노출하지 말고 https://로 시작하는 설명형 마크다운 링크로 작성하세요. (예: [홈페이지 바로가기](https://www.example.go.kr))".to_string(),
        ];
        rules.extend(self.extra_rules.iter().cloned());
        rules
    }

    pub fn assemble(&self, context: &PromptContext) -> String {
        let mut out = String::new();
        out.push_str(&self.persona);
        out.push('\n');
        for (i, rule) in self.rules().iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, rule));
        }
        out.push('\n');
        out.push_str(CONTEXT_HEADER);
        out.push('\n');
        match context {
            PromptContext::FullText(text) => out.push_str(text.trim()),
            PromptContext::Retrieved(chunks) => {
                let joined = chunks
                    .iter()
                    .map(|c| c.chunk.text.trim())
                    .collect::<Vec<_>>()
                    .join(CHUNK_SEPARATOR);
                out.push_str(&joined);
            }
        }
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentChunk, ScoredChunk};
    use std::sync::Arc;

    fn assembler() -> PromptAssembler {
        PromptAssembler::from_config(&PromptConfig::default())
    }

    fn scored(text: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: DocumentChunk {
                id: text.to_string(),
                chunk_index: 0,
                text: text.to_string(),
                embedding: vec![],
            },
            score,
        }
    }

    #[test]
    fn full_text_prompt_has_persona_rules_and_context() {
        let prompt = assembler().assemble(&PromptContext::FullText(Arc::from(
            "기초연금 문의: 내선 2000",
        )));
        assert!(prompt.starts_with("당신은 대구광역시 달서구의 사회복지업무 전문가입니다."));
        assert!(prompt.contains("1. 민원인의 질문에"));
        assert!(prompt.contains("죄송합니다. 정보가 없어 답변을 할 수 없습니다."));
        assert!(prompt.contains("053-667-2000"));
        assert!(prompt.contains("https://"));
        assert!(prompt.ends_with("[문서 내용]\n기초연금 문의: 내선 2000\n"));
    }

    #[test]
    fn retrieved_chunks_are_joined_in_rank_order() {
        let prompt = assembler().assemble(&PromptContext::Retrieved(vec![
            scored("best", 0.9),
            scored("second", 0.5),
        ]));
        assert!(prompt.ends_with("[문서 내용]\nbest\n\n---\n\nsecond\n"));
    }

    #[test]
    fn assembly_is_deterministic() {
        let context = PromptContext::FullText(Arc::from("same"));
        let a = assembler();
        assert_eq!(a.assemble(&context), a.assemble(&context));
    }

    #[test]
    fn extra_rules_are_numbered_after_the_fixed_ones() {
        let config = PromptConfig {
            extra_rules: vec!["  답변은 세 문장 이내로 하세요. ".to_string(), "".to_string()],
            ..PromptConfig::default()
        };
        let assembler = PromptAssembler::from_config(&config);
        assert_eq!(assembler.rules().len(), 5);
        let prompt = assembler.assemble(&PromptContext::FullText(Arc::from("x")));
        assert!(prompt.contains("5. 답변은 세 문장 이내로 하세요.\n"));
    }
}
