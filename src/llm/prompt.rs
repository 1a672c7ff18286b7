//! Prompt assembly for Llama-2 style chat models.

use crate::store::Transcript;

const TURN_OPEN: &str = "[INST]";
const TURN_CLOSE: &str = "[/INST]";
const SEQ_END: &str = "</s>";
const SEQ_START: &str = "<s>";

/// Renders a transcript plus a new input into a single raw prompt.
///
/// ```text
/// [INST] <<SYS>>{system}<</SYS>>
///
/// {input} [/INST] {response} </s><s>[INST] {new input} [/INST]
/// ```
#[derive(Debug, Clone, Default)]
pub struct PromptTemplate {
    system_prompt: String,
}

impl PromptTemplate {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }

    pub fn render(&self, context: &Transcript, input: &str) -> String {
        let mut prompt = format!("{TURN_OPEN} <<SYS>>{}<</SYS>>\n\n", self.system_prompt);
        for turn in context.turns() {
            prompt.push_str(&turn.input);
            prompt.push(' ');
            prompt.push_str(TURN_CLOSE);
            prompt.push(' ');
            prompt.push_str(&turn.response);
            prompt.push(' ');
            prompt.push_str(SEQ_END);
            prompt.push_str(SEQ_START);
            prompt.push_str(TURN_OPEN);
            prompt.push(' ');
        }
        prompt.push_str(input);
        prompt.push(' ');
        prompt.push_str(TURN_CLOSE);
        prompt
    }
}
