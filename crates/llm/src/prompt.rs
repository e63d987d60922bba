use snafu::OptionExt;

use crate::error::{EngineResult, MissingRoleSnafu};
use crate::message::{PromptMessage, Role};

const SECTION_SEPARATOR: &str = "\n###\n";

/// Folds a chat history into the single prompt the engine generates from.
///
/// The engine is single-turn: only the system message and the last user message survive.
/// Each retrieval entry becomes a `given:` section between them, in input order.
pub fn build_prompt(messages: &[PromptMessage], rag_result: &[String]) -> EngineResult<String> {
    let system = messages
        .iter()
        .find(|message| message.role == Role::System)
        .context(MissingRoleSnafu {
            stage: "build-prompt-system",
            role: Role::System,
        })?;
    let question = messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .context(MissingRoleSnafu {
            stage: "build-prompt-question",
            role: Role::User,
        })?;

    let mut prompt = system.content.clone();
    for entry in rag_result {
        prompt.push_str(SECTION_SEPARATOR);
        prompt.push_str("given: ");
        prompt.push_str(entry);
    }
    prompt.push_str(SECTION_SEPARATOR);
    prompt.push_str("question: ");
    prompt.push_str(&question.content);

    Ok(prompt)
}

/// Returns the question section of a prompt produced by [`build_prompt`].
pub fn question_of(prompt: &str) -> &str {
    let marker = "\n###\nquestion: ";
    prompt
        .rfind(marker)
        .map_or(prompt, |start| &prompt[start + marker.len()..])
}
