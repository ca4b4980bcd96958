//! Context block construction for RAG prompts.
//!
//! Retrieved chunk contents are formatted into a system message with
//! numbered citations so the model can refer back to sources.

use super::types::Reference;

/// Character budget for the whole context block.
const MAX_CONTEXT_CHARS: usize = 4000;

const CONTEXT_PREAMBLE: &str =
    "Use the following excerpts from the user's documents to answer. \
     Cite sources where relevant. If the excerpts do not cover the question, say so.";

const EMPTY_CONTEXT_NOTE: &str =
    "No relevant documents were found for this query. Answer from general knowledge \
     and tell the user that their documents contain no relevant material.";

/// Build the system-message content for a RAG turn. An empty reference list
/// still produces an explicit context block so the turn keeps RAG semantics.
pub fn build_context_block(references: &[Reference]) -> String {
    if references.is_empty() {
        return EMPTY_CONTEXT_NOTE.to_string();
    }

    let mut context = String::from(CONTEXT_PREAMBLE);
    context.push_str("\n\n");
    let mut current_length = 0;

    for (i, reference) in references.iter().enumerate() {
        let content = reference
            .content
            .as_deref()
            .unwrap_or("(content not available)");

        // Extra for the citation line itself.
        let addition_length = content.len() + 50;
        if current_length + addition_length > MAX_CONTEXT_CHARS {
            break;
        }

        context.push_str(&format!(
            "[{}] (Source: {}, relevance: {:.2})\n{}\n\n",
            i + 1,
            reference.document_name,
            reference.similarity,
            content
        ));
        current_length += addition_length;
    }

    context.trim_end().to_string()
}
