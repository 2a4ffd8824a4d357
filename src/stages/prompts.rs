//! Prompts sent by the stage executors.

use crate::pipeline::GeneratedDocument;

pub const GENERATION_SYSTEM_PROMPT: &str = r#"You are a careful writer. You receive a source document and instructions describing what to produce from it. Respond with the produced document only, without preamble or commentary."#;

pub const SINGLE_EVAL_SYSTEM_PROMPT: &str = r#"You are an impartial judge grading a single document against explicit criteria.

Respond with a JSON object only, in one of these forms:
{"score": <number from 1 to 10>, "reason": "<one or two sentences>"}
{"evaluations": [{"criterion": "<name>", "score": <number from 1 to 10>, "reason": "<short>"}]}

Do not wrap the JSON in markdown and do not add any other text."#;

pub const PAIRWISE_SYSTEM_PROMPT: &str = r#"You are an impartial judge comparing two documents written from the same source. Judge content only; the order in which the documents are shown carries no meaning.

Respond with a JSON object only:
{"winner": "A" | "B" | "tie", "reason": "<one or two sentences>"}"#;

pub const COMBINE_SYSTEM_PROMPT: &str = r#"You merge several candidate documents into one document that keeps the strongest material of each. Candidates are listed best first. Respond with the merged document only."#;

/// Appended to a judge prompt after output that could not be parsed.
pub const PARSE_RETRY_SUFFIX: &str =
    "\n\nYour previous answer could not be parsed. Reply with the JSON object only.";

pub fn build_generation_prompt(source: &str, instructions: Option<&str>) -> String {
    match instructions {
        Some(instructions) => format!(
            "## Instructions\n\n{}\n\n## Source document\n\n{}",
            instructions, source
        ),
        None => format!("## Source document\n\n{}", source),
    }
}

pub fn build_single_eval_prompt(instructions: &str, criteria: &str, candidate: &str) -> String {
    format!(
        "## Instructions\n\n{}\n\n## Criteria\n\n{}\n\n## Document\n\n{}",
        instructions, criteria, candidate
    )
}

pub fn build_pairwise_prompt(
    instructions: &str,
    criteria: &str,
    doc_a: &str,
    doc_b: &str,
) -> String {
    format!(
        "## Instructions\n\n{}\n\n## Criteria\n\n{}\n\n## Document A\n\n{}\n\n## Document B\n\n{}",
        instructions, criteria, doc_a, doc_b
    )
}

pub fn build_combine_prompt(instructions: &str, source: &str, candidates: &[&GeneratedDocument]) -> String {
    let mut prompt = format!(
        "## Instructions\n\n{}\n\n## Source document\n\n{}\n",
        instructions, source
    );
    for (rank, candidate) in candidates.iter().enumerate() {
        prompt.push_str(&format!(
            "\n## Candidate {} ({})\n\n{}\n",
            rank + 1,
            candidate.model,
            candidate.content
        ));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_generation_prompt_without_instructions() {
        let prompt = build_generation_prompt("body", None);
        assert!(prompt.contains("body"));
        assert!(!prompt.contains("Instructions"));
    }

    #[test]
    fn test_combine_prompt_lists_candidates_in_rank_order() {
        let doc = |id: &str, content: &str| GeneratedDocument {
            id: id.to_string(),
            document_id: "d".to_string(),
            generator: "g".to_string(),
            model: format!("mock:{}", id),
            iteration: 1,
            content_ref: String::new(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let best = doc("best", "first text");
        let second = doc("second", "second text");
        let prompt = build_combine_prompt("merge", "src", &[&best, &second]);

        let first_at = prompt.find("first text").unwrap();
        let second_at = prompt.find("second text").unwrap();
        assert!(first_at < second_at);
        assert!(prompt.contains("Candidate 1 (mock:best)"));
    }
}
