//! Structured judge calls with a parse-retry budget.

use serde_json::Value;

use crate::config::EvalPolicy;
use crate::error::StageError;
use crate::llm::InvokeRequest;
use crate::scheduler::NoopObserver;
use crate::utils::extract_json_object;

use super::prompts::PARSE_RETRY_SUFFIX;
use super::StageContext;

/// Result of asking one judge one question.
#[derive(Debug, Clone)]
pub enum JudgeOutcome<T> {
    Parsed { value: T, reason: Option<String> },
    /// Output stayed malformed after every parse retry.
    Unparseable(String),
    /// The provider call itself failed.
    Failed(StageError),
}

/// Asks `judge` and parses its JSON answer with `parse`.
///
/// Malformed output is re-asked up to `eval.retries` times; each re-ask is a
/// full provider call through the run's controller.
pub async fn ask_judge<T, F>(
    ctx: &StageContext,
    eval: &EvalPolicy,
    judge: &str,
    system: &str,
    prompt: &str,
    parse: F,
) -> JudgeOutcome<T>
where
    F: Fn(&Value) -> Option<T>,
{
    let adapter = match ctx.registry.resolve(judge) {
        Ok(adapter) => adapter,
        Err(e) => return JudgeOutcome::Failed(e),
    };

    let mut user = prompt.to_string();
    let mut last_problem = String::new();

    for parse_attempt in 0..=eval.retries {
        let request = InvokeRequest::new(judge, user.clone(), eval.timeout)
            .with_system(system)
            .with_temperature(eval.temperature)
            .with_max_output_tokens(eval.max_output_tokens)
            .with_json_mode(eval.strict_json);

        let output = match ctx
            .run
            .controller()
            .call(adapter.as_ref(), &request, &ctx.retry, &NoopObserver)
            .await
        {
            Ok(output) => output,
            Err(e) => return JudgeOutcome::Failed(e),
        };

        match extract_json_object(&output.output, eval.strict_json) {
            Ok(json) => match parse(&json) {
                Some(value) => {
                    let reason = json
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    return JudgeOutcome::Parsed { value, reason };
                }
                None => last_problem = "JSON did not have the expected fields".to_string(),
            },
            Err(e) => last_problem = e.to_string(),
        }

        tracing::debug!(
            run_id = %ctx.run.id(),
            judge = %judge,
            attempt = parse_attempt + 1,
            problem = %last_problem,
            "Unparseable judge output"
        );
        if !user.ends_with(PARSE_RETRY_SUFFIX) {
            user.push_str(PARSE_RETRY_SUFFIX);
        }
    }

    JudgeOutcome::Unparseable(last_problem)
}

/// Reads a number that a model may have emitted as a string.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
