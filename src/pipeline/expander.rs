//! Expansion of a resolved config into generation tasks.

use uuid::Uuid;

use crate::config::PipelineConfig;

use super::types::Task;

/// Namespace for task ids, so they never collide with other v5 ids.
const TASK_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_29c4_8e0b_4d57_9b3e_c0d2_71a5_f8e6);

/// Deterministic id for one (document, generator, model, iteration) tuple.
pub fn task_id(document_id: &str, generator: &str, model: &str, iteration: u32) -> String {
    let key = format!("{}\u{1f}{}\u{1f}{}\u{1f}{}", document_id, generator, model, iteration);
    Uuid::new_v5(&TASK_NAMESPACE, key.as_bytes()).to_string()
}

/// Expands a config into its generation tasks.
///
/// Produces `|documents| × Σ|models| × iterations` tasks ordered by
/// document, then generator, then model, then iteration. Expanding the same
/// config twice yields identical ids.
pub fn expand(config: &PipelineConfig) -> Vec<Task> {
    let mut tasks = Vec::with_capacity(config.generation_task_count());

    for document_id in &config.documents {
        for generator in &config.generators {
            for model in &generator.models {
                for iteration in 1..=config.iterations {
                    let id = task_id(document_id, &generator.name, model, iteration);
                    tasks.push(Task::new(id, document_id, &generator.name, model, iteration));
                }
            }
        }
    }

    tracing::debug!(
        config = %config.name,
        tasks = tasks.len(),
        "Expanded pipeline config into generation tasks"
    );
    tasks
}
