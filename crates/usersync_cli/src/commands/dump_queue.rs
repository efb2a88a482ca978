//! Dump queue command implementation.

use super::{load_queue, open_prefs};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use usersync_engine::Operation;
use usersync_storage::PreferenceStore;

/// Pending operation representation for output.
#[derive(Debug, Serialize)]
pub struct QueuedOperation {
    /// Position in the queue.
    pub position: usize,
    /// Whether every id the call needs is already promoted.
    pub executable: bool,
    /// The operation, ids rewritten with the recorded promotions.
    #[serde(flatten)]
    pub operation: Operation,
}

/// Runs the dump-queue command.
pub fn run(path: &Path, limit: Option<usize>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let prefs = open_prefs(path)?;
    let operations = queued_operations(&prefs, limit);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&operations)?);
        }
        _ => {
            print_text_output(&operations);
        }
    }

    Ok(())
}

/// Returns up to `limit` pending operations in queue order.
pub fn queued_operations(prefs: &Arc<dyn PreferenceStore>, limit: Option<usize>) -> Vec<QueuedOperation> {
    load_queue(prefs)
        .pending_operations()
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .enumerate()
        .map(|(position, operation)| QueuedOperation {
            position,
            executable: operation.can_start_execute(),
            operation,
        })
        .collect()
}

fn print_text_output(operations: &[QueuedOperation]) {
    if operations.is_empty() {
        println!("Queue is empty");
        return;
    }
    for queued in operations {
        let state = if queued.executable { "ready" } else { "waiting for id" };
        println!(
            "{:>4}  {:<40}  {:<14}  {}",
            queued.position, queued.operation.id, state, queued.operation
        );
    }
    println!();
    println!("{} operation(s)", operations.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use usersync_core::id::create_local_id;
    use usersync_engine::OperationName;
    use usersync_storage::InMemoryPreferences;

    #[test]
    fn lists_in_queue_order_with_limit() {
        let prefs: Arc<dyn PreferenceStore> = Arc::new(InMemoryPreferences::new());
        let local = create_local_id();
        {
            let queue = load_queue(&prefs);
            queue.enqueue(Operation::login_user("app", &local, Some("alice"), None), true);
            queue.enqueue(Operation::set_tag("app", &local, "k", "v"), false);
            queue.enqueue(Operation::refresh_user("app", "user-1"), false);
        }

        let all = queued_operations(&prefs, None);
        let names: Vec<_> = all.iter().map(|q| q.operation.name()).collect();
        assert_eq!(
            names,
            vec![
                OperationName::LoginUser,
                OperationName::SetTag,
                OperationName::RefreshUser,
            ]
        );
        assert!(all[0].executable);
        assert!(!all[1].executable);

        let first_two = queued_operations(&prefs, Some(2));
        assert_eq!(first_two.len(), 2);
    }

    #[test]
    fn json_output_flattens_the_operation() {
        let prefs: Arc<dyn PreferenceStore> = Arc::new(InMemoryPreferences::new());
        load_queue(&prefs).enqueue(Operation::set_tag("app", "user-1", "k", "v"), false);

        let json = serde_json::to_value(queued_operations(&prefs, None)).unwrap();
        assert_eq!(json[0]["name"], "set_tag");
        assert_eq!(json[0]["position"], 0);
        assert_eq!(json[0]["key"], "k");
    }
}
