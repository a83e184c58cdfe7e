//! Table rendering helpers shared by the command handlers.

use comfy_table::{presets::UTF8_FULL, Table};

use crate::domain::models::{Evaluation, FailedTGAlloc};

pub fn eval_table(evals: &[Evaluation]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "JOB", "PRIORITY", "STATUS", "TRIGGERED BY"]);
    for eval in evals {
        table.add_row(vec![
            eval.id.to_string(),
            eval.job_id.to_string(),
            eval.priority.to_string(),
            format!("{:?}", eval.status),
            format!("{:?}", eval.triggered_by),
        ]);
    }
    table
}

pub fn failed_tg_alloc_table(failures: &[FailedTGAlloc]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["TASK GROUP", "NODES EVALUATED", "NODES FILTERED", "EXHAUSTED"]);
    for f in failures {
        table.add_row(vec![
            f.task_group.clone(),
            f.metrics.nodes_evaluated.to_string(),
            f.metrics.nodes_filtered.to_string(),
            f.metrics.nodes_exhausted.join(", "),
        ]);
    }
    table
}
