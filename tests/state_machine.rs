// tests/state_machine.rs
//! Property tests for task status transitions

use proptest::prelude::*;
use taskflow_engine::{Task, TaskStatus};

#[derive(Debug, Clone, Copy)]
enum Op {
    Run,
    Complete,
    Fail,
    Cancel,
    Retry,
}

impl Op {
    fn target(self) -> TaskStatus {
        match self {
            Op::Run => TaskStatus::Running,
            Op::Complete => TaskStatus::Completed,
            Op::Fail => TaskStatus::Failed,
            Op::Cancel => TaskStatus::Cancelled,
            Op::Retry => TaskStatus::Pending,
        }
    }

    fn apply(self, task: &mut Task) -> bool {
        let outcome = match self {
            Op::Run => task.mark_running(),
            Op::Complete => task.mark_completed(Some("ok".to_string()), Some(0)),
            Op::Fail => task.mark_failed("boom", Some(1)),
            Op::Cancel => task.mark_cancelled(),
            Op::Retry => task.reset_for_retry(),
        };
        outcome.is_ok()
    }
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Run),
        Just(Op::Complete),
        Just(Op::Fail),
        Just(Op::Cancel),
        Just(Op::Retry),
    ]
}

proptest! {
    #[test]
    fn transitions_follow_the_edge_table(ops in prop::collection::vec(op(), 1..40)) {
        let mut task = Task::new("prop", "true");

        for op in ops {
            let before = task.clone();
            let legal = before.status.can_transition_to(op.target());
            let applied = op.apply(&mut task);

            prop_assert_eq!(applied, legal);
            if applied {
                prop_assert_eq!(task.status, op.target());
            } else {
                prop_assert_eq!(&task, &before);
            }

            match task.status {
                TaskStatus::Pending => {
                    prop_assert!(task.started_at.is_none());
                    prop_assert!(task.finished_at.is_none());
                    prop_assert_eq!(task.progress, 0.0);
                }
                TaskStatus::Running => {
                    prop_assert!(task.started_at.is_some());
                    prop_assert!(task.finished_at.is_none());
                }
                status => {
                    prop_assert!(status.is_terminal());
                    prop_assert!(task.finished_at.is_some());
                    prop_assert!(task.duration_ms.is_some());
                }
            }
        }
    }

    #[test]
    fn terminal_states_only_leave_through_retry(
        terminal in prop_oneof![
            Just(TaskStatus::Completed),
            Just(TaskStatus::Failed),
            Just(TaskStatus::Cancelled),
        ]
    ) {
        for next in TaskStatus::ALL {
            let allowed = terminal.can_transition_to(next);
            prop_assert_eq!(allowed, next == TaskStatus::Pending);
        }
    }
}
