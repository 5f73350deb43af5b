use tasktrack_rs::model::job::{BatchAction, Job};
use tasktrack_rs::model::task::{Priority, Status, StatusCounts, TaskFilter, TaskId};

#[test]
fn status_parses_and_displays_round_trip() {
    for status in Status::ALL {
        let parsed: Status = status.to_string().parse().unwrap();
        assert_eq!(parsed, status);
    }
}

#[test]
fn unrecognized_status_fails_to_parse() {
    assert!("archived".parse::<Status>().is_err());
    assert!("".parse::<Status>().is_err());
}

#[test]
fn priority_parses_and_displays_round_trip() {
    for priority in [Priority::Low, Priority::Medium, Priority::High] {
        let parsed: Priority = priority.to_string().parse().unwrap();
        assert_eq!(parsed, priority);
    }
}

#[test]
fn job_payload_uses_kind_tag() {
    let id = TaskId::new();
    let job = Job::StatusUpdate {
        task_id: id,
        status: Status::Completed,
    };

    let value = serde_json::to_value(&job).unwrap();
    assert_eq!(value["kind"], "status_update");
    assert_eq!(value["status"], "completed");

    let back: Job = serde_json::from_value(value).unwrap();
    assert_eq!(back, job);
    assert_eq!(back.task_id(), id);
}

#[test]
fn job_with_unrecognized_status_fails_to_deserialize() {
    let raw = serde_json::json!({
        "kind": "status_update",
        "task_id": TaskId::new(),
        "status": "exploded",
    });

    assert!(serde_json::from_value::<Job>(raw).is_err());
}

#[test]
fn job_with_unknown_kind_fails_to_deserialize() {
    let raw = serde_json::json!({
        "kind": "reticulate",
        "task_id": TaskId::new(),
    });

    assert!(serde_json::from_value::<Job>(raw).is_err());
}

#[test]
fn batch_action_parses_known_values_only() {
    assert_eq!("complete".parse::<BatchAction>().unwrap(), BatchAction::Complete);
    assert_eq!("delete".parse::<BatchAction>().unwrap(), BatchAction::Delete);
    assert!("archive".parse::<BatchAction>().is_err());
}

#[test]
fn filter_defaults_and_offset() {
    let filter = TaskFilter::default();
    assert_eq!(filter.page(), 1);
    assert_eq!(filter.limit(), 20);
    assert_eq!(filter.offset(), 0);

    let filter = TaskFilter {
        page: 3,
        limit: 50,
        ..TaskFilter::default()
    };
    assert_eq!(filter.offset(), 100);
}

#[test]
fn status_counts_total() {
    let counts = StatusCounts {
        pending: 2,
        in_progress: 3,
        completed: 5,
    };
    assert_eq!(counts.total(), 10);
}
