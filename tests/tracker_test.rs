//! Tracker behavior against in-memory and file-backed SQLite.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use workflow_tracker::{
    EventKind, FlushReport, Identifier, NewStep, Status, TrackerConfig, WorkflowFilter,
    WorkflowPage, WorkflowTracker,
};

/// In-memory tracker whose flush timer never fires during a test.
async fn tracker() -> WorkflowTracker {
    WorkflowTracker::connect(TrackerConfig::in_memory().batch_delay(Duration::from_secs(3600)))
        .await
        .unwrap()
}

fn ident(key: &str, value: &str) -> Identifier {
    Identifier::new(key, value)
}

// ---------------------------------------------------------------------------
// Buffered steps
// ---------------------------------------------------------------------------

#[tokio::test]
async fn flushed_steps_come_back_in_call_order() {
    let tracker = tracker().await;
    let wf = tracker.start_workflow("import", vec![]).await.unwrap();

    let names: Vec<String> = (0..25).map(|i| format!("step-{i}")).collect();
    for (i, name) in names.iter().enumerate() {
        assert!(wf.add_step(name, Some(json!({ "i": i }))).is_some());
    }
    assert_eq!(tracker.pending_steps(), 25);

    let report = tracker.flush_batch_inserts().await;
    assert_eq!(report, FlushReport { persisted: 25, dropped: 0 });

    let steps = tracker.get_steps(&wf).await;
    let got: Vec<String> = steps.iter().map(|s| s.step.clone()).collect();
    assert_eq!(got, names);
    assert_eq!(steps[7].data["i"], 7);
    assert!(steps.windows(2).all(|w| w[0].created_at < w[1].created_at));
}

#[tokio::test]
async fn flushing_an_empty_buffer_does_nothing() {
    let tracker = tracker().await;
    let report = tracker.flush_batch_inserts().await;
    assert!(report.is_empty());
    assert_eq!(tracker.pending_steps(), 0);
}

#[tokio::test]
async fn timer_flushes_buffered_steps() {
    let tracker = WorkflowTracker::connect(
        TrackerConfig::in_memory().batch_delay(Duration::from_millis(20)),
    )
    .await
    .unwrap();
    let wf = tracker.start_workflow("timed", vec![]).await.unwrap();

    wf.add_step("one", None);
    wf.add_step("two", None);

    let mut steps = Vec::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        steps = wf.steps().await;
        if steps.len() == 2 {
            break;
        }
    }
    assert_eq!(steps.len(), 2);
    assert_eq!(tracker.pending_steps(), 0);
}

#[tokio::test]
async fn blank_step_name_is_rejected() {
    let tracker = tracker().await;
    let wf = tracker.start_workflow("w", vec![]).await.unwrap();

    assert!(wf.add_step("  ", None).is_none());
    assert_eq!(tracker.pending_steps(), 0);
    assert!(!wf.add_steps(vec![NewStep::new("ok"), NewStep::new("")]).await);
    assert!(wf.steps().await.is_empty());
}

#[tokio::test]
async fn add_steps_is_durable_on_return() {
    let tracker = tracker().await;
    let wf = tracker.start_workflow("w", vec![]).await.unwrap();

    let ok = wf
        .add_steps(vec![
            NewStep::new("extract").data(json!({"rows": 10})),
            NewStep::new("load"),
        ])
        .await;
    assert!(ok);
    assert_eq!(tracker.pending_steps(), 0);

    let steps = wf.steps().await;
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].step, "extract");
    assert_eq!(steps[0].data["rows"], 10);
    assert!(steps[1].data.is_null());
}

#[tokio::test]
async fn buffered_and_direct_steps_interleave_by_call_order() {
    let tracker = tracker().await;
    let wf = tracker.start_workflow("w", vec![]).await.unwrap();

    wf.add_step("buffered-first", None);
    wf.add_steps(vec![NewStep::new("direct")]).await;
    wf.add_step("buffered-last", None);
    tracker.flush_batch_inserts().await;

    let got: Vec<String> = wf.steps().await.into_iter().map(|s| s.step).collect();
    assert_eq!(got, ["buffered-first", "direct", "buffered-last"]);
}

#[tokio::test]
async fn steps_for_unknown_workflow_are_stored_as_orphans() {
    let tracker = tracker().await;
    let ghost = workflow_tracker::WorkflowId::new();

    assert!(tracker.add_step(ghost, "lost", None).is_some());
    assert_eq!(tracker.flush_batch_inserts().await.persisted, 1);
    assert_eq!(tracker.get_steps(ghost).await.len(), 1);

    // Orphans never count toward workflow stats.
    assert_eq!(tracker.get_workflow_stats().await.avg_steps, 0.0);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn started_workflow_is_found_by_identifier() {
    let tracker = tracker().await;
    let wf = tracker
        .start_workflow("w", vec![ident("a", "1")])
        .await
        .unwrap();

    let found = tracker.get_workflow_by_identifier("a", "1").await.unwrap();
    assert_eq!(found.id, wf.id());
    assert_eq!(found.status, Status::Pending);
    assert!(found.ended_at.is_none());

    assert!(tracker.get_workflow_by_identifier("a", "2").await.is_none());
    assert!(tracker.get_workflow_by_identifier("b", "1").await.is_none());
}

#[tokio::test]
async fn completed_workflow_has_end_time() {
    let tracker = tracker().await;
    let wf = tracker
        .start_workflow("w", vec![ident("a", "1")])
        .await
        .unwrap();

    assert!(tracker.complete_workflow(&wf).wait().await);

    let found = tracker.get_workflow_by_identifier("a", "1").await.unwrap();
    assert_eq!(found.status, Status::Completed);
    let ended = found.ended_at.unwrap();
    assert!(ended >= found.started_at);
}

#[tokio::test]
async fn terminal_status_is_written_once() {
    let tracker = tracker().await;
    let wf = tracker.start_workflow("w", vec![]).await.unwrap();

    assert!(wf.fail(Some("boom")).wait().await);
    let first = wf.workflow().await.unwrap();

    assert!(!wf.complete().wait().await);
    assert!(!wf.fail(None).wait().await);

    let after = wf.workflow().await.unwrap();
    assert_eq!(after.status, Status::Failed);
    assert_eq!(after.ended_at, first.ended_at);
}

#[tokio::test]
async fn completing_unknown_workflow_resolves_false() {
    let tracker = tracker().await;
    let ticket = tracker.complete_workflow(workflow_tracker::WorkflowId::new());
    assert!(!ticket.wait().await);
}

#[tokio::test]
async fn dropped_tickets_are_awaited_by_wait_for_pending_writes() {
    let tracker = tracker().await;
    let a = tracker.start_workflow("a", vec![]).await.unwrap();
    let b = tracker.start_workflow("b", vec![]).await.unwrap();

    let _ = a.complete();
    let _ = b.fail(None);
    tracker.wait_for_pending_writes().await;

    assert_eq!(a.workflow().await.unwrap().status, Status::Completed);
    assert_eq!(b.workflow().await.unwrap().status, Status::Failed);

    // Still usable afterwards.
    let c = tracker.start_workflow("c", vec![]).await.unwrap();
    assert!(c.complete().wait().await);
}

#[tokio::test]
async fn step_buffered_before_completion_is_invisible_until_flushed() {
    let tracker = tracker().await;
    let wf = tracker.start_workflow("w", vec![]).await.unwrap();

    wf.add_step("last-step", None);
    assert!(wf.complete().wait().await);

    // The workflow is already completed but its step is still buffered.
    assert_eq!(wf.workflow().await.unwrap().status, Status::Completed);
    assert!(wf.steps().await.is_empty());

    tracker.flush_batch_inserts().await;
    let steps = wf.steps().await;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].step, "last-step");
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn attach_identifier_rejects_duplicates() {
    let tracker = tracker().await;
    let wf = tracker
        .start_workflow("w", vec![ident("order", "42")])
        .await
        .unwrap();

    assert!(tracker.attach_identifier("order", "42", ident("invoice", "9")).await);
    let found = tracker.get_workflow_by_identifier("invoice", "9").await.unwrap();
    assert_eq!(found.id, wf.id());
    assert_eq!(found.identifiers, vec![ident("order", "42"), ident("invoice", "9")]);

    assert!(!tracker.attach_identifier("order", "42", ident("invoice", "9")).await);
}

#[tokio::test]
async fn attach_identifier_fails_for_missing_workflow_or_blank_pair() {
    let tracker = tracker().await;
    tracker
        .start_workflow("w", vec![ident("order", "42")])
        .await
        .unwrap();

    assert!(!tracker.attach_identifier("order", "nope", ident("x", "1")).await);
    assert!(!tracker.attach_identifier("order", "42", ident("", "1")).await);
    assert!(!tracker.attach_identifier("order", "42", ident("x", " ")).await);
}

#[tokio::test]
async fn handle_attaches_to_its_own_workflow() {
    let tracker = tracker().await;
    let wf = tracker.start_workflow("w", vec![]).await.unwrap();

    assert!(wf.attach_identifier(ident("run", "7")).await);
    assert!(!wf.attach_identifier(ident("run", "7")).await);
    assert_eq!(
        tracker.get_workflow_by_identifier("run", "7").await.unwrap().id,
        wf.id()
    );
}

#[tokio::test]
async fn concurrent_attaches_keep_every_identifier() {
    let tracker = tracker().await;
    let wf = tracker
        .start_workflow("w", vec![ident("order", "42")])
        .await
        .unwrap();

    let mut attaches = tokio::task::JoinSet::new();
    for i in 0..10 {
        let tracker = tracker.clone();
        attaches.spawn(async move {
            let added = ident("tag", &i.to_string());
            let ok = tracker.attach_identifier("order", "42", added.clone()).await;
            (ok, added)
        });
    }
    let mut attached = HashSet::new();
    while let Some(joined) = attaches.join_next().await {
        let (ok, added) = joined.unwrap();
        if ok {
            attached.insert(added.value);
        }
    }

    let stored: HashSet<String> = wf
        .workflow()
        .await
        .unwrap()
        .identifiers
        .into_iter()
        .filter(|i| i.key == "tag")
        .map(|i| i.value)
        .collect();
    assert_eq!(attached.len(), 10);
    assert_eq!(stored, attached);
}

#[tokio::test]
async fn identifier_lookup_returns_the_oldest_match() {
    let tracker = tracker().await;
    let first = tracker
        .start_workflow("first", vec![ident("batch", "b1")])
        .await
        .unwrap();
    tracker
        .start_workflow("second", vec![ident("batch", "b1")])
        .await
        .unwrap();

    let found = tracker.get_workflow_by_identifier("batch", "b1").await.unwrap();
    assert_eq!(found.id, first.id());
}

#[tokio::test]
async fn steps_by_identifier_are_grouped_by_workflow() {
    let tracker = tracker().await;
    let a = tracker
        .start_workflow("a", vec![ident("tenant", "t1")])
        .await
        .unwrap();
    let b = tracker
        .start_workflow("b", vec![ident("tenant", "t1")])
        .await
        .unwrap();
    let other = tracker
        .start_workflow("c", vec![ident("tenant", "t2")])
        .await
        .unwrap();

    b.add_step("b1", None);
    a.add_step("a1", None);
    other.add_step("c1", None);
    b.add_step("b2", None);
    a.add_step("a2", None);
    tracker.flush_batch_inserts().await;

    let got: Vec<String> = tracker
        .get_steps_by_identifier("tenant", "t1")
        .await
        .into_iter()
        .map(|s| s.step)
        .collect();
    assert_eq!(got, ["a1", "a2", "b1", "b2"]);
}

// ---------------------------------------------------------------------------
// Deletes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_removes_workflow_and_its_steps_only() {
    let tracker = tracker().await;
    let doomed = tracker.start_workflow("doomed", vec![]).await.unwrap();
    let kept = tracker.start_workflow("kept", vec![]).await.unwrap();

    doomed.add_step("x", None);
    doomed.add_step("y", None);
    kept.add_step("z", None);
    tracker.flush_batch_inserts().await;

    assert!(tracker.delete_workflow(&doomed).await);
    assert!(tracker.get_workflow(&doomed).await.is_none());
    assert!(tracker.get_steps(&doomed).await.is_empty());

    assert!(tracker.get_workflow(&kept).await.is_some());
    assert_eq!(tracker.get_steps(&kept).await.len(), 1);

    assert!(!doomed.delete().await);
}

#[tokio::test]
async fn delete_all_wipes_both_tables() {
    let tracker = tracker().await;
    for i in 0..3 {
        let wf = tracker.start_workflow(&format!("w{i}"), vec![]).await.unwrap();
        wf.add_step("s", None);
    }
    tracker.flush_batch_inserts().await;

    assert!(tracker.delete_all_workflows().await);
    assert_eq!(tracker.get_workflow_stats().await, Default::default());
    assert!(tracker.get_most_frequent_steps(10).await.is_empty());
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fifteen_workflows_paginate_into_three_pages() {
    let tracker = tracker().await;
    for i in 0..15 {
        tracker.start_workflow(&format!("w{i}"), vec![]).await.unwrap();
    }

    let mut seen = HashSet::new();
    for page in 1..=3 {
        let result = tracker
            .get_workflows(&WorkflowFilter::new().page(page, 5))
            .await;
        assert_eq!(result.workflows.len(), 5);
        assert_eq!(result.total, 15);
        assert_eq!(result.total_pages, 3);
        assert_eq!(result.page, page);
        assert_eq!(result.page_size, 5);
        for wf in result.workflows {
            assert!(seen.insert(wf.id), "page {page} repeated a workflow");
        }
    }
    assert_eq!(seen.len(), 15);

    let beyond = tracker
        .get_workflows(&WorkflowFilter::new().page(4, 5))
        .await;
    assert!(beyond.workflows.is_empty());
    assert_eq!(beyond.total, 15);
}

#[tokio::test]
async fn default_listing_is_newest_first() {
    let tracker = tracker().await;
    for name in ["old", "mid", "new"] {
        tracker.start_workflow(name, vec![]).await.unwrap();
    }

    let page = tracker.get_workflows(&WorkflowFilter::new()).await;
    let names: Vec<&str> = page.workflows.iter().map(|w| w.name.as_str()).collect();
    assert_eq!(names, ["new", "mid", "old"]);
    assert_eq!(page.page_size, 10);
    assert_eq!(page.total_pages, 1);
}

#[tokio::test]
async fn listing_filters_combine() {
    let tracker = tracker().await;
    let nightly = tracker
        .start_workflow("nightly-import", vec![ident("env", "prod")])
        .await
        .unwrap();
    let hourly = tracker
        .start_workflow("hourly-import", vec![ident("env", "prod")])
        .await
        .unwrap();
    tracker
        .start_workflow("nightly-export", vec![ident("env", "dev")])
        .await
        .unwrap();

    nightly.add_step("validate", None);
    tracker.flush_batch_inserts().await;
    assert!(hourly.complete().wait().await);

    let by_name = tracker
        .get_workflows(&WorkflowFilter::new().name("nightly"))
        .await;
    assert_eq!(by_name.total, 2);

    let by_identifier = tracker
        .get_workflows(&WorkflowFilter::new().identifier("env", "prod"))
        .await;
    assert_eq!(by_identifier.total, 2);

    let by_status = tracker
        .get_workflows(&WorkflowFilter::new().status(Status::Completed))
        .await;
    assert_eq!(by_status.total, 1);
    assert_eq!(by_status.workflows[0].id, hourly.id());

    let by_step = tracker
        .get_workflows(&WorkflowFilter::new().step("validate"))
        .await;
    assert_eq!(by_step.total, 1);
    assert_eq!(by_step.workflows[0].id, nightly.id());

    let combined = tracker
        .get_workflows(
            &WorkflowFilter::new()
                .name("import")
                .identifier("env", "prod")
                .status(Status::Pending),
        )
        .await;
    assert_eq!(combined.total, 1);
    assert_eq!(combined.workflows[0].id, nightly.id());
}

#[tokio::test]
async fn name_filter_treats_wildcards_literally() {
    let tracker = tracker().await;
    let sale = tracker.start_workflow("50% off", vec![]).await.unwrap();
    tracker.start_workflow("500 off", vec![]).await.unwrap();
    let snake = tracker.start_workflow("load_users", vec![]).await.unwrap();
    tracker.start_workflow("loadXusers", vec![]).await.unwrap();

    let page = tracker.get_workflows(&WorkflowFilter::new().name("50%")).await;
    assert_eq!(page.total, 1);
    assert_eq!(page.workflows[0].id, sale.id());

    let page = tracker.get_workflows(&WorkflowFilter::new().name("d_u")).await;
    assert_eq!(page.total, 1);
    assert_eq!(page.workflows[0].id, snake.id());
}

#[tokio::test]
async fn huge_page_size_lists_everything_on_one_page() {
    let tracker = tracker().await;
    tracker.start_workflow("a", vec![]).await.unwrap();
    tracker.start_workflow("b", vec![]).await.unwrap();

    let page = tracker
        .get_workflows(&WorkflowFilter::new().page(1, i64::MAX))
        .await;
    assert_eq!(page.total, 2);
    assert_eq!(page.total_pages, 1);
    assert_eq!(page.workflows.len(), 2);
}

#[tokio::test]
async fn date_range_is_inclusive_then_exclusive() {
    let tracker = tracker().await;
    let a = tracker.start_workflow("a", vec![]).await.unwrap();
    let b = tracker.start_workflow("b", vec![]).await.unwrap();
    let c = tracker.start_workflow("c", vec![]).await.unwrap();

    let b_start = b.workflow().await.unwrap().started_at;
    let c_start = c.workflow().await.unwrap().started_at;

    let page = tracker
        .get_workflows(&WorkflowFilter::new().started_between(Some(b_start), Some(c_start)))
        .await;
    assert_eq!(page.total, 1);
    assert_eq!(page.workflows[0].id, b.id());

    let from_b = tracker
        .get_workflows(&WorkflowFilter::new().started_between(Some(b_start), None))
        .await;
    assert_eq!(from_b.total, 2);
    assert!(from_b.workflows.iter().all(|w| w.id != a.id()));
}

#[tokio::test]
async fn ordering_by_end_time_puts_open_workflows_last() {
    let tracker = tracker().await;
    let open = tracker.start_workflow("open", vec![]).await.unwrap();
    let first_done = tracker.start_workflow("first", vec![]).await.unwrap();
    let second_done = tracker.start_workflow("second", vec![]).await.unwrap();

    assert!(first_done.complete().wait().await);
    assert!(second_done.fail(None).wait().await);

    for order in ["asc", "desc"] {
        let page = tracker
            .get_workflows(&WorkflowFilter::new().order_by("ended_at", order))
            .await;
        assert_eq!(page.workflows.last().unwrap().id, open.id(), "order {order}");
    }

    let asc = tracker
        .get_workflows(&WorkflowFilter::new().order_by("ended_at", "asc"))
        .await;
    assert_eq!(asc.workflows[0].id, first_done.id());
}

#[tokio::test]
async fn invalid_listing_requests_return_the_fallback_page() {
    let tracker = tracker().await;
    tracker.start_workflow("w", vec![]).await.unwrap();

    let bad_order = tracker
        .get_workflows(&WorkflowFilter::new().order_by("name", "asc"))
        .await;
    assert_page_is_fallback(&bad_order);

    let bad_direction = tracker
        .get_workflows(&WorkflowFilter::new().order_by("started_at", "sideways"))
        .await;
    assert_page_is_fallback(&bad_direction);

    let bad_page = tracker
        .get_workflows(&WorkflowFilter::new().page(0, 10))
        .await;
    assert_page_is_fallback(&bad_page);
}

fn assert_page_is_fallback(page: &WorkflowPage) {
    assert!(page.workflows.is_empty());
    assert_eq!(page.total, 0);
    assert_eq!(page.page, 1);
    assert_eq!(page.page_size, 10);
    assert_eq!(page.total_pages, 0);
}

#[tokio::test]
async fn filter_deserializes_from_query_shaped_json() {
    let tracker = tracker().await;
    tracker
        .start_workflow("nightly", vec![ident("env", "prod")])
        .await
        .unwrap();

    let filter: WorkflowFilter = serde_json::from_value(json!({
        "status": "pending",
        "identifier": { "key": "env", "value": "prod" },
        "pageSize": 5,
        "orderBy": "started_at",
        "order": "asc"
    }))
    .unwrap();

    let page = tracker.get_workflows(&filter).await;
    assert_eq!(page.total, 1);
    assert_eq!(page.page_size, 5);
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stats_average_steps_over_all_workflows() {
    let tracker = tracker().await;
    let done = tracker.start_workflow("done", vec![]).await.unwrap();
    let open = tracker.start_workflow("open", vec![]).await.unwrap();

    done.add_step("a", None);
    done.add_step("b", None);
    open.add_step("a", None);
    tracker.flush_batch_inserts().await;
    assert!(done.complete().wait().await);

    let stats = tracker.get_workflow_stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.avg_steps, 1.5);

    // A workflow with no steps joins the denominator.
    tracker.start_workflow("empty", vec![]).await.unwrap();
    assert_eq!(tracker.get_workflow_stats().await.avg_steps, 1.0);
}

#[tokio::test]
async fn most_frequent_steps_are_ranked_by_count() {
    let tracker = tracker().await;
    let wf = tracker.start_workflow("w", vec![]).await.unwrap();
    for name in ["a", "a", "a", "b", "b", "c"] {
        wf.add_step(name, None);
    }
    tracker.flush_batch_inserts().await;

    let top = tracker.get_most_frequent_steps(2).await;
    let got: Vec<(&str, i64)> = top.iter().map(|f| (f.step.as_str(), f.count)).collect();
    assert_eq!(got, [("a", 3), ("b", 2)]);

    assert!(tracker.get_most_frequent_steps(0).await.is_empty());
    assert!(tracker.get_most_frequent_steps(-3).await.is_empty());
}

#[tokio::test]
async fn most_frequent_ties_break_by_name() {
    let tracker = tracker().await;
    let wf = tracker.start_workflow("w", vec![]).await.unwrap();
    for name in ["zeta", "alpha", "mid", "zeta", "alpha", "mid"] {
        wf.add_step(name, None);
    }
    tracker.flush_batch_inserts().await;

    let names: Vec<String> = tracker
        .get_most_frequent_steps(3)
        .await
        .into_iter()
        .map(|f| f.step)
        .collect();
    assert_eq!(names, ["alpha", "mid", "zeta"]);
}

#[tokio::test]
async fn step_durations_cover_every_workflow() {
    let tracker = tracker().await;
    let busy = tracker.start_workflow("busy", vec![]).await.unwrap();
    let idle = tracker.start_workflow("idle", vec![]).await.unwrap();

    busy.add_step("begin", None);
    tokio::time::sleep(Duration::from_millis(15)).await;
    busy.add_step("end", None);
    tracker.flush_batch_inserts().await;

    let durations = tracker.get_average_step_duration().await;
    assert_eq!(durations.len(), 2);

    let busy_row = durations.iter().find(|d| d.workflow_id == busy.id()).unwrap();
    assert_eq!(busy_row.step_count, 2);
    assert!(busy_row.duration_ms.unwrap() >= 15);

    let idle_row = durations.iter().find(|d| d.workflow_id == idle.id()).unwrap();
    assert_eq!(idle_row.step_count, 0);
    assert!(idle_row.duration_ms.is_none());
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribers_see_each_accepted_change() {
    let tracker = tracker().await;
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let record = |prefix: &'static str| {
        let log = Arc::clone(&log);
        move |event: &workflow_tracker::Event| {
            let entry = match &event.kind {
                EventKind::WorkflowStarted { workflow } => format!("{prefix}:{}", workflow.name),
                EventKind::StepAdded { step } => format!("{prefix}:{}", step.step),
                EventKind::WorkflowCompleted { .. } => prefix.to_string(),
                EventKind::WorkflowFailed { reason, .. } => {
                    format!("{prefix}:{}", reason.as_deref().unwrap_or("-"))
                }
            };
            log.lock().unwrap().push(entry);
        }
    };
    tracker.on_workflow_started(record("started"));
    tracker.on_step_added(record("step"));
    tracker.on_workflow_completed(record("completed"));
    tracker.on_workflow_failed(record("failed"));

    let ok = tracker.start_workflow("ok", vec![]).await.unwrap();
    ok.add_step("s1", None);
    assert!(ok.complete().wait().await);

    let bad = tracker.start_workflow("bad", vec![]).await.unwrap();
    assert!(bad.fail(Some("timeout")).wait().await);
    // No second event for a rejected transition.
    assert!(!bad.complete().wait().await);

    assert_eq!(
        *log.lock().unwrap(),
        [
            "started:ok",
            "step:s1",
            "completed",
            "started:bad",
            "failed:timeout"
        ]
    );
}

#[tokio::test]
async fn panicking_subscriber_does_not_break_the_tracker() {
    let tracker = tracker().await;
    let calls = Arc::new(Mutex::new(0));

    tracker.on_workflow_started(|_| panic!("subscriber bug"));
    {
        let calls = Arc::clone(&calls);
        tracker.on_workflow_started(move |_| *calls.lock().unwrap() += 1);
    }

    let wf = tracker.start_workflow("w", vec![]).await.unwrap();
    assert!(tracker.get_workflow(&wf).await.is_some());
    assert_eq!(*calls.lock().unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Shutdown and persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn destroy_flushes_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tracker.db");
    let path = path.to_str().unwrap().to_string();

    let tracker = WorkflowTracker::connect(
        TrackerConfig::sqlite(&path).batch_delay(Duration::from_secs(3600)),
    )
    .await
    .unwrap();
    let wf = tracker
        .start_workflow("persisted", vec![ident("k", "v")])
        .await
        .unwrap();
    let id = wf.id();
    wf.add_step("buffered", Some(json!({"n": 1})));
    let _ = wf.complete();

    let report = tracker.destroy().await;
    assert_eq!(report.persisted, 1);
    assert!(tracker.is_destroyed());
    assert!(tracker.destroy().await.is_empty());

    assert!(tracker.add_step(id, "too-late", None).is_none());
    assert!(tracker.start_workflow("nope", vec![]).await.is_err());
    assert!(tracker.get_steps(id).await.is_empty());
    assert!(!tracker.complete_workflow(id).wait().await);

    let reopened = WorkflowTracker::connect(path).await.unwrap();
    let workflow = reopened.get_workflow(id).await.unwrap();
    assert_eq!(workflow.status, Status::Completed);
    assert_eq!(workflow.identifiers, vec![ident("k", "v")]);
    let steps = reopened.get_steps(id).await;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].data["n"], 1);
    reopened.destroy().await;
}

#[tokio::test]
async fn destroyed_tracker_returns_fallbacks_everywhere() {
    let tracker = tracker().await;
    let wf = tracker
        .start_workflow("w", vec![ident("order", "42")])
        .await
        .unwrap();
    wf.add_step("a", None);
    tracker.destroy().await;

    assert!(tracker.get_workflow(wf.id()).await.is_none());
    assert!(tracker.get_workflow_by_identifier("order", "42").await.is_none());
    assert!(tracker.get_steps_by_identifier("order", "42").await.is_empty());
    assert_page_is_fallback(&tracker.get_workflows(&WorkflowFilter::new()).await);
    assert_eq!(tracker.get_workflow_stats().await, Default::default());
    assert!(tracker.get_most_frequent_steps(5).await.is_empty());
    assert!(tracker.get_average_step_duration().await.is_empty());

    assert!(!tracker.attach_identifier("order", "42", ident("x", "1")).await);
    assert!(!wf.attach_identifier(ident("x", "1")).await);
    assert!(!tracker.add_steps(wf.id(), vec![NewStep::new("b")]).await);
    assert!(!wf.fail(Some("late")).wait().await);
    assert!(!tracker.delete_workflow(wf.id()).await);
    assert!(!tracker.delete_all_workflows().await);
    assert!(tracker.flush_batch_inserts().await.is_empty());
    tracker.wait_for_pending_writes().await;
}

#[tokio::test]
async fn legacy_null_mode_reads_absent_payloads_as_null() {
    let tracker = WorkflowTracker::connect(
        TrackerConfig::in_memory()
            .use_null_as_default(true)
            .batch_delay(Duration::from_secs(3600)),
    )
    .await
    .unwrap();
    let wf = tracker.start_workflow("w", vec![]).await.unwrap();

    wf.add_step("no-data", None);
    wf.add_step("data", Some(json!([1, 2])));
    tracker.flush_batch_inserts().await;

    let steps = wf.steps().await;
    assert!(steps[0].data.is_null());
    assert_eq!(steps[1].data, json!([1, 2]));
}

#[tokio::test]
async fn health_check_reports_pool_state() {
    let tracker = tracker().await;
    assert!(tracker.health_check().await);
    tracker.destroy().await;
    assert!(!tracker.health_check().await);
}
