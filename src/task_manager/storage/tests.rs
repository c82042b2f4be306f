use super::*;
use crate::task_manager::models::ReminderSettings;
use chrono::{Duration, TimeZone, Utc};

async fn test_store() -> TaskStore {
    let pool = crate::db::memory_pool().await.expect("sqlite memory");
    TaskStore::new(pool)
}

fn sample_task(realm: &str, name: &str, schedule: DateTime<Utc>) -> Task {
    Task {
        id: uuid::Uuid::new_v4().to_string(),
        realm_id: realm.to_string(),
        name: name.to_string(),
        description: Some("write the weekly report".to_string()),
        priority: 3,
        difficulty: 2,
        status: TaskStatus::Pending,
        schedule_time: schedule,
        duration_minutes: 30,
        deadline: schedule + Duration::minutes(30),
        start_time: None,
        end_time: None,
        tags: vec!["work".to_string()],
        is_repeating: false,
        recurrence: None,
        instance_count: 0,
        parent_task_id: None,
        reminder: ReminderSettings::default(),
        created_by: "user-1".to_string(),
        created_at: schedule,
        updated_by: "user-1".to_string(),
        updated_at: schedule,
    }
}

#[tokio::test]
async fn insert_and_reload_preserves_recurrence() {
    let store = test_store().await;
    let schedule = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let mut task = sample_task("r1", "standup", schedule);
    task.is_repeating = true;
    task.recurrence = Some(RecurrenceRule {
        pattern: RepeatPattern::Weekly,
        interval: 1,
        days_of_week: vec![chrono::Weekday::Mon, chrono::Weekday::Fri],
        day_of_month: 0,
        end_date: Some(schedule + Duration::days(60)),
        max_count: 10,
    });
    task.reminder.methods = vec![DeliveryMethod::Email, DeliveryMethod::Webhook];

    store.insert_task(&task).await.expect("insert");
    let loaded = store
        .get_task("r1", &task.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(loaded, task);

    assert!(store.get_task("r2", &task.id).await.expect("get").is_none());
}

#[tokio::test]
async fn list_filters_by_tag_and_search() {
    let store = test_store().await;
    let base = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();
    let mut a = sample_task("r1", "Quarterly budget", base);
    a.tags = vec!["finance".to_string()];
    let b = sample_task("r1", "Gym", base + Duration::hours(1));
    let c = sample_task("r2", "Budget for other realm", base);
    for task in [&a, &b, &c] {
        store.insert_task(task).await.expect("insert");
    }

    let by_tag = store
        .list_tasks(
            "r1",
            ListTasksRequest {
                tag: Some("FINANCE".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("list");
    assert_eq!(by_tag.len(), 1);
    assert_eq!(by_tag[0].id, a.id);

    let by_search = store
        .list_tasks(
            "r1",
            ListTasksRequest {
                search: Some("budget".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("search");
    assert_eq!(by_search.len(), 1);

    let all = store.list_tasks("r1", ListTasksRequest::default()).await.expect("all");
    assert_eq!(all.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), vec!["Quarterly budget", "Gym"]);
}

#[tokio::test]
async fn page_far_past_the_end_is_empty() {
    let store = test_store().await;
    let schedule = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    store
        .insert_task(&sample_task("r1", "only", schedule))
        .await
        .expect("insert");

    let page = store
        .list_tasks(
            "r1",
            ListTasksRequest {
                page: Some(i64::MAX),
                page_size: Some(500),
                ..Default::default()
            },
        )
        .await
        .expect("huge page");
    assert!(page.is_empty());
}

#[tokio::test]
async fn update_is_guarded_by_expected_status() {
    let store = test_store().await;
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let mut task = sample_task("r1", "deploy", now);
    store.insert_task(&task).await.expect("insert");

    task.status = TaskStatus::Running;
    task.start_time = Some(now);
    store
        .update_task(&task, TaskStatus::Pending)
        .await
        .expect("first transition");

    let err = store
        .update_task(&task, TaskStatus::Pending)
        .await
        .expect_err("stale status");
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn instance_batch_bumps_counter_and_detects_races() {
    let store = test_store().await;
    let start = Utc.with_ymd_and_hms(2024, 4, 1, 7, 0, 0).unwrap();
    let mut parent = sample_task("r1", "water plants", start);
    parent.is_repeating = true;
    parent.recurrence = Some(RecurrenceRule {
        pattern: RepeatPattern::Daily,
        interval: 1,
        days_of_week: Vec::new(),
        day_of_month: 0,
        end_date: None,
        max_count: 0,
    });
    store.insert_task(&parent).await.expect("parent");

    let children: Vec<Task> = (0..3)
        .map(|day| {
            let mut child = sample_task("r1", "water plants", start + Duration::days(day));
            child.parent_task_id = Some(parent.id.clone());
            child
        })
        .collect();
    store
        .insert_instances(&parent.id, 0, &children)
        .await
        .expect("batch");

    let reloaded = store.get_task_by_id(&parent.id).await.expect("get").expect("exists");
    assert_eq!(reloaded.instance_count, 3);
    assert_eq!(
        store.latest_child_schedule(&parent.id).await.expect("latest"),
        Some(start + Duration::days(2))
    );
    assert_eq!(
        store
            .count_upcoming_children(&parent.id, start + Duration::hours(1))
            .await
            .expect("count"),
        2
    );

    let err = store
        .insert_instances(&parent.id, 0, &children[..1])
        .await
        .expect_err("stale counter");
    assert!(matches!(err, AppError::Conflict(_)));

    assert!(store.delete_task("r1", &children[0].id).await.expect("delete child"));
    let reloaded = store.get_task_by_id(&parent.id).await.expect("get").expect("exists");
    assert_eq!(reloaded.instance_count, 2);

    assert!(store.delete_task("r1", &parent.id).await.expect("delete parent"));
    assert!(store.get_task_by_id(&children[1].id).await.expect("get").is_none());
    assert!(!store.delete_task("r1", &parent.id).await.expect("delete again"));
}
