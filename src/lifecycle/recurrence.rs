//! Successor generation for recurring tasks.
//!
//! Monthly and yearly steps clamp to the last valid day of the target month,
//! so a task due 2024-01-31 repeating monthly is next due 2024-02-29. The
//! successor records the anchor day (31) in its rule, and the occurrence
//! after that lands on 2024-03-31 again.

use crate::config::Workflow;
use crate::error::{Error, Result};
use crate::tasks::{
    Frequency, HistoryEntry, NewTask, Recurrence, Subtask, Task, TaskFilter, TaskStore,
};
use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Utc};
use tracing::{debug, info};

/// What the generator did for one completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecurrenceOutcome {
    /// A successor was created.
    Created(Task),
    /// A successor for this completion already exists (id given).
    AlreadyGenerated(String),
    /// The next occurrence would fall after the rule's `until` date.
    SeriesEnded,
    /// The task has no recurrence rule.
    NotRecurring,
}

impl Recurrence {
    /// The occurrence following one due on `from`.
    ///
    /// Returns `None` if the result is outside chrono's date range.
    pub fn next_due(&self, from: NaiveDate) -> Option<NaiveDate> {
        let interval = self.interval.max(1);
        let anchor = self.day_of_month.unwrap_or_else(|| from.day());
        match self.frequency {
            Frequency::Daily => from.checked_add_days(Days::new(u64::from(interval))),
            Frequency::Weekly => from.checked_add_days(Days::new(7 * u64::from(interval))),
            Frequency::Monthly => add_months_clamped(from, interval, anchor),
            Frequency::Yearly => add_months_clamped(from, interval.checked_mul(12)?, anchor),
        }
    }

    /// The rule with its anchor day fixed, for month-based frequencies.
    #[must_use]
    pub fn anchored(&self, from: NaiveDate) -> Self {
        let mut rule = self.clone();
        if matches!(rule.frequency, Frequency::Monthly | Frequency::Yearly)
            && rule.day_of_month.is_none()
        {
            rule.day_of_month = Some(from.day());
        }
        rule
    }

    /// Whether an occurrence on `date` is still part of the series.
    pub fn allows(&self, date: NaiveDate) -> bool {
        self.until.map_or(true, |until| date <= until)
    }
}

/// Move `months` months forward and land on `day`, clamped to the month's length.
pub fn add_months_clamped(date: NaiveDate, months: u32, day: u32) -> Option<NaiveDate> {
    let first = date.with_day(1)?.checked_add_months(Months::new(months))?;
    let last = first.checked_add_months(Months::new(1))?.pred_opt()?.day();
    first.with_day(day.clamp(1, last))
}

/// Idempotency token identifying one completion of `task_id`.
pub fn recurrence_token(task_id: &str, completed_at: DateTime<Utc>) -> String {
    format!("{task_id}@{}", completed_at.to_rfc3339())
}

/// Build the successor of `parent`, due on `due`.
pub fn successor(
    parent: &Task,
    rule: &Recurrence,
    due: NaiveDate,
    token: String,
    workflow: &Workflow,
) -> NewTask {
    NewTask {
        organization_id: parent.organization_id.clone(),
        title: parent.title.clone(),
        description: parent.description.clone(),
        status: Some(workflow.initial.clone()),
        priority: parent.priority,
        labels: parent.labels.clone(),
        assignee_ids: parent.assignee_ids.clone(),
        recurring: Some(rule.clone()),
        due_date: Some(due),
        subtasks: parent
            .subtasks
            .iter()
            .map(|s| Subtask { title: s.title.clone(), completed: false })
            .collect(),
        custom_fields: parent.custom_fields.clone(),
        history: vec![HistoryEntry::now(format!(
            "created by recurrence from task {}",
            parent.id
        ))],
        recurrence_token: Some(token),
        recurred_from: Some(parent.id.clone()),
        ..NewTask::default()
    }
}

/// Create the successor of a task that just completed, at most once per
/// completion.
///
/// # Errors
///
/// Returns an error if the store fails or the next date is out of range.
pub fn on_task_completed(
    task: &Task,
    store: &dyn TaskStore,
    workflow: &Workflow,
) -> Result<RecurrenceOutcome> {
    let Some(ref rule) = task.recurring else {
        return Ok(RecurrenceOutcome::NotRecurring);
    };

    let completed_at = task.completed_at.unwrap_or(task.updated_at);
    let token = recurrence_token(&task.id, completed_at);
    if let Some(existing) = find_by_token(store, task, &token)? {
        debug!(task = %task.id, successor = %existing, "Successor already generated");
        return Ok(RecurrenceOutcome::AlreadyGenerated(existing));
    }

    let base = task.due_date.unwrap_or_else(|| completed_at.date_naive());
    let next = rule.next_due(base).ok_or_else(|| {
        Error::validation(format!("next occurrence of task {} is out of range", task.id))
    })?;
    if !rule.allows(next) {
        info!(task = %task.id, next = %next, "Recurring series ended");
        return Ok(RecurrenceOutcome::SeriesEnded);
    }

    let new = successor(task, &rule.anchored(base), next, token.clone(), workflow);
    match store.create_task(new) {
        Ok(created) => {
            info!(task = %task.id, successor = %created.id, due = %next, "Created recurrence successor");
            Ok(RecurrenceOutcome::Created(created))
        }
        // Lost the race to a concurrent retry of the same completion
        Err(Error::Conflict { .. }) => match find_by_token(store, task, &token)? {
            Some(existing) => Ok(RecurrenceOutcome::AlreadyGenerated(existing)),
            None => Err(Error::Transient(format!("recurrence token {token} conflicted"))),
        },
        Err(err) => Err(err),
    }
}

fn find_by_token(store: &dyn TaskStore, task: &Task, token: &str) -> Result<Option<String>> {
    let filter = TaskFilter::recurrence_token(token).in_organization(&task.organization_id);
    Ok(store.query_tasks(&filter)?.into_iter().next().map(|t| t.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Priority, Relation, RelationType, TaskPatch, TaskWrite};
    use crate::testing::MemoryTaskStore;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn completed_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-03T09:00:00Z").unwrap().with_timezone(&Utc)
    }

    /// Create a recurring task and mark it done.
    fn completed_recurring(store: &MemoryTaskStore, rule: Recurrence, due: Option<NaiveDate>) -> Task {
        let task = store
            .create_task(NewTask {
                status: Some("In Progress".to_string()),
                recurring: Some(rule),
                due_date: due,
                priority: Priority::High,
                labels: vec!["ops".to_string()],
                assignee_ids: vec!["sam".to_string()],
                subtasks: vec![Subtask { title: "check logs".to_string(), completed: true }],
                relations: vec![Relation { task_id: "x".to_string(), kind: RelationType::RelatedTo }],
                blocked_by: BTreeSet::from(["y".to_string()]),
                ..NewTask::new("acme", "Weekly report")
            })
            .unwrap();
        store
            .atomic_batch(&[TaskWrite::guarded(
                &task,
                TaskPatch {
                    status: Some("Done".to_string()),
                    completed_at: Some(Some(completed_at())),
                    ..Default::default()
                },
            )])
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_monthly_clamps_to_month_end() {
        let rule = Recurrence::every(1, Frequency::Monthly);
        assert_eq!(rule.next_due(date(2024, 1, 31)), Some(date(2024, 2, 29)));
        assert_eq!(rule.next_due(date(2023, 1, 31)), Some(date(2023, 2, 28)));
        assert_eq!(rule.next_due(date(2024, 3, 31)), Some(date(2024, 4, 30)));
    }

    #[test]
    fn test_monthly_anchor_prevents_drift() {
        let rule = Recurrence::every(1, Frequency::Monthly).anchored(date(2024, 1, 31));
        assert_eq!(rule.day_of_month, Some(31));

        let feb = rule.next_due(date(2024, 1, 31)).unwrap();
        assert_eq!(feb, date(2024, 2, 29));
        assert_eq!(rule.next_due(feb), Some(date(2024, 3, 31)));
    }

    #[test]
    fn test_daily_weekly_yearly() {
        assert_eq!(
            Recurrence::every(1, Frequency::Weekly).next_due(date(2024, 6, 3)),
            Some(date(2024, 6, 10))
        );
        assert_eq!(
            Recurrence::every(3, Frequency::Daily).next_due(date(2024, 12, 30)),
            Some(date(2025, 1, 2))
        );
        assert_eq!(
            Recurrence::every(2, Frequency::Weekly).next_due(date(2024, 6, 3)),
            Some(date(2024, 6, 17))
        );
        assert_eq!(
            Recurrence::every(1, Frequency::Yearly).next_due(date(2024, 2, 29)),
            Some(date(2025, 2, 28))
        );
        assert_eq!(
            Recurrence::every(4, Frequency::Yearly).next_due(date(2024, 2, 29)),
            Some(date(2028, 2, 29))
        );
    }

    #[test]
    fn test_anchored_leaves_day_based_rules_alone() {
        let rule = Recurrence::every(1, Frequency::Weekly).anchored(date(2024, 1, 31));
        assert_eq!(rule.day_of_month, None);
    }

    #[test]
    fn test_token_format() {
        assert_eq!(
            recurrence_token("weekly-report-00000001", completed_at()),
            "weekly-report-00000001@2024-06-03T09:00:00+00:00"
        );
    }

    #[test]
    fn test_successor_fields() {
        let store = MemoryTaskStore::new();
        let workflow = Workflow::default();
        let parent = completed_recurring(
            &store,
            Recurrence::every(1, Frequency::Weekly),
            Some(date(2024, 6, 3)),
        );

        let RecurrenceOutcome::Created(next) = on_task_completed(&parent, &store, &workflow).unwrap()
        else {
            panic!("expected a successor");
        };

        assert_ne!(next.id, parent.id);
        assert_eq!(next.status, "Todo");
        assert_eq!(next.due_date, Some(date(2024, 6, 10)));
        assert_eq!(next.completed_at, None);
        assert_eq!(next.priority, Priority::High);
        assert_eq!(next.labels, parent.labels);
        assert_eq!(next.assignee_ids, parent.assignee_ids);
        assert!(next.relations.is_empty());
        assert!(next.blocked_by.is_empty());
        assert!(next.subtasks.iter().all(|s| !s.completed));
        assert_eq!(next.recurred_from.as_deref(), Some(parent.id.as_str()));
        assert_eq!(
            next.history.last().unwrap().message,
            format!("created by recurrence from task {}", parent.id)
        );
    }

    #[test]
    fn test_retry_does_not_duplicate() {
        let store = MemoryTaskStore::new();
        let workflow = Workflow::default();
        let parent = completed_recurring(
            &store,
            Recurrence::every(1, Frequency::Weekly),
            Some(date(2024, 6, 3)),
        );

        let RecurrenceOutcome::Created(first) = on_task_completed(&parent, &store, &workflow).unwrap()
        else {
            panic!("expected a successor");
        };
        assert_eq!(
            on_task_completed(&parent, &store, &workflow).unwrap(),
            RecurrenceOutcome::AlreadyGenerated(first.id)
        );

        let generated = store
            .query_tasks(&TaskFilter { status: Some("Todo".to_string()), ..Default::default() })
            .unwrap();
        assert_eq!(generated.len(), 1);
    }

    #[test]
    fn test_base_date_falls_back_to_completion() {
        let store = MemoryTaskStore::new();
        let parent = completed_recurring(&store, Recurrence::every(2, Frequency::Daily), None);
        let outcome = on_task_completed(&parent, &store, &Workflow::default()).unwrap();
        let RecurrenceOutcome::Created(next) = outcome else {
            panic!("expected a successor");
        };
        assert_eq!(next.due_date, Some(date(2024, 6, 5)));
    }

    #[test]
    fn test_until_ends_series() {
        let store = MemoryTaskStore::new();
        let rule = Recurrence { until: Some(date(2024, 6, 9)), ..Recurrence::every(1, Frequency::Weekly) };
        let parent = completed_recurring(&store, rule, Some(date(2024, 6, 3)));
        assert_eq!(
            on_task_completed(&parent, &store, &Workflow::default()).unwrap(),
            RecurrenceOutcome::SeriesEnded
        );
    }

    #[test]
    fn test_not_recurring() {
        let store = MemoryTaskStore::new();
        let task = store
            .create_task(NewTask { status: Some("Done".to_string()), ..NewTask::new("acme", "Once") })
            .unwrap();
        assert_eq!(
            on_task_completed(&task, &store, &Workflow::default()).unwrap(),
            RecurrenceOutcome::NotRecurring
        );
    }

    #[test]
    fn test_successor_uses_org_initial_status() {
        let store = MemoryTaskStore::new();
        let workflow = Workflow {
            statuses: vec!["Open".to_string(), "Done".to_string()],
            initial: "Open".to_string(),
            complete: "Done".to_string(),
            cancelled: None,
        };
        let parent = completed_recurring(
            &store,
            Recurrence::every(1, Frequency::Monthly),
            Some(date(2024, 1, 31)),
        );
        let RecurrenceOutcome::Created(next) = on_task_completed(&parent, &store, &workflow).unwrap()
        else {
            panic!("expected a successor");
        };
        assert_eq!(next.status, "Open");
        assert_eq!(next.due_date, Some(date(2024, 2, 29)));
        assert_eq!(next.recurring.unwrap().day_of_month, Some(31));
    }

    proptest! {
        #[test]
        fn prop_monthly_lands_on_anchor_or_month_end(
            year in 1990i32..2100,
            month in 1u32..=12,
            day in 1u32..=28,
            anchor in 1u32..=31,
            interval in 1u32..=24,
        ) {
            let from = date(year, month, day);
            let rule = Recurrence { day_of_month: Some(anchor), ..Recurrence::every(interval, Frequency::Monthly) };
            let next = rule.next_due(from).unwrap();

            let months_between = (next.year() - from.year()) * 12 + next.month() as i32 - month as i32;
            prop_assert_eq!(months_between, interval as i32);

            let last = add_months_clamped(next, 0, 31).unwrap().day();
            prop_assert_eq!(next.day(), anchor.min(last));
        }

        #[test]
        fn prop_day_based_steps_are_exact(
            days_from_epoch in 0i64..40_000,
            interval in 1u32..=60,
            weekly in any::<bool>(),
        ) {
            let from = date(1990, 1, 1) + chrono::Duration::days(days_from_epoch);
            let frequency = if weekly { Frequency::Weekly } else { Frequency::Daily };
            let next = Recurrence::every(interval, frequency).next_due(from).unwrap();
            let step = if weekly { 7 * i64::from(interval) } else { i64::from(interval) };
            prop_assert_eq!((next - from).num_days(), step);
        }
    }
}
