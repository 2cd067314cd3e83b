//! Scheduler for time-driven switch jobs
//!
//! A one-second tick checks every enabled schedule against the local
//! wall clock. Each schedule keeps a small run state so it fires once
//! per qualifying minute, date or interval slot.

use crate::error::AutomationError;
use crate::executor::ActionExecutor;
use crate::model::{
    CreateScheduleRequest, Schedule, ScheduleId, ScheduleType, SwitchAction,
    UpdateScheduleRequest,
};
use crate::persistence;
use crate::timer::TimerService;
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Events emitted by the scheduler
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A schedule issued its command
    Fired {
        schedule_id: ScheduleId,
        command: SwitchAction,
    },
    /// A schedule run was skipped because the command could not be sent
    Failed {
        schedule_id: ScheduleId,
        error: String,
    },
    /// An interval schedule finished its window for the day
    Completed { schedule_id: ScheduleId },
    /// A schedule was created
    Created { schedule_id: ScheduleId },
    /// A schedule was updated
    Updated { schedule_id: ScheduleId },
    /// A schedule was deleted
    Deleted { schedule_id: ScheduleId },
}

/// Per-schedule bookkeeping, reset on update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RunState {
    /// Date of the last daily/weekly run
    last_date: Option<NaiveDate>,
    /// Last observed interval slot
    last_slot: Option<(NaiveDate, u64)>,
    /// Date the interval window was last reported complete
    completed_on: Option<NaiveDate>,
}

/// Result of checking one schedule at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Due {
    Skip,
    Fire,
    Complete,
}

/// Decide whether `schedule` is due at local time `now`
pub(crate) fn check(schedule: &Schedule, state: &mut RunState, now: NaiveDateTime) -> Due {
    let today = now.date();
    match schedule.schedule_type {
        ScheduleType::Once => {
            let (Ok(date), Ok(time)) = (schedule.run_date(), schedule.time_of_day()) else {
                return Due::Skip;
            };
            if now >= date.and_time(time) && state.last_date.is_none() {
                state.last_date = Some(today);
                Due::Fire
            } else {
                Due::Skip
            }
        }
        ScheduleType::Daily | ScheduleType::Weekly => {
            let Ok(time) = schedule.time_of_day() else {
                return Due::Skip;
            };
            if schedule.schedule_type == ScheduleType::Weekly {
                let weekday = now.weekday().num_days_from_monday() as u8;
                if !schedule.days_of_week.contains(&weekday) {
                    return Due::Skip;
                }
            }
            let at_time = now.hour() == time.hour() && now.minute() == time.minute();
            if at_time && state.last_date != Some(today) {
                state.last_date = Some(today);
                Due::Fire
            } else {
                Due::Skip
            }
        }
        ScheduleType::Interval => {
            let interval = schedule.interval_secs();
            if interval == 0 {
                return Due::Skip;
            }
            let elapsed = u64::from(now.num_seconds_from_midnight());
            let total = schedule.total_duration_secs();
            if total > 0 && elapsed > total {
                if state.completed_on == Some(today) {
                    return Due::Skip;
                }
                state.completed_on = Some(today);
                return Due::Complete;
            }

            let slot = (today, elapsed / interval);
            match state.last_slot {
                Some(last) if last == slot => Due::Skip,
                Some(_) => {
                    state.last_slot = Some(slot);
                    Due::Fire
                }
                None => {
                    // First look after load or update: only an exact boundary counts
                    state.last_slot = Some(slot);
                    if elapsed % interval == 0 {
                        Due::Fire
                    } else {
                        Due::Skip
                    }
                }
            }
        }
    }
}

/// Scheduler for managing time-driven switch jobs
pub struct Scheduler {
    schedules: Arc<DashMap<ScheduleId, Schedule>>,
    runs: DashMap<ScheduleId, RunState>,
    executor: Arc<ActionExecutor>,
    timers: Arc<TimerService>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<SchedulerEvent>,
    data_path: Option<PathBuf>,
}

impl Scheduler {
    /// Create a scheduler, loading schedules from `data_path` if given
    pub async fn new(
        executor: Arc<ActionExecutor>,
        timers: Arc<TimerService>,
        data_path: Option<PathBuf>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let schedules = Arc::new(DashMap::new());

        if let Some(path) = &data_path {
            for schedule in persistence::load_list::<Schedule>(path).await {
                if let Err(e) = schedule.validate() {
                    tracing::warn!("Loaded schedule {} is invalid: {}", schedule.id, e);
                }
                schedules.insert(schedule.id, schedule);
            }
        }
        let next_id = schedules.iter().map(|s| *s.key()).max().unwrap_or(0) + 1;

        Self {
            schedules,
            runs: DashMap::new(),
            executor,
            timers,
            next_id: AtomicU64::new(next_id),
            event_tx,
            data_path,
        }
    }

    /// Start the one-second tick
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!("Scheduler started with {} schedules", scheduler.schedules.len());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.tick(Local::now().naive_local()).await;
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("Scheduler shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Subscribe to scheduler events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Evaluate every enabled schedule at local time `now`
    pub async fn tick(&self, now: NaiveDateTime) {
        let mut due = Vec::new();
        for entry in self.schedules.iter() {
            let schedule = entry.value();
            if !schedule.enabled {
                continue;
            }
            let mut run = self.runs.entry(schedule.id).or_default();
            match check(schedule, &mut run, now) {
                Due::Skip => {}
                Due::Fire => due.push(schedule.clone()),
                Due::Complete => {
                    tracing::info!("Interval schedule '{}' finished for today", schedule.name);
                    let _ = self.event_tx.send(SchedulerEvent::Completed {
                        schedule_id: schedule.id,
                    });
                }
            }
        }

        for schedule in due {
            self.fire(&schedule).await;
            if schedule.schedule_type == ScheduleType::Once {
                self.finish_once(schedule.id).await;
            }
        }
    }

    /// Issue the schedule's command and arm auto-off if configured
    async fn fire(&self, schedule: &Schedule) {
        tracing::info!(
            "Executing schedule '{}' ({}): {} {}",
            schedule.name,
            schedule.id,
            schedule.switch_name,
            schedule.action
        );

        let command = match self
            .executor
            .switch(schedule.device_id, &schedule.switch_name, schedule.action)
            .await
        {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Schedule '{}' skipped: {}", schedule.name, e);
                let _ = self.event_tx.send(SchedulerEvent::Failed {
                    schedule_id: schedule.id,
                    error: e.to_string(),
                });
                return;
            }
        };

        if command == SwitchAction::On {
            if let Some(duration) = schedule.run_duration() {
                if let Err(e) = self
                    .timers
                    .arm(schedule.device_id, &schedule.switch_name, duration)
                {
                    tracing::warn!("Schedule '{}' could not arm auto-off: {}", schedule.name, e);
                }
            }
        }

        let _ = self.event_tx.send(SchedulerEvent::Fired {
            schedule_id: schedule.id,
            command,
        });
    }

    /// Disable a one-time schedule after its run
    async fn finish_once(&self, id: ScheduleId) {
        if let Some(mut schedule) = self.schedules.get_mut(&id) {
            schedule.enabled = false;
        }
        if let Err(e) = self.save().await {
            tracing::warn!("Failed to save schedules: {}", e);
        }
        let _ = self.event_tx.send(SchedulerEvent::Updated { schedule_id: id });
    }

    async fn save(&self) -> Result<(), AutomationError> {
        if let Some(path) = &self.data_path {
            persistence::save_list(path, &self.list()).await?;
        }
        Ok(())
    }

    /// Get all schedules, ordered by id
    pub fn list(&self) -> Vec<Schedule> {
        let mut schedules: Vec<Schedule> =
            self.schedules.iter().map(|r| r.value().clone()).collect();
        schedules.sort_by_key(|s| s.id);
        schedules
    }

    /// Get schedule by ID
    pub fn get(&self, id: ScheduleId) -> Option<Schedule> {
        self.schedules.get(&id).map(|r| r.value().clone())
    }

    /// Create a new schedule
    pub async fn create(&self, request: CreateScheduleRequest) -> Result<Schedule, AutomationError> {
        let mut schedule = Schedule::from_request(0, request);
        schedule.validate()?;
        schedule.id = self.next_id.fetch_add(1, Ordering::SeqCst);

        self.schedules.insert(schedule.id, schedule.clone());
        self.save().await?;

        let _ = self.event_tx.send(SchedulerEvent::Created {
            schedule_id: schedule.id,
        });
        tracing::info!("Created schedule: {} ({})", schedule.name, schedule.id);
        Ok(schedule)
    }

    /// Update a schedule
    pub async fn update(
        &self,
        id: ScheduleId,
        request: UpdateScheduleRequest,
    ) -> Result<Schedule, AutomationError> {
        let mut schedule = self.get(id).ok_or(AutomationError::ScheduleNotFound(id))?;
        schedule.apply_update(request);
        schedule.validate()?;

        self.schedules.insert(id, schedule.clone());
        self.runs.remove(&id);
        self.save().await?;

        let _ = self.event_tx.send(SchedulerEvent::Updated { schedule_id: id });
        tracing::info!("Updated schedule: {}", id);
        Ok(schedule)
    }

    /// Delete a schedule
    pub async fn delete(&self, id: ScheduleId) -> Result<Schedule, AutomationError> {
        let (_, schedule) = self
            .schedules
            .remove(&id)
            .ok_or(AutomationError::ScheduleNotFound(id))?;
        self.runs.remove(&id);
        self.save().await?;

        let _ = self.event_tx.send(SchedulerEvent::Deleted { schedule_id: id });
        tracing::info!("Deleted schedule: {} ({})", schedule.name, id);
        Ok(schedule)
    }

    /// Enable or disable a schedule
    pub async fn set_enabled(&self, id: ScheduleId, enabled: bool) -> Result<Schedule, AutomationError> {
        self.update(
            id,
            UpdateScheduleRequest {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimeUnit;
    use crate::testing::{harness, object, Harness};
    use chrono::NaiveTime;
    use serde_json::json;

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .unwrap()
            .and_time(NaiveTime::parse_from_str(time, "%H:%M:%S").unwrap())
    }

    fn schedule(value: serde_json::Value) -> Schedule {
        let request: CreateScheduleRequest = serde_json::from_value(value).unwrap();
        Schedule::from_request(1, request)
    }

    fn interval(value: u64, total: u64) -> Schedule {
        let mut s = schedule(json!({
            "name": "pulse", "device_id": 1, "schedule_type": "interval"
        }));
        s.interval_value = value;
        s.interval_unit = TimeUnit::Seconds;
        s.total_duration_value = total;
        s.total_duration_unit = TimeUnit::Seconds;
        s
    }

    async fn scheduler(h: &Harness) -> Scheduler {
        let timers = Arc::new(TimerService::new(h.executor.clone()));
        Scheduler::new(h.executor.clone(), timers, None).await
    }

    #[test]
    fn test_interval_fires_on_boundaries_until_window_ends() {
        let s = interval(10, 30);
        let mut state = RunState::default();
        let midnight = at("2024-05-01", "00:00:00");

        let fired: Vec<i64> = (0..=60)
            .filter(|secs| {
                let now = midnight + chrono::Duration::seconds(*secs);
                check(&s, &mut state, now) == Due::Fire
            })
            .collect();
        assert_eq!(fired, vec![0, 10, 20, 30]);
    }

    #[test]
    fn test_interval_window_completes_once_per_day() {
        let s = interval(10, 30);
        let mut state = RunState::default();
        let midnight = at("2024-05-01", "00:00:00");

        let results: Vec<Due> = (0..=40)
            .map(|secs| check(&s, &mut state, midnight + chrono::Duration::seconds(secs)))
            .collect();
        assert_eq!(results.iter().filter(|d| **d == Due::Complete).count(), 1);
        assert_eq!(results[31], Due::Complete);

        // Next day starts over at midnight
        let next = at("2024-05-02", "00:00:00");
        assert_eq!(check(&s, &mut state, next), Due::Fire);
    }

    #[test]
    fn test_interval_first_look_off_boundary_waits() {
        let s = interval(10, 0);
        let mut state = RunState::default();
        let now = at("2024-05-01", "08:00:03");

        assert_eq!(check(&s, &mut state, now), Due::Skip);
        assert_eq!(
            check(&s, &mut state, now + chrono::Duration::seconds(7)),
            Due::Fire
        );
    }

    #[test]
    fn test_interval_skipped_ticks_still_fire_new_slot() {
        let s = interval(10, 0);
        let mut state = RunState::default();
        assert_eq!(check(&s, &mut state, at("2024-05-01", "08:00:00")), Due::Fire);
        assert_eq!(check(&s, &mut state, at("2024-05-01", "08:00:13")), Due::Fire);
        assert_eq!(check(&s, &mut state, at("2024-05-01", "08:00:19")), Due::Skip);
    }

    #[test]
    fn test_daily_fires_once_per_day() {
        let s = schedule(json!({
            "name": "wake", "device_id": 1, "schedule_type": "daily", "time": "07:30"
        }));
        let mut state = RunState::default();
        let start = at("2024-05-01", "07:29:58");

        let fires = (0..70)
            .filter(|secs| {
                check(&s, &mut state, start + chrono::Duration::seconds(*secs)) == Due::Fire
            })
            .count();
        assert_eq!(fires, 1);
        assert_eq!(check(&s, &mut state, at("2024-05-02", "07:30:00")), Due::Fire);
    }

    #[test]
    fn test_weekly_respects_days() {
        // 2024-05-06 is a Monday
        let s = schedule(json!({
            "name": "mon-wed", "device_id": 1, "schedule_type": "weekly",
            "time": "18:00", "days_of_week": [0, 2]
        }));
        let mut state = RunState::default();
        assert_eq!(check(&s, &mut state, at("2024-05-06", "18:00:00")), Due::Fire);
        assert_eq!(check(&s, &mut state, at("2024-05-07", "18:00:00")), Due::Skip);
        assert_eq!(check(&s, &mut state, at("2024-05-08", "18:00:30")), Due::Fire);
    }

    #[test]
    fn test_once_fires_when_due() {
        let s = schedule(json!({
            "name": "once", "device_id": 1, "schedule_type": "once",
            "time": "12:00", "date": "2024-05-01"
        }));
        let mut state = RunState::default();
        assert_eq!(check(&s, &mut state, at("2024-05-01", "11:59:59")), Due::Skip);
        assert_eq!(check(&s, &mut state, at("2024-05-01", "12:00:01")), Due::Fire);
        assert_eq!(check(&s, &mut state, at("2024-05-01", "12:00:02")), Due::Skip);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_with_auto_off() {
        let h = harness();
        let pump = h.device("pump");
        let scheduler = scheduler(&h).await;
        let mut events = scheduler.subscribe();

        scheduler
            .create(
                serde_json::from_value(json!({
                    "name": "water", "device_id": pump, "schedule_type": "daily",
                    "time": "06:00", "switch_name": "POWER1",
                    "duration": 30, "duration_unit": "seconds"
                }))
                .unwrap(),
            )
            .await
            .unwrap();
        assert!(matches!(events.recv().await.unwrap(), SchedulerEvent::Created { .. }));

        scheduler.tick(at("2024-05-01", "06:00:00")).await;
        scheduler.tick(at("2024-05-01", "06:00:01")).await;
        assert_eq!(h.bus.count("cmnd/pump/POWER1", "ON"), 1);
        assert!(h.store.timer(pump, "POWER1").is_some());
        assert!(matches!(
            events.recv().await.unwrap(),
            SchedulerEvent::Fired { command: SwitchAction::On, .. }
        ));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(h.bus.count("cmnd/pump/POWER1", "OFF"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_to_off_does_not_arm() {
        let h = harness();
        let pump = h.device("pump");
        h.store.merge_attributes(pump, object(json!({"POWER": "ON"})));
        let scheduler = scheduler(&h).await;

        scheduler
            .create(
                serde_json::from_value(json!({
                    "name": "flip", "device_id": pump, "schedule_type": "daily",
                    "time": "06:00", "action": "TOGGLE", "duration": 5
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        scheduler.tick(at("2024-05-01", "06:00:00")).await;
        assert_eq!(h.bus.count("cmnd/pump/POWER", "OFF"), 1);
        assert!(h.store.timer(pump, "POWER").is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_skips_run() {
        let h = harness();
        let pump = h.device("pump");
        let lamp = h.device("lamp");
        h.bus.fail_on("cmnd/pump/POWER");
        let scheduler = scheduler(&h).await;
        let mut events = scheduler.subscribe();

        for device_id in [pump, lamp] {
            scheduler
                .create(
                    serde_json::from_value(json!({
                        "name": "evening", "device_id": device_id,
                        "schedule_type": "daily", "time": "19:00", "duration": 5
                    }))
                    .unwrap(),
                )
                .await
                .unwrap();
        }

        scheduler.tick(at("2024-05-01", "19:00:00")).await;
        assert_eq!(h.bus.count("cmnd/lamp/POWER", "ON"), 1);
        assert!(h.store.timer(pump, "POWER").is_none());

        let mut failed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SchedulerEvent::Failed { .. }) {
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_once_disables_itself() {
        let h = harness();
        let pump = h.device("pump");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        let timers = Arc::new(TimerService::new(h.executor.clone()));
        let scheduler = Scheduler::new(h.executor.clone(), timers.clone(), Some(path.clone())).await;

        let created = scheduler
            .create(
                serde_json::from_value(json!({
                    "name": "once", "device_id": pump, "schedule_type": "once",
                    "time": "12:00", "date": "2024-05-01", "action": "OFF"
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        scheduler.tick(at("2024-05-01", "12:00:00")).await;
        scheduler.tick(at("2024-05-01", "12:00:05")).await;
        assert_eq!(h.bus.count("cmnd/pump/POWER", "OFF"), 1);
        assert!(!scheduler.get(created.id).unwrap().enabled);

        let reloaded = Scheduler::new(h.executor.clone(), timers, Some(path)).await;
        assert!(!reloaded.get(created.id).unwrap().enabled);
    }

    #[tokio::test]
    async fn test_crud() {
        let h = harness();
        let scheduler = scheduler(&h).await;

        let invalid: CreateScheduleRequest = serde_json::from_value(json!({
            "name": "bad", "device_id": 1, "schedule_type": "interval",
            "interval_value": 1, "duration": 2
        }))
        .unwrap();
        assert!(scheduler.create(invalid).await.is_err());

        let created = scheduler
            .create(
                serde_json::from_value(json!({
                    "name": "a", "device_id": 1, "schedule_type": "daily", "time": "08:00"
                }))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(created.id, 1);

        let updated = scheduler
            .update(
                created.id,
                UpdateScheduleRequest {
                    time: Some("09:15".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.time.as_deref(), Some("09:15"));

        assert!(scheduler
            .update(
                created.id,
                UpdateScheduleRequest {
                    time: Some("25:00".to_string()),
                    ..Default::default()
                },
            )
            .await
            .is_err());

        let disabled = scheduler.set_enabled(created.id, false).await.unwrap();
        assert!(!disabled.enabled);

        scheduler.delete(created.id).await.unwrap();
        assert!(scheduler.get(created.id).is_none());
        assert!(matches!(
            scheduler.delete(created.id).await,
            Err(AutomationError::ScheduleNotFound(1))
        ));
    }
}
