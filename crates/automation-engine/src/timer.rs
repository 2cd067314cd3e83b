//! Auto-off timers
//!
//! One timer per (device, switch). Arming replaces the previous timer;
//! the deadline lives in the device store and a sleeping task issues OFF
//! when it passes. The task only acts if its arming is still the current
//! one, so a superseded or cancelled timer never switches anything off.

use crate::error::AutomationError;
use crate::executor::ActionExecutor;
use crate::model::{SwitchAction, MAX_RUN_DURATION};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tasmota_core::{ArmedTimer, DeviceId};
use tokio::task::JoinHandle;

type TimerKey = (DeviceId, String);

/// Auto-off timer service
pub struct TimerService {
    executor: Arc<ActionExecutor>,
    /// Sleeping expiry tasks with the token they were armed with
    tasks: Arc<DashMap<TimerKey, (u64, JoinHandle<()>)>>,
}

impl TimerService {
    /// Create a new timer service
    pub fn new(executor: Arc<ActionExecutor>) -> Self {
        Self {
            executor,
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// Arm (or re-arm) the auto-off timer for a switch
    pub fn arm(
        &self,
        device_id: DeviceId,
        switch_name: &str,
        duration: Duration,
    ) -> Result<ArmedTimer, AutomationError> {
        check_duration(duration)?;
        let deadline = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .ok_or_else(|| AutomationError::InvalidAction(format!("duration too long: {duration:?}")))?;
        let key = (device_id, switch_name.to_string());

        // The entry guard serialises concurrent arms of the same switch
        let entry = self.tasks.entry(key.clone());
        let timer = self
            .executor
            .network()
            .devices()
            .arm_timer(device_id, switch_name, deadline)
            .ok_or(AutomationError::DeviceNotFound(device_id))?;

        let executor = Arc::clone(&self.executor);
        let tasks = Arc::clone(&self.tasks);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            expire(&executor, &tasks, key, timer.token).await;
        });

        if let Entry::Occupied(previous) = &entry {
            previous.get().1.abort();
        }
        entry.insert((timer.token, handle));

        tracing::info!(
            "Armed auto-off for device {} {} in {:?}",
            device_id,
            switch_name,
            duration
        );
        Ok(timer)
    }

    /// Remove a timer without switching anything. Returns whether one was armed.
    pub fn cancel(&self, device_id: DeviceId, switch_name: &str) -> bool {
        let cancelled = self
            .executor
            .network()
            .devices()
            .cancel_timer(device_id, switch_name);
        if let Some((_, (_, handle))) = self.tasks.remove(&(device_id, switch_name.to_string())) {
            handle.abort();
        }
        if cancelled {
            tracing::info!("Cancelled auto-off for device {} {}", device_id, switch_name);
        }
        cancelled
    }

    /// Switch ON and arm the auto-off timer
    pub async fn start_timer(
        &self,
        device_id: DeviceId,
        switch_name: &str,
        duration: Duration,
    ) -> Result<ArmedTimer, AutomationError> {
        check_duration(duration)?;
        self.executor
            .switch(device_id, switch_name, SwitchAction::On)
            .await?;
        self.arm(device_id, switch_name, duration)
    }

    /// Number of sleeping expiry tasks
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }
}

fn check_duration(duration: Duration) -> Result<(), AutomationError> {
    if duration.is_zero() {
        return Err(AutomationError::InvalidAction(
            "timer duration must be positive".to_string(),
        ));
    }
    if duration > MAX_RUN_DURATION {
        return Err(AutomationError::InvalidAction(format!(
            "timer duration {}s exceeds the {}s limit",
            duration.as_secs(),
            MAX_RUN_DURATION.as_secs()
        )));
    }
    Ok(())
}

async fn expire(
    executor: &ActionExecutor,
    tasks: &DashMap<TimerKey, (u64, JoinHandle<()>)>,
    key: TimerKey,
    token: u64,
) {
    tasks.remove_if(&key, |_, (current, _)| *current == token);

    let (device_id, switch_name) = key;
    let claimed = executor
        .network()
        .devices()
        .claim_expired_timer(device_id, &switch_name, token);
    if !claimed {
        tracing::debug!(
            "Stale auto-off for device {} {} ignored",
            device_id,
            switch_name
        );
        return;
    }

    match executor
        .switch(device_id, &switch_name, SwitchAction::Off)
        .await
    {
        Ok(_) => tracing::info!("Auto-off fired for device {} {}", device_id, switch_name),
        Err(e) => tracing::warn!(
            "Auto-off for device {} {} failed: {}",
            device_id,
            switch_name,
            e
        ),
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().1.abort();
        }
    }
}
