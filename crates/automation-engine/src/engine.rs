//! Core automation engine

use crate::error::AutomationError;
use crate::evaluator::{self, SustainTracker, Transition};
use crate::executor::ActionExecutor;
use crate::log::ExecutionLog;
use crate::model::{
    Automation, AutomationId, CreateAutomationRequest, ExecutionRecord, Trigger,
    UpdateAutomationRequest,
};
use crate::persistence;
use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use dashmap::DashMap;
use mqtt_protocol::{payload, BusMessage};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tasmota_core::{DeviceEvent, DeviceId};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Events emitted by the automation engine
#[derive(Debug, Clone)]
pub enum AutomationEvent {
    /// An automation ran (successfully or not)
    Executed {
        automation_id: AutomationId,
        automation_name: String,
        success: bool,
        error: Option<String>,
    },
    /// An automation was created
    Created { automation_id: AutomationId },
    /// An automation was updated
    Updated { automation_id: AutomationId },
    /// An automation was deleted
    Deleted { automation_id: AutomationId },
}

/// The main automation engine
pub struct AutomationEngine {
    /// All registered automations
    automations: Arc<DashMap<AutomationId, Automation>>,
    /// Action executor
    executor: Arc<ActionExecutor>,
    /// Execution history
    log: Arc<ExecutionLog>,
    /// Sustain state of device state rules
    sustain: SustainTracker,
    /// Deadline tasks for pending sustain windows, keyed with the window start
    sustain_tasks: DashMap<AutomationId, (Instant, JoinHandle<()>)>,
    /// Last (date, hour, minute) each time rule fired
    time_fired: DashMap<AutomationId, (NaiveDate, u32, u32)>,
    next_id: AtomicU64,
    /// Event broadcaster
    event_tx: broadcast::Sender<AutomationEvent>,
    /// Path for persistence
    data_path: Option<PathBuf>,
}

impl AutomationEngine {
    /// Create a new automation engine, loading rules from `data_path` if given
    pub async fn new(
        executor: Arc<ActionExecutor>,
        log: Arc<ExecutionLog>,
        data_path: Option<PathBuf>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let automations = Arc::new(DashMap::new());

        if let Some(path) = &data_path {
            for automation in persistence::load_list::<Automation>(path).await {
                if let Err(e) = automation.validate() {
                    tracing::warn!("Loaded automation {} is invalid: {}", automation.id, e);
                }
                automations.insert(automation.id, automation);
            }
        }
        let next_id = automations.iter().map(|a| *a.key()).max().unwrap_or(0) + 1;

        Self {
            automations,
            executor,
            log,
            sustain: SustainTracker::new(),
            sustain_tasks: DashMap::new(),
            time_fired: DashMap::new(),
            next_id: AtomicU64::new(next_id),
            event_tx,
            data_path,
        }
    }

    /// Save automations to disk
    async fn save(&self) -> Result<(), AutomationError> {
        if let Some(path) = &self.data_path {
            persistence::save_list(path, &self.list()).await?;
        }
        Ok(())
    }

    /// Start the engine: bus listener, device listener and minute tick
    pub fn start(
        self: &Arc<Self>,
        bus_rx: broadcast::Receiver<BusMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let device_rx = self.executor.network().devices().subscribe();
        vec![
            self.start_bus_listener(bus_rx, shutdown.clone()),
            self.start_device_listener(device_rx, shutdown.clone()),
            self.start_time_loop(shutdown),
        ]
    }

    /// Subscribe to automation events
    pub fn subscribe(&self) -> broadcast::Receiver<AutomationEvent> {
        self.event_tx.subscribe()
    }

    /// Get all automations, ordered by id
    pub fn list(&self) -> Vec<Automation> {
        let mut automations: Vec<Automation> =
            self.automations.iter().map(|r| r.value().clone()).collect();
        automations.sort_by_key(|a| a.id);
        automations
    }

    /// Get automation by ID
    pub fn get(&self, id: AutomationId) -> Option<Automation> {
        self.automations.get(&id).map(|r| r.value().clone())
    }

    /// Create a new automation
    pub async fn create(
        &self,
        request: CreateAutomationRequest,
    ) -> Result<Automation, AutomationError> {
        request.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let automation = Automation::from_request(id, request);

        self.automations.insert(id, automation.clone());
        self.save().await?;

        let _ = self
            .event_tx
            .send(AutomationEvent::Created { automation_id: id });

        tracing::info!("Created automation: {} ({})", automation.name, id);
        Ok(automation)
    }

    /// Update an automation
    pub async fn update(
        &self,
        id: AutomationId,
        request: UpdateAutomationRequest,
    ) -> Result<Automation, AutomationError> {
        let mut automation = self.get(id).ok_or(AutomationError::NotFound(id))?;
        automation.apply_update(request);
        automation.validate()?;

        self.automations.insert(id, automation.clone());
        self.reset_rule_state(id);
        self.save().await?;

        let _ = self
            .event_tx
            .send(AutomationEvent::Updated { automation_id: id });

        tracing::info!("Updated automation: {}", id);
        Ok(automation)
    }

    /// Delete an automation
    pub async fn delete(&self, id: AutomationId) -> Result<Automation, AutomationError> {
        let (_, automation) = self
            .automations
            .remove(&id)
            .ok_or(AutomationError::NotFound(id))?;

        self.reset_rule_state(id);
        self.save().await?;

        let _ = self
            .event_tx
            .send(AutomationEvent::Deleted { automation_id: id });

        tracing::info!("Deleted automation: {} ({})", automation.name, id);
        Ok(automation)
    }

    /// Enable an automation
    pub async fn enable(&self, id: AutomationId) -> Result<Automation, AutomationError> {
        self.update(
            id,
            UpdateAutomationRequest {
                enabled: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    /// Disable an automation
    pub async fn disable(&self, id: AutomationId) -> Result<Automation, AutomationError> {
        self.update(
            id,
            UpdateAutomationRequest {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    /// Manually trigger an automation
    pub async fn trigger(&self, id: AutomationId) -> Result<ExecutionRecord, AutomationError> {
        let automation = self.get(id).ok_or(AutomationError::NotFound(id))?;
        if !automation.enabled {
            return Err(AutomationError::Disabled(id));
        }

        Ok(self
            .execute_automation(&automation, json!({ "trigger": "manual" }))
            .await)
    }

    /// Execution history for an automation, newest first.
    ///
    /// Served from the in-memory ring shared by all automations, so a rule
    /// that rarely fires may have older records only in the log file.
    pub fn logs(&self, id: AutomationId, limit: usize) -> Vec<ExecutionRecord> {
        self.log.list(Some(id), limit)
    }

    /// Drop pending sustain windows and time markers for a rule
    fn reset_rule_state(&self, id: AutomationId) {
        self.sustain.clear(id);
        self.time_fired.remove(&id);
        if let Some((_, (_, handle))) = self.sustain_tasks.remove(&id) {
            handle.abort();
        }
    }

    /// Enabled rules matching a predicate, cloned so no map guard is held
    /// while actions run
    fn snapshot(&self, filter: impl Fn(&Automation) -> bool) -> Vec<Automation> {
        let mut matching: Vec<Automation> = self
            .automations
            .iter()
            .filter(|r| r.value().enabled && filter(r.value()))
            .map(|r| r.value().clone())
            .collect();
        matching.sort_by_key(|a| a.id);
        matching
    }

    /// Execute an automation's action and record the outcome.
    ///
    /// Failures are logged and recorded, never returned.
    pub async fn execute_automation(
        &self,
        automation: &Automation,
        trigger_data: Value,
    ) -> ExecutionRecord {
        tracing::info!(
            "Executing automation '{}' ({})",
            automation.name,
            automation.id
        );

        let outcome = self.executor.execute(&automation.action).await;
        if let Err(e) = &outcome {
            tracing::error!("Automation '{}' failed: {}", automation.name, e);
        }

        let record = self.log.append(automation.id, trigger_data, &outcome).await;
        let _ = self.event_tx.send(AutomationEvent::Executed {
            automation_id: automation.id,
            automation_name: automation.name.clone(),
            success: record.success,
            error: record.error_message.clone(),
        });
        record
    }

    /// Evaluate `Mqtt` rules against a bus message
    pub async fn handle_bus_message(&self, msg: &BusMessage) {
        let raw = msg.payload_str();
        let matching = self.snapshot(|a| evaluator::mqtt_trigger_matches(&a.trigger, &msg.topic, &raw));

        for automation in matching {
            let trigger_data = json!({
                "trigger": "mqtt",
                "topic": msg.topic,
                "payload": raw,
            });
            self.execute_automation(&automation, trigger_data).await;
        }
    }

    /// Evaluate `DeviceState` rules against a device event
    pub async fn handle_device_event(self: &Arc<Self>, event: &DeviceEvent) {
        let DeviceEvent::AttributesChanged {
            device_id,
            attributes,
        } = event
        else {
            return;
        };

        let rules = self.snapshot(|a| {
            matches!(&a.trigger, Trigger::DeviceState { device_id: id, .. } if id == device_id)
        });
        if rules.is_empty() {
            return;
        }

        let state = Value::Object(attributes.clone());
        for automation in rules {
            self.observe_rule(&automation, *device_id, &state).await;
        }
    }

    async fn observe_rule(self: &Arc<Self>, automation: &Automation, device_id: DeviceId, state: &Value) {
        let Trigger::DeviceState {
            attribute,
            operator,
            value,
            sustain_minutes,
            ..
        } = &automation.trigger
        else {
            return;
        };

        let actual = payload::extract(state, attribute);
        let condition = match actual {
            None => false,
            Some(actual) => match evaluator::compare(actual, *operator, value) {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("Automation '{}': {}", automation.name, e);
                    false
                }
            },
        };
        tracing::debug!(
            "Automation {}: {} {} {} -> {}",
            automation.id,
            attribute,
            operator,
            value,
            condition
        );

        let window = sustain_window(*sustain_minutes);
        match self
            .sustain
            .observe(automation.id, condition, window, Instant::now())
        {
            Transition::None => {}
            Transition::Fire => {
                if let Some((_, (_, handle))) = self.sustain_tasks.remove(&automation.id) {
                    handle.abort();
                }
                let trigger_data = json!({
                    "trigger": "device_state",
                    "device_id": device_id,
                    "attribute": attribute,
                    "value": actual,
                    "sustain_minutes": sustain_minutes,
                });
                self.execute_automation(automation, trigger_data).await;
            }
            Transition::Armed { since, due } => {
                tracing::info!(
                    "Automation '{}' condition met, waiting {} min",
                    automation.name,
                    sustain_minutes
                );
                let engine = Arc::downgrade(self);
                let id = automation.id;
                let handle = tokio::spawn(async move {
                    tokio::time::sleep_until(due).await;
                    if let Some(engine) = Weak::upgrade(&engine) {
                        engine.confirm_sustained(id, since).await;
                    }
                });
                if let Some((_, previous)) = self.sustain_tasks.insert(automation.id, (since, handle)) {
                    previous.abort();
                }
            }
            Transition::Reset => {
                tracing::info!(
                    "Automation '{}' condition no longer met, cancelling wait",
                    automation.name
                );
                if let Some((_, (_, handle))) = self.sustain_tasks.remove(&automation.id) {
                    handle.abort();
                }
            }
        }
    }

    /// Fire a rule whose sustain window started at `since`, if it is still
    /// pending from that same start. Returns whether it fired.
    pub async fn confirm_sustained(&self, id: AutomationId, since: Instant) -> bool {
        let Some(automation) = self.get(id).filter(|a| a.enabled) else {
            return false;
        };
        let Trigger::DeviceState {
            device_id,
            attribute,
            sustain_minutes,
            ..
        } = &automation.trigger
        else {
            return false;
        };

        let window = sustain_window(*sustain_minutes);
        if !self.sustain.confirm(id, since, window, Instant::now()) {
            tracing::debug!("Sustain deadline for automation {} is stale", id);
            return false;
        }
        self.sustain_tasks
            .remove_if(&id, |_, (started, _)| *started == since);

        let current = self
            .executor
            .network()
            .devices()
            .get(*device_id)
            .and_then(|d| d.attribute(attribute).cloned());
        let trigger_data = json!({
            "trigger": "device_state",
            "device_id": device_id,
            "attribute": attribute,
            "value": current,
            "sustain_minutes": sustain_minutes,
        });
        self.execute_automation(&automation, trigger_data).await;
        true
    }

    /// Evaluate `Time` rules for the local minute containing `now`
    pub async fn handle_tick(&self, now: NaiveDateTime) {
        let (date, hour, minute) = (now.date(), now.hour(), now.minute());
        let due = self.snapshot(|a| {
            matches!(a.trigger, Trigger::Time { hour: h, minute: m } if h == hour && m == minute)
        });

        for automation in due {
            let marker = (date, hour, minute);
            let already = self
                .time_fired
                .insert(automation.id, marker)
                .is_some_and(|previous| previous == marker);
            if already {
                continue;
            }
            let trigger_data = json!({
                "trigger": "time",
                "time": now.format("%Y-%m-%dT%H:%M:%S").to_string(),
            });
            self.execute_automation(&automation, trigger_data).await;
        }
    }

    /// Start listening for bus messages
    fn start_bus_listener(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<BusMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Ok(msg) => engine.handle_bus_message(&msg).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Automation engine lagged by {} bus messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("Bus channel closed");
                            break;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Start listening for device events
    fn start_device_listener(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<DeviceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(event) => engine.handle_device_event(&event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Automation engine lagged by {} device events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("Device event channel closed");
                            break;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Run time rules at the start of every local minute
    fn start_time_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let now = Local::now().naive_local();
                let (next_minute, wait) = next_minute_boundary(now);
                tokio::select! {
                    () = tokio::time::sleep(wait) => engine.handle_tick(next_minute).await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

impl Drop for AutomationEngine {
    fn drop(&mut self) {
        for entry in self.sustain_tasks.iter() {
            entry.value().1.abort();
        }
    }
}

fn sustain_window(minutes: u32) -> Duration {
    Duration::from_secs(u64::from(minutes) * 60)
}

/// The next whole local minute after `now` and how long until it
fn next_minute_boundary(now: NaiveDateTime) -> (NaiveDateTime, Duration) {
    let into_minute = Duration::new(u64::from(now.second()), now.nanosecond() % 1_000_000_000);
    let wait = Duration::from_secs(60).saturating_sub(into_minute);
    let next = now + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::seconds(60));
    (next.with_nanosecond(0).unwrap_or(next), wait)
}
