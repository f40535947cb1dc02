use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use leasehold_core::LeaseholdConfig;
use leasehold_scheduler::{
    lock_store::LockStore, run_store::RunStore, Clock, Database, Janitor, LeaseManager,
    ScheduleDefinition, SchedulerSettings, SystemClock, TaskCoordinator,
    TaskScope,
};
use tracing::info;

struct Stores {
    coordinator: TaskCoordinator,
    leases: LeaseManager,
    now: DateTime<Utc>,
}

fn open(config: &LeaseholdConfig) -> Result<Stores> {
    ensure_parent_dir(&config.database.path);
    let db = Database::open_with_config(&config.database)
        .with_context(|| format!("opening store at {}", config.database.path))?;
    let settings = SchedulerSettings::from_config(&config.scheduler)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Ok(Stores {
        coordinator: TaskCoordinator::new(
            RunStore::new(db.clone(), clock.clone()),
            settings.failure_policy,
        ),
        leases: LeaseManager::new(LockStore::new(db, clock.clone())),
        now: clock.now(),
    })
}

pub fn init(config: &LeaseholdConfig) -> Result<()> {
    open(config)?;
    println!("schema ready at {}", config.database.path);
    Ok(())
}

pub fn tasks(config: &LeaseholdConfig, json: bool) -> Result<()> {
    let stores = open(config)?;
    let tasks = stores.coordinator.list_tasks()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("no tasks registered");
        return Ok(());
    }

    println!(
        "{:<32} {:<14} {:<26} {:<10} {:<10}",
        "ID", "CADENCE", "NEXT RUN", "STATE", "LAST"
    );
    for task in tasks {
        let cadence = task
            .settings()
            .map(|s| s.cadence)
            .unwrap_or_else(|_| "?".to_string());
        let state = if task.is_running_at(stores.now) {
            "running"
        } else if task.current_run_ticket.is_some() {
            "expired"
        } else if task.is_due_at(stores.now) {
            "due"
        } else {
            "idle"
        };
        let last = task
            .last_run_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:<14} {:<26} {:<10} {:<10}",
            task.id,
            cadence,
            fmt_time(task.next_run_start_at),
            state,
            last
        );
        if let Some(err) = &task.last_run_error {
            println!("    last error: {err}");
        }
    }
    Ok(())
}

pub fn locks(config: &LeaseholdConfig, json: bool) -> Result<()> {
    let stores = open(config)?;
    let locks = stores.leases.list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&locks)?);
        return Ok(());
    }
    if locks.is_empty() {
        println!("no mutexes");
        return Ok(());
    }

    println!("{:<32} {:<34} {:<26}", "ID", "HOLDER", "EXPIRES");
    for lock in locks {
        let holder = if lock.is_held_at(stores.now) {
            lock.current_lock_ticket
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_default()
        } else {
            "-".to_string()
        };
        println!(
            "{:<32} {:<34} {:<26}",
            lock.id,
            holder,
            fmt_time(lock.current_lock_expires_at)
        );
    }
    Ok(())
}

pub fn trigger(config: &LeaseholdConfig, id: &str) -> Result<()> {
    let stores = open(config)?;
    stores.coordinator.trigger(id)?;
    info!(task_id = %id, "triggered");
    println!("{id} is due now");
    Ok(())
}

pub fn schedules(config: &LeaseholdConfig) -> Result<()> {
    if config.schedules.is_empty() {
        println!("no schedules configured");
        return Ok(());
    }
    let mut invalid = 0;
    for (id, raw) in &config.schedules {
        match ScheduleDefinition::try_from(raw) {
            Ok(def) => {
                let scope = match def.scope {
                    TaskScope::Global => "global",
                    TaskScope::Local => "local",
                };
                println!("{id:<32} {scope:<7} {}", def.settings_json()?);
            }
            Err(e) => {
                invalid += 1;
                println!("{id:<32} invalid: {e}");
            }
        }
    }
    if invalid > 0 {
        anyhow::bail!("{invalid} invalid schedule(s)");
    }
    Ok(())
}

pub fn sweep(config: &LeaseholdConfig) -> Result<()> {
    let stores = open(config)?;
    let report = Janitor::new(stores.coordinator, stores.leases).sweep()?;
    println!(
        "reset {} expired run(s) and {} expired lease(s)",
        report.runs, report.mutexes
    );
    Ok(())
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
