//! Farm entity families.
//!
//! Each entity serializes to its remote payload and carries its dirty-tracking
//! state alongside, excluded from that payload.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::record::{EntityFamily, SyncState, Synchronizable};

pub const TASKS: EntityFamily = EntityFamily::new("task", "tasks");
pub const DAILY_LOGS: EntityFamily = EntityFamily::new("daily_log", "daily_logs");
pub const TRANSFERS: EntityFamily = EntityFamily::new("transfer", "transfers");

/// Every family this crate ships, in sync order.
pub const FARM_FAMILIES: [EntityFamily; 3] = [TASKS, DAILY_LOGS, TRANSFERS];

/// Look up a built-in family by its wire name.
pub fn family_by_name(name: &str) -> Option<EntityFamily> {
    FARM_FAMILIES.iter().copied().find(|f| f.name == name)
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Fresh client-generated id.
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

entity_id!(
    /// Unique identifier for a task
    TaskId
);
entity_id!(
    /// Unique identifier for a daily log
    DailyLogId
);
entity_id!(
    /// Unique identifier for a stock transfer
    TransferId
);

// ============================================================================
// Task
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Open,
    InProgress,
    Done,
}

/// A unit of field work assigned on a farm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub farm_id: String,
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(skip)]
    pub sync: SyncState,
}

impl Task {
    pub fn new(farm_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            farm_id: farm_id.into(),
            title: title.into(),
            notes: None,
            due_date: None,
            status: TaskStatus::Open,
            assignee: None,
            sync: SyncState::default(),
        }
    }
}

impl Synchronizable for Task {
    fn family() -> EntityFamily {
        TASKS
    }

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn sync_state(&self) -> &SyncState {
        &self.sync
    }

    fn sync_state_mut(&mut self) -> &mut SyncState {
        &mut self.sync
    }

    fn validate(&self) -> Result<(), String> {
        if self.id.as_str().trim().is_empty() {
            return Err("Task id cannot be empty".to_string());
        }
        if self.farm_id.trim().is_empty() {
            return Err("Task must belong to a farm".to_string());
        }
        if self.title.trim().is_empty() {
            return Err("Task title cannot be empty".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Daily Log
// ============================================================================

/// End-of-day record of work done on a farm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLog {
    pub id: DailyLogId,
    pub farm_id: String,
    pub log_date: NaiveDate,
    #[serde(default)]
    pub weather: Option<String>,
    #[serde(default)]
    pub activities: Vec<String>,
    pub labor_hours: f64,
    #[serde(skip)]
    pub sync: SyncState,
}

impl DailyLog {
    pub fn new(farm_id: impl Into<String>, log_date: NaiveDate) -> Self {
        Self {
            id: DailyLogId::new(),
            farm_id: farm_id.into(),
            log_date,
            weather: None,
            activities: Vec::new(),
            labor_hours: 0.0,
            sync: SyncState::default(),
        }
    }
}

impl Synchronizable for DailyLog {
    fn family() -> EntityFamily {
        DAILY_LOGS
    }

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn sync_state(&self) -> &SyncState {
        &self.sync
    }

    fn sync_state_mut(&mut self) -> &mut SyncState {
        &mut self.sync
    }

    fn validate(&self) -> Result<(), String> {
        if self.farm_id.trim().is_empty() {
            return Err("Daily log must belong to a farm".to_string());
        }
        if !self.labor_hours.is_finite() || self.labor_hours < 0.0 {
            return Err(format!("Invalid labor hours: {}", self.labor_hours));
        }
        Ok(())
    }
}

// ============================================================================
// Transfer
// ============================================================================

/// Movement of stock (feed, seed, produce) between two locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub item: String,
    pub quantity: f64,
    pub unit: String,
    pub from_location: String,
    pub to_location: String,
    pub transferred_at: DateTime<Utc>,
    #[serde(skip)]
    pub sync: SyncState,
}

impl Synchronizable for Transfer {
    fn family() -> EntityFamily {
        TRANSFERS
    }

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn sync_state(&self) -> &SyncState {
        &self.sync
    }

    fn sync_state_mut(&mut self) -> &mut SyncState {
        &mut self.sync
    }

    fn validate(&self) -> Result<(), String> {
        if self.item.trim().is_empty() {
            return Err("Transfer item cannot be empty".to_string());
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(format!("Invalid transfer quantity: {}", self.quantity));
        }
        if self.from_location == self.to_location {
            return Err("Transfer source and destination must differ".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SyncRecord;

    #[test]
    fn test_family_lookup() {
        assert_eq!(family_by_name("daily_log"), Some(DAILY_LOGS));
        assert_eq!(family_by_name("invoice"), None);
        for family in FARM_FAMILIES {
            assert!(family.validate().is_ok());
        }
    }

    #[test]
    fn test_task_validation() {
        let task = Task::new("farm-1", "Fix fence");
        assert!(task.validate().is_ok());

        let untitled = Task::new("farm-1", "  ");
        assert!(untitled.validate().is_err());
    }

    #[test]
    fn test_daily_log_rejects_negative_hours() {
        let mut log = DailyLog::new("farm-1", NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        log.labor_hours = -1.0;
        assert!(log.validate().is_err());
        log.labor_hours = 6.5;
        assert!(log.validate().is_ok());
    }

    #[test]
    fn test_transfer_validation() {
        let transfer = Transfer {
            id: TransferId::new(),
            item: "Maize seed".to_string(),
            quantity: 25.0,
            unit: "kg".to_string(),
            from_location: "Store A".to_string(),
            to_location: "Store A".to_string(),
            transferred_at: Utc::now(),
            sync: SyncState::default(),
        };
        assert!(transfer.validate().is_err());
    }

    #[test]
    fn test_task_payload_shape() {
        let mut task = Task::new("farm-1", "Harvest beans");
        task.id = TaskId::from("t-1");
        task.status = TaskStatus::InProgress;

        let record = SyncRecord::from_entity(&task).unwrap();
        assert_eq!(record.id, "t-1");
        assert_eq!(record.payload["status"], "IN_PROGRESS");
        assert!(record.payload.get("sync").is_none());
    }
}
