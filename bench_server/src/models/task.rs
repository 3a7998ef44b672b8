//! scheduled_tasks — durable queue of deferred work items.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Jsonb};
use serde::Serialize;

use crate::schema::scheduled_tasks;

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = scheduled_tasks)]
pub struct NewScheduledTask {
    pub kind: String,
    pub payload: serde_json::Value,
    pub not_before: DateTime<Utc>,
    pub status: String,
}

/// A task row claimed by a worker.
#[derive(Debug, Clone, Serialize, QueryableByName)]
pub struct ClaimedTask {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = Jsonb)]
    pub payload: serde_json::Value,
    #[diesel(sql_type = Integer)]
    pub attempts: i32,
}

pub const TASK_PENDING: &str = "pending";
pub const TASK_RUNNING: &str = "running";
pub const TASK_DONE: &str = "done";
pub const TASK_FAILED: &str = "failed";
