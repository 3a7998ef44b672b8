//! result_data — one subscore's raw measurements for a result.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::result_data;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = result_data)]
pub struct ResultData {
    pub id: i64,
    pub benchmark_id: i64,
    pub result_id: i64,
    pub test_job_id: Option<String>,
    pub name: String,
    #[diesel(column_name = measurements)]
    pub values: Vec<f64>,
    pub board: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = result_data)]
pub struct NewResultData {
    pub benchmark_id: i64,
    pub result_id: i64,
    pub test_job_id: Option<String>,
    pub name: String,
    #[diesel(column_name = measurements)]
    pub values: Vec<f64>,
    pub board: String,
}

/// A result data row joined with its benchmark name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedResultData {
    pub benchmark: String,
    #[serde(flatten)]
    pub data: ResultData,
}
