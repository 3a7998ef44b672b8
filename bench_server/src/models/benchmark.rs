//! benchmarks — named benchmark categories (e.g. "cpu").

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::benchmarks;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = benchmarks)]
pub struct Benchmark {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = benchmarks)]
pub struct NewBenchmark {
    pub name: String,
}
