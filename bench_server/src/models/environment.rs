//! environments — device/board identifiers that test jobs run on.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::environments;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = environments)]
pub struct Environment {
    pub id: i64,
    pub identifier: String,
    pub name: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = environments)]
pub struct NewEnvironment {
    pub identifier: String,
    pub name: String,
}
