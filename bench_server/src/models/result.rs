//! results — one CI build's benchmark submission, unique on (name, build_id).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::results;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = results)]
pub struct BenchResult {
    pub id: i64,
    pub name: String,
    pub build_id: i64,
    pub build_number: i64,
    pub build_url: String,
    pub branch_name: String,
    pub gerrit_change_number: Option<String>,
    pub gerrit_patchset_number: Option<String>,
    pub gerrit_change_id: Option<String>,
    pub gerrit_change_url: Option<String>,
    pub manifest_id: i64,
    pub annotation: Option<String>,
    pub completed: bool,
    pub reported: bool,
    pub created_at: DateTime<Utc>,
}

impl BenchResult {
    /// Pre-merge verification builds carry a Gerrit change number.
    pub fn is_gerrit_build(&self) -> bool {
        self.gerrit_change_number.is_some()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = results)]
pub struct NewBenchResult {
    pub name: String,
    pub build_id: i64,
    pub build_number: i64,
    pub build_url: String,
    pub branch_name: String,
    pub gerrit_change_number: Option<String>,
    pub gerrit_patchset_number: Option<String>,
    pub gerrit_change_id: Option<String>,
    pub gerrit_change_url: Option<String>,
    pub manifest_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Fields a repeated submission may overwrite on an existing result.
///
/// `None` gerrit fields are written as NULL, matching the latest submission.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = results, treat_none_as_null = true)]
pub struct ResultChanges {
    pub build_number: i64,
    pub build_url: String,
    pub branch_name: String,
    pub gerrit_change_number: Option<String>,
    pub gerrit_patchset_number: Option<String>,
    pub gerrit_change_id: Option<String>,
    pub gerrit_change_url: Option<String>,
    pub manifest_id: i64,
}

impl ResultChanges {
    pub fn from_new(new: &NewBenchResult) -> Self {
        Self {
            build_number: new.build_number,
            build_url: new.build_url.clone(),
            branch_name: new.branch_name.clone(),
            gerrit_change_number: new.gerrit_change_number.clone(),
            gerrit_patchset_number: new.gerrit_patchset_number.clone(),
            gerrit_change_id: new.gerrit_change_id.clone(),
            gerrit_change_url: new.gerrit_change_url.clone(),
            manifest_id: new.manifest_id,
        }
    }

    pub fn apply(&self, result: &mut BenchResult) {
        result.build_number = self.build_number;
        result.build_url = self.build_url.clone();
        result.branch_name = self.branch_name.clone();
        result.gerrit_change_number = self.gerrit_change_number.clone();
        result.gerrit_patchset_number = self.gerrit_patchset_number.clone();
        result.gerrit_change_id = self.gerrit_change_id.clone();
        result.gerrit_change_url = self.gerrit_change_url.clone();
        result.manifest_id = self.manifest_id;
    }
}
