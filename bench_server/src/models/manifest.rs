//! manifests + manifest_reduced — content-addressed source-tree snapshots.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::{manifest_reduced, manifests};

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = manifests)]
pub struct Manifest {
    pub id: i64,
    pub manifest: String,
    pub manifest_hash: String,
    pub reduced_id: Option<i64>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = manifests)]
pub struct NewManifest {
    pub manifest: String,
    pub manifest_hash: String,
    pub reduced_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = manifest_reduced)]
pub struct ManifestReduced {
    pub id: i64,
    pub hash: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = manifest_reduced)]
pub struct NewManifestReduced {
    pub hash: String,
}
