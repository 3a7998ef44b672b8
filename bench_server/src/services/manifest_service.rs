//! Manifest content addressing and get-or-create.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::StoreResult;
use crate::models::manifest::{Manifest, ManifestReduced, NewManifest, NewManifestReduced};
use crate::store::{get_or_create, Store};

static XML_DECLARATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\?xml[^>]*\?>").unwrap());
static BETWEEN_TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r">\s+<").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Lowercase hex SHA-1 of the raw manifest bytes.
pub fn manifest_hash(manifest: &str) -> String {
    use sha1::{Digest, Sha1};
    hex::encode(Sha1::digest(manifest.as_bytes()))
}

/// Canonical text: no XML declaration, nothing between tags, single spaces.
pub fn normalize(manifest: &str) -> String {
    let text = XML_DECLARATION.replace_all(manifest, "");
    let text = BETWEEN_TAGS.replace_all(&text, "><");
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// Hex SHA-256 of the normalized manifest.
pub fn reduced_hash(manifest: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(normalize(manifest).as_bytes()))
}

pub async fn get_or_create_reduced<S: Store + ?Sized>(
    store: &S,
    manifest: &str,
) -> StoreResult<ManifestReduced> {
    let hash = reduced_hash(manifest);
    let (reduced, _) = get_or_create(
        || store.manifest_reduced_by_hash(&hash),
        || store.insert_manifest_reduced(NewManifestReduced { hash: hash.clone() }),
    )
    .await?;
    Ok(reduced)
}

/// Find the manifest with this content, creating it (and its reduced form)
/// when absent. Racing creators converge on one row.
pub async fn get_or_create_manifest<S: Store + ?Sized>(
    store: &S,
    manifest: &str,
) -> StoreResult<Manifest> {
    let hash = manifest_hash(manifest);
    if let Some(found) = store.manifest_by_hash(&hash).await? {
        return Ok(found);
    }

    let reduced = get_or_create_reduced(store, manifest).await?;
    let (row, created) = get_or_create(
        || store.manifest_by_hash(&hash),
        || {
            store.insert_manifest(NewManifest {
                manifest: manifest.to_string(),
                manifest_hash: hash.clone(),
                reduced_id: Some(reduced.id),
            })
        },
    )
    .await?;
    if created {
        tracing::info!(manifest_id = row.id, hash = %row.manifest_hash, "Manifest stored");
    }
    Ok(row)
}
