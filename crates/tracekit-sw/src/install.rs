//! Versioned cache installation.
//!
//! An install resolves `{version}/manifest.json`, fetches the root document
//! plus every manifest resource, and swaps the named bucket to exactly that
//! set in one bulk replace. A failed install leaves any previously installed
//! generation untouched, so a broken upgrade never degrades a working
//! offline copy.

use hashbrown::HashMap;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{error, info};
use url::Url;

use tracekit_net::{fetch_with_deadline, CacheMode, FetchClient, Request};
use tracekit_store::{BucketStore, CacheEntry};

use crate::{entry_from_response, join_url, SwConfig, SwError};

/// Per-version descriptor listing resource paths and their integrity hashes.
///
/// Fetched from `{version}/manifest.json`. Any body that does not deserialize
/// to this shape is a fatal manifest error.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionManifest {
    pub resources: HashMap<String, String>,
}

/// Install one application version into the active bucket.
///
/// The bucket swap happens only after every resource has been fetched
/// successfully, so observers of the bucket either see the previous complete
/// generation or the new complete generation, never a partial one.
pub(crate) async fn install_version(
    client: &FetchClient,
    store: &RwLock<BucketStore>,
    config: &SwConfig,
    version: &str,
) -> Result<(), SwError> {
    // Operator kill switch: the presence of the sentinel bucket disables
    // offline caching entirely.
    if store.read().await.has(&config.bypass_bucket) {
        return Err(SwError::InstallAborted(format!(
            "bypass bucket '{}' present",
            config.bypass_bucket
        )));
    }

    // Garbage-collect buckets left behind by the previous naming scheme.
    {
        let mut store = store.write().await;
        for name in store.names() {
            if name.starts_with(&config.legacy_bucket_prefix) {
                info!(bucket = %name, "deleting legacy bucket");
                store.delete(&name).await?;
            }
        }
    }

    let manifest_url = join_url(&config.origin, &format!("{version}/manifest.json"))?;
    info!(%manifest_url, "starting installation");

    let entries = match assemble_version(client, config, version, &manifest_url).await {
        Ok(entries) => entries,
        Err(err) => {
            error!(%manifest_url, %err, "installation failed");
            return Err(err);
        }
    };

    let mut store = store.write().await;
    if let Err(err) = store.replace_all(&config.cache_name, entries).await {
        // Never leave a half-written generation under a name that looks
        // valid.
        store.delete(&config.cache_name).await?;
        error!(%err, "bucket replace failed, rolled back");
        return Err(err.into());
    }

    info!(version, bucket = %config.cache_name, "installation completed");
    Ok(())
}

/// Fetch the manifest and every resource of a version, returning the full
/// entry set for the bucket swap.
async fn assemble_version(
    client: &FetchClient,
    config: &SwConfig,
    version: &str,
    manifest_url: &Url,
) -> Result<Vec<CacheEntry>, SwError> {
    let manifest_req = Request::get(manifest_url.clone());
    let response = fetch_with_deadline(client, &manifest_req, config.install_timeout).await?;
    let manifest: VersionManifest =
        response.json().map_err(|err| SwError::ManifestInvalid {
            url: manifest_url.to_string(),
            reason: err.to_string(),
        })?;

    let mut requests = Vec::with_capacity(manifest.resources.len() + 1);
    // cache:reload so the root is always fetched fresh and never re-cached
    // from a copy served by this worker itself.
    requests.push(Request::get(config.root_url()).cache_mode(CacheMode::Reload));
    for (resource, integrity) in &manifest.resources {
        // Versioned paths are immutable; a revalidation plus the integrity
        // hash is enough, no full reload needed.
        let url = join_url(&config.origin, &format!("{version}/{resource}"))?;
        requests.push(
            Request::get(url)
                .cache_mode(CacheMode::NoCache)
                .integrity(integrity.clone()),
        );
    }

    let mut entries = Vec::with_capacity(requests.len());
    for request in requests {
        let response = fetch_with_deadline(client, &request, config.install_timeout).await?;
        entries.push(entry_from_response(&request, &response));
    }
    Ok(entries)
}
