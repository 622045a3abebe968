//! Best-effort mirror of the segments that already exist on the platform.
//!
//! The cache exists so a resumed job can skip names that were created before
//! a crash or by an earlier run, instead of issuing a duplicate creation
//! call. It is disposable: the platform stays authoritative, and a failed
//! refresh leaves the previous snapshot in place.

use anyhow::Result;
use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, instrument};

use crate::db::{self, Pool};
use crate::platform::SegmentApi;

// The platform decorates managed names with an exclusion marker; branding
// suffixes come from config since they differ per deployment.
static EXCLUSION_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*\(exclusion\)\s*$").expect("valid marker regex"));

/// Canonical form used for duplicate detection: decorative suffixes stripped,
/// whitespace collapsed, lowercased.
pub fn normalize_name(raw: &str, branding_suffix: &str) -> String {
    let mut name = raw.trim();
    let suffix = branding_suffix.trim();
    if !suffix.is_empty() && name.len() >= suffix.len() {
        let tail_matches = name
            .get(name.len() - suffix.len()..)
            .map(|tail| tail.eq_ignore_ascii_case(suffix))
            .unwrap_or(false);
        if tail_matches {
            name = name[..name.len() - suffix.len()].trim_end();
        }
    }
    let name = EXCLUSION_MARKER.replace(name, "");
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Refresh the snapshot for one account from the platform's list endpoint.
/// Replaces the cache wholesale on success; on failure the old cache stays
/// and the error surfaces to the caller (staleness is tolerated).
#[instrument(skip_all)]
pub async fn sync(
    pool: &Pool,
    api: &dyn SegmentApi,
    account_ref: &str,
    branding_suffix: &str,
) -> Result<usize> {
    let remote = api.list_owned_segments(account_ref).await?;
    let entries: Vec<(String, String, Option<chrono::DateTime<Utc>>)> = remote
        .into_iter()
        .map(|seg| {
            (
                normalize_name(&seg.name, branding_suffix),
                seg.id,
                seg.created_at,
            )
        })
        .collect();
    let count = entries.len();
    db::replace_segment_cache(pool, account_ref, &entries).await?;
    info!(count, "refreshed remote segment cache");
    Ok(count)
}

/// Cache read: the external id of a segment with this (raw) name, if one is
/// already present on the platform.
pub async fn lookup(
    pool: &Pool,
    account_ref: &str,
    name: &str,
    branding_suffix: &str,
) -> Result<Option<String>> {
    let normalized = normalize_name(name, branding_suffix);
    db::cached_segment_id(pool, account_ref, &normalized).await
}

pub async fn is_already_created(
    pool: &Pool,
    account_ref: &str,
    name: &str,
    branding_suffix: &str,
) -> Result<bool> {
    Ok(lookup(pool, account_ref, name, branding_suffix)
        .await?
        .is_some())
}

/// True when the snapshot is missing or older than `max_age_seconds`.
pub async fn is_stale(pool: &Pool, account_ref: &str, max_age_seconds: i64) -> Result<bool> {
    match db::cache_synced_at(pool, account_ref).await? {
        None => Ok(true),
        Some(at) => Ok(Utc::now() - at > Duration::seconds(max_age_seconds)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUFFIX: &str = " | SegmentBatcher";

    #[test]
    fn normalize_strips_branding_suffix() {
        assert_eq!(normalize_name("VIP Buyers | SegmentBatcher", SUFFIX), "vip buyers");
        assert_eq!(normalize_name("VIP Buyers | segmentbatcher", SUFFIX), "vip buyers");
        assert_eq!(normalize_name("VIP Buyers", SUFFIX), "vip buyers");
    }

    #[test]
    fn normalize_strips_exclusion_marker() {
        assert_eq!(normalize_name("Churn Risk (Exclusion)", SUFFIX), "churn risk");
        assert_eq!(normalize_name("Churn Risk (exclusion)", SUFFIX), "churn risk");
        assert_eq!(
            normalize_name("Churn Risk (Exclusion) | SegmentBatcher", SUFFIX),
            "churn risk"
        );
    }

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_name("  Big   Spenders  ", SUFFIX), "big spenders");
        assert_eq!(normalize_name("BIG SPENDERS", SUFFIX), "big spenders");
    }

    #[test]
    fn normalize_keeps_interior_parens() {
        assert_eq!(
            normalize_name("Lapsed (90d) Buyers", SUFFIX),
            "lapsed (90d) buyers"
        );
    }

    #[test]
    fn normalize_with_empty_suffix_config() {
        assert_eq!(normalize_name("VIP Buyers", ""), "vip buyers");
    }
}
