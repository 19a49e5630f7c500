//! Platform detection for incoming mints.
//!
//! Detection methods in priority order: mint-suffix rule (no external call),
//! authoritative program-directory lookup, fallback to `Unknown`. Results are
//! memoized in a size- and age-bounded cache.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::Platform;

/// Program ids of the recognized launch venues.
pub const PUMP_PROGRAM: &str = "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P";
pub const BONK_PROGRAM: &str = "LanMV9sAd7wArD4vJFi2qDdfnVhFxYSUg6eADduJ3uj";
pub const RAYDIUM_AMM_PROGRAM: &str = "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8";

/// Maps a known program id to its platform.
pub fn platform_for_program(program_id: &str) -> Platform {
    match program_id {
        PUMP_PROGRAM => Platform::Pump,
        BONK_PROGRAM => Platform::Bonk,
        RAYDIUM_AMM_PROGRAM => Platform::Raydium,
        _ => Platform::Unknown,
    }
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("directory lookup failed: {0}")]
    Directory(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMethod {
    MintPattern,
    ProgramId,
    Cache,
    Fallback,
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionMethod::MintPattern => write!(f, "mint_pattern"),
            DetectionMethod::ProgramId => write!(f, "program_id"),
            DetectionMethod::Cache => write!(f, "cache"),
            DetectionMethod::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub platform: Platform,
    pub confidence: f64,
    pub method: DetectionMethod,
}

impl Detection {
    fn fallback() -> Self {
        Self {
            platform: Platform::Unknown,
            confidence: 0.0,
            method: DetectionMethod::Fallback,
        }
    }
}

/// Authoritative resolver from mint to owning program id. Pluggable so the
/// core never hard-codes a transport.
#[async_trait]
pub trait ProgramDirectory: Send + Sync {
    async fn resolve_program(&self, mint: &str) -> Result<Option<String>, DetectorError>;
}

/// Directory backed by an HTTP endpoint returning `{"program": "<id>"}` per
/// mint.
pub struct HttpProgramDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProgramDirectory {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[derive(Deserialize)]
struct DirectoryResponse {
    program: Option<String>,
}

#[async_trait]
impl ProgramDirectory for HttpProgramDirectory {
    async fn resolve_program(&self, mint: &str) -> Result<Option<String>, DetectorError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), mint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DetectorError::Directory(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DetectorError::Directory(format!(
                "directory returned {}",
                response.status()
            )));
        }
        let body: DirectoryResponse = response
            .json()
            .await
            .map_err(|e| DetectorError::Directory(e.to_string()))?;
        Ok(body.program)
    }
}

#[derive(Clone)]
struct CachedDetection {
    platform: Platform,
    confidence: f64,
    cached_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct DetectorStats {
    pub pattern_hits: u64,
    pub cache_hits: u64,
    pub directory_hits: u64,
    pub fallbacks: u64,
}

/// Process-lifetime detection singleton. Shared by the processor (fast path)
/// and the retry worker (authoritative path).
pub struct PlatformDetector {
    cache: DashMap<String, CachedDetection>,
    directory: Option<Arc<dyn ProgramDirectory>>,
    cache_ttl: Duration,
    cache_max_entries: usize,
    pattern_hits: AtomicU64,
    cache_hits: AtomicU64,
    directory_hits: AtomicU64,
    fallbacks: AtomicU64,
}

impl PlatformDetector {
    pub fn new(
        directory: Option<Arc<dyn ProgramDirectory>>,
        cache_ttl_secs: u64,
        cache_max_entries: usize,
    ) -> Self {
        Self {
            cache: DashMap::new(),
            directory,
            cache_ttl: Duration::seconds(cache_ttl_secs as i64),
            cache_max_entries,
            pattern_hits: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            directory_hits: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Suffix rule + cache only. Never blocks; callers that need the
    /// authoritative path go through [`PlatformDetector::detect`] or the
    /// retry queue.
    pub fn detect_fast(&self, mint: &str) -> Detection {
        if let Some(detection) = self.detect_by_suffix(mint) {
            self.pattern_hits.fetch_add(1, Ordering::Relaxed);
            return detection;
        }
        if let Some(cached) = self.cache_lookup(mint) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return cached;
        }
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        Detection::fallback()
    }

    /// Full detection: suffix rule, cache, then the authoritative directory.
    #[instrument(skip(self))]
    pub async fn detect(&self, mint: &str) -> Detection {
        if let Some(detection) = self.detect_by_suffix(mint) {
            self.pattern_hits.fetch_add(1, Ordering::Relaxed);
            return detection;
        }
        if let Some(cached) = self.cache_lookup(mint) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return cached;
        }

        if let Some(directory) = &self.directory {
            match directory.resolve_program(mint).await {
                Ok(Some(program_id)) => {
                    let platform = platform_for_program(&program_id);
                    if platform.is_known() {
                        self.directory_hits.fetch_add(1, Ordering::Relaxed);
                        let detection = Detection {
                            platform,
                            confidence: 0.95,
                            method: DetectionMethod::ProgramId,
                        };
                        self.cache_store(mint, &detection);
                        return detection;
                    }
                    debug!(mint, program_id, "directory program not a known venue");
                }
                Ok(None) => {
                    debug!(mint, "directory has no program for mint");
                }
                Err(e) => {
                    warn!(mint, error = %e, "directory lookup failed");
                }
            }
        }

        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        Detection::fallback()
    }

    fn detect_by_suffix(&self, mint: &str) -> Option<Detection> {
        let platform = if mint.ends_with("pump") {
            Platform::Pump
        } else if mint.ends_with("bonk") {
            Platform::Bonk
        } else {
            return None;
        };
        Some(Detection {
            platform,
            confidence: 0.99,
            method: DetectionMethod::MintPattern,
        })
    }

    fn cache_lookup(&self, mint: &str) -> Option<Detection> {
        let entry = self.cache.get(mint)?;
        if Utc::now() - entry.cached_at > self.cache_ttl {
            drop(entry);
            self.cache.remove(mint);
            return None;
        }
        Some(Detection {
            platform: entry.platform,
            confidence: entry.confidence,
            method: DetectionMethod::Cache,
        })
    }

    fn cache_store(&self, mint: &str, detection: &Detection) {
        if self.cache.len() >= self.cache_max_entries {
            self.evict_expired();
            if self.cache.len() >= self.cache_max_entries {
                // Still full after the sweep: drop the oldest entry.
                if let Some(oldest) = self
                    .cache
                    .iter()
                    .min_by_key(|e| e.value().cached_at)
                    .map(|e| e.key().clone())
                {
                    self.cache.remove(&oldest);
                }
            }
        }
        self.cache.insert(
            mint.to_string(),
            CachedDetection {
                platform: detection.platform,
                confidence: detection.confidence,
                cached_at: Utc::now(),
            },
        );
    }

    fn evict_expired(&self) {
        let cutoff = Utc::now() - self.cache_ttl;
        self.cache.retain(|_, v| v.cached_at >= cutoff);
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            pattern_hits: self.pattern_hits.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            directory_hits: self.directory_hits.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticDirectory {
        program: Option<String>,
    }

    #[async_trait]
    impl ProgramDirectory for StaticDirectory {
        async fn resolve_program(&self, _mint: &str) -> Result<Option<String>, DetectorError> {
            Ok(self.program.clone())
        }
    }

    #[test]
    fn suffix_rule_wins_without_external_calls() {
        let detector = PlatformDetector::new(None, 60, 100);
        let detection = detector.detect_fast("Abc123pump");
        assert_eq!(detection.platform, Platform::Pump);
        assert_eq!(detection.method, DetectionMethod::MintPattern);
        assert!(detection.confidence >= 0.99);

        let detection = detector.detect_fast("Xyzbonk");
        assert_eq!(detection.platform, Platform::Bonk);
    }

    #[test]
    fn unmatched_mint_falls_back_to_unknown() {
        let detector = PlatformDetector::new(None, 60, 100);
        let detection = detector.detect_fast("PlainMint111");
        assert_eq!(detection.platform, Platform::Unknown);
        assert_eq!(detection.confidence, 0.0);
        assert_eq!(detection.method, DetectionMethod::Fallback);
    }

    #[tokio::test]
    async fn directory_hit_is_cached_for_fast_path() {
        let directory: Arc<dyn ProgramDirectory> = Arc::new(StaticDirectory {
            program: Some(PUMP_PROGRAM.to_string()),
        });
        let detector = PlatformDetector::new(Some(directory), 60, 100);

        let detection = detector.detect("SomeMint111").await;
        assert_eq!(detection.platform, Platform::Pump);
        assert_eq!(detection.method, DetectionMethod::ProgramId);
        assert_eq!(detection.confidence, 0.95);

        let cached = detector.detect_fast("SomeMint111");
        assert_eq!(cached.platform, Platform::Pump);
        assert_eq!(cached.method, DetectionMethod::Cache);
    }

    #[tokio::test]
    async fn unknown_program_is_not_cached() {
        let directory: Arc<dyn ProgramDirectory> = Arc::new(StaticDirectory {
            program: Some("SomeOtherProgram1111".to_string()),
        });
        let detector = PlatformDetector::new(Some(directory), 60, 100);

        let detection = detector.detect("SomeMint111").await;
        assert_eq!(detection.platform, Platform::Unknown);
        assert_eq!(detector.cache_len(), 0);
    }

    #[test]
    fn cache_evicts_oldest_when_full() {
        let detector = PlatformDetector::new(None, 3600, 2);
        detector.cache_store(
            "m1",
            &Detection {
                platform: Platform::Pump,
                confidence: 0.95,
                method: DetectionMethod::ProgramId,
            },
        );
        detector.cache_store(
            "m2",
            &Detection {
                platform: Platform::Bonk,
                confidence: 0.95,
                method: DetectionMethod::ProgramId,
            },
        );
        detector.cache_store(
            "m3",
            &Detection {
                platform: Platform::Raydium,
                confidence: 0.95,
                method: DetectionMethod::ProgramId,
            },
        );
        assert_eq!(detector.cache_len(), 2);
        assert_eq!(detector.detect_fast("m3").platform, Platform::Raydium);
    }
}
