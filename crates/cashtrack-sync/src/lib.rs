//! Ingest orchestration: registry loading, scrape, persist, fallback capture.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cashtrack_core::ExtractionResult;
use cashtrack_extract::{failed_scrape, scrape_markup};
use cashtrack_storage::{FallbackStore, HistoryStore, ScrapeReceipt, StoredFallback};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cashtrack-sync";

pub const REGISTRY_FILE: &str = "merchants.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct MerchantRegistry {
    pub merchants: Vec<MerchantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MerchantConfig {
    pub slug: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Already-acquired page, relative to the workspace root. Defaults to
    /// `fixtures/<slug>/page.html`.
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl MerchantRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing merchant registry")
    }

    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(REGISTRY_FILE);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &MerchantConfig> {
        self.merchants.iter().filter(|m| m.enabled)
    }
}

impl MerchantConfig {
    pub fn snapshot_path(&self, workspace_root: &Path) -> PathBuf {
        match &self.snapshot {
            Some(path) => workspace_root.join(path),
            None => workspace_root
                .join("fixtures")
                .join(&self.slug)
                .join("page.html"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub fallback_dir: PathBuf,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://cashtrack.db".to_string()),
            fallback_dir: std::env::var("CASHTRACK_FALLBACK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fallback")),
            workspace_root: std::env::var("CASHTRACK_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// How one scrape ended up.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Recorded {
        receipt: ScrapeReceipt,
        degraded: bool,
        success: bool,
    },
    /// The history store refused the result; it was written to the fallback
    /// directory instead.
    Captured {
        fallback: StoredFallback,
        error: String,
        success: bool,
    },
}

impl IngestOutcome {
    pub fn scrape_succeeded(&self) -> bool {
        match self {
            Self::Recorded { success, .. } | Self::Captured { success, .. } => *success,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_merchants: usize,
    pub recorded: usize,
    pub degraded: usize,
    pub failed: usize,
    pub captured: usize,
}

pub struct IngestService {
    history: HistoryStore,
    fallback: FallbackStore,
}

impl IngestService {
    pub fn new(history: HistoryStore, fallback: FallbackStore) -> Self {
        Self { history, fallback }
    }

    /// Connects to `config.database_url` and brings the schema up to date.
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        let history = HistoryStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        history.migrate().await.context("running migrations")?;
        Ok(Self::new(history, FallbackStore::new(config.fallback_dir.clone())))
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Extracts rates from an acquired page and records them.
    pub async fn ingest_markup(&self, url: &str, markup: &str) -> Result<IngestOutcome> {
        let result = scrape_markup(markup, url);
        self.ingest_result(result).await
    }

    /// Records a scrape that failed before a page was available.
    pub async fn ingest_failure(&self, url: &str, error: &str) -> Result<IngestOutcome> {
        self.ingest_result(failed_scrape(url, error)).await
    }

    /// Persists `result`, capturing it to the fallback directory when the
    /// history store refuses it. Errors only when both sinks fail.
    pub async fn ingest_result(&self, result: ExtractionResult) -> Result<IngestOutcome> {
        let degraded = result.is_degraded();
        let success = result.success;
        match self.history.record_scrape(result).await {
            Ok(receipt) => Ok(IngestOutcome::Recorded {
                receipt,
                degraded,
                success,
            }),
            Err(err) => {
                let error = err.source.to_string();
                let fallback = self
                    .fallback
                    .store(Utc::now(), &err.result)
                    .await
                    .with_context(|| {
                        format!(
                            "capturing unpersisted scrape of {} after: {error}",
                            err.result.merchant_name
                        )
                    })?;
                warn!(
                    merchant = %err.result.merchant_name,
                    path = %fallback.absolute_path.display(),
                    %error,
                    "scrape captured to fallback instead of history"
                );
                Ok(IngestOutcome::Captured {
                    fallback,
                    error,
                    success,
                })
            }
        }
    }

    /// Ingests every enabled registry merchant once, in registry order.
    ///
    /// An unreadable snapshot is recorded as a failed scrape; it does not stop
    /// the run.
    pub async fn run_registry_once(&self, workspace_root: &Path) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = MerchantRegistry::load(workspace_root).await?;
        let enabled: Vec<_> = registry.enabled().collect();

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            enabled_merchants: enabled.len(),
            recorded: 0,
            degraded: 0,
            failed: 0,
            captured: 0,
        };

        for merchant in enabled {
            let span = info_span!("sync_merchant", %run_id, slug = %merchant.slug);
            let outcome = self
                .ingest_merchant(merchant, workspace_root)
                .instrument(span)
                .await?;
            if !outcome.scrape_succeeded() {
                summary.failed += 1;
            }
            match outcome {
                IngestOutcome::Recorded { degraded, .. } => {
                    summary.recorded += 1;
                    if degraded {
                        summary.degraded += 1;
                    }
                }
                IngestOutcome::Captured { .. } => summary.captured += 1,
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            merchants = summary.enabled_merchants,
            recorded = summary.recorded,
            degraded = summary.degraded,
            failed = summary.failed,
            captured = summary.captured,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn ingest_merchant(
        &self,
        merchant: &MerchantConfig,
        workspace_root: &Path,
    ) -> Result<IngestOutcome> {
        let path = merchant.snapshot_path(workspace_root);
        match fs::read_to_string(&path).await {
            Ok(markup) => self.ingest_markup(&merchant.url, &markup).await,
            Err(err) => {
                let error = format!("reading snapshot {}: {err}", path.display());
                self.ingest_failure(&merchant.url, &error).await
            }
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let service = IngestService::connect(&config).await?;
    service.run_registry_once(&config.workspace_root).await
}
