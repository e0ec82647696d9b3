//! Rate history ledger and per-category statistics on SQLite.
//!
//! Every scrape is recorded in one transaction: merchant upsert, one ledger row
//! per category (headline rate first, as `"Main"`), then the running
//! extremum records. Either all of it lands or none of it does.

mod fallback;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use cashtrack_core::{
    ExtractionResult, HistoryQuery, Merchant, RateObservation, RateStatistic, StatisticsQuery,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, info_span, Instrument};

pub use fallback::{FallbackStore, StoredFallback};

pub const CRATE_NAME: &str = "cashtrack-storage";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serializing scrape result: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A scrape the history store could not persist. Carries the complete result
/// so the caller can capture or retry it.
#[derive(Debug, Error)]
#[error("persisting scrape of `{merchant}` failed: {source}", merchant = .result.merchant_name)]
pub struct PersistError {
    pub result: Box<ExtractionResult>,
    #[source]
    pub source: StoreError,
}

/// What one successful `record_scrape` wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeReceipt {
    pub merchant_id: i64,
    pub merchant_created: bool,
    pub observations: usize,
    pub statistics_updated: usize,
    pub scraped_at: DateTime<Utc>,
}

type MerchantKey = (String, String);

#[derive(Debug)]
pub struct HistoryStore {
    pool: SqlitePool,
    merchant_locks: Mutex<HashMap<MerchantKey, Arc<Semaphore>>>,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            merchant_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Opens (creating if missing) the database at `database_url`. Does not migrate.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    /// Fresh migrated database that lives as long as the store.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn record_scrape(
        &self,
        result: ExtractionResult,
    ) -> Result<ScrapeReceipt, PersistError> {
        self.record_scrape_at(result, Utc::now()).await
    }

    /// Records one scrape with an explicit capture time.
    ///
    /// Writes to the same merchant are serialized; different merchants only
    /// share the pool.
    pub async fn record_scrape_at(
        &self,
        result: ExtractionResult,
        scraped_at: DateTime<Utc>,
    ) -> Result<ScrapeReceipt, PersistError> {
        let span = info_span!(
            "record_scrape",
            merchant = %result.merchant_name,
            url = %result.source_url
        );
        async {
            match self.persist(&result, scraped_at).await {
                Ok(receipt) => {
                    info!(
                        merchant_id = receipt.merchant_id,
                        observations = receipt.observations,
                        statistics = receipt.statistics_updated,
                        success = result.success,
                        "scrape recorded"
                    );
                    Ok(receipt)
                }
                Err(source) => {
                    error!(error = %source, "scrape not recorded; transaction rolled back");
                    Err(PersistError {
                        result: Box::new(result),
                        source,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn merchant_lock(&self, key: &MerchantKey) -> Arc<Semaphore> {
        let mut map = self.merchant_locks.lock().await;
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Drops the map entry once no other writer holds or waits on it, so the
    /// map only holds merchants with a write in flight.
    async fn release_merchant_lock(&self, key: &MerchantKey, lock: Arc<Semaphore>) {
        let mut map = self.merchant_locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            map.remove(key);
        }
    }

    async fn persist(
        &self,
        result: &ExtractionResult,
        scraped_at: DateTime<Utc>,
    ) -> Result<ScrapeReceipt, StoreError> {
        let key = (result.merchant_name.clone(), result.source_url.clone());
        let lock = self.merchant_lock(&key).await;
        let outcome = {
            let _permit = lock.acquire().await.expect("merchant semaphore never closed");
            self.write_in_transaction(result, scraped_at).await
        };
        self.release_merchant_lock(&key, lock).await;
        outcome
    }

    async fn write_in_transaction(
        &self,
        result: &ExtractionResult,
        scraped_at: DateTime<Utc>,
    ) -> Result<ScrapeReceipt, StoreError> {
        let mut tx = self.pool.begin().await?;
        match write_scrape(&mut tx, result, scraped_at).await {
            Ok(receipt) => {
                tx.commit().await?;
                Ok(receipt)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    error!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    pub async fn merchants(&self) -> Result<Vec<Merchant>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, url, created_at, updated_at
              FROM stores
             ORDER BY name, url
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Merchant {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                url: row.try_get("url")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(out)
    }

    /// Ledger rows matching `query`, newest first.
    pub async fn history(&self, query: &HistoryQuery) -> Result<Vec<RateObservation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT h.id, h.store_id, s.name, s.url,
                   h.main_cashback, h.main_rate_numeric,
                   h.category, h.category_rate, h.category_rate_numeric,
                   h.is_upsized, h.previous_offer,
                   h.scraping_success, h.error_message, h.scraped_at
              FROM cashback_history h
              JOIN stores s ON s.id = h.store_id
             WHERE (?1 IS NULL OR instr(lower(s.name), lower(?1)) > 0)
               AND (?2 IS NULL OR s.url = ?2)
               AND (?3 IS NULL OR h.category = ?3)
             ORDER BY h.scraped_at DESC, h.id DESC
             LIMIT ?4
            "#,
        )
        .bind(query.merchant.as_deref())
        .bind(query.url.as_deref())
        .bind(query.category.as_deref())
        .bind(i64::from(query.limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(observation_from_row).collect()
    }

    /// Statistics rows matching `query`, ordered by merchant then category.
    pub async fn statistics(
        &self,
        query: &StatisticsQuery,
    ) -> Result<Vec<RateStatistic>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.store_id, s.name, r.category,
                   r.current_rate, r.highest_rate, r.lowest_rate,
                   r.highest_date, r.lowest_date
              FROM rate_statistics r
              JOIN stores s ON s.id = r.store_id
             WHERE (?1 IS NULL OR instr(lower(s.name), lower(?1)) > 0)
               AND (?2 IS NULL OR r.category = ?2)
             ORDER BY s.name, r.category
            "#,
        )
        .bind(query.merchant.as_deref())
        .bind(query.category.as_deref())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RateStatistic {
                merchant_id: row.try_get("store_id")?,
                merchant_name: row.try_get("name")?,
                category: row.try_get("category")?,
                current_rate: row.try_get("current_rate")?,
                highest_rate: row.try_get("highest_rate")?,
                lowest_rate: row.try_get("lowest_rate")?,
                highest_date: row.try_get("highest_date")?,
                lowest_date: row.try_get("lowest_date")?,
            });
        }
        Ok(out)
    }
}

async fn write_scrape(
    tx: &mut Transaction<'_, Sqlite>,
    result: &ExtractionResult,
    scraped_at: DateTime<Utc>,
) -> Result<ScrapeReceipt, StoreError> {
    let (merchant_id, merchant_created) =
        upsert_merchant(tx, &result.merchant_name, &result.source_url, scraped_at).await?;

    let mut observations = 0usize;
    for (category, rate_text, rate_numeric) in result.observations() {
        sqlx::query(
            r#"
            INSERT INTO cashback_history (
                store_id, main_cashback, main_rate_numeric,
                category, category_rate, category_rate_numeric,
                is_upsized, previous_offer, scraping_success, error_message, scraped_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(merchant_id)
        .bind(&result.main_rate_text)
        .bind(result.main_rate_numeric)
        .bind(category)
        .bind(rate_text)
        .bind(rate_numeric)
        .bind(result.upsized)
        .bind(result.prior_offer.as_deref())
        .bind(result.success)
        .bind(result.error.as_deref())
        .bind(scraped_at)
        .execute(&mut **tx)
        .await?;
        observations += 1;
    }

    // A failed scrape still observed its Main rate (0), so it moves the
    // statistics like any other observation.
    let mut statistics_updated = 0usize;
    for (category, _, rate_numeric) in result.observations() {
        update_statistic(tx, merchant_id, &result.merchant_name, category, rate_numeric, scraped_at)
            .await?;
        statistics_updated += 1;
    }
    if !result.success {
        debug!("failed scrape recorded as a zero Main observation");
    }

    sqlx::query("UPDATE stores SET updated_at = ?1 WHERE id = ?2")
        .bind(scraped_at)
        .bind(merchant_id)
        .execute(&mut **tx)
        .await?;

    Ok(ScrapeReceipt {
        merchant_id,
        merchant_created,
        observations,
        statistics_updated,
        scraped_at,
    })
}

async fn upsert_merchant(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
    url: &str,
    at: DateTime<Utc>,
) -> Result<(i64, bool), StoreError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO stores (name, url, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?3)
        ON CONFLICT (name, url) DO NOTHING
        "#,
    )
    .bind(name)
    .bind(url)
    .bind(at)
    .execute(&mut **tx)
    .await?;

    let id: i64 = sqlx::query_scalar("SELECT id FROM stores WHERE name = ?1 AND url = ?2")
        .bind(name)
        .bind(url)
        .fetch_one(&mut **tx)
        .await?;
    let created = inserted.rows_affected() > 0;
    if created {
        info!(merchant_id = id, "new merchant");
    }
    Ok((id, created))
}

async fn update_statistic(
    tx: &mut Transaction<'_, Sqlite>,
    merchant_id: i64,
    merchant_name: &str,
    category: &str,
    rate: f64,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    let existing = sqlx::query(
        r#"
        SELECT current_rate, highest_rate, lowest_rate, highest_date, lowest_date
          FROM rate_statistics
         WHERE store_id = ?1 AND category = ?2
        "#,
    )
    .bind(merchant_id)
    .bind(category)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = existing else {
        sqlx::query(
            r#"
            INSERT INTO rate_statistics (
                store_id, category, current_rate, highest_rate, lowest_rate,
                highest_date, lowest_date, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?3, ?3, ?4, ?4, ?4, ?4)
            "#,
        )
        .bind(merchant_id)
        .bind(category)
        .bind(rate)
        .bind(at)
        .execute(&mut **tx)
        .await?;
        return Ok(());
    };

    let mut stat = RateStatistic {
        merchant_id,
        merchant_name: merchant_name.to_string(),
        category: category.to_string(),
        current_rate: row.try_get("current_rate")?,
        highest_rate: row.try_get("highest_rate")?,
        lowest_rate: row.try_get("lowest_rate")?,
        highest_date: row.try_get("highest_date")?,
        lowest_date: row.try_get("lowest_date")?,
    };
    stat.observe(rate, at);

    sqlx::query(
        r#"
        UPDATE rate_statistics
           SET current_rate = ?1, highest_rate = ?2, lowest_rate = ?3,
               highest_date = ?4, lowest_date = ?5, updated_at = ?6
         WHERE store_id = ?7 AND category = ?8
        "#,
    )
    .bind(stat.current_rate)
    .bind(stat.highest_rate)
    .bind(stat.lowest_rate)
    .bind(stat.highest_date)
    .bind(stat.lowest_date)
    .bind(at)
    .bind(merchant_id)
    .bind(category)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn observation_from_row(row: &SqliteRow) -> Result<RateObservation, StoreError> {
    Ok(RateObservation {
        id: row.try_get("id")?,
        merchant_id: row.try_get("store_id")?,
        merchant_name: row.try_get("name")?,
        merchant_url: row.try_get("url")?,
        main_rate_text: row.try_get("main_cashback")?,
        main_rate_numeric: row.try_get("main_rate_numeric")?,
        category: row.try_get("category")?,
        rate_text: row.try_get("category_rate")?,
        rate_numeric: row.try_get("category_rate_numeric")?,
        upsized: row.try_get("is_upsized")?,
        prior_offer: row.try_get("previous_offer")?,
        success: row.try_get("scraping_success")?,
        error: row.try_get("error_message")?,
        scraped_at: row.try_get("scraped_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cashtrack_core::{CategoryRate, MAIN_CATEGORY};
    use chrono::TimeZone;

    const AGODA_URL: &str = "https://www.shopback.com.au/agoda";

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).single().expect("valid date")
    }

    fn scraped(name: &str, url: &str, main: &str, categories: &[(&str, &str)]) -> ExtractionResult {
        let mut result = ExtractionResult::failure(name, url, "");
        result.success = true;
        result.error = None;
        result.main_rate_text = main.to_string();
        result.main_rate_numeric = cashtrack_core::parse_rate(main);
        result.categories = categories
            .iter()
            .map(|(label, rate)| CategoryRate::new(label, rate))
            .collect();
        result
    }

    async fn store() -> HistoryStore {
        HistoryStore::open_in_memory().await.expect("in-memory store")
    }

    async fn count(store: &HistoryStore, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(store.pool())
            .await
            .expect("count")
    }

    #[tokio::test]
    async fn first_scrape_creates_merchant_and_ledger_rows() {
        let s = store().await;
        let result = scraped(
            "Agoda",
            AGODA_URL,
            "Up to 4% Cashback",
            &[("Online Store", "4%"), ("App Exclusive", "6%")],
        );

        let receipt = s.record_scrape_at(result, at(1)).await.expect("record");
        assert!(receipt.merchant_created);
        assert_eq!(receipt.observations, 3);
        assert_eq!(receipt.statistics_updated, 3);

        let merchants = s.merchants().await.expect("merchants");
        assert_eq!(merchants.len(), 1);
        assert_eq!(merchants[0].name, "Agoda");
        assert_eq!(merchants[0].created_at, at(1));

        let history = s.history(&HistoryQuery::default()).await.expect("history");
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|o| o.main_rate_text == "Up to 4% Cashback"));
        assert!(history.iter().all(|o| o.scraped_at == at(1)));

        let stats = s.statistics(&StatisticsQuery::default()).await.expect("stats");
        let app = stats
            .iter()
            .find(|st| st.category == "App Exclusive")
            .expect("app stat");
        assert_eq!(app.current_rate, 6.0);
        assert_eq!(app.highest_rate, 6.0);
        assert_eq!(app.lowest_rate, 6.0);
        assert_eq!(app.highest_date, at(1));
        assert_eq!(app.lowest_date, at(1));
    }

    #[tokio::test]
    async fn extrema_only_move_on_strict_improvement() {
        let s = store().await;
        for (day, main) in [(1, "4%"), (2, "6%"), (3, "6%"), (4, "3%"), (5, "3%"), (6, "4%")] {
            s.record_scrape_at(scraped("Agoda", AGODA_URL, main, &[]), at(day))
                .await
                .expect("record");
        }

        let stats = s
            .statistics(&StatisticsQuery {
                merchant: None,
                category: Some(MAIN_CATEGORY.into()),
            })
            .await
            .expect("stats");
        assert_eq!(stats.len(), 1);
        let main = &stats[0];
        assert_eq!(main.current_rate, 4.0);
        assert_eq!(main.highest_rate, 6.0);
        assert_eq!(main.highest_date, at(2));
        assert_eq!(main.lowest_rate, 3.0);
        assert_eq!(main.lowest_date, at(4));
        assert!(main.lowest_rate <= main.current_rate && main.current_rate <= main.highest_rate);

        let merchants = s.merchants().await.expect("merchants");
        assert_eq!(merchants[0].created_at, at(1));
        assert_eq!(merchants[0].updated_at, at(6));
    }

    #[tokio::test]
    async fn failed_scrape_records_a_zero_main_observation() {
        let s = store().await;
        s.record_scrape_at(scraped("Agoda", AGODA_URL, "5%", &[]), at(1))
            .await
            .expect("record ok");

        let failure = ExtractionResult::failure("Agoda", AGODA_URL, "connection reset");
        let receipt = s.record_scrape_at(failure, at(2)).await.expect("record failure");
        assert!(!receipt.merchant_created);
        assert_eq!(receipt.observations, 1);
        assert_eq!(receipt.statistics_updated, 1);

        let latest = s.history(&HistoryQuery::default()).await.expect("history");
        assert_eq!(latest.len(), 2);
        assert!(!latest[0].success);
        assert_eq!(latest[0].error.as_deref(), Some("connection reset"));
        assert_eq!(latest[0].category, MAIN_CATEGORY);
        assert_eq!(latest[0].rate_numeric, 0.0);

        let stats = s.statistics(&StatisticsQuery::default()).await.expect("stats");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].current_rate, 0.0);
        assert_eq!(stats[0].lowest_rate, 0.0);
        assert_eq!(stats[0].lowest_date, at(2));
        assert_eq!(stats[0].highest_rate, 5.0);
        assert_eq!(stats[0].highest_date, at(1));
        let ledger_min = latest.iter().map(|o| o.rate_numeric).fold(f64::INFINITY, f64::min);
        assert!(stats[0].lowest_rate <= ledger_min);
    }

    #[tokio::test]
    async fn failed_transaction_leaves_no_trace_and_rerun_is_consistent() {
        let s = store().await;
        let result = scraped("Agoda", AGODA_URL, "Up to 4% Cashback", &[("Hotels", "7%")]);

        // Make the statistics step fail after the merchant and ledger writes.
        sqlx::query("ALTER TABLE rate_statistics RENAME TO rate_statistics_offline")
            .execute(s.pool())
            .await
            .expect("take statistics offline");

        let err = s
            .record_scrape_at(result, at(1))
            .await
            .expect_err("statistics table is missing");
        assert!(matches!(err.source, StoreError::Database(_)));
        assert_eq!(err.result.merchant_name, "Agoda");
        assert_eq!(err.result.categories.len(), 1);
        assert_eq!(count(&s, "stores").await, 0);
        assert_eq!(count(&s, "cashback_history").await, 0);

        sqlx::query("ALTER TABLE rate_statistics_offline RENAME TO rate_statistics")
            .execute(s.pool())
            .await
            .expect("restore statistics");

        s.record_scrape_at(*err.result, at(1)).await.expect("rerun");
        assert_eq!(count(&s, "stores").await, 1);
        assert_eq!(count(&s, "cashback_history").await, 2);
        assert_eq!(count(&s, "rate_statistics").await, 2);
    }

    #[tokio::test]
    async fn history_filters_and_limit() {
        let s = store().await;
        s.record_scrape_at(
            scraped("Agoda", AGODA_URL, "4%", &[("Hotels", "7%")]),
            at(1),
        )
        .await
        .expect("agoda");
        s.record_scrape_at(
            scraped("David Jones", "https://www.shopback.com.au/david-jones", "6%", &[("Fashion", "6%")]),
            at(2),
        )
        .await
        .expect("david jones");
        s.record_scrape_at(scraped("Agoda", AGODA_URL, "5%", &[("Hotels", "8%")]), at(3))
            .await
            .expect("agoda again");

        let agoda = s
            .history(&HistoryQuery {
                merchant: Some("aGo".into()),
                ..Default::default()
            })
            .await
            .expect("history");
        assert_eq!(agoda.len(), 4);
        assert!(agoda.iter().all(|o| o.merchant_name == "Agoda"));
        assert_eq!(agoda[0].scraped_at, at(3));

        let hotels = s
            .history(&HistoryQuery {
                url: Some(AGODA_URL.into()),
                category: Some("Hotels".into()),
                limit: 1,
                ..Default::default()
            })
            .await
            .expect("hotels");
        assert_eq!(hotels.len(), 1);
        assert_eq!(hotels[0].rate_text, "8%");

        let stats = s
            .statistics(&StatisticsQuery {
                merchant: Some("david".into()),
                category: None,
            })
            .await
            .expect("stats");
        let categories: Vec<_> = stats.iter().map(|st| st.category.as_str()).collect();
        assert_eq!(categories, vec!["Fashion", MAIN_CATEGORY]);
    }

    async fn file_store(dir: &Path) -> HistoryStore {
        let url = format!("sqlite://{}", dir.join("history.db").display());
        let store = HistoryStore::connect(&url).await.expect("file store");
        store.migrate().await.expect("migrate");
        store
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_for_one_merchant_are_serialized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = Arc::new(file_store(dir.path()).await);
        let rates: Vec<f64> = (0..20).map(|i| f64::from((i * 7) % 13) + 0.5).collect();

        let mut tasks = Vec::new();
        for (i, rate) in rates.iter().copied().enumerate() {
            let s = Arc::clone(&s);
            let scraped_at = at(1) + chrono::Duration::seconds(i as i64);
            tasks.push(tokio::spawn(async move {
                let result = scraped("Agoda", AGODA_URL, &format!("{rate}%"), &[]);
                s.record_scrape_at(result, scraped_at).await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("record");
        }

        assert_eq!(count(&s, "stores").await, 1);
        assert_eq!(count(&s, "cashback_history").await, rates.len() as i64);
        let stats = s.statistics(&StatisticsQuery::default()).await.expect("stats");
        assert_eq!(stats.len(), 1);
        let max = rates.iter().copied().fold(f64::MIN, f64::max);
        let min = rates.iter().copied().fold(f64::MAX, f64::min);
        assert_eq!(stats[0].highest_rate, max);
        assert_eq!(stats[0].lowest_rate, min);
        assert!(rates.contains(&stats[0].current_rate));
        assert!(s.merchant_locks.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn a_held_merchant_lock_blocks_only_that_merchant() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = file_store(dir.path()).await;
        let agoda_key = ("Agoda".to_string(), AGODA_URL.to_string());
        let lock = s.merchant_lock(&agoda_key).await;
        let held = lock.acquire().await.expect("acquire");

        let other = scraped("David Jones", "https://www.shopback.com.au/david-jones", "6%", &[]);
        tokio::time::timeout(Duration::from_secs(5), s.record_scrape_at(other, at(1)))
            .await
            .expect("other merchant is not blocked")
            .expect("record");

        let blocked = tokio::time::timeout(
            Duration::from_millis(200),
            s.record_scrape_at(scraped("Agoda", AGODA_URL, "4%", &[]), at(2)),
        )
        .await;
        assert!(blocked.is_err(), "write for a locked merchant must wait");

        drop(held);
        s.record_scrape_at(scraped("Agoda", AGODA_URL, "4%", &[]), at(3))
            .await
            .expect("record after release");
        assert_eq!(count(&s, "stores").await, 2);
    }

    #[tokio::test]
    async fn merchant_lock_entries_are_released_after_writes() {
        let s = store().await;
        s.record_scrape_at(scraped("Agoda", AGODA_URL, "4%", &[]), at(1))
            .await
            .expect("record");
        assert!(s.merchant_locks.lock().await.is_empty());
    }
}
