//! Persistent inventory of stored updates and assets (`spec.md` §3, §4.1).
//!
//! Guarded by a `databaseLease` acquire/release protocol (`spec.md` §5):
//! writers take an exclusive lease, readers take a shared one. Modeled as
//! a `tokio::sync::RwLock<()>` so release on every exit path — success,
//! error, or panic — is automatic via `Drop`, rather than relying on
//! callers to remember to release a handle.

pub mod model;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};

pub use model::{AssetEntity, ManifestFilters, UpdateAssetLink, UpdateEntity, UpdateStatus};

/// A held read lease on the Catalog. Dropping it releases the lease.
pub struct CatalogReadLease {
    _guard: OwnedRwLockReadGuard<()>,
}

/// A held write lease on the Catalog. Dropping it releases the lease.
pub struct CatalogWriteLease {
    _guard: OwnedRwLockWriteGuard<()>,
}

#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
    lease: Arc<RwLock<()>>,
}

impl Catalog {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create catalog dir {}", parent.display()))?;
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self {
            pool,
            lease: Arc::new(RwLock::new(())),
        })
    }

    /// Open an in-memory catalog. Used in tests and for a disabled engine.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::migrate(&pool).await?;
        Ok(Self {
            pool,
            lease: Arc::new(RwLock::new(())),
        })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        let sql = include_str!("migrations/001_init.sql");
        for stmt in sql.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }
        Ok(())
    }

    pub async fn acquire_read(&self) -> CatalogReadLease {
        CatalogReadLease {
            _guard: Arc::clone(&self.lease).read_owned().await,
        }
    }

    pub async fn acquire_write(&self) -> CatalogWriteLease {
        CatalogWriteLease {
            _guard: Arc::clone(&self.lease).write_owned().await,
        }
    }

    // ─── Updates ──────────────────────────────────────────────────────────────

    pub async fn insert_pending_update(&self, update: &UpdateEntity) -> Result<()> {
        let _lease = self.acquire_write().await;
        self.insert_pending_update_locked(update).await
    }

    async fn insert_pending_update_locked(&self, update: &UpdateEntity) -> Result<()> {
        let manifest = serde_json::to_string(&update.manifest)?;
        let filters = serde_json::to_string(&update.manifest_filters)?;
        sqlx::query(
            "INSERT INTO updates (id, commit_time, runtime_version, scope_key, manifest, status, \
             failed_launch_count, successful_launch_count, last_accessed_at, manifest_filters) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&update.id)
        .bind(update.commit_time)
        .bind(&update.runtime_version)
        .bind(&update.scope_key)
        .bind(&manifest)
        .bind(update.status.as_str())
        .bind(update.failed_launch_count as i64)
        .bind(update.successful_launch_count as i64)
        .bind(update.last_accessed_at.to_rfc3339())
        .bind(&filters)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_asset_if_missing(&self, asset: &AssetEntity) -> Result<()> {
        let _lease = self.acquire_write().await;
        self.insert_asset_if_missing_locked(asset).await
    }

    async fn insert_asset_if_missing_locked(&self, asset: &AssetEntity) -> Result<()> {
        sqlx::query(
            "INSERT INTO assets (key, asset_type, url, expected_hash, downloaded_at, \
             embedded_asset_filename, marked_for_deletion) \
             VALUES (?, ?, ?, ?, ?, ?, 0) \
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(&asset.key)
        .bind(&asset.asset_type)
        .bind(&asset.url)
        .bind(&asset.expected_hash)
        .bind(asset.downloaded_at.map(|t| t.to_rfc3339()))
        .bind(&asset.embedded_asset_filename)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn link_asset_locked(
        &self,
        update_id: &str,
        asset_key: &str,
        is_launch_asset: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO update_assets (update_id, asset_key, is_launch_asset) VALUES (?, ?, ?) \
             ON CONFLICT(update_id, asset_key) DO UPDATE SET is_launch_asset = excluded.is_launch_asset",
        )
        .bind(update_id)
        .bind(asset_key)
        .bind(is_launch_asset as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Commit a fully-downloaded update: insert the update row, insert any
    /// new asset rows, link them, and flip status to `Ready` — all in one
    /// transaction (`spec.md` §4.2 step 6).
    pub async fn commit_loaded_update(
        &self,
        update: &UpdateEntity,
        assets: &[AssetEntity],
        links: &[UpdateAssetLink],
    ) -> Result<()> {
        let _lease = self.acquire_write().await;

        let manifest = serde_json::to_string(&update.manifest)?;
        let filters = serde_json::to_string(&update.manifest_filters)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO updates (id, commit_time, runtime_version, scope_key, manifest, status, \
             failed_launch_count, successful_launch_count, last_accessed_at, manifest_filters) \
             VALUES (?, ?, ?, ?, ?, 'pending', 0, 0, ?, ?) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&update.id)
        .bind(update.commit_time)
        .bind(&update.runtime_version)
        .bind(&update.scope_key)
        .bind(&manifest)
        .bind(update.last_accessed_at.to_rfc3339())
        .bind(&filters)
        .execute(&mut *tx)
        .await?;

        for asset in assets {
            sqlx::query(
                "INSERT INTO assets (key, asset_type, url, expected_hash, downloaded_at, \
                 embedded_asset_filename, marked_for_deletion) \
                 VALUES (?, ?, ?, ?, ?, ?, 0) \
                 ON CONFLICT(key) DO UPDATE SET downloaded_at = excluded.downloaded_at",
            )
            .bind(&asset.key)
            .bind(&asset.asset_type)
            .bind(&asset.url)
            .bind(&asset.expected_hash)
            .bind(asset.downloaded_at.map(|t| t.to_rfc3339()))
            .bind(&asset.embedded_asset_filename)
            .execute(&mut *tx)
            .await?;
        }

        for link in links {
            sqlx::query(
                "INSERT INTO update_assets (update_id, asset_key, is_launch_asset) VALUES (?, ?, ?) \
                 ON CONFLICT(update_id, asset_key) DO UPDATE SET is_launch_asset = excluded.is_launch_asset",
            )
            .bind(&link.update_id)
            .bind(&link.asset_key)
            .bind(link.is_launch_asset as i64)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE updates SET status = 'ready' WHERE id = ?")
            .bind(&update.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(update_id = %update.id, asset_count = assets.len(), "update committed as Ready");
        Ok(())
    }

    /// Register the binary's embedded fallback payload as an `Embedded`
    /// update row, idempotently. Called once at `Engine::start` when
    /// `has_embedded_update` is set (`spec.md` §6 "hasEmbeddedUpdate").
    pub async fn insert_embedded_update(&self, update: &UpdateEntity, asset: &AssetEntity) -> Result<()> {
        let _lease = self.acquire_write().await;
        let manifest = serde_json::to_string(&update.manifest)?;
        let filters = serde_json::to_string(&update.manifest_filters)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO updates (id, commit_time, runtime_version, scope_key, manifest, status, \
             failed_launch_count, successful_launch_count, last_accessed_at, manifest_filters) \
             VALUES (?, ?, ?, ?, ?, 'embedded', 0, 0, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET status = 'embedded'",
        )
        .bind(&update.id)
        .bind(update.commit_time)
        .bind(&update.runtime_version)
        .bind(&update.scope_key)
        .bind(&manifest)
        .bind(update.last_accessed_at.to_rfc3339())
        .bind(&filters)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO assets (key, asset_type, url, expected_hash, downloaded_at, \
             embedded_asset_filename, marked_for_deletion) \
             VALUES (?, ?, ?, ?, ?, ?, 0) \
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(&asset.key)
        .bind(&asset.asset_type)
        .bind(&asset.url)
        .bind(&asset.expected_hash)
        .bind(asset.downloaded_at.map(|t| t.to_rfc3339()))
        .bind(&asset.embedded_asset_filename)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO update_assets (update_id, asset_key, is_launch_asset) VALUES (?, ?, 1) \
             ON CONFLICT(update_id, asset_key) DO UPDATE SET is_launch_asset = 1",
        )
        .bind(&update.id)
        .bind(&asset.key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(update_id = %update.id, "embedded update registered");
        Ok(())
    }

    pub async fn mark_launchable(&self, update_id: &str) -> Result<()> {
        let _lease = self.acquire_write().await;
        sqlx::query("UPDATE updates SET status = 'launchable' WHERE id = ? AND status != 'embedded'")
            .bind(update_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed_launch(&self, update_id: &str) -> Result<u64> {
        let _lease = self.acquire_write().await;
        sqlx::query("UPDATE updates SET failed_launch_count = failed_launch_count + 1 WHERE id = ?")
            .bind(update_id)
            .execute(&self.pool)
            .await?;
        let row: (i64,) = sqlx::query_as("SELECT failed_launch_count FROM updates WHERE id = ?")
            .bind(update_id)
            .fetch_one(&self.pool)
            .await?;
        debug!(update_id, count = row.0, "failed launch recorded");
        Ok(row.0 as u64)
    }

    pub async fn mark_successful_launch(&self, update_id: &str) -> Result<u64> {
        let _lease = self.acquire_write().await;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE updates SET successful_launch_count = successful_launch_count + 1, \
             last_accessed_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(update_id)
        .execute(&self.pool)
        .await?;
        let row: (i64,) = sqlx::query_as("SELECT successful_launch_count FROM updates WHERE id = ?")
            .bind(update_id)
            .fetch_one(&self.pool)
            .await?;
        debug!(update_id, count = row.0, "successful launch recorded");
        Ok(row.0 as u64)
    }

    pub async fn touch_last_accessed(&self, update_id: &str) -> Result<()> {
        let _lease = self.acquire_write().await;
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE updates SET last_accessed_at = ? WHERE id = ?")
            .bind(&now)
            .bind(update_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_update(&self, id: &str) -> Result<Option<UpdateEntity>> {
        let _lease = self.acquire_read().await;
        let row = sqlx::query("SELECT * FROM updates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_update).transpose()
    }

    /// All updates whose status is `Ready`/`Launchable`/`Embedded`/
    /// `StatusReady0` and whose `runtime_version` matches the binary —
    /// the candidate pool `SelectionPolicy` chooses from.
    pub async fn list_candidates(&self, runtime_version: &str) -> Result<Vec<UpdateEntity>> {
        let _lease = self.acquire_read().await;
        let rows = sqlx::query(
            "SELECT * FROM updates WHERE runtime_version = ? \
             AND status IN ('ready', 'launchable', 'embedded', 'status_ready_0') \
             ORDER BY commit_time DESC",
        )
        .bind(runtime_version)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_update).collect()
    }

    pub async fn list_all_updates(&self) -> Result<Vec<UpdateEntity>> {
        let _lease = self.acquire_read().await;
        let rows = sqlx::query("SELECT * FROM updates ORDER BY commit_time DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_update).collect()
    }

    /// Delete an update and its asset links (Reaper; `spec.md` §3
    /// Lifecycle). The asset *files* are left on disk — content-addressed
    /// files are safe to keep and may still be referenced by another
    /// update; `FileStore::sweep_orphans` reclaims truly unreferenced ones.
    pub async fn delete_update(&self, update_id: &str) -> Result<()> {
        let _lease = self.acquire_write().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM update_assets WHERE update_id = ?")
            .bind(update_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM updates WHERE id = ?")
            .bind(update_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(update_id, "update reaped");
        Ok(())
    }

    // ─── Assets ───────────────────────────────────────────────────────────────

    pub async fn get_asset(&self, key: &str) -> Result<Option<AssetEntity>> {
        let _lease = self.acquire_read().await;
        let row = sqlx::query("SELECT * FROM assets WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_asset).transpose()
    }

    /// Assets for an update, paired with whether they are the launch asset.
    pub async fn assets_for_update(&self, update_id: &str) -> Result<Vec<(AssetEntity, bool)>> {
        let _lease = self.acquire_read().await;
        let rows = sqlx::query(
            "SELECT a.*, ua.is_launch_asset as link_is_launch_asset FROM assets a \
             JOIN update_assets ua ON ua.asset_key = a.key \
             WHERE ua.update_id = ?",
        )
        .bind(update_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let is_launch_asset: i64 = row.try_get("link_is_launch_asset")?;
                Ok((row_to_asset(row)?, is_launch_asset != 0))
            })
            .collect()
    }

    pub async fn launch_asset_for_update(&self, update_id: &str) -> Result<Option<AssetEntity>> {
        let assets = self.assets_for_update(update_id).await?;
        Ok(assets
            .into_iter()
            .find(|(_, is_launch)| *is_launch)
            .map(|(a, _)| a))
    }

    /// Reference count of an asset across all updates — used by the
    /// reaper to decide whether a file can be deleted from disk.
    pub async fn asset_reference_count(&self, asset_key: &str) -> Result<i64> {
        let _lease = self.acquire_read().await;
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM update_assets WHERE asset_key = ?")
                .bind(asset_key)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    // ─── Manifest metadata (extra params) ──────────────────────────────────────

    pub async fn get_extra_param(&self, key: &str) -> Result<Option<String>> {
        let _lease = self.acquire_read().await;
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM manifest_metadata WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn get_all_extra_params(&self) -> Result<HashMap<String, String>> {
        let _lease = self.acquire_read().await;
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM manifest_metadata")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn set_extra_param(&self, key: &str, value: &str) -> Result<()> {
        let _lease = self.acquire_write().await;
        sqlx::query(
            "INSERT INTO manifest_metadata (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── BuildData ──────────────────────────────────────────────────────────

    pub async fn get_build_fingerprint(&self) -> Result<Option<(String, String, String)>> {
        let _lease = self.acquire_read().await;
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT runtime_version, scope_key, update_url FROM build_fingerprint WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn set_build_fingerprint(
        &self,
        runtime_version: &str,
        scope_key: &str,
        update_url: &str,
    ) -> Result<()> {
        let _lease = self.acquire_write().await;
        sqlx::query(
            "INSERT INTO build_fingerprint (id, runtime_version, scope_key, update_url) \
             VALUES (1, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET runtime_version = excluded.runtime_version, \
             scope_key = excluded.scope_key, update_url = excluded.update_url",
        )
        .bind(runtime_version)
        .bind(scope_key)
        .bind(update_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop all stored updates and asset records (on-disk files are kept —
    /// they are content-addressed and safe to re-reference). `spec.md` §6
    /// BuildData consistency.
    pub async fn reset_keeping_files(&self) -> Result<()> {
        let _lease = self.acquire_write().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM update_assets").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM updates").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM assets").execute(&mut *tx).await?;
        tx.commit().await?;
        info!("catalog reset after build fingerprint change (on-disk assets preserved)");
        Ok(())
    }
}

fn row_to_update(row: sqlx::sqlite::SqliteRow) -> Result<UpdateEntity> {
    let status_str: String = row.try_get("status")?;
    let status = UpdateStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("unknown update status {status_str}"))?;
    let manifest_str: String = row.try_get("manifest")?;
    let filters_str: String = row.try_get("manifest_filters")?;
    let last_accessed_str: String = row.try_get("last_accessed_at")?;
    Ok(UpdateEntity {
        id: row.try_get("id")?,
        commit_time: row.try_get("commit_time")?,
        runtime_version: row.try_get("runtime_version")?,
        scope_key: row.try_get("scope_key")?,
        manifest: serde_json::from_str(&manifest_str)?,
        status,
        failed_launch_count: row.try_get::<i64, _>("failed_launch_count")? as u64,
        successful_launch_count: row.try_get::<i64, _>("successful_launch_count")? as u64,
        last_accessed_at: chrono::DateTime::parse_from_rfc3339(&last_accessed_str)?
            .with_timezone(&Utc),
        manifest_filters: serde_json::from_str(&filters_str)?,
    })
}

fn row_to_asset(row: sqlx::sqlite::SqliteRow) -> Result<AssetEntity> {
    let downloaded_at: Option<String> = row.try_get("downloaded_at")?;
    Ok(AssetEntity {
        key: row.try_get("key")?,
        asset_type: row.try_get("asset_type")?,
        url: row.try_get("url")?,
        expected_hash: row.try_get("expected_hash")?,
        downloaded_at: downloaded_at
            .map(|s| chrono::DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()?,
        embedded_asset_filename: row.try_get("embedded_asset_filename")?,
        marked_for_deletion: row.try_get::<i64, _>("marked_for_deletion")? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn sample_update(id: &str, commit_time: i64) -> UpdateEntity {
        UpdateEntity::new_pending(
            id.to_string(),
            commit_time,
            "1.0.0".to_string(),
            "scope".to_string(),
            serde_json::json!({"id": id}),
            Map::new(),
        )
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trips() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let update = sample_update("u1", 100);
        catalog.insert_pending_update(&update).await.unwrap();

        let fetched = catalog.get_update("u1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "u1");
        assert_eq!(fetched.status, UpdateStatus::Pending);
        assert_eq!(fetched.failed_launch_count, 0);
    }

    #[tokio::test]
    async fn counters_never_decrease() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let update = sample_update("u1", 100);
        catalog.insert_pending_update(&update).await.unwrap();

        let c1 = catalog.mark_failed_launch("u1").await.unwrap();
        let c2 = catalog.mark_failed_launch("u1").await.unwrap();
        assert_eq!(c1, 1);
        assert_eq!(c2, 2);

        let s1 = catalog.mark_successful_launch("u1").await.unwrap();
        assert_eq!(s1, 1);
    }

    #[tokio::test]
    async fn commit_loaded_update_flips_to_ready_with_launch_asset() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let update = sample_update("u1", 100);
        let asset = AssetEntity {
            key: "hash1".to_string(),
            asset_type: "bundle".to_string(),
            url: Some("https://example.com/a".to_string()),
            expected_hash: "hash1".to_string(),
            downloaded_at: Some(Utc::now()),
            embedded_asset_filename: None,
            marked_for_deletion: false,
        };
        let link = UpdateAssetLink {
            update_id: "u1".to_string(),
            asset_key: "hash1".to_string(),
            is_launch_asset: true,
        };
        catalog
            .commit_loaded_update(&update, &[asset], &[link])
            .await
            .unwrap();

        let fetched = catalog.get_update("u1").await.unwrap().unwrap();
        assert_eq!(fetched.status, UpdateStatus::Ready);

        let launch_asset = catalog.launch_asset_for_update("u1").await.unwrap().unwrap();
        assert_eq!(launch_asset.key, "hash1");
    }

    #[tokio::test]
    async fn candidates_filter_by_runtime_version_and_status() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let mut pending = sample_update("pending", 50);
        pending.status = UpdateStatus::Pending;
        catalog.insert_pending_update(&pending).await.unwrap();

        let asset = AssetEntity {
            key: "h".to_string(),
            asset_type: "bundle".to_string(),
            url: None,
            expected_hash: "h".to_string(),
            downloaded_at: Some(Utc::now()),
            embedded_asset_filename: None,
            marked_for_deletion: false,
        };
        let ready = sample_update("ready", 200);
        catalog
            .commit_loaded_update(
                &ready,
                &[asset],
                &[UpdateAssetLink {
                    update_id: "ready".to_string(),
                    asset_key: "h".to_string(),
                    is_launch_asset: true,
                }],
            )
            .await
            .unwrap();

        let candidates = catalog.list_candidates("1.0.0").await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "ready");
    }

    #[tokio::test]
    async fn extra_params_round_trip() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        catalog.set_extra_param("k", "v").await.unwrap();
        assert_eq!(catalog.get_extra_param("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn insert_embedded_update_is_idempotent() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let embedded = sample_update("embedded", 0);
        let asset = AssetEntity {
            key: "embedded-asset".to_string(),
            asset_type: "bundle".to_string(),
            url: None,
            expected_hash: "embedded-asset".to_string(),
            downloaded_at: None,
            embedded_asset_filename: Some("index.android.bundle".to_string()),
            marked_for_deletion: false,
        };
        catalog.insert_embedded_update(&embedded, &asset).await.unwrap();
        catalog.insert_embedded_update(&embedded, &asset).await.unwrap();

        let fetched = catalog.get_update("embedded").await.unwrap().unwrap();
        assert_eq!(fetched.status, UpdateStatus::Embedded);
        let launch_asset = catalog.launch_asset_for_update("embedded").await.unwrap().unwrap();
        assert_eq!(launch_asset.key, "embedded-asset");
    }

    #[tokio::test]
    async fn reset_keeping_files_clears_all_tables() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let update = sample_update("u1", 100);
        catalog.insert_pending_update(&update).await.unwrap();
        catalog.reset_keeping_files().await.unwrap();
        assert!(catalog.get_update("u1").await.unwrap().is_none());
    }
}
