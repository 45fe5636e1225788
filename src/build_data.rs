//! BuildData consistency check (`spec.md` §6 "BuildData consistency").
//!
//! Compares the persisted build fingerprint against the current
//! configuration on every `Engine::start`. A changed fingerprint means
//! the binary was rebuilt against a different runtime version, scope
//! key, or update URL since the catalog was last populated — in that
//! case stored updates no longer mean anything and are dropped, while
//! on-disk asset files are kept since they are content-addressed and
//! may still be reused.

use crate::catalog::Catalog;
use crate::config::UpdatesConfig;
use anyhow::Result;
use tracing::info;

/// Runs the consistency check and resets the catalog if the
/// fingerprint changed. Returns `true` if a reset happened.
pub async fn check_and_reconcile(catalog: &Catalog, config: &UpdatesConfig) -> Result<bool> {
    let current = (
        config.runtime_version.clone(),
        config.scope_key.clone().unwrap_or_default(),
        config.update_url.clone().unwrap_or_default(),
    );

    let changed = match catalog.get_build_fingerprint().await? {
        Some(persisted) => persisted != current,
        None => false,
    };

    if changed {
        info!("build fingerprint changed; resetting catalog (assets kept on disk)");
        catalog.reset_keeping_files().await?;
    }

    catalog
        .set_build_fingerprint(&current.0, &current.1, &current.2)
        .await?;

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdatesConfig;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path, runtime_version: &str) -> UpdatesConfig {
        UpdatesConfig::new(
            dir.to_path_buf(),
            runtime_version.to_string(),
            Some(true),
            Some("https://example.com/updates".to_string()),
            Some("scope".to_string()),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn first_run_does_not_reset_but_stamps_fingerprint() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), "1.0.0");

        let changed = check_and_reconcile(&catalog, &cfg).await.unwrap();
        assert!(!changed);
        let fingerprint = catalog.get_build_fingerprint().await.unwrap().unwrap();
        assert_eq!(fingerprint.0, "1.0.0");
    }

    #[tokio::test]
    async fn changed_runtime_version_resets_catalog() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let dir = tempdir().unwrap();
        check_and_reconcile(&catalog, &config(dir.path(), "1.0.0")).await.unwrap();

        let update = crate::catalog::model::UpdateEntity::new_pending(
            "u1".to_string(),
            100,
            "1.0.0".to_string(),
            "scope".to_string(),
            serde_json::json!({}),
            Default::default(),
        );
        catalog.insert_pending_update(&update).await.unwrap();

        let changed = check_and_reconcile(&catalog, &config(dir.path(), "2.0.0")).await.unwrap();
        assert!(changed);
        assert!(catalog.get_update("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unchanged_runtime_version_does_not_reset() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let dir = tempdir().unwrap();
        check_and_reconcile(&catalog, &config(dir.path(), "1.0.0")).await.unwrap();

        let update = crate::catalog::model::UpdateEntity::new_pending(
            "u1".to_string(),
            100,
            "1.0.0".to_string(),
            "scope".to_string(),
            serde_json::json!({}),
            Default::default(),
        );
        catalog.insert_pending_update(&update).await.unwrap();

        let changed = check_and_reconcile(&catalog, &config(dir.path(), "1.0.0")).await.unwrap();
        assert!(!changed);
        assert!(catalog.get_update("u1").await.unwrap().is_some());
    }
}
