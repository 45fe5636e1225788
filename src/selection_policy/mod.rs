//! Pure, side-effect-free decision functions (`spec.md` §4.1).
//!
//! Composed from three trait objects so a caller can swap one axis —
//! e.g. the developer-client reaper — without touching the others, the
//! way `clawd`'s `FallbackEngine` and `RateLimitTracker` are independent
//! strategy objects wired together by the scheduler rather than one
//! monolithic policy type.

use crate::catalog::model::{ManifestFilters, UpdateEntity};
use std::collections::HashMap;

/// Evaluate whether `filters` (server-provided, from the response
/// headers) are satisfied by an update's own `manifest_filters`. An
/// update's filter key is satisfied if the response filters don't
/// mention that key, or mention it with the same value.
pub fn filters_satisfied(update_filters: &ManifestFilters, response_filters: &ManifestFilters) -> bool {
    update_filters.iter().all(|(k, v)| {
        response_filters
            .get(k)
            .map(|rv| rv == v)
            .unwrap_or(true)
    })
}

/// Parse the `manifestFilters` response header: a comma-separated
/// `key=value` list (`spec.md` §6).
pub fn parse_manifest_filters_header(header: &str) -> ManifestFilters {
    header
        .split(',')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.trim();
            let value = parts.next()?.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

// ─── Strategy traits ──────────────────────────────────────────────────────────

pub trait LauncherSelectionPolicy: Send + Sync {
    /// Pick the best stored update for launch, or `None` if none qualify.
    fn choose_launcher_update<'a>(
        &self,
        candidates: &'a [UpdateEntity],
        runtime_version: &str,
        filters: &ManifestFilters,
    ) -> Option<&'a UpdateEntity>;
}

pub trait LoaderSelectionPolicy: Send + Sync {
    fn should_load_new_update(
        &self,
        candidate: &UpdateEntity,
        currently_launched: &UpdateEntity,
        filters: &ManifestFilters,
    ) -> bool;

    fn should_load_rollback_directive(
        &self,
        directive_commit_time: i64,
        embedded: &UpdateEntity,
        currently_launched: &UpdateEntity,
        filters: &ManifestFilters,
    ) -> bool;
}

pub trait ReaperSelectionPolicy: Send + Sync {
    /// Returns the ids of updates eligible for deletion.
    fn updates_to_reap<'a>(
        &self,
        all_updates: &'a [UpdateEntity],
        currently_launched_id: &str,
        embedded_id: &str,
    ) -> Vec<&'a UpdateEntity>;
}

// ─── Default policy ───────────────────────────────────────────────────────────

/// Default launcher policy: among candidates whose `runtime_version`
/// matches and whose filters are satisfied, pick the largest
/// `commit_time`; break ties by `id` lexicographically. Excludes any
/// update that has failed at least once and never launched successfully.
#[derive(Default, Clone, Copy)]
pub struct DefaultLauncherPolicy;

impl LauncherSelectionPolicy for DefaultLauncherPolicy {
    fn choose_launcher_update<'a>(
        &self,
        candidates: &'a [UpdateEntity],
        runtime_version: &str,
        filters: &ManifestFilters,
    ) -> Option<&'a UpdateEntity> {
        candidates
            .iter()
            .filter(|u| u.runtime_version == runtime_version)
            .filter(|u| filters_satisfied(&u.manifest_filters, filters))
            .filter(|u| !u.is_launch_excluded())
            .max_by(|a, b| a.commit_time.cmp(&b.commit_time).then_with(|| a.id.cmp(&b.id)))
    }
}

#[derive(Default, Clone, Copy)]
pub struct DefaultLoaderPolicy;

impl LoaderSelectionPolicy for DefaultLoaderPolicy {
    fn should_load_new_update(
        &self,
        candidate: &UpdateEntity,
        currently_launched: &UpdateEntity,
        filters: &ManifestFilters,
    ) -> bool {
        filters_satisfied(&candidate.manifest_filters, filters)
            && candidate.commit_time > currently_launched.commit_time
    }

    fn should_load_rollback_directive(
        &self,
        directive_commit_time: i64,
        embedded: &UpdateEntity,
        currently_launched: &UpdateEntity,
        filters: &ManifestFilters,
    ) -> bool {
        directive_commit_time > currently_launched.commit_time
            && filters_satisfied(&embedded.manifest_filters, filters)
    }
}

/// Keep the currently-launched update, the newest launchable, and the
/// embedded update; everything else older than the newest launchable is
/// eligible for deletion (`spec.md` §4.1 Reaper predicate).
#[derive(Default, Clone, Copy)]
pub struct DefaultReaperPolicy;

impl ReaperSelectionPolicy for DefaultReaperPolicy {
    fn updates_to_reap<'a>(
        &self,
        all_updates: &'a [UpdateEntity],
        currently_launched_id: &str,
        embedded_id: &str,
    ) -> Vec<&'a UpdateEntity> {
        let newest_launchable = all_updates
            .iter()
            .filter(|u| u.status.is_ready_or_better())
            .max_by_key(|u| u.commit_time);

        let Some(newest) = newest_launchable else {
            return Vec::new();
        };

        all_updates
            .iter()
            .filter(|u| u.id != currently_launched_id)
            .filter(|u| u.id != embedded_id)
            .filter(|u| u.id != newest.id)
            .filter(|u| u.commit_time < newest.commit_time)
            .collect()
    }
}

/// Developer-client variant: keeps everything except the currently
/// launched update (`spec.md` §4.1 "development reaper").
#[derive(Default, Clone, Copy)]
pub struct DevelopmentReaperPolicy;

impl ReaperSelectionPolicy for DevelopmentReaperPolicy {
    fn updates_to_reap<'a>(
        &self,
        all_updates: &'a [UpdateEntity],
        currently_launched_id: &str,
        _embedded_id: &str,
    ) -> Vec<&'a UpdateEntity> {
        all_updates
            .iter()
            .filter(|u| u.id != currently_launched_id)
            .collect()
    }
}

/// Wraps a `LauncherSelectionPolicy` so it is used for exactly one
/// `choose_launcher_update` call, then the wrapper reverts to the
/// wrapped default. Resolves the `setNextSelectionPolicy` /
/// `resetSelectionPolicyToDefault` Open Question named in `spec.md` §9.
pub struct OneShotPolicy<P: LauncherSelectionPolicy> {
    default: P,
    next: std::sync::Mutex<Option<Box<dyn LauncherSelectionPolicy>>>,
}

impl<P: LauncherSelectionPolicy> OneShotPolicy<P> {
    pub fn new(default: P) -> Self {
        Self {
            default,
            next: std::sync::Mutex::new(None),
        }
    }

    /// Install a policy to be used for the next `choose_launcher_update`
    /// call only.
    pub fn set_next(&self, policy: Box<dyn LauncherSelectionPolicy>) {
        *self.next.lock().unwrap() = Some(policy);
    }

    pub fn reset_to_default(&self) {
        *self.next.lock().unwrap() = None;
    }
}

impl<P: LauncherSelectionPolicy> LauncherSelectionPolicy for OneShotPolicy<P> {
    fn choose_launcher_update<'a>(
        &self,
        candidates: &'a [UpdateEntity],
        runtime_version: &str,
        filters: &ManifestFilters,
    ) -> Option<&'a UpdateEntity> {
        let mut guard = self.next.lock().unwrap();
        if let Some(policy) = guard.take() {
            // consumed — revert to default for subsequent calls
            return policy.choose_launcher_update(candidates, runtime_version, filters);
        }
        self.default.choose_launcher_update(candidates, runtime_version, filters)
    }
}

// Forwarding impls so an `Arc<OneShotPolicy<_>>` can be shared between a
// `SelectionPolicy`'s `Box<dyn ...>` slot and an external handle that
// calls `set_next`/`reset_to_default` on the same underlying instance —
// the Engine façade needs both at once (`spec.md` §9 Open Question).
impl<T: LauncherSelectionPolicy + ?Sized> LauncherSelectionPolicy for std::sync::Arc<T> {
    fn choose_launcher_update<'a>(
        &self,
        candidates: &'a [UpdateEntity],
        runtime_version: &str,
        filters: &ManifestFilters,
    ) -> Option<&'a UpdateEntity> {
        (**self).choose_launcher_update(candidates, runtime_version, filters)
    }
}

/// The three composed strategies the Engine façade holds.
pub struct SelectionPolicy {
    pub launcher: Box<dyn LauncherSelectionPolicy>,
    pub loader: Box<dyn LoaderSelectionPolicy>,
    pub reaper: Box<dyn ReaperSelectionPolicy>,
}

impl SelectionPolicy {
    pub fn default_policy() -> Self {
        Self {
            launcher: Box::new(DefaultLauncherPolicy),
            loader: Box::new(DefaultLoaderPolicy),
            reaper: Box::new(DefaultReaperPolicy),
        }
    }

    pub fn development_policy() -> Self {
        Self {
            launcher: Box::new(DefaultLauncherPolicy),
            loader: Box::new(DefaultLoaderPolicy),
            reaper: Box::new(DevelopmentReaperPolicy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::UpdateStatus;
    use chrono::Utc;

    fn update(id: &str, commit_time: i64, runtime_version: &str) -> UpdateEntity {
        UpdateEntity {
            id: id.to_string(),
            commit_time,
            runtime_version: runtime_version.to_string(),
            scope_key: "scope".to_string(),
            manifest: serde_json::json!({}),
            status: UpdateStatus::Ready,
            failed_launch_count: 0,
            successful_launch_count: 0,
            last_accessed_at: Utc::now(),
            manifest_filters: HashMap::new(),
        }
    }

    #[test]
    fn choose_launcher_update_is_deterministic_and_prefers_newest() {
        let candidates = vec![update("a", 100, "1.0.0"), update("b", 200, "1.0.0")];
        let policy = DefaultLauncherPolicy;
        let filters = HashMap::new();
        let chosen = policy.choose_launcher_update(&candidates, "1.0.0", &filters);
        assert_eq!(chosen.unwrap().id, "b");

        // Same inputs -> same output (property 3 of spec.md §8).
        let chosen2 = policy.choose_launcher_update(&candidates, "1.0.0", &filters);
        assert_eq!(chosen.map(|u| &u.id), chosen2.map(|u| &u.id));
    }

    #[test]
    fn choose_launcher_update_breaks_ties_by_id() {
        let candidates = vec![update("b", 100, "1.0.0"), update("a", 100, "1.0.0")];
        let policy = DefaultLauncherPolicy;
        let chosen = policy.choose_launcher_update(&candidates, "1.0.0", &HashMap::new());
        assert_eq!(chosen.unwrap().id, "b");
    }

    #[test]
    fn choose_launcher_update_excludes_failed_with_no_success() {
        let mut failed = update("failed", 300, "1.0.0");
        failed.failed_launch_count = 1;
        failed.successful_launch_count = 0;
        let candidates = vec![update("older", 100, "1.0.0"), failed];
        let policy = DefaultLauncherPolicy;
        let chosen = policy.choose_launcher_update(&candidates, "1.0.0", &HashMap::new());
        assert_eq!(chosen.unwrap().id, "older");
    }

    #[test]
    fn choose_launcher_update_filters_by_runtime_version() {
        let candidates = vec![update("wrong-rt", 500, "2.0.0"), update("right-rt", 100, "1.0.0")];
        let policy = DefaultLauncherPolicy;
        let chosen = policy.choose_launcher_update(&candidates, "1.0.0", &HashMap::new());
        assert_eq!(chosen.unwrap().id, "right-rt");
    }

    #[test]
    fn should_load_new_update_compares_commit_time() {
        let current = update("current", 150, "1.0.0");
        let newer = update("newer", 200, "1.0.0");
        let older = update("older", 100, "1.0.0");
        let policy = DefaultLoaderPolicy;
        assert!(policy.should_load_new_update(&newer, &current, &HashMap::new()));
        assert!(!policy.should_load_new_update(&older, &current, &HashMap::new()));
    }

    #[test]
    fn reaper_keeps_launched_newest_and_embedded() {
        let launched = update("launched", 100, "1.0.0");
        let newest = update("newest", 300, "1.0.0");
        let old = update("old", 50, "1.0.0");
        let embedded = update("embedded", 0, "1.0.0");
        let all = vec![launched.clone(), newest.clone(), old.clone(), embedded.clone()];

        let policy = DefaultReaperPolicy;
        let reap = policy.updates_to_reap(&all, "launched", "embedded");
        let reap_ids: Vec<_> = reap.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(reap_ids, vec!["old"]);
    }

    #[test]
    fn development_reaper_keeps_only_launched() {
        let launched = update("launched", 100, "1.0.0");
        let other = update("other", 300, "1.0.0");
        let all = vec![launched.clone(), other.clone()];
        let policy = DevelopmentReaperPolicy;
        let reap = policy.updates_to_reap(&all, "launched", "embedded");
        assert_eq!(reap.len(), 1);
        assert_eq!(reap[0].id, "other");
    }

    #[test]
    fn one_shot_policy_reverts_after_one_use() {
        struct AlwaysNone;
        impl LauncherSelectionPolicy for AlwaysNone {
            fn choose_launcher_update<'a>(
                &self,
                _candidates: &'a [UpdateEntity],
                _runtime_version: &str,
                _filters: &ManifestFilters,
            ) -> Option<&'a UpdateEntity> {
                None
            }
        }

        let candidates = vec![update("a", 100, "1.0.0")];
        let wrapped = OneShotPolicy::new(DefaultLauncherPolicy);
        wrapped.set_next(Box::new(AlwaysNone));

        let first = wrapped.choose_launcher_update(&candidates, "1.0.0", &HashMap::new());
        assert!(first.is_none());

        let second = wrapped.choose_launcher_update(&candidates, "1.0.0", &HashMap::new());
        assert_eq!(second.unwrap().id, "a");
    }
}
