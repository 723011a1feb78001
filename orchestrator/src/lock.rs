// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Optimistic-concurrency lock serializing mutations of one universe
//!
//! A universe record carries a `version` and an `update_in_progress` flag.
//! A mutation locks the universe by atomically checking that the version is
//! the one it planned against and that no other mutation holds the flag, and
//! then setting the flag.  It releases the lock by clearing the flag, bumping
//! the version only if the mutation succeeded.  While the flag is held, the
//! owning mutation writes the record through [`update_locked`].

use crate::external::ClusterMetadataStore;
use fleet_common::universe::Universe;
use fleet_common::Error;
use slog::debug;
use slog::error;
use slog::info;
use slog::Logger;
use std::future::Future;
use uuid::Uuid;

/// Acquires the lock on `universe_id`
///
/// Fails with [`Error::ConcurrentModification`] if the universe is no longer
/// at `expected_version` or another mutation holds it.  Returns the universe
/// as locked.
pub async fn lock_for_update(
    log: &Logger,
    metadata: &dyn ClusterMetadataStore,
    universe_id: Uuid,
    expected_version: u64,
) -> Result<Universe, Error> {
    let universe = metadata
        .cas_update_universe(
            universe_id,
            Some(expected_version),
            Box::new(move |universe| {
                if universe.update_in_progress {
                    return Err(Error::concurrent_modification(
                        universe.id,
                        "another update is in progress",
                    ));
                }
                universe.update_in_progress = true;
                universe.update_succeeded = false;
                Ok(())
            }),
        )
        .await?;
    info!(
        log,
        "locked universe for update";
        "universe_id" => %universe_id,
        "version" => universe.version,
    );
    Ok(universe)
}

/// Releases the lock on `universe_id`
///
/// The version is bumped (by exactly one) only when `succeeded` is true.
pub async fn unlock(
    log: &Logger,
    metadata: &dyn ClusterMetadataStore,
    universe_id: Uuid,
    succeeded: bool,
) -> Result<Universe, Error> {
    let universe = metadata
        .cas_update_universe(
            universe_id,
            None,
            Box::new(move |universe| {
                if !universe.update_in_progress {
                    return Err(Error::internal_error(&format!(
                        "universe {} is not locked",
                        universe.id
                    )));
                }
                universe.update_in_progress = false;
                if succeeded {
                    universe.version += 1;
                    universe.update_succeeded = true;
                }
                Ok(())
            }),
        )
        .await?;
    info!(
        log,
        "unlocked universe";
        "universe_id" => %universe_id,
        "version" => universe.version,
        "succeeded" => succeeded,
    );
    Ok(universe)
}

/// Applies `mutator` to a universe whose lock the caller holds
///
/// Fails with [`Error::PreconditionFailed`] if the universe is not locked.
pub async fn update_locked<F>(
    metadata: &dyn ClusterMetadataStore,
    universe_id: Uuid,
    mutator: F,
) -> Result<Universe, Error>
where
    F: FnOnce(&mut Universe) -> Result<(), Error> + Send + 'static,
{
    metadata
        .cas_update_universe(
            universe_id,
            None,
            Box::new(move |universe| {
                if !universe.update_in_progress {
                    return Err(Error::precondition_failed(&format!(
                        "universe {} is not locked for update",
                        universe.id
                    )));
                }
                mutator(universe)
            }),
        )
        .await
}

/// Runs `body` with `universe_id` locked at `expected_version`
///
/// The lock is released whatever `body` returns.  An error releasing the lock
/// is logged and only reported if `body` itself succeeded.
pub async fn run_locked<F, Fut, T>(
    log: &Logger,
    metadata: &dyn ClusterMetadataStore,
    universe_id: Uuid,
    expected_version: u64,
    body: F,
) -> Result<T, Error>
where
    F: FnOnce(Universe) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let universe =
        lock_for_update(log, metadata, universe_id, expected_version).await?;
    let result = body(universe).await;
    debug!(log, "releasing universe lock"; "ok" => result.is_ok());
    match unlock(log, metadata, universe_id, result.is_ok()).await {
        Ok(_) => result,
        Err(unlock_error) => {
            error!(
                log,
                "failed to unlock universe";
                "universe_id" => %universe_id,
                "error" => %unlock_error,
            );
            match result {
                Ok(_) => Err(unlock_error),
                Err(error) => Err(error),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimMetadataStore;
    use crate::sim::UniverseBuilder;
    use crate::test_util::test_setup_log;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_lock_rejects_stale_version() {
        let logctx = test_setup_log("test_lock_rejects_stale_version");
        let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
        let id = universe.id;
        let store = SimMetadataStore::new(vec![universe]);

        let error = lock_for_update(&logctx.log, &store, id, 7)
            .await
            .expect_err("locked at the wrong version");
        assert_matches!(error, Error::ConcurrentModification { .. });
        assert!(error.retryable());

        let locked = lock_for_update(&logctx.log, &store, id, 0).await.unwrap();
        assert!(locked.update_in_progress);

        // Same version, but the flag is held.
        let error = lock_for_update(&logctx.log, &store, id, 0)
            .await
            .expect_err("locked twice");
        assert_matches!(error, Error::ConcurrentModification { .. });
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_lock_exclusivity() {
        let logctx = test_setup_log("test_lock_exclusivity");
        let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
        let id = universe.id;
        let store = Arc::new(SimMetadataStore::new(vec![universe]));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let log = logctx.log.clone();
            handles.push(tokio::spawn(async move {
                lock_for_update(&log, &*store, id, 0).await
            }));
        }
        let mut acquired = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => acquired += 1,
                Err(error) => {
                    assert_matches!(error, Error::ConcurrentModification { .. })
                }
            }
        }
        assert_eq!(acquired, 1);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_version_is_monotonic() {
        let logctx = test_setup_log("test_version_is_monotonic");
        let universe = UniverseBuilder::new("u").masters_and_tservers(1).build();
        let id = universe.id;
        let store = SimMetadataStore::new(vec![universe]);

        for expected in 0..5 {
            let result: Result<(), Error> =
                run_locked(&logctx.log, &store, id, expected, |_| async {
                    Ok(())
                })
                .await;
            result.unwrap();
        }
        assert_eq!(store.load_universe(id).await.unwrap().version, 5);

        let result: Result<(), Error> =
            run_locked(&logctx.log, &store, id, 5, |_| async {
                Err(Error::remote_command_failed("u-n1", "boom"))
            })
            .await;
        assert_matches!(result, Err(Error::RemoteCommandFailed { .. }));
        let universe = store.load_universe(id).await.unwrap();
        assert_eq!(universe.version, 5);
        assert!(!universe.update_in_progress);
        assert!(!universe.update_succeeded);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_update_requires_lock() {
        let logctx = test_setup_log("test_update_requires_lock");
        let universe = UniverseBuilder::new("u").masters_and_tservers(1).build();
        let id = universe.id;
        let store = SimMetadataStore::new(vec![universe]);

        let error = update_locked(&store, id, |u| {
            u.paused = true;
            Ok(())
        })
        .await
        .expect_err("updated without the lock");
        assert_matches!(error, Error::PreconditionFailed { .. });

        lock_for_update(&logctx.log, &store, id, 0).await.unwrap();
        let updated = update_locked(&store, id, |u| {
            u.paused = true;
            Ok(())
        })
        .await
        .unwrap();
        assert!(updated.paused);
        assert_eq!(updated.version, 0);
        logctx.cleanup_successful();
    }
}
