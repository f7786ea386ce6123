//! Fleet-wide presence counts.
//!
//! The shared store is authoritative. Each process also keeps a shadow of its
//! own net contribution so it can subtract exactly that on shutdown without
//! looking at any other instance's connections.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chorus_core::PresenceEvent;
use chorus_fleet::{with_timeout, FleetError, FleetStore};

use crate::config::FleetKeys;
use crate::fanout::{FanoutBus, FanoutError};

/// This process's net contribution to the shared counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PresenceShadow {
    pub anonymous: i64,
    pub authorized: BTreeMap<String, i64>,
}

/// What `reconcile_on_shutdown` managed to undo.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub anonymous_removed: i64,
    pub users_reconciled: usize,
    pub users_deleted: usize,
    pub failures: usize,
}

#[derive(Default)]
struct Ledger {
    anonymous: i64,
    authorized: HashMap<String, i64>,
    // Set by `reconcile_on_shutdown`. Store updates that land afterwards are
    // undone instead of recorded, since the shadow has already been paid out.
    sealed: bool,
}

pub struct PresenceCounter {
    store: Arc<dyn FleetStore>,
    bus: Arc<FanoutBus>,
    anonymous_key: String,
    authorized_key: String,
    op_timeout: Duration,
    // Held across the store call on authorized decrement so concurrent
    // disconnects of one user cannot lose an update.
    ledger: tokio::sync::Mutex<Ledger>,
}

impl PresenceCounter {
    pub fn new(
        store: Arc<dyn FleetStore>,
        bus: Arc<FanoutBus>,
        keys: &FleetKeys,
        op_timeout: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            anonymous_key: keys.anonymous_key.clone(),
            authorized_key: keys.authorized_key.clone(),
            op_timeout,
            ledger: tokio::sync::Mutex::new(Ledger::default()),
        }
    }

    pub async fn increment_anonymous(&self) {
        self.adjust_anonymous(1).await;
    }

    pub async fn decrement_anonymous(&self) {
        self.adjust_anonymous(-1).await;
    }

    async fn adjust_anonymous(&self, delta: i64) {
        let applied = if delta > 0 {
            with_timeout(self.op_timeout, self.store.incr(&self.anonymous_key)).await
        } else {
            with_timeout(self.op_timeout, self.store.decr(&self.anonymous_key)).await
        };
        if let Err(e) = applied {
            tracing::warn!(delta, error = %e, kind = e.error_kind(), "Anonymous update failed");
            return;
        }

        let mut ledger = self.ledger.lock().await;
        if !ledger.sealed {
            ledger.anonymous += delta;
            return;
        }
        drop(ledger);

        tracing::debug!(delta, "Presence already reconciled, undoing anonymous update");
        let undo = if delta > 0 {
            with_timeout(self.op_timeout, self.store.decr(&self.anonymous_key)).await
        } else {
            with_timeout(self.op_timeout, self.store.incr(&self.anonymous_key)).await
        };
        if let Err(e) = undo {
            tracing::warn!(delta, error = %e, "Failed to undo late anonymous update");
        }
    }

    pub async fn increment_authorized(&self, user_id: &str) {
        if let Err(e) = with_timeout(
            self.op_timeout,
            self.store.hincr_by(&self.authorized_key, user_id, 1),
        )
        .await
        {
            tracing::warn!(user_id, error = %e, "Authorized increment failed");
            return;
        }

        let mut ledger = self.ledger.lock().await;
        if !ledger.sealed {
            *ledger.authorized.entry(user_id.to_string()).or_insert(0) += 1;
            return;
        }
        drop(ledger);

        tracing::debug!(user_id, "Presence already reconciled, undoing sign-in");
        match with_timeout(
            self.op_timeout,
            self.store.hincr_by(&self.authorized_key, user_id, -1),
        )
        .await
        {
            Ok(remaining) if remaining <= 0 => {
                self.delete_user(user_id).await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(user_id, error = %e, "Failed to undo late sign-in"),
        }
    }

    /// Drop one session for `user_id`, deleting the shared entry once the
    /// user has no sessions left anywhere in the fleet.
    pub async fn decrement_authorized(&self, user_id: &str) {
        let mut ledger = self.ledger.lock().await;
        if ledger.sealed {
            tracing::debug!(user_id, "Presence already reconciled, skipping decrement");
            return;
        }

        let remaining = match with_timeout(
            self.op_timeout,
            self.store.hincr_by(&self.authorized_key, user_id, -1),
        )
        .await
        {
            Ok(remaining) => remaining,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Authorized decrement failed");
                return;
            }
        };

        let entry = ledger.authorized.entry(user_id.to_string()).or_insert(0);
        *entry -= 1;
        if *entry <= 0 {
            ledger.authorized.remove(user_id);
        }

        if remaining <= 0 {
            self.delete_user(user_id).await;
        }
    }

    async fn delete_user(&self, user_id: &str) -> bool {
        match with_timeout(self.op_timeout, self.store.hdel(&self.authorized_key, user_id)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Failed to delete drained user");
                false
            }
        }
    }

    /// Fleet-wide anonymous connections. A missing key reads as zero.
    pub async fn anonymous_count(&self) -> Result<i64, FleetError> {
        let value = with_timeout(self.op_timeout, self.store.get_int(&self.anonymous_key)).await?;
        Ok(value.unwrap_or(0))
    }

    /// Distinct signed-in users across the fleet, not sessions.
    pub async fn authorized_user_count(&self) -> Result<i64, FleetError> {
        with_timeout(self.op_timeout, self.store.hlen(&self.authorized_key)).await
    }

    pub async fn snapshot(&self) -> Result<PresenceEvent, FleetError> {
        Ok(PresenceEvent {
            authorized_users: self.authorized_user_count().await?,
            anonymous_users: self.anonymous_count().await?,
        })
    }

    /// Read both counts and publish them to every instance.
    pub async fn publish_snapshot(&self) -> Result<PresenceEvent, FanoutError> {
        let snapshot = self.snapshot().await?;
        self.bus.publish_presence(snapshot).await?;
        Ok(snapshot)
    }

    /// Seal the shadow and subtract all of it from the shared store, then
    /// publish one final snapshot. Updates that complete after sealing undo
    /// themselves.
    pub async fn reconcile_on_shutdown(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let (anonymous, users) = {
            let mut ledger = self.ledger.lock().await;
            ledger.sealed = true;
            let users: Vec<(String, i64)> = ledger.authorized.drain().collect();
            (std::mem::take(&mut ledger.anonymous), users)
        };

        if anonymous != 0 {
            match with_timeout(
                self.op_timeout,
                self.store.decr_by(&self.anonymous_key, anonymous),
            )
            .await
            {
                Ok(_) => report.anonymous_removed = anonymous,
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(anonymous, error = %e, "Failed to reconcile anonymous count");
                }
            }
        }

        for (user_id, count) in users {
            if count <= 0 {
                continue;
            }
            match with_timeout(
                self.op_timeout,
                self.store.hincr_by(&self.authorized_key, &user_id, -count),
            )
            .await
            {
                Ok(remaining) => {
                    report.users_reconciled += 1;
                    if remaining <= 0 && self.delete_user(&user_id).await {
                        report.users_deleted += 1;
                    }
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(user_id = %user_id, count, error = %e, "Failed to reconcile user");
                }
            }
        }

        if let Err(e) = self.publish_snapshot().await {
            tracing::warn!(error = %e, "Failed to publish final presence snapshot");
        }

        tracing::info!(
            anonymous_removed = report.anonymous_removed,
            users_reconciled = report.users_reconciled,
            users_deleted = report.users_deleted,
            failures = report.failures,
            "Presence reconciled"
        );
        report
    }

    /// Copy of this process's shadow counters. Empty once reconciled.
    pub async fn shadow(&self) -> PresenceShadow {
        let ledger = self.ledger.lock().await;
        PresenceShadow {
            anonymous: ledger.anonymous,
            authorized: ledger
                .authorized
                .iter()
                .map(|(u, c)| (u.clone(), *c))
                .collect(),
        }
    }
}
