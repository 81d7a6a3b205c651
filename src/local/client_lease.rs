use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{primary_lease_lost, FirestoreResult};
use crate::local::kv_store::{KeyPart, KeyRange, Table};
use crate::local::persistence::Transaction;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseSettings {
    /// How often the owner refreshes its lease and its client metadata.
    pub refresh_interval: Duration,
    /// Age after which a lease or a client record counts as abandoned.
    pub lease_timeout: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(4),
            lease_timeout: Duration::from_secs(5),
        }
    }
}

impl LeaseSettings {
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct PrimaryLeaseRecord {
    owner_id: String,
    lease_timestamp_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_id: String,
    pub update_time_ms: i64,
    pub network_enabled: bool,
}

/// Primary election between clients sharing one store.
///
/// The primary lease is a timestamped record naming its owner. A client
/// becomes primary when the record is absent, expired or already its own,
/// unless it has the network disabled while another live client does not.
pub struct ClientLease {
    client_id: String,
    settings: LeaseSettings,
}

impl ClientLease {
    pub fn new(client_id: impl Into<String>, settings: LeaseSettings) -> Self {
        Self {
            client_id: client_id.into(),
            settings,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn settings(&self) -> LeaseSettings {
        self.settings
    }

    fn is_fresh(&self, timestamp_ms: i64, now_ms: i64) -> bool {
        let age = now_ms - timestamp_ms;
        age < self.settings.lease_timeout.as_millis() as i64
    }

    fn lease_record(txn: &Transaction<'_>) -> FirestoreResult<Option<PrimaryLeaseRecord>> {
        txn.get(Table::PrimaryClient, &Vec::new())
    }

    /// Refreshes this client's metadata row, then acquires, extends or
    /// yields the primary lease. Returns whether this client is primary.
    pub fn refresh(&self, txn: &mut Transaction<'_>, now_ms: i64, network_enabled: bool) -> FirestoreResult<bool> {
        txn.put(
            Table::ClientMetadata,
            vec![KeyPart::from(self.client_id.as_str())],
            &ClientMetadata {
                client_id: self.client_id.clone(),
                update_time_ms: now_ms,
                network_enabled,
            },
        )?;

        let current = Self::lease_record(txn)?;
        let held_by_other = current.as_ref().is_some_and(|lease| {
            lease.owner_id != self.client_id && self.is_fresh(lease.lease_timestamp_ms, now_ms)
        });
        if held_by_other {
            return Ok(false);
        }

        if !network_enabled {
            let other_online = self
                .active_clients(txn, now_ms)?
                .into_iter()
                .any(|client| client.client_id != self.client_id && client.network_enabled);
            if other_online {
                if current.is_some_and(|lease| lease.owner_id == self.client_id) {
                    txn.delete(Table::PrimaryClient, &Vec::new())?;
                }
                return Ok(false);
            }
        }

        txn.put(
            Table::PrimaryClient,
            Vec::new(),
            &PrimaryLeaseRecord {
                owner_id: self.client_id.clone(),
                lease_timestamp_ms: now_ms,
            },
        )?;
        Ok(true)
    }

    /// Fails with the primary-lease-lost error unless this client holds a
    /// fresh lease.
    pub fn verify_primary(&self, txn: &Transaction<'_>, now_ms: i64) -> FirestoreResult<()> {
        match Self::lease_record(txn)? {
            Some(lease) if lease.owner_id == self.client_id && self.is_fresh(lease.lease_timestamp_ms, now_ms) => Ok(()),
            _ => Err(primary_lease_lost()),
        }
    }

    /// Drops this client's metadata and, if held, the primary lease.
    pub fn release(&self, txn: &mut Transaction<'_>) -> FirestoreResult<()> {
        if Self::lease_record(txn)?.is_some_and(|lease| lease.owner_id == self.client_id) {
            txn.delete(Table::PrimaryClient, &Vec::new())?;
        }
        txn.delete(Table::ClientMetadata, &vec![KeyPart::from(self.client_id.as_str())])
    }

    pub fn active_clients(&self, txn: &Transaction<'_>, now_ms: i64) -> FirestoreResult<Vec<ClientMetadata>> {
        Ok(txn
            .scan::<ClientMetadata>(Table::ClientMetadata, &KeyRange::all())?
            .into_iter()
            .map(|(_, client)| client)
            .filter(|client| self.is_fresh(client.update_time_ms, now_ms))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::error::is_primary_lease_lost;
    use crate::local::kv_store::{KvStore, MemoryKvStore, TransactionMode};
    use crate::local::persistence::Persistence;

    fn pair() -> (Persistence, Persistence) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let a = Persistence::open(Arc::clone(&store), "a", LeaseSettings::default()).unwrap();
        let b = Persistence::open(store, "b", LeaseSettings::default()).unwrap();
        (a, b)
    }

    fn refresh(persistence: &Persistence, now: i64, network: bool) -> bool {
        persistence
            .run_transaction("lease", TransactionMode::ReadWrite, |txn| {
                persistence.lease().refresh(txn, now, network)
            })
            .unwrap()
    }

    #[test]
    fn only_one_client_holds_the_lease() {
        let (a, b) = pair();
        assert!(refresh(&a, 1_000, true));
        assert!(!refresh(&b, 1_500, true));
        assert!(refresh(&a, 4_000, true));
        assert!(!refresh(&b, 8_000, true));
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let (a, b) = pair();
        assert!(refresh(&a, 1_000, true));
        assert!(refresh(&b, 7_000, true));
        assert!(!refresh(&a, 7_100, true));
    }

    #[test]
    fn offline_client_yields_to_online_one() {
        let (a, b) = pair();
        assert!(refresh(&b, 1_000, true));
        b.run_transaction("drop lease", TransactionMode::ReadWrite, |txn| {
            txn.delete(Table::PrimaryClient, &Vec::new())
        })
        .unwrap();
        assert!(!refresh(&a, 1_100, false));
        assert!(refresh(&a, 1_200, true));
    }

    #[test]
    fn release_frees_the_lease() {
        let (a, b) = pair();
        assert!(refresh(&a, 1_000, true));
        a.run_transaction("release", TransactionMode::ReadWrite, |txn| a.lease().release(txn))
            .unwrap();
        assert!(refresh(&b, 1_100, true));
    }

    #[test]
    fn verify_primary_reports_lease_loss() {
        let (a, _b) = pair();
        let err = a
            .run_transaction("check", TransactionMode::ReadOnly, |txn| {
                a.lease().verify_primary(txn, 1_000)
            })
            .unwrap_err();
        assert!(is_primary_lease_lost(&err));
    }
}
