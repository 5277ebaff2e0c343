//! In-memory registries for operations and their channels.
//!
//! Each registry guards its whole map with one mutex. Every call takes the
//! lock once, so each add/update/get/delete/claim is atomic per key. A
//! poisoned lock is recovered rather than propagated: the maps hold plain
//! data and stay consistent across a panicking holder.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{Duration, Utc};
use tracing::{debug, info};

use lxd_shim_core::{
    Channel, ChannelRole, Error, Operation, OperationClass, OperationId, OperationStatus, Result,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of tracked operations.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: Mutex<HashMap<OperationId, Operation>>,
}

impl OperationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new operation.
    pub fn add(&self, operation: Operation) -> Result<()> {
        let mut operations = lock(&self.operations);
        if operations.contains_key(&operation.id) {
            return Err(Error::AlreadyExists(operation.id));
        }
        info!(
            "Operation {} created: class={} instance={} description='{}'",
            operation.id,
            operation.class.as_str(),
            operation.instance,
            operation.description
        );
        operations.insert(operation.id, operation);
        Ok(())
    }

    /// Transition an operation out of `Running`.
    ///
    /// Returns the updated snapshot.
    pub fn update(
        &self,
        id: &OperationId,
        status: OperationStatus,
        err: impl Into<String>,
    ) -> Result<Operation> {
        let mut operations = lock(&self.operations);
        let operation = operations
            .get_mut(id)
            .ok_or(Error::OperationNotFound(*id))?;

        if operation.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: operation.status,
                to: status,
            });
        }

        operation.status = status;
        operation.err = err.into();
        operation.updated_at = Utc::now().max(operation.created_at);
        info!("Operation {} -> {}", id, status);
        Ok(operation.clone())
    }

    /// Mark an operation `Success`.
    pub fn complete(&self, id: &OperationId) -> Result<Operation> {
        self.update(id, OperationStatus::Success, "")
    }

    /// Mark an operation `Failure` with an error message.
    pub fn fail(&self, id: &OperationId, err: impl Into<String>) -> Result<Operation> {
        self.update(id, OperationStatus::Failure, err)
    }

    /// Snapshot of one operation.
    pub fn get(&self, id: &OperationId) -> Result<Operation> {
        lock(&self.operations)
            .get(id)
            .cloned()
            .ok_or(Error::OperationNotFound(*id))
    }

    /// Remove an operation, returning it.
    pub fn delete(&self, id: &OperationId) -> Result<Operation> {
        lock(&self.operations)
            .remove(id)
            .ok_or(Error::OperationNotFound(*id))
    }

    /// Snapshots of every operation, in no particular order.
    pub fn list(&self) -> Vec<Operation> {
        lock(&self.operations).values().cloned().collect()
    }

    /// Number of tracked operations.
    pub fn len(&self) -> usize {
        lock(&self.operations).len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop terminal operations last updated more than `retention` ago.
    pub fn prune_finished(&self, retention: Duration) -> Vec<OperationId> {
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return Vec::new();
        };
        let mut operations = lock(&self.operations);
        let expired: Vec<OperationId> = operations
            .values()
            .filter(|op| op.status.is_terminal() && op.updated_at < cutoff)
            .map(|op| op.id)
            .collect();
        for id in &expired {
            operations.remove(id);
        }
        if !expired.is_empty() {
            debug!("Pruned {} finished operations", expired.len());
        }
        expired
    }

    /// Snapshots of `Running` operations of `class` created more than `age` ago.
    pub fn running_older_than(&self, class: OperationClass, age: Duration) -> Vec<Operation> {
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return Vec::new();
        };
        lock(&self.operations)
            .values()
            .filter(|op| {
                op.class == class && op.status == OperationStatus::Running && op.created_at < cutoff
            })
            .cloned()
            .collect()
    }
}

/// Registry of interactive-session channels, keyed by operation id.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<OperationId, Channel>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new channel.
    pub fn add(&self, channel: Channel) -> Result<()> {
        let mut channels = lock(&self.channels);
        if channels.contains_key(&channel.id) {
            return Err(Error::AlreadyExists(channel.id));
        }
        channels.insert(channel.id, channel);
        Ok(())
    }

    /// Copy of one channel.
    pub fn get(&self, id: &OperationId) -> Result<Channel> {
        lock(&self.channels)
            .get(id)
            .cloned()
            .ok_or(Error::ChannelNotFound(*id))
    }

    /// Authenticate `secret` against the channel and consume the matching role.
    pub fn claim(&self, id: &OperationId, secret: &str) -> Result<(ChannelRole, Channel)> {
        let mut channels = lock(&self.channels);
        let channel = channels.get_mut(id).ok_or(Error::ChannelNotFound(*id))?;
        let role = channel.claim(secret)?;
        debug!("Channel {} claimed role {}", id, role);
        Ok((role, channel.clone()))
    }

    /// Remove a channel, returning it.
    pub fn delete(&self, id: &OperationId) -> Result<Channel> {
        lock(&self.channels)
            .remove(id)
            .ok_or(Error::ChannelNotFound(*id))
    }

    /// Copies of every channel.
    pub fn list(&self) -> Vec<Channel> {
        lock(&self.channels).values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lxd_shim_core::SessionParams;

    fn task(instance: &str) -> Operation {
        Operation::new(OperationClass::Task, instance, "Starting instance")
    }

    #[test]
    fn test_add_and_get() {
        let registry = OperationRegistry::new();
        let op = task("web1");
        let id = op.id;
        registry.add(op).unwrap();

        let fetched = registry.get(&id).unwrap();
        assert_eq!(fetched.instance, "web1");
        assert_eq!(fetched.status, OperationStatus::Running);
    }

    #[test]
    fn test_add_duplicate() {
        let registry = OperationRegistry::new();
        let op = task("web1");
        registry.add(op.clone()).unwrap();
        assert!(matches!(registry.add(op), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_update_unknown() {
        let registry = OperationRegistry::new();
        let result = registry.complete(&OperationId::new());
        assert!(matches!(result, Err(Error::OperationNotFound(_))));
    }

    #[test]
    fn test_fail_sets_err() {
        let registry = OperationRegistry::new();
        let op = task("web1");
        let id = op.id;
        registry.add(op).unwrap();

        let failed = registry.fail(&id, "lxc-start exited with status 1").unwrap();
        assert_eq!(failed.status, OperationStatus::Failure);
        assert_eq!(failed.err, "lxc-start exited with status 1");
        assert!(failed.updated_at >= failed.created_at);
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        let registry = OperationRegistry::new();
        let op = task("web1");
        let id = op.id;
        registry.add(op).unwrap();
        registry.complete(&id).unwrap();

        let result = registry.fail(&id, "late");
        assert!(matches!(
            result,
            Err(Error::InvalidTransition {
                from: OperationStatus::Success,
                to: OperationStatus::Failure
            })
        ));
        assert!(registry.get(&id).unwrap().err.is_empty());
    }

    #[test]
    fn test_delete_twice() {
        let registry = OperationRegistry::new();
        let missing = OperationId::new();
        assert!(matches!(
            registry.delete(&missing),
            Err(Error::OperationNotFound(_))
        ));
        assert!(matches!(
            registry.delete(&missing),
            Err(Error::OperationNotFound(_))
        ));

        let op = task("web1");
        let id = op.id;
        registry.add(op).unwrap();
        assert_eq!(registry.delete(&id).unwrap().id, id);
        assert!(registry.delete(&id).is_err());
    }

    #[test]
    fn test_list_empty() {
        let registry = OperationRegistry::new();
        assert!(registry.list().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_prune_finished() {
        let registry = OperationRegistry::new();
        let running = task("a");
        let done = task("b");
        let (running_id, done_id) = (running.id, done.id);
        registry.add(running).unwrap();
        registry.add(done).unwrap();
        registry.complete(&done_id).unwrap();

        // Nothing is old enough yet
        assert!(registry.prune_finished(Duration::seconds(60)).is_empty());

        // Negative retention puts the cutoff in the future
        let pruned = registry.prune_finished(Duration::seconds(-60));
        assert_eq!(pruned, vec![done_id]);
        assert!(registry.get(&running_id).is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_running_older_than() {
        let registry = OperationRegistry::new();
        let exec = Operation::new(OperationClass::Websocket, "web1", "Executing command");
        let finished = Operation::new(OperationClass::Websocket, "web2", "Executing command");
        let (exec_id, finished_id) = (exec.id, finished.id);
        registry.add(exec).unwrap();
        registry.add(finished).unwrap();
        registry.add(task("web3")).unwrap();
        registry.fail(&finished_id, "boom").unwrap();

        assert!(registry
            .running_older_than(OperationClass::Websocket, Duration::seconds(60))
            .is_empty());

        let stale = registry.running_older_than(OperationClass::Websocket, Duration::seconds(-60));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, exec_id);
    }

    #[test]
    fn test_channel_claim_flow() {
        let registry = ChannelRegistry::new();
        let id = OperationId::new();
        let channel = Channel::new(id, SessionParams::default());
        let data = channel.data_secret.clone();
        registry.add(channel).unwrap();

        let (role, snapshot) = registry.claim(&id, &data).unwrap();
        assert_eq!(role, ChannelRole::Data);
        assert!(snapshot.data_claimed);
        assert!(registry.get(&id).unwrap().data_claimed);
        assert!(matches!(registry.claim(&id, &data), Err(Error::AuthMismatch)));
    }

    #[test]
    fn test_channel_claim_unknown() {
        let registry = ChannelRegistry::new();
        let result = registry.claim(&OperationId::new(), "secret");
        assert!(matches!(result, Err(Error::ChannelNotFound(_))));
    }

    #[test]
    fn test_channel_delete_and_list() {
        let registry = ChannelRegistry::new();
        assert!(registry.list().is_empty());

        let id = OperationId::new();
        registry
            .add(Channel::new(id, SessionParams::default()))
            .unwrap();
        assert!(matches!(
            registry.add(Channel::new(id, SessionParams::default())),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(registry.list().len(), 1);
        registry.delete(&id).unwrap();
        assert!(matches!(registry.delete(&id), Err(Error::ChannelNotFound(_))));
    }

    #[test]
    fn test_concurrent_claims_yield_one_winner() {
        use std::sync::Arc;

        let registry = Arc::new(ChannelRegistry::new());
        let id = OperationId::new();
        let channel = Channel::new(id, SessionParams::default());
        let data = channel.data_secret.clone();
        registry.add(channel).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let data = data.clone();
                std::thread::spawn(move || registry.claim(&id, &data).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
