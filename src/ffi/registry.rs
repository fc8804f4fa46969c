//! Process-wide table of live clients.
//!
//! The value handed to the host as `conn_ptr` is a registry id, never a real
//! address, so stale and doubled handles are detected instead of dereferenced.

use crate::client::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

type Clients = RwLock<HashMap<u64, Arc<Client>>>;

/// Ids start at 1 so a valid handle is never null.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn clients() -> &'static Clients {
    static CLIENTS: OnceLock<Clients> = OnceLock::new();
    CLIENTS.get_or_init(|| RwLock::new(HashMap::new()))
}

fn read() -> RwLockReadGuard<'static, HashMap<u64, Arc<Client>>> {
    clients().read().unwrap_or_else(PoisonError::into_inner)
}

fn write() -> RwLockWriteGuard<'static, HashMap<u64, Arc<Client>>> {
    clients().write().unwrap_or_else(PoisonError::into_inner)
}

/// Registers a client and returns its handle id.
pub fn insert(client: Client) -> u64 {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    write().insert(id, Arc::new(client));
    id
}

pub fn get(id: u64) -> Option<Arc<Client>> {
    read().get(&id).cloned()
}

/// Removes a client; later lookups of `id` fail.
pub fn remove(id: u64) -> Option<Arc<Client>> {
    write().remove(&id)
}

pub fn contains(id: u64) -> bool {
    read().contains_key(&id)
}

/// Number of live clients.
pub fn len() -> usize {
    read().len()
}
