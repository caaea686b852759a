//! Keyed shared/exclusive locks with in-place upgrade.
//!
//! `KeyedLock` keeps one entry per key that is currently held. An entry
//! records whether the key is held shared (and by how many) or exclusive,
//! plus a queue of waiters. Every state transition happens under a single
//! table mutex, so the lock behaves the same whether callers are tokio
//! tasks on one thread, tasks spread over a worker pool, or OS threads
//! each driving their own runtime.
//!
//! Waiters park on a `oneshot` channel. Whoever releases the key picks
//! the next owner(s) while still holding the table mutex and installs
//! them before waking them, so the key is never observably free while
//! someone is queued for it.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error};

use crate::errors::{Result, VaultError};

/// Access mode requested from or held in a `KeyedLock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Where a blocked request goes in the wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockPriority {
    /// Back of the queue.
    #[default]
    Default,
    /// Front of the queue.
    Earlier,
    /// Front of the queue, and new shared acquirers stop joining the
    /// current shared holders until this request has been served.
    PreventNewAcquisitions,
}

/// How an upgrade reached exclusive mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePath {
    /// Shared turned into exclusive without the key ever being released.
    Direct,
    /// The shared hold was given up and exclusive access was granted
    /// later; other holders may have run in between.
    Queued,
}

/// Snapshot of one key's state, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Shared { holders: usize, waiting: usize },
    Exclusive { waiting: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    /// `others` counts the holders beyond the first.
    Shared { others: usize },
    Exclusive,
}

impl Held {
    fn mode(self) -> LockMode {
        match self {
            Self::Shared { .. } => LockMode::Shared,
            Self::Exclusive => LockMode::Exclusive,
        }
    }
}

#[derive(Debug)]
struct Waiter {
    mode: LockMode,
    high_priority: bool,
    notify: oneshot::Sender<()>,
}

#[derive(Debug)]
struct Entry {
    held: Held,
    waiting: VecDeque<Waiter>,
}

impl Entry {
    fn new(mode: LockMode) -> Self {
        let held = match mode {
            LockMode::Shared => Held::Shared { others: 0 },
            LockMode::Exclusive => Held::Exclusive,
        };
        Self {
            held,
            waiting: VecDeque::new(),
        }
    }

    fn admits_new_shared(&self) -> bool {
        matches!(self.held, Held::Shared { .. })
            && !self
                .waiting
                .iter()
                .find(|w| !w.notify.is_closed())
                .is_some_and(|w| w.high_priority)
    }

    /// Drop waiters whose receiver is gone. While the key is held shared,
    /// the shared waiters they were holding back join the holders.
    fn prune_abandoned(&mut self) {
        self.waiting.retain(|w| !w.notify.is_closed());
        if let Held::Shared { others } = &mut self.held {
            while self
                .waiting
                .front()
                .is_some_and(|w| w.mode == LockMode::Shared)
            {
                if let Some(w) = self.waiting.pop_front() {
                    *others += usize::from(w.notify.send(()).is_ok());
                }
            }
        }
    }

    fn enqueue(&mut self, mode: LockMode, priority: LockPriority) -> oneshot::Receiver<()> {
        let (notify, rx) = oneshot::channel();
        let waiter = Waiter {
            mode,
            high_priority: priority == LockPriority::PreventNewAcquisitions,
            notify,
        };
        match priority {
            LockPriority::Default => self.waiting.push_back(waiter),
            LockPriority::Earlier | LockPriority::PreventNewAcquisitions => {
                self.waiting.push_front(waiter);
            }
        }
        rx
    }

    /// Install the next live waiter(s) as owners.
    ///
    /// A shared waiter at the head brings along the contiguous run of
    /// shared waiters behind it. Waiters whose receiver is gone are
    /// skipped. Returns `false` when nobody was left to take over.
    fn hand_off(&mut self) -> bool {
        while let Some(next) = self.waiting.pop_front() {
            match next.mode {
                LockMode::Exclusive => {
                    if next.notify.send(()).is_ok() {
                        self.held = Held::Exclusive;
                        return true;
                    }
                }
                LockMode::Shared => {
                    let mut granted = usize::from(next.notify.send(()).is_ok());
                    while self
                        .waiting
                        .front()
                        .is_some_and(|w| w.mode == LockMode::Shared)
                    {
                        if let Some(w) = self.waiting.pop_front() {
                            granted += usize::from(w.notify.send(()).is_ok());
                        }
                    }
                    if granted > 0 {
                        self.held = Held::Shared {
                            others: granted - 1,
                        };
                        return true;
                    }
                }
            }
        }
        false
    }
}

/// Per-key multiple-reader / single-writer lock table.
pub struct KeyedLock<K> {
    entries: Mutex<HashMap<K, Entry>>,
    idle: Notify,
}

impl<K> Default for KeyedLock<K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        }
    }

    /// Acquire `key` in `mode`, queueing at the back if it is not free.
    pub async fn acquire(&self, key: K, mode: LockMode) -> Result<LockGuard<'_, K>> {
        self.acquire_with_priority(key, mode, LockPriority::Default)
            .await
    }

    /// Acquire `key` in `mode`, queueing according to `priority` if it
    /// is not free.
    ///
    /// Dropping the returned future while it waits withdraws the request;
    /// a grant that races with the drop is handed straight back.
    pub async fn acquire_with_priority(
        &self,
        key: K,
        mode: LockMode,
        priority: LockPriority,
    ) -> Result<LockGuard<'_, K>> {
        let rx = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                None => {
                    entries.insert(key.clone(), Entry::new(mode));
                    None
                }
                Some(entry) if mode == LockMode::Shared && entry.admits_new_shared() => {
                    if let Held::Shared { others } = &mut entry.held {
                        *others += 1;
                    }
                    None
                }
                Some(entry) => Some(entry.enqueue(mode, priority)),
            }
        };

        if let Some(rx) = rx {
            debug!(?key, ?mode, ?priority, "waiting for lock");
            PendingGrant::new(self, &key, mode, rx).granted().await?;
        }
        debug!(?key, ?mode, "lock acquired");
        Ok(LockGuard {
            lock: self,
            key,
            mode: Some(mode),
        })
    }

    /// Acquire without waiting. Returns `None` if the key is not
    /// available in `mode` right now.
    pub fn try_acquire(&self, key: K, mode: LockMode) -> Option<LockGuard<'_, K>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            None => {
                entries.insert(key.clone(), Entry::new(mode));
            }
            Some(entry) if mode == LockMode::Shared && entry.admits_new_shared() => {
                if let Held::Shared { others } = &mut entry.held {
                    *others += 1;
                }
            }
            Some(_) => return None,
        }
        drop(entries);
        Some(LockGuard {
            lock: self,
            key,
            mode: Some(mode),
        })
    }

    /// Convert the caller's shared hold on `key` into an exclusive one.
    ///
    /// When the caller is the only holder and either nobody is queued or
    /// `priority` is `PreventNewAcquisitions`, the entry flips to
    /// exclusive in place. Otherwise the caller queues for exclusive
    /// access and its shared hold is released in the same step, which
    /// lets the other readers finish first.
    pub async fn upgrade(&self, key: &K, priority: LockPriority) -> Result<UpgradePath> {
        let rx = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(key).ok_or_else(|| {
                VaultError::LockUsage(format!("upgrade of {key:?}, which is not held"))
            })?;
            let Held::Shared { others } = entry.held else {
                return Err(VaultError::LockUsage(format!(
                    "upgrade of {key:?}, which is held exclusive rather than shared"
                )));
            };
            if others == 0
                && (entry.waiting.is_empty() || priority == LockPriority::PreventNewAcquisitions)
            {
                entry.held = Held::Exclusive;
                debug!(?key, "lock upgraded in place");
                return Ok(UpgradePath::Direct);
            }
            let rx = entry.enqueue(LockMode::Exclusive, priority);
            self.release_locked(&mut entries, key, LockMode::Shared)?;
            rx
        };

        debug!(?key, ?priority, "waiting for upgrade");
        PendingGrant::new(self, key, LockMode::Exclusive, rx)
            .granted()
            .await?;
        debug!(?key, "lock upgraded after queueing");
        Ok(UpgradePath::Queued)
    }

    /// Give up one hold on `key` in `mode`.
    ///
    /// Prefer dropping the `LockGuard`; this is the primitive it uses.
    pub fn release(&self, key: &K, mode: LockMode) -> Result<()> {
        let mut entries = self.entries.lock();
        self.release_locked(&mut entries, key, mode)
    }

    fn release_locked(
        &self,
        entries: &mut HashMap<K, Entry>,
        key: &K,
        mode: LockMode,
    ) -> Result<()> {
        let entry = entries.get_mut(key).ok_or_else(|| {
            VaultError::LockUsage(format!("release of {key:?}, which is not held"))
        })?;
        if entry.held.mode() != mode {
            return Err(VaultError::LockUsage(format!(
                "release of {key:?} as {mode:?} while it is held {:?}",
                entry.held.mode()
            )));
        }
        if let Held::Shared { others } = &mut entry.held {
            if *others > 0 {
                *others -= 1;
                return Ok(());
            }
        }
        if !entry.hand_off() {
            entries.remove(key);
            debug!(?key, "lock entry removed");
            if entries.is_empty() {
                self.idle.notify_waiters();
            }
        }
        Ok(())
    }

    /// State of `key`, or `None` when it is unlocked.
    pub fn state(&self, key: &K) -> Option<LockState> {
        let entries = self.entries.lock();
        entries.get(key).map(|e| match e.held {
            Held::Shared { others } => LockState::Shared {
                holders: others + 1,
                waiting: e.waiting.len(),
            },
            Held::Exclusive => LockState::Exclusive {
                waiting: e.waiting.len(),
            },
        })
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of keys currently held.
    pub fn held_keys(&self) -> usize {
        self.entries.lock().len()
    }

    /// Resolve once no key is held. Used at shutdown.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.entries.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// A queued request waiting for its grant.
///
/// If it is dropped before the grant is observed, the request is
/// withdrawn, and a grant that already arrived is released again.
struct PendingGrant<'a, K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    lock: &'a KeyedLock<K>,
    key: &'a K,
    mode: LockMode,
    rx: Option<oneshot::Receiver<()>>,
}

impl<'a, K> PendingGrant<'a, K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    fn new(lock: &'a KeyedLock<K>, key: &'a K, mode: LockMode, rx: oneshot::Receiver<()>) -> Self {
        Self {
            lock,
            key,
            mode,
            rx: Some(rx),
        }
    }

    async fn granted(mut self) -> Result<()> {
        let outcome = match self.rx.as_mut() {
            Some(rx) => rx.await,
            None => Ok(()),
        };
        self.rx = None;
        outcome.map_err(|_| {
            VaultError::LockUsage(format!(
                "lock entry for {:?} vanished while a waiter was queued",
                self.key
            ))
        })
    }
}

impl<K> Drop for PendingGrant<'_, K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                debug!(key = ?self.key, mode = ?self.mode, "returning grant of abandoned waiter");
                if let Err(e) = self.lock.release(self.key, self.mode) {
                    error!(key = ?self.key, error = %e, "failed to return abandoned grant");
                }
            } else if let Some(entry) = self.lock.entries.lock().get_mut(self.key) {
                entry.prune_abandoned();
            }
        }
    }
}

/// One hold on a key. Dropping it releases the hold.
pub struct LockGuard<'a, K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    lock: &'a KeyedLock<K>,
    key: K,
    /// `None` while an upgrade is queued or after release.
    mode: Option<LockMode>,
}

impl<K> LockGuard<'_, K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn mode(&self) -> Option<LockMode> {
        self.mode
    }

    /// Upgrade this shared hold to exclusive. See `KeyedLock::upgrade`.
    pub async fn upgrade(&mut self, priority: LockPriority) -> Result<UpgradePath> {
        if self.mode != Some(LockMode::Shared) {
            return Err(VaultError::LockUsage(format!(
                "upgrade of {:?} from {:?}, expected shared",
                self.key, self.mode
            )));
        }
        // The shared hold may be handed away inside `upgrade`; until it
        // returns this guard owns nothing it could release.
        self.mode = None;
        let path = self.lock.upgrade(&self.key, priority).await?;
        self.mode = Some(LockMode::Exclusive);
        Ok(path)
    }

    /// Release now and surface usage errors instead of logging them.
    pub fn release(mut self) -> Result<()> {
        match self.mode.take() {
            Some(mode) => self.lock.release(&self.key, mode),
            None => Ok(()),
        }
    }
}

impl<K> Drop for LockGuard<'_, K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    fn drop(&mut self) {
        if let Some(mode) = self.mode.take() {
            match self.lock.release(&self.key, mode) {
                Ok(()) => debug!(key = ?self.key, ?mode, "lock released"),
                Err(e) => error!(key = ?self.key, error = %e, "lock release failed"),
            }
        }
    }
}
