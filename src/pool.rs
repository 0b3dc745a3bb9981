//! pool arbitrates access to a single pager across connections.
//!
//! Any number of readers may hold a reservation at once; at most one writer
//! may, and it excludes all readers.  A read reservation can be upgraded in
//! place: the upgrade parks until every other reader releases, then flips
//! the pager to write mode without ever letting it out of the holder's
//! hands.  A parked writer also blocks admission of new readers, so a
//! stream of readers cannot starve it.
//!
//! Reservations are acquired with a timeout (30 seconds unless the caller
//! says otherwise); release is idempotent and also runs on drop.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pager::{AccessMode, Pager};

pub const DEFAULT_RESERVE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Timed out waiting for a pager reservation.")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

struct State {
    readers: usize,
    writer: bool,
    /// Writers (including upgrades) parked on admission.  Non-zero blocks
    /// new readers, which is what gives writers their ordering guarantee.
    writers_waiting: usize,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    pager: Mutex<Pager>,
}

#[derive(Clone)]
pub struct PagerPool {
    inner: Arc<Inner>,
}

impl PagerPool {
    pub fn new(pager: Pager) -> PagerPool {
        PagerPool {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    readers: 0,
                    writer: false,
                    writers_waiting: 0,
                }),
                cond: Condvar::new(),
                pager: Mutex::new(pager),
            }),
        }
    }

    pub fn reserve(&self, mode: Mode) -> Result<Reservation, Error> {
        self.reserve_timeout(mode, DEFAULT_RESERVE_TIMEOUT)
    }

    pub fn reserve_timeout(&self, mode: Mode, timeout: Duration) -> Result<Reservation, Error> {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.inner.state.lock();
            match mode {
                Mode::Read => {
                    while state.writer || state.writers_waiting > 0 {
                        wait_until(&self.inner.cond, &mut state, deadline)?;
                    }
                    state.readers += 1;
                }
                Mode::Write => {
                    state.writers_waiting += 1;
                    while state.writer || state.readers > 0 {
                        if let Err(e) = wait_until(&self.inner.cond, &mut state, deadline) {
                            state.writers_waiting -= 1;
                            self.inner.cond.notify_all();
                            return Err(e);
                        }
                    }
                    state.writers_waiting -= 1;
                    state.writer = true;
                }
            }
        }
        if mode == Mode::Write {
            self.inner.pager.lock().set_mode(AccessMode::Write);
        }
        Ok(Reservation {
            inner: self.inner.clone(),
            held: Some(mode),
        })
    }
}

fn wait_until(cond: &Condvar, state: &mut MutexGuard<'_, State>, deadline: Instant) -> Result<(), Error> {
    let now = Instant::now();
    if now >= deadline {
        return Err(Error::Timeout);
    }
    // A timed-out wait is not yet a failure; the caller re-checks both the
    // condition and the deadline.
    let _ = cond.wait_for(state, deadline - now);
    Ok(())
}

/// A granted reservation.  Access the pager through `pager()` for the
/// reservation's lifetime; the reservation must outlive every cursor built
/// on it.
pub struct Reservation {
    inner: Arc<Inner>,
    held: Option<Mode>,
}

impl Reservation {
    pub fn mode(&self) -> Option<Mode> {
        self.held
    }

    /// Locks the pager.  Internal pager state is guarded by this single
    /// mutex; hold the guard only across one storage operation.
    pub fn pager(&self) -> MutexGuard<'_, Pager> {
        self.inner.pager.lock()
    }

    /// Upgrades a read reservation to write, parking until all other
    /// readers release.  A no-op for a reservation already held for write.
    pub fn upgrade(&mut self) -> Result<(), Error> {
        self.upgrade_timeout(DEFAULT_RESERVE_TIMEOUT)
    }

    pub fn upgrade_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        match self.held {
            Some(Mode::Write) => return Ok(()),
            Some(Mode::Read) => (),
            None => return Err(Error::Timeout),
        }
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.inner.state.lock();
            state.writers_waiting += 1;
            // Our own read reservation stays counted while we wait; we are
            // admitted when we are the last reader standing.
            while state.writer || state.readers > 1 {
                if let Err(e) = wait_until(&self.inner.cond, &mut state, deadline) {
                    state.writers_waiting -= 1;
                    self.inner.cond.notify_all();
                    return Err(e);
                }
            }
            state.writers_waiting -= 1;
            state.readers -= 1;
            state.writer = true;
        }
        self.inner.pager.lock().set_mode(AccessMode::Write);
        self.held = Some(Mode::Write);
        Ok(())
    }

    /// Releases whichever mode is held.  Safe to call repeatedly.
    pub fn release(&mut self) {
        let Some(mode) = self.held.take() else {
            return;
        };
        if mode == Mode::Write {
            self.inner.pager.lock().set_mode(AccessMode::Read);
        }
        let mut state = self.inner.state.lock();
        match mode {
            Mode::Read => state.readers -= 1,
            Mode::Write => state.writer = false,
        }
        drop(state);
        self.inner.cond.notify_all();
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}
