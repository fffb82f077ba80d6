//! Dock allocation and parking fees.
//!
//! The allocator holds no occupancy state of its own; every decision is read
//! from or committed to the [`LedgerStore`]. A dock query does not reserve the
//! pad it returns: a later dock request may still find it occupied.

use crate::ledger::{LedgerStore, NewShip, PadId, Ship, StoreError, Timestamp};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MILLIS_PER_HOUR: i64 = 60 * 60 * 1000;
pub const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// Source of the current time in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Rounds to the nearest integer with `.5` going up: `floor(x + 0.5)`.
pub fn ceil_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Parking fee for a stay from `docked_at` to `now`.
///
/// Stays longer than one day are billed per started-or-rounded day at
/// `cost_day`; shorter stays per rounded hour at `cost_hour`. Rounding is
/// [`ceil_half_up`]. A clock that runs backwards bills zero.
pub fn compute_fee(docked_at: Timestamp, now: Timestamp, cost_hour: i64, cost_day: i64) -> i64 {
    let elapsed = now.saturating_sub(docked_at).max(0);

    let (units, rate) = if elapsed > MILLIS_PER_DAY {
        let days = elapsed as f64 / MILLIS_PER_DAY as f64;
        (ceil_half_up(days), cost_day)
    } else {
        let hours = elapsed as f64 / MILLIS_PER_HOUR as f64;
        (ceil_half_up(hours), cost_hour)
    };

    (units as i64).saturating_mul(rate)
}

#[derive(Debug, Error)]
pub enum DockError {
    #[error("pad {0} does not exist")]
    NotFound(PadId),

    #[error("ship weight {weight} exceeds pad {pad_id} capacity {max_weight}")]
    Overweight {
        pad_id: PadId,
        weight: f64,
        max_weight: f64,
    },

    #[error("pad {0} is occupied")]
    Occupied(PadId),

    #[error("no ship docked at pad {0}")]
    NotDocked(PadId),

    #[error("ledger failure: {0}")]
    Store(#[from] StoreError),
}

pub type DockResult<T> = Result<T, DockError>;

/// Outcome of a successful undock.
#[derive(Debug, Clone, PartialEq)]
pub struct Undocking {
    pub ship: Ship,
    pub fee: i64,
    pub undocked_at: Timestamp,
}

pub struct DockAllocator<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: LedgerStore> DockAllocator<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Lowest-id pad that can take `weight` and is free right now.
    pub fn find_free_dock(&self, weight: f64) -> DockResult<Option<PadId>> {
        let found = self.store.lowest_free_pad(weight)?;
        debug!(weight, pad_id = ?found, "Free dock lookup");
        Ok(found)
    }

    /// Docks a ship. Occupancy check and insert are one store operation, so of
    /// two racing requests for the same pad exactly one succeeds.
    pub fn dock(&self, pad_id: PadId, weight: f64, license: &str) -> DockResult<Timestamp> {
        let pad = self.store.pad(pad_id)?.ok_or(DockError::NotFound(pad_id))?;

        if weight > pad.max_weight {
            debug!(pad_id, weight, max_weight = pad.max_weight, "Dock rejected: overweight");
            return Err(DockError::Overweight {
                pad_id,
                weight,
                max_weight: pad.max_weight,
            });
        }

        let docked_at = self.clock.now();
        let ship = NewShip {
            pad_id,
            license: license.to_owned(),
            weight,
            docked_at,
        };

        if !self.store.insert_ship_if_vacant(&ship)? {
            debug!(pad_id, license, "Dock rejected: occupied");
            return Err(DockError::Occupied(pad_id));
        }

        info!(pad_id, license, weight, docked_at, "Ship docked");
        Ok(docked_at)
    }

    /// Undocks the ship at `pad_id` and returns the fee owed.
    pub fn undock(&self, pad_id: PadId) -> DockResult<Undocking> {
        let pad = self.store.pad(pad_id)?.ok_or(DockError::NotDocked(pad_id))?;

        let undocked_at = self.clock.now();
        let ship = self
            .store
            .remove_ship(pad_id, undocked_at)?
            .ok_or(DockError::NotDocked(pad_id))?;

        let fee = compute_fee(ship.docked_at, undocked_at, pad.cost_hour, pad.cost_day);
        info!(pad_id, license = %ship.license, fee, "Ship undocked");

        Ok(Undocking {
            ship,
            fee,
            undocked_at,
        })
    }

    /// Fee the ship at `pad_id` would owe if it undocked now.
    pub fn fee_for(&self, pad_id: PadId) -> DockResult<i64> {
        let ship = self
            .store
            .occupant(pad_id)?
            .ok_or(DockError::NotDocked(pad_id))?;

        let Some(pad) = self.store.pad(pad_id)? else {
            warn!(pad_id, "Ship references a missing pad");
            return Err(DockError::NotDocked(pad_id));
        };

        Ok(compute_fee(ship.docked_at, self.clock.now(), pad.cost_hour, pad.cost_day))
    }
}
