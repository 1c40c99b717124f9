//! Serial number allocation.
//!
//! The allocator is the only cross-request mutable state in the issuance
//! pipeline. Serials come from a single atomic counter; when a persistent
//! store is attached, blocks of serials are reserved ahead of use by writing
//! a high-water mark, so a restarted authority resumes above anything it may
//! have issued before.

use crate::error::{Error, SerialError};
use crate::time::{Clock, Timestamp};

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Default number of serials reserved per store write.
pub const DEFAULT_BLOCK: u64 = 1024;

/// A token serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SerialNumber(u64);

impl SerialNumber {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable high-water mark for the serial counter.
pub trait SerialStore: Send + Sync {
    /// The last persisted ceiling, or `None` for a fresh authority.
    fn load(&self) -> Result<Option<u64>, SerialError>;

    /// Durably record that every serial below `ceiling` may have been issued.
    fn reserve(&self, ceiling: u64) -> Result<(), SerialError>;
}

/// Stores the ceiling as decimal text in a single file.
pub struct FileSerialStore {
    path: PathBuf,
}

impl FileSerialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SerialStore for FileSerialStore {
    fn load(&self) -> Result<Option<u64>, SerialError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SerialError::Store(e)),
        };
        text.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| SerialError::Corrupt(format!("{}: {:?}", self.path.display(), text.trim())))
    }

    fn reserve(&self, ceiling: u64) -> Result<(), SerialError> {
        // Write-then-rename so a crash never leaves a truncated ceiling behind.
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            writeln!(file, "{}", ceiling)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

struct Reservation {
    store: Box<dyn SerialStore>,
    block: u64,
    lock: Mutex<()>,
}

/// Issues unique, strictly increasing serial numbers.
pub struct SerialAllocator {
    next: AtomicU64,
    /// First serial not yet covered by a durable reservation.
    ceiling: AtomicU64,
    reservation: Option<Reservation>,
    /// Held across a clock read and the allocation that follows it.
    stamp: Mutex<()>,
}

impl SerialAllocator {
    /// An in-memory allocator whose first serial is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
            ceiling: AtomicU64::new(u64::MAX),
            reservation: None,
            stamp: Mutex::new(()),
        }
    }

    /// An allocator backed by a persistent store.
    ///
    /// Resumes at the stored ceiling (or 1 for a fresh store) and reserves
    /// the first block before returning. Any store failure here is fatal:
    /// the authority must not start issuing serials it cannot account for.
    pub fn with_store(store: Box<dyn SerialStore>, block: u64) -> Result<Self, SerialError> {
        let block = block.max(1);
        let first = store.load()?.unwrap_or(1);
        let ceiling = first.checked_add(block).ok_or(SerialError::Exhausted)?;
        store.reserve(ceiling)?;

        tracing::info!(first, ceiling, "serial allocator initialized");

        Ok(Self {
            next: AtomicU64::new(first),
            ceiling: AtomicU64::new(ceiling),
            reservation: Some(Reservation {
                store,
                block,
                lock: Mutex::new(()),
            }),
            stamp: Mutex::new(()),
        })
    }

    /// Allocate the next serial number.
    ///
    /// A serial handed out is consumed even if the caller later fails.
    pub fn next(&self) -> Result<SerialNumber, SerialError> {
        let serial = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_add(1))
            .map_err(|_| SerialError::Exhausted)?;

        if let Some(reservation) = &self.reservation {
            if serial >= self.ceiling.load(Ordering::Acquire) {
                self.extend_reservation(reservation, serial)?;
            }
        }

        Ok(SerialNumber(serial))
    }

    /// Read `clock` and allocate a serial as one step.
    ///
    /// Pairs come out ordered on both axes: a larger serial never carries an
    /// earlier time than a smaller one. A clock failure consumes no serial.
    /// Only pairs from this method are ordered against each other; a bare
    /// `next()` does not take part.
    pub fn next_stamped(&self, clock: &dyn Clock) -> Result<(Timestamp, SerialNumber), Error> {
        let _guard = self
            .stamp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = clock.now()?;
        let serial = self.next()?;
        Ok((now, serial))
    }

    /// The value the next successful `next()` call will return.
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    fn extend_reservation(&self, reservation: &Reservation, serial: u64) -> Result<(), SerialError> {
        let _guard = reservation
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut ceiling = self.ceiling.load(Ordering::Acquire);
        while serial >= ceiling {
            let raised = ceiling
                .checked_add(reservation.block)
                .ok_or(SerialError::Exhausted)?;
            reservation.store.reserve(raised)?;
            tracing::debug!(ceiling = raised, "reserved serial block");
            ceiling = raised;
            self.ceiling.store(ceiling, Ordering::Release);
        }
        Ok(())
    }
}
