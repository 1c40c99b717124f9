//! Token issuance core for an RFC 3161 time-stamp authority.
//!
//! Everything needed to turn a validated request into a signed token lives
//! here: the trusted clock, the serial allocator, the TSTInfo model, signed
//! attributes, signing backends and identities, and the CMS envelope.
//! Request parsing and response status live in `tsp-engine`.
pub mod cms;
pub mod error;
pub mod hash;
pub mod identity;
pub mod serial;
pub mod signed_attrs;
pub mod signing;
pub mod time;
pub mod tstinfo;

pub use crate::cms::{SignedEnvelope, Signer};
pub use crate::error::{ClockError, Error, IdentityError, Result, SerialError, SigningError};
pub use crate::hash::HashAlgorithm;
pub use crate::identity::{IdentityProvider, RotatingIdentity, SigningIdentity, StaticIdentity};
pub use crate::serial::{SerialAllocator, SerialNumber};
pub use crate::signing::{HardwareKey, KeySession, SignatureAlgorithm, SigningBackend, SoftwareKey};
pub use crate::time::{Clock, ManualClock, SystemClock, Timestamp};
pub use crate::tstinfo::{MessageImprint, TstInfo, UnsignedToken};
