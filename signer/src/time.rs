/// Time engine for token issuance.
///
/// Provides:
/// - `Clock`, the trusted time source a token's genTime comes from
/// - `SystemClock`, wall-clock time with monotonic enforcement
/// - `ManualClock`, a settable clock for tests and replay
/// - `Timestamp`, encoded as a DER GeneralizedTime with millisecond precision
use crate::error::ClockError;

use der::{DateTime, DecodeValue, EncodeValue, FixedTag, Header, Length, Reader, Tag, Writer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A point in time with millisecond resolution, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    unix_ms: u64,
}

impl Timestamp {
    pub const fn from_unix_ms(unix_ms: u64) -> Self {
        Self { unix_ms }
    }

    pub fn from_unix_duration(d: Duration) -> Self {
        Self {
            unix_ms: d.as_millis() as u64,
        }
    }

    pub fn unix_ms(&self) -> u64 {
        self.unix_ms
    }

    pub fn to_unix_duration(&self) -> Duration {
        Duration::from_millis(self.unix_ms)
    }

    /// Render as GeneralizedTime: `YYYYMMDDHHMMSS[.f{1,3}]Z`.
    ///
    /// DER forbids trailing zeros in the fraction and a bare decimal point,
    /// so whole seconds have no fraction at all.
    pub fn to_generalized_time(&self) -> der::Result<String> {
        let dt = DateTime::from_unix_duration(Duration::from_secs(self.unix_ms / 1000))?;
        let mut out = format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minutes(),
            dt.seconds()
        );
        let millis = self.unix_ms % 1000;
        if millis != 0 {
            let fraction = format!("{:03}", millis);
            out.push('.');
            out.push_str(fraction.trim_end_matches('0'));
        }
        out.push('Z');
        Ok(out)
    }

    /// Parse the DER form produced by [`Timestamp::to_generalized_time`].
    pub fn parse_generalized_time(text: &[u8]) -> Option<Self> {
        let body = text.strip_suffix(b"Z")?;
        let (whole, fraction) = match body.iter().position(|&b| b == b'.') {
            Some(dot) => (&body[..dot], Some(&body[dot + 1..])),
            None => (body, None),
        };
        if whole.len() != 14 || !whole.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let field = |range: std::ops::Range<usize>| -> u16 {
            whole[range]
                .iter()
                .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'))
        };
        let dt = DateTime::new(
            field(0..4),
            field(4..6) as u8,
            field(6..8) as u8,
            field(8..10) as u8,
            field(10..12) as u8,
            field(12..14) as u8,
        )
        .ok()?;

        let millis = match fraction {
            None => 0,
            Some(f) => {
                if f.is_empty()
                    || f.len() > 3
                    || f.ends_with(b"0")
                    || !f.iter().all(u8::is_ascii_digit)
                {
                    return None;
                }
                let mut padded = [b'0'; 3];
                padded[..f.len()].copy_from_slice(f);
                padded
                    .iter()
                    .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'))
            }
        };

        Some(Self::from_unix_ms(
            dt.unix_duration().as_secs() * 1000 + millis,
        ))
    }
}

impl FixedTag for Timestamp {
    const TAG: Tag = Tag::GeneralizedTime;
}

impl EncodeValue for Timestamp {
    fn value_len(&self) -> der::Result<Length> {
        Length::try_from(self.to_generalized_time()?.len())
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        writer.write(self.to_generalized_time()?.as_bytes())
    }
}

impl<'a> DecodeValue<'a> for Timestamp {
    fn decode_value<R: Reader<'a>>(reader: &mut R, header: Header) -> der::Result<Self> {
        let bytes = reader.read_vec(header.length)?;
        Self::parse_generalized_time(&bytes).ok_or_else(|| Tag::GeneralizedTime.value_error())
    }
}

/// Source of the trusted time stamped into tokens.
pub trait Clock: Send + Sync {
    /// Current time. Successive calls never go backward.
    fn now(&self) -> Result<Timestamp, ClockError>;

    /// Stated accuracy bound of the values returned by `now`.
    fn accuracy(&self) -> Duration;
}

/// System wall clock with monotonic enforcement.
///
/// Until the deployment marks the clock synchronized against its reference
/// (NTS, a hardware clock), `now` reports the time as unavailable.
pub struct SystemClock {
    /// Last issued timestamp in milliseconds since Unix epoch.
    last_ms: AtomicU64,
    accuracy: Duration,
    synchronized: AtomicBool,
}

impl SystemClock {
    /// A synchronized clock with the given accuracy.
    pub fn new(accuracy: Duration) -> Self {
        Self {
            last_ms: AtomicU64::new(0),
            accuracy,
            synchronized: AtomicBool::new(true),
        }
    }

    /// A clock that refuses to serve time until `set_synchronized(true)`.
    pub fn unsynchronized(accuracy: Duration) -> Self {
        let clock = Self::new(accuracy);
        clock.synchronized.store(false, Ordering::Release);
        clock
    }

    pub fn set_synchronized(&self, synchronized: bool) {
        self.synchronized.store(synchronized, Ordering::Release);
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Acquire)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Result<Timestamp, ClockError> {
        if !self.is_synchronized() {
            return Err(ClockError::Unavailable);
        }
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| ClockError::BeforeEpoch)?
            .as_millis() as u64;

        // Never return a timestamp less than one already handed out.
        let previous = self.last_ms.fetch_max(now_ms, Ordering::AcqRel);
        Ok(Timestamp::from_unix_ms(previous.max(now_ms)))
    }

    fn accuracy(&self) -> Duration {
        self.accuracy
    }
}

/// Clock whose time only moves when told to.
pub struct ManualClock {
    now_ms: AtomicU64,
    accuracy: Duration,
}

impl ManualClock {
    pub fn new(start: Timestamp, accuracy: Duration) -> Self {
        Self {
            now_ms: AtomicU64::new(start.unix_ms()),
            accuracy,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }

    /// Jump to `to`; moving backward is ignored.
    pub fn set(&self, to: Timestamp) {
        self.now_ms.fetch_max(to.unix_ms(), Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Result<Timestamp, ClockError> {
        Ok(Timestamp::from_unix_ms(self.now_ms.load(Ordering::Acquire)))
    }

    fn accuracy(&self) -> Duration {
        self.accuracy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use der::{Decode, Encode};

    #[test]
    fn format_epoch() {
        let gt = Timestamp::from_unix_ms(0).to_generalized_time().unwrap();
        assert_eq!(gt, "19700101000000Z");
    }

    #[test]
    fn format_known_date() {
        // 2026-02-15 12:00:00.000 UTC
        let gt = Timestamp::from_unix_ms(1_771_156_800_000)
            .to_generalized_time()
            .unwrap();
        assert_eq!(gt, "20260215120000Z");
    }

    #[test]
    fn format_with_millis() {
        let gt = Timestamp::from_unix_ms(1_771_156_800_123)
            .to_generalized_time()
            .unwrap();
        assert_eq!(gt, "20260215120000.123Z");
    }

    #[test]
    fn fraction_drops_trailing_zeros() {
        let gt = Timestamp::from_unix_ms(1_771_156_800_120)
            .to_generalized_time()
            .unwrap();
        assert_eq!(gt, "20260215120000.12Z");

        let gt = Timestamp::from_unix_ms(1_771_156_800_500)
            .to_generalized_time()
            .unwrap();
        assert_eq!(gt, "20260215120000.5Z");
    }

    #[test]
    fn format_leap_year() {
        // 2024-02-29 00:00:00 UTC
        let gt = Timestamp::from_unix_ms(1_709_164_800_000)
            .to_generalized_time()
            .unwrap();
        assert_eq!(gt, "20240229000000Z");
    }

    #[test]
    fn format_end_of_year() {
        let gt = Timestamp::from_unix_ms(1_767_225_599_999)
            .to_generalized_time()
            .unwrap();
        assert_eq!(gt, "20251231235959.999Z");
    }

    #[test]
    fn der_roundtrip_keeps_millis() {
        let ts = Timestamp::from_unix_ms(1_771_156_800_040);
        let der = ts.to_der().unwrap();
        assert_eq!(der[0], 0x18);
        assert_eq!(Timestamp::from_der(&der).unwrap(), ts);
    }

    #[test]
    fn parse_rejects_non_canonical_fractions() {
        assert!(Timestamp::parse_generalized_time(b"20260215120000.Z").is_none());
        assert!(Timestamp::parse_generalized_time(b"20260215120000.10Z").is_none());
        assert!(Timestamp::parse_generalized_time(b"20260215120000.1234Z").is_none());
        assert!(Timestamp::parse_generalized_time(b"20260215120000").is_none());
        assert!(Timestamp::parse_generalized_time(b"20261315120000Z").is_none());
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new(Duration::from_secs(1));
        let t1 = clock.now().unwrap();
        let t2 = clock.now().unwrap();
        let t3 = clock.now().unwrap();
        assert!(t2 >= t1);
        assert!(t3 >= t2);
    }

    #[test]
    fn system_clock_never_goes_backward() {
        let clock = SystemClock::new(Duration::from_secs(1));
        let future = clock.now().unwrap().unix_ms() + 60_000;
        clock.last_ms.store(future, Ordering::SeqCst);
        assert_eq!(clock.now().unwrap().unix_ms(), future);
    }

    #[test]
    fn unsynchronized_clock_is_unavailable() {
        let clock = SystemClock::unsynchronized(Duration::from_secs(1));
        assert_eq!(clock.now(), Err(ClockError::Unavailable));
        clock.set_synchronized(true);
        assert!(clock.now().is_ok());
    }

    #[test]
    fn manual_clock_ignores_backward_set() {
        let clock = ManualClock::new(Timestamp::from_unix_ms(5_000), Duration::ZERO);
        clock.set(Timestamp::from_unix_ms(1_000));
        assert_eq!(clock.now().unwrap().unix_ms(), 5_000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now().unwrap().unix_ms(), 5_250);
    }
}
