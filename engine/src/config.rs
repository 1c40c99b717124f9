/// Authority configuration: policies, algorithm allow-lists, token options
/// and serial state.
use crate::error::ConfigError;

use const_oid::ObjectIdentifier;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tsp_signer::serial::{FileSerialStore, DEFAULT_BLOCK};
use tsp_signer::{HashAlgorithm, SerialAllocator, SignatureAlgorithm};

/// Placeholder policy; deployments set their own with `TSA_POLICY_OID`.
pub const DEFAULT_POLICY_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.0.1");

/// What to do with a non-critical request extension the authority does not
/// support. Either way it is left out of the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonCriticalExtensions {
    /// Drop it and answer `granted`.
    Ignore,
    /// Drop it and answer `grantedWithMods`.
    Report,
}

/// Authority configuration loaded at startup.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Policy used when a request names none.
    pub default_policy: Option<ObjectIdentifier>,
    /// Further policies a request may name.
    pub accepted_policies: Vec<ObjectIdentifier>,
    /// Replace an unsupported requested policy with the default instead of
    /// rejecting the request.
    pub allow_policy_substitution: bool,
    /// Digests accepted in a messageImprint.
    pub hash_algorithms: Vec<HashAlgorithm>,
    /// Signature algorithms the signer may use.
    pub signature_algorithms: Vec<SignatureAlgorithm>,
    /// Accuracy stated in tokens; the clock's own when unset.
    pub accuracy: Option<Duration>,
    pub ordering: bool,
    /// Put the signing certificate's subject in TSTInfo.tsa.
    pub include_tsa_name: bool,
    pub non_critical_extensions: NonCriticalExtensions,
    /// Request extensions copied into the token.
    pub supported_extensions: Vec<ObjectIdentifier>,
    /// Persistent serial high-water mark; required to open an allocator.
    pub serial_state_path: Option<PathBuf>,
    pub serial_block: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            default_policy: Some(DEFAULT_POLICY_OID),
            accepted_policies: Vec::new(),
            allow_policy_substitution: false,
            hash_algorithms: HashAlgorithm::ALL.to_vec(),
            signature_algorithms: vec![SignatureAlgorithm::EcdsaP384Sha384],
            accuracy: None,
            ordering: false,
            include_tsa_name: false,
            non_critical_extensions: NonCriticalExtensions::Ignore,
            supported_extensions: Vec::new(),
            serial_state_path: None,
            serial_block: DEFAULT_BLOCK,
        }
    }
}

impl AuthorityConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = var("TSA_POLICY_OID") {
            config.default_policy = if value.trim().is_empty() {
                None
            } else {
                Some(parse_oid("TSA_POLICY_OID", &value)?)
            };
        }

        if let Some(value) = var("TSA_ACCEPTED_POLICIES") {
            config.accepted_policies = parse_list(&value)
                .map(|item| parse_oid("TSA_ACCEPTED_POLICIES", item))
                .collect::<Result<_, _>>()?;
        }

        if let Some(value) = var("TSA_ALLOW_POLICY_SUBSTITUTION") {
            config.allow_policy_substitution = parse_bool("TSA_ALLOW_POLICY_SUBSTITUTION", &value)?;
        }

        if let Some(value) = var("TSA_HASH_ALGORITHMS") {
            config.hash_algorithms = parse_list(&value)
                .map(|item| {
                    HashAlgorithm::from_name(item).ok_or_else(|| invalid("TSA_HASH_ALGORITHMS", item))
                })
                .collect::<Result<_, _>>()?;
        }

        if let Some(value) = var("TSA_SIGNATURE_ALGORITHMS") {
            config.signature_algorithms = parse_list(&value)
                .map(|item| {
                    SignatureAlgorithm::from_name(item)
                        .ok_or_else(|| invalid("TSA_SIGNATURE_ALGORITHMS", item))
                })
                .collect::<Result<_, _>>()?;
        }

        if let Some(value) = var("TSA_ACCURACY_MS") {
            let ms = value
                .trim()
                .parse::<u64>()
                .map_err(|_| invalid("TSA_ACCURACY_MS", &value))?;
            config.accuracy = Some(Duration::from_millis(ms));
        }

        if let Some(value) = var("TSA_ORDERING") {
            config.ordering = parse_bool("TSA_ORDERING", &value)?;
        }

        if let Some(value) = var("TSA_INCLUDE_TSA_NAME") {
            config.include_tsa_name = parse_bool("TSA_INCLUDE_TSA_NAME", &value)?;
        }

        if let Some(value) = var("TSA_NON_CRITICAL_EXTENSIONS") {
            config.non_critical_extensions = match value.trim().to_ascii_lowercase().as_str() {
                "ignore" => NonCriticalExtensions::Ignore,
                "report" => NonCriticalExtensions::Report,
                _ => return Err(invalid("TSA_NON_CRITICAL_EXTENSIONS", &value)),
            };
        }

        if let Some(value) = var("TSA_SUPPORTED_EXTENSIONS") {
            config.supported_extensions = parse_list(&value)
                .map(|item| parse_oid("TSA_SUPPORTED_EXTENSIONS", item))
                .collect::<Result<_, _>>()?;
        }

        if let Some(value) = var("TSA_SERIAL_STATE_PATH") {
            config.serial_state_path = Some(PathBuf::from(value));
        }

        if let Some(value) = var("TSA_SERIAL_BLOCK") {
            config.serial_block = value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|block| *block > 0)
                .ok_or_else(|| invalid("TSA_SERIAL_BLOCK", &value))?;
        }

        config.check()?;
        Ok(config)
    }

    /// Reject configurations that could never issue a token.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.default_policy.is_none() && self.accepted_policies.is_empty() {
            return Err(ConfigError::NoPolicy);
        }
        if self.hash_algorithms.is_empty() {
            return Err(invalid("TSA_HASH_ALGORITHMS", ""));
        }
        if self.signature_algorithms.is_empty() {
            return Err(invalid("TSA_SIGNATURE_ALGORITHMS", ""));
        }
        Ok(())
    }

    /// Whether a request naming `policy` can be honored as asked.
    pub fn accepts_policy(&self, policy: &ObjectIdentifier) -> bool {
        self.default_policy.as_ref() == Some(policy) || self.accepted_policies.contains(policy)
    }

    /// Open the serial allocator this configuration describes.
    ///
    /// Fails when no state path is configured, or when the state exists but
    /// cannot be used; the authority must not start in either case. Tests
    /// that want deterministic in-memory serials use
    /// [`SerialAllocator::starting_at`] directly.
    pub fn open_serial_allocator(&self) -> Result<SerialAllocator, ConfigError> {
        let path = self
            .serial_state_path
            .as_ref()
            .ok_or(ConfigError::NoSerialState)?;
        Ok(SerialAllocator::with_store(
            Box::new(FileSerialStore::new(path.clone())),
            self.serial_block,
        )?)
    }
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    }
}

fn parse_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn parse_oid(name: &'static str, value: &str) -> Result<ObjectIdentifier, ConfigError> {
    ObjectIdentifier::from_str(value.trim()).map_err(|_| invalid(name, value))
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value)),
    }
}
