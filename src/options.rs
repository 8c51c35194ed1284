//! Instance and per-resource configuration.

use crate::dns::DEFAULT_DNS_RESOLVER;
use crate::error::{Error, Result};
use crate::p2p::{JoinOpts, MemHub, DEFAULT_JOIN_OPTS};
use std::path::PathBuf;
use std::sync::Arc;

/// Validation applied to values written through the key-value view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueEncoding {
    Binary,
    Utf8,
    Json,
}

impl Default for ValueEncoding {
    fn default() -> Self {
        ValueEncoding::Binary
    }
}

impl ValueEncoding {
    pub(crate) fn check(&self, value: &[u8]) -> Result<()> {
        match self {
            ValueEncoding::Binary => Ok(()),
            ValueEncoding::Utf8 => match std::str::from_utf8(value) {
                Ok(_) => Ok(()),
                Err(e) => Err(Error::InvalidIdentifier(format!("value is not utf-8: {}", e))),
            },
            ValueEncoding::Json => {
                serde_json::from_slice::<serde::de::IgnoredAny>(value)?;
                Ok(())
            }
        }
    }
}

/// Defaults applied to every opened resource unless overridden per call.
#[derive(Clone, Debug)]
pub struct CoreOpts {
    /// Write entries through to the datastore.
    pub persist: bool,
    /// Accepted for compatibility, the embedded backend always mirrors
    /// whole logs.
    pub sparse: bool,
    pub value_encoding: ValueEncoding,
    /// Namespace names are derived under.
    pub namespace: String,
}

impl Default for CoreOpts {
    fn default() -> Self {
        CoreOpts {
            persist: true,
            sparse: true,
            value_encoding: ValueEncoding::default(),
            namespace: "hyper-sdk".to_string(),
        }
    }
}

/// Instance wide configuration.
#[derive(Clone, Debug)]
pub struct SdkOptions {
    /// Storage directory. `None` keeps everything in memory.
    pub storage: Option<PathBuf>,
    /// DNS-over-HTTPS endpoint used for DNSLink lookups.
    pub dns_resolver: String,
    /// Join the topic of every opened resource automatically.
    pub auto_join: bool,
    /// Mirror matching logs on every new connection automatically.
    pub do_replicate: bool,
    pub default_core_opts: CoreOpts,
    pub default_join_opts: JoinOpts,
    /// In-process network to attach to. A fresh isolated hub is created
    /// when absent.
    pub hub: Option<Arc<MemHub>>,
}

impl SdkOptions {
    pub fn new(storage: impl Into<PathBuf>) -> SdkOptions {
        SdkOptions {
            storage: Some(storage.into()),
            ..SdkOptions::inmemory()
        }
    }

    pub fn inmemory() -> SdkOptions {
        SdkOptions {
            storage: None,
            dns_resolver: DEFAULT_DNS_RESOLVER.to_string(),
            auto_join: true,
            do_replicate: true,
            default_core_opts: CoreOpts::default(),
            default_join_opts: DEFAULT_JOIN_OPTS,
            hub: None,
        }
    }
}

impl Default for SdkOptions {
    fn default() -> Self {
        SdkOptions::inmemory()
    }
}

/// Per-call overrides for opening a resource.
#[derive(Clone, Debug, Default)]
pub struct GetOpts {
    pub auto_join: Option<bool>,
    pub persist: Option<bool>,
    pub sparse: Option<bool>,
    pub value_encoding: Option<ValueEncoding>,
    pub namespace: Option<String>,
    pub join: Option<JoinOpts>,
}
