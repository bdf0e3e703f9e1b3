//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds the driver must surface per the interface
//! contract: callers match on variant, not on message text.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("external command failed: {0}")]
    External(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Nftables(#[from] nftables::helper::NftablesError),

    #[error(transparent)]
    Caps(#[from] capctl::Error),

    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
}

impl Error {
    /// Classify a libvirt error: domain/filter lookup misses become
    /// `NotFound` so callers can apply the "tolerate already gone"
    /// propagation policy (§7); a lost connection becomes `Fatal` so the
    /// gateway knows to reopen; everything else is `External`.
    pub fn from_libvirt(err: virt::error::Error) -> Self {
        use virt::sys::{
            VIR_ERR_NO_CONNECT, VIR_ERR_NO_DOMAIN, VIR_ERR_NO_NWFILTER, VIR_ERR_SYSTEM_ERROR,
        };
        let code = err.code();
        if code == VIR_ERR_NO_DOMAIN as i32 || code == VIR_ERR_NO_NWFILTER as i32 {
            Error::NotFound(err.to_string())
        } else if code == VIR_ERR_SYSTEM_ERROR as i32 || code == VIR_ERR_NO_CONNECT as i32 {
            Error::Fatal(format!("libvirt connection lost: {err}"))
        } else {
            Error::External(format!("libvirt: {err}"))
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }
}
