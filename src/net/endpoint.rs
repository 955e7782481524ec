//! Endpoint descriptors.
//!
//! An endpoint names where a listener binds or where a dial goes. Descriptors
//! come from the config file and the command line as strings:
//!
//! ```text
//! /run/vmnet/api.sock           unix stream socket (bare path)
//! unix:///run/vmnet/api.sock    unix stream socket
//! unixgram:///run/vmnet/vm.sock unix datagram socket
//! fd://3                        inherited file descriptor
//! ```

use std::fmt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error type for endpoint parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("empty endpoint descriptor")]
    Empty,
    #[error("unsupported endpoint scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("endpoint `{0}` has an empty path")]
    MissingPath(String),
    #[error("invalid file descriptor in `{0}`")]
    InvalidDescriptor(String),
}

/// An address specification for a listener or dial target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Unix-domain stream socket at a filesystem path.
    UnixStream(PathBuf),
    /// Unix-domain datagram socket at a filesystem path.
    UnixDatagram(PathBuf),
    /// Already-open descriptor handed over by the parent process.
    Fd(RawFd),
}

impl Endpoint {
    /// Filesystem path backing this endpoint, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Endpoint::UnixStream(p) | Endpoint::UnixDatagram(p) => Some(p),
            Endpoint::Fd(_) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointError::Empty);
        }

        let Some((scheme, rest)) = s.split_once("://") else {
            return Ok(Endpoint::UnixStream(PathBuf::from(s)));
        };

        match scheme {
            "unix" | "unixgram" => {
                if rest.is_empty() {
                    return Err(EndpointError::MissingPath(s.to_string()));
                }
                let path = PathBuf::from(rest);
                Ok(if scheme == "unix" {
                    Endpoint::UnixStream(path)
                } else {
                    Endpoint::UnixDatagram(path)
                })
            }
            "fd" => rest
                .parse::<RawFd>()
                .ok()
                .filter(|fd| *fd >= 0)
                .map(Endpoint::Fd)
                .ok_or_else(|| EndpointError::InvalidDescriptor(s.to_string())),
            other => Err(EndpointError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::UnixStream(p) => write!(f, "unix://{}", p.display()),
            Endpoint::UnixDatagram(p) => write!(f, "unixgram://{}", p.display()),
            Endpoint::Fd(fd) => write!(f, "fd://{}", fd),
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
