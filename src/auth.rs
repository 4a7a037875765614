//! mTLS client identity
//!
//! When the server is started with a client CA, clients must present a
//! certificate during the QUIC/TLS handshake. The certificate's Common Name
//! identifies the client in session logs.

use std::fmt;

use x509_parser::prelude::*;

/// Why a client certificate yields no identity
#[derive(Debug, PartialEq, Eq)]
pub enum IdentityError {
    /// DER bytes are not an X.509 certificate
    Malformed(String),
    /// Subject carries no CN attribute
    NoCommonName,
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Malformed(reason) => {
                write!(f, "unreadable client certificate: {}", reason)
            }
            IdentityError::NoCommonName => write!(f, "client certificate subject has no CN"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Subject Common Name of a DER-encoded client certificate
pub fn common_name(der: &[u8]) -> Result<String, IdentityError> {
    let cert = match X509Certificate::from_der(der) {
        Ok((_, cert)) => cert,
        Err(e) => return Err(IdentityError::Malformed(e.to_string())),
    };

    let cn = cert
        .subject()
        .iter_common_name()
        .find_map(|attr| attr.as_str().ok())
        .ok_or(IdentityError::NoCommonName)?;
    Ok(cn.to_owned())
}
