//! Reading PEM files into the [`Certificate`]s and [`PrivateKey`]s a TLS
//! configuration is built from.

use std::fs;
use std::path::Path;

use tokio_rustls::rustls::{Certificate, PrivateKey};

use crate::error::Error;

/// Read every PEM-encoded `CERTIFICATE` in the file at `path`, silently
/// skipping entries with any other label.
pub fn read_certificates(path: impl AsRef<Path>) -> Result<Vec<Certificate>, Error> {
    let contents = fs::read(&path)?;
    let certificates: Vec<Certificate> = pem::parse_many(contents)
        .into_iter()
        .filter(|entry| entry.tag == "CERTIFICATE")
        .map(|entry| Certificate(entry.contents))
        .collect();
    if certificates.is_empty() {
        return Err(Error::InvalidTlsMaterial(format!(
            "no certificates found in {}",
            path.as_ref().display()
        )));
    }
    Ok(certificates)
}

/// Read the file at `path` as a single PEM-encoded certificate.
pub fn read_single_certificate(path: impl AsRef<Path>) -> Result<Certificate, Error> {
    let contents = fs::read(&path)?;
    let entry = pem::parse(contents)
        .map_err(|error| Error::InvalidTlsMaterial(format!("invalid PEM encoding: {}", error)))?;
    if entry.tag == "CERTIFICATE" {
        Ok(Certificate(entry.contents))
    } else {
        Err(Error::InvalidTlsMaterial(format!(
            "not labeled as a certificate: '{}'",
            entry.tag
        )))
    }
}

/// Read the file at `path` as a PEM-encoded private key, in either PKCS#8
/// (`PRIVATE KEY`) or legacy RSA (`RSA PRIVATE KEY`) form.
pub fn read_private_key(path: impl AsRef<Path>) -> Result<PrivateKey, Error> {
    let contents = fs::read(&path)?;
    let entry = pem::parse(contents)
        .map_err(|error| Error::InvalidTlsMaterial(format!("invalid PEM encoding: {}", error)))?;
    match entry.tag.as_str() {
        "PRIVATE KEY" | "RSA PRIVATE KEY" => Ok(PrivateKey(entry.contents)),
        tag => Err(Error::InvalidTlsMaterial(format!(
            "not labeled as a private key: '{}'",
            tag
        ))),
    }
}
