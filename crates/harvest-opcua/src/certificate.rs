// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Local application identity and the server certificate trust decision.
//!
//! The adapter refuses to attempt any connection unless its own application
//! instance certificate and private key are present and well-formed. Trust in
//! the *server's* certificate is a single yes/no policy carried on the
//! configuration instead of process-wide state.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{CertificateError, CredentialKind};

// =============================================================================
// ApplicationIdentity
// =============================================================================

/// The client application's own identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationIdentity {
    /// Application name announced to the server.
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Application URI. Derived from the name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_uri: Option<String>,

    /// Application instance certificate (DER or PEM).
    #[serde(default = "default_certificate_path")]
    pub certificate_path: PathBuf,

    /// Private key matching the certificate (DER or PEM).
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,

    /// PKI directory holding trusted and rejected peer certificates.
    #[serde(default = "default_pki_dir")]
    pub pki_dir: PathBuf,
}

fn default_application_name() -> String {
    "OPC UA Client".to_string()
}

fn default_certificate_path() -> PathBuf {
    PathBuf::from("pki/own/cert.der")
}

fn default_private_key_path() -> PathBuf {
    PathBuf::from("pki/private/private.pem")
}

fn default_pki_dir() -> PathBuf {
    PathBuf::from("pki")
}

impl Default for ApplicationIdentity {
    fn default() -> Self {
        Self {
            application_name: default_application_name(),
            application_uri: None,
            certificate_path: default_certificate_path(),
            private_key_path: default_private_key_path(),
            pki_dir: default_pki_dir(),
        }
    }
}

impl ApplicationIdentity {
    /// Creates an identity using the given credential files.
    pub fn new(certificate_path: impl Into<PathBuf>, private_key_path: impl Into<PathBuf>) -> Self {
        Self {
            certificate_path: certificate_path.into(),
            private_key_path: private_key_path.into(),
            ..Default::default()
        }
    }

    /// Sets the application name.
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Sets the PKI directory.
    pub fn with_pki_dir(mut self, pki_dir: impl Into<PathBuf>) -> Self {
        self.pki_dir = pki_dir.into();
        self
    }

    /// Returns the application URI, deriving one from the name if unset.
    pub fn effective_application_uri(&self) -> String {
        self.application_uri.clone().unwrap_or_else(|| {
            format!(
                "urn:harvest:{}",
                self.application_name.replace(char::is_whitespace, "")
            )
        })
    }

    /// Verifies that the certificate and private key are usable.
    ///
    /// This only inspects the local files; it never contacts a server.
    pub fn check(&self) -> Result<CheckedIdentity, CertificateError> {
        let certificate = check_credential(CredentialKind::Certificate, &self.certificate_path)?;
        let private_key = check_credential(CredentialKind::PrivateKey, &self.private_key_path)?;

        debug!(
            certificate = %self.certificate_path.display(),
            certificate_format = %certificate,
            private_key_format = %private_key,
            "Application identity checked"
        );

        Ok(CheckedIdentity {
            certificate,
            private_key,
        })
    }
}

/// Encodings found by [`ApplicationIdentity::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckedIdentity {
    /// Certificate encoding.
    pub certificate: CredentialFormat,
    /// Private key encoding.
    pub private_key: CredentialFormat,
}

/// On-disk credential encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFormat {
    /// Binary DER.
    Der,
    /// Base64 PEM block.
    Pem,
}

impl fmt::Display for CredentialFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Der => f.write_str("DER"),
            Self::Pem => f.write_str("PEM"),
        }
    }
}

fn check_credential(
    kind: CredentialKind,
    path: &Path,
) -> Result<CredentialFormat, CertificateError> {
    if path.as_os_str().is_empty() || !path.is_file() {
        return Err(CertificateError::missing(kind, path));
    }

    let bytes = fs::read(path).map_err(|e| CertificateError::unreadable(kind, path, e))?;
    if bytes.is_empty() {
        return Err(CertificateError::malformed(kind, path, "file is empty"));
    }

    if bytes.starts_with(b"-----BEGIN") {
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| CertificateError::malformed(kind, path, "PEM file is not valid UTF-8"))?;
        let der = decode_pem(kind, text)
            .map_err(|reason| CertificateError::malformed(kind, path, reason))?;
        if !is_der_sequence(&der) {
            return Err(CertificateError::malformed(
                kind,
                path,
                "PEM body is not a DER sequence",
            ));
        }
        Ok(CredentialFormat::Pem)
    } else if is_der_sequence(&bytes) {
        Ok(CredentialFormat::Der)
    } else {
        Err(CertificateError::malformed(kind, path, "neither DER nor PEM"))
    }
}

/// Extracts and decodes the first PEM block whose label fits `kind`.
fn decode_pem(kind: CredentialKind, text: &str) -> Result<Vec<u8>, String> {
    let mut lines = text.lines().map(str::trim);
    let label = loop {
        let Some(line) = lines.next() else {
            return Err("no PEM block found".to_string());
        };
        if let Some(label) = line
            .strip_prefix("-----BEGIN ")
            .and_then(|rest| rest.strip_suffix("-----"))
        {
            break label.to_string();
        }
    };

    let accepted = match kind {
        CredentialKind::Certificate => label == "CERTIFICATE",
        CredentialKind::PrivateKey => label.ends_with("PRIVATE KEY"),
    };
    if !accepted {
        return Err(format!("unexpected PEM block '{label}'"));
    }

    let end_marker = format!("-----END {label}-----");
    let mut body = String::new();
    for line in lines {
        if line == end_marker {
            return BASE64
                .decode(body.as_bytes())
                .map_err(|e| format!("invalid base64 in PEM body: {e}"));
        }
        if !line.contains(':') {
            body.push_str(line);
        }
    }
    Err(format!("missing '{end_marker}'"))
}

/// Returns `true` if `der` is exactly one DER SEQUENCE.
fn is_der_sequence(der: &[u8]) -> bool {
    if der.len() < 2 || der[0] != 0x30 {
        return false;
    }
    let (header, length) = match der[1] {
        short if short < 0x80 => (2, short as usize),
        long => {
            let count = (long & 0x7f) as usize;
            if count == 0 || count > 4 || der.len() < 2 + count {
                return false;
            }
            let length = der[2..2 + count]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize);
            (2 + count, length)
        }
    };
    header + length == der.len()
}

// =============================================================================
// Trust decision
// =============================================================================

/// A server certificate the protocol layer could not chain to a trusted root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    /// Subject distinguished name.
    pub subject: String,
    /// SHA-1 thumbprint, hex encoded, when known.
    pub thumbprint: Option<String>,
}

impl PeerCertificate {
    /// Creates a peer certificate description.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            thumbprint: None,
        }
    }

    /// Reads the subject of a DER-encoded X.509 certificate.
    ///
    /// Returns `None` when `der` is not a parsable certificate.
    pub fn from_der(der: &[u8]) -> Option<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .inspect_err(|e| debug!(error = %e, "Server certificate not parsable"))
            .ok()?;
        Some(Self::new(cert.subject().to_string()))
    }
}

/// Outcome of a trust decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// Accept the certificate for this session.
    Accept,
    /// Reject the certificate; session creation fails.
    Reject,
}

impl TrustDecision {
    /// Returns `true` for [`TrustDecision::Accept`].
    #[inline]
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Decides whether an untrusted server certificate is accepted.
pub trait CertificateTrust: Send + Sync {
    /// Returns the decision for `certificate`.
    fn decide(&self, certificate: &PeerCertificate) -> TrustDecision;
}

/// Trust policy backed by the configured auto-accept flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrustPolicy {
    /// Accept untrusted server certificates.
    pub auto_accept: bool,
}

impl TrustPolicy {
    /// Creates a policy.
    pub fn new(auto_accept: bool) -> Self {
        Self { auto_accept }
    }
}

impl CertificateTrust for TrustPolicy {
    fn decide(&self, certificate: &PeerCertificate) -> TrustDecision {
        if self.auto_accept {
            info!(subject = %certificate.subject, "Accepted Certificate: {}", certificate.subject);
            TrustDecision::Accept
        } else {
            info!(subject = %certificate.subject, "Rejected Certificate: {}", certificate.subject);
            TrustDecision::Reject
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
