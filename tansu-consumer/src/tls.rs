// Copyright ⓒ 2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Mutual TLS
//!
//! TLS is only enabled when a certificate, private key and certificate
//! authority are all supplied. Skipping verification disables checking of
//! the server certificate chain, handshake signatures are still verified.

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, ring, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use tracing::debug;

use crate::{Error, Result};

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Tls {
    certificate: Option<PathBuf>,
    key: Option<PathBuf>,
    ca: Option<PathBuf>,
    skip_verify: bool,
}

impl Tls {
    pub fn certificate(self, certificate: Option<PathBuf>) -> Self {
        Self {
            certificate,
            ..self
        }
    }

    pub fn key(self, key: Option<PathBuf>) -> Self {
        Self { key, ..self }
    }

    pub fn ca(self, ca: Option<PathBuf>) -> Self {
        Self { ca, ..self }
    }

    pub fn skip_verify(self, skip_verify: bool) -> Self {
        Self {
            skip_verify,
            ..self
        }
    }

    /// the TLS context, none unless certificate, key and authority are all present
    pub fn context(&self) -> Result<Option<TlsContext>> {
        let (Some(certificate), Some(key), Some(ca)) = (
            non_empty(self.certificate.as_deref()),
            non_empty(self.key.as_deref()),
            non_empty(self.ca.as_deref()),
        ) else {
            debug!(tls = false);
            return Ok(None);
        };

        let certificates = certificates(certificate)?;
        let private_key = private_key(key)?;

        let mut roots = RootCertStore::empty();
        for authority in self::certificates(ca)? {
            roots.add(authority)?;
        }

        debug!(
            certificate = %certificate.display(),
            ca = %ca.display(),
            authorities = roots.len(),
            skip_verify = self.skip_verify
        );

        Ok(Some(TlsContext {
            certificates,
            key: private_key,
            roots: Arc::new(roots),
            skip_verify: self.skip_verify,
            locations: Locations {
                certificate: certificate.to_path_buf(),
                key: key.to_path_buf(),
                ca: ca.to_path_buf(),
            },
        }))
    }
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|path| !path.as_os_str().is_empty())
}

/// at least one PEM certificate
fn certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(Error::from)
        .and_then(|mut reader| {
            rustls_pemfile::certs(&mut reader)
                .collect::<Result<Vec<_>, _>>()
                .map_err(Into::into)
        })
        .and_then(|certificates| {
            if certificates.is_empty() {
                Err(Error::NoCertificates(path.to_path_buf()))
            } else {
                Ok(certificates)
            }
        })
}

fn private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(Error::from)
        .and_then(|mut reader| rustls_pemfile::private_key(&mut reader).map_err(Into::into))
        .and_then(|key| key.ok_or_else(|| Error::NoPrivateKey(path.to_path_buf())))
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct Locations {
    certificate: PathBuf,
    key: PathBuf,
    ca: PathBuf,
}

/// client certificate chain, private key and trusted authorities
#[derive(Debug)]
pub struct TlsContext {
    certificates: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: Arc<RootCertStore>,
    skip_verify: bool,
    locations: Locations,
}

impl TlsContext {
    /// the file the certificate chain was loaded from
    pub fn certificate_location(&self) -> &Path {
        &self.locations.certificate
    }

    pub fn key_location(&self) -> &Path {
        &self.locations.key
    }

    pub fn ca_location(&self) -> &Path {
        &self.locations.ca
    }

    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    pub fn roots(&self) -> &RootCertStore {
        &self.roots
    }

    pub fn skip_verify(&self) -> bool {
        self.skip_verify
    }

    /// client configuration authenticating with the certificate chain
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let provider = Arc::new(ring::default_provider());

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        if self.skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipChainVerification { provider }))
                .with_client_auth_cert(self.certificates.clone(), self.key.clone_key())
        } else {
            builder
                .with_root_certificates(self.roots.clone())
                .with_client_auth_cert(self.certificates.clone(), self.key.clone_key())
        }
        .map(Arc::new)
        .map_err(Into::into)
    }
}

/// accept any server certificate chain, verifying handshake signatures only
#[derive(Debug)]
struct SkipChainVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipChainVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
