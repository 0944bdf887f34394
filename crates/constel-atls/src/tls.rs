use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, CustomExtension, DnType, KeyPair};
use rustls::client::ResolvesClientCert;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Name};

use constel_core::constants::DIAL_TIMEOUT;
use constel_core::crypto::generate_random_bytes;

use crate::attestation::{Issuer, Validator, oid_string};

/// Length of handshake nonces.
pub const NONCE_LENGTH: usize = 32;

/// Last label of the SNI name carrying the client nonce.
const SNI_SUFFIX: &str = "atls";

#[derive(Debug, thiserror::Error)]
pub enum AtlsError {
    #[error("client hello carries no attestation nonce")]
    MissingNonce,
    #[error("certificate carries no attestation document for a known validator")]
    NoMatchingDocument,
    #[error("attestation document does not bind the certificate key")]
    KeyMismatch,
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("attestation failed: {0}")]
    Validation(String),
}

impl From<AtlsError> for rustls::Error {
    fn from(e: AtlsError) -> Self {
        rustls::Error::General(e.to_string())
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn public_key_hash(spki_der: &[u8]) -> Vec<u8> {
    Sha256::digest(spki_der).to_vec()
}

// ============================================================================
// Nonce transport
// ============================================================================

/// SNI name carrying a client nonce: `<hex>.<hex>.atls`.
pub fn nonce_server_name(nonce: &[u8]) -> String {
    let hex = hex_encode(nonce);
    let (a, b) = hex.split_at(hex.len() / 2);
    format!("{a}.{b}.{SNI_SUFFIX}")
}

/// Inverse of [`nonce_server_name`].
pub fn parse_nonce_server_name(name: &str) -> Option<Vec<u8>> {
    let mut labels = name.split('.');
    let (a, b, suffix) = (labels.next()?, labels.next()?, labels.next()?);
    if suffix != SNI_SUFFIX || labels.next().is_some() {
        return None;
    }
    hex_decode(&format!("{a}{b}"))
}

/// DER `Name` with a single common name holding the hex nonce.
///
/// Servers send it as the only acceptable CA name of their certificate
/// request; that is the one message reaching the client before it picks its
/// certificate.
fn nonce_distinguished_name(nonce: &[u8]) -> Vec<u8> {
    const CN_OID: [u8; 5] = [0x06, 0x03, 0x55, 0x04, 0x03];
    let value = der_tlv(0x0c, hex_encode(nonce).as_bytes());
    let attr = der_tlv(0x30, &[CN_OID.as_slice(), &value].concat());
    der_tlv(0x30, &der_tlv(0x31, &attr))
}

fn parse_nonce_distinguished_name(der: &[u8]) -> Option<Vec<u8>> {
    let (_, name) = X509Name::from_der(der).ok()?;
    let cn = name.iter_common_name().next()?.as_str().ok()?;
    hex_decode(cn)
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
    out.extend_from_slice(content);
    out
}

// ============================================================================
// Certificates
// ============================================================================

/// Self-signed certificate whose extension binds a fresh key to `nonce`.
fn issue_certificate(
    issuer: &dyn Issuer,
    nonce: &[u8],
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let key_pair = KeyPair::generate().with_context(|| "Failed to generate TLS key")?;
    let user_data = public_key_hash(&key_pair.public_key_der());
    let doc = issuer
        .issue(&user_data, nonce)
        .with_context(|| "Failed to issue attestation document")?;

    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params
        .distinguished_name
        .push(DnType::CommonName, "Constellation");
    params
        .custom_extensions
        .push(CustomExtension::from_oid_content(issuer.oid(), doc));
    let cert = params.self_signed(&key_pair)?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((cert.der().clone(), key))
}

/// Check that `der` is self-signed and carries a valid document over its key.
fn verify_attested_certificate(
    der: &[u8],
    nonce: &[u8],
    validators: &[Arc<dyn Validator>],
) -> Result<(), AtlsError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| AtlsError::InvalidCertificate(e.to_string()))?;
    cert.verify_signature(None)
        .map_err(|e| AtlsError::InvalidCertificate(format!("self-signature: {e}")))?;
    let hash = public_key_hash(cert.public_key().raw);

    for ext in cert.extensions() {
        let oid = ext.oid.to_id_string();
        let Some(validator) = validators.iter().find(|v| oid_string(v.oid()) == oid) else {
            continue;
        };
        let user_data = validator
            .validate(ext.value, nonce)
            .map_err(|e| AtlsError::Validation(format!("{e:#}")))?;
        if user_data != hash {
            return Err(AtlsError::KeyMismatch);
        }
        debug!(oid = %oid, "Attestation document verified");
        return Ok(());
    }
    Err(AtlsError::NoMatchingDocument)
}

// ============================================================================
// Server side
// ============================================================================

/// Factory for per-connection attested server configs.
pub struct AttestationServerConfig {
    issuer: Arc<dyn Issuer>,
    validators: Vec<Arc<dyn Validator>>,
    provider: Arc<CryptoProvider>,
}

/// Server config embedding `issuer`'s documents; with `validators`, clients
/// must attest themselves too.
pub fn create_attestation_server_config(
    issuer: Arc<dyn Issuer>,
    validators: Vec<Arc<dyn Validator>>,
) -> AttestationServerConfig {
    AttestationServerConfig {
        issuer,
        validators,
        provider: crypto_provider(),
    }
}

impl AttestationServerConfig {
    /// TLS config answering a client hello that carried `client_nonce`.
    pub fn config_for_client(&self, client_nonce: &[u8]) -> Result<Arc<ServerConfig>> {
        let (cert, key) = issue_certificate(self.issuer.as_ref(), client_nonce)?;
        let builder = ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?;
        let builder = if self.validators.is_empty() {
            builder.with_no_client_auth()
        } else {
            let server_nonce = generate_random_bytes(NONCE_LENGTH);
            builder.with_client_cert_verifier(Arc::new(AttestedClientVerifier {
                root_hints: vec![rustls::DistinguishedName::from(
                    nonce_distinguished_name(&server_nonce),
                )],
                nonce: server_nonce,
                validators: self.validators.clone(),
                provider: self.provider.clone(),
            }))
        };
        let config = builder
            .with_single_cert(vec![cert], key)
            .with_context(|| "Failed to build attested server config")?;
        Ok(Arc::new(config))
    }

    /// Run the attested handshake on an accepted connection.
    pub async fn accept<IO>(&self, stream: IO) -> Result<tokio_rustls::server::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
            .await
            .with_context(|| "Failed to read client hello")?;
        let client_nonce = start
            .client_hello()
            .server_name()
            .and_then(parse_nonce_server_name)
            .ok_or(AtlsError::MissingNonce)?;
        let config = self.config_for_client(&client_nonce)?;
        start
            .into_stream(config)
            .await
            .with_context(|| "Attested TLS handshake failed")
    }
}

struct AttestedClientVerifier {
    nonce: Vec<u8>,
    root_hints: Vec<rustls::DistinguishedName>,
    validators: Vec<Arc<dyn Validator>>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for AttestedClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestedClientVerifier")
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl ClientCertVerifier for AttestedClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &self.root_hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        verify_attested_certificate(end_entity.as_ref(), &self.nonce, &self.validators).map_err(
            |e| {
                warn!(error = %e, "Rejecting client certificate");
                rustls::Error::from(e)
            },
        )?;
        Ok(ClientCertVerified::assertion())
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

// ============================================================================
// Client side
// ============================================================================

/// Factory for per-connection attested client configs.
pub struct AttestationClientConfig {
    issuer: Option<Arc<dyn Issuer>>,
    validators: Vec<Arc<dyn Validator>>,
    provider: Arc<CryptoProvider>,
}

/// Client config validating the server against `validators`. With an
/// `issuer`, the client also attests itself to servers that ask for it.
/// Without validators, the server's document is not checked.
pub fn create_attestation_client_config(
    issuer: Option<Arc<dyn Issuer>>,
    validators: Vec<Arc<dyn Validator>>,
) -> AttestationClientConfig {
    AttestationClientConfig {
        issuer,
        validators,
        provider: crypto_provider(),
    }
}

impl AttestationClientConfig {
    fn config_for_nonce(&self, nonce: Vec<u8>) -> Result<Arc<ClientConfig>> {
        let verifier = AttestedServerVerifier {
            nonce,
            validators: self.validators.clone(),
            provider: self.provider.clone(),
        };
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));
        let config = match &self.issuer {
            Some(issuer) => builder.with_client_cert_resolver(Arc::new(AttestedCertResolver {
                issuer: issuer.clone(),
                provider: self.provider.clone(),
            })),
            None => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }

    /// Run the attested handshake over an established stream.
    pub async fn connect_stream<IO>(&self, stream: IO) -> Result<tokio_rustls::client::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let nonce = generate_random_bytes(NONCE_LENGTH);
        let server_name = ServerName::try_from(nonce_server_name(&nonce))
            .with_context(|| "Failed to encode nonce as server name")?;
        let connector = TlsConnector::from(self.config_for_nonce(nonce)?);
        connector
            .connect(server_name, stream)
            .await
            .with_context(|| "Attested TLS handshake failed")
    }

    /// Dial `addr` and run the attested handshake.
    pub async fn connect(&self, addr: &str) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .with_context(|| format!("Timed out dialing {}", addr))?
            .with_context(|| format!("Failed to dial {}", addr))?;
        self.connect_stream(tcp).await
    }
}

struct AttestedServerVerifier {
    nonce: Vec<u8>,
    validators: Vec<Arc<dyn Validator>>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for AttestedServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestedServerVerifier")
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl ServerCertVerifier for AttestedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if !self.validators.is_empty() {
            verify_attested_certificate(end_entity.as_ref(), &self.nonce, &self.validators)
                .map_err(|e| {
                    warn!(error = %e, "Rejecting server certificate");
                    rustls::Error::from(e)
                })?;
        }
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

/// Issues the client certificate once the server's nonce is known.
struct AttestedCertResolver {
    issuer: Arc<dyn Issuer>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for AttestedCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestedCertResolver").finish()
    }
}

impl AttestedCertResolver {
    fn certified_key(&self, server_nonce: &[u8]) -> Result<CertifiedKey> {
        let (cert, key) = issue_certificate(self.issuer.as_ref(), server_nonce)?;
        let signing_key = self
            .provider
            .key_provider
            .load_private_key(key)
            .with_context(|| "Failed to load client key")?;
        Ok(CertifiedKey::new(vec![cert], signing_key))
    }
}

impl ResolvesClientCert for AttestedCertResolver {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        let Some(server_nonce) = root_hint_subjects
            .iter()
            .find_map(|dn| parse_nonce_distinguished_name(dn))
        else {
            warn!("Server requested a client certificate without a nonce");
            return None;
        };
        match self.certified_key(&server_nonce) {
            Ok(key) => Some(Arc::new(key)),
            Err(e) => {
                warn!(error = %e, "Failed to issue client certificate");
                None
            }
        }
    }

    fn has_certs(&self) -> bool {
        true
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
