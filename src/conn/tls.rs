//! TLS parameters and the plain-or-TLS stream the pool hands out.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{TlsConnector, client::TlsStream};

use crate::error::{self, Error};

/// Server certificate verification policy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Verify {
    /// Verify against the built-in webpki root store.
    #[default]
    Enabled,
    /// Skip verification. TLS is still negotiated.
    Disabled,
    /// Verify against a CA bundle file, or every bundle in a directory.
    CaBundle(PathBuf),
}

/// A client certificate chain and private key, both PEM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    cert: PathBuf,
    key: PathBuf,
}

impl Identity {
    /// Certificate chain and key stored in separate files.
    pub fn from_pem_files(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Identity {
        Identity {
            cert: cert.into(),
            key: key.into(),
        }
    }

    /// Certificate chain and key concatenated in one file.
    pub fn from_pem_file(path: impl Into<PathBuf>) -> Identity {
        let path = path.into();
        Identity {
            cert: path.clone(),
            key: path,
        }
    }
}

/// Build a rustls client configuration from the verify/cert pair.
pub(crate) fn client_config(
    verify: &Verify,
    identity: Option<&Identity>,
) -> Result<Arc<ClientConfig>, Error> {
    let builder = match verify {
        Verify::Disabled => {
            // `dangerous()` skips verification only; TLS is still negotiated
            let builder = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification::new()));
            return finish_config_verified(builder, identity);
        }
        Verify::Enabled => {
            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            ClientConfig::builder().with_root_certificates(roots)
        }
        Verify::CaBundle(path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_ca_bundle(path)? {
                roots.add(cert).map_err(error::builder)?;
            }
            ClientConfig::builder().with_root_certificates(roots)
        }
    };
    finish_config_verified(builder, identity)
}

fn finish_config_verified(
    builder: rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>,
    identity: Option<&Identity>,
) -> Result<Arc<ClientConfig>, Error> {
    let config = match identity {
        Some(identity) => {
            let (certs, key) = load_identity(identity)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(error::builder)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Read every certificate from a PEM bundle file, or from each file of a
/// directory when `path` points at one.
fn load_ca_bundle(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let meta = std::fs::metadata(path).map_err(error::builder)?;
    let mut certs = Vec::new();
    if meta.is_dir() {
        for entry in std::fs::read_dir(path).map_err(error::builder)? {
            let entry = entry.map_err(error::builder)?;
            if entry.file_type().map_err(error::builder)?.is_file() {
                read_pem_certs(&entry.path(), &mut certs)?;
            }
        }
    } else {
        read_pem_certs(path, &mut certs)?;
    }
    if certs.is_empty() {
        return Err(error::builder_msg("no certificates found in CA bundle"));
    }
    Ok(certs)
}

fn read_pem_certs(path: &Path, out: &mut Vec<CertificateDer<'static>>) -> Result<(), Error> {
    let pem = std::fs::read(path).map_err(error::builder)?;
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        out.push(cert.map_err(error::builder)?);
    }
    Ok(())
}

fn load_identity(
    identity: &Identity,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    let mut certs = Vec::new();
    read_pem_certs(&identity.cert, &mut certs)?;
    if certs.is_empty() {
        return Err(error::builder_msg("no certificate found in client identity"));
    }
    let pem = std::fs::read(&identity.key).map_err(error::builder)?;
    let key = rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(error::builder)?
        .ok_or_else(|| error::builder_msg("no private key found in client identity"))?;
    Ok((certs, key))
}

/// Accepts any server certificate. Used for `Verify::Disabled`.
#[derive(Debug)]
struct NoVerification {
    provider: rustls::crypto::CryptoProvider,
}

impl NoVerification {
    fn new() -> Self {
        NoVerification {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Perform the TLS handshake over an established TCP stream.
pub(crate) async fn handshake(
    config: Arc<ClientConfig>,
    server_name: &str,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>, Error> {
    let sni = ServerName::try_from(server_name.to_owned()).map_err(error::builder)?;
    let connector = TlsConnector::from(config);
    connector.connect(sni, tcp).await.map_err(error::connect)
}

/// A socket that is either plain TCP or TLS over TCP.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    /// The underlying TCP stream, used for the peer-closed probe.
    pub(crate) fn tcp_ref(&self) -> &TcpStream {
        match self {
            MaybeTlsStream::Plain(tcp) => tcp,
            MaybeTlsStream::Tls(tls) => tls.get_ref().0,
        }
    }
}

impl fmt::Debug for MaybeTlsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeTlsStream::Plain(_) => f.write_str("MaybeTlsStream::Plain"),
            MaybeTlsStream::Tls(_) => f.write_str("MaybeTlsStream::Tls"),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
