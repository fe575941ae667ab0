//! TLS Transport
//!
//! Mutually authenticated TLS between members. Both sides must present a
//! certificate and prove possession of its key; whether the certificate is
//! acceptable is decided afterwards against the pinned fingerprints.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::{Dialer, PeerConnection};
use crate::error::{Error, Result};
use crate::identity::LocalIdentity;

/// Name presented in SNI when the address is not a valid server name
const FALLBACK_SERVER_NAME: &str = "collective.invalid";

/// Accepts any certificate whose handshake signatures verify
#[derive(Debug)]
struct PinnedLater {
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedLater {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        })
    }
}

impl ServerCertVerifier for PinnedLater {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for PinnedLater {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// TLS dialer and acceptor for the collective port
pub struct TlsTransport {
    connector: TlsConnector,
    acceptor: TlsAcceptor,
    certificate: Vec<u8>,
    port: u16,
    connect_timeout: Duration,
    /// Source address for outbound connections
    source: Option<IpAddr>,
}

impl TlsTransport {
    /// Load certificate and key from PEM files
    pub fn from_files(
        certificate: &Path,
        private_key: &Path,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let cert_pem = std::fs::read(certificate)?;
        let key_pem = std::fs::read(private_key)?;
        Self::from_pem(&cert_pem, &key_pem, port, connect_timeout)
    }

    /// Build from PEM encoded certificate and key
    pub fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<std::result::Result<Vec<CertificateDer<'static>>, _>>()?;
        let certificate = certs
            .first()
            .map(|c| c.as_ref().to_vec())
            .ok_or_else(|| Error::Config("no certificate found in PEM".into()))?;
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])?
            .ok_or_else(|| Error::Config("no private key found in PEM".into()))?;

        let verifier = PinnedLater::new();

        let client = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_client_auth_cert(certs.clone(), key.clone_key())?;

        let server = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client)),
            acceptor: TlsAcceptor::from(Arc::new(server)),
            certificate,
            port,
            connect_timeout,
            source: None,
        })
    }

    /// Originate outbound connections from `source`
    pub fn with_source(mut self, source: IpAddr) -> Self {
        self.source = Some(source);
        self
    }

    /// The certificate this transport presents
    pub fn identity(&self) -> LocalIdentity {
        LocalIdentity::new(self.certificate.clone())
    }

    /// Complete the server side of a handshake on an accepted socket
    pub async fn accept(&self, socket: TcpStream) -> Result<PeerConnection> {
        let local = host_of(socket.local_addr()?);
        let peer = host_of(socket.peer_addr()?);

        let stream = timeout(self.connect_timeout, self.acceptor.accept(socket))
            .await
            .map_err(|_| Error::ConnectionTimeout(peer.clone()))??;

        let certificate = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|c| c.as_ref().to_vec());

        Ok(PeerConnection::new(stream, certificate, local, peer))
    }
}

#[async_trait]
impl Dialer for TlsTransport {
    async fn dial(&self, address: &str) -> Result<PeerConnection> {
        let socket = match timeout(self.connect_timeout, self.connect(address)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
        };
        socket.set_nodelay(true)?;
        let local = host_of(socket.local_addr()?);

        let server_name = ServerName::try_from(address)
            .or_else(|_| ServerName::try_from(FALLBACK_SERVER_NAME))
            .map(|name| name.to_owned())
            .map_err(|e| Error::Config(format!("invalid server name: {}", e)))?;

        let stream = timeout(self.connect_timeout, self.connector.connect(server_name, socket))
            .await
            .map_err(|_| Error::ConnectionTimeout(address.to_string()))?
            .map_err(|e| Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let certificate = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|c| c.as_ref().to_vec());

        Ok(PeerConnection::new(stream, certificate, local, address))
    }
}

impl TlsTransport {
    async fn connect(&self, address: &str) -> std::io::Result<TcpStream> {
        let Some(source) = self.source else {
            return TcpStream::connect((address, self.port)).await;
        };

        let target = tokio::net::lookup_host((address, self.port))
            .await?
            .find(|a| a.is_ipv4() == source.is_ipv4())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("{} has no address reachable from {}", address, source),
                )
            })?;
        let socket = if source.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(source, 0))?;
        socket.connect(target).await
    }
}

/// Host part of a socket address, with v4-mapped v6 addresses unwrapped
fn host_of(addr: SocketAddr) -> String {
    addr.ip().to_canonical().to_string()
}
