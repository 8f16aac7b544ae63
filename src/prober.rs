//! TLS probing.
//!
//! A probe dials `addr:port`, completes a TLS handshake and reads the
//! leaf certificate's expiry. The handshake accepts any certificate so that
//! self-signed or mismatched certificates can still be inspected; the leaf
//! is checked against the WebPKI roots afterwards and that verdict becomes
//! [`Check::valid`](crate::types::Check).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::types::{Check, Job};

#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe one job. Always yields a terminal check, never an error.
    async fn probe(&self, job: &Job) -> Check;
}

pub struct TlsProber {
    connector: TlsConnector,
    verifier: Arc<WebPkiServerVerifier>,
    timeout: Duration,
}

impl TlsProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let provider = Arc::new(crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .context("Failed to build certificate verifier")?;

        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            verifier,
            timeout,
        })
    }

    async fn handshake(&self, job: &Job) -> Result<Check> {
        // Names that are not DNS names fall back to the dialled address.
        let name = ServerName::try_from(job.server.clone())
            .or_else(|_| ServerName::try_from(job.addr.clone()))
            .map_err(|e| anyhow!("no TLS name for {} ({}): {}", job.server, job.addr, e))?;
        let tcp = TcpStream::connect((job.addr.as_str(), job.port)).await?;
        let mut stream = self.connector.connect(name.clone(), tcp).await?;

        let check = {
            let (_, session) = stream.get_ref();
            let chain = session
                .peer_certificates()
                .filter(|c| !c.is_empty())
                .ok_or_else(|| anyhow!("no peer certificate"))?;
            let (leaf, intermediates) = (&chain[0], &chain[1..]);

            let (_, cert) = X509Certificate::from_der(leaf.as_ref())?;
            let not_after = cert.validity().not_after;
            let valid = self
                .verifier
                .verify_server_cert(leaf, intermediates, &name, &[], UnixTime::now())
                .is_ok();
            Check::success(job, not_after.to_string(), not_after.timestamp() * 1000, valid)
        };

        // The result is already known; closing may take its time.
        tokio::spawn(async move {
            let _ = stream.shutdown().await;
        });
        Ok(check)
    }
}

#[async_trait]
impl Prober for TlsProber {
    async fn probe(&self, job: &Job) -> Check {
        match timeout(self.timeout, self.handshake(job)).await {
            Ok(Ok(check)) => check,
            Ok(Err(e)) => {
                debug!("Probe of {}:{} failed: {:#}", job.addr, job.port, e);
                Check::error(job)
            }
            Err(_) => Check::timeout(job),
        }
    }
}

/// Lets every certificate through while still checking handshake signatures.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
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
        crypto::verify_tls12_signature(
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
        crypto::verify_tls13_signature(
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckStatus, LinkType};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::ServerConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    /// 2031-01-01T00:00:00Z in epoch milliseconds.
    const NOT_AFTER_MS: i64 = 1_924_992_000_000;

    fn job(addr: &str, port: u16) -> Job {
        Job {
            server: "localhost".into(),
            addr: addr.into(),
            port,
            link: LinkType::C2s,
        }
    }

    /// Accept one TLS connection with a self-signed `localhost` certificate.
    async fn self_signed_server() -> u16 {
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.not_after = rcgen::date_time_ymd(2031, 1, 1);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let config = ServerConfig::builder_with_provider(Arc::new(crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            if let Ok(mut stream) = acceptor.accept(socket).await {
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn self_signed_certificate_is_read_but_not_valid() {
        let port = self_signed_server().await;
        let prober = TlsProber::new(Duration::from_secs(5)).unwrap();
        let check = prober.probe(&job("127.0.0.1", port)).await;

        assert_eq!(check.status, CheckStatus::Success);
        assert_eq!(check.expiry_ts, Some(NOT_AFTER_MS));
        assert!(check.expiry.is_some_and(|e| !e.is_empty()));
        assert_eq!(check.valid, Some(false));
        assert_eq!(check.addr, "127.0.0.1");
    }

    #[tokio::test]
    async fn non_dns_server_name_uses_dial_address() {
        let port = self_signed_server().await;
        let prober = TlsProber::new(Duration::from_secs(5)).unwrap();
        let job = Job {
            server: "not a hostname!".into(),
            ..job("127.0.0.1", port)
        };
        let check = prober.probe(&job).await;

        assert_eq!(check.status, CheckStatus::Success);
        assert_eq!(check.expiry_ts, Some(NOT_AFTER_MS));
    }

    #[tokio::test]
    async fn refused_connection_is_error() {
        // Bind then drop to find a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = TlsProber::new(Duration::from_secs(5)).unwrap();
        let check = prober.probe(&job("127.0.0.1", port)).await;
        assert_eq!(check.status, CheckStatus::Error);
        assert_eq!(check.expiry_ts, None);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            // Accept and hold the socket without ever answering.
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let prober = TlsProber::new(Duration::from_millis(200)).unwrap();
        let check = prober.probe(&job("127.0.0.1", port)).await;
        assert_eq!(check.status, CheckStatus::Timeout);
        assert_eq!(check.port, port);
    }

    #[tokio::test]
    async fn garbage_reply_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"ERROR :Closing link\r\n").await;
        });

        let prober = TlsProber::new(Duration::from_secs(5)).unwrap();
        let check = prober.probe(&job("127.0.0.1", port)).await;
        assert_eq!(check.status, CheckStatus::Error);
    }
}
