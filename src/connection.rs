//! Connection factory
//!
//! Turns a [`ConnectionConfig`] into a logged-in IMAP session with the
//! watched folder selected:
//!
//! TCP (direct or through the proxy) -> TLS (implicit or STARTTLS) ->
//! LOGIN -> CAPABILITY -> SELECT
//!
//! No retries happen here. Every failure is returned to the caller with
//! the stage it happened in encoded in the [`Error`] variant.

use crate::config::{ConnectionConfig, TlsMode};
use crate::error::{Error, Result};
use crate::proxy;
use async_imap::Session;
use async_imap::error::Error as ImapError;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

/// Any byte stream an IMAP session can run over.
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug> ImapStream for T {}

/// A logged-in IMAP session over a TLS stream, direct or proxied.
pub type ImapSession = Session<Compat<Box<dyn ImapStream>>>;

/// What the server told us while we set the session up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxState {
    /// Whether `IDLE` was advertised after login.
    pub idle: bool,
    /// `EXISTS` count at SELECT time.
    pub exists: u32,
    /// First UID that will count as new mail.
    pub uid_next: u32,
}

/// Open a fresh session and select `config.folder`.
///
/// # Errors
///
/// Returns [`Error::Config`], [`Error::Proxy`], [`Error::Connection`],
/// [`Error::Tls`], [`Error::Auth`] or [`Error::Imap`] for the stage that
/// failed.
pub async fn connect(config: &ConnectionConfig) -> Result<(ImapSession, MailboxState)> {
    config.validate()?;

    let tcp = dial(config).await?;
    let connector = tls_connector(config.danger_accept_invalid_certs)?;
    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|e| Error::Tls(format!("Invalid server name: {e}")))?;

    let tcp = match config.tls {
        TlsMode::Implicit => tcp,
        TlsMode::StartTls => {
            let mut plain = async_imap::Client::new(tcp.compat());
            plain
                .run_command_and_check_ok("STARTTLS", None)
                .await
                .map_err(|e| Error::Tls(format!("STARTTLS failed: {e}")))?;
            plain.into_inner().into_inner()
        }
    };

    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;
    debug!("TLS established with {}", config.host);

    let stream: Box<dyn ImapStream> = Box::new(tls_stream);
    let client = async_imap::Client::new(stream.compat());

    let mut session = client
        .login(&config.username, &config.password)
        .await
        .map_err(|(e, _)| login_error(e))?;
    info!("Logged in to {} as {}", config.address(), config.username);

    let idle = session
        .capabilities()
        .await
        .map_err(|e| Error::Imap(format!("CAPABILITY failed: {e}")))?
        .has_str("IDLE");

    let state = select(&mut session, config, idle).await?;
    Ok((session, state))
}

/// Open the raw TCP stream, through the proxy when one is configured.
async fn dial(config: &ConnectionConfig) -> Result<TcpStream> {
    if let Some(proxy) = &config.proxy {
        return proxy::dial(proxy, &config.host, config.port).await;
    }

    let addr = config.address();
    debug!("Connecting to IMAP server at {}", addr);
    TcpStream::connect(&addr)
        .await
        .map_err(|e| Error::Connection(format!("{addr}: {e}")))
}

async fn select(
    session: &mut ImapSession,
    config: &ConnectionConfig,
    idle: bool,
) -> Result<MailboxState> {
    let folder = config.folder.as_str();
    let mailbox = session
        .select(folder)
        .await
        .map_err(|e| Error::Imap(format!("Failed to select {folder}: {e}")))?;

    let uid_next = match mailbox.uid_next {
        Some(next) => next,
        // UIDNEXT is only a SHOULD in RFC 3501; derive it from the data.
        None => session
            .uid_search("ALL")
            .await
            .map_err(|e| Error::Imap(format!("Search failed: {e}")))?
            .into_iter()
            .max()
            .map_or(1, |max| max + 1),
    };

    debug!(
        "Selected {} ({} messages, UIDNEXT {}, IDLE {})",
        folder, mailbox.exists, uid_next, idle
    );

    Ok(MailboxState {
        idle,
        exists: mailbox.exists,
        uid_next,
    })
}

/// A tagged NO/BAD to LOGIN is a credential rejection; anything else
/// means the connection itself broke.
fn login_error(err: ImapError) -> Error {
    match err {
        ImapError::No(msg) | ImapError::Bad(msg) => Error::Auth(format!("Login rejected: {msg}")),
        ImapError::Io(e) => Error::Io(e),
        other => Error::Connection(format!("Login failed: {other}")),
    }
}

fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?;

    let config = if accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new(&provider)))
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Skips chain and hostname validation but still checks handshake
/// signatures, so the session is at least bound to the presented key.
#[derive(Debug)]
struct AcceptAnyCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyCert {
    const fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
