// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use async_imap::Client as AsyncImapClient;
use async_trait::async_trait;
use log::{debug, info, warn};
use rustls::pki_types::ServerName as PkiServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream as TokioTcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream as TokioTlsStreamClient;
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::config::ImapSettings;
use crate::imap::error::MailError;
use crate::imap::session::{
    fetch_with_session, AsyncImapSessionWrapper, TlsCompatibleStream, TlsImapSession,
};
use crate::imap::types::{FetchOutcome, LatestMail};

/// Retrieves the latest message of one mailbox.
///
/// Implementations must be safe to call concurrently for different
/// credentials and must never fail past the returned [`FetchOutcome`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailFetcher: Send + Sync {
    async fn fetch_latest(&self, address: &str, auth_token: &str) -> FetchOutcome;
}

/// Connection parameters for the provider's fixed IMAP endpoint.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    /// Bounds TCP connect, TLS handshake and LOGIN together.
    pub connect_timeout: Duration,
    /// Bounds each command after login.
    pub operation_timeout: Duration,
}

impl From<&ImapSettings> for ImapConfig {
    fn from(settings: &ImapSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            connect_timeout: Duration::from_secs(settings.connect_timeout_seconds),
            operation_timeout: Duration::from_secs(settings.operation_timeout_seconds),
        }
    }
}

/// IMAP-over-TLS implementation of [`MailFetcher`].
///
/// Holds no per-call state: the TLS config is shared read-only and every
/// call opens and releases its own session.
#[derive(Clone)]
pub struct ImapMailClient {
    config: ImapConfig,
    tls: Arc<ClientConfig>,
}

impl std::fmt::Debug for ImapMailClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapMailClient")
            .field("config", &self.config)
            .field("tls", &"<rustls::ClientConfig>")
            .finish()
    }
}

impl ImapMailClient {
    pub fn new(config: ImapConfig) -> Result<Self, MailError> {
        let tls = Arc::new(build_tls_config()?);
        Ok(Self { config, tls })
    }

    /// Connect, log in and read the latest message, surfacing the typed error.
    pub async fn try_fetch_latest(
        &self,
        address: &str,
        auth_token: &str,
    ) -> Result<LatestMail, MailError> {
        let underlying = match timeout(
            self.config.connect_timeout,
            connect_and_login(&self.config, self.tls.clone(), address, auth_token),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(MailError::timeout("connect and login", self.config.connect_timeout))
            }
        };

        let mut session = AsyncImapSessionWrapper::new(underlying);
        fetch_with_session(&mut session, self.config.operation_timeout).await
    }
}

#[async_trait]
impl MailFetcher for ImapMailClient {
    async fn fetch_latest(&self, address: &str, auth_token: &str) -> FetchOutcome {
        info!("Fetching latest mail for {}", address);
        let result = self.try_fetch_latest(address, auth_token).await;
        match &result {
            Ok(mail) => debug!("Latest subject for {}: {}", address, mail.subject),
            Err(e) => warn!("Failed to fetch mail for {}: {}", address, e),
        }
        result.into()
    }
}

// --- Internal Connection Logic ---

fn build_tls_config() -> Result<ClientConfig, MailError> {
    let mut root_cert_store = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()?;
    let (added, ignored) = root_cert_store.add_parsable_certificates(certs);
    debug!("Loaded {} native certs, ignored {}.", added, ignored);
    if root_cert_store.is_empty() {
        warn!("Root certificate store is empty after loading native certs.");
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth())
}

/// Establishes TCP connection and performs the TLS handshake.
async fn setup_tls_stream(
    host: &str,
    port: u16,
    tls: Arc<ClientConfig>,
) -> Result<TokioTlsStreamClient<TokioTcpStream>, MailError> {
    let server_name = PkiServerName::try_from(host.to_string())
        .map_err(|_| MailError::Network(format!("Invalid server name format: {}", host)))?;

    debug!("Attempting TCP connection to {}:{}...", host, port);
    let tcp_stream = TokioTcpStream::connect((host, port)).await?;
    debug!("TCP connected. Performing TLS handshake...");

    let tls_stream = TlsConnector::from(tls).connect(server_name, tcp_stream).await?;
    debug!("TLS handshake successful.");
    Ok(tls_stream)
}

/// Performs IMAP login using the compatible stream.
///
/// A NO/BAD answer to LOGIN is an authentication failure; anything else
/// (I/O, parse) keeps its usual classification.
async fn perform_imap_login(
    compat_stream: TlsCompatibleStream,
    username: &str,
    password: &str,
) -> Result<TlsImapSession, MailError> {
    let client = AsyncImapClient::new(compat_stream);
    debug!("IMAP client created. Attempting login for user '{}'...", username);

    match client.login(username, password).await {
        Ok(session) => {
            debug!("IMAP login successful for user: {}", username);
            Ok(session)
        }
        Err((async_imap::error::Error::No(msg), _client))
        | Err((async_imap::error::Error::Bad(msg), _client)) => Err(MailError::Auth(msg)),
        Err((e, _client)) => Err(MailError::from(e)),
    }
}

async fn connect_and_login(
    config: &ImapConfig,
    tls: Arc<ClientConfig>,
    username: &str,
    password: &str,
) -> Result<TlsImapSession, MailError> {
    let tls_stream = setup_tls_stream(&config.host, config.port, tls).await?;
    perform_imap_login(tls_stream.compat(), username, password).await
}
