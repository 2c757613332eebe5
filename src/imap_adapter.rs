//! IMAP wire adapter: connection, folder selection, batched header fetch,
//! and disposition (delete/preserve) against a real IMAPv4rev1 server.

use async_imap::types::Fetch;
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoffBuilder};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

use crate::config::{AccountConfig, ExpungeStrategy};
use crate::error::{Result, SentinelError};

pub type ImapStream = async_native_tls::TlsStream<Compat<TcpStream>>;
pub type ImapSession = async_imap::Session<ImapStream>;

/// A single raw header blob pulled off the wire, not yet parsed into identity fields.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub raw_headers: Vec<u8>,
    pub flags: Vec<String>,
}

/// Everything the processing controller needs from the wire, abstracted behind
/// a trait so the controller can be exercised against a mock in tests.
#[async_trait]
pub trait ImapAdapter: Send + Sync {
    async fn connect(&mut self) -> Result<()>;
    async fn list_folders(&mut self) -> Result<Vec<String>>;
    /// Selects `folder` and returns its current UIDVALIDITY.
    async fn select(&mut self, folder: &str) -> Result<u32>;
    /// `mark_seen` governs whether the fetch is a plain `BODY[HEADER]` (marks
    /// `\Seen` as a side effect, per the provider profile) or a `BODY.PEEK[HEADER]`
    /// that leaves the message's seen state untouched.
    async fn fetch_batch(
        &mut self,
        folder: &str,
        start_uid: u32,
        batch_size: u32,
        mark_seen: bool,
    ) -> Result<Vec<FetchedMessage>>;
    /// Dispose of `uid`. `PerUidExpunge` issues `UID EXPUNGE`/`EXPUNGE`
    /// immediately after marking `\Deleted`; `BulkExpunge` only marks the
    /// flag and leaves expunging to `close`, batching the round trip.
    async fn delete(&mut self, folder: &str, uid: u32, expunge_strategy: ExpungeStrategy) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Production adapter over `async-imap` + `async-native-tls`, bridged onto
/// tokio's `TcpStream` via `tokio_util::compat`.
pub struct TlsImapAdapter {
    account: AccountConfig,
    session: Option<ImapSession>,
    uidvalidity: std::collections::HashMap<String, u32>,
    has_uidplus: bool,
    /// Folders with at least one message marked `\Deleted` under `BulkExpunge`
    /// that still needs a final `EXPUNGE` before the session closes.
    pending_expunge: std::collections::HashSet<String>,
}

impl TlsImapAdapter {
    pub fn new(account: AccountConfig, password: String) -> Self {
        Self {
            account: AccountConfig { credential_handle: password, ..account },
            session: None,
            uidvalidity: std::collections::HashMap::new(),
            has_uidplus: false,
            pending_expunge: std::collections::HashSet::new(),
        }
    }

    fn session_mut(&mut self) -> Result<&mut ImapSession> {
        self.session
            .as_mut()
            .ok_or_else(|| SentinelError::ProtocolError("not connected".to_string()))
    }

    async fn with_retry<T, F, Fut>(operation_name: &str, max_retries: u32, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(None)
            .build();

        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempts <= max_retries => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    warn!(
                        "{} failed (attempt {}/{}): {}. retrying in {:?}",
                        operation_name,
                        attempts,
                        max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ImapAdapter for TlsImapAdapter {
    async fn connect(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.account.host, self.account.port);

        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| SentinelError::NetworkError(format!("connect to {}: {}", addr, e)))?;
        let tcp_compat = tcp.compat();

        let tls = TlsConnector::new();
        let tls_stream = tls
            .connect(self.account.host.as_str(), tcp_compat)
            .await
            .map_err(|e| SentinelError::NetworkError(format!("TLS handshake failed: {}", e)))?;

        let client = async_imap::Client::new(tls_stream);
        let session = client
            .login(&self.account.username, &self.account.credential_handle)
            .await
            .map_err(|e| SentinelError::AuthFailure(format!("{:?}", e.0)))?;

        let mut session = session;
        if let Ok(caps) = session.capabilities().await {
            self.has_uidplus = caps.has(&async_imap::types::Capability::Atom("UIDPLUS".into()));
        }

        self.session = Some(session);
        debug!(account = %self.account.email, "connected to IMAP server");
        Ok(())
    }

    async fn list_folders(&mut self) -> Result<Vec<String>> {
        let session = self.session_mut()?;
        let mut stream = session
            .list(Some(""), Some("*"))
            .await
            .map_err(|e| SentinelError::ProtocolError(format!("LIST failed: {}", e)))?;

        let mut folders = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(name) => folders.push(name.name().to_string()),
                Err(e) => warn!("malformed LIST response: {}", e),
            }
        }
        Ok(folders)
    }

    async fn select(&mut self, folder: &str) -> Result<u32> {
        let folder_owned = folder.to_string();
        let session = self.session_mut()?;
        let mailbox = session
            .select(&folder_owned)
            .await
            .map_err(|e| SentinelError::ProtocolError(format!("SELECT {} failed: {}", folder_owned, e)))?;

        let new_uidvalidity = mailbox.uid_validity.unwrap_or(0);
        if let Some(&old) = self.uidvalidity.get(&folder_owned) {
            if old != 0 && old != new_uidvalidity {
                return Err(SentinelError::UidValidityChanged {
                    folder: folder_owned,
                    old,
                    new: new_uidvalidity,
                });
            }
        }
        self.uidvalidity.insert(folder_owned, new_uidvalidity);
        Ok(new_uidvalidity)
    }

    async fn fetch_batch(
        &mut self,
        folder: &str,
        start_uid: u32,
        batch_size: u32,
        mark_seen: bool,
    ) -> Result<Vec<FetchedMessage>> {
        self.select(folder).await?;
        let end_uid = start_uid.saturating_add(batch_size.saturating_sub(1));
        let sequence = format!("{}:{}", start_uid, end_uid);
        let item = if mark_seen { "(UID FLAGS BODY[HEADER])" } else { "(UID FLAGS BODY.PEEK[HEADER])" };

        let session = self.session_mut()?;
        let mut stream = session
            .uid_fetch(&sequence, item)
            .await
            .map_err(|e| SentinelError::ProtocolError(format!("FETCH {} failed: {}", sequence, e)))?;

        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            let fetch: Fetch = item.map_err(|e| SentinelError::ProtocolError(format!("fetch item error: {}", e)))?;
            let Some(uid) = fetch.uid else { continue };
            let Some(headers) = fetch.header() else { continue };
            let flags: Vec<String> = fetch.flags().map(|f| format!("{:?}", f)).collect();
            out.push(FetchedMessage {
                uid,
                raw_headers: headers.to_vec(),
                flags,
            });
        }
        Ok(out)
    }

    async fn delete(&mut self, folder: &str, uid: u32, expunge_strategy: ExpungeStrategy) -> Result<()> {
        self.select(folder).await?;
        let has_uidplus = self.has_uidplus;
        let session = self.session_mut()?;

        session
            .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
            .await
            .map_err(|e| SentinelError::ProtocolError(format!("STORE \\Deleted failed: {}", e)))?
            .collect::<Vec<_>>()
            .await;

        if expunge_strategy == ExpungeStrategy::BulkExpunge {
            self.pending_expunge.insert(folder.to_string());
            return Ok(());
        }

        if has_uidplus {
            let cmd = format!("UID EXPUNGE {}", uid);
            if session.run_command_and_check_ok(&cmd).await.is_ok() {
                return Ok(());
            }
            warn!("UID EXPUNGE failed, falling back to EXPUNGE for uid {}", uid);
        }

        session
            .expunge()
            .await
            .map_err(|e| SentinelError::ProtocolError(format!("EXPUNGE failed: {}", e)))?
            .collect::<Vec<_>>()
            .await;

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let pending: Vec<String> = self.pending_expunge.drain().collect();
        if let Some(session) = self.session.as_mut() {
            for folder in pending {
                if session.select(&folder).await.is_ok() {
                    if let Ok(stream) = session.expunge().await {
                        stream.collect::<Vec<_>>().await;
                    }
                }
            }
        }
        if let Some(mut session) = self.session.take() {
            let _ = session.logout().await;
        }
        Ok(())
    }
}

/// Thread-safe wrapper so a single adapter can be shared across the batch
/// scheduler's bounded worker pool.
pub type SharedImapAdapter = Arc<Mutex<dyn ImapAdapter>>;

pub async fn fetch_batch_with_retry(
    adapter: &SharedImapAdapter,
    folder: &str,
    start_uid: u32,
    batch_size: u32,
    mark_seen: bool,
) -> Result<Vec<FetchedMessage>> {
    TlsImapAdapter::with_retry("fetch_batch", 3, || async {
        let mut guard = adapter.lock().await;
        guard.fetch_batch(folder, start_uid, batch_size, mark_seen).await
    })
    .await
}

/// Same retry policy as `fetch_batch_with_retry` (transient errors, up to
/// three attempts, exponential backoff), applied to the destructive
/// disposition call so a single dropped connection mid-delete doesn't fall
/// straight through to an `error` row.
pub async fn delete_with_retry(
    adapter: &SharedImapAdapter,
    folder: &str,
    uid: u32,
    expunge_strategy: ExpungeStrategy,
) -> Result<()> {
    TlsImapAdapter::with_retry("delete", 3, || async {
        let mut guard = adapter.lock().await;
        guard.delete(folder, uid, expunge_strategy).await
    })
    .await
}
