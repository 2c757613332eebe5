//! Fixtures shared by the integration tests: a fake `ImapAdapter` that never
//! touches a socket, plus the account/provider-profile shapes the controller
//! needs to run a session against it.

use async_trait::async_trait;
use sentinel_mail::config::{AccountConfig, ExpungeStrategy, FolderAlias, ProviderProfile};
use sentinel_mail::error::{Result, SentinelError};
use sentinel_mail::imap_adapter::{FetchedMessage, ImapAdapter};

pub struct FakeAdapter {
    pub messages: Vec<FetchedMessage>,
    pub deleted_uids: Vec<u32>,
    /// When set, the next `fetch_batch` call with `start_uid == 1` returns a
    /// `UidValidityChanged` error instead of `messages`, simulating a folder
    /// whose UIDVALIDITY rolled over mid-session.
    pub uidvalidity_change_pending: bool,
}

impl FakeAdapter {
    pub fn with_messages(messages: Vec<FetchedMessage>) -> Self {
        Self { messages, deleted_uids: Vec::new(), uidvalidity_change_pending: false }
    }

    pub fn with_uidvalidity_change_then_messages(messages: Vec<FetchedMessage>) -> Self {
        Self { messages, deleted_uids: Vec::new(), uidvalidity_change_pending: true }
    }
}

#[async_trait]
impl ImapAdapter for FakeAdapter {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn list_folders(&mut self) -> Result<Vec<String>> {
        Ok(vec!["INBOX".to_string()])
    }

    async fn select(&mut self, _folder: &str) -> Result<u32> {
        Ok(1)
    }

    async fn fetch_batch(
        &mut self,
        folder: &str,
        start_uid: u32,
        _batch_size: u32,
        _mark_seen: bool,
    ) -> Result<Vec<FetchedMessage>> {
        if start_uid == 1 && self.uidvalidity_change_pending {
            self.uidvalidity_change_pending = false;
            return Err(SentinelError::UidValidityChanged {
                folder: folder.to_string(),
                old: 100,
                new: 200,
            });
        }
        if start_uid > 1 {
            return Ok(vec![]);
        }
        Ok(std::mem::take(&mut self.messages))
    }

    async fn delete(&mut self, _folder: &str, uid: u32, _expunge_strategy: ExpungeStrategy) -> Result<()> {
        self.deleted_uids.push(uid);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn test_account() -> AccountConfig {
    AccountConfig {
        email: "user@example.com".to_string(),
        provider_tag: "generic".to_string(),
        host: "imap.example.com".to_string(),
        port: 993,
        tls: true,
        username: "user@example.com".to_string(),
        credential_handle: "SENTINEL_MAIL_TEST_PW".to_string(),
        target_folders: vec!["INBOX".to_string()],
        batch_size_override: None,
        confidence_threshold_override: None,
        trusted_domains: Vec::new(),
    }
}

pub fn test_profile() -> ProviderProfile {
    ProviderProfile {
        tag: "generic".to_string(),
        folder_aliases: vec![FolderAlias { canonical: "INBOX".to_string(), provider_name: "INBOX".to_string() }],
        batch_size: 50,
        expunge_strategy: ExpungeStrategy::PerUidExpunge,
        mark_seen: true,
        default_confidence_threshold: 0.5,
    }
}

/// A spam-shaped header blob: a gibberish domain plus a prize-scam subject,
/// enough to clear tier1's instant-rule threshold on its own.
pub fn spam_headers(uid_seed: &str) -> Vec<u8> {
    format!(
        "From: prince-{uid_seed}@zxqvbnmkpl.tk\r\nSubject: YOU HAVE WON {uid_seed}, claim your prize now\r\nDate: Mon, 24 Nov 2025 10:30:00 +0000\r\nMessage-ID: <{uid_seed}@zxqvbnmkpl.tk>\r\n\r\n"
    )
    .into_bytes()
}

/// A header blob from an allow-listed vendor domain, unambiguously legitimate.
pub fn legitimate_headers(uid_seed: &str) -> Vec<u8> {
    format!(
        "From: updates@github.com\r\nSubject: Weekly digest {uid_seed}\r\nDate: Mon, 24 Nov 2025 10:30:00 +0000\r\nMessage-ID: <{uid_seed}@github.com>\r\n\r\n"
    )
    .into_bytes()
}
