//! Embedded relational persistence. Single SQLite file, WAL mode, schema
//! advanced through an ordered list of idempotent migrations gated on
//! `PRAGMA user_version` rather than a migration-framework crate.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::error::{Result, SentinelError};
use crate::models::{
    Account, Action, ClassifierTier, DomainCacheEntry, Feedback, FlagType, GeoCacheEntry,
    GeoRecord, ModelKind, ModelVersion, OverrideFlag, PerformanceMetric, PrimaryTaxonomy,
    ProcessedMessage, ProcessingStatus, Session, SessionMode, SubcategoryPattern,
    SubcategoryPatternKind, TaxonomyV2Category,
};

pub struct Store {
    conn: Connection,
}

struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: r#"
            CREATE TABLE accounts (
                id INTEGER PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                provider_tag TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                tls INTEGER NOT NULL,
                username TEXT NOT NULL,
                credential_handle TEXT NOT NULL,
                target_folders TEXT NOT NULL,
                batch_size_override INTEGER,
                confidence_threshold_override REAL
            );

            CREATE TABLE sessions (
                id INTEGER PRIMARY KEY,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                mode TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                examined INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                preserved INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                errored INTEGER NOT NULL DEFAULT 0,
                categories_json TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE processed_messages (
                id INTEGER PRIMARY KEY,
                message_id TEXT NOT NULL,
                uid INTEGER NOT NULL,
                folder TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_domain TEXT NOT NULL,
                subject TEXT NOT NULL,
                action TEXT NOT NULL,
                reason TEXT NOT NULL,
                category TEXT NOT NULL,
                subcategory TEXT,
                confidence REAL NOT NULL,
                tier INTEGER NOT NULL,
                geo_ip TEXT,
                geo_country_code TEXT,
                geo_country_name TEXT,
                geo_risk_score REAL,
                geo_detection_method TEXT,
                processing_status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                raw_headers TEXT NOT NULL,
                session_id INTEGER NOT NULL REFERENCES sessions(id),
                taxonomy_v2_category TEXT,
                primary_taxonomy TEXT NOT NULL,
                tier3_fallback INTEGER NOT NULL DEFAULT 0,
                UNIQUE(message_id)
            );
            CREATE INDEX idx_processed_messages_message_id ON processed_messages(message_id);
            CREATE INDEX idx_processed_messages_session ON processed_messages(session_id);

            CREATE TABLE override_flags (
                id INTEGER PRIMARY KEY,
                message_id TEXT NOT NULL,
                flag_type TEXT NOT NULL,
                reason TEXT NOT NULL,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                created_at TEXT NOT NULL,
                UNIQUE(message_id, flag_type)
            );
            CREATE INDEX idx_override_flags_message_id ON override_flags(message_id);

            CREATE TABLE domain_cache (
                domain TEXT PRIMARY KEY,
                reputation TEXT NOT NULL,
                country_code TEXT,
                country_name TEXT,
                risk_score REAL NOT NULL,
                registrar TEXT,
                last_analyzed TEXT NOT NULL
            );

            CREATE TABLE geo_cache (
                ip_or_range TEXT PRIMARY KEY,
                country_code TEXT NOT NULL,
                risk_score REAL NOT NULL,
                source TEXT NOT NULL,
                cached_at TEXT NOT NULL
            );

            CREATE TABLE user_feedback (
                id INTEGER PRIMARY KEY,
                processed_message_id INTEGER NOT NULL REFERENCES processed_messages(id),
                original_category TEXT NOT NULL,
                corrected_category TEXT NOT NULL,
                confidence_rating REAL,
                comment TEXT,
                incorporated INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE model_versions (
                id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                artifact_handle TEXT NOT NULL,
                training_set_size INTEGER NOT NULL,
                offline_accuracy REAL NOT NULL,
                created_at TEXT NOT NULL,
                live INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE subcategory_patterns (
                id INTEGER PRIMARY KEY,
                category TEXT NOT NULL,
                subcategory TEXT NOT NULL,
                pattern TEXT NOT NULL,
                weight REAL NOT NULL,
                kind TEXT NOT NULL
            );

            CREATE TABLE performance_metrics (
                id INTEGER PRIMARY KEY,
                session_id INTEGER NOT NULL REFERENCES sessions(id),
                examined_per_sec REAL NOT NULL,
                tier1_avg_ms REAL NOT NULL,
                tier2_avg_ms REAL NOT NULL,
                tier3_avg_ms REAL NOT NULL,
                tier3_share REAL NOT NULL,
                recorded_at TEXT NOT NULL
            );

            -- Disaster-recovery mirror of processed_messages, kept in sync in the
            -- same transaction as every upsert rather than via periodic export.
            CREATE TABLE processed_messages_backup (
                id INTEGER PRIMARY KEY,
                message_id TEXT NOT NULL UNIQUE,
                uid INTEGER NOT NULL,
                folder TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_domain TEXT NOT NULL,
                subject TEXT NOT NULL,
                action TEXT NOT NULL,
                reason TEXT NOT NULL,
                category TEXT NOT NULL,
                subcategory TEXT,
                confidence REAL NOT NULL,
                tier INTEGER NOT NULL,
                geo_ip TEXT,
                geo_country_code TEXT,
                geo_country_name TEXT,
                geo_risk_score REAL,
                geo_detection_method TEXT,
                processing_status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                raw_headers TEXT NOT NULL,
                session_id INTEGER NOT NULL,
                taxonomy_v2_category TEXT,
                primary_taxonomy TEXT NOT NULL,
                tier3_fallback INTEGER NOT NULL DEFAULT 0
            );
        "#,
    },
];

impl Store {
    /// Open (or create) the database file, enable WAL mode, and run any
    /// migrations not yet applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mut store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mut store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&mut self) -> Result<()> {
        let current: i64 = self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let tx = self.conn.transaction()?;
        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            tx.execute_batch(migration.sql)?;
            tx.pragma_update(None, "user_version", migration.version)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_account(&self, account: &Account) -> Result<i64> {
        let folders = serde_json::to_string(&account.target_folders)?;
        self.conn.execute(
            "INSERT INTO accounts (email, provider_tag, host, port, tls, username, credential_handle, target_folders, batch_size_override, confidence_threshold_override)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                account.email,
                account.provider_tag,
                account.host,
                account.port,
                account.tls,
                account.username,
                account.credential_handle,
                folders,
                account.batch_size_override,
                account.confidence_threshold_override,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Register an account the first time it's seen, or return the existing
    /// row's id unchanged. Called once per scheduler tick per configured
    /// account, so it must never duplicate on `email`.
    pub fn upsert_account(&self, account: &Account) -> Result<i64> {
        if let Some(id) = self.find_account_by_email(&account.email)? {
            return Ok(id);
        }
        self.insert_account(account)
    }

    pub fn find_account_by_email(&self, email: &str) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT id FROM accounts WHERE email = ?1", [email], |row| row.get(0))
            .optional()
            .map_err(SentinelError::from)
    }

    pub fn open_session(&self, session: &Session) -> Result<i64> {
        let categories = serde_json::to_string(&session.categories)?;
        self.conn.execute(
            "INSERT INTO sessions (account_id, mode, started_at, categories_json) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![session.account_id, session.mode.as_str(), session.started_at.to_rfc3339(), categories],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn close_session(&self, session: &Session) -> Result<()> {
        let categories = serde_json::to_string(&session.categories)?;
        self.conn.execute(
            "UPDATE sessions SET ended_at = ?1, examined = ?2, deleted = ?3, preserved = ?4, skipped = ?5, errored = ?6, categories_json = ?7 WHERE id = ?8",
            rusqlite::params![
                session.ended_at.map(|d| d.to_rfc3339()),
                session.examined,
                session.deleted,
                session.preserved,
                session.skipped,
                session.errored,
                categories,
                session.id,
            ],
        )?;
        Ok(())
    }

    /// Insert a processed message row inside a single transaction.
    /// Idempotent on `message_id` alone: the same `Message-ID` observed in a
    /// different folder (e.g. after an operator moves it, or a duplicate
    /// delivery lands elsewhere) still maps onto one row rather than letting
    /// each folder reach `processed`/`flagged` independently.
    pub fn upsert_processed_message(&self, msg: &ProcessedMessage) -> Result<i64> {
        // `unchecked_transaction` rather than `Connection::transaction` because this
        // method only borrows `&self`: the processing controller holds the store
        // behind a `tokio::sync::Mutex`, so a nested transaction here is not reachable
        // through that single-writer discipline.
        let tx = self.conn.unchecked_transaction()?;
        let id = upsert_processed_message_tx(&tx, msg)?;
        tx.commit()?;
        Ok(id)
    }

    /// Like `upsert_processed_message`, but for the live session path: bumps
    /// and persists `session`'s row counters, refreshes `domain_cache` for
    /// the message's sender domain, and records a `performance_metrics`
    /// sample, all inside the same transaction as the row write. A crash
    /// between messages loses at most the in-flight one, not the whole
    /// session's counters.
    pub fn commit_processed_message(&self, msg: &ProcessedMessage, session: &Session, tier_elapsed_ms: f64) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;

        let id = upsert_processed_message_tx(&tx, msg)?;

        let categories = serde_json::to_string(&session.categories)?;
        tx.execute(
            "UPDATE sessions SET examined = ?1, deleted = ?2, preserved = ?3, skipped = ?4, errored = ?5, categories_json = ?6 WHERE id = ?7",
            rusqlite::params![
                session.examined,
                session.deleted,
                session.preserved,
                session.skipped,
                session.errored,
                categories,
                session.id,
            ],
        )?;

        tx.execute(
            "INSERT INTO domain_cache (domain, reputation, country_code, country_name, risk_score, registrar, last_analyzed)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)
             ON CONFLICT(domain) DO UPDATE SET
                reputation = excluded.reputation,
                country_code = excluded.country_code,
                risk_score = excluded.risk_score,
                last_analyzed = excluded.last_analyzed",
            rusqlite::params![
                msg.sender_domain,
                msg.category,
                msg.geo.country_code,
                msg.geo.country_name,
                msg.confidence,
                Utc::now().to_rfc3339(),
            ],
        )?;

        let (tier1_ms, tier2_ms, tier3_ms) = match msg.tier {
            ClassifierTier::Tier1 => (tier_elapsed_ms, 0.0, 0.0),
            ClassifierTier::Tier2 => (0.0, tier_elapsed_ms, 0.0),
            ClassifierTier::Tier3 => (0.0, 0.0, tier_elapsed_ms),
        };
        let examined_per_sec = if tier_elapsed_ms > 0.0 { 1000.0 / tier_elapsed_ms } else { 0.0 };
        let tier3_share = if msg.tier == ClassifierTier::Tier3 { 1.0 } else { 0.0 };
        tx.execute(
            "INSERT INTO performance_metrics (session_id, examined_per_sec, tier1_avg_ms, tier2_avg_ms, tier3_avg_ms, tier3_share, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![session.id, examined_per_sec, tier1_ms, tier2_ms, tier3_ms, tier3_share, Utc::now().to_rfc3339()],
        )?;

        tx.commit()?;
        Ok(id)
    }

    /// Count of prior messages from `domain` whose final disposition was
    /// `PRESERVED`. Backs Tier 1's vendor-relationship heuristic: a sender a
    /// mailbox owner has kept mail from repeatedly is unlikely to be spam.
    pub fn count_preserved_by_domain(&self, domain: &str) -> Result<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM processed_messages WHERE sender_domain = ?1 AND action = 'PRESERVED'",
            rusqlite::params![domain],
            |row| row.get(0),
        ).map_err(SentinelError::from)
    }

    pub fn find_by_message_id(&self, message_id: &str) -> Result<Option<ProcessedMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, message_id, uid, folder, sender, sender_domain, subject, action, reason,
                    category, subcategory, confidence, tier, geo_ip, geo_country_code,
                    geo_country_name, geo_risk_score, geo_detection_method, processing_status,
                    retry_count, started_at, completed_at, raw_headers, session_id,
                    taxonomy_v2_category, primary_taxonomy, tier3_fallback
             FROM processed_messages WHERE message_id = ?1 ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(rusqlite::params![message_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_processed_message(row)?))
        } else {
            Ok(None)
        }
    }

    /// Upserts on `(message_id, flag_type)`: re-flagging a message with the
    /// same type replaces the reason/timestamp rather than duplicating the row.
    pub fn insert_flag(&self, flag: &OverrideFlag) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO override_flags (message_id, flag_type, reason, account_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(message_id, flag_type) DO UPDATE SET
                reason = excluded.reason,
                account_id = excluded.account_id,
                created_at = excluded.created_at",
            rusqlite::params![flag.message_id, flag.flag_type.as_str(), flag.reason, flag.account_id, flag.created_at.to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Set a flag and, if a `preview` row already exists for this
    /// `message_id`, move it into `flagged` per the processing-status
    /// lifecycle (`preview -> flagged` via explicit operator action).
    pub fn set_flag(&self, message_id: &str, flag_type: FlagType, reason: &str, account_id: i64) -> Result<()> {
        self.insert_flag(&OverrideFlag {
            id: 0,
            message_id: message_id.to_string(),
            flag_type,
            reason: reason.to_string(),
            account_id,
            created_at: Utc::now(),
        })?;

        if let Some(mut row) = self.find_by_message_id(message_id)? {
            if row.processing_status == ProcessingStatus::Preview {
                row.processing_status = ProcessingStatus::Flagged;
                row.completed_at = Some(Utc::now());
                self.upsert_processed_message(&row)?;
            }
        }
        Ok(())
    }

    /// Explicit operator "unflag": clears the flag and, if the message is
    /// currently `flagged`, returns it to `preview`. The only legal way back
    /// from `flagged`.
    pub fn unflag(&self, message_id: &str, flag_type: FlagType) -> Result<()> {
        self.clear_flag(message_id, flag_type)?;

        if let Some(mut row) = self.find_by_message_id(message_id)? {
            if row.processing_status == ProcessingStatus::Flagged && self.flags_for(message_id)?.is_empty() {
                row.processing_status = ProcessingStatus::Preview;
                row.completed_at = None;
                self.upsert_processed_message(&row)?;
            }
        }
        Ok(())
    }

    /// Remove every flag on a message, regardless of type.
    pub fn clear_flags(&self, message_id: &str) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM override_flags WHERE message_id = ?1", rusqlite::params![message_id])?)
    }

    /// Remove only flags of one type, leaving others (e.g. a RESEARCH note
    /// surviving a PROTECT clear) untouched.
    pub fn clear_flag(&self, message_id: &str, flag_type: FlagType) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM override_flags WHERE message_id = ?1 AND flag_type = ?2",
            rusqlite::params![message_id, flag_type.as_str()],
        )?)
    }

    pub fn flags_for(&self, message_id: &str) -> Result<Vec<OverrideFlag>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, message_id, flag_type, reason, account_id, created_at FROM override_flags WHERE message_id = ?1")?;
        let rows = stmt.query_map(rusqlite::params![message_id], |row| {
            let flag_type_str: String = row.get(2)?;
            let created_at_str: String = row.get(5)?;
            Ok(OverrideFlag {
                id: row.get(0)?,
                message_id: row.get(1)?,
                flag_type: FlagType::from_str(&flag_type_str).unwrap_or(FlagType::Research),
                reason: row.get(3)?,
                account_id: row.get(4)?,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at_str)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(SentinelError::from)?);
        }
        Ok(out)
    }

    /// Sessions for one account (or every account when `account_id` is
    /// `None`), most recent first.
    pub fn list_sessions(&self, account_id: Option<i64>, limit: u32) -> Result<Vec<Session>> {
        let mut stmt = if account_id.is_some() {
            self.conn.prepare(
                "SELECT id, account_id, mode, started_at, ended_at, examined, deleted, preserved, skipped, errored, categories_json
                 FROM sessions WHERE account_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?
        } else {
            self.conn.prepare(
                "SELECT id, account_id, mode, started_at, ended_at, examined, deleted, preserved, skipped, errored, categories_json
                 FROM sessions ORDER BY id DESC LIMIT ?2",
            )?
        };
        let rows = stmt.query_map(rusqlite::params![account_id.unwrap_or(0), limit], row_to_session)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(SentinelError::from)?);
        }
        Ok(out)
    }

    /// Page through the processed messages recorded for one session.
    pub fn get_session_messages(&self, session_id: i64, limit: u32, offset: u32) -> Result<Vec<ProcessedMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, message_id, uid, folder, sender, sender_domain, subject, action, reason,
                    category, subcategory, confidence, tier, geo_ip, geo_country_code,
                    geo_country_name, geo_risk_score, geo_detection_method, processing_status,
                    retry_count, started_at, completed_at, raw_headers, session_id,
                    taxonomy_v2_category, primary_taxonomy, tier3_fallback
             FROM processed_messages WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3",
        )?;
        let mut rows = stmt.query(rusqlite::params![session_id, limit, offset])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_processed_message(row)?);
        }
        Ok(out)
    }

    /// Reporting view: only `processed`/`flagged` rows are visible, so
    /// analytics never counts a row still sitting in `preview`. `range`
    /// bounds `completed_at` inclusively on both ends when present.
    pub fn report_rows(&self, range: Option<(DateTime<Utc>, DateTime<Utc>)>) -> Result<Vec<ProcessedMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, message_id, uid, folder, sender, sender_domain, subject, action, reason,
                    category, subcategory, confidence, tier, geo_ip, geo_country_code,
                    geo_country_name, geo_risk_score, geo_detection_method, processing_status,
                    retry_count, started_at, completed_at, raw_headers, session_id,
                    taxonomy_v2_category, primary_taxonomy, tier3_fallback
             FROM processed_messages
             WHERE processing_status IN ('processed', 'flagged')
               AND (?1 IS NULL OR completed_at >= ?1)
               AND (?2 IS NULL OR completed_at <= ?2)
             ORDER BY id ASC",
        )?;
        let (lo, hi) = match range {
            Some((lo, hi)) => (Some(lo.to_rfc3339()), Some(hi.to_rfc3339())),
            None => (None, None),
        };
        let mut rows = stmt.query(rusqlite::params![lo, hi])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_processed_message(row)?);
        }
        Ok(out)
    }

    pub fn get_domain_cache(&self, domain: &str) -> Result<Option<DomainCacheEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT domain, reputation, country_code, country_name, risk_score, registrar, last_analyzed
             FROM domain_cache WHERE domain = ?1",
        )?;
        let mut rows = stmt.query(rusqlite::params![domain])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_domain_cache(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn upsert_domain_cache(&self, entry: &DomainCacheEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO domain_cache (domain, reputation, country_code, country_name, risk_score, registrar, last_analyzed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(domain) DO UPDATE SET
                reputation = excluded.reputation,
                country_code = excluded.country_code,
                country_name = excluded.country_name,
                risk_score = excluded.risk_score,
                registrar = excluded.registrar,
                last_analyzed = excluded.last_analyzed",
            rusqlite::params![
                entry.domain,
                entry.reputation,
                entry.country_code,
                entry.country_name,
                entry.risk_score,
                entry.registrar,
                entry.last_analyzed.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_geo_cache(&self, ip_or_range: &str) -> Result<Option<GeoCacheEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT ip_or_range, country_code, risk_score, source, cached_at FROM geo_cache WHERE ip_or_range = ?1")?;
        let mut rows = stmt.query(rusqlite::params![ip_or_range])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_geo_cache(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn upsert_geo_cache(&self, entry: &GeoCacheEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO geo_cache (ip_or_range, country_code, risk_score, source, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(ip_or_range) DO UPDATE SET
                country_code = excluded.country_code,
                risk_score = excluded.risk_score,
                source = excluded.source,
                cached_at = excluded.cached_at",
            rusqlite::params![
                entry.ip_or_range,
                entry.country_code,
                entry.risk_score,
                entry.source,
                entry.cached_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_feedback(&self, feedback: &Feedback) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO user_feedback (processed_message_id, original_category, corrected_category, confidence_rating, comment, incorporated, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                feedback.processed_message_id,
                feedback.original_category,
                feedback.corrected_category,
                feedback.confidence_rating,
                feedback.comment,
                feedback.incorporated,
                feedback.created_at.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Feedback rows not yet folded into a retrained model, oldest first.
    pub fn unincorporated_feedback(&self) -> Result<Vec<Feedback>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, processed_message_id, original_category, corrected_category, confidence_rating, comment, incorporated, created_at
             FROM user_feedback WHERE incorporated = 0 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_feedback)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(SentinelError::from)?);
        }
        Ok(out)
    }

    pub fn mark_feedback_incorporated(&self, ids: &[i64]) -> Result<()> {
        for id in ids {
            self.conn.execute("UPDATE user_feedback SET incorporated = 1 WHERE id = ?1", rusqlite::params![id])?;
        }
        Ok(())
    }

    pub fn insert_model_version(&self, model: &ModelVersion) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO model_versions (kind, artifact_handle, training_set_size, offline_accuracy, created_at, live)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            rusqlite::params![
                model.kind.as_str(),
                model.artifact_handle,
                model.training_set_size,
                model.offline_accuracy,
                model.created_at.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Atomically flip the `live` flag: at most one row per `kind` is ever
    /// live. Callers are expected to have already checked the candidate's
    /// offline accuracy against the currently live model.
    pub fn promote_model(&mut self, kind: ModelKind, model_id: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE model_versions SET live = 0 WHERE kind = ?1",
            rusqlite::params![kind.as_str()],
        )?;
        let updated = tx.execute(
            "UPDATE model_versions SET live = 1 WHERE id = ?1 AND kind = ?2",
            rusqlite::params![model_id, kind.as_str()],
        )?;
        if updated == 0 {
            return Err(SentinelError::PersistenceError(format!(
                "model version {} of kind {:?} not found",
                model_id, kind
            )));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn live_model(&self, kind: ModelKind) -> Result<Option<ModelVersion>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, artifact_handle, training_set_size, offline_accuracy, created_at, live
             FROM model_versions WHERE kind = ?1 AND live = 1 LIMIT 1",
        )?;
        let mut rows = stmt.query(rusqlite::params![kind.as_str()])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_model_version(row)?))
        } else {
            Ok(None)
        }
    }

    /// Look up one specific version by id, scoped to `kind` so a promote
    /// command for the wrong model kind fails loudly rather than promoting
    /// an unrelated row that happens to share an id.
    pub fn find_model_version(&self, kind: ModelKind, id: i64) -> Result<Option<ModelVersion>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, artifact_handle, training_set_size, offline_accuracy, created_at, live
             FROM model_versions WHERE kind = ?1 AND id = ?2",
        )?;
        let mut rows = stmt.query(rusqlite::params![kind.as_str(), id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_model_version(row)?))
        } else {
            Ok(None)
        }
    }

    /// Insert the built-in subcategory patterns, skipping any that already
    /// exist (matched on category+subcategory+pattern). Safe to call on
    /// every startup.
    pub fn seed_subcategory_patterns(&self, patterns: &[SubcategoryPattern]) -> Result<()> {
        for p in patterns {
            let exists: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM subcategory_patterns WHERE category = ?1 AND subcategory = ?2 AND pattern = ?3",
                rusqlite::params![p.category, p.subcategory, p.pattern],
                |row| row.get(0),
            )?;
            if exists > 0 {
                continue;
            }
            self.conn.execute(
                "INSERT INTO subcategory_patterns (category, subcategory, pattern, weight, kind) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    p.category,
                    p.subcategory,
                    p.pattern,
                    p.weight,
                    match p.kind {
                        SubcategoryPatternKind::SubjectRegex => "subject_regex",
                        SubcategoryPatternKind::DomainKeyword => "domain_keyword",
                    },
                ],
            )?;
        }
        Ok(())
    }

    pub fn list_subcategory_patterns(&self) -> Result<Vec<SubcategoryPattern>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, category, subcategory, pattern, weight, kind FROM subcategory_patterns")?;
        let rows = stmt.query_map([], |row| {
            let kind_str: String = row.get(5)?;
            Ok(SubcategoryPattern {
                id: row.get(0)?,
                category: row.get(1)?,
                subcategory: row.get(2)?,
                pattern: row.get(3)?,
                weight: row.get(4)?,
                kind: match kind_str.as_str() {
                    "domain_keyword" => SubcategoryPatternKind::DomainKeyword,
                    _ => SubcategoryPatternKind::SubjectRegex,
                },
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(SentinelError::from)?);
        }
        Ok(out)
    }

    pub fn insert_performance_metric(&self, metric: &PerformanceMetric) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO performance_metrics (session_id, examined_per_sec, tier1_avg_ms, tier2_avg_ms, tier3_avg_ms, tier3_share, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                metric.session_id,
                metric.examined_per_sec,
                metric.tier1_avg_ms,
                metric.tier2_avg_ms,
                metric.tier3_avg_ms,
                metric.tier3_share,
                metric.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

/// Shared row-write for `processed_messages` + its backup mirror, usable
/// from any open transaction. `upsert_processed_message` and
/// `commit_processed_message` both wrap this with their own transaction and
/// whatever else needs to land atomically alongside it.
fn upsert_processed_message_tx(tx: &rusqlite::Transaction, msg: &ProcessedMessage) -> Result<i64> {
    tx.execute(
        "INSERT INTO processed_messages (
            message_id, uid, folder, sender, sender_domain, subject, action, reason,
            category, subcategory, confidence, tier,
            geo_ip, geo_country_code, geo_country_name, geo_risk_score, geo_detection_method,
            processing_status, retry_count, started_at, completed_at, raw_headers, session_id,
            taxonomy_v2_category, primary_taxonomy, tier3_fallback
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
            ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26
        )
        ON CONFLICT(message_id) DO UPDATE SET
            uid = excluded.uid,
            folder = excluded.folder,
            action = excluded.action,
            reason = excluded.reason,
            category = excluded.category,
            subcategory = excluded.subcategory,
            confidence = excluded.confidence,
            tier = excluded.tier,
            geo_ip = excluded.geo_ip,
            geo_country_code = excluded.geo_country_code,
            geo_country_name = excluded.geo_country_name,
            geo_risk_score = excluded.geo_risk_score,
            geo_detection_method = excluded.geo_detection_method,
            processing_status = excluded.processing_status,
            retry_count = excluded.retry_count,
            completed_at = excluded.completed_at,
            taxonomy_v2_category = excluded.taxonomy_v2_category,
            primary_taxonomy = excluded.primary_taxonomy,
            tier3_fallback = excluded.tier3_fallback",
        rusqlite::params![
            msg.message_id,
            msg.uid,
            msg.folder,
            msg.sender,
            msg.sender_domain,
            msg.subject,
            msg.action.as_str(),
            msg.reason,
            msg.category,
            msg.subcategory,
            msg.confidence,
            msg.tier.as_u8(),
            msg.geo.ip,
            msg.geo.country_code,
            msg.geo.country_name,
            msg.geo.risk_score,
            msg.geo.detection_method,
            msg.processing_status.as_str(),
            msg.retry_count,
            msg.started_at.to_rfc3339(),
            msg.completed_at.map(|d| d.to_rfc3339()),
            msg.raw_headers,
            msg.session_id,
            msg.taxonomy_v2_category.map(|c| c.as_str()),
            match msg.primary_taxonomy {
                PrimaryTaxonomy::Legacy => "legacy",
                PrimaryTaxonomy::TaxonomyV2 => "taxonomy_v2",
            },
            msg.tier3_fallback,
        ],
    )?;
    let id = tx.last_insert_rowid();

    // Mirror the same row into the backup table, same transaction, same
    // conflict key, so the two tables can never observe different rows.
    tx.execute(
        "INSERT INTO processed_messages_backup (
            message_id, uid, folder, sender, sender_domain, subject, action, reason,
            category, subcategory, confidence, tier,
            geo_ip, geo_country_code, geo_country_name, geo_risk_score, geo_detection_method,
            processing_status, retry_count, started_at, completed_at, raw_headers, session_id,
            taxonomy_v2_category, primary_taxonomy, tier3_fallback
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
            ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26
        )
        ON CONFLICT(message_id) DO UPDATE SET
            uid = excluded.uid,
            folder = excluded.folder,
            action = excluded.action,
            reason = excluded.reason,
            category = excluded.category,
            subcategory = excluded.subcategory,
            confidence = excluded.confidence,
            tier = excluded.tier,
            geo_ip = excluded.geo_ip,
            geo_country_code = excluded.geo_country_code,
            geo_country_name = excluded.geo_country_name,
            geo_risk_score = excluded.geo_risk_score,
            geo_detection_method = excluded.geo_detection_method,
            processing_status = excluded.processing_status,
            retry_count = excluded.retry_count,
            completed_at = excluded.completed_at,
            taxonomy_v2_category = excluded.taxonomy_v2_category,
            primary_taxonomy = excluded.primary_taxonomy,
            tier3_fallback = excluded.tier3_fallback",
        rusqlite::params![
            msg.message_id,
            msg.uid,
            msg.folder,
            msg.sender,
            msg.sender_domain,
            msg.subject,
            msg.action.as_str(),
            msg.reason,
            msg.category,
            msg.subcategory,
            msg.confidence,
            msg.tier.as_u8(),
            msg.geo.ip,
            msg.geo.country_code,
            msg.geo.country_name,
            msg.geo.risk_score,
            msg.geo.detection_method,
            msg.processing_status.as_str(),
            msg.retry_count,
            msg.started_at.to_rfc3339(),
            msg.completed_at.map(|d| d.to_rfc3339()),
            msg.raw_headers,
            msg.session_id,
            msg.taxonomy_v2_category.map(|c| c.as_str()),
            match msg.primary_taxonomy {
                PrimaryTaxonomy::Legacy => "legacy",
                PrimaryTaxonomy::TaxonomyV2 => "taxonomy_v2",
            },
            msg.tier3_fallback,
        ],
    )?;

    Ok(id)
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let mode_str: String = row.get(2)?;
    let started_at_str: String = row.get(3)?;
    let ended_at_str: Option<String> = row.get(4)?;
    let categories_json: String = row.get(10)?;
    Ok(Session {
        id: row.get(0)?,
        account_id: row.get(1)?,
        mode: if mode_str == "process" { SessionMode::Process } else { SessionMode::Preview },
        started_at: chrono::DateTime::parse_from_rfc3339(&started_at_str)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        ended_at: ended_at_str.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)).ok()),
        examined: row.get(5)?,
        deleted: row.get(6)?,
        preserved: row.get(7)?,
        skipped: row.get(8)?,
        errored: row.get(9)?,
        categories: serde_json::from_str(&categories_json).unwrap_or_default(),
    })
}

fn row_to_domain_cache(row: &rusqlite::Row) -> Result<DomainCacheEntry> {
    let last_analyzed_str: String = row.get(6)?;
    Ok(DomainCacheEntry {
        domain: row.get(0)?,
        reputation: row.get(1)?,
        country_code: row.get(2)?,
        country_name: row.get(3)?,
        risk_score: row.get(4)?,
        registrar: row.get(5)?,
        last_analyzed: chrono::DateTime::parse_from_rfc3339(&last_analyzed_str)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_geo_cache(row: &rusqlite::Row) -> Result<GeoCacheEntry> {
    let cached_at_str: String = row.get(4)?;
    Ok(GeoCacheEntry {
        ip_or_range: row.get(0)?,
        country_code: row.get(1)?,
        risk_score: row.get(2)?,
        source: row.get(3)?,
        cached_at: chrono::DateTime::parse_from_rfc3339(&cached_at_str)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_feedback(row: &rusqlite::Row) -> rusqlite::Result<Feedback> {
    let incorporated: i64 = row.get(6)?;
    let created_at_str: String = row.get(7)?;
    Ok(Feedback {
        id: row.get(0)?,
        processed_message_id: row.get(1)?,
        original_category: row.get(2)?,
        corrected_category: row.get(3)?,
        confidence_rating: row.get(4)?,
        comment: row.get(5)?,
        incorporated: incorporated != 0,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_str)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_model_version(row: &rusqlite::Row) -> Result<ModelVersion> {
    let kind_str: String = row.get(1)?;
    let created_at_str: String = row.get(5)?;
    let live: i64 = row.get(6)?;
    Ok(ModelVersion {
        id: row.get(0)?,
        kind: match kind_str.as_str() {
            "random_forest" => ModelKind::RandomForest,
            "keyword" => ModelKind::Keyword,
            "ensemble" => ModelKind::Ensemble,
            "taxonomy_v2" => ModelKind::TaxonomyV2,
            _ => ModelKind::NaiveBayes,
        },
        artifact_handle: row.get(2)?,
        training_set_size: row.get(3)?,
        offline_accuracy: row.get(4)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_str)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        live: live != 0,
    })
}

fn row_to_processed_message(row: &rusqlite::Row) -> Result<ProcessedMessage> {
    let action_str: String = row.get(7)?;
    let tier: u8 = row.get(12)?;
    let status_str: String = row.get(18)?;
    let started_at_str: String = row.get(20)?;
    let completed_at_str: Option<String> = row.get(21)?;
    let taxonomy_v2_str: Option<String> = row.get(24)?;
    let primary_taxonomy_str: String = row.get(25)?;

    Ok(ProcessedMessage {
        id: row.get(0)?,
        message_id: row.get(1)?,
        uid: row.get(2)?,
        folder: row.get(3)?,
        sender: row.get(4)?,
        sender_domain: row.get(5)?,
        subject: row.get(6)?,
        action: Action::from_str(&action_str).unwrap_or(Action::Skipped),
        reason: row.get(8)?,
        category: row.get(9)?,
        subcategory: row.get(10)?,
        confidence: row.get(11)?,
        tier: match tier {
            1 => ClassifierTier::Tier1,
            2 => ClassifierTier::Tier2,
            _ => ClassifierTier::Tier3,
        },
        geo: GeoRecord {
            ip: row.get(13)?,
            country_code: row.get(14)?,
            country_name: row.get(15)?,
            risk_score: row.get(16)?,
            detection_method: row.get(17)?,
        },
        processing_status: ProcessingStatus::from_str(&status_str).unwrap_or(ProcessingStatus::Error),
        retry_count: row.get(19)?,
        started_at: chrono::DateTime::parse_from_rfc3339(&started_at_str)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        completed_at: completed_at_str.and_then(|s| {
            chrono::DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)).ok()
        }),
        raw_headers: row.get(22)?,
        session_id: row.get(23)?,
        taxonomy_v2_category: taxonomy_v2_str.and_then(|s| match s.as_str() {
            "Dangerous" => Some(TaxonomyV2Category::Dangerous),
            "Commercial Spam" => Some(TaxonomyV2Category::CommercialSpam),
            "Scams" => Some(TaxonomyV2Category::Scams),
            "Legitimate Marketing" => Some(TaxonomyV2Category::LegitimateMarketing),
            _ => None,
        }),
        primary_taxonomy: if primary_taxonomy_str == "taxonomy_v2" {
            PrimaryTaxonomy::TaxonomyV2
        } else {
            PrimaryTaxonomy::Legacy
        },
        tier3_fallback: row.get(26)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GeoRecord;

    fn sample_message(session_id: i64) -> ProcessedMessage {
        ProcessedMessage {
            id: 0,
            message_id: "<abc@local>".to_string(),
            uid: 42,
            folder: "INBOX".to_string(),
            sender: "spammer@bad.example".to_string(),
            sender_domain: "bad.example".to_string(),
            subject: "You won!".to_string(),
            action: Action::Deleted,
            reason: "tier1 keyword match".to_string(),
            category: "Scams".to_string(),
            subcategory: None,
            confidence: 0.95,
            tier: ClassifierTier::Tier1,
            geo: GeoRecord::default(),
            processing_status: ProcessingStatus::Processed,
            retry_count: 0,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            raw_headers: "From: spammer@bad.example\r\n".to_string(),
            session_id,
            taxonomy_v2_category: Some(TaxonomyV2Category::Scams),
            primary_taxonomy: PrimaryTaxonomy::Legacy,
            tier3_fallback: false,
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut store = Store::open_in_memory().unwrap();
        store.migrate().unwrap();
        store.migrate().unwrap();
    }

    #[test]
    fn test_upsert_processed_message_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let account = Account {
            id: 0,
            email: "user@example.com".to_string(),
            provider_tag: "generic".to_string(),
            host: "imap.example.com".to_string(),
            port: 993,
            tls: true,
            username: "user@example.com".to_string(),
            credential_handle: "SENTINEL_MAIL_PW".to_string(),
            target_folders: vec!["INBOX".to_string()],
            batch_size_override: None,
            confidence_threshold_override: None,
        };
        let account_id = store.insert_account(&account).unwrap();
        let session = Session::new(account_id, SessionMode::Process);
        let session_id = store.open_session(&session).unwrap();

        let msg = sample_message(session_id);
        store.upsert_processed_message(&msg).unwrap();

        let found = store.find_by_message_id("<abc@local>").unwrap().unwrap();
        assert_eq!(found.action, Action::Deleted);
        assert_eq!(found.category, "Scams");

        let backup_category: String = store
            .conn
            .query_row(
                "SELECT category FROM processed_messages_backup WHERE message_id = ?1",
                ["<abc@local>"],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(backup_category, "Scams");
    }

    #[test]
    fn test_backup_table_mirrors_updates_in_the_same_transaction() {
        let store = Store::open_in_memory().unwrap();
        let account = Account {
            id: 0,
            email: "user@example.com".to_string(),
            provider_tag: "generic".to_string(),
            host: "imap.example.com".to_string(),
            port: 993,
            tls: true,
            username: "user@example.com".to_string(),
            credential_handle: "SENTINEL_MAIL_PW".to_string(),
            target_folders: vec!["INBOX".to_string()],
            batch_size_override: None,
            confidence_threshold_override: None,
        };
        let account_id = store.insert_account(&account).unwrap();
        let session = Session::new(account_id, SessionMode::Process);
        let session_id = store.open_session(&session).unwrap();

        let mut msg = sample_message(session_id);
        store.upsert_processed_message(&msg).unwrap();

        msg.processing_status = ProcessingStatus::Error;
        msg.retry_count = 1;
        store.upsert_processed_message(&msg).unwrap();

        let backup_status: String = store
            .conn
            .query_row(
                "SELECT processing_status FROM processed_messages_backup WHERE message_id = ?1",
                ["<abc@local>"],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(backup_status, "error");

        let backup_rows: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM processed_messages_backup", [], |row| row.get(0))
            .unwrap();
        assert_eq!(backup_rows, 1, "backup table must stay unique on message_id, same as the primary table");
    }

    #[test]
    fn test_upsert_is_idempotent_on_message_and_folder() {
        let store = Store::open_in_memory().unwrap();
        let account = Account {
            id: 0,
            email: "user@example.com".to_string(),
            provider_tag: "generic".to_string(),
            host: "imap.example.com".to_string(),
            port: 993,
            tls: true,
            username: "user@example.com".to_string(),
            credential_handle: "SENTINEL_MAIL_PW".to_string(),
            target_folders: vec!["INBOX".to_string()],
            batch_size_override: None,
            confidence_threshold_override: None,
        };
        let account_id = store.insert_account(&account).unwrap();
        let session = Session::new(account_id, SessionMode::Process);
        let session_id = store.open_session(&session).unwrap();

        let mut msg = sample_message(session_id);
        store.upsert_processed_message(&msg).unwrap();
        msg.confidence = 0.99;
        msg.action = Action::Preserved;
        store.upsert_processed_message(&msg).unwrap();

        let found = store.find_by_message_id("<abc@local>").unwrap().unwrap();
        assert_eq!(found.action, Action::Preserved);
        assert_eq!(found.confidence, 0.99);
    }

    #[test]
    fn test_flag_insert_and_clear() {
        let store = Store::open_in_memory().unwrap();
        let account = Account {
            id: 0,
            email: "user@example.com".to_string(),
            provider_tag: "generic".to_string(),
            host: "imap.example.com".to_string(),
            port: 993,
            tls: true,
            username: "user@example.com".to_string(),
            credential_handle: "SENTINEL_MAIL_PW".to_string(),
            target_folders: vec!["INBOX".to_string()],
            batch_size_override: None,
            confidence_threshold_override: None,
        };
        let account_id = store.insert_account(&account).unwrap();

        let flag = OverrideFlag {
            id: 0,
            message_id: "<abc@local>".to_string(),
            flag_type: FlagType::Protect,
            reason: "operator review".to_string(),
            account_id,
            created_at: Utc::now(),
        };
        store.insert_flag(&flag).unwrap();
        assert_eq!(store.flags_for("<abc@local>").unwrap().len(), 1);

        store.clear_flags("<abc@local>").unwrap();
        assert_eq!(store.flags_for("<abc@local>").unwrap().len(), 0);
    }

    #[test]
    fn test_clear_flag_only_removes_matching_type() {
        let store = Store::open_in_memory().unwrap();
        let account_id = store
            .insert_account(&Account {
                id: 0,
                email: "user@example.com".to_string(),
                provider_tag: "generic".to_string(),
                host: "imap.example.com".to_string(),
                port: 993,
                tls: true,
                username: "user@example.com".to_string(),
                credential_handle: "SENTINEL_MAIL_PW".to_string(),
                target_folders: vec!["INBOX".to_string()],
                batch_size_override: None,
                confidence_threshold_override: None,
            })
            .unwrap();

        store
            .insert_flag(&OverrideFlag {
                id: 0,
                message_id: "<abc@local>".to_string(),
                flag_type: FlagType::Protect,
                reason: "keep".to_string(),
                account_id,
                created_at: Utc::now(),
            })
            .unwrap();
        store
            .insert_flag(&OverrideFlag {
                id: 0,
                message_id: "<abc@local>".to_string(),
                flag_type: FlagType::Research,
                reason: "watch".to_string(),
                account_id,
                created_at: Utc::now(),
            })
            .unwrap();

        store.clear_flag("<abc@local>", FlagType::Protect).unwrap();
        let remaining = store.flags_for("<abc@local>").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].flag_type, FlagType::Research);
    }

    #[test]
    fn test_domain_cache_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let entry = DomainCacheEntry {
            domain: "bad.example".to_string(),
            reputation: "spammy".to_string(),
            country_code: Some("RU".to_string()),
            country_name: Some("Russia".to_string()),
            risk_score: 0.87,
            registrar: Some("shady-registrar".to_string()),
            last_analyzed: Utc::now(),
        };
        store.upsert_domain_cache(&entry).unwrap();
        let found = store.get_domain_cache("bad.example").unwrap().unwrap();
        assert_eq!(found.reputation, "spammy");

        store
            .upsert_domain_cache(&DomainCacheEntry { risk_score: 0.95, ..entry })
            .unwrap();
        let found = store.get_domain_cache("bad.example").unwrap().unwrap();
        assert_eq!(found.risk_score, 0.95);
    }

    #[test]
    fn test_feedback_insert_and_incorporate() {
        let store = Store::open_in_memory().unwrap();
        let account_id = store
            .insert_account(&Account {
                id: 0,
                email: "user@example.com".to_string(),
                provider_tag: "generic".to_string(),
                host: "imap.example.com".to_string(),
                port: 993,
                tls: true,
                username: "user@example.com".to_string(),
                credential_handle: "SENTINEL_MAIL_PW".to_string(),
                target_folders: vec!["INBOX".to_string()],
                batch_size_override: None,
                confidence_threshold_override: None,
            })
            .unwrap();
        let session = Session::new(account_id, SessionMode::Process);
        let session_id = store.open_session(&session).unwrap();
        let msg = sample_message(session_id);
        let msg_id = store.upsert_processed_message(&msg).unwrap();

        let feedback_id = store
            .insert_feedback(&Feedback {
                id: 0,
                processed_message_id: msg_id,
                original_category: "Scams".to_string(),
                corrected_category: "Legitimate Marketing".to_string(),
                confidence_rating: Some(0.4),
                comment: Some("this was a real receipt".to_string()),
                incorporated: false,
                created_at: Utc::now(),
            })
            .unwrap();

        assert_eq!(store.unincorporated_feedback().unwrap().len(), 1);
        store.mark_feedback_incorporated(&[feedback_id]).unwrap();
        assert_eq!(store.unincorporated_feedback().unwrap().len(), 0);
    }

    #[test]
    fn test_model_promotion_is_exclusive_per_kind() {
        let mut store = Store::open_in_memory().unwrap();
        let older = store
            .insert_model_version(&ModelVersion {
                id: 0,
                kind: ModelKind::NaiveBayes,
                artifact_handle: "models/nb-v1.bin".to_string(),
                training_set_size: 1000,
                offline_accuracy: 0.80,
                created_at: Utc::now(),
                live: false,
            })
            .unwrap();
        let newer = store
            .insert_model_version(&ModelVersion {
                id: 0,
                kind: ModelKind::NaiveBayes,
                artifact_handle: "models/nb-v2.bin".to_string(),
                training_set_size: 2000,
                offline_accuracy: 0.88,
                created_at: Utc::now(),
                live: false,
            })
            .unwrap();

        store.promote_model(ModelKind::NaiveBayes, older).unwrap();
        assert_eq!(store.live_model(ModelKind::NaiveBayes).unwrap().unwrap().id, older);

        store.promote_model(ModelKind::NaiveBayes, newer).unwrap();
        let live = store.live_model(ModelKind::NaiveBayes).unwrap().unwrap();
        assert_eq!(live.id, newer);
        assert_eq!(live.offline_accuracy, 0.88);
    }

    #[test]
    fn test_list_sessions_and_paging() {
        let store = Store::open_in_memory().unwrap();
        let account_id = store
            .insert_account(&Account {
                id: 0,
                email: "user@example.com".to_string(),
                provider_tag: "generic".to_string(),
                host: "imap.example.com".to_string(),
                port: 993,
                tls: true,
                username: "user@example.com".to_string(),
                credential_handle: "SENTINEL_MAIL_PW".to_string(),
                target_folders: vec!["INBOX".to_string()],
                batch_size_override: None,
                confidence_threshold_override: None,
            })
            .unwrap();
        let session = Session::new(account_id, SessionMode::Process);
        let session_id = store.open_session(&session).unwrap();

        for uid in 1..=3u32 {
            let mut msg = sample_message(session_id);
            msg.uid = uid;
            msg.message_id = format!("<msg{}@local>", uid);
            store.upsert_processed_message(&msg).unwrap();
        }

        assert_eq!(store.list_sessions(Some(account_id), 10).unwrap().len(), 1);
        let page = store.get_session_messages(session_id, 2, 0).unwrap();
        assert_eq!(page.len(), 2);
        let page2 = store.get_session_messages(session_id, 2, 2).unwrap();
        assert_eq!(page2.len(), 1);
    }

    #[test]
    fn test_set_flag_moves_preview_row_to_flagged_and_unflag_reverts() {
        let store = Store::open_in_memory().unwrap();
        let account_id = store
            .insert_account(&Account {
                id: 0,
                email: "user@example.com".to_string(),
                provider_tag: "generic".to_string(),
                host: "imap.example.com".to_string(),
                port: 993,
                tls: true,
                username: "user@example.com".to_string(),
                credential_handle: "SENTINEL_MAIL_PW".to_string(),
                target_folders: vec!["INBOX".to_string()],
                batch_size_override: None,
                confidence_threshold_override: None,
            })
            .unwrap();
        let session = Session::new(account_id, SessionMode::Preview);
        let session_id = store.open_session(&session).unwrap();

        let mut msg = sample_message(session_id);
        msg.processing_status = ProcessingStatus::Preview;
        store.upsert_processed_message(&msg).unwrap();

        store.set_flag("<abc@local>", FlagType::Research, "worth a second look", account_id).unwrap();
        let flagged = store.find_by_message_id("<abc@local>").unwrap().unwrap();
        assert_eq!(flagged.processing_status, ProcessingStatus::Flagged);

        store.unflag("<abc@local>", FlagType::Research).unwrap();
        let reverted = store.find_by_message_id("<abc@local>").unwrap().unwrap();
        assert_eq!(reverted.processing_status, ProcessingStatus::Preview);
    }

    #[test]
    fn test_subcategory_pattern_seeding_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let patterns = vec![SubcategoryPattern {
            id: 0,
            category: "Commercial Spam".to_string(),
            subcategory: "pharma".to_string(),
            pattern: "viagra|cialis".to_string(),
            weight: 0.9,
            kind: SubcategoryPatternKind::SubjectRegex,
        }];
        store.seed_subcategory_patterns(&patterns).unwrap();
        store.seed_subcategory_patterns(&patterns).unwrap();
        assert_eq!(store.list_subcategory_patterns().unwrap().len(), 1);
    }
}
