//! Embedded relational store for relay state.
//!
//! A single `rusqlite::Connection` guarded by a `Mutex`. Every public method
//! here is one transaction; multi-statement operations (e.g. accept-contact)
//! wrap their statements in an explicit `BEGIN`/`COMMIT` so a crash
//! mid-operation can't leave the contacts table in a half-updated state.

use std::path::Path;
use std::sync::{Arc, Mutex};

use cc_crypto::utils::constant_time_compare;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::errors::RelayError;

const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Active,
    Revoked,
}

impl AgentStatus {
    fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Active => "active",
            AgentStatus::Revoked => "revoked",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "active" => AgentStatus::Active,
            "revoked" => AgentStatus::Revoked,
            _ => AgentStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub name: String,
    pub public_key: String,
    pub owner_email: String,
    pub endpoint: String,
    pub email_verified: bool,
    pub status: AgentStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Pending,
    Active,
}

impl ContactStatus {
    fn as_str(self) -> &'static str {
        match self {
            ContactStatus::Pending => "pending",
            ContactStatus::Active => "active",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContactPair {
    pub agent_a: String,
    pub agent_b: String,
    pub status: ContactStatus,
    pub requested_by: String,
    pub greeting: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContactPair {
    pub fn other(&self, me: &str) -> &str {
        if self.agent_a == me {
            &self.agent_b
        } else {
            &self.agent_a
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContactView {
    pub agent: String,
    pub public_key: String,
    pub endpoint: String,
    pub since: DateTime<Utc>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub key_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailVerification {
    pub agent_name: String,
    pub email: String,
    pub code_hash: String,
    pub attempts: u32,
    pub expires_at: DateTime<Utc>,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Broadcast {
    pub id: String,
    pub kind: String,
    pub payload: String,
    pub sender: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Owner,
    Admin,
    Member,
}

impl GroupRole {
    fn as_str(self) -> &'static str {
        match self {
            GroupRole::Owner => "owner",
            GroupRole::Admin => "admin",
            GroupRole::Member => "member",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "owner" => GroupRole::Owner,
            "admin" => GroupRole::Admin,
            _ => GroupRole::Member,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSettings {
    pub members_can_invite: bool,
    pub members_can_send: bool,
    pub max_members: u32,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            members_can_invite: false,
            members_can_send: true,
            max_members: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub group_id: String,
    pub name: String,
    pub owner: String,
    pub status: String,
    pub settings: GroupSettings,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupMembership {
    pub group_id: String,
    pub agent: String,
    pub role: GroupRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupInvitation {
    pub group_id: String,
    pub invitee: String,
    pub invited_by: String,
    pub greeting: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl Clone for SqliteStore {
    fn clone(&self) -> Self {
        Self { conn: self.conn.clone() }
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let current: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap_or(0);
        if current >= SCHEMA_VERSION {
            return Ok(());
        }
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                name TEXT PRIMARY KEY,
                public_key TEXT NOT NULL,
                owner_email TEXT NOT NULL,
                endpoint TEXT NOT NULL DEFAULT '',
                email_verified INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                last_seen TEXT,
                created_at TEXT NOT NULL,
                approved_by TEXT,
                approved_at TEXT
            );

            CREATE TABLE IF NOT EXISTS contacts (
                agent_a TEXT NOT NULL,
                agent_b TEXT NOT NULL,
                status TEXT NOT NULL,
                requested_by TEXT NOT NULL,
                greeting TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (agent_a, agent_b)
            );

            CREATE TABLE IF NOT EXISTS email_verifications (
                agent_name TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                code_hash TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NOT NULL,
                verified INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS admins (
                agent TEXT PRIMARY KEY,
                admin_public_key TEXT NOT NULL,
                added_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS broadcasts (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                payload TEXT NOT NULL,
                sender TEXT NOT NULL,
                signature TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS groups (
                group_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                settings_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL,
                agent TEXT NOT NULL,
                role TEXT NOT NULL,
                joined_at TEXT NOT NULL,
                PRIMARY KEY (group_id, agent)
            );

            CREATE TABLE IF NOT EXISTS group_invitations (
                group_id TEXT NOT NULL,
                invitee TEXT NOT NULL,
                invited_by TEXT NOT NULL,
                greeting TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (group_id, invitee)
            );

            CREATE TABLE IF NOT EXISTS group_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id TEXT NOT NULL,
                change_type TEXT NOT NULL,
                agent TEXT NOT NULL,
                at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS key_recoveries (
                agent_name TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                new_public_key TEXT NOT NULL,
                code_hash TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                requested_at TEXT NOT NULL,
                verified INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T, RelayError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        f(&conn).map_err(RelayError::from)
    }

    // ---- agents / registry --------------------------------------------

    pub fn create_agent(
        &self,
        name: &str,
        public_key: &str,
        owner_email: &str,
        endpoint: &str,
    ) -> Result<Agent, RelayError> {
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agents (name, public_key, owner_email, endpoint, email_verified, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, 'pending', ?5)",
                params![name, public_key, owner_email, endpoint, now.to_rfc3339()],
            )
        })?;
        Ok(Agent {
            name: name.to_string(),
            public_key: public_key.to_string(),
            owner_email: owner_email.to_string(),
            endpoint: endpoint.to_string(),
            email_verified: true,
            status: AgentStatus::Pending,
            last_seen: None,
            created_at: now,
            approved_by: None,
            approved_at: None,
        })
    }

    pub fn get_agent(&self, name: &str) -> Result<Option<Agent>, RelayError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT name, public_key, owner_email, endpoint, email_verified, status,
                        last_seen, created_at, approved_by, approved_at
                 FROM agents WHERE name = ?1",
                params![name],
                row_to_agent,
            )
            .optional()
        })
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>, RelayError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, public_key, owner_email, endpoint, email_verified, status,
                        last_seen, created_at, approved_by, approved_at
                 FROM agents ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], row_to_agent)?;
            rows.collect()
        })
    }

    pub fn list_pending_agents(&self) -> Result<Vec<Agent>, RelayError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, public_key, owner_email, endpoint, email_verified, status,
                        last_seen, created_at, approved_by, approved_at
                 FROM agents WHERE status = 'pending' ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], row_to_agent)?;
            rows.collect()
        })
    }

    pub fn approve_agent(&self, name: &str, approved_by: &str) -> Result<Agent, RelayError> {
        let now = Utc::now();
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE agents SET status = 'active', approved_by = ?2, approved_at = ?3
                 WHERE name = ?1 AND status = 'pending'",
                params![name, approved_by, now.to_rfc3339()],
            )
        })?;
        if updated == 0 {
            return Err(RelayError::Conflict(format!("{name} is not pending approval")));
        }
        self.get_agent(name)?.ok_or_else(|| RelayError::NotFound(name.to_string()))
    }

    /// Marks `name` revoked (idempotent) and returns whether this call was the
    /// transition (false if already revoked).
    pub fn revoke_agent(&self, name: &str) -> Result<bool, RelayError> {
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE agents SET status = 'revoked' WHERE name = ?1 AND status != 'revoked'",
                params![name],
            )
        })?;
        Ok(updated > 0)
    }

    pub fn update_key(&self, name: &str, new_public_key: &str) -> Result<(), RelayError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE agents SET public_key = ?2 WHERE name = ?1",
                params![name, new_public_key],
            )
        })?;
        Ok(())
    }

    pub fn touch_presence(&self, name: &str, endpoint: &str) -> Result<(), RelayError> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE agents SET last_seen = ?2, endpoint = ?3 WHERE name = ?1",
                params![name, now, endpoint],
            )
        })?;
        Ok(())
    }

    // ---- email verification --------------------------------------------

    pub fn start_email_verification(
        &self,
        agent_name: &str,
        email: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO email_verifications (agent_name, email, code_hash, attempts, expires_at, verified, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4, 0, ?5)
                 ON CONFLICT(agent_name) DO UPDATE SET
                    email = excluded.email, code_hash = excluded.code_hash,
                    attempts = 0, expires_at = excluded.expires_at, verified = 0,
                    created_at = excluded.created_at",
                params![agent_name, email, code_hash, expires_at.to_rfc3339(), now.to_rfc3339()],
            )
        })?;
        Ok(())
    }

    pub fn get_email_verification(&self, agent_name: &str) -> Result<Option<EmailVerification>, RelayError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT agent_name, email, code_hash, attempts, expires_at, verified, created_at
                 FROM email_verifications WHERE agent_name = ?1",
                params![agent_name],
                row_to_verification,
            )
            .optional()
        })
    }

    /// Records a confirm attempt. Returns `true` on success (row marked
    /// verified); increments `attempts` and consumes the row after 3
    /// failures.
    pub fn confirm_email_code(&self, agent_name: &str, code_hash: &str) -> Result<bool, RelayError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let row: Option<(String, i64, String)> = tx
            .query_row(
                "SELECT code_hash, attempts, expires_at FROM email_verifications WHERE agent_name = ?1",
                params![agent_name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((stored_hash, attempts, expires_at)) = row else {
            return Ok(false);
        };
        let expires_at: DateTime<Utc> = expires_at.parse().map_err(|_| rusqlite::Error::InvalidQuery)?;
        if Utc::now() > expires_at {
            tx.execute("DELETE FROM email_verifications WHERE agent_name = ?1", params![agent_name])?;
            tx.commit()?;
            return Ok(false);
        }
        if constant_time_compare(stored_hash.as_bytes(), code_hash.as_bytes()) {
            tx.execute(
                "UPDATE email_verifications SET verified = 1 WHERE agent_name = ?1",
                params![agent_name],
            )?;
            tx.commit()?;
            return Ok(true);
        }
        let attempts = attempts + 1;
        if attempts >= 3 {
            tx.execute("DELETE FROM email_verifications WHERE agent_name = ?1", params![agent_name])?;
        } else {
            tx.execute(
                "UPDATE email_verifications SET attempts = ?2 WHERE agent_name = ?1",
                params![agent_name, attempts],
            )?;
        }
        tx.commit()?;
        Ok(false)
    }

    // ---- key recovery ---------------------------------------

    pub fn start_key_recovery(
        &self,
        agent_name: &str,
        email: &str,
        new_public_key: &str,
        code_hash: &str,
    ) -> Result<(), RelayError> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO key_recoveries (agent_name, email, new_public_key, code_hash, attempts, requested_at, verified)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, 0)
                 ON CONFLICT(agent_name) DO UPDATE SET
                    email = excluded.email, new_public_key = excluded.new_public_key,
                    code_hash = excluded.code_hash, attempts = 0, requested_at = excluded.requested_at, verified = 0",
                params![agent_name, email, new_public_key, code_hash, now],
            )
        })?;
        Ok(())
    }

    /// Marks the recovery row verified once the submitted code matches.
    /// Returns `false` (and consumes the row after 3 failures) without
    /// revealing whether the failure was a bad code or an expired window —
    /// the 1-hour cooling-off check happens separately in
    /// [`Self::complete_key_recovery`].
    pub fn confirm_key_recovery_code(&self, agent_name: &str, code_hash: &str) -> Result<bool, RelayError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let row: Option<(String, i64)> = tx
            .query_row(
                "SELECT code_hash, attempts FROM key_recoveries WHERE agent_name = ?1",
                params![agent_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((stored_hash, attempts)) = row else {
            return Ok(false);
        };
        if constant_time_compare(stored_hash.as_bytes(), code_hash.as_bytes()) {
            tx.execute(
                "UPDATE key_recoveries SET verified = 1 WHERE agent_name = ?1",
                params![agent_name],
            )?;
            tx.commit()?;
            return Ok(true);
        }
        let attempts = attempts + 1;
        if attempts >= 3 {
            tx.execute("DELETE FROM key_recoveries WHERE agent_name = ?1", params![agent_name])?;
        } else {
            tx.execute(
                "UPDATE key_recoveries SET attempts = ?2 WHERE agent_name = ?1",
                params![agent_name, attempts],
            )?;
        }
        tx.commit()?;
        Ok(false)
    }

    /// Completes a verified recovery once the 1-hour cooling-off window has
    /// elapsed, installing `new_public_key` on the agent record.
    pub fn complete_key_recovery(&self, agent_name: &str, cooling_off: chrono::Duration) -> Result<(), RelayError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let row: Option<(String, i64, String)> = tx
            .query_row(
                "SELECT new_public_key, verified, requested_at FROM key_recoveries WHERE agent_name = ?1",
                params![agent_name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((new_public_key, verified, requested_at)) = row else {
            return Err(RelayError::NotFound("no pending key recovery".into()));
        };
        if verified == 0 {
            return Err(RelayError::Validation("recovery code not yet verified".into()));
        }
        let requested_at: DateTime<Utc> = requested_at.parse().map_err(|_| rusqlite::Error::InvalidQuery)?;
        if Utc::now() - requested_at < cooling_off {
            return Err(RelayError::Validation("cooling-off period has not elapsed".into()));
        }
        tx.execute(
            "UPDATE agents SET public_key = ?2 WHERE name = ?1",
            params![agent_name, new_public_key],
        )?;
        tx.execute("DELETE FROM key_recoveries WHERE agent_name = ?1", params![agent_name])?;
        tx.commit()?;
        Ok(())
    }

    // ---- contacts --------------------------------------------------------

    fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
        if a <= b { (a, b) } else { (b, a) }
    }

    pub fn get_contact_pair(&self, a: &str, b: &str) -> Result<Option<ContactPair>, RelayError> {
        let (lo, hi) = Self::ordered_pair(a, b);
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT agent_a, agent_b, status, requested_by, greeting, created_at, updated_at
                 FROM contacts WHERE agent_a = ?1 AND agent_b = ?2",
                params![lo, hi],
                row_to_contact,
            )
            .optional()
        })
    }

    pub fn request_contact(&self, from: &str, to: &str, greeting: Option<&str>) -> Result<(), RelayError> {
        let (lo, hi) = Self::ordered_pair(from, to);
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contacts (agent_a, agent_b, status, requested_by, greeting, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?5)",
                params![lo, hi, from, greeting, now.to_rfc3339()],
            )
        })?;
        Ok(())
    }

    pub fn list_pending_contacts(&self, agent: &str) -> Result<Vec<ContactPair>, RelayError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_a, agent_b, status, requested_by, greeting, created_at, updated_at
                 FROM contacts
                 WHERE status = 'pending' AND (agent_a = ?1 OR agent_b = ?1) AND requested_by != ?1",
            )?;
            let rows = stmt.query_map(params![agent], row_to_contact)?;
            rows.collect()
        })
    }

    pub fn accept_contact(&self, caller: &str, requester: &str) -> Result<(), RelayError> {
        let (lo, hi) = Self::ordered_pair(caller, requester);
        let now = Utc::now().to_rfc3339();
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE contacts SET status = 'active', updated_at = ?3
                 WHERE agent_a = ?1 AND agent_b = ?2 AND status = 'pending' AND requested_by != ?4",
                params![lo, hi, now, caller],
            )
        })?;
        if updated == 0 {
            return Err(RelayError::Validation("no pending request to accept".into()));
        }
        Ok(())
    }

    pub fn deny_contact(&self, caller: &str, requester: &str) -> Result<(), RelayError> {
        let (lo, hi) = Self::ordered_pair(caller, requester);
        let deleted = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM contacts
                 WHERE agent_a = ?1 AND agent_b = ?2 AND status = 'pending' AND requested_by != ?3",
                params![lo, hi, caller],
            )
        })?;
        if deleted == 0 {
            return Err(RelayError::Validation("no pending request to deny".into()));
        }
        Ok(())
    }

    pub fn remove_contact(&self, caller: &str, other: &str) -> Result<(), RelayError> {
        let (lo, hi) = Self::ordered_pair(caller, other);
        let deleted = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM contacts WHERE agent_a = ?1 AND agent_b = ?2 AND status = 'active'",
                params![lo, hi],
            )
        })?;
        if deleted == 0 {
            return Err(RelayError::NotFound("no active contact".into()));
        }
        Ok(())
    }

    /// Joined contact list for `agent`, honoring the presence-staleness
    /// window configured by the caller.
    pub fn list_contacts(&self, agent: &str, presence_stale_after: chrono::Duration) -> Result<Vec<ContactView>, RelayError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_a, agent_b, created_at FROM contacts
                 WHERE status = 'active' AND (agent_a = ?1 OR agent_b = ?1)",
            )?;
            let pairs: Vec<(String, String, String)> = stmt
                .query_map(params![agent], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<_>>()?;
            let mut out = Vec::new();
            for (a, b, since) in pairs {
                let other = if a == agent { b } else { a };
                let agent_row: Option<(String, String, Option<String>)> = conn
                    .query_row(
                        "SELECT public_key, endpoint, last_seen FROM agents WHERE name = ?1",
                        params![other],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;
                if let Some((public_key, endpoint, last_seen)) = agent_row {
                    let last_seen: Option<DateTime<Utc>> =
                        last_seen.and_then(|s| s.parse().ok());
                    let online = last_seen
                        .map(|seen| Utc::now() - seen <= presence_stale_after)
                        .unwrap_or(false);
                    out.push(ContactView {
                        agent: other,
                        public_key,
                        endpoint,
                        since: since.parse().unwrap_or_else(|_| Utc::now()),
                        online,
                        last_seen,
                        key_updated_at: since.parse().unwrap_or_else(|_| Utc::now()),
                    });
                }
            }
            Ok(out)
        })
    }

    // ---- admins / broadcasts --------------------------------------------

    pub fn add_admin(&self, agent: &str, admin_public_key: &str) -> Result<(), RelayError> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO admins (agent, admin_public_key, added_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(agent) DO UPDATE SET admin_public_key = excluded.admin_public_key",
                params![agent, admin_public_key, now],
            )
        })?;
        Ok(())
    }

    pub fn get_admin_key(&self, agent: &str) -> Result<Option<String>, RelayError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT admin_public_key FROM admins WHERE agent = ?1",
                params![agent],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn list_admin_keys(&self) -> Result<Vec<String>, RelayError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT admin_public_key FROM admins")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
    }

    pub fn create_broadcast(
        &self,
        id: &str,
        kind: &str,
        payload: &str,
        sender: &str,
        signature: &str,
    ) -> Result<Broadcast, RelayError> {
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO broadcasts (id, type, payload, sender, signature, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, kind, payload, sender, signature, now.to_rfc3339()],
            )
        })?;
        Ok(Broadcast {
            id: id.to_string(),
            kind: kind.to_string(),
            payload: payload.to_string(),
            sender: sender.to_string(),
            signature: signature.to_string(),
            created_at: now,
        })
    }

    pub fn list_broadcasts(&self) -> Result<Vec<Broadcast>, RelayError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, type, payload, sender, signature, created_at FROM broadcasts ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Broadcast {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    payload: row.get(2)?,
                    sender: row.get(3)?,
                    signature: row.get(4)?,
                    created_at: row.get::<_, String>(5)?.parse().unwrap_or_else(|_| Utc::now()),
                })
            })?;
            rows.collect()
        })
    }

    // ---- groups -----------------------------------------------------------

    pub fn create_group(&self, group_id: &str, name: &str, owner: &str, settings: &GroupSettings) -> Result<Group, RelayError> {
        let now = Utc::now();
        let settings_json = serde_json::to_string(settings).expect("GroupSettings serializes");
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO groups (group_id, name, owner, status, settings_json, created_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5)",
            params![group_id, name, owner, settings_json, now.to_rfc3339()],
        )?;
        tx.execute(
            "INSERT INTO group_members (group_id, agent, role, joined_at) VALUES (?1, ?2, 'owner', ?3)",
            params![group_id, owner, now.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(Group {
            group_id: group_id.to_string(),
            name: name.to_string(),
            owner: owner.to_string(),
            status: "active".to_string(),
            settings: settings.clone(),
            created_at: now,
        })
    }

    pub fn get_group(&self, group_id: &str) -> Result<Option<Group>, RelayError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT group_id, name, owner, status, settings_json, created_at FROM groups WHERE group_id = ?1",
                params![group_id],
                row_to_group,
            )
            .optional()
        })
    }

    pub fn list_groups_for_agent(&self, agent: &str) -> Result<Vec<Group>, RelayError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.group_id, g.name, g.owner, g.status, g.settings_json, g.created_at
                 FROM groups g JOIN group_members m ON g.group_id = m.group_id
                 WHERE m.agent = ?1",
            )?;
            let rows = stmt.query_map(params![agent], row_to_group)?;
            rows.collect()
        })
    }

    pub fn get_membership(&self, group_id: &str, agent: &str) -> Result<Option<GroupMembership>, RelayError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT group_id, agent, role, joined_at FROM group_members WHERE group_id = ?1 AND agent = ?2",
                params![group_id, agent],
                row_to_membership,
            )
            .optional()
        })
    }

    pub fn list_members(&self, group_id: &str) -> Result<Vec<GroupMembership>, RelayError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT group_id, agent, role, joined_at FROM group_members WHERE group_id = ?1",
            )?;
            let rows = stmt.query_map(params![group_id], row_to_membership)?;
            rows.collect()
        })
    }

    pub fn member_count(&self, group_id: &str) -> Result<u32, RelayError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM group_members WHERE group_id = ?1",
                params![group_id],
                |row| row.get(0),
            )
        })
    }

    pub fn invite_to_group(
        &self,
        group_id: &str,
        invitee: &str,
        invited_by: &str,
        greeting: Option<&str>,
    ) -> Result<(), RelayError> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO group_invitations (group_id, invitee, invited_by, greeting, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![group_id, invitee, invited_by, greeting, now],
            )
        })?;
        self.record_change(group_id, "invited", invitee)?;
        Ok(())
    }

    pub fn get_invitation(&self, group_id: &str, invitee: &str) -> Result<Option<GroupInvitation>, RelayError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT group_id, invitee, invited_by, greeting, created_at
                 FROM group_invitations WHERE group_id = ?1 AND invitee = ?2",
                params![group_id, invitee],
                row_to_invitation,
            )
            .optional()
        })
    }

    pub fn list_invitations(&self, invitee: &str) -> Result<Vec<GroupInvitation>, RelayError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT group_id, invitee, invited_by, greeting, created_at
                 FROM group_invitations WHERE invitee = ?1",
            )?;
            let rows = stmt.query_map(params![invitee], row_to_invitation)?;
            rows.collect()
        })
    }

    pub fn accept_invitation(&self, group_id: &str, invitee: &str) -> Result<(), RelayError> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM group_invitations WHERE group_id = ?1 AND invitee = ?2",
            params![group_id, invitee],
        )?;
        if deleted == 0 {
            return Err(RelayError::NotFound("no invitation".into()));
        }
        tx.execute(
            "INSERT INTO group_members (group_id, agent, role, joined_at) VALUES (?1, ?2, 'member', ?3)",
            params![group_id, invitee, now.clone()],
        )?;
        tx.execute(
            "INSERT INTO group_changes (group_id, change_type, agent, at) VALUES (?1, 'joined', ?2, ?3)",
            params![group_id, invitee, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn decline_invitation(&self, group_id: &str, invitee: &str) -> Result<(), RelayError> {
        let deleted = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM group_invitations WHERE group_id = ?1 AND invitee = ?2",
                params![group_id, invitee],
            )
        })?;
        if deleted == 0 {
            return Err(RelayError::NotFound("no invitation".into()));
        }
        Ok(())
    }

    pub fn remove_member(&self, group_id: &str, agent: &str) -> Result<(), RelayError> {
        let deleted = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND agent = ?2",
                params![group_id, agent],
            )
        })?;
        if deleted == 0 {
            return Err(RelayError::NotFound("not a member".into()));
        }
        self.record_change(group_id, "removed", agent)?;
        Ok(())
    }

    pub fn transfer_ownership(&self, group_id: &str, from: &str, to: &str) -> Result<(), RelayError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let target_is_member: bool = tx
            .query_row(
                "SELECT 1 FROM group_members WHERE group_id = ?1 AND agent = ?2",
                params![group_id, to],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !target_is_member {
            return Err(RelayError::Validation("new owner must already be a member".into()));
        }
        tx.execute("UPDATE groups SET owner = ?2 WHERE group_id = ?1", params![group_id, to])?;
        tx.execute(
            "UPDATE group_members SET role = 'owner' WHERE group_id = ?1 AND agent = ?2",
            params![group_id, to],
        )?;
        tx.execute(
            "UPDATE group_members SET role = 'member' WHERE group_id = ?1 AND agent = ?2",
            params![group_id, from],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn dissolve_group(&self, group_id: &str) -> Result<(), RelayError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM group_members WHERE group_id = ?1", params![group_id])?;
        tx.execute("DELETE FROM group_invitations WHERE group_id = ?1", params![group_id])?;
        tx.execute("DELETE FROM groups WHERE group_id = ?1", params![group_id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_changes_since(&self, group_id: &str, since: DateTime<Utc>) -> Result<Vec<(String, String, DateTime<Utc>)>, RelayError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT change_type, agent, at FROM group_changes WHERE group_id = ?1 AND at > ?2 ORDER BY at",
            )?;
            let rows = stmt.query_map(params![group_id, since.to_rfc3339()], |row| {
                let at: String = row.get(2)?;
                Ok((row.get(0)?, row.get(1)?, at.parse().unwrap_or_else(|_| Utc::now())))
            })?;
            rows.collect()
        })
    }

    fn record_change(&self, group_id: &str, change_type: &str, agent: &str) -> Result<(), RelayError> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO group_changes (group_id, change_type, agent, at) VALUES (?1, ?2, ?3, ?4)",
                params![group_id, change_type, agent, now],
            )
        })?;
        Ok(())
    }
}

fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<Agent> {
    let last_seen: Option<String> = row.get(6)?;
    let approved_at: Option<String> = row.get(9)?;
    Ok(Agent {
        name: row.get(0)?,
        public_key: row.get(1)?,
        owner_email: row.get(2)?,
        endpoint: row.get(3)?,
        email_verified: row.get::<_, i64>(4)? != 0,
        status: AgentStatus::parse(&row.get::<_, String>(5)?),
        last_seen: last_seen.and_then(|s| s.parse().ok()),
        created_at: row.get::<_, String>(7)?.parse().unwrap_or_else(|_| Utc::now()),
        approved_by: row.get(8)?,
        approved_at: approved_at.and_then(|s| s.parse().ok()),
    })
}

fn row_to_contact(row: &rusqlite::Row) -> rusqlite::Result<ContactPair> {
    Ok(ContactPair {
        agent_a: row.get(0)?,
        agent_b: row.get(1)?,
        status: if row.get::<_, String>(2)? == "active" {
            ContactStatus::Active
        } else {
            ContactStatus::Pending
        },
        requested_by: row.get(3)?,
        greeting: row.get(4)?,
        created_at: row.get::<_, String>(5)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_verification(row: &rusqlite::Row) -> rusqlite::Result<EmailVerification> {
    Ok(EmailVerification {
        agent_name: row.get(0)?,
        email: row.get(1)?,
        code_hash: row.get(2)?,
        attempts: row.get::<_, i64>(3)? as u32,
        expires_at: row.get::<_, String>(4)?.parse().unwrap_or_else(|_| Utc::now()),
        verified: row.get::<_, i64>(5)? != 0,
        created_at: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_group(row: &rusqlite::Row) -> rusqlite::Result<Group> {
    let settings_json: String = row.get(4)?;
    Ok(Group {
        group_id: row.get(0)?,
        name: row.get(1)?,
        owner: row.get(2)?,
        status: row.get(3)?,
        settings: serde_json::from_str(&settings_json).unwrap_or_default(),
        created_at: row.get::<_, String>(5)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_membership(row: &rusqlite::Row) -> rusqlite::Result<GroupMembership> {
    Ok(GroupMembership {
        group_id: row.get(0)?,
        agent: row.get(1)?,
        role: GroupRole::parse(&row.get::<_, String>(2)?),
        joined_at: row.get::<_, String>(3)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_invitation(row: &rusqlite::Row) -> rusqlite::Result<GroupInvitation> {
    Ok(GroupInvitation {
        group_id: row.get(0)?,
        invitee: row.get(1)?,
        invited_by: row.get(2)?,
        greeting: row.get(3)?,
        created_at: row.get::<_, String>(4)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_agent(store: &SqliteStore, name: &str) {
        store.create_agent(name, "pk", "a@example.com", "https://x.example").unwrap();
        store.approve_agent(name, "admin").unwrap();
    }

    #[test]
    fn contact_pair_orders_keys_lexicographically() {
        let store = SqliteStore::open_in_memory().unwrap();
        active_agent(&store, "bob");
        active_agent(&store, "alice");
        store.request_contact("bob", "alice", None).unwrap();
        let pair = store.get_contact_pair("alice", "bob").unwrap().unwrap();
        assert_eq!(pair.agent_a, "alice");
        assert_eq!(pair.agent_b, "bob");
    }

    #[test]
    fn only_non_requester_can_accept() {
        let store = SqliteStore::open_in_memory().unwrap();
        active_agent(&store, "alice");
        active_agent(&store, "bob");
        store.request_contact("alice", "bob", Some("hi")).unwrap();
        assert!(store.accept_contact("alice", "bob").is_err());
        store.accept_contact("bob", "alice").unwrap();
        let pair = store.get_contact_pair("alice", "bob").unwrap().unwrap();
        assert_eq!(pair.status, ContactStatus::Active);
    }

    #[test]
    fn deny_deletes_row_allowing_re_request() {
        let store = SqliteStore::open_in_memory().unwrap();
        active_agent(&store, "alice");
        active_agent(&store, "bob");
        store.request_contact("alice", "bob", None).unwrap();
        store.deny_contact("bob", "alice").unwrap();
        assert!(store.get_contact_pair("alice", "bob").unwrap().is_none());
        store.request_contact("alice", "bob", None).unwrap();
        assert!(store.get_contact_pair("alice", "bob").unwrap().is_some());
    }

    #[test]
    fn remove_deletes_active_pair() {
        let store = SqliteStore::open_in_memory().unwrap();
        active_agent(&store, "alice");
        active_agent(&store, "bob");
        store.request_contact("alice", "bob", None).unwrap();
        store.accept_contact("bob", "alice").unwrap();
        store.remove_contact("alice", "bob").unwrap();
        assert!(store.get_contact_pair("alice", "bob").unwrap().is_none());
    }

    #[test]
    fn revoke_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        active_agent(&store, "rogue");
        assert!(store.revoke_agent("rogue").unwrap());
        assert!(!store.revoke_agent("rogue").unwrap());
        assert_eq!(store.get_agent("rogue").unwrap().unwrap().status, AgentStatus::Revoked);
    }

    #[test]
    fn email_code_expires_after_ttl() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .start_email_verification("alice", "a@example.com", "hash", Utc::now() - chrono::Duration::seconds(1))
            .unwrap();
        assert!(!store.confirm_email_code("alice", "hash").unwrap());
    }

    #[test]
    fn email_code_consumed_after_three_failed_attempts() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .start_email_verification("alice", "a@example.com", "correct", Utc::now() + chrono::Duration::minutes(10))
            .unwrap();
        for _ in 0..3 {
            assert!(!store.confirm_email_code("alice", "wrong").unwrap());
        }
        assert!(store.get_email_verification("alice").unwrap().is_none());
    }

    #[test]
    fn group_create_seeds_owner_membership() {
        let store = SqliteStore::open_in_memory().unwrap();
        active_agent(&store, "alice");
        store.create_group("g1", "team", "alice", &GroupSettings::default()).unwrap();
        let members = store.list_members("g1").unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role, GroupRole::Owner);
    }
}
