use std::path::Path;

use anyhow::{anyhow, Context, Result};
use contact_kernel_core::{
    assemble_contact, merge_query_values, plan_reconciliation, ContactId, ContactRecord,
    ContactResponse, IdentityQuery, LinkPrecedence, ReconciliationPlan,
};
use rusqlite::{params, params_from_iter, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT,
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  linked_id INTEGER REFERENCES contacts(id),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL)
  )
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, link_precedence, linked_id, created_at, updated_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkViolation {
    pub contact_id: i64,
    pub linked_id: Option<i64>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub link_violations: Vec<LinkViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = 2;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))
    }

    /// Resolve one identify request: match stored contacts on either
    /// identifier, classify the request, apply the re-link/insert mutation if
    /// one is needed, and return the deduplicated aggregate.
    ///
    /// The whole match -> decide -> mutate -> aggregate sequence runs inside a
    /// single immediate transaction, so concurrent requests carrying
    /// overlapping identifiers serialize on the database write lock instead of
    /// racing each other into duplicate primaries.
    ///
    /// # Errors
    /// Returns an error when the database is unavailable, a constraint is
    /// violated, or the stored link state is inconsistent. All of these are
    /// infrastructure faults; a busy/conflict error is retryable.
    pub fn identify(&mut self, query: &IdentityQuery) -> Result<ContactResponse> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start identify transaction")?;

        let matched = find_matches(&tx, query)?;
        let touched = contact_kernel_core::touched_primary_ids(&matched)?;
        let primaries = fetch_contacts(&tx, &touched.iter().copied().collect::<Vec<_>>())?;

        let response = match plan_reconciliation(&matched, &primaries, query)? {
            ReconciliationPlan::CreatePrimary => {
                let id = insert_contact(&tx, query, LinkPrecedence::Primary, None)?;
                let primary = fetch_contact(&tx, id)?;
                assemble_contact(&primary, &[])?
            }
            ReconciliationPlan::AlreadyKnown { canonical } => aggregate(&tx, &canonical)?,
            ReconciliationPlan::Reconcile { canonical, relink, absorbed_primaries } => {
                apply_relink(&tx, canonical.id, &relink, &absorbed_primaries)?;
                // Snapshot before the new secondary exists; its values are
                // folded in, its id is not.
                let mut response = aggregate(&tx, &canonical)?;
                merge_query_values(&mut response, query);
                insert_contact(&tx, query, LinkPrecedence::Secondary, Some(canonical.id))?;
                response
            }
        };

        tx.commit().context("failed to commit identify transaction")?;
        Ok(response)
    }

    /// Load every stored contact row in id order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY id ASC"))?;
        let mut rows = stmt.query([])?;

        let mut contacts = Vec::new();
        while let Some(row) = rows.next()? {
            contacts.push(contact_from_row(row)?);
        }
        Ok(contacts)
    }

    /// Run quick-check, foreign-key-check, link-invariant, and schema probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let link_violations = self.find_link_violations()?;
        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            link_violations,
            schema_status,
        })
    }

    // Secondaries must point at an existing primary; a dangling or chained
    // back-reference is a data-integrity fault, never silently followed.
    fn find_link_violations(&self) -> Result<Vec<LinkViolation>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.linked_id, p.id IS NULL, p.link_precedence
             FROM contacts s
             LEFT JOIN contacts p ON p.id = s.linked_id
             WHERE s.link_precedence = 'secondary'
               AND (p.id IS NULL OR p.link_precedence <> 'primary')
             ORDER BY s.id ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            let contact_id: i64 = row.get(0)?;
            let linked_id: Option<i64> = row.get(1)?;
            let parent_missing: bool = row.get(2)?;
            let reason = if parent_missing {
                "linked primary row is missing".to_string()
            } else {
                "linked record is not a primary".to_string()
            };
            Ok(LinkViolation { contact_id, linked_id, reason })
        })?;

        let mut violations = Vec::new();
        for row in rows {
            violations.push(row?);
        }
        Ok(violations)
    }
}

fn find_matches(conn: &Connection, query: &IdentityQuery) -> Result<Vec<ContactRecord>> {
    let (condition, values): (&str, Vec<String>) = match (query.email(), query.phone_number()) {
        (Some(email), Some(phone)) => {
            ("email = ?1 OR phone_number = ?2", vec![email.to_string(), phone.to_string()])
        }
        (Some(email), None) => ("email = ?1", vec![email.to_string()]),
        (None, Some(phone)) => ("phone_number = ?1", vec![phone.to_string()]),
        (None, None) => {
            return Err(anyhow!("identify query carries no identifiers"));
        }
    };

    let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE {condition} ORDER BY id ASC");
    let mut stmt = conn.prepare(&sql).context("failed to prepare match query")?;
    let mut rows = stmt.query(params_from_iter(values))?;

    let mut contacts = Vec::new();
    while let Some(row) = rows.next()? {
        contacts.push(contact_from_row(row)?);
    }
    Ok(contacts)
}

fn fetch_contact(conn: &Connection, id: ContactId) -> Result<ContactRecord> {
    let mut stmt =
        conn.prepare(&format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"))?;
    let mut rows = stmt.query(params![id.0])?;
    let row = rows
        .next()?
        .ok_or_else(|| anyhow!("contact {id} does not exist"))?;
    contact_from_row(row)
}

fn fetch_contacts(conn: &Connection, ids: &[ContactId]) -> Result<Vec<ContactRecord>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts WHERE id IN ({placeholders}) ORDER BY id ASC"
    );
    let mut stmt = conn.prepare(&sql).context("failed to prepare primary fetch")?;
    let mut rows = stmt.query(params_from_iter(ids.iter().map(|id| id.0)))?;

    let mut contacts = Vec::new();
    while let Some(row) = rows.next()? {
        contacts.push(contact_from_row(row)?);
    }
    Ok(contacts)
}

fn insert_contact(
    conn: &Connection,
    query: &IdentityQuery,
    link_precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
) -> Result<ContactId> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT INTO contacts(email, phone_number, link_precedence, linked_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            query.email(),
            query.phone_number(),
            link_precedence.as_str(),
            linked_id.map(|id| id.0),
            now,
            now,
        ],
    )
    .context("failed to insert contact")?;
    Ok(ContactId(conn.last_insert_rowid()))
}

fn apply_relink(
    conn: &Connection,
    canonical: ContactId,
    relink: &[ContactId],
    absorbed_primaries: &[ContactId],
) -> Result<()> {
    let now = now_rfc3339()?;

    if !relink.is_empty() {
        let placeholders = vec!["?"; relink.len()].join(", ");
        let sql = format!(
            "UPDATE contacts
             SET linked_id = ?, link_precedence = 'secondary', updated_at = ?
             WHERE id IN ({placeholders})"
        );
        let mut values: Vec<rusqlite::types::Value> =
            vec![canonical.0.into(), now.clone().into()];
        values.extend(relink.iter().map(|id| rusqlite::types::Value::from(id.0)));
        conn.execute(&sql, params_from_iter(values))
            .context("failed to re-link matched contacts")?;
    }

    // Re-point secondaries that still reference an absorbed primary so chains
    // stay flattened to depth 1.
    if !absorbed_primaries.is_empty() {
        let placeholders = vec!["?"; absorbed_primaries.len()].join(", ");
        let sql = format!(
            "UPDATE contacts
             SET linked_id = ?, updated_at = ?
             WHERE linked_id IN ({placeholders})"
        );
        let mut values: Vec<rusqlite::types::Value> = vec![canonical.0.into(), now.into()];
        values.extend(absorbed_primaries.iter().map(|id| rusqlite::types::Value::from(id.0)));
        conn.execute(&sql, params_from_iter(values))
            .context("failed to re-point secondaries of absorbed primaries")?;
    }

    Ok(())
}

fn aggregate(conn: &Connection, canonical: &ContactRecord) -> Result<ContactResponse> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts WHERE linked_id = ?1 ORDER BY id ASC"
    ))?;
    let mut rows = stmt.query(params![canonical.id.0])?;

    let mut secondaries = Vec::new();
    while let Some(row) = rows.next()? {
        secondaries.push(contact_from_row(row)?);
    }

    Ok(assemble_contact(canonical, &secondaries)?)
}

fn contact_from_row(row: &rusqlite::Row<'_>) -> Result<ContactRecord> {
    let link_precedence_raw: String = row.get(3)?;
    let link_precedence = LinkPrecedence::parse(&link_precedence_raw)
        .ok_or_else(|| anyhow!("unknown link_precedence: {link_precedence_raw}"))?;

    Ok(ContactRecord {
        id: ContactId(row.get::<_, i64>(0)?),
        email: row.get(1)?,
        phone_number: row.get(2)?,
        link_precedence,
        linked_id: row.get::<_, Option<i64>>(4)?.map(ContactId),
        created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format timestamp as RFC 3339")
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("failed to parse stored timestamp: {raw}"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn unique_temp_db() -> PathBuf {
        let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_nanos(),
            Err(err) => panic!("clock should be >= UNIX_EPOCH: {err}"),
        };
        std::env::temp_dir().join(format!("contactkernel-store-{now}.sqlite3"))
    }

    fn open_migrated() -> (SqliteStore, PathBuf) {
        let path = unique_temp_db();
        let mut store = match SqliteStore::open(&path) {
            Ok(store) => store,
            Err(err) => panic!("store should open: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("store should migrate: {err}");
        }
        (store, path)
    }

    fn query(email: Option<&str>, phone: Option<&str>) -> IdentityQuery {
        match IdentityQuery::new(email, phone) {
            Ok(query) => query,
            Err(err) => panic!("fixture query should be valid: {err}"),
        }
    }

    fn identify(store: &mut SqliteStore, email: Option<&str>, phone: Option<&str>) -> ContactResponse {
        match store.identify(&query(email, phone)) {
            Ok(response) => response,
            Err(err) => panic!("identify should succeed: {err}"),
        }
    }

    fn contacts(store: &SqliteStore) -> Vec<ContactRecord> {
        match store.list_contacts() {
            Ok(contacts) => contacts,
            Err(err) => panic!("list_contacts should succeed: {err}"),
        }
    }

    #[test]
    fn migrate_applies_all_versions_on_fresh_database() {
        let path = unique_temp_db();
        let mut store = match SqliteStore::open(&path) {
            Ok(store) => store,
            Err(err) => panic!("store should open: {err}"),
        };

        let before = match store.schema_status() {
            Ok(status) => status,
            Err(err) => panic!("schema status should load: {err}"),
        };
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        if let Err(err) = store.migrate() {
            panic!("store should migrate: {err}");
        }

        let after = match store.schema_status() {
            Ok(status) => status,
            Err(err) => panic!("schema status should load: {err}"),
        };
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn identify_creates_primary_for_unknown_identity() {
        let (mut store, path) = open_migrated();

        let response = identify(&mut store, Some("doc@hillvalley.edu"), Some("555123"));
        assert_eq!(response.contact.emails, vec!["doc@hillvalley.edu".to_string()]);
        assert_eq!(response.contact.phone_numbers, vec!["555123".to_string()]);
        assert!(response.contact.secondary_contact_ids.is_empty());

        let stored = contacts(&store);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].link_precedence, LinkPrecedence::Primary);
        assert_eq!(stored[0].linked_id, None);
        assert_eq!(stored[0].id, response.contact.primary_contact_id);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn identify_same_pair_twice_creates_no_second_row() {
        let (mut store, path) = open_migrated();

        let first = identify(&mut store, Some("doc@hillvalley.edu"), Some("555123"));
        let second = identify(&mut store, Some("doc@hillvalley.edu"), Some("555123"));

        assert_eq!(first.contact.primary_contact_id, second.contact.primary_contact_id);
        assert_eq!(first, second);
        assert_eq!(contacts(&store).len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn identify_lowercases_email_at_write_time() {
        let (mut store, path) = open_migrated();

        identify(&mut store, Some("Doc@HillValley.EDU"), Some("555123"));
        let stored = contacts(&store);
        assert_eq!(stored[0].email.as_deref(), Some("doc@hillvalley.edu"));

        let repeat = identify(&mut store, Some("doc@hillvalley.edu"), Some("555123"));
        assert_eq!(contacts(&store).len(), 1);
        assert_eq!(repeat.contact.primary_contact_id, stored[0].id);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn partial_match_creates_secondary_whose_id_is_not_echoed() {
        let (mut store, path) = open_migrated();

        let first = identify(&mut store, Some("doc@hillvalley.edu"), Some("555123"));
        let second = identify(&mut store, Some("doc@hillvalley.edu"), Some("555999"));

        assert_eq!(second.contact.primary_contact_id, first.contact.primary_contact_id);
        assert_eq!(
            second.contact.phone_numbers,
            vec!["555123".to_string(), "555999".to_string()]
        );
        // The row created by this very request is durably stored but not
        // echoed back as a secondary id until the next resolve.
        assert!(second.contact.secondary_contact_ids.is_empty());

        let stored = contacts(&store);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].link_precedence, LinkPrecedence::Secondary);
        assert_eq!(stored[1].linked_id, Some(first.contact.primary_contact_id));

        let third = identify(&mut store, Some("doc@hillvalley.edu"), Some("555999"));
        assert_eq!(third.contact.secondary_contact_ids, vec![stored[1].id]);
        assert_eq!(contacts(&store).len(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn merge_keeps_oldest_primary_and_repoints_the_other_group() {
        let (mut store, path) = open_migrated();

        let group_a = identify(&mut store, Some("doc@hillvalley.edu"), Some("555123"));
        let group_b = identify(&mut store, Some("marty@hillvalley.edu"), Some("555999"));
        // Give group B an alias of its own before the merge.
        identify(&mut store, Some("marty@hillvalley.edu"), Some("555777"));

        let merged = identify(&mut store, Some("doc@hillvalley.edu"), Some("555999"));
        assert_eq!(merged.contact.primary_contact_id, group_a.contact.primary_contact_id);
        assert_eq!(
            merged.contact.emails,
            vec!["doc@hillvalley.edu".to_string(), "marty@hillvalley.edu".to_string()]
        );

        let stored = contacts(&store);
        assert_eq!(stored.len(), 4);
        for record in &stored {
            if record.id == group_a.contact.primary_contact_id {
                assert_eq!(record.link_precedence, LinkPrecedence::Primary);
                assert_eq!(record.linked_id, None);
            } else {
                assert_eq!(record.link_precedence, LinkPrecedence::Secondary);
                assert_eq!(record.linked_id, Some(group_a.contact.primary_contact_id));
            }
        }

        // B's former primary id must now appear as an alias.
        let follow_up = identify(&mut store, Some("doc@hillvalley.edu"), Some("555123"));
        assert!(follow_up
            .contact
            .secondary_contact_ids
            .contains(&group_b.contact.primary_contact_id));
        assert_eq!(
            follow_up.contact.phone_numbers,
            vec!["555123".to_string(), "555999".to_string(), "555777".to_string()]
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn consistent_group_resubmission_mutates_nothing() {
        let (mut store, path) = open_migrated();

        identify(&mut store, Some("doc@hillvalley.edu"), Some("555123"));
        identify(&mut store, Some("doc@hillvalley.edu"), Some("555999"));
        let before = contacts(&store);

        // Email from the primary, phone from the secondary: same group.
        let response = identify(&mut store, Some("doc@hillvalley.edu"), Some("555999"));
        assert_eq!(contacts(&store), before);
        assert_eq!(response.contact.secondary_contact_ids, vec![before[1].id]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn phone_only_identify_never_reports_an_email() {
        let (mut store, path) = open_migrated();

        let response = identify(&mut store, None, Some("555123"));
        assert!(response.contact.emails.is_empty());
        assert_eq!(response.contact.phone_numbers, vec!["555123".to_string()]);

        let repeat = identify(&mut store, None, Some("555123"));
        assert_eq!(repeat.contact.primary_contact_id, response.contact.primary_contact_id);
        assert_eq!(contacts(&store).len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn email_only_identify_attaches_to_existing_group() {
        let (mut store, path) = open_migrated();

        let first = identify(&mut store, Some("doc@hillvalley.edu"), Some("555123"));
        let second = identify(&mut store, Some("doc@hillvalley.edu"), None);

        assert_eq!(second.contact.primary_contact_id, first.contact.primary_contact_id);
        assert_eq!(contacts(&store).len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn integrity_check_reports_clean_database() {
        let (mut store, path) = open_migrated();
        identify(&mut store, Some("doc@hillvalley.edu"), Some("555123"));

        let report = match store.integrity_check() {
            Ok(report) => report,
            Err(err) => panic!("integrity check should run: {err}"),
        };
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert!(report.link_violations.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn integrity_check_flags_secondary_chained_to_secondary() {
        let (mut store, path) = open_migrated();
        identify(&mut store, Some("doc@hillvalley.edu"), Some("555123"));
        identify(&mut store, Some("doc@hillvalley.edu"), Some("555999"));

        // Chain the second row's back-reference to another secondary by hand;
        // the schema CHECKs cannot see cross-row shape.
        let update = store.conn.execute(
            "UPDATE contacts SET linked_id = 2 WHERE id = 2",
            [],
        );
        if let Err(err) = update {
            panic!("test corruption should apply: {err}");
        }

        let report = match store.integrity_check() {
            Ok(report) => report,
            Err(err) => panic!("integrity check should run: {err}"),
        };
        assert_eq!(report.link_violations.len(), 1);
        assert_eq!(report.link_violations[0].contact_id, 2);
        assert_eq!(report.link_violations[0].reason, "linked record is not a primary");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn identify_fails_on_chained_secondary_instead_of_guessing() {
        let (mut store, path) = open_migrated();
        identify(&mut store, Some("doc@hillvalley.edu"), Some("555123"));
        identify(&mut store, Some("doc@hillvalley.edu"), Some("555999"));

        let update = store.conn.execute(
            "UPDATE contacts SET linked_id = 2 WHERE id = 2",
            [],
        );
        if let Err(err) = update {
            panic!("test corruption should apply: {err}");
        }

        let result = store.identify(&query(None, Some("555999")));
        assert!(result.is_err());

        let _ = std::fs::remove_file(&path);
    }
}
