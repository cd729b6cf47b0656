use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::ProxyError;

/// SQLITE_CONSTRAINT_UNIQUE
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;
/// SQLITE_CONSTRAINT_PRIMARYKEY
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;

const MAX_PAYMENT_PAGE: u32 = 500;

/// Read-only connections opened next to the writer for a file database.
const READER_CONNECTIONS: usize = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A priced tool exposed by a provider.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    pub price_minor_units: i64,
}

/// Registered upstream tool server and its price list.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: String,
    pub upstream_url: String,
    pub payout_address: String,
    pub created_at: i64,
    pub tools: Vec<Tool>,
}

impl Provider {
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Failed => "FAILED",
        }
    }

    fn from_db(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(PaymentStatus::Success),
            "FAILED" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

/// Audit entry for one settlement attempt, before it is stored.
#[derive(Debug, Clone)]
pub struct PaymentEntry {
    pub provider_id: String,
    pub tool_name: String,
    pub from_address: String,
    pub to_address: String,
    pub amount_minor_units: i64,
    pub amount_decimal: String,
    pub currency: String,
    pub ticket_id: Option<String>,
    pub status: PaymentStatus,
}

/// Stored audit row
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub provider_id: String,
    pub tool_name: String,
    pub from_address: String,
    pub to_address: String,
    pub amount_minor_units: i64,
    pub amount_decimal: String,
    pub currency: String,
    pub ticket_id: Option<String>,
    pub status: PaymentStatus,
    /// Unix milliseconds
    pub created_at: i64,
}

/// Earnings aggregate for one provider, computed from the payments table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Earnings {
    pub provider_id: String,
    pub payout_address: String,
    pub success_count: i64,
    pub failed_count: i64,
    /// Sum of SUCCESS payments only
    pub revenue_minor_units: i64,
    pub last_payment_at: Option<i64>,
}

const EARNINGS_SELECT: &str = r#"
    SELECT p.id, p.payout_address,
        COALESCE(SUM(CASE WHEN pay.status = 'SUCCESS' THEN 1 ELSE 0 END), 0),
        COALESCE(SUM(CASE WHEN pay.status = 'FAILED' THEN 1 ELSE 0 END), 0),
        COALESCE(SUM(CASE WHEN pay.status = 'SUCCESS' THEN pay.amount_minor ELSE 0 END), 0),
        MAX(CASE WHEN pay.status = 'SUCCESS' THEN pay.created_at END)
    FROM providers p
    LEFT JOIN payments pay ON pay.provider_id = p.id
"#;

/// SQLite-backed registry store and payment audit log.
///
/// Every write goes through one connection. A file database also gets a few
/// read-only connections; in WAL mode those read the last committed state
/// while the writer is inside a registration or audit insert, so lookups
/// never wait on it. An in-memory database exists only inside the connection
/// that created it, so there reads share the writer.
#[derive(Clone)]
pub struct Database {
    writer: Arc<Mutex<Connection>>,
    readers: Arc<Vec<Mutex<Connection>>>,
    next_reader: Arc<AtomicUsize>,
}

impl Database {
    pub fn new(path: &str) -> Result<Self, ProxyError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mut db = Self {
            writer: Arc::new(Mutex::new(conn)),
            readers: Arc::new(Vec::new()),
            next_reader: Arc::new(AtomicUsize::new(0)),
        };
        db.init_schema()?;

        // Readers open after the writer has switched the file to WAL
        if !is_in_memory(path) {
            let readers = (0..READER_CONNECTIONS)
                .map(|_| open_reader(path).map(Mutex::new))
                .collect::<Result<Vec<_>, _>>()?;
            db.readers = Arc::new(readers);
        }
        Ok(db)
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>, ProxyError> {
        self.writer.lock().map_err(|_| lock_poisoned())
    }

    /// First idle read connection, else wait on one in turn.
    fn reader(&self) -> Result<MutexGuard<'_, Connection>, ProxyError> {
        if self.readers.is_empty() {
            return self.writer();
        }
        for conn in self.readers.iter() {
            if let Ok(guard) = conn.try_lock() {
                return Ok(guard);
            }
        }
        let slot = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[slot].lock().map_err(|_| lock_poisoned())
    }

    fn init_schema(&self) -> Result<(), ProxyError> {
        let conn = self.writer()?;

        // With WAL, the read connections see the last commit while the
        // writer holds a transaction open
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY NOT NULL,
                upstream_url TEXT NOT NULL,
                payout_address TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tools (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_id TEXT NOT NULL REFERENCES providers(id),
                name TEXT NOT NULL CHECK (length(name) > 0),
                price_minor_units INTEGER NOT NULL CHECK (price_minor_units >= 0),
                UNIQUE (provider_id, name)
            );

            CREATE TABLE IF NOT EXISTS payments (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                provider_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                amount_minor INTEGER NOT NULL,
                amount_decimal TEXT NOT NULL,
                currency TEXT NOT NULL,
                ticket_id TEXT,
                status TEXT NOT NULL CHECK (status IN ('SUCCESS', 'FAILED')),
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_payments_provider ON payments(provider_id, status);
            "#,
        )?;

        Ok(())
    }

    /// Insert a provider and all of its tools as one transaction.
    ///
    /// A provider id that already exists fails with `DuplicateProvider`. A tool
    /// row the schema refuses fails with `InvalidPayload`. Either way nothing
    /// is persisted.
    pub fn register_provider(
        &self,
        id: &str,
        upstream_url: &str,
        payout_address: &str,
        tools: &[Tool],
    ) -> Result<Provider, ProxyError> {
        let mut conn = self.writer()?;
        let now = chrono::Utc::now().timestamp_millis();

        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO providers (id, upstream_url, payout_address, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, upstream_url, payout_address, now],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                ProxyError::DuplicateProvider(id.to_string())
            } else {
                ProxyError::Database(e)
            }
        })?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO tools (provider_id, name, price_minor_units) VALUES (?1, ?2, ?3)",
            )?;
            for tool in tools {
                stmt.execute(params![id, tool.name, tool.price_minor_units])
                    .map_err(|e| {
                        if is_constraint_violation(&e) {
                            ProxyError::InvalidPayload(format!("tool '{}' rejected", tool.name))
                        } else {
                            ProxyError::Database(e)
                        }
                    })?;
            }
        }

        tx.commit()?;

        Ok(Provider {
            id: id.to_string(),
            upstream_url: upstream_url.to_string(),
            payout_address: payout_address.to_string(),
            created_at: now,
            tools: tools.to_vec(),
        })
    }

    /// Get a provider with its tools
    pub fn get_provider(&self, id: &str) -> Result<Option<Provider>, ProxyError> {
        let conn = self.reader()?;

        let provider = conn
            .query_row(
                "SELECT id, upstream_url, payout_address, created_at FROM providers WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Provider {
                        id: row.get(0)?,
                        upstream_url: row.get(1)?,
                        payout_address: row.get(2)?,
                        created_at: row.get(3)?,
                        tools: Vec::new(),
                    })
                },
            )
            .optional()?;

        let Some(mut provider) = provider else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT name, price_minor_units FROM tools WHERE provider_id = ?1 ORDER BY id",
        )?;
        provider.tools = stmt
            .query_map(params![id], |row| {
                Ok(Tool {
                    name: row.get(0)?,
                    price_minor_units: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(provider))
    }

    /// Append one audit row. Rows are never updated or deleted.
    pub fn record_payment(&self, entry: &PaymentEntry) -> Result<Payment, ProxyError> {
        let conn = self.writer()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();

        conn.execute(
            r#"
            INSERT INTO payments (id, provider_id, tool_name, from_address, to_address,
                amount_minor, amount_decimal, currency, ticket_id, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                id,
                entry.provider_id,
                entry.tool_name,
                entry.from_address,
                entry.to_address,
                entry.amount_minor_units,
                entry.amount_decimal,
                entry.currency,
                entry.ticket_id,
                entry.status.as_str(),
                now
            ],
        )?;

        Ok(Payment {
            id,
            provider_id: entry.provider_id.clone(),
            tool_name: entry.tool_name.clone(),
            from_address: entry.from_address.clone(),
            to_address: entry.to_address.clone(),
            amount_minor_units: entry.amount_minor_units,
            amount_decimal: entry.amount_decimal.clone(),
            currency: entry.currency.clone(),
            ticket_id: entry.ticket_id.clone(),
            status: entry.status,
            created_at: now,
        })
    }

    /// Most recent payments first. `limit` is clamped to 1..=500.
    pub fn list_recent_payments(&self, limit: u32) -> Result<Vec<Payment>, ProxyError> {
        let limit = limit.clamp(1, MAX_PAYMENT_PAGE);
        let conn = self.reader()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, provider_id, tool_name, from_address, to_address, amount_minor,
                amount_decimal, currency, ticket_id, status, created_at
            FROM payments
            ORDER BY seq DESC
            LIMIT ?1
            "#,
        )?;

        let payments = stmt
            .query_map(params![limit], |row| {
                let status: String = row.get(9)?;
                Ok(Payment {
                    id: row.get(0)?,
                    provider_id: row.get(1)?,
                    tool_name: row.get(2)?,
                    from_address: row.get(3)?,
                    to_address: row.get(4)?,
                    amount_minor_units: row.get(5)?,
                    amount_decimal: row.get(6)?,
                    currency: row.get(7)?,
                    ticket_id: row.get(8)?,
                    status: PaymentStatus::from_db(&status).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            9,
                            rusqlite::types::Type::Text,
                            format!("unknown payment status: {status}").into(),
                        )
                    })?,
                    created_at: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(payments)
    }

    /// Earnings for every provider, highest revenue first
    pub fn list_earnings(&self) -> Result<Vec<Earnings>, ProxyError> {
        let conn = self.reader()?;
        let query = format!("{EARNINGS_SELECT} GROUP BY p.id ORDER BY 5 DESC, p.id");
        let mut stmt = conn.prepare(&query)?;
        let earnings = stmt
            .query_map([], earnings_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(earnings)
    }

    /// Earnings for one provider, or None if it is not registered
    pub fn provider_earnings(&self, provider_id: &str) -> Result<Option<Earnings>, ProxyError> {
        let conn = self.reader()?;
        let query = format!("{EARNINGS_SELECT} WHERE p.id = ?1 GROUP BY p.id");
        let earnings = conn
            .query_row(&query, params![provider_id], earnings_from_row)
            .optional()?;
        Ok(earnings)
    }

    pub fn provider_count(&self) -> Result<i64, ProxyError> {
        let conn = self.reader()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM providers", [], |row| row.get(0))?)
    }

    pub fn tool_count(&self) -> Result<i64, ProxyError> {
        let conn = self.reader()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM tools", [], |row| row.get(0))?)
    }
}

fn open_reader(path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn is_in_memory(path: &str) -> bool {
    path.is_empty() || path == ":memory:" || path.contains("mode=memory")
}

fn lock_poisoned() -> ProxyError {
    ProxyError::Internal("database lock poisoned".to_string())
}

fn earnings_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Earnings> {
    Ok(Earnings {
        provider_id: row.get(0)?,
        payout_address: row.get(1)?,
        success_count: row.get(2)?,
        failed_count: row.get(3)?,
        revenue_minor_units: row.get(4)?,
        last_payment_at: row.get(5)?,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, price: i64) -> Tool {
        Tool {
            name: name.to_string(),
            price_minor_units: price,
        }
    }

    fn entry(provider: &str, tool: &str, amount: i64, status: PaymentStatus) -> PaymentEntry {
        PaymentEntry {
            provider_id: provider.to_string(),
            tool_name: tool.to_string(),
            from_address: "1Funding".to_string(),
            to_address: "1Payout".to_string(),
            amount_minor_units: amount,
            amount_decimal: "1".to_string(),
            currency: "MNEE".to_string(),
            ticket_id: (status == PaymentStatus::Success).then(|| "tkt".to_string()),
            status,
        }
    }

    #[test]
    fn test_register_and_lookup_returns_exact_tools() {
        let db = Database::new(":memory:").unwrap();
        let tools = vec![tool("echo", 100), tool("forecast", 250), tool("free", 0)];
        db.register_provider("weather", "https://mcp.example.com/mcp", "1Payout", &tools)
            .unwrap();

        let provider = db.get_provider("weather").unwrap().unwrap();
        assert_eq!(provider.upstream_url, "https://mcp.example.com/mcp");
        assert_eq!(provider.payout_address, "1Payout");
        assert_eq!(provider.tools, tools);
        assert_eq!(provider.tool("forecast").unwrap().price_minor_units, 250);
        assert!(provider.tool("missing").is_none());
    }

    #[test]
    fn test_lookup_reads_past_open_write_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let db = Database::new(path.to_str().unwrap()).unwrap();
        db.register_provider("weather", "https://a.example.com", "1Payout", &[tool("echo", 100)])
            .unwrap();

        // Writer sits inside an uncommitted registration
        let writer = db.writer().unwrap();
        writer
            .execute_batch(
                "BEGIN IMMEDIATE;
                 INSERT INTO providers (id, upstream_url, payout_address, created_at)
                 VALUES ('news', 'https://b.example.com', '1News', 0);",
            )
            .unwrap();

        let lookups = db.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let weather = lookups.get_provider("weather").unwrap();
            let news = lookups.get_provider("news").unwrap();
            let _ = tx.send((weather.map(|p| p.tools.len()), news.is_some()));
        });
        let seen = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("lookup waited on the writer");
        assert_eq!(seen, (Some(1), false));

        writer.execute_batch("COMMIT").unwrap();
        drop(writer);
        assert!(db.get_provider("news").unwrap().is_some());
    }

    #[test]
    fn test_unknown_provider() {
        let db = Database::new(":memory:").unwrap();
        assert!(db.get_provider("nobody").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_provider_keeps_first_registration() {
        let db = Database::new(":memory:").unwrap();
        db.register_provider("weather", "https://a.example.com", "1First", &[tool("echo", 1)])
            .unwrap();

        let err = db
            .register_provider("weather", "https://b.example.com", "1Second", &[tool("x", 9)])
            .unwrap_err();
        assert!(matches!(err, ProxyError::DuplicateProvider(ref id) if id == "weather"));

        let provider = db.get_provider("weather").unwrap().unwrap();
        assert_eq!(provider.upstream_url, "https://a.example.com");
        assert_eq!(provider.tools, vec![tool("echo", 1)]);
        assert_eq!(db.tool_count().unwrap(), 1);
    }

    #[test]
    fn test_failed_tool_insert_rolls_back_everything() {
        let db = Database::new(":memory:").unwrap();

        // Duplicate tool names violate UNIQUE(provider_id, name) on the second insert
        let err = db
            .register_provider(
                "weather",
                "https://a.example.com",
                "1Payout",
                &[tool("echo", 1), tool("echo", 2)],
            )
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidPayload(_)));

        // Negative price violates the CHECK constraint
        let err = db
            .register_provider("news", "https://b.example.com", "1Payout", &[tool("a", 1), tool("b", -5)])
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidPayload(_)));

        assert_eq!(db.provider_count().unwrap(), 0);
        assert_eq!(db.tool_count().unwrap(), 0);
        assert!(db.get_provider("weather").unwrap().is_none());
    }

    #[test]
    fn test_payments_newest_first() {
        let db = Database::new(":memory:").unwrap();
        db.record_payment(&entry("weather", "first", 1, PaymentStatus::Success))
            .unwrap();
        db.record_payment(&entry("weather", "second", 2, PaymentStatus::Failed))
            .unwrap();
        db.record_payment(&entry("weather", "third", 3, PaymentStatus::Success))
            .unwrap();

        let payments = db.list_recent_payments(10).unwrap();
        let names: Vec<_> = payments.iter().map(|p| p.tool_name.as_str()).collect();
        assert_eq!(names, vec!["third", "second", "first"]);
        assert_eq!(payments[1].status, PaymentStatus::Failed);
        assert!(payments[1].ticket_id.is_none());

        let limited = db.list_recent_payments(2).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].tool_name, "third");

        // Zero is clamped up, not an empty page
        assert_eq!(db.list_recent_payments(0).unwrap().len(), 1);
    }

    #[test]
    fn test_earnings_count_only_successful_revenue() {
        let db = Database::new(":memory:").unwrap();
        db.register_provider("weather", "https://a.example.com", "1Payout", &[tool("echo", 100)])
            .unwrap();
        db.register_provider("idle", "https://b.example.com", "1Idle", &[])
            .unwrap();

        db.record_payment(&entry("weather", "echo", 100, PaymentStatus::Success))
            .unwrap();
        db.record_payment(&entry("weather", "echo", 100, PaymentStatus::Success))
            .unwrap();
        db.record_payment(&entry("weather", "echo", 100, PaymentStatus::Failed))
            .unwrap();

        let weather = db.provider_earnings("weather").unwrap().unwrap();
        assert_eq!(weather.success_count, 2);
        assert_eq!(weather.failed_count, 1);
        assert_eq!(weather.revenue_minor_units, 200);
        assert!(weather.last_payment_at.is_some());

        let idle = db.provider_earnings("idle").unwrap().unwrap();
        assert_eq!(idle.revenue_minor_units, 0);
        assert_eq!(idle.last_payment_at, None);

        assert!(db.provider_earnings("nobody").unwrap().is_none());

        let all = db.list_earnings().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].provider_id, "weather");
    }
}
