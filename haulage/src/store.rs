//! Persistence gateway (C4) — the `Store` trait and its backends.
//!
//! The gateway never holds a transaction across a component boundary: each
//! operation below is a complete, independently-retried unit of work, per
//! §4.4. `MySqlStore` is the production backend; `fake_store::FakeStore`
//! is a deterministic in-memory stand-in used by tests, since an embedded
//! MySQL-compatible fixture isn't available offline (see SPEC_FULL.md §8).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use tracing::error;

use crate::error::GatewayError;
use crate::model::{DnsRecord, FlowLogRow, SubscriberStatus};

/// Number of attempts the gateway makes to commit a single unit of work
/// before giving up with [`GatewayError::TransactionLost`] (§4.4, §7).
pub const MAX_COMMIT_ATTEMPTS: u32 = 3;

#[async_trait]
pub trait Store: Send + Sync {
    /// Add `up`/`down` to the subscriber's monotonic raw counters and
    /// subtract `up + down` from `data_balance`, clamping at 0. Returns the
    /// post-commit status for enforcement evaluation (C5). `interval_start`
    /// is the caller's own aggregation-window start, not the commit time —
    /// `subscriber_usage`'s primary key is `(subscriber, start_time)`, so
    /// two commits in the same wall-clock second would collide if this
    /// used `NOW()` instead.
    async fn log_usage(
        &self,
        ip: IpAddr,
        up: u64,
        down: u64,
        interval_start: DateTime<Utc>,
    ) -> Result<SubscriberStatus, GatewayError>;

    /// Idempotent with respect to the value.
    async fn update_bridged_state(&self, ip: IpAddr, bridged: bool) -> Result<(), GatewayError>;

    /// Append a flow-log row. Errors are reported (logged) but never
    /// surfaced to the flow aggregator (§4.4, §7).
    async fn log_flow(&self, row: FlowLogRow);

    /// Upsert the DNS answer (deduped on its unique key) and insert a
    /// response row referencing it.
    async fn log_dns_response(&self, record: DnsRecord) -> Result<(), GatewayError>;

    /// Read-only snapshot used by C5's startup reconciliation.
    async fn query_global_bridged_state(&self) -> Result<Vec<(IpAddr, bool)>, GatewayError>;

    /// Read-only snapshot used by C5's topup poller.
    async fn query_topped_up_customers(&self) -> Result<Vec<IpAddr>, GatewayError>;

    /// The subscriber's current `data_balance`, read once when a subscriber
    /// aggregator task is born (§4.3: "the value read on task startup").
    async fn subscriber_balance(&self, ip: IpAddr) -> Result<i64, GatewayError>;
}

/// MySQL-backed implementation (§6: `dbLocation`/`dbUser`/`dbPass` name a
/// network-reachable relational store).
pub struct MySqlStore {
    pool: sqlx::MySqlPool,
}

impl MySqlStore {
    pub fn new(pool: sqlx::MySqlPool) -> Self {
        Self { pool }
    }

    /// Run `attempt` up to [`MAX_COMMIT_ATTEMPTS`] times, returning
    /// `TransactionLost` after the last failure. Only commit-time failures
    /// are retried; a `NotFound` short-circuits immediately since retrying
    /// a missing mapping can't help.
    async fn with_retry<T, F, Fut>(&self, mut attempt: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let mut last_err = None;
        for _ in 0..MAX_COMMIT_ATTEMPTS {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(GatewayError::NotFound(ip)) => return Err(GatewayError::NotFound(ip)),
                Err(e) => last_err = Some(e),
            }
        }
        error!(error = ?last_err, "data loss: unable to commit");
        Err(GatewayError::TransactionLost {
            attempts: MAX_COMMIT_ATTEMPTS,
        })
    }

    async fn resolve_imsi(tx: &mut sqlx::MySqlConnection, ip: IpAddr) -> Result<String, GatewayError> {
        let ip_str = ip.to_string();
        let row: Option<(String,)> = sqlx::query_as("SELECT imsi FROM static_ips WHERE ip = ?")
            .bind(&ip_str)
            .fetch_optional(tx)
            .await?;
        row.map(|(imsi,)| imsi).ok_or(GatewayError::NotFound(ip))
    }
}

#[async_trait]
impl Store for MySqlStore {
    async fn log_usage(
        &self,
        ip: IpAddr,
        up: u64,
        down: u64,
        interval_start: DateTime<Utc>,
    ) -> Result<SubscriberStatus, GatewayError> {
        self.with_retry(|| async {
            let mut tx = self.pool.begin().await?;
            let imsi = Self::resolve_imsi(&mut tx, ip).await?;

            let row: (i64, i64, i64) = sqlx::query_as(
                "SELECT raw_up, raw_down, data_balance FROM subscribers WHERE imsi = ? FOR UPDATE",
            )
            .bind(&imsi)
            .fetch_one(&mut *tx)
            .await?;
            let (raw_up, raw_down, prior_balance) = row;

            let new_up = raw_up + up as i64;
            let new_down = raw_down + down as i64;
            let spent = up as i64 + down as i64;
            let new_balance = (prior_balance - spent).max(0);

            sqlx::query(
                "UPDATE subscribers SET raw_up = ?, raw_down = ?, data_balance = ? WHERE imsi = ?",
            )
            .bind(new_up)
            .bind(new_down)
            .bind(new_balance)
            .bind(&imsi)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO subscriber_usage (subscriber, start_time, end_time, ran_bytes_up, ran_bytes_down, wan_bytes_up, wan_bytes_down) \
                 VALUES (?, ?, NOW(), 0, 0, ?, ?)",
            )
            .bind(&imsi)
            .bind(interval_start)
            .bind(up as i64)
            .bind(down as i64)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            Ok(SubscriberStatus {
                addr: ip,
                current_balance: new_balance,
                prior_balance,
                currency_balance: 0,
            })
        })
        .await
    }

    async fn update_bridged_state(&self, ip: IpAddr, bridged: bool) -> Result<(), GatewayError> {
        self.with_retry(|| async {
            let mut tx = self.pool.begin().await?;
            let imsi = Self::resolve_imsi(&mut tx, ip).await?;

            sqlx::query("UPDATE subscribers SET bridged = ? WHERE imsi = ?")
                .bind(bridged)
                .bind(&imsi)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO subscriber_history (subscriber, time, data_balance, bridged) \
                 SELECT imsi, NOW(), data_balance, bridged FROM subscribers WHERE imsi = ?",
            )
            .bind(&imsi)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn log_flow(&self, row: FlowLogRow) {
        let t = row.five_tuple;
        let result = sqlx::query(
            "INSERT INTO flowlogs (intervalStart, intervalStop, addressA, addressB, transportProtocol, portA, portB, bytesAtoB, bytesBtoA) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.interval_start)
        .bind(row.interval_stop)
        .bind(ip_to_binary16(t.src_ip))
        .bind(ip_to_binary16(t.dst_ip))
        .bind(t.protocol)
        .bind(t.src_port)
        .bind(t.dst_port)
        .bind(row.bytes_a_to_b as i64)
        .bind(row.bytes_b_to_a as i64)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            error!(error = %e, "failed to append flow-log row");
        }
    }

    async fn log_dns_response(&self, record: DnsRecord) -> Result<(), GatewayError> {
        self.with_retry(|| async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT IGNORE INTO answers (host, ip_addresses, ttls) VALUES (?, ?, ?)",
            )
            .bind(&record.answer.host)
            .bind(&record.answer.answer_ips)
            .bind(&record.answer.ttls)
            .execute(&mut *tx)
            .await?;

            let (answer_id,): (i64,) = sqlx::query_as(
                "SELECT idx FROM answers WHERE host = ? AND ip_addresses = ? AND ttls = ?",
            )
            .bind(&record.answer.host)
            .bind(&record.answer.answer_ips)
            .bind(&record.answer.ttls)
            .fetch_one(&mut *tx)
            .await?;

            let t = record.five_tuple;
            sqlx::query(
                "INSERT INTO dnsResponses (time, srcIp, dstIp, transportProtocol, srcPort, dstPort, opcode, resultcode, answer) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.timestamp)
            .bind(ip_to_binary16(t.src_ip))
            .bind(ip_to_binary16(t.dst_ip))
            .bind(t.protocol)
            .bind(t.src_port)
            .bind(t.dst_port)
            .bind(record.opcode)
            .bind(record.response_code)
            .bind(answer_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn query_global_bridged_state(&self) -> Result<Vec<(IpAddr, bool)>, GatewayError> {
        let rows: Vec<(String, bool)> =
            sqlx::query_as("SELECT static_ips.ip, subscribers.bridged FROM static_ips JOIN subscribers ON subscribers.imsi = static_ips.imsi")
                .fetch_all(&self.pool)
                .await?;

        // Per the design notes (§9): a row whose IP fails to parse is
        // skipped rather than appended — the source this was modeled on
        // conflated a scan failure with a successful (if partial) row.
        let mut out = Vec::with_capacity(rows.len());
        for (ip_str, bridged) in rows {
            match ip_str.parse::<IpAddr>() {
                Ok(ip) => out.push((ip, bridged)),
                Err(e) => error!(ip = %ip_str, error = %e, "skipping unparsable static IP row"),
            }
        }
        Ok(out)
    }

    async fn query_topped_up_customers(&self) -> Result<Vec<IpAddr>, GatewayError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT static_ips.ip FROM static_ips JOIN subscribers ON subscribers.imsi = static_ips.imsi \
             WHERE subscribers.bridged = FALSE AND subscribers.data_balance > 0",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (ip_str,) in rows {
            match ip_str.parse::<IpAddr>() {
                Ok(ip) => out.push(ip),
                Err(e) => error!(ip = %ip_str, error = %e, "skipping unparsable static IP row"),
            }
        }
        Ok(out)
    }

    async fn subscriber_balance(&self, ip: IpAddr) -> Result<i64, GatewayError> {
        let mut conn = self.pool.acquire().await?;
        let imsi = Self::resolve_imsi(&mut conn, ip).await?;
        let (balance,): (i64,) = sqlx::query_as("SELECT data_balance FROM subscribers WHERE imsi = ?")
            .bind(&imsi)
            .fetch_one(&mut *conn)
            .await?;
        Ok(balance)
    }
}

/// IPv4-mapped 16-byte binary form for the `BINARY(16)` address columns in
/// §6 (IPv4-mapped for v4, native for v6).
fn ip_to_binary16(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Shared timestamp helper so callers (C2, C7) don't reach for `Utc::now`
/// directly in the middle of otherwise-pure logic.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub mod fake_store;
