//! A deterministic in-memory [`Store`] used by tests (see SPEC_FULL.md §8):
//! no embeddable MySQL-compatible fixture is available offline, so the
//! gateway's contract is exercised against this fake instead, which
//! reproduces the same monotonic-counter and clamp-to-zero invariants.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::Mutex;

use crate::error::GatewayError;
use crate::model::{DnsAnswerKey, DnsRecord, FlowLogRow, SubscriberStatus};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct FakeAccount {
    pub imsi: String,
    pub raw_up: i64,
    pub raw_down: i64,
    pub data_balance: i64,
    pub bridged: bool,
}

#[derive(Default)]
struct State {
    static_ips: HashMap<IpAddr, String>,
    accounts: HashMap<String, FakeAccount>,
    flow_logs: Vec<FlowLogRow>,
    answers: HashMap<DnsAnswerKey, i64>,
    dns_responses: Vec<DnsRecord>,
    next_answer_id: i64,
    /// When set, the next N commit attempts fail, to test retry/backoff.
    fail_next_commits: u32,
}

pub struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub async fn seed_subscriber(&self, ip: IpAddr, account: FakeAccount) {
        let mut state = self.state.lock().await;
        state.static_ips.insert(ip, account.imsi.clone());
        state.accounts.insert(account.imsi.clone(), account);
    }

    pub async fn set_balance(&self, imsi: &str, balance: i64) {
        let mut state = self.state.lock().await;
        if let Some(acct) = state.accounts.get_mut(imsi) {
            acct.data_balance = balance;
        }
    }

    pub async fn account(&self, imsi: &str) -> Option<FakeAccount> {
        self.state.lock().await.accounts.get(imsi).cloned()
    }

    pub async fn flow_log_rows(&self) -> Vec<FlowLogRow> {
        self.state.lock().await.flow_logs.clone()
    }

    pub async fn dns_response_count(&self) -> usize {
        self.state.lock().await.dns_responses.len()
    }

    pub async fn answer_count(&self) -> usize {
        self.state.lock().await.answers.len()
    }

    /// Force the next `n` commit-style operations to fail, to exercise the
    /// gateway's bounded retry.
    pub async fn fail_next_commits(&self, n: u32) {
        self.state.lock().await.fail_next_commits = n;
    }

    async fn take_injected_failure(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.fail_next_commits > 0 {
            state.fail_next_commits -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn log_usage(
        &self,
        ip: IpAddr,
        up: u64,
        down: u64,
        _interval_start: DateTime<Utc>,
    ) -> Result<SubscriberStatus, GatewayError> {
        if self.take_injected_failure().await {
            return Err(GatewayError::Backend(sqlx::Error::PoolClosed));
        }
        let mut state = self.state.lock().await;
        let imsi = state
            .static_ips
            .get(&ip)
            .cloned()
            .ok_or(GatewayError::NotFound(ip))?;
        let acct = state.accounts.get_mut(&imsi).expect("account must exist");

        let prior_balance = acct.data_balance;
        acct.raw_up += up as i64;
        acct.raw_down += down as i64;
        acct.data_balance = (acct.data_balance - (up as i64 + down as i64)).max(0);

        Ok(SubscriberStatus {
            addr: ip,
            current_balance: acct.data_balance,
            prior_balance,
            currency_balance: 0,
        })
    }

    async fn update_bridged_state(&self, ip: IpAddr, bridged: bool) -> Result<(), GatewayError> {
        if self.take_injected_failure().await {
            return Err(GatewayError::Backend(sqlx::Error::PoolClosed));
        }
        let mut state = self.state.lock().await;
        let imsi = state
            .static_ips
            .get(&ip)
            .cloned()
            .ok_or(GatewayError::NotFound(ip))?;
        state.accounts.get_mut(&imsi).expect("account must exist").bridged = bridged;
        Ok(())
    }

    async fn log_flow(&self, row: FlowLogRow) {
        self.state.lock().await.flow_logs.push(row);
    }

    async fn log_dns_response(&self, record: DnsRecord) -> Result<(), GatewayError> {
        if self.take_injected_failure().await {
            return Err(GatewayError::Backend(sqlx::Error::PoolClosed));
        }
        let mut state = self.state.lock().await;
        let answer_id = if let Some(id) = state.answers.get(&record.answer) {
            *id
        } else {
            let id = state.next_answer_id;
            state.next_answer_id += 1;
            state.answers.insert(record.answer.clone(), id);
            id
        };
        let _ = answer_id;
        state.dns_responses.push(record);
        Ok(())
    }

    async fn query_global_bridged_state(&self) -> Result<Vec<(IpAddr, bool)>, GatewayError> {
        let state = self.state.lock().await;
        Ok(state
            .static_ips
            .iter()
            .filter_map(|(ip, imsi)| state.accounts.get(imsi).map(|a| (*ip, a.bridged)))
            .collect())
    }

    async fn query_topped_up_customers(&self) -> Result<Vec<IpAddr>, GatewayError> {
        let state = self.state.lock().await;
        Ok(state
            .static_ips
            .iter()
            .filter_map(|(ip, imsi)| {
                state.accounts.get(imsi).and_then(|a| {
                    if !a.bridged && a.data_balance > 0 {
                        Some(*ip)
                    } else {
                        None
                    }
                })
            })
            .collect())
    }

    async fn subscriber_balance(&self, ip: IpAddr) -> Result<i64, GatewayError> {
        let state = self.state.lock().await;
        let imsi = state.static_ips.get(&ip).cloned().ok_or(GatewayError::NotFound(ip))?;
        Ok(state.accounts.get(&imsi).expect("account must exist").data_balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn log_usage_clamps_balance_to_zero() {
        let store = FakeStore::new();
        store
            .seed_subscriber(
                ip("10.45.0.7"),
                FakeAccount {
                    imsi: "001010000000001".to_string(),
                    raw_up: 0,
                    raw_down: 0,
                    data_balance: 20_000,
                    bridged: true,
                },
            )
            .await;

        let status = store
            .log_usage(ip("10.45.0.7"), 15_000, 0, chrono::Utc::now())
            .await
            .unwrap();
        assert_eq!(status.current_balance, 5_000);
        assert_eq!(status.prior_balance, 20_000);

        let status = store
            .log_usage(ip("10.45.0.7"), 10_000, 0, chrono::Utc::now())
            .await
            .unwrap();
        assert_eq!(status.current_balance, 0);
        assert_eq!(status.prior_balance, 5_000);

        let acct = store.account("001010000000001").await.unwrap();
        assert_eq!(acct.raw_up, 25_000);
        assert_eq!(acct.data_balance, 0);
    }

    #[tokio::test]
    async fn log_usage_not_found_for_unmapped_ip() {
        let store = FakeStore::new();
        let err = store
            .log_usage(ip("10.45.0.9"), 1, 1, chrono::Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn dns_dedupe_reuses_existing_answer() {
        let store = FakeStore::new();
        let answer = DnsAnswerKey {
            host: "example.com".to_string(),
            answer_ips: "93.184.216.34".to_string(),
            ttls: "3600".to_string(),
        };
        let tuple = crate::model::FiveTuple {
            src_ip: ip("8.8.8.8"),
            dst_ip: ip("10.45.0.7"),
            src_port: 53,
            dst_port: 54000,
            protocol: 17,
        };
        let record = DnsRecord {
            timestamp: chrono::Utc::now(),
            five_tuple: tuple,
            opcode: 0,
            response_code: 0,
            answer: answer.clone(),
        };
        store.log_dns_response(record.clone()).await.unwrap();
        store.log_dns_response(record).await.unwrap();

        assert_eq!(store.answer_count().await, 1);
        assert_eq!(store.dns_response_count().await, 2);
    }
}
