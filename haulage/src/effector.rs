//! Packet-filter effector (C6).
//!
//! The kernel forwarding table is shared global state: operations against
//! different subscriber IPs may run in parallel, but two operations against
//! the same IP must never race each other. Each IP gets its own lock,
//! shelling out the same way the ARP sweep shells out to `ping` — exit
//! status is interpreted, not ignored, since `enable_block`/`disable_block`
//! have to report failure upstream.

use dashmap::DashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::EffectorError;

#[async_trait::async_trait]
pub trait PacketFilterEffector: Send + Sync {
    async fn probe(&self, ip: IpAddr) -> Result<bool, EffectorError>;
    async fn enable_block(&self, ip: IpAddr) -> Result<(), EffectorError>;
    async fn disable_block(&self, ip: IpAddr) -> Result<(), EffectorError>;
}

/// Shells out to the kernel packet-filter utility (`nft`/`iptables`-style
/// reject rule scoped to the subscriber source IP, per §6). Per-IP locks
/// serialize concurrent calls against the same address without blocking
/// calls against different addresses.
pub struct ShellEffector {
    locks: DashMap<IpAddr, Arc<Mutex<()>>>,
    binary: String,
}

impl ShellEffector {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            locks: DashMap::new(),
            binary: binary.into(),
        }
    }

    async fn with_lock<T, F, Fut>(&self, ip: IpAddr, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        // Clone the per-IP mutex out and drop the shard guard immediately —
        // holding a DashMap `Ref` across the lock/shell-out await would
        // block unrelated IPs hashing into the same shard.
        let mutex = self
            .locks
            .entry(ip)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _permit = mutex.lock().await;
        f().await
    }

    async fn run(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
    }
}

#[async_trait::async_trait]
impl PacketFilterEffector for ShellEffector {
    async fn probe(&self, ip: IpAddr) -> Result<bool, EffectorError> {
        let ip_str = ip.to_string();
        self.with_lock(ip, || async {
            let output = self
                .run(&["probe", &ip_str])
                .await
                .map_err(|e| EffectorError::ProbeFailed(ip, e.to_string()))?;
            Ok(output.status.success())
        })
        .await
    }

    async fn enable_block(&self, ip: IpAddr) -> Result<(), EffectorError> {
        let ip_str = ip.to_string();
        self.with_lock(ip, || async {
            if self.probe_unlocked(&ip_str).await.unwrap_or(false) {
                warn!(%ip, "enable_block called on already-blocked subscriber, skipping (would double-insert)");
                return Ok(());
            }
            let output = self
                .run(&["enable-block", &ip_str])
                .await
                .map_err(|e| EffectorError::EnableFailed(ip, e.to_string()))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                return Err(EffectorError::EnableFailed(ip, stderr));
            }
            Ok(())
        })
        .await
    }

    async fn disable_block(&self, ip: IpAddr) -> Result<(), EffectorError> {
        let ip_str = ip.to_string();
        self.with_lock(ip, || async {
            let output = self
                .run(&["disable-block", &ip_str])
                .await
                .map_err(|e| EffectorError::DisableFailed(ip, e.to_string()))?;
            if !output.status.success() {
                // The rule may already be absent after a crash; not fatal.
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                warn!(%ip, stderr = %stderr, "disable_block returned non-zero, rule may already be absent");
            }
            Ok(())
        })
        .await
    }
}

impl ShellEffector {
    /// Inner probe that doesn't re-acquire the per-IP lock (the caller
    /// already holds it via `with_lock`).
    async fn probe_unlocked(&self, ip_str: &str) -> std::io::Result<bool> {
        let output = self.run(&["probe", ip_str]).await?;
        Ok(output.status.success())
    }
}

pub mod fake_effector;

#[cfg(test)]
mod tests {
    use super::fake_effector::FakeEffector;
    use super::*;

    #[tokio::test]
    async fn fake_effector_tracks_blocked_state() {
        let effector = FakeEffector::new();
        let ip: IpAddr = "10.45.0.7".parse().unwrap();

        assert!(!effector.probe(ip).await.unwrap());
        effector.enable_block(ip).await.unwrap();
        assert!(effector.probe(ip).await.unwrap());
        effector.disable_block(ip).await.unwrap();
        assert!(!effector.probe(ip).await.unwrap());
    }
}
