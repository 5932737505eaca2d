//! In-memory [`PacketFilterEffector`] used by C5 and supervisor tests.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;

use crate::effector::PacketFilterEffector;
use crate::error::EffectorError;

pub struct FakeEffector {
    blocked: Mutex<HashSet<IpAddr>>,
    pub enable_calls: Mutex<Vec<IpAddr>>,
    pub disable_calls: Mutex<Vec<IpAddr>>,
}

impl FakeEffector {
    pub fn new() -> Self {
        Self {
            blocked: Mutex::new(HashSet::new()),
            enable_calls: Mutex::new(Vec::new()),
            disable_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn seed_blocked(&self, ip: IpAddr) {
        self.blocked.lock().unwrap().insert(ip);
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocked.lock().unwrap().contains(&ip)
    }
}

impl Default for FakeEffector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PacketFilterEffector for FakeEffector {
    async fn probe(&self, ip: IpAddr) -> Result<bool, EffectorError> {
        Ok(self.blocked.lock().unwrap().contains(&ip))
    }

    async fn enable_block(&self, ip: IpAddr) -> Result<(), EffectorError> {
        self.enable_calls.lock().unwrap().push(ip);
        self.blocked.lock().unwrap().insert(ip);
        Ok(())
    }

    async fn disable_block(&self, ip: IpAddr) -> Result<(), EffectorError> {
        self.disable_calls.lock().unwrap().push(ip);
        self.blocked.lock().unwrap().remove(&ip);
        Ok(())
    }
}
