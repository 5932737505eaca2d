use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::net::IpAddr;

/// A bidirectional flow key in *observed* direction. Two packets that are
/// reverses of each other produce `FiveTuple`s that are unequal but share
/// the same [`FiveTuple::canonical`] form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FiveTuple {
    pub fn reversed(&self) -> FiveTuple {
        FiveTuple {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    /// The canonical representative of `{self, reversed(self)}`: the
    /// lexicographically smaller network endpoint is placed as source; a
    /// loopback five-tuple (src == dst network endpoint) breaks the tie on
    /// transport ports instead.
    pub fn canonical(&self) -> FiveTuple {
        match self.src_ip.cmp(&self.dst_ip) {
            Ordering::Less => *self,
            Ordering::Greater => self.reversed(),
            Ordering::Equal => {
                if self.src_port <= self.dst_port {
                    *self
                } else {
                    self.reversed()
                }
            }
        }
    }

    /// True iff `self`'s (ip, port) source pair matches this tuple's own
    /// source pair — i.e. whether `self` is already in the "A" direction
    /// relative to itself. Used by the flow aggregator, which compares
    /// incoming observed tuples against the direction-A endpoints latched
    /// from the first event.
    pub fn source_endpoint(&self) -> (IpAddr, u16) {
        (self.src_ip, self.src_port)
    }
}

/// Produced by the classifier (C1) for every packet that decodes cleanly.
/// Carries the *observed* direction tuple — canonicalization happens only
/// for routing to the right flow-aggregator task.
#[derive(Debug, Clone, Copy)]
pub struct FlowEvent {
    pub five_tuple: FiveTuple,
    pub bytes: u64,
}

/// The four billing buckets a subscriber aggregator tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    LocalUp,
    LocalDown,
    ExternUp,
    ExternDown,
}

#[derive(Debug, Clone, Copy)]
pub struct UsageEvent {
    pub ip: IpAddr,
    pub kind: UsageKind,
    pub bytes: u64,
}

/// Returned by `LogUsage` — the post-commit view of a subscriber's account,
/// handed to the enforcement controller (C5) for threshold evaluation.
#[derive(Debug, Clone, Copy)]
pub struct SubscriberStatus {
    pub addr: IpAddr,
    pub current_balance: i64,
    pub prior_balance: i64,
    /// Monetary balance, carried through the status struct for interface
    /// completeness. This deployment bills data only (see DESIGN.md); no
    /// monetary ledger exists yet, so this is always 0.
    pub currency_balance: i64,
}

/// One append-only row written per flush per active flow (C2 → C4).
#[derive(Debug, Clone, Copy)]
pub struct FlowLogRow {
    pub interval_start: DateTime<Utc>,
    pub interval_stop: DateTime<Utc>,
    pub five_tuple: FiveTuple,
    pub bytes_a_to_b: u64,
    pub bytes_b_to_a: u64,
}

/// A single DNS question/answer set, normalized by the DNS extractor (C7)
/// before being hashed into the deduped `DnsAnswer` table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsAnswerKey {
    pub host: String,
    pub answer_ips: String,
    pub ttls: String,
}

#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub timestamp: DateTime<Utc>,
    pub five_tuple: FiveTuple,
    pub opcode: u8,
    pub response_code: u8,
    pub answer: DnsAnswerKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(a: &str, ap: u16, b: &str, bp: u16, proto: u8) -> FiveTuple {
        FiveTuple {
            src_ip: a.parse().unwrap(),
            dst_ip: b.parse().unwrap(),
            src_port: ap,
            dst_port: bp,
            protocol: proto,
        }
    }

    #[test]
    fn canonical_is_symmetric_under_reversal() {
        let t = tuple("10.0.0.5", 54000, "8.8.8.8", 443, 6);
        assert_eq!(t.canonical(), t.reversed().canonical());
    }

    #[test]
    fn canonical_picks_smaller_network_endpoint() {
        let t = tuple("10.0.0.5", 1000, "8.8.8.8", 2000, 6);
        let canon = t.canonical();
        // 8.8.8.8 < 10.0.0.5
        assert_eq!(canon.src_ip, "8.8.8.8".parse::<IpAddr>().unwrap());
        assert_eq!(canon.dst_ip, "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn canonical_breaks_loopback_tie_on_ports() {
        let t = tuple("10.0.0.5", 2000, "10.0.0.5", 1000, 6);
        let canon = t.canonical();
        assert_eq!(canon.src_port, 1000);
        assert_eq!(canon.dst_port, 2000);
    }
}
