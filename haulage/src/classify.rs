//! Flow identity & classifier (C1).
//!
//! Turns one decoded packet from the capture collaborator into at most one
//! [`FlowEvent`] (for C2) and at most one DNS candidate (for C7). The
//! capture source itself is an external collaborator (see `capture.rs`);
//! this module only ever sees already-decoded layers.

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::debug;

use crate::model::{FiveTuple, FlowEvent};

/// Sentinel transport-protocol value meaning "unhandled" (§4.1 rule 4).
pub const PROTOCOL_UNHANDLED: u8 = 255;

/// The link layer of a decoded packet, if the capture collaborator exposed
/// one at all. `None` means the capture source handed us a headerless
/// (already-stripped) network-layer frame, e.g. a `DLT_RAW` tunnel
/// interface — this is the common case for subscriber tunnels and is not a
/// drop condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    /// Point-to-point IP-in-tunnel framing — the only link layer this
    /// system is specified to handle.
    PointToPointIp,
    /// Anything else (Ethernet, Wi-Fi, ...) — out of scope per §1's
    /// Non-goals ("support for link layers other than point-to-point
    /// IP-in-tunnel").
    Other,
}

#[derive(Debug, Clone, Copy)]
pub enum NetworkLayer {
    V4 {
        src: IpAddr,
        dst: IpAddr,
        protocol: u8,
        payload_len: u16,
    },
    V6 {
        src: IpAddr,
        dst: IpAddr,
        next_header: u8,
        payload_len: u16,
    },
}

impl NetworkLayer {
    pub fn endpoints(&self) -> (IpAddr, IpAddr) {
        match self {
            NetworkLayer::V4 { src, dst, .. } => (*src, *dst),
            NetworkLayer::V6 { src, dst, .. } => (*src, *dst),
        }
    }

    pub fn raw_protocol(&self) -> u8 {
        match self {
            NetworkLayer::V4 { protocol, .. } => *protocol,
            NetworkLayer::V6 { next_header, .. } => *next_header,
        }
    }

    pub fn payload_len(&self) -> u16 {
        match self {
            NetworkLayer::V4 { payload_len, .. } => *payload_len,
            NetworkLayer::V6 { payload_len, .. } => *payload_len,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum TransportLayer {
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
}

impl TransportLayer {
    pub fn ports(&self) -> (u16, u16) {
        match self {
            TransportLayer::Tcp {
                src_port,
                dst_port,
            }
            | TransportLayer::Udp {
                src_port,
                dst_port,
            } => (*src_port, *dst_port),
        }
    }

    pub fn is_udp_on_port(&self, port: u16) -> bool {
        matches!(self, TransportLayer::Udp { src_port, dst_port }
            if *src_port == port || *dst_port == port)
    }
}

/// A single decoded packet, as handed to the classifier by the capture
/// collaborator.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub link: Option<LinkLayer>,
    pub network: Option<NetworkLayer>,
    pub transport: Option<TransportLayer>,
    /// Transport payload bytes — only needed for the cheap DNS pre-check
    /// and subsequent extraction (C7); the flow aggregator only needs
    /// `network.payload_len()`.
    pub transport_payload: Vec<u8>,
}

/// Well-known DNS port, used for the cheap pre-check in rule 6.
const DNS_PORT: u16 = 53;

/// Output of classifying one packet.
#[derive(Debug, Default)]
pub struct ClassifyOutput {
    pub flow_event: Option<FlowEvent>,
    /// Present iff the packet is plausibly a UDP/DNS response — handed to
    /// C7 for the actual parse. `None` otherwise.
    pub dns_candidate: Option<(FiveTuple, Vec<u8>)>,
}

/// Deployment-configurable classification of network endpoints into
/// "subscriber" and "local" address space (§4.1). Pure and cheap: CIDR
/// membership tests over `ipnetwork`.
#[derive(Debug, Clone)]
pub struct Classifier {
    subscriber_cidrs: Vec<IpNetwork>,
    infrastructure_ips: Vec<IpAddr>,
    private_cidrs: Vec<IpNetwork>,
}

impl Classifier {
    pub fn new(subscriber_cidrs: Vec<IpNetwork>, infrastructure_ips: Vec<IpAddr>) -> Self {
        let private_cidrs = default_private_cidrs();
        Self {
            subscriber_cidrs,
            infrastructure_ips,
            private_cidrs,
        }
    }

    /// `user(ip)` — true iff `ip` lies in the subscriber CIDR space minus
    /// explicit infrastructure addresses.
    pub fn is_user(&self, ip: IpAddr) -> bool {
        if self.infrastructure_ips.contains(&ip) {
            return false;
        }
        self.subscriber_cidrs.iter().any(|net| net.contains(ip))
    }

    /// `local(ip)` — true iff `ip` is RFC 1918 / not globally routable
    /// unicast.
    pub fn is_local(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || self.private_cidrs.iter().any(|net| net.contains(ip))
            }
            IpAddr::V6(v6) => v6.is_loopback() || is_unique_local_v6(&v6),
        }
    }
}

fn default_private_cidrs() -> Vec<IpNetwork> {
    vec![
        "10.0.0.0/8".parse().unwrap(),
        "172.16.0.0/12".parse().unwrap(),
        "192.168.0.0/16".parse().unwrap(),
    ]
}

fn is_unique_local_v6(addr: &std::net::Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

/// Classify one decoded packet, producing at most one [`FlowEvent`] and at
/// most one DNS candidate. Rules are applied in the order given in §4.1.
pub fn classify(packet: &DecodedPacket) -> ClassifyOutput {
    // Rule 1: link layer present but not point-to-point IP-in-tunnel.
    if let Some(link) = packet.link {
        if link != LinkLayer::PointToPointIp {
            debug!("dropping packet: non point-to-point link layer");
            return ClassifyOutput::default();
        }
    }

    // Rule 2: no network layer.
    let network = match packet.network {
        Some(n) => n,
        None => return ClassifyOutput::default(),
    };

    // Rule 3: no transport layer.
    let transport = match packet.transport {
        Some(t) => t,
        None => return ClassifyOutput::default(),
    };

    // Rule 4: derive transport protocol, drop the unhandled sentinel.
    let protocol = network.raw_protocol();
    if protocol == PROTOCOL_UNHANDLED {
        debug!("dropping packet: unhandled transport protocol sentinel");
        return ClassifyOutput::default();
    }

    // Rule 5: construct the observed-direction five-tuple and forward to C2.
    let (src_ip, dst_ip) = network.endpoints();
    let (src_port, dst_port) = transport.ports();
    let five_tuple = FiveTuple {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
    };
    let flow_event = Some(FlowEvent {
        five_tuple,
        bytes: network.payload_len() as u64,
    });

    // Rule 6: cheap DNS pre-check — exact parsing happens in C7.
    let dns_candidate = if transport.is_udp_on_port(DNS_PORT) {
        Some((five_tuple, packet.transport_payload.clone()))
    } else {
        None
    };

    ClassifyOutput {
        flow_event,
        dns_candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_packet(src: &str, sport: u16, dst: &str, dport: u16, payload: Vec<u8>) -> DecodedPacket {
        DecodedPacket {
            link: None,
            network: Some(NetworkLayer::V4 {
                src: src.parse().unwrap(),
                dst: dst.parse().unwrap(),
                protocol: 17,
                payload_len: (8 + payload.len()) as u16,
            }),
            transport: Some(TransportLayer::Udp {
                src_port: sport,
                dst_port: dport,
            }),
            transport_payload: payload,
        }
    }

    #[test]
    fn drops_non_ptp_link_layer() {
        let mut packet = udp_packet("10.0.0.1", 1000, "10.0.0.2", 2000, vec![]);
        packet.link = Some(LinkLayer::Other);
        let out = classify(&packet);
        assert!(out.flow_event.is_none());
    }

    #[test]
    fn allows_absent_link_layer() {
        let packet = udp_packet("10.0.0.1", 1000, "10.0.0.2", 2000, vec![]);
        let out = classify(&packet);
        assert!(out.flow_event.is_some());
    }

    #[test]
    fn drops_missing_network_layer() {
        let packet = DecodedPacket {
            link: None,
            network: None,
            transport: Some(TransportLayer::Udp {
                src_port: 1,
                dst_port: 2,
            }),
            transport_payload: vec![],
        };
        assert!(classify(&packet).flow_event.is_none());
    }

    #[test]
    fn drops_missing_transport_layer() {
        let packet = DecodedPacket {
            link: None,
            network: Some(NetworkLayer::V4 {
                src: "10.0.0.1".parse().unwrap(),
                dst: "10.0.0.2".parse().unwrap(),
                protocol: 6,
                payload_len: 40,
            }),
            transport: None,
            transport_payload: vec![],
        };
        assert!(classify(&packet).flow_event.is_none());
    }

    #[test]
    fn drops_unhandled_protocol_sentinel() {
        let mut packet = udp_packet("10.0.0.1", 1000, "10.0.0.2", 2000, vec![]);
        packet.network = Some(NetworkLayer::V4 {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            protocol: PROTOCOL_UNHANDLED,
            payload_len: 40,
        });
        assert!(classify(&packet).flow_event.is_none());
    }

    #[test]
    fn flags_dns_candidate_on_port_53() {
        let packet = udp_packet("10.0.0.1", 54000, "8.8.8.8", 53, vec![1, 2, 3]);
        let out = classify(&packet);
        assert!(out.flow_event.is_some());
        assert!(out.dns_candidate.is_some());
    }

    #[test]
    fn no_dns_candidate_for_non_dns_udp() {
        let packet = udp_packet("10.0.0.1", 54000, "8.8.8.8", 443, vec![1, 2, 3]);
        assert!(classify(&packet).dns_candidate.is_none());
    }

    #[test]
    fn classifier_user_local_predicates() {
        let subscriber_cidrs = vec!["10.45.0.0/16".parse().unwrap()];
        let infra: IpAddr = "10.45.0.1".parse().unwrap();
        let classifier = Classifier::new(subscriber_cidrs, vec![infra]);

        let subscriber_ip: IpAddr = "10.45.0.7".parse().unwrap();
        assert!(classifier.is_user(subscriber_ip));
        assert!(!classifier.is_user(infra));
        assert!(classifier.is_local(subscriber_ip));

        let public_ip: IpAddr = "8.8.8.8".parse().unwrap();
        assert!(!classifier.is_user(public_ip));
        assert!(!classifier.is_local(public_ip));
    }
}
