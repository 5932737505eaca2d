//! Capture source adaptor (A4 — not part of the accounting core).
//!
//! The packet-capture source is an external collaborator per §1: this
//! module is a thin, swappable shim around it, decoding link/network/
//! transport layers and handing the result to the classifier (C1). No
//! classification or accounting logic lives here.

use anyhow::{Context, Result};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::classify::{DecodedPacket, LinkLayer, NetworkLayer, TransportLayer};

/// Async source of decoded packets. The supervisor (C8) drains this in its
/// ingress loop.
#[async_trait::async_trait]
pub trait PacketSource: Send {
    async fn recv(&mut self) -> Option<DecodedPacket>;
}

/// A live `pcap` capture on a named interface. `pcap::Capture` is
/// blocking, so reads are bridged onto a blocking task and delivered over
/// a channel — the standard pattern for wrapping synchronous FFI capture
/// APIs in an async pipeline.
pub struct PcapSource {
    rx: mpsc::Receiver<DecodedPacket>,
    _handle: std::thread::JoinHandle<()>,
}

impl PcapSource {
    pub fn open(interface: &str) -> Result<Self> {
        let mut capture = pcap::Capture::from_device(interface)
            .context("failed to resolve capture interface")?
            .promisc(true)
            .snaplen(65535)
            .open()
            .context("failed to open capture interface")?;
        let linktype = capture.get_datalink();

        let (tx, rx) = mpsc::channel(1024);
        let handle = std::thread::spawn(move || loop {
            match capture.next_packet() {
                Ok(raw) => {
                    if let Some(decoded) = decode(linktype, raw.data) {
                        if tx.blocking_send(decoded).is_err() {
                            break; // receiver dropped, shut down quietly
                        }
                    }
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    warn!(error = %e, "capture read failed, stopping capture thread");
                    break;
                }
            }
        });

        Ok(Self {
            rx,
            _handle: handle,
        })
    }
}

#[async_trait::async_trait]
impl PacketSource for PcapSource {
    async fn recv(&mut self) -> Option<DecodedPacket> {
        self.rx.recv().await
    }
}

/// Decode one raw frame captured under `linktype` into link/network/
/// transport layers. Unrecognized encapsulation yields a packet with no
/// network layer, which the classifier drops silently (§4.1 rule 2).
fn decode(linktype: pcap::Linktype, data: &[u8]) -> Option<DecodedPacket> {
    let (link, network_bytes) = match linktype {
        pcap::Linktype::RAW | pcap::Linktype::NULL | pcap::Linktype::LOOP => (None, data),
        pcap::Linktype::PPP => (Some(LinkLayer::PointToPointIp), strip_ppp_header(data)),
        pcap::Linktype::ETHERNET => {
            let eth = EthernetPacket::new(data)?;
            if eth.get_ethertype() != EtherTypes::Ipv4 && eth.get_ethertype() != EtherTypes::Ipv6 {
                debug!("dropping non-IP ethertype frame");
                return Some(DecodedPacket {
                    link: Some(LinkLayer::Other),
                    network: None,
                    transport: None,
                    transport_payload: Vec::new(),
                });
            }
            (Some(LinkLayer::Other), eth.payload())
        }
        other => {
            debug!(?other, "unrecognized link layer, treating as non point-to-point");
            (Some(LinkLayer::Other), data)
        }
    };

    let (network, transport_bytes, protocol) = decode_network(network_bytes)?;
    let transport = protocol.and_then(|proto| decode_transport(proto, transport_bytes));
    let transport_payload = transport
        .as_ref()
        .map(|_| transport_payload_bytes(protocol.unwrap(), transport_bytes))
        .unwrap_or_default();

    Some(DecodedPacket {
        link,
        network,
        transport,
        transport_payload,
    })
}

fn strip_ppp_header(data: &[u8]) -> &[u8] {
    // Standard PPP-in-HDLC-like framing used by pcap's DLT_PPP: a 2-byte
    // address/control pair optionally precedes the protocol field, which
    // itself is 2 bytes for IP (0x0021) / IPv6 (0x0057).
    if data.len() >= 4 {
        &data[4..]
    } else {
        data
    }
}

fn decode_network(data: &[u8]) -> Option<(Option<NetworkLayer>, &[u8], Option<u8>)> {
    if data.is_empty() {
        return Some((None, data, None));
    }
    let version = data[0] >> 4;
    match version {
        4 => {
            let packet = Ipv4Packet::new(data)?;
            let protocol = packet.get_next_level_protocol().0;
            let layer = NetworkLayer::V4 {
                src: packet.get_source().into(),
                dst: packet.get_destination().into(),
                protocol,
                payload_len: packet.payload().len() as u16,
            };
            Some((Some(layer), packet.payload(), Some(protocol)))
        }
        6 => {
            let packet = Ipv6Packet::new(data)?;
            let next_header = packet.get_next_header().0;
            let layer = NetworkLayer::V6 {
                src: packet.get_source().into(),
                dst: packet.get_destination().into(),
                next_header,
                payload_len: packet.payload().len() as u16,
            };
            Some((Some(layer), packet.payload(), Some(next_header)))
        }
        _ => Some((None, data, None)),
    }
}

fn decode_transport(protocol: u8, data: &[u8]) -> Option<TransportLayer> {
    if protocol == IpNextHeaderProtocols::Tcp.0 {
        let packet = TcpPacket::new(data)?;
        Some(TransportLayer::Tcp {
            src_port: packet.get_source(),
            dst_port: packet.get_destination(),
        })
    } else if protocol == IpNextHeaderProtocols::Udp.0 {
        let packet = UdpPacket::new(data)?;
        Some(TransportLayer::Udp {
            src_port: packet.get_source(),
            dst_port: packet.get_destination(),
        })
    } else {
        None
    }
}

fn transport_payload_bytes(protocol: u8, data: &[u8]) -> Vec<u8> {
    if protocol == IpNextHeaderProtocols::Tcp.0 {
        TcpPacket::new(data)
            .map(|p| p.payload().to_vec())
            .unwrap_or_default()
    } else if protocol == IpNextHeaderProtocols::Udp.0 {
        UdpPacket::new(data)
            .map(|p| p.payload().to_vec())
            .unwrap_or_default()
    } else {
        Vec::new()
    }
}
