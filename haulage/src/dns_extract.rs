//! DNS extractor (C7).
//!
//! Parses a packet already flagged by the classifier (C1) as plausibly
//! UDP/DNS into a normalized [`DnsRecord`]. Accepts only well-formed
//! single-question responses; anything else is logged at debug and
//! dropped — most captured packets reaching this module are not DNS at
//! all, so failures here are expected and routine.

use chrono::{DateTime, Utc};
use hickory_proto::op::{Message, OpCode};
use hickory_proto::rr::RData;
use tracing::debug;

use crate::model::{DnsAnswerKey, DnsRecord, FiveTuple};

fn opcode_to_u8(opcode: OpCode) -> u8 {
    match opcode {
        OpCode::Query => 0,
        OpCode::IQuery => 1,
        OpCode::Status => 2,
        OpCode::Notify => 4,
        OpCode::Update => 5,
        OpCode::DSO => 6,
    }
}

/// Parse one UDP payload as a DNS message, accepting only a well-formed
/// single-question response. `captured_at` is the timestamp assigned by
/// the caller at ingestion time (the core has no wall-clock dependency of
/// its own beyond what's passed in, keeping this function pure and
/// testable).
pub fn extract(
    five_tuple: FiveTuple,
    payload: &[u8],
    captured_at: DateTime<Utc>,
) -> Option<DnsRecord> {
    let message = match Message::from_vec(payload) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "malformed DNS payload, dropping");
            return None;
        }
    };

    if !message.header().message_type().is_response() {
        debug!("DNS payload is a query, not a response; dropping");
        return None;
    }

    let questions = message.queries();
    if questions.len() != 1 {
        debug!(
            count = questions.len(),
            "DNS response does not have exactly one question; dropping"
        );
        return None;
    }
    let host = questions[0].name().to_string();

    let mut answer_ips = Vec::new();
    let mut ttls = Vec::new();
    for record in message.answers() {
        let ip = match record.data() {
            Some(RData::A(addr)) => Some(addr.0.to_string()),
            Some(RData::AAAA(addr)) => Some(addr.0.to_string()),
            _ => None,
        };
        if let Some(ip) = ip {
            answer_ips.push(ip);
            ttls.push(record.ttl().to_string());
        }
    }

    let answer = DnsAnswerKey {
        host,
        answer_ips: answer_ips.join(","),
        ttls: ttls.join(","),
    };

    Some(DnsRecord {
        timestamp: captured_at,
        five_tuple,
        opcode: opcode_to_u8(message.header().op_code()),
        response_code: u16::from(message.header().response_code()) as u8,
        answer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Header, Message, MessageType, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn sample_tuple() -> FiveTuple {
        FiveTuple {
            src_ip: "8.8.8.8".parse().unwrap(),
            dst_ip: "10.45.0.7".parse().unwrap(),
            src_port: 53,
            dst_port: 54000,
            protocol: 17,
        }
    }

    fn build_response(host: &str, ip: Ipv4Addr, ttl: u32) -> Vec<u8> {
        let name = Name::from_str(host).unwrap();
        let mut message = Message::new();
        let mut header = Header::new();
        header.set_message_type(MessageType::Response);
        header.set_op_code(OpCode::Query);
        header.set_response_code(ResponseCode::NoError);
        message.set_header(header);
        message.add_query(Query::query(name.clone(), RecordType::A));
        let mut record = Record::with(name, RecordType::A, ttl);
        record.set_data(Some(RData::A(A(ip))));
        message.add_answer(record);
        message.to_vec().unwrap()
    }

    #[test]
    fn extracts_well_formed_single_answer_response() {
        let bytes = build_response("example.com.", Ipv4Addr::new(93, 184, 216, 34), 3600);
        let record = extract(sample_tuple(), &bytes, Utc::now()).expect("should parse");
        assert_eq!(record.answer.host, "example.com.");
        assert_eq!(record.answer.answer_ips, "93.184.216.34");
        assert_eq!(record.answer.ttls, "3600");
    }

    #[test]
    fn rejects_malformed_payload() {
        let garbage = vec![0u8, 1, 2, 3];
        assert!(extract(sample_tuple(), &garbage, Utc::now()).is_none());
    }

    #[test]
    fn rejects_query_rather_than_response() {
        let name = Name::from_str("example.com.").unwrap();
        let mut message = Message::new();
        let mut header = Header::new();
        header.set_message_type(MessageType::Query);
        message.set_header(header);
        message.add_query(Query::query(name, RecordType::A));
        let bytes = message.to_vec().unwrap();
        assert!(extract(sample_tuple(), &bytes, Utc::now()).is_none());
    }
}
