//! IEEE 1588-2008 message codecs.
//!
//! Byte-exact big-endian layouts for the event and general messages the port
//! exchanges, plus TLV append/parse and the vendor extension TLVs carried
//! under the adapter vendor's OUI for MTIE reporting and slave-status
//! monitoring.

use crate::error::{Error, Result};
use crate::time::{TimeSpec, NSEC_PER_SEC};

/// PTP over Ethernet.
pub const ETH_P_1588: u16 = 0x88f7;
/// Primary PTP multicast address.
pub const PTP_PRIMARY_MCAST: [u8; 6] = [0x01, 0x1b, 0x19, 0x00, 0x00, 0x00];
/// Peer-delay multicast address (link-local, not forwarded).
pub const PTP_PDELAY_MCAST: [u8; 6] = [0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e];

pub const PTP_VERSION: u8 = 2;
pub const HEADER_LEN: usize = 34;

// flagField bits, big-endian u16 view.
pub const FLAG_TWO_STEP: u16 = 0x0200;
pub const FLAG_UNICAST: u16 = 0x0400;
pub const FLAG_LEAP61: u16 = 0x0001;
pub const FLAG_LEAP59: u16 = 0x0002;
pub const FLAG_UTC_OFFSET_VALID: u16 = 0x0004;
pub const FLAG_PTP_TIMESCALE: u16 = 0x0008;
pub const FLAG_TIME_TRACEABLE: u16 = 0x0010;
pub const FLAG_FREQ_TRACEABLE: u16 = 0x0020;

/// Message type nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Sync,
    DelayReq,
    PdelayReq,
    PdelayResp,
    FollowUp,
    DelayResp,
    PdelayRespFollowUp,
    Announce,
    Signaling,
    Management,
}

impl MessageType {
    pub fn to_nibble(self) -> u8 {
        match self {
            Self::Sync => 0x0,
            Self::DelayReq => 0x1,
            Self::PdelayReq => 0x2,
            Self::PdelayResp => 0x3,
            Self::FollowUp => 0x8,
            Self::DelayResp => 0x9,
            Self::PdelayRespFollowUp => 0xa,
            Self::Announce => 0xb,
            Self::Signaling => 0xc,
            Self::Management => 0xd,
        }
    }

    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0x0 => Some(Self::Sync),
            0x1 => Some(Self::DelayReq),
            0x2 => Some(Self::PdelayReq),
            0x3 => Some(Self::PdelayResp),
            0x8 => Some(Self::FollowUp),
            0x9 => Some(Self::DelayResp),
            0xa => Some(Self::PdelayRespFollowUp),
            0xb => Some(Self::Announce),
            0xc => Some(Self::Signaling),
            0xd => Some(Self::Management),
            _ => None,
        }
    }

    /// Event messages are hardware-timestamped on the wire.
    pub fn is_event(self) -> bool {
        matches!(
            self,
            Self::Sync | Self::DelayReq | Self::PdelayReq | Self::PdelayResp
        )
    }
}

/// clockIdentity + portNumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PortIdentity {
    pub clock_id: [u8; 8],
    pub port: u16,
}

impl PortIdentity {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.clock_id);
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 10 {
            return Err(Error::Protocol("short port identity".into()));
        }
        let mut clock_id = [0u8; 8];
        clock_id.copy_from_slice(&buf[..8]);
        Ok(Self {
            clock_id,
            port: u16::from_be_bytes([buf[8], buf[9]]),
        })
    }
}

impl std::fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = &self.clock_id;
        write!(
            f,
            "{:02x}{:02x}{:02x}.{:02x}{:02x}.{:02x}{:02x}{:02x}-{}",
            c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7], self.port
        )
    }
}

/// On-the-wire timestamp: 48-bit seconds, 32-bit nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireTimestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

pub const WIRE_TS_LEN: usize = 10;
const MAX_WIRE_SECONDS: u64 = (1 << 48) - 1;

impl WireTimestamp {
    pub fn from_timespec(ts: TimeSpec) -> Result<Self> {
        if ts.is_negative() || ts.sec as u64 > MAX_WIRE_SECONDS {
            return Err(Error::Protocol(format!("timestamp {ts} out of wire range")));
        }
        Ok(Self {
            seconds: ts.sec as u64,
            nanoseconds: ts.nsec as u32,
        })
    }

    pub fn to_timespec(self) -> TimeSpec {
        TimeSpec::new(self.seconds as i64, self.nanoseconds as i64)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.seconds.to_be_bytes()[2..8]);
        out.extend_from_slice(&self.nanoseconds.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < WIRE_TS_LEN {
            return Err(Error::Protocol("short timestamp".into()));
        }
        let mut sec_bytes = [0u8; 8];
        sec_bytes[2..8].copy_from_slice(&buf[..6]);
        let nanoseconds = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        if nanoseconds as i64 >= NSEC_PER_SEC {
            return Err(Error::Protocol("nanoseconds field out of range".into()));
        }
        Ok(Self {
            seconds: u64::from_be_bytes(sec_bytes),
            nanoseconds,
        })
    }
}

/// grandmasterClockQuality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockQuality {
    pub class: u8,
    pub accuracy: u8,
    pub variance: u16,
}

impl ClockQuality {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.class);
        out.push(self.accuracy);
        out.extend_from_slice(&self.variance.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Protocol("short clock quality".into()));
        }
        Ok(Self {
            class: buf[0],
            accuracy: buf[1],
            variance: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }
}

/// clockAccuracy enumeration to nanoseconds. 0xfe is unknown.
pub fn accuracy_to_ns(accuracy: u8) -> f64 {
    match accuracy {
        0x17 => 1.0,
        0x18 => 2.5,
        0x19 => 10.0,
        0x1a => 25.0,
        0x1b => 100.0,
        0x1c => 250.0,
        0x1d => 1_000.0,
        0x1e => 2_500.0,
        0x1f => 10_000.0,
        0x20 => 25_000.0,
        0x21 => 100_000.0,
        0x22 => 250_000.0,
        0x23 => 1_000_000.0,
        0x24 => 2_500_000.0,
        0x25 => 10_000_000.0,
        0x26 => 25_000_000.0,
        0x27 => 100_000_000.0,
        0x28 => 250_000_000.0,
        0x29 => 1_000_000_000.0,
        0x2a => 10_000_000_000.0,
        0x2b => f64::INFINITY, // > 10 s
        _ => f64::INFINITY,
    }
}

/// Nearest clockAccuracy enumeration at or above `ns`.
pub fn ns_to_accuracy(ns: f64) -> u8 {
    for code in 0x17u8..=0x2a {
        if ns <= accuracy_to_ns(code) {
            return code;
        }
    }
    0xfe
}

/// Common 34-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpHeader {
    pub message_type: MessageType,
    pub transport_specific: u8,
    pub domain: u8,
    pub flags: u16,
    /// Scaled-ns correction field (ns * 2^16).
    pub correction: i64,
    pub source_port: PortIdentity,
    pub sequence_id: u16,
    pub control: u8,
    pub log_interval: i8,
}

impl PtpHeader {
    pub fn new(message_type: MessageType, domain: u8, source_port: PortIdentity) -> Self {
        Self {
            message_type,
            transport_specific: 0,
            domain,
            flags: 0,
            correction: 0,
            source_port,
            sequence_id: 0,
            control: match message_type {
                MessageType::Sync => 0,
                MessageType::DelayReq => 1,
                MessageType::FollowUp => 2,
                MessageType::DelayResp => 3,
                _ => 5,
            },
            log_interval: 0x7f,
        }
    }

    pub fn correction_ns(&self) -> f64 {
        self.correction as f64 / 65536.0
    }

    fn encode(&self, body_len: usize, out: &mut Vec<u8>) {
        out.push((self.transport_specific << 4) | self.message_type.to_nibble());
        out.push(PTP_VERSION);
        out.extend_from_slice(&((HEADER_LEN + body_len) as u16).to_be_bytes());
        out.push(self.domain);
        out.push(0); // reserved
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.correction.to_be_bytes());
        out.extend_from_slice(&[0; 4]); // reserved
        self.source_port.encode(out);
        out.extend_from_slice(&self.sequence_id.to_be_bytes());
        out.push(self.control);
        out.push(self.log_interval as u8);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Protocol("short header".into()));
        }
        let message_type = MessageType::from_nibble(buf[0] & 0x0f)
            .ok_or_else(|| Error::Protocol(format!("unknown message type {:#x}", buf[0] & 0xf)))?;
        let version = buf[1] & 0x0f;
        if version != PTP_VERSION {
            return Err(Error::Protocol(format!("unsupported PTP version {version}")));
        }
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if length < HEADER_LEN || length > buf.len() {
            return Err(Error::Protocol("truncated message".into()));
        }
        Ok(Self {
            message_type,
            transport_specific: buf[0] >> 4,
            domain: buf[4],
            flags: u16::from_be_bytes([buf[6], buf[7]]),
            correction: i64::from_be_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            source_port: PortIdentity::decode(&buf[20..30])?,
            sequence_id: u16::from_be_bytes([buf[30], buf[31]]),
            control: buf[32],
            log_interval: buf[33] as i8,
        })
    }
}

/// Announce message body.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnnounceBody {
    pub origin: WireTimestamp,
    pub utc_offset: i16,
    pub gm_priority1: u8,
    pub gm_quality: ClockQuality,
    pub gm_priority2: u8,
    pub gm_identity: [u8; 8],
    pub steps_removed: u16,
    pub time_source: u8,
}

impl AnnounceBody {
    pub const LEN: usize = 30;

    fn encode(&self, out: &mut Vec<u8>) {
        self.origin.encode(out);
        out.extend_from_slice(&self.utc_offset.to_be_bytes());
        out.push(0); // reserved
        out.push(self.gm_priority1);
        self.gm_quality.encode(out);
        out.push(self.gm_priority2);
        out.extend_from_slice(&self.gm_identity);
        out.extend_from_slice(&self.steps_removed.to_be_bytes());
        out.push(self.time_source);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::Protocol("short announce".into()));
        }
        let mut gm_identity = [0u8; 8];
        gm_identity.copy_from_slice(&buf[19..27]);
        Ok(Self {
            origin: WireTimestamp::decode(&buf[0..10])?,
            utc_offset: i16::from_be_bytes([buf[10], buf[11]]),
            gm_priority1: buf[13],
            gm_quality: ClockQuality::decode(&buf[14..18])?,
            gm_priority2: buf[18],
            gm_identity,
            steps_removed: u16::from_be_bytes([buf[27], buf[28]]),
            time_source: buf[29],
        })
    }
}

/// Everything after the common header, by message type.
#[derive(Debug, Clone, PartialEq)]
pub enum PtpBody {
    Announce(AnnounceBody),
    /// Sync and DelayReq carry an origin timestamp.
    Sync(WireTimestamp),
    DelayReq(WireTimestamp),
    FollowUp(WireTimestamp),
    DelayResp {
        receive: WireTimestamp,
        requestor: PortIdentity,
    },
    PdelayReq(WireTimestamp),
    PdelayResp {
        request_receipt: WireTimestamp,
        requestor: PortIdentity,
    },
    PdelayRespFollowUp {
        response_origin: WireTimestamp,
        requestor: PortIdentity,
    },
    Signaling {
        target: PortIdentity,
    },
    Management {
        target: PortIdentity,
        action: u8,
    },
}

/// One decoded message: header, body, appended TLVs.
#[derive(Debug, Clone, PartialEq)]
pub struct PtpMessage {
    pub header: PtpHeader,
    pub body: PtpBody,
    pub tlvs: Vec<Tlv>,
}

impl PtpMessage {
    pub fn new(header: PtpHeader, body: PtpBody) -> Self {
        Self {
            header,
            body,
            tlvs: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(44);
        match &self.body {
            PtpBody::Announce(a) => a.encode(&mut body),
            PtpBody::Sync(ts) | PtpBody::DelayReq(ts) | PtpBody::FollowUp(ts) => {
                ts.encode(&mut body);
            }
            PtpBody::DelayResp { receive, requestor } => {
                receive.encode(&mut body);
                requestor.encode(&mut body);
            }
            PtpBody::PdelayReq(ts) => {
                ts.encode(&mut body);
                body.extend_from_slice(&[0; 10]); // reserved
            }
            PtpBody::PdelayResp {
                request_receipt,
                requestor,
            } => {
                request_receipt.encode(&mut body);
                requestor.encode(&mut body);
            }
            PtpBody::PdelayRespFollowUp {
                response_origin,
                requestor,
            } => {
                response_origin.encode(&mut body);
                requestor.encode(&mut body);
            }
            PtpBody::Signaling { target } => target.encode(&mut body),
            PtpBody::Management { target, action } => {
                target.encode(&mut body);
                body.push(1); // startingBoundaryHops
                body.push(1); // boundaryHops
                body.push(action & 0x1f);
                body.push(0); // reserved
            }
        }
        for tlv in &self.tlvs {
            tlv.encode(&mut body);
        }
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        self.header.encode(body.len(), &mut out);
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = PtpHeader::decode(buf)?;
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let rest = &buf[HEADER_LEN..length];
        let (body, body_len) = match header.message_type {
            MessageType::Announce => (
                PtpBody::Announce(AnnounceBody::decode(rest)?),
                AnnounceBody::LEN,
            ),
            MessageType::Sync => (PtpBody::Sync(WireTimestamp::decode(rest)?), WIRE_TS_LEN),
            MessageType::DelayReq => {
                (PtpBody::DelayReq(WireTimestamp::decode(rest)?), WIRE_TS_LEN)
            }
            MessageType::FollowUp => {
                (PtpBody::FollowUp(WireTimestamp::decode(rest)?), WIRE_TS_LEN)
            }
            MessageType::DelayResp => {
                if rest.len() < 20 {
                    return Err(Error::Protocol("short delay_resp".into()));
                }
                (
                    PtpBody::DelayResp {
                        receive: WireTimestamp::decode(&rest[..10])?,
                        requestor: PortIdentity::decode(&rest[10..20])?,
                    },
                    20,
                )
            }
            MessageType::PdelayReq => {
                if rest.len() < 20 {
                    return Err(Error::Protocol("short pdelay_req".into()));
                }
                (PtpBody::PdelayReq(WireTimestamp::decode(&rest[..10])?), 20)
            }
            MessageType::PdelayResp => {
                if rest.len() < 20 {
                    return Err(Error::Protocol("short pdelay_resp".into()));
                }
                (
                    PtpBody::PdelayResp {
                        request_receipt: WireTimestamp::decode(&rest[..10])?,
                        requestor: PortIdentity::decode(&rest[10..20])?,
                    },
                    20,
                )
            }
            MessageType::PdelayRespFollowUp => {
                if rest.len() < 20 {
                    return Err(Error::Protocol("short pdelay_resp_follow_up".into()));
                }
                (
                    PtpBody::PdelayRespFollowUp {
                        response_origin: WireTimestamp::decode(&rest[..10])?,
                        requestor: PortIdentity::decode(&rest[10..20])?,
                    },
                    20,
                )
            }
            MessageType::Signaling => (
                PtpBody::Signaling {
                    target: PortIdentity::decode(rest)?,
                },
                10,
            ),
            MessageType::Management => {
                if rest.len() < 14 {
                    return Err(Error::Protocol("short management".into()));
                }
                (
                    PtpBody::Management {
                        target: PortIdentity::decode(&rest[..10])?,
                        action: rest[12] & 0x1f,
                    },
                    14,
                )
            }
        };
        let tlvs = Tlv::decode_all(&rest[body_len..])?;
        Ok(Self { header, body, tlvs })
    }
}

// --- TLVs -------------------------------------------------------------------

pub const TLV_ORGANIZATION_EXTENSION: u16 = 0x0003;

/// OUI the daemon's vendor TLVs are registered under.
pub const VENDOR_OUI: [u8; 3] = [0x00, 0x0f, 0x53];
pub const VENDOR_SUBTYPE_MTIE: [u8; 3] = [0x00, 0x00, 0x01];
pub const VENDOR_SUBTYPE_SLAVE_STATUS: [u8; 3] = [0x00, 0x00, 0x02];

/// A raw TLV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tlv_type: u16,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tlv_type.to_be_bytes());
        out.extend_from_slice(&(self.value.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.value);
        if self.value.len() % 2 != 0 {
            out.push(0);
        }
    }

    pub fn decode_all(mut buf: &[u8]) -> Result<Vec<Tlv>> {
        let mut tlvs = Vec::new();
        while buf.len() >= 4 {
            let tlv_type = u16::from_be_bytes([buf[0], buf[1]]);
            let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            if buf.len() < 4 + len {
                return Err(Error::Protocol("truncated TLV".into()));
            }
            tlvs.push(Tlv {
                tlv_type,
                value: buf[4..4 + len].to_vec(),
            });
            let step = 4 + len + (len % 2);
            if step >= buf.len() {
                break;
            }
            buf = &buf[step..];
        }
        Ok(tlvs)
    }

    /// Build an organization-extension TLV under the vendor OUI.
    pub fn vendor(subtype: [u8; 3], data: &[u8]) -> Self {
        let mut value = Vec::with_capacity(6 + data.len());
        value.extend_from_slice(&VENDOR_OUI);
        value.extend_from_slice(&subtype);
        value.extend_from_slice(data);
        Self {
            tlv_type: TLV_ORGANIZATION_EXTENSION,
            value,
        }
    }

    /// Extract `(subtype, data)` if this is one of our vendor TLVs.
    pub fn as_vendor(&self) -> Option<([u8; 3], &[u8])> {
        if self.tlv_type != TLV_ORGANIZATION_EXTENSION || self.value.len() < 6 {
            return None;
        }
        if self.value[..3] != VENDOR_OUI {
            return None;
        }
        let mut subtype = [0u8; 3];
        subtype.copy_from_slice(&self.value[3..6]);
        Some((subtype, &self.value[6..]))
    }
}

/// MTIE report carried in the vendor TLV: window seconds, peak-to-peak ns.
pub fn encode_mtie_report(window_s: u32, mtie_ns: u32) -> Tlv {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&window_s.to_be_bytes());
    data.extend_from_slice(&mtie_ns.to_be_bytes());
    Tlv::vendor(VENDOR_SUBTYPE_MTIE, &data)
}

/// Slave status monitoring TLV: state tag, alarm word, offset ns (scaled).
pub fn encode_slave_status(state: u8, alarms: u32, offset_ns: i64) -> Tlv {
    let mut data = Vec::with_capacity(13);
    data.push(state);
    data.extend_from_slice(&alarms.to_be_bytes());
    data.extend_from_slice(&offset_ns.to_be_bytes());
    Tlv::vendor(VENDOR_SUBTYPE_SLAVE_STATUS, &data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(n: u16) -> PortIdentity {
        PortIdentity {
            clock_id: [0, 0x0f, 0x53, 0xff, 0xfe, 1, 2, 3],
            port: n,
        }
    }

    #[test]
    fn test_timestamp_round_trip() {
        for (sec, nsec) in [
            (0i64, 0i64),
            (1, 1),
            (1_700_000_000, 999_999_999),
            ((1i64 << 47) - 1, 500_000_000),
        ] {
            let ts = TimeSpec::new(sec, nsec);
            let wire = WireTimestamp::from_timespec(ts).unwrap();
            let mut buf = Vec::new();
            wire.encode(&mut buf);
            assert_eq!(buf.len(), WIRE_TS_LEN);
            let back = WireTimestamp::decode(&buf).unwrap();
            assert_eq!(back.to_timespec(), ts);
        }
    }

    #[test]
    fn test_timestamp_rejects_negative_and_oversized() {
        assert!(WireTimestamp::from_timespec(TimeSpec::from_ns(-1)).is_err());
        assert!(WireTimestamp::from_timespec(TimeSpec::new(1 << 50, 0)).is_err());
    }

    #[test]
    fn test_announce_round_trip() {
        let header = PtpHeader {
            flags: FLAG_TWO_STEP | FLAG_TIME_TRACEABLE,
            sequence_id: 0x1234,
            ..PtpHeader::new(MessageType::Announce, 0, port(1))
        };
        let body = AnnounceBody {
            origin: WireTimestamp::default(),
            utc_offset: 37,
            gm_priority1: 128,
            gm_quality: ClockQuality {
                class: 6,
                accuracy: 0x21,
                variance: 0x4e5d,
            },
            gm_priority2: 128,
            gm_identity: [1, 2, 3, 4, 5, 6, 7, 8],
            steps_removed: 2,
            time_source: 0x20,
        };
        let msg = PtpMessage::new(header, PtpBody::Announce(body));
        let bytes = msg.encode();
        assert_eq!(bytes.len(), HEADER_LEN + AnnounceBody::LEN);
        let back = PtpMessage::decode(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_sync_and_delay_resp_round_trip() {
        let ts = WireTimestamp {
            seconds: 1_700_000_123,
            nanoseconds: 456_789,
        };
        let sync = PtpMessage::new(
            PtpHeader::new(MessageType::Sync, 0, port(1)),
            PtpBody::Sync(ts),
        );
        assert_eq!(PtpMessage::decode(&sync.encode()).unwrap(), sync);

        let resp = PtpMessage::new(
            PtpHeader::new(MessageType::DelayResp, 0, port(1)),
            PtpBody::DelayResp {
                receive: ts,
                requestor: port(7),
            },
        );
        assert_eq!(PtpMessage::decode(&resp.encode()).unwrap(), resp);
    }

    #[test]
    fn test_vendor_tlv_round_trip() {
        let mut msg = PtpMessage::new(
            PtpHeader::new(MessageType::Announce, 0, port(1)),
            PtpBody::Announce(AnnounceBody::default()),
        );
        msg.tlvs.push(encode_mtie_report(60, 1500));
        msg.tlvs.push(encode_slave_status(9, 0x8, -250));
        let back = PtpMessage::decode(&msg.encode()).unwrap();
        assert_eq!(back.tlvs.len(), 2);
        let (subtype, data) = back.tlvs[0].as_vendor().unwrap();
        assert_eq!(subtype, VENDOR_SUBTYPE_MTIE);
        assert_eq!(&data[..4], &60u32.to_be_bytes());
        let (subtype, data) = back.tlvs[1].as_vendor().unwrap();
        assert_eq!(subtype, VENDOR_SUBTYPE_SLAVE_STATUS);
        assert_eq!(data[0], 9);
    }

    #[test]
    fn test_foreign_oui_not_ours() {
        let tlv = Tlv {
            tlv_type: TLV_ORGANIZATION_EXTENSION,
            value: vec![0xde, 0xad, 0xbe, 0, 0, 1, 42],
        };
        assert!(tlv.as_vendor().is_none());
    }

    #[test]
    fn test_accuracy_mapping_monotonic() {
        assert_eq!(accuracy_to_ns(0x1b), 100.0);
        assert_eq!(ns_to_accuracy(100.0), 0x1b);
        assert_eq!(ns_to_accuracy(101.0), 0x1c);
        assert_eq!(ns_to_accuracy(f64::INFINITY), 0xfe);
        let mut prev = 0.0;
        for code in 0x17u8..=0x2a {
            let ns = accuracy_to_ns(code);
            assert!(ns > prev);
            prev = ns;
        }
    }

    #[test]
    fn test_header_rejects_wrong_version() {
        let msg = PtpMessage::new(
            PtpHeader::new(MessageType::Sync, 0, port(1)),
            PtpBody::Sync(WireTimestamp::default()),
        );
        let mut bytes = msg.encode();
        bytes[1] = 1; // PTPv1
        assert!(PtpMessage::decode(&bytes).is_err());
    }
}
