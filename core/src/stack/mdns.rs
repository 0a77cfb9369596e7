//! mDNS responder with DNS-SD service advertisement
//!
//! Claims `<hostname>.local` on the link and answers for it, plus the
//! configured DNS-SD service. Claiming follows RFC 6762: three queries for
//! the name 250 ms apart carrying our address as a proposed record, then
//! two announcements one second apart. If another host already answers
//! for the name, or claims it at the same time with a greater address,
//! the responder moves on to `<hostname>-N` and claims again.
//!
//! The codec only understands what a responder needs: questions, and the
//! A records in answer and authority sections. Other records are skipped.

use core::fmt::Write as _;

use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::socket::udp;
use smoltcp::time::{Duration as SmolDuration, Instant as SmolInstant};
use smoltcp::wire::{IpAddress, IpEndpoint};

use crate::config::{DnsSdService, MdnsConfig};

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP: [u8; 4] = [224, 0, 0, 251];

/// Largest message sent or accepted
pub const MAX_MESSAGE: usize = 1500;
pub const MAX_LABEL: usize = 63;
const MAX_NAME: usize = 255;
const MAX_QUESTIONS: usize = 4;

const PACKETS: usize = 4;
const BUFFER: usize = 2048;

const CLAIM_QUERIES: u8 = 3;
const CLAIM_INTERVAL: SmolDuration = SmolDuration::from_millis(250);
const ANNOUNCEMENTS: u8 = 2;
const ANNOUNCE_INTERVAL: SmolDuration = SmolDuration::from_millis(1000);

const HOST_TTL: u32 = 120;
const SERVICE_TTL: u32 = 4500;
/// TTL cap for resolvers that query from a port other than 5353
const LEGACY_TTL: u32 = 10;

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const TYPE_PTR: u16 = 12;
const TYPE_TXT: u16 = 16;
const TYPE_SRV: u16 = 33;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;
const CLASS_ANY: u16 = 255;
/// Top bit of the class: cache-flush on records, unicast-response on questions
const CLASS_TOP: u16 = 0x8000;
const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const OPCODE_MASK: u16 = 0x7800;

const SERVICES_META: &str = "_services._dns-sd._udp.local";

type Name = heapless::String<MAX_NAME>;
pub type HostLabel = heapless::String<MAX_LABEL>;

/// UDP buffers for the responder socket
pub(crate) struct MdnsBuffers {
    rx_meta: [udp::PacketMetadata; PACKETS],
    rx: [u8; BUFFER],
    tx_meta: [udp::PacketMetadata; PACKETS],
    tx: [u8; BUFFER],
}

impl MdnsBuffers {
    pub(crate) const fn new() -> Self {
        Self {
            rx_meta: [udp::PacketMetadata::EMPTY; PACKETS],
            rx: [0; BUFFER],
            tx_meta: [udp::PacketMetadata::EMPTY; PACKETS],
            tx: [0; BUFFER],
        }
    }

    pub(crate) fn socket(&'static mut self) -> udp::Socket<'static> {
        let Self {
            rx_meta,
            rx,
            tx_meta,
            tx,
        } = self;
        udp::Socket::new(
            udp::PacketBuffer::new(&mut rx_meta[..], &mut rx[..]),
            udp::PacketBuffer::new(&mut tx_meta[..], &mut tx[..]),
        )
    }
}

/// Responder bound to its UDP socket
pub(crate) struct Mdns {
    handle: SocketHandle,
    responder: Responder,
}

impl Mdns {
    pub(crate) fn new(handle: SocketHandle, config: MdnsConfig) -> Self {
        Self {
            handle,
            responder: Responder::new(config),
        }
    }

    pub(crate) fn hostname(&self) -> Option<&HostLabel> {
        self.responder.hostname()
    }

    /// Serve queued queries and timers; true if anything was sent
    pub(crate) fn step(
        &mut self,
        iface: &Interface,
        sockets: &mut SocketSet<'static>,
        now: SmolInstant,
    ) -> bool {
        self.responder
            .set_address(iface.ipv4_addr().map(|addr| addr.octets()), now);

        let socket = sockets.get_mut::<udp::Socket>(self.handle);
        let mut packet = [0u8; MAX_MESSAGE];
        let mut reply = [0u8; MAX_MESSAGE];
        let mut sent = false;

        loop {
            let (len, meta) = match socket.recv_slice(&mut packet) {
                Ok(received) => received,
                Err(udp::RecvError::Truncated) => continue,
                Err(udp::RecvError::Exhausted) => break,
            };
            let from = meta.endpoint;
            if let Some((n, to)) =
                self.responder
                    .on_packet(&packet[..len], from.port, now, &mut reply)
            {
                let to = match to {
                    Destination::Group => group_endpoint(),
                    Destination::Querier => from,
                };
                sent |= send(socket, &reply[..n], to);
            }
        }

        if let Some(n) = self.responder.on_timer(now, &mut reply) {
            sent |= send(socket, &reply[..n], group_endpoint());
        }
        sent
    }
}

fn group_endpoint() -> IpEndpoint {
    let [a, b, c, d] = MDNS_GROUP;
    IpEndpoint::new(IpAddress::v4(a, b, c, d), MDNS_PORT)
}

fn send(socket: &mut udp::Socket<'static>, data: &[u8], to: IpEndpoint) -> bool {
    match socket.send_slice(data, to) {
        Ok(()) => true,
        Err(_) => {
            warn!("mDNS: transmit queue full, message dropped");
            false
        }
    }
}

/// Where a reply goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Destination {
    Group,
    /// Straight back to the sender (legacy unicast resolvers)
    Querier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No address yet
    Idle,
    Claiming { sent: u8, next: SmolInstant },
    Announcing { sent: u8, next: SmolInstant },
    Claimed,
}

/// How records are written into a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Multicast,
    /// Proposed records in the authority section of a claim query
    Proposal,
    Legacy,
}

/// Set of records this host owns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Records(u8);

impl Records {
    const A: Self = Self(1);
    const PTR: Self = Self(2);
    const SRV: Self = Self(4);
    const TXT: Self = Self(8);
    const META: Self = Self(16);

    fn has(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// One record per member
    fn count(self) -> u16 {
        self.0.count_ones() as u16
    }
}

/// Name claiming and query answering, independent of the socket
pub(crate) struct Responder {
    config: MdnsConfig,
    conflicts: u32,
    host: HostLabel,
    address: Option<[u8; 4]>,
    phase: Phase,
}

impl Responder {
    pub(crate) fn new(config: MdnsConfig) -> Self {
        Self {
            host: host_label(config.hostname, 0),
            config,
            conflicts: 0,
            address: None,
            phase: Phase::Idle,
        }
    }

    /// Host label once it has been claimed
    pub(crate) fn hostname(&self) -> Option<&HostLabel> {
        match self.phase {
            Phase::Announcing { .. } | Phase::Claimed => Some(&self.host),
            Phase::Idle | Phase::Claiming { .. } => None,
        }
    }

    /// Track the interface address; a new address starts a new claim
    pub(crate) fn set_address(&mut self, address: Option<[u8; 4]>, now: SmolInstant) {
        if address == self.address {
            return;
        }
        self.address = address;
        self.phase = match address {
            Some(_) => {
                info!("mDNS: claiming {}.local", self.host.as_str());
                Phase::Claiming { sent: 0, next: now }
            }
            None => Phase::Idle,
        };
    }

    /// Claim queries and announcements that are due, always multicast
    pub(crate) fn on_timer(&mut self, now: SmolInstant, out: &mut [u8]) -> Option<usize> {
        let address = self.address?;
        match self.phase {
            Phase::Claiming { sent, next } if now >= next => {
                if sent == CLAIM_QUERIES {
                    info!("mDNS: claimed {}.local", self.host.as_str());
                    self.phase = Phase::Announcing { sent: 0, next: now };
                    return self.on_timer(now, out);
                }
                self.phase = Phase::Claiming {
                    sent: sent + 1,
                    next: now + CLAIM_INTERVAL,
                };
                self.claim_query(address, out).ok()
            }
            Phase::Announcing { sent, next } if now >= next => {
                if sent == ANNOUNCEMENTS {
                    self.phase = Phase::Claimed;
                    return None;
                }
                self.phase = Phase::Announcing {
                    sent: sent + 1,
                    next: now + ANNOUNCE_INTERVAL,
                };
                let records = self.owned_records();
                self.response(out, 0, &[], records, Records::default(), address, Style::Multicast)
                    .ok()
            }
            _ => None,
        }
    }

    /// Handle one received message, returning the reply to send if any
    pub(crate) fn on_packet(
        &mut self,
        packet: &[u8],
        src_port: u16,
        now: SmolInstant,
        out: &mut [u8],
    ) -> Option<(usize, Destination)> {
        let address = self.address?;
        if self.phase == Phase::Idle {
            return None;
        }
        let header = Header::parse(packet)?;
        if header.flags & OPCODE_MASK != 0 {
            return None;
        }
        let mut reader = Reader::new(packet, HEADER_LEN);

        if header.flags & FLAG_RESPONSE != 0 {
            if self.answered_by_other(&header, &mut reader, address) {
                self.rename(now);
            }
            return None;
        }

        let mut questions: heapless::Vec<Question, MAX_QUESTIONS> = heapless::Vec::new();
        for _ in 0..header.questions {
            let question = reader.question()?;
            // Extra questions are read past but left unanswered
            let _ = questions.push(question);
        }

        if let Phase::Claiming { .. } = self.phase {
            let contested = questions.iter().any(|q| self.is_host(&q.name));
            if contested && self.loses_tiebreak(&header, &mut reader, address) {
                self.rename(now);
            }
            return None;
        }

        let mut answers = Records::default();
        let mut answered: heapless::Vec<Question, MAX_QUESTIONS> = heapless::Vec::new();
        for question in questions {
            let records = self.matching(&question);
            if !records.is_empty() {
                answers = answers.with(records);
                let _ = answered.push(question);
            }
        }
        if answers.is_empty() {
            return None;
        }
        let additional = self.additional_for(answers).without(answers);

        if src_port == MDNS_PORT {
            let len = self
                .response(out, 0, &[], answers, additional, address, Style::Multicast)
                .ok()?;
            Some((len, Destination::Group))
        } else {
            let len = self
                .response(out, header.id, &answered, answers, additional, address, Style::Legacy)
                .ok()?;
            Some((len, Destination::Querier))
        }
    }

    fn rename(&mut self, now: SmolInstant) {
        self.conflicts += 1;
        let taken = core::mem::replace(
            &mut self.host,
            host_label(self.config.hostname, self.conflicts),
        );
        warn!(
            "mDNS: {}.local is taken, claiming {}.local",
            taken.as_str(),
            self.host.as_str()
        );
        self.phase = Phase::Claiming {
            sent: 0,
            next: now + CLAIM_INTERVAL,
        };
    }

    fn host_name(&self) -> Name {
        join(&[self.host.as_str(), "local"])
    }

    fn is_host(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.host_name())
    }

    fn owned_records(&self) -> Records {
        match self.config.service {
            Some(_) => Records::A
                .with(Records::PTR)
                .with(Records::SRV)
                .with(Records::TXT)
                .with(Records::META),
            None => Records::A,
        }
    }

    fn matching(&self, question: &Question) -> Records {
        let class = question.qclass & !CLASS_TOP;
        if class != CLASS_IN && class != CLASS_ANY {
            return Records::default();
        }
        let wants = |qtype| question.qtype == TYPE_ANY || question.qtype == qtype;
        let name = question.name.as_str();
        let mut records = Records::default();

        if self.is_host(name) && wants(TYPE_A) {
            records = records.with(Records::A);
        }
        if let Some(service) = &self.config.service {
            if name.eq_ignore_ascii_case(&service_type(service)) && wants(TYPE_PTR) {
                records = records.with(Records::PTR);
            }
            if name.eq_ignore_ascii_case(&instance_name(service)) {
                if wants(TYPE_SRV) {
                    records = records.with(Records::SRV);
                }
                if wants(TYPE_TXT) {
                    records = records.with(Records::TXT);
                }
            }
            if name.eq_ignore_ascii_case(SERVICES_META) && wants(TYPE_PTR) {
                records = records.with(Records::META);
            }
        }
        records
    }

    fn additional_for(&self, answers: Records) -> Records {
        let mut extra = Records::default();
        if answers.has(Records::PTR) {
            extra = extra.with(Records::SRV).with(Records::TXT).with(Records::A);
        }
        if answers.has(Records::SRV) {
            extra = extra.with(Records::A);
        }
        extra
    }

    /// A response carrying our name with someone else's address
    fn answered_by_other(
        &self,
        header: &Header,
        reader: &mut Reader<'_>,
        address: [u8; 4],
    ) -> bool {
        for _ in 0..header.questions {
            if reader.question().is_none() {
                return false;
            }
        }
        let records =
            u32::from(header.answers) + u32::from(header.authority) + u32::from(header.additional);
        for _ in 0..records {
            let Some(record) = reader.record() else {
                return false;
            };
            // TTL 0 is a goodbye, not a claim
            if record.is_a()
                && record.ttl > 0
                && self.is_host(&record.name)
                && record.rdata != address
            {
                return true;
            }
        }
        false
    }

    /// Simultaneous claim: the greater proposed address keeps the name
    fn loses_tiebreak(&self, header: &Header, reader: &mut Reader<'_>, address: [u8; 4]) -> bool {
        for _ in 0..header.answers {
            if reader.record().is_none() {
                return false;
            }
        }
        for _ in 0..header.authority {
            let Some(record) = reader.record() else {
                return false;
            };
            if record.is_a()
                && self.is_host(&record.name)
                && record.rdata > address.as_slice()
            {
                return true;
            }
        }
        false
    }

    fn claim_query(&self, address: [u8; 4], out: &mut [u8]) -> Result<usize, Overflow> {
        let mut w = Writer::new(out);
        w.header(0, 0, [1, 0, 1, 0])?;
        w.name(&self.host_name())?;
        w.u16(TYPE_ANY)?;
        w.u16(CLASS_IN | CLASS_TOP)?;
        self.write_records(&mut w, Records::A, address, Style::Proposal)?;
        Ok(w.len)
    }

    #[allow(clippy::too_many_arguments)]
    fn response(
        &self,
        out: &mut [u8],
        id: u16,
        echoed: &[Question],
        answers: Records,
        additional: Records,
        address: [u8; 4],
        style: Style,
    ) -> Result<usize, Overflow> {
        let mut w = Writer::new(out);
        w.header(
            id,
            FLAG_RESPONSE | FLAG_AUTHORITATIVE,
            [echoed.len() as u16, answers.count(), 0, additional.count()],
        )?;
        for question in echoed {
            w.name(&question.name)?;
            w.u16(question.qtype)?;
            w.u16(question.qclass & !CLASS_TOP)?;
        }
        self.write_records(&mut w, answers, address, style)?;
        self.write_records(&mut w, additional, address, style)?;
        Ok(w.len)
    }

    fn write_records(
        &self,
        w: &mut Writer<'_>,
        records: Records,
        address: [u8; 4],
        style: Style,
    ) -> Result<(), Overflow> {
        let unique = match style {
            Style::Multicast => CLASS_IN | CLASS_TOP,
            Style::Proposal | Style::Legacy => CLASS_IN,
        };
        let ttl = |ttl: u32| match style {
            Style::Legacy => ttl.min(LEGACY_TTL),
            Style::Multicast | Style::Proposal => ttl,
        };
        let host = self.host_name();

        if records.has(Records::A) {
            let at = w.record_start(&host, TYPE_A, unique, ttl(HOST_TTL))?;
            w.bytes(&address)?;
            w.record_end(at)?;
        }
        let Some(service) = &self.config.service else {
            return Ok(());
        };
        let kind = service_type(service);
        let instance = instance_name(service);

        if records.has(Records::PTR) {
            let at = w.record_start(&kind, TYPE_PTR, CLASS_IN, ttl(SERVICE_TTL))?;
            w.name(&instance)?;
            w.record_end(at)?;
        }
        if records.has(Records::SRV) {
            let at = w.record_start(&instance, TYPE_SRV, unique, ttl(HOST_TTL))?;
            // Priority, weight
            w.u16(0)?;
            w.u16(0)?;
            w.u16(service.port)?;
            w.name(&host)?;
            w.record_end(at)?;
        }
        if records.has(Records::TXT) {
            let at = w.record_start(&instance, TYPE_TXT, unique, ttl(SERVICE_TTL))?;
            if service.txt.is_empty() {
                w.bytes(&[0])?;
            }
            for entry in service.txt {
                let len = u8::try_from(entry.len()).map_err(|_| Overflow)?;
                w.bytes(&[len])?;
                w.bytes(entry.as_bytes())?;
            }
            w.record_end(at)?;
        }
        if records.has(Records::META) {
            let at = w.record_start(SERVICES_META, TYPE_PTR, CLASS_IN, ttl(SERVICE_TTL))?;
            w.name(&kind)?;
            w.record_end(at)?;
        }
        Ok(())
    }
}

/// `base`, or `base-N` after `n` conflicts, within one DNS label
fn host_label(base: &str, n: u32) -> HostLabel {
    // Leave room for "-4294967295"
    let room = if n == 0 { MAX_LABEL } else { MAX_LABEL - 11 };
    let mut label = HostLabel::new();
    for c in base.chars() {
        if label.len() + c.len_utf8() > room || label.push(c).is_err() {
            break;
        }
    }
    if n > 0 {
        let _ = write!(label, "-{}", n);
    }
    label
}

fn join(parts: &[&str]) -> Name {
    let mut name = Name::new();
    for part in parts {
        if !name.is_empty() {
            let _ = name.push('.');
        }
        let _ = name.push_str(part);
    }
    name
}

fn service_type(service: &DnsSdService) -> Name {
    join(&[service.service, service.protocol.label(), "local"])
}

fn instance_name(service: &DnsSdService) -> Name {
    join(&[
        service.instance,
        service.service,
        service.protocol.label(),
        "local",
    ])
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    id: u16,
    flags: u16,
    questions: u16,
    answers: u16,
    authority: u16,
    additional: u16,
}

impl Header {
    fn parse(packet: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(packet, 0);
        Some(Self {
            id: reader.u16()?,
            flags: reader.u16()?,
            questions: reader.u16()?,
            answers: reader.u16()?,
            authority: reader.u16()?,
            additional: reader.u16()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Question {
    name: Name,
    qtype: u16,
    qclass: u16,
}

#[derive(Debug)]
struct Record<'p> {
    name: Name,
    rtype: u16,
    class: u16,
    ttl: u32,
    rdata: &'p [u8],
}

impl Record<'_> {
    fn is_a(&self) -> bool {
        self.rtype == TYPE_A && self.class & !CLASS_TOP == CLASS_IN
    }
}

struct Reader<'p> {
    packet: &'p [u8],
    pos: usize,
}

impl<'p> Reader<'p> {
    fn new(packet: &'p [u8], pos: usize) -> Self {
        Self { packet, pos }
    }

    fn take(&mut self, n: usize) -> Option<&'p [u8]> {
        let bytes = self.packet.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(bytes)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Dotted name, following compression pointers
    fn name(&mut self) -> Option<Name> {
        let mut name = Name::new();
        let mut pos = self.pos;
        let mut jumps = 0;
        let mut resume = None;
        loop {
            let len = *self.packet.get(pos)?;
            match len & 0xC0 {
                0x00 if len == 0 => {
                    pos += 1;
                    break;
                }
                0x00 => {
                    let start = pos + 1;
                    let label = self.packet.get(start..start + usize::from(len))?;
                    if !name.is_empty() {
                        name.push('.').ok()?;
                    }
                    for &b in label {
                        name.push(char::from(b)).ok()?;
                    }
                    pos = start + usize::from(len);
                }
                0xC0 => {
                    let low = *self.packet.get(pos + 1)?;
                    if resume.is_none() {
                        resume = Some(pos + 2);
                    }
                    jumps += 1;
                    if jumps > 16 {
                        return None;
                    }
                    pos = usize::from(u16::from_be_bytes([len & 0x3F, low]));
                }
                _ => return None,
            }
        }
        self.pos = resume.unwrap_or(pos);
        Some(name)
    }

    fn question(&mut self) -> Option<Question> {
        Some(Question {
            name: self.name()?,
            qtype: self.u16()?,
            qclass: self.u16()?,
        })
    }

    fn record(&mut self) -> Option<Record<'p>> {
        let name = self.name()?;
        let rtype = self.u16()?;
        let class = self.u16()?;
        let ttl = self.u32()?;
        let len = self.u16()?;
        let rdata = self.take(usize::from(len))?;
        Some(Record {
            name,
            rtype,
            class,
            ttl,
            rdata,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Overflow;

struct Writer<'b> {
    buf: &'b mut [u8],
    len: usize,
}

impl<'b> Writer<'b> {
    fn new(buf: &'b mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    fn bytes(&mut self, data: &[u8]) -> Result<(), Overflow> {
        let end = self.len + data.len();
        self.buf
            .get_mut(self.len..end)
            .ok_or(Overflow)?
            .copy_from_slice(data);
        self.len = end;
        Ok(())
    }

    fn u16(&mut self, value: u16) -> Result<(), Overflow> {
        self.bytes(&value.to_be_bytes())
    }

    fn u32(&mut self, value: u32) -> Result<(), Overflow> {
        self.bytes(&value.to_be_bytes())
    }

    fn header(&mut self, id: u16, flags: u16, counts: [u16; 4]) -> Result<(), Overflow> {
        self.u16(id)?;
        self.u16(flags)?;
        counts.iter().try_for_each(|count| self.u16(*count))
    }

    /// Uncompressed name from dotted text
    fn name(&mut self, name: &str) -> Result<(), Overflow> {
        for label in name.split('.').filter(|label| !label.is_empty()) {
            let len = u8::try_from(label.len())
                .ok()
                .filter(|len| usize::from(*len) <= MAX_LABEL)
                .ok_or(Overflow)?;
            self.bytes(&[len])?;
            self.bytes(label.as_bytes())?;
        }
        self.bytes(&[0])
    }

    /// Record header with a zero length; returns where the length goes
    fn record_start(
        &mut self,
        name: &str,
        rtype: u16,
        class: u16,
        ttl: u32,
    ) -> Result<usize, Overflow> {
        self.name(name)?;
        self.u16(rtype)?;
        self.u16(class)?;
        self.u32(ttl)?;
        let at = self.len;
        self.u16(0)?;
        Ok(at)
    }

    fn record_end(&mut self, at: usize) -> Result<(), Overflow> {
        let rdlen = u16::try_from(self.len - at - 2).map_err(|_| Overflow)?;
        self.buf
            .get_mut(at..at + 2)
            .ok_or(Overflow)?
            .copy_from_slice(&rdlen.to_be_bytes());
        Ok(())
    }
}
