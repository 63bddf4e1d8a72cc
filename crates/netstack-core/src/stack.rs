//! The top-level stack: owns every subsystem and is the only place that
//! wires them together — netif queues, ARP cache, route table, fragment
//! reassembly, the three socket tables, and the TCP control blocks.
//!
//! Only the worker thread (see [`crate::exmsg::run`]) ever calls into
//! `Stack`. Driver threads post raw frames to a netif's queue and notify the
//! worker through the shared [`crate::exmsg::Inbox`]; application threads do
//! the same for socket calls, then block on their own `WaitObject` clone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::arp::{ArpCache, ArpPacket, InputOutcome, Opcode, Resolution};
use crate::config::NetConfig;
use crate::error::{NetError, NetResult};
use crate::ether::{self, EthHeader};
use crate::icmpv4;
use crate::ipaddr::IpAddr;
use crate::ipv4::{self, IdGenerator, Ipv4Header, ReassemblyTable, RouteTable, DEFAULT_TTL};
use crate::mblock::Timeout;
use crate::netif::{Netif, NetifId};
use crate::pktbuf::{PktBuf, PktBufPool};
use crate::raw::{RawDatagram, RawSock};
use crate::sock::{Protocol, SockOpt};
use crate::socket::{apply_common_opt, FdTable, Slab, SockKind};
use crate::tcp::input as tcp_input;
use crate::tcp::output as tcp_output;
use crate::tcp::state::Action;
use crate::tcp::tcb::{Tcb, TcbId, TcpState};
use crate::tcp::{self, Segment, TcpHeader};
use crate::timer::{TimerId, TimerList};
use crate::udp::{Datagram, UdpHeader, UdpSock};

const ARP_AGING_PERIOD_MS: u64 = 1000;
const RETRANSMIT_INTERVAL_MS: u64 = 500;
const RETRANSMIT_MAX_RETRIES: u32 = 6;
const TIME_WAIT_MS: u64 = 60_000; // 2*MSL, MSL taken as the RFC 793 suggested 30s

enum TimerKind {
    ArpAging,
    FragAging,
    TcpRetransmit(TcbId),
    TcpKeepalive(TcbId),
    TcpTimeWait(TcbId),
}

pub struct Stack {
    cfg: NetConfig,
    pool: Arc<PktBufPool>,
    netifs: Vec<Netif>,
    arp: ArpCache,
    routes: RouteTable,
    reassembly: ReassemblyTable,
    ip_ids: IdGenerator,
    iss_counter: AtomicU32,
    timers: TimerList,
    timer_kinds: HashMap<TimerId, TimerKind>,
    raw_socks: Slab<RawSock>,
    udp_socks: Slab<UdpSock>,
    tcp_tcbs: Slab<Tcb>,
    fds: FdTable,
}

impl Stack {
    pub fn new(cfg: NetConfig) -> Stack {
        let pool = PktBufPool::new(&cfg);
        let arp = ArpCache::new(&cfg);
        let reassembly = ReassemblyTable::new(&cfg);
        let raw_socks = Slab::new(cfg.raw_sock_count);
        let udp_socks = Slab::new(cfg.udp_sock_count);
        let tcp_tcbs = Slab::new(cfg.tcp_sock_count);
        let mut timers = TimerList::new();
        let mut timer_kinds = HashMap::new();
        let arp_timer = timers.insert("arp-aging", ARP_AGING_PERIOD_MS, true);
        timer_kinds.insert(arp_timer, TimerKind::ArpAging);
        let frag_timer = timers.insert("ip-frag-aging", cfg.ip_frag_scan_period_s as u64 * 1000, true);
        timer_kinds.insert(frag_timer, TimerKind::FragAging);

        Stack {
            cfg,
            pool,
            netifs: Vec::new(),
            arp,
            routes: RouteTable::new(),
            reassembly,
            ip_ids: IdGenerator::new(),
            iss_counter: AtomicU32::new(1),
            timers,
            timer_kinds,
            raw_socks,
            udp_socks,
            tcp_tcbs,
            fds: FdTable::new(cfg_fd_capacity()),
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.cfg
    }

    pub fn pool(&self) -> &Arc<PktBufPool> {
        &self.pool
    }

    pub fn add_netif(&mut self, netif: Netif) -> NetifId {
        self.netifs.push(netif);
        self.netifs.len() - 1
    }

    pub fn netif_mut(&mut self, id: NetifId) -> Option<&mut Netif> {
        self.netifs.get_mut(id)
    }

    pub fn route_table_mut(&mut self) -> &mut RouteTable {
        &mut self.routes
    }

    /// Transitions a netif from `opened` to `active`: announces its address
    /// with a gratuitous ARP and installs the connected route for
    /// `ip & mask / mask`. Mirrors the original's `netif_set_active`.
    pub fn netif_set_active(&mut self, netif_id: NetifId) -> NetResult<()> {
        let nif = self.netifs.get_mut(netif_id).ok_or(NetError::None)?;
        nif.state = crate::netif::NetifState::Active;
        let (net, mask) = (nif.ipaddr.network(nif.netmask), nif.netmask);
        self.routes.add(net, mask, IpAddr::ANY, netif_id);
        self.send_gratuitous_arp(netif_id);
        Ok(())
    }

    /// Reverses `netif_set_active`: withdraws the connected route and ages
    /// out every ARP entry the netif owns. Mirrors `netif_set_deactive`.
    pub fn netif_set_deactive(&mut self, netif_id: NetifId) -> NetResult<()> {
        let nif = self.netifs.get_mut(netif_id).ok_or(NetError::None)?;
        nif.state = crate::netif::NetifState::Opened;
        let (net, mask) = (nif.ipaddr.network(nif.netmask), nif.netmask);
        self.routes.remove(net, mask);
        self.arp.clear_netif(netif_id);
        Ok(())
    }

    /// Tears a netif down: drains its queues, closes the driver, and ages
    /// out every ARP entry it owned (same cache-clearing `netif_close` does
    /// in the original, beyond what `netif_set_deactive` already withdraws).
    pub fn netif_close(&mut self, netif_id: NetifId) {
        if let Some(nif) = self.netifs.get_mut(netif_id) {
            nif.close();
        }
        self.arp.clear_netif(netif_id);
    }

    fn send_gratuitous_arp(&mut self, netif_id: NetifId) {
        let Some(nif) = self.netifs.get(netif_id) else { return };
        let pkt = ArpPacket::gratuitous(nif.hwaddr, nif.ipaddr);
        self.send_frame(netif_id, ether::BROADCAST, ether::ETHERTYPE_ARP, &pkt.encode());
    }

    // ------------------------------------------------------------------
    // Timer tick
    // ------------------------------------------------------------------

    pub fn on_timer_tick(&mut self, elapsed_ms: u64) {
        for id in self.timers.advance(elapsed_ms) {
            let kind = match self.timer_kinds.get(&id) {
                Some(TimerKind::ArpAging) => {
                    for (netif, ip) in self.arp.on_timer() {
                        self.send_arp_request(netif, ip);
                    }
                    continue;
                }
                Some(TimerKind::FragAging) => {
                    self.reassembly.on_timer();
                    continue;
                }
                Some(&TimerKind::TcpRetransmit(tcb_id)) => TimerKind::TcpRetransmit(tcb_id),
                Some(&TimerKind::TcpKeepalive(tcb_id)) => TimerKind::TcpKeepalive(tcb_id),
                Some(&TimerKind::TcpTimeWait(tcb_id)) => TimerKind::TcpTimeWait(tcb_id),
                None => continue,
            };
            self.timer_kinds.remove(&id);
            match kind {
                TimerKind::TcpRetransmit(tcb_id) => self.handle_retransmit(tcb_id),
                TimerKind::TcpKeepalive(tcb_id) => self.handle_keepalive(tcb_id),
                TimerKind::TcpTimeWait(tcb_id) => self.reclaim_tcb(tcb_id),
                TimerKind::ArpAging | TimerKind::FragAging => unreachable!(),
            }
        }
    }

    // ------------------------------------------------------------------
    // Netif / Ethernet
    // ------------------------------------------------------------------

    pub fn drain_netif_in(&mut self, netif: NetifId) {
        loop {
            let frame = match self.netifs.get(netif).map(|n| n.get_in()) {
                Some(Ok(frame)) => frame,
                _ => break,
            };
            self.ether_in(netif, frame);
        }
    }

    fn ether_in(&mut self, netif: NetifId, frame: Vec<u8>) {
        let header = match EthHeader::decode(&frame) {
            Ok(h) => h,
            Err(_) => return,
        };
        let payload = &frame[ether::HEADER_LEN..];
        match header.ethertype {
            ether::ETHERTYPE_ARP => self.arp_in(netif, payload),
            ether::ETHERTYPE_IPV4 => self.ipv4_in(netif, payload),
            other => trace!(ethertype = other, "unsupported ethertype, dropping"),
        }
    }

    fn send_frame(&mut self, netif: NetifId, dst_mac: [u8; 6], ethertype: u16, payload: &[u8]) {
        let Some(nif) = self.netifs.get(netif) else { return };
        let header = EthHeader { dst: dst_mac, src: nif.hwaddr, ethertype };
        let frame = ether::build_frame(&header, payload);
        let _ = nif.put_out(frame);
    }

    fn send_arp_request(&mut self, netif: NetifId, target_ip: IpAddr) {
        let Some(nif) = self.netifs.get(netif) else { return };
        let pkt = ArpPacket::request(nif.hwaddr, nif.ipaddr, target_ip);
        self.send_frame(netif, ether::BROADCAST, ether::ETHERTYPE_ARP, &pkt.encode());
    }

    fn arp_in(&mut self, netif_id: NetifId, payload: &[u8]) {
        let Ok(pkt) = ArpPacket::decode(payload) else { return };
        let Some(nif) = self.netifs.get(netif_id) else { return };
        let local_ip = nif.ipaddr;
        let on_subnet = pkt.sender_ip.same_subnet(nif.ipaddr, nif.netmask);
        match self.arp.on_input(netif_id, &pkt, local_ip, on_subnet) {
            InputOutcome::None => {}
            InputOutcome::SendReply => {
                let Some(nif) = self.netifs.get(netif_id) else { return };
                let reply = ArpPacket::reply(nif.hwaddr, nif.ipaddr, pkt.sender_mac, pkt.sender_ip);
                self.send_frame(netif_id, pkt.sender_mac, ether::ETHERTYPE_ARP, &reply.encode());
            }
            InputOutcome::Flush(bufs) => {
                for buf in bufs {
                    let datagram = buf.to_vec();
                    self.send_frame(netif_id, pkt.sender_mac, ether::ETHERTYPE_IPV4, &datagram);
                }
            }
        }
    }

    /// Resolves `dst_ip` on `netif` and either sends `datagram` immediately
    /// or queues it pending ARP resolution.
    fn ether_out_ipv4(&mut self, netif_id: NetifId, dst_ip: IpAddr, datagram: Vec<u8>) -> NetResult<()> {
        let nif = self.netifs.get(netif_id).ok_or(NetError::None)?;
        if dst_ip.is_broadcast() || dst_ip.is_directed_broadcast(nif.ipaddr.network(nif.netmask), nif.netmask) {
            self.send_frame(netif_id, ether::BROADCAST, ether::ETHERTYPE_IPV4, &datagram);
            return Ok(());
        }
        let buf = PktBuf::alloc(&self.pool, datagram.len())?;
        buf.write(&datagram)?;
        match self.arp.resolve(netif_id, dst_ip, buf) {
            Resolution::Resolved(mac) => self.send_frame(netif_id, mac, ether::ETHERTYPE_IPV4, &datagram),
            Resolution::Queued { send_request } => {
                if send_request {
                    self.send_arp_request(netif_id, dst_ip);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // IPv4
    // ------------------------------------------------------------------

    /// Builds, fragments if needed, and transmits an IPv4 datagram carrying
    /// `payload` for `protocol` toward `dst_ip`.
    pub fn ipv4_out(&mut self, dst_ip: IpAddr, protocol: u8, payload: &[u8]) -> NetResult<()> {
        let route = self.routes.find(dst_ip).copied().ok_or(NetError::Unreach)?;
        let next_hop = if route.next_hop.is_any() { dst_ip } else { route.next_hop };
        let netif_id = route.netif;
        let (src_ip, mtu) = {
            let nif = self.netifs.get(netif_id).ok_or(NetError::None)?;
            (nif.ipaddr, nif.mtu)
        };
        let template = Ipv4Header {
            ihl_words: 5,
            tos: 0,
            total_len: 0,
            id: 0,
            more_fragments: false,
            frag_offset: 0,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src: src_ip,
            dst: dst_ip,
        };
        let id = self.ip_ids.next();
        for datagram in ipv4::fragment(payload, mtu, id, template) {
            self.ether_out_ipv4(netif_id, next_hop, datagram)?;
        }
        Ok(())
    }

    fn ipv4_in(&mut self, netif_id: NetifId, payload: &[u8]) {
        let Ok(header) = Ipv4Header::decode(payload) else { return };
        let header_len = header.header_len();
        if payload.len() < header.total_len as usize {
            return;
        }
        let Some(nif) = self.netifs.get(netif_id) else { return };
        let is_for_us = header.dst == nif.ipaddr
            || header.dst.is_broadcast()
            || header.dst.is_directed_broadcast(nif.ipaddr.network(nif.netmask), nif.netmask);
        if !is_for_us {
            return;
        }
        let body = &payload[header_len..header.total_len as usize];

        // Deliver to raw sockets regardless of fragmentation/reassembly state,
        // mirroring spec.md §4.9 (raw sees every inbound datagram once).
        self.deliver_raw(header.src, header.dst, header.protocol, &payload[..header.total_len as usize]);

        let complete = if header.more_fragments || header.frag_offset != 0 {
            self.reassembly
                .insert(header.src, header.id, header.frag_offset as usize * 8, body.to_vec(), header.more_fragments)
        } else {
            Some(body.to_vec())
        };
        let Some(full) = complete else { return };

        match header.protocol {
            ipv4::PROTO_ICMP => self.icmp_in(header.src, header.dst, &full),
            ipv4::PROTO_UDP => self.udp_in(header.src, header.dst, &full),
            ipv4::PROTO_TCP => self.tcp_in(header.src, header.dst, &full),
            other => trace!(protocol = other, "no transport handler, delivered to raw sockets only"),
        }
    }

    fn deliver_raw(&mut self, src: IpAddr, dst: IpAddr, protocol_num: u8, datagram: &[u8]) {
        let protocol = match protocol_num {
            ipv4::PROTO_ICMP => Protocol::Icmp,
            ipv4::PROTO_UDP => Protocol::Udp,
            ipv4::PROTO_TCP => Protocol::Tcp,
            _ => return,
        };
        let Ok(buf) = PktBuf::alloc(&self.pool, datagram.len()) else { return };
        if buf.write(datagram).is_err() {
            return;
        }
        for (_, sock) in self.raw_socks.iter_mut() {
            if sock.matches(protocol, dst) {
                sock.enqueue(RawDatagram { source_ip: src, ip_datagram: buf.inc_ref() });
            }
        }
    }

    // ------------------------------------------------------------------
    // ICMP
    // ------------------------------------------------------------------

    fn icmp_in(&mut self, src: IpAddr, _dst: IpAddr, datagram: &[u8]) {
        let Ok((header, body)) = crate::icmpv4::IcmpHeader::decode(datagram) else { return };
        if header.icmp_type == icmpv4::TYPE_ECHO_REQUEST {
            let reply = icmpv4::build_echo_reply(header.rest, body);
            let _ = self.ipv4_out(src, ipv4::PROTO_ICMP, &reply);
        }
    }

    fn send_port_unreachable(&mut self, src: IpAddr, offending_datagram: &[u8]) {
        let msg = icmpv4::build_unreachable(3, offending_datagram);
        let _ = self.ipv4_out(src, ipv4::PROTO_ICMP, &msg);
    }

    // ------------------------------------------------------------------
    // UDP
    // ------------------------------------------------------------------

    fn udp_in(&mut self, src: IpAddr, dst: IpAddr, full_datagram: &[u8]) {
        if UdpHeader::verify_checksum(full_datagram, src, dst).is_err() {
            return;
        }
        let Ok(header) = UdpHeader::decode(full_datagram) else { return };
        let body = &full_datagram[crate::udp::HEADER_LEN..header.total_len as usize];
        let mut delivered = false;
        for (_, sock) in self.udp_socks.iter_mut() {
            if sock.matches(dst, header.dst_port) {
                sock.enqueue(Datagram { source_ip: src, source_port: header.src_port, data: body.to_vec() });
                delivered = true;
                break;
            }
        }
        if !delivered {
            self.send_port_unreachable(src, full_datagram);
        }
    }

    pub fn udp_socket(&mut self) -> NetResult<crate::socket::Fd> {
        let idx = self.udp_socks.insert(UdpSock::new(self.cfg.udp_max_recv))?;
        self.fds.insert(SockKind::Udp(idx))
    }

    pub fn udp_bind(&mut self, fd: crate::socket::Fd, ip: IpAddr, port: u16) -> NetResult<()> {
        let idx = self.udp_idx(fd)?;
        let sock = self.udp_socks.get_mut(idx).ok_or(NetError::None)?;
        sock.base.local_ip = ip;
        sock.base.local_port = port;
        Ok(())
    }

    pub fn udp_sendto(&mut self, fd: crate::socket::Fd, dst: IpAddr, port: u16, data: &[u8]) -> NetResult<()> {
        let idx = self.udp_idx(fd)?;
        if self.udp_socks.get(idx).ok_or(NetError::None)?.base.local_port == 0 {
            let ephemeral = self.alloc_udp_ephemeral_port()?;
            self.udp_socks.get_mut(idx).ok_or(NetError::None)?.base.local_port = ephemeral;
        }
        let src_port = self.udp_socks.get(idx).ok_or(NetError::None)?.base.local_port;
        let route = self.routes.find(dst).copied().ok_or(NetError::Unreach)?;
        let src_ip = self.netifs.get(route.netif).ok_or(NetError::None)?.ipaddr;
        let seg = UdpHeader::build(src_ip, dst, src_port, port, data);
        self.ipv4_out(dst, ipv4::PROTO_UDP, &seg)
    }

    fn alloc_udp_ephemeral_port(&self) -> NetResult<u16> {
        crate::sock::alloc_ephemeral_port(|p| self.udp_socks.iter().any(|(_, s)| s.base.local_port == p), 1024)
    }

    fn alloc_tcp_ephemeral_port(&self) -> NetResult<u16> {
        crate::sock::alloc_ephemeral_port(|p| self.tcp_tcbs.iter().any(|(_, t)| t.base.local_port == p), 1024)
    }

    pub fn udp_recvfrom(&mut self, fd: crate::socket::Fd) -> NetResult<Datagram> {
        let idx = self.udp_idx(fd)?;
        self.udp_socks.get_mut(idx).ok_or(NetError::None)?.recv_from().ok_or(NetError::NeedWait)
    }

    pub fn udp_setopt(&mut self, fd: crate::socket::Fd, opt: SockOpt) -> NetResult<()> {
        let idx = self.udp_idx(fd)?;
        let sock = self.udp_socks.get_mut(idx).ok_or(NetError::None)?;
        if apply_common_opt(&mut sock.base, opt)? {
            Ok(())
        } else {
            sock.setopt(opt)
        }
    }

    fn udp_idx(&self, fd: crate::socket::Fd) -> NetResult<usize> {
        match self.fds.get(fd) {
            Some(SockKind::Udp(idx)) => Ok(idx),
            _ => Err(NetError::Param),
        }
    }

    // ------------------------------------------------------------------
    // Raw sockets
    // ------------------------------------------------------------------

    pub fn raw_socket(&mut self, protocol: Protocol) -> NetResult<crate::socket::Fd> {
        let idx = self.raw_socks.insert(RawSock::new(protocol, self.cfg.raw_max_recv))?;
        self.fds.insert(SockKind::Raw(idx))
    }

    pub fn raw_bind(&mut self, fd: crate::socket::Fd, ip: IpAddr) -> NetResult<()> {
        match self.fds.get(fd) {
            Some(SockKind::Raw(idx)) => {
                self.raw_socks.get_mut(idx).ok_or(NetError::None)?.base.local_ip = ip;
                Ok(())
            }
            _ => Err(NetError::Param),
        }
    }

    pub fn raw_recvfrom(&mut self, fd: crate::socket::Fd) -> NetResult<RawDatagram> {
        match self.fds.get(fd) {
            Some(SockKind::Raw(idx)) => self.raw_socks.get_mut(idx).ok_or(NetError::None)?.recv_from().ok_or(NetError::NeedWait),
            _ => Err(NetError::Param),
        }
    }

    // ------------------------------------------------------------------
    // TCP
    // ------------------------------------------------------------------

    fn find_tcb(&self, local_ip: IpAddr, local_port: u16, remote_ip: IpAddr, remote_port: u16) -> Option<TcbId> {
        self.tcp_tcbs
            .iter()
            .find(|(_, t)| {
                t.base.local_port == local_port
                    && t.base.remote_port == remote_port
                    && t.base.remote_ip == remote_ip
                    && (t.base.local_ip.is_any() || t.base.local_ip == local_ip)
            })
            .map(|(id, _)| id)
            .or_else(|| {
                self.tcp_tcbs
                    .iter()
                    .find(|(_, t)| {
                        t.state == TcpState::Listen
                            && t.base.local_port == local_port
                            && (t.base.local_ip.is_any() || t.base.local_ip == local_ip)
                    })
                    .map(|(id, _)| id)
            })
    }

    fn tcp_in(&mut self, src: IpAddr, dst: IpAddr, full_segment: &[u8]) {
        let Ok((header, data)) = TcpHeader::decode(full_segment, src, dst) else { return };
        let seg = Segment::new(dst, src, header, data.to_vec());

        let Some(tcb_id) = self.find_tcb(dst, seg.header.dst_port, src, seg.header.src_port) else {
            if !seg.header.flags.has(tcp::FLAG_RST) {
                let rst = tcp::reset_reply(&seg);
                let wire = rst.build(dst, src, &[]);
                let _ = self.ipv4_out(src, ipv4::PROTO_TCP, &wire);
            }
            return;
        };

        let was_listen = self.tcp_tcbs.get(tcb_id).map(|t| t.state == TcpState::Listen).unwrap_or(false);
        let action = {
            let Some(tcb) = self.tcp_tcbs.get_mut(tcb_id) else { return };
            tcp_input::dispatch(tcb, &seg)
        };

        self.apply_action(tcb_id, was_listen, &seg, action);
    }

    fn apply_action(&mut self, tcb_id: TcbId, on_listener: bool, seg: &Segment, action: Action) {
        match action {
            Action::None => {}
            Action::SendAck => self.tcp_transmit(tcb_id, tcp::FLAG_ACK),
            Action::SendRst => {
                let rst = tcp::reset_reply(seg);
                let wire = rst.build(seg.local_ip, seg.remote_ip, &[]);
                let _ = self.ipv4_out(seg.remote_ip, ipv4::PROTO_TCP, &wire);
            }
            Action::SendSynAck => self.tcp_transmit(tcb_id, tcp::FLAG_SYN | tcp::FLAG_ACK),
            Action::SpawnChild => self.spawn_child(tcb_id, seg),
            Action::PromoteToAcceptQueue => self.promote_to_accept_queue(tcb_id),
            Action::WakeConnEstablished => {
                if let Some(tcb) = self.tcp_tcbs.get(tcb_id) {
                    tcb.base.conn_wait.wake(Ok(()));
                }
                self.arm_retransmit(tcb_id);
            }
            Action::WakeRecv => {
                if let Some(tcb) = self.tcp_tcbs.get(tcb_id) {
                    tcb.base.rcv_wait.wake(Ok(()));
                }
                // Acknowledges whatever `rcv.nxt` just advanced past — without
                // this the sender sees no ACK for accepted data and retransmits
                // until it gives up (matches the bare ACK `tcp/input.rs`
                // already sends for out-of-window segments).
                self.tcp_transmit(tcb_id, tcp::FLAG_ACK);
            }
            Action::WakeSend => {
                if let Some(tcb) = self.tcp_tcbs.get(tcb_id) {
                    tcb.base.snd_wait.wake(Ok(()));
                }
            }
            Action::Abort(err) => self.abort_tcb(tcb_id, err),
            Action::EnterTimeWait => {
                self.tcp_transmit(tcb_id, tcp::FLAG_ACK);
                self.cancel_tcp_timers(tcb_id);
                let id = self.timers.insert("tcp-time-wait", TIME_WAIT_MS, false);
                self.timer_kinds.insert(id, TimerKind::TcpTimeWait(tcb_id));
                if let Some(tcb) = self.tcp_tcbs.get_mut(tcb_id) {
                    tcb.timers.time_wait = Some(id);
                }
            }
            Action::Reclaim => self.reclaim_tcb(tcb_id),
        }
        let _ = on_listener;
    }

    fn spawn_child(&mut self, parent_id: TcbId, seg: &Segment) {
        let ring_size = self.cfg.tcp_ring_size;
        let Some(parent) = self.tcp_tcbs.get(parent_id) else { return };
        let mut child = Tcb::new_child(parent_id, parent, ring_size);
        child.base.remote_ip = seg.remote_ip;
        child.base.remote_port = seg.header.src_port;
        child.rcv.irs = seg.header.seq;
        child.rcv.nxt = seg.header.seq.wrapping_add(1);
        if let Some(mss) = seg.header.mss {
            child.mss = child.mss.min(mss);
        }
        let iss = self.iss_counter.fetch_add(1, Ordering::Relaxed);
        child.snd.iss = iss;
        child.snd.una = iss;
        child.snd.nxt = iss;
        child.set_state(TcpState::SynRecvd);

        let Ok(child_id) = self.tcp_tcbs.insert(child) else {
            warn!("tcp tcb table exhausted, dropping incoming connection");
            return;
        };
        if let Some(parent) = self.tcp_tcbs.get_mut(parent_id) {
            parent.conn_backlog.push(child_id);
        }
        self.tcp_transmit(child_id, tcp::FLAG_SYN | tcp::FLAG_ACK);
    }

    fn promote_to_accept_queue(&mut self, child_id: TcbId) {
        let parent_id = match self.tcp_tcbs.get(child_id).and_then(|t| t.parent) {
            Some(p) => p,
            None => return,
        };
        self.arm_retransmit(child_id);
        if let Some(parent) = self.tcp_tcbs.get_mut(parent_id) {
            parent.conn_backlog.retain(|&id| id != child_id);
            parent.accept_queue.push_back(child_id);
            parent.base.conn_wait.wake(Ok(()));
        }
    }

    /// Builds and sends one segment for `tcb_id` carrying `flags`, using the
    /// peer's last-advertised window. A still-zero window (no ACK with a
    /// window value seen yet, e.g. the initial SYN) falls back to the MSS so
    /// the handshake itself isn't starved.
    fn tcp_transmit(&mut self, tcb_id: TcbId, flags: u8) {
        let (remote_ip, wire) = {
            let Some(tcb) = self.tcp_tcbs.get_mut(tcb_id) else { return };
            let local_ip = tcb.base.local_ip;
            let remote_ip = tcb.base.remote_ip;
            let peer_window = if tcb.snd.wnd == 0 { tcb.mss as u32 } else { tcb.snd.wnd };
            let wire = tcp_output::build_segment(tcb, local_ip, remote_ip, flags, peer_window);
            (remote_ip, wire)
        };
        let _ = self.ipv4_out(remote_ip, ipv4::PROTO_TCP, &wire);
    }

    fn arm_retransmit(&mut self, tcb_id: TcbId) {
        let id = self.timers.insert("tcp-retransmit", RETRANSMIT_INTERVAL_MS, false);
        self.timer_kinds.insert(id, TimerKind::TcpRetransmit(tcb_id));
        if let Some(tcb) = self.tcp_tcbs.get_mut(tcb_id) {
            tcb.timers.retransmit = Some(id);
            tcb.timers.retransmit_retries = 0;
        }
    }

    fn handle_retransmit(&mut self, tcb_id: TcbId) {
        let caught_up = self.tcp_tcbs.get(tcb_id).map(|t| t.send_caught_up()).unwrap_or(true);
        if caught_up {
            // Nothing outstanding — leave the timer unarmed; tcp_send/close
            // re-arms it the next time they put unacked data on the wire.
            if let Some(tcb) = self.tcp_tcbs.get_mut(tcb_id) {
                tcb.timers.retransmit = None;
            }
            return;
        }
        let retries = {
            let Some(tcb) = self.tcp_tcbs.get_mut(tcb_id) else { return };
            tcb.timers.retransmit_retries += 1;
            tcb.timers.retransmit_retries
        };
        if retries > RETRANSMIT_MAX_RETRIES {
            debug!(tcb = tcb_id, "retransmit limit exceeded, aborting connection");
            self.abort_tcb(tcb_id, NetError::Tmo);
            return;
        }
        if let Some(tcb) = self.tcp_tcbs.get_mut(tcb_id) {
            tcb.snd.nxt = tcb.snd.una;
        }
        self.tcp_transmit(tcb_id, tcp::FLAG_ACK);
        let id = self.timers.insert("tcp-retransmit", RETRANSMIT_INTERVAL_MS << retries.min(4), false);
        self.timer_kinds.insert(id, TimerKind::TcpRetransmit(tcb_id));
        if let Some(tcb) = self.tcp_tcbs.get_mut(tcb_id) {
            tcb.timers.retransmit = Some(id);
        }
    }

    fn handle_keepalive(&mut self, tcb_id: TcbId) {
        let snapshot = {
            let Some(tcb) = self.tcp_tcbs.get_mut(tcb_id) else { return };
            if !tcb.flags.keep_enable {
                return;
            }
            tcb.timers.keepalive_probes += 1;
            (tcb.timers.keepalive_probes, tcb.keep.cnt, tcb.keep.intvl_s, tcb.base.local_ip, tcb.base.remote_ip)
        };
        let (probes, cnt, intvl_s, local_ip, remote_ip) = snapshot;
        if probes > cnt {
            debug!(tcb = tcb_id, probes, cnt, "keepalive probe limit exceeded, aborting connection");
            self.abort_tcb(tcb_id, NetError::Tmo);
            return;
        }
        let id = self.timers.insert("tcp-keepalive", intvl_s as u64 * 1000, false);
        self.timer_kinds.insert(id, TimerKind::TcpKeepalive(tcb_id));
        let wire = {
            let Some(tcb) = self.tcp_tcbs.get_mut(tcb_id) else { return };
            tcb.timers.keepalive = Some(id);
            tcp_output::build_keepalive_probe(tcb, local_ip, remote_ip)
        };
        let _ = self.ipv4_out(remote_ip, ipv4::PROTO_TCP, &wire);
    }

    fn cancel_tcp_timers(&mut self, tcb_id: TcbId) {
        if let Some(tcb) = self.tcp_tcbs.get_mut(tcb_id) {
            for id in [tcb.timers.retransmit.take(), tcb.timers.keepalive.take(), tcb.timers.time_wait.take()].into_iter().flatten() {
                self.timers.cancel(id);
                self.timer_kinds.remove(&id);
            }
        }
    }

    fn abort_tcb(&mut self, tcb_id: TcbId, err: NetError) {
        self.cancel_tcp_timers(tcb_id);
        if let Some(tcb) = self.tcp_tcbs.get_mut(tcb_id) {
            tcb.base.last_error = Some(err);
            tcb.base.rcv_wait.wake(Err(err));
            tcb.base.snd_wait.wake(Err(err));
            tcb.base.conn_wait.wake(Err(err));
            tcb.set_state(TcpState::Closed);
        }
        self.reclaim_tcb(tcb_id);
    }

    fn reclaim_tcb(&mut self, tcb_id: TcbId) {
        self.cancel_tcp_timers(tcb_id);
        if let Some(tcb) = self.tcp_tcbs.remove(tcb_id) {
            if let Some(parent_id) = tcb.parent {
                if let Some(parent) = self.tcp_tcbs.get_mut(parent_id) {
                    parent.conn_backlog.retain(|&id| id != tcb_id);
                    parent.accept_queue.retain(|&id| id != tcb_id);
                }
            }
        }
    }

    pub fn tcp_socket(&mut self) -> NetResult<crate::socket::Fd> {
        let idx = self.tcp_tcbs.insert(Tcb::new(self.cfg.tcp_ring_size))?;
        self.fds.insert(SockKind::Tcp(idx))
    }

    fn tcp_idx(&self, fd: crate::socket::Fd) -> NetResult<TcbId> {
        match self.fds.get(fd) {
            Some(SockKind::Tcp(idx)) => Ok(idx),
            _ => Err(NetError::Param),
        }
    }

    pub fn tcp_bind(&mut self, fd: crate::socket::Fd, ip: IpAddr, port: u16) -> NetResult<()> {
        let idx = self.tcp_idx(fd)?;
        let tcb = self.tcp_tcbs.get_mut(idx).ok_or(NetError::None)?;
        tcb.base.local_ip = ip;
        tcb.base.local_port = port;
        Ok(())
    }

    pub fn tcp_listen(&mut self, fd: crate::socket::Fd) -> NetResult<()> {
        let idx = self.tcp_idx(fd)?;
        let tcb = self.tcp_tcbs.get_mut(idx).ok_or(NetError::None)?;
        tcb.set_state(TcpState::Listen);
        Ok(())
    }

    /// Starts an active open: sends the initial SYN and transitions to
    /// `SynSent`. The caller blocks on its `conn_wait` clone for the
    /// three-way handshake to complete.
    pub fn tcp_connect(&mut self, fd: crate::socket::Fd, dst_ip: IpAddr, dst_port: u16) -> NetResult<()> {
        let idx = self.tcp_idx(fd)?;
        let route = self.routes.find(dst_ip).copied().ok_or(NetError::Unreach)?;
        let src_ip = self.netifs.get(route.netif).ok_or(NetError::None)?.ipaddr;
        let iss = self.iss_counter.fetch_add(1, Ordering::Relaxed);
        let needs_port = self.tcp_tcbs.get(idx).ok_or(NetError::None)?.base.local_port == 0;
        let ephemeral = if needs_port { Some(self.alloc_tcp_ephemeral_port()?) } else { None };
        {
            let tcb = self.tcp_tcbs.get_mut(idx).ok_or(NetError::None)?;
            if tcb.base.local_ip.is_any() {
                tcb.base.local_ip = src_ip;
            }
            if let Some(port) = ephemeral {
                tcb.base.local_port = port;
            }
            tcb.base.remote_ip = dst_ip;
            tcb.base.remote_port = dst_port;
            tcb.snd.iss = iss;
            tcb.snd.una = iss;
            tcb.snd.nxt = iss;
            tcb.set_state(TcpState::SynSent);
        }
        self.tcp_transmit(idx, tcp::FLAG_SYN);
        self.arm_retransmit(idx);
        Ok(())
    }

    /// Pops one established child off a listener's accept queue, handing it
    /// a fresh descriptor. `Err(NetError::NeedWait)` means the caller should
    /// block on the listener's `conn_wait` and retry.
    pub fn tcp_accept(&mut self, fd: crate::socket::Fd) -> NetResult<crate::socket::Fd> {
        let idx = self.tcp_idx(fd)?;
        let child_id = {
            let tcb = self.tcp_tcbs.get_mut(idx).ok_or(NetError::None)?;
            tcb.accept_queue.pop_front().ok_or(NetError::NeedWait)?
        };
        self.fds.insert(SockKind::Tcp(child_id))
    }

    pub fn tcp_send(&mut self, fd: crate::socket::Fd, data: &[u8]) -> NetResult<usize> {
        let idx = self.tcp_idx(fd)?;
        let n = {
            let tcb = self.tcp_tcbs.get_mut(idx).ok_or(NetError::None)?;
            if !matches!(tcb.state, TcpState::Established | TcpState::CloseWait) {
                return Err(NetError::State);
            }
            tcb.send_buf.write(data)
        };
        if n > 0 {
            self.tcp_transmit(idx, tcp::FLAG_ACK);
            let has_timer = self.tcp_tcbs.get(idx).map(|t| t.timers.retransmit.is_some()).unwrap_or(false);
            if !has_timer {
                self.arm_retransmit(idx);
            }
        }
        Ok(n)
    }

    pub fn tcp_recv(&mut self, fd: crate::socket::Fd, max: usize) -> NetResult<Vec<u8>> {
        let idx = self.tcp_idx(fd)?;
        let tcb = self.tcp_tcbs.get_mut(idx).ok_or(NetError::None)?;
        let n = tcb.recv_buf.count().min(max);
        if n == 0 {
            return if matches!(tcb.state, TcpState::CloseWait | TcpState::Closed) {
                Ok(Vec::new()) // peer closed: EOF, not a wait condition
            } else {
                Err(NetError::NeedWait)
            };
        }
        let out = tcb.recv_buf.peek(0, n);
        tcb.recv_buf.remove(n);
        Ok(out)
    }

    pub fn tcp_close(&mut self, fd: crate::socket::Fd) -> NetResult<()> {
        let idx = self.tcp_idx(fd)?;
        self.fds.remove(fd);
        let state = self.tcp_tcbs.get(idx).map(|t| t.state);
        match state {
            Some(TcpState::Established) => {
                if let Some(tcb) = self.tcp_tcbs.get_mut(idx) {
                    tcb.set_state(TcpState::FinWait1);
                }
                self.tcp_transmit(idx, tcp::FLAG_ACK | tcp::FLAG_FIN);
                if self.tcp_tcbs.get(idx).map(|t| t.timers.retransmit.is_none()).unwrap_or(false) {
                    self.arm_retransmit(idx);
                }
                Ok(())
            }
            Some(TcpState::CloseWait) => {
                if let Some(tcb) = self.tcp_tcbs.get_mut(idx) {
                    tcb.set_state(TcpState::LastAck);
                }
                self.tcp_transmit(idx, tcp::FLAG_ACK | tcp::FLAG_FIN);
                if self.tcp_tcbs.get(idx).map(|t| t.timers.retransmit.is_none()).unwrap_or(false) {
                    self.arm_retransmit(idx);
                }
                Ok(())
            }
            Some(TcpState::Listen) | Some(TcpState::SynSent) => {
                self.reclaim_tcb(idx);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn tcp_setopt(&mut self, fd: crate::socket::Fd, opt: SockOpt) -> NetResult<()> {
        let idx = self.tcp_idx(fd)?;
        let tcb = self.tcp_tcbs.get_mut(idx).ok_or(NetError::None)?;
        if apply_common_opt(&mut tcb.base, opt)? {
            return Ok(());
        }
        match opt {
            SockOpt::KeepAlive(on) => {
                tcb.flags.keep_enable = on;
                if on {
                    tcb.timers.keepalive_probes = 0;
                    let id = self.timers.insert("tcp-keepalive", tcb.keep.idle_s as u64 * 1000, false);
                    self.timer_kinds.insert(id, TimerKind::TcpKeepalive(idx));
                    self.tcp_tcbs.get_mut(idx).ok_or(NetError::None)?.timers.keepalive = Some(id);
                }
                Ok(())
            }
            SockOpt::TcpKeepIdleS(s) => {
                tcb.keep.idle_s = s;
                Ok(())
            }
            SockOpt::TcpKeepIntvlS(s) => {
                tcb.keep.intvl_s = s;
                Ok(())
            }
            SockOpt::TcpKeepCnt(c) => {
                tcb.keep.cnt = c;
                Ok(())
            }
            _ => Err(NetError::NotSupport),
        }
    }
}

fn cfg_fd_capacity() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netif::{NetifDriver, NetifType};

    struct NullDriver;
    impl NetifDriver for NullDriver {
        fn open(&mut self) -> NetResult<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn mtu(&self) -> usize {
            1500
        }
    }

    fn stack_with_netif() -> (Stack, NetifId) {
        let mut stack = Stack::new(NetConfig::default());
        let mut netif = Netif::new("eth0", NetifType::Ether, Box::new(NullDriver), 16);
        netif.set_hwaddr([2, 0, 0, 0, 0, 1]);
        netif.set_addr(
            IpAddr::from_octets([10, 0, 0, 2]),
            IpAddr::from_octets([255, 255, 255, 0]),
            IpAddr::ANY,
        );
        let id = stack.add_netif(netif);
        stack.route_table_mut().add(
            IpAddr::from_octets([10, 0, 0, 0]),
            IpAddr::from_octets([255, 255, 255, 0]),
            IpAddr::ANY,
            id,
        );
        (stack, id)
    }

    #[test]
    fn netif_set_active_installs_route_and_announces() {
        let mut stack = Stack::new(NetConfig::default());
        let mut netif = Netif::new("eth0", NetifType::Ether, Box::new(NullDriver), 16);
        netif.set_hwaddr([2, 0, 0, 0, 0, 1]);
        netif.set_addr(
            IpAddr::from_octets([10, 0, 0, 2]),
            IpAddr::from_octets([255, 255, 255, 0]),
            IpAddr::ANY,
        );
        let out_rx = netif.out_q.receiver();
        let id = stack.add_netif(netif);

        assert!(stack.route_table_mut().find(IpAddr::from_octets([10, 0, 0, 9])).is_none());
        stack.netif_set_active(id).unwrap();
        assert!(stack.route_table_mut().find(IpAddr::from_octets([10, 0, 0, 9])).is_some());
        assert_eq!(stack.netifs[id].state, crate::netif::NetifState::Active);

        let frame = out_rx.try_recv().expect("gratuitous ARP frame sent");
        let eth = EthHeader::decode(&frame).unwrap();
        assert_eq!(eth.dst, ether::BROADCAST);
        assert_eq!(eth.ethertype, ether::ETHERTYPE_ARP);
        let pkt = ArpPacket::decode(&frame[ether::HEADER_LEN..]).unwrap();
        assert_eq!(pkt.sender_ip, pkt.target_ip);

        stack.netif_set_deactive(id).unwrap();
        assert!(stack.route_table_mut().find(IpAddr::from_octets([10, 0, 0, 9])).is_none());
    }

    #[test]
    fn handle_keepalive_probes_at_seq_below_nxt_then_aborts_after_cnt() {
        let (mut stack, netif_id) = stack_with_netif();
        let mut tcb = Tcb::new(stack.cfg.tcp_ring_size);
        tcb.base.local_ip = stack.netifs[netif_id].ipaddr;
        tcb.base.remote_ip = IpAddr::from_octets([10, 0, 0, 9]);
        tcb.base.local_port = 1000;
        tcb.base.remote_port = 2000;
        tcb.set_state(TcpState::Established);
        tcb.snd.una = 50;
        tcb.snd.nxt = 50;
        tcb.flags.keep_enable = true;
        tcb.keep.cnt = 2;
        let tcb_id = stack.tcp_tcbs.insert(tcb).unwrap();

        stack.handle_keepalive(tcb_id);
        assert!(stack.tcp_tcbs.get(tcb_id).is_some(), "first probe must not abort");
        assert_eq!(stack.tcp_tcbs.get(tcb_id).unwrap().timers.keepalive_probes, 1);

        stack.handle_keepalive(tcb_id);
        assert!(stack.tcp_tcbs.get(tcb_id).is_some(), "second probe must not abort (cnt == 2)");

        stack.handle_keepalive(tcb_id);
        assert!(stack.tcp_tcbs.get(tcb_id).is_none(), "third probe exceeds cnt and aborts the tcb");
    }

    #[test]
    fn udp_socket_sendto_queues_an_arp_request_for_unresolved_peer() {
        let (mut stack, _id) = stack_with_netif();
        let fd = stack.udp_socket().unwrap();
        stack.udp_bind(fd, IpAddr::ANY, 9000).unwrap();
        stack.udp_sendto(fd, IpAddr::from_octets([10, 0, 0, 5]), 53, b"hi").unwrap();
        // No ARP entry existed yet, so the datagram is queued and a request
        // frame should now be sitting in the netif's outbound queue.
        let nif = stack.netifs.get(0).unwrap();
        assert!(nif.get_out().is_ok());
    }

    #[test]
    fn tcp_accept_reports_need_wait_when_queue_empty() {
        let (mut stack, _id) = stack_with_netif();
        let fd = stack.tcp_socket().unwrap();
        stack.tcp_bind(fd, IpAddr::ANY, 80).unwrap();
        stack.tcp_listen(fd).unwrap();
        assert_eq!(stack.tcp_accept(fd), Err(NetError::NeedWait));
    }

    #[test]
    fn tcp_connect_sends_a_syn() {
        let (mut stack, _id) = stack_with_netif();
        let fd = stack.tcp_socket().unwrap();
        // pre-resolve the peer so the SYN goes straight to the wire.
        stack.arp_in(0, &ArpPacket::reply([9; 6], IpAddr::from_octets([10, 0, 0, 9]), [2, 0, 0, 0, 0, 1], IpAddr::from_octets([10, 0, 0, 2])).encode());
        stack.tcp_connect(fd, IpAddr::from_octets([10, 0, 0, 9]), 80).unwrap();
        let nif = stack.netifs.get(0).unwrap();
        assert!(nif.get_out().is_ok());
    }
}
