//! End-to-end scenarios driven purely through the public `Stack` API plus
//! the wire-format codecs, the same way a real driver thread and a real
//! peer host would — no internal field ever touched directly.

use netstack_core::arp::ArpPacket;
use netstack_core::config::NetConfig;
use netstack_core::ether::{self, EthHeader};
use netstack_core::icmpv4::{self, IcmpHeader};
use netstack_core::ipaddr::IpAddr;
use netstack_core::ipv4::{Ipv4Header, PROTO_ICMP, PROTO_TCP, PROTO_UDP};
use netstack_core::netif::{Netif, NetifDriver, NetifId, NetifType};
use netstack_core::tcp::{Flags, TcpHeader, FLAG_ACK, FLAG_SYN};
use netstack_core::tools;
use netstack_core::udp::{self, UdpHeader};
use netstack_core::{NetError, Stack};

struct NullDriver;
impl NetifDriver for NullDriver {
    fn open(&mut self) -> netstack_core::NetResult<()> {
        Ok(())
    }
    fn close(&mut self) {}
    fn mtu(&self) -> usize {
        1500
    }
}

const LOCAL_MAC: [u8; 6] = [2, 0, 0, 0, 0, 1];
const PEER_MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];

fn stack_with_netif() -> (Stack, NetifId, IpAddr, IpAddr) {
    let mut stack = Stack::new(NetConfig::default());
    let local_ip = IpAddr::from_octets([10, 0, 0, 2]);
    let mask = IpAddr::from_octets([255, 255, 255, 0]);
    let mut netif = Netif::new("eth0", NetifType::Ether, Box::new(NullDriver), 32);
    netif.set_hwaddr(LOCAL_MAC);
    netif.set_addr(local_ip, mask, IpAddr::ANY);
    let id = stack.add_netif(netif);
    stack.route_table_mut().add(local_ip.network(mask), mask, IpAddr::ANY, id);
    (stack, id, local_ip, mask)
}

fn inject(stack: &mut Stack, id: NetifId, frame: Vec<u8>) {
    stack.netif_mut(id).unwrap().put_in(frame).unwrap();
    stack.drain_netif_in(id);
}

fn take_out(stack: &mut Stack, id: NetifId) -> Option<Vec<u8>> {
    stack.netif_mut(id).unwrap().get_out().ok()
}

fn eth_frame(dst: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    ether::build_frame(&EthHeader { dst, src, ethertype }, payload)
}

fn ip_datagram(src: IpAddr, dst: IpAddr, protocol: u8, id: u16, payload: &[u8]) -> Vec<u8> {
    let header = Ipv4Header {
        ihl_words: 5,
        tos: 0,
        total_len: (20 + payload.len()) as u16,
        id,
        more_fragments: false,
        frag_offset: 0,
        ttl: 64,
        protocol,
        checksum: 0,
        src,
        dst,
    };
    let mut datagram = header.encode().to_vec();
    datagram.extend_from_slice(payload);
    datagram
}

// 1. ARP resolve then send.
#[test]
fn arp_resolve_then_send() {
    let (mut stack, id, local_ip, _mask) = stack_with_netif();
    let peer_ip = IpAddr::from_octets([10, 0, 0, 3]);

    let fd = stack.udp_socket().unwrap();
    stack.udp_bind(fd, IpAddr::ANY, 0).unwrap();
    stack.udp_sendto(fd, peer_ip, 7, b"hi").unwrap();

    // exactly one ARP request, broadcast, asking for the peer.
    let req_frame = take_out(&mut stack, id).expect("arp request emitted");
    assert!(take_out(&mut stack, id).is_none(), "exactly one frame should be queued");
    let req_eth = EthHeader::decode(&req_frame).unwrap();
    assert_eq!(req_eth.dst, ether::BROADCAST);
    assert_eq!(req_eth.ethertype, ether::ETHERTYPE_ARP);
    let req_arp = ArpPacket::decode(&req_frame[ether::HEADER_LEN..]).unwrap();
    assert_eq!(req_arp.target_ip, peer_ip);

    // peer replies.
    let reply = ArpPacket::reply(PEER_MAC, peer_ip, LOCAL_MAC, local_ip);
    inject(&mut stack, id, eth_frame(LOCAL_MAC, PEER_MAC, ether::ETHERTYPE_ARP, &reply.encode()));

    // exactly one UDP frame now goes out to the resolved peer mac.
    let data_frame = take_out(&mut stack, id).expect("queued datagram flushed after resolve");
    assert!(take_out(&mut stack, id).is_none());
    let data_eth = EthHeader::decode(&data_frame).unwrap();
    assert_eq!(data_eth.dst, PEER_MAC);
    assert_eq!(data_eth.ethertype, ether::ETHERTYPE_IPV4);
    let ip_hdr = Ipv4Header::decode(&data_frame[ether::HEADER_LEN..]).unwrap();
    assert_eq!(ip_hdr.protocol, PROTO_UDP);
    assert_eq!(ip_hdr.src, local_ip);
    assert_eq!(ip_hdr.dst, peer_ip);
    let udp_payload = &data_frame[ether::HEADER_LEN + ip_hdr.header_len()..];
    UdpHeader::verify_checksum(udp_payload, local_ip, peer_ip).unwrap();
    let udp_hdr = UdpHeader::decode(udp_payload).unwrap();
    assert_eq!(udp_hdr.dst_port, 7);
    assert_eq!(&udp_payload[udp::HEADER_LEN..], b"hi");
}

// 2. ICMP echo.
#[test]
fn icmp_echo_reply() {
    let (mut stack, id, local_ip, _mask) = stack_with_netif();
    let peer_ip = IpAddr::from_octets([10, 0, 0, 3]);
    let id_seq = (0x1234u32 << 16) | 1;
    let payload = vec![0xABu8; 32];

    let mut icmp = Vec::with_capacity(icmpv4::HEADER_LEN + payload.len());
    icmp.extend_from_slice(&[icmpv4::TYPE_ECHO_REQUEST, 0, 0, 0]);
    icmp.extend_from_slice(&id_seq.to_be_bytes());
    icmp.extend_from_slice(&payload);
    let csum = tools::checksum16(&icmp, 0, true);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());

    let datagram = ip_datagram(peer_ip, local_ip, PROTO_ICMP, 1, &icmp);
    inject(&mut stack, id, eth_frame(LOCAL_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &datagram));

    let reply_frame = take_out(&mut stack, id).expect("echo reply emitted");
    let ip_hdr = Ipv4Header::decode(&reply_frame[ether::HEADER_LEN..]).unwrap();
    assert_eq!(ip_hdr.protocol, PROTO_ICMP);
    assert_eq!(ip_hdr.dst, peer_ip);
    assert_eq!(ip_hdr.src, local_ip);
    let icmp_payload = &reply_frame[ether::HEADER_LEN + ip_hdr.header_len()..];
    let (hdr, body) = IcmpHeader::decode(icmp_payload).unwrap();
    assert_eq!(hdr.icmp_type, icmpv4::TYPE_ECHO_REPLY);
    assert_eq!(hdr.rest, id_seq);
    assert_eq!(body, &payload[..]);
}

// 3. IPv4 reassembly out of order.
#[test]
fn ipv4_reassembly_out_of_order() {
    let (mut stack, id, local_ip, _mask) = stack_with_netif();
    let peer_ip = IpAddr::from_octets([10, 0, 0, 3]);

    let udp_payload = vec![0xCDu8; 2992];
    let udp_datagram = UdpHeader::build(peer_ip, local_ip, 5000, 9, &udp_payload);
    assert_eq!(udp_datagram.len(), 3000);

    let frag_id = 0x77;
    let slices = [(0usize, 1480usize, true), (1480, 1480, true), (2960, 40, false)];
    let mut fragments = Vec::new();
    for &(offset, len, more) in &slices {
        let header = Ipv4Header {
            ihl_words: 5,
            tos: 0,
            total_len: (20 + len) as u16,
            id: frag_id,
            more_fragments: more,
            frag_offset: (offset / 8) as u16,
            ttl: 64,
            protocol: PROTO_UDP,
            checksum: 0,
            src: peer_ip,
            dst: local_ip,
        };
        let mut datagram = header.encode().to_vec();
        datagram.extend_from_slice(&udp_datagram[offset..offset + len]);
        fragments.push(datagram);
    }

    // arrival order: third, first, second.
    let fd = stack.udp_socket().unwrap();
    stack.udp_bind(fd, IpAddr::ANY, 9).unwrap();
    for &order in &[2usize, 0, 1] {
        inject(&mut stack, id, eth_frame(LOCAL_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &fragments[order]));
    }

    let dgram = stack.udp_recvfrom(fd).expect("reassembled datagram delivered");
    assert_eq!(dgram.data.len(), 2992);
    assert_eq!(dgram.data, &udp_payload[..]);
    assert_eq!(stack.udp_recvfrom(fd).unwrap_err(), NetError::NeedWait);
}

// 4. TCP connect + echo, driven against a hand-built peer.
#[test]
fn tcp_connect_and_echo() {
    let (mut stack, id, local_ip, _mask) = stack_with_netif();
    let peer_ip = IpAddr::from_octets([10, 0, 0, 9]);
    let peer_port = 43210u16;

    let listen_fd = stack.tcp_socket().unwrap();
    stack.tcp_bind(listen_fd, IpAddr::ANY, 7000).unwrap();
    stack.tcp_listen(listen_fd).unwrap();

    let client_iss = 1000u32;
    let syn = TcpHeader {
        src_port: peer_port,
        dst_port: 7000,
        seq: client_iss,
        ack: 0,
        flags: Flags(FLAG_SYN),
        window: 4096,
        mss: Some(1460),
    }
    .build(peer_ip, local_ip, &[]);
    inject(&mut stack, id, eth_frame(LOCAL_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &ip_datagram(peer_ip, local_ip, PROTO_TCP, 2, &syn)));

    let synack_frame = take_out(&mut stack, id).expect("SYN-ACK emitted");
    let ip_hdr = Ipv4Header::decode(&synack_frame[ether::HEADER_LEN..]).unwrap();
    let tcp_payload = &synack_frame[ether::HEADER_LEN + ip_hdr.header_len()..];
    let (synack_hdr, _) = TcpHeader::decode(tcp_payload, local_ip, peer_ip).unwrap();
    assert!(synack_hdr.flags.has(FLAG_SYN) && synack_hdr.flags.has(FLAG_ACK));
    assert_eq!(synack_hdr.ack, client_iss.wrapping_add(1));
    let server_iss = synack_hdr.seq;

    let ack = TcpHeader {
        src_port: peer_port,
        dst_port: 7000,
        seq: client_iss.wrapping_add(1),
        ack: server_iss.wrapping_add(1),
        flags: Flags(FLAG_ACK),
        window: 4096,
        mss: None,
    }
    .build(peer_ip, local_ip, &[]);
    inject(&mut stack, id, eth_frame(LOCAL_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &ip_datagram(peer_ip, local_ip, PROTO_TCP, 3, &ack)));

    let conn_fd = stack.tcp_accept(listen_fd).expect("handshake completed, connection queued");

    let data = TcpHeader {
        src_port: peer_port,
        dst_port: 7000,
        seq: client_iss.wrapping_add(1),
        ack: server_iss.wrapping_add(1),
        flags: Flags(FLAG_ACK),
        window: 4096,
        mss: None,
    }
    .build(peer_ip, local_ip, b"abcd");
    inject(&mut stack, id, eth_frame(LOCAL_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &ip_datagram(peer_ip, local_ip, PROTO_TCP, 4, &data)));

    let received = stack.tcp_recv(conn_fd, 16).unwrap();
    assert_eq!(received, b"abcd");

    let n = stack.tcp_send(conn_fd, &received).unwrap();
    assert_eq!(n, 4);
    let echo_frame = take_out(&mut stack, id).expect("echoed segment emitted");
    let ip_hdr = Ipv4Header::decode(&echo_frame[ether::HEADER_LEN..]).unwrap();
    let tcp_payload = &echo_frame[ether::HEADER_LEN + ip_hdr.header_len()..];
    let (echo_hdr, echo_body) = TcpHeader::decode(tcp_payload, local_ip, peer_ip).unwrap();
    assert_eq!(echo_hdr.dst_port, peer_port);
    assert_eq!(echo_body, b"abcd");
}

// 5. UDP port-unreachable.
#[test]
fn udp_port_unreachable() {
    let (mut stack, id, local_ip, _mask) = stack_with_netif();
    let peer_ip = IpAddr::from_octets([10, 0, 0, 3]);

    let udp_datagram = UdpHeader::build(peer_ip, local_ip, 6000, 9999, b"nobody is listening");
    inject(&mut stack, id, eth_frame(LOCAL_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &ip_datagram(peer_ip, local_ip, PROTO_UDP, 5, &udp_datagram)));

    let frame = take_out(&mut stack, id).expect("dest-unreachable emitted");
    let ip_hdr = Ipv4Header::decode(&frame[ether::HEADER_LEN..]).unwrap();
    assert_eq!(ip_hdr.protocol, PROTO_ICMP);
    assert_eq!(ip_hdr.dst, peer_ip);
    let icmp_payload = &frame[ether::HEADER_LEN + ip_hdr.header_len()..];
    let (hdr, body) = IcmpHeader::decode(icmp_payload).unwrap();
    assert_eq!(hdr.icmp_type, icmpv4::TYPE_DEST_UNREACHABLE);
    assert_eq!(hdr.code, 3);
    assert!(body.len() >= 20 + 8);
}

// 6. Timer ordering under a single advance spanning several periods.
#[test]
fn timer_ordering_fires_floor_elapsed_over_period() {
    use netstack_core::timer::TimerList;
    use std::collections::HashMap;

    let mut timers = TimerList::new();
    let periods = [100u64, 30, 200, 30, 75];
    let mut ids = HashMap::new();
    for &p in &periods {
        let id = timers.insert("t", p, true);
        ids.insert(id, p);
    }
    let fired = timers.advance(310);
    let mut counts: HashMap<usize, u32> = HashMap::new();
    for id in fired {
        *counts.entry(id).or_insert(0) += 1;
    }
    for (id, period) in &ids {
        assert_eq!(counts.get(id).copied().unwrap_or(0) as u64, 310 / period);
    }
}
