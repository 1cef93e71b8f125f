//! Extraction des caractéristiques d'un paquet
//!
//! La trame est décodée couche par couche (Ethernet -> IPv4/IPv6 -> TCP/UDP)
//! à l'aide des vues `pnet`, dont chaque constructeur vérifie la taille minimale
//! de l'en-tête. Une trame trop courte produit `MalformedPacket` plutôt qu'un
//! vecteur partiel.

use crate::error::{EngineError, Result};
use crate::models::{FeatureVector, PacketInfo, PacketRecord, PacketType};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use std::net::IpAddr;

/// Noms des caractéristiques par paquet, dans l'ordre du vecteur
pub const PACKET_FEATURE_NAMES: [&str; 10] = [
    "packet_size",
    "protocol_type",
    "ttl",
    "tcp_flags",
    "src_port",
    "dst_port",
    "window_size",
    "tcp_urgent_ptr",
    "ip_fragment_offset",
    "ip_tos",
];

/// Dimension d'un vecteur de paquet
pub const PACKET_FEATURE_DIM: usize = PACKET_FEATURE_NAMES.len();

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
/// Octet des drapeaux dans l'en-tête TCP (CWR..FIN)
const TCP_FLAGS_OFFSET: usize = 13;

/// Paquet décodé : en-têtes utiles et vecteur de caractéristiques
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub info: PacketInfo,
    pub features: FeatureVector,
}

/// Champs de la couche réseau nécessaires à la suite du décodage
struct NetworkLayer<'a> {
    source_ip: IpAddr,
    dest_ip: IpAddr,
    protocol: u8,
    ttl: u8,
    tos: u8,
    fragment_offset: u16,
    transport: &'a [u8],
}

/// Champs de la couche transport
#[derive(Default)]
struct TransportLayer {
    source_port: Option<u16>,
    dest_port: Option<u16>,
    tcp_flags: Option<u8>,
    window_size: Option<u16>,
    urgent_ptr: Option<u16>,
}

/// Extrait le vecteur de caractéristiques d'un paquet
pub fn extract_packet_features(record: &PacketRecord) -> Result<FeatureVector> {
    parse_packet(record).map(|parsed| parsed.features)
}

/// Décode une trame Ethernet et construit ses informations et caractéristiques
pub fn parse_packet(record: &PacketRecord) -> Result<ParsedPacket> {
    let ethernet = EthernetPacket::new(&record.data).ok_or_else(|| {
        EngineError::MalformedPacket(format!(
            "trame de {} octets, en-tête Ethernet de {} attendu",
            record.len(),
            ETHERNET_HEADER_LEN
        ))
    })?;

    let network = match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => parse_ipv4(&record.data[ETHERNET_HEADER_LEN..])?,
        EtherTypes::Ipv6 => parse_ipv6(&record.data[ETHERNET_HEADER_LEN..])?,
        other => return Err(EngineError::UnsupportedFrame(other.0)),
    };

    let transport = if network.fragment_offset > 0 {
        // Fragment non initial : pas d'en-tête transport
        TransportLayer::default()
    } else {
        parse_transport(network.protocol, network.transport)?
    };

    let info = PacketInfo {
        timestamp: record.timestamp,
        source_ip: network.source_ip,
        dest_ip: network.dest_ip,
        source_port: transport.source_port,
        dest_port: transport.dest_port,
        protocol: PacketType::from_ip_protocol(network.protocol),
        size: record.len(),
        ttl: network.ttl,
        tcp_flags: transport.tcp_flags,
        window_size: transport.window_size,
        urgent_ptr: transport.urgent_ptr,
        fragment_offset: network.fragment_offset,
        tos: network.tos,
    };

    let features = FeatureVector::new(vec![
        info.size as f64,
        network.protocol as f64,
        info.ttl as f64,
        info.tcp_flags.unwrap_or(0) as f64,
        info.source_port.unwrap_or(0) as f64,
        info.dest_port.unwrap_or(0) as f64,
        info.window_size.unwrap_or(0) as f64,
        info.urgent_ptr.unwrap_or(0) as f64,
        info.fragment_offset as f64,
        info.tos as f64,
    ]);

    Ok(ParsedPacket { info, features })
}

fn parse_ipv4(bytes: &[u8]) -> Result<NetworkLayer<'_>> {
    let ipv4 = Ipv4Packet::new(bytes).ok_or_else(|| {
        EngineError::MalformedPacket(format!(
            "en-tête IPv4 tronqué ({} octets sur {})",
            bytes.len(),
            IPV4_MIN_HEADER_LEN
        ))
    })?;

    let header_len = ipv4.get_header_length() as usize * 4;
    if header_len < IPV4_MIN_HEADER_LEN || header_len > bytes.len() {
        return Err(EngineError::MalformedPacket(format!(
            "longueur d'en-tête IPv4 invalide: {} octets",
            header_len
        )));
    }

    // La longueur totale annoncée peut dépasser la capture (snaplen) ou être nulle (TSO)
    let total_len = ipv4.get_total_length() as usize;
    let end = if total_len >= header_len {
        total_len.min(bytes.len())
    } else {
        bytes.len()
    };

    Ok(NetworkLayer {
        source_ip: IpAddr::V4(ipv4.get_source()),
        dest_ip: IpAddr::V4(ipv4.get_destination()),
        protocol: ipv4.get_next_level_protocol().0,
        ttl: ipv4.get_ttl(),
        tos: (ipv4.get_dscp() << 2) | ipv4.get_ecn(),
        fragment_offset: ipv4.get_fragment_offset(),
        transport: &bytes[header_len..end],
    })
}

fn parse_ipv6(bytes: &[u8]) -> Result<NetworkLayer<'_>> {
    let ipv6 = Ipv6Packet::new(bytes).ok_or_else(|| {
        EngineError::MalformedPacket(format!(
            "en-tête IPv6 tronqué ({} octets sur {})",
            bytes.len(),
            IPV6_HEADER_LEN
        ))
    })?;

    Ok(NetworkLayer {
        source_ip: IpAddr::V6(ipv6.get_source()),
        dest_ip: IpAddr::V6(ipv6.get_destination()),
        protocol: ipv6.get_next_header().0,
        ttl: ipv6.get_hop_limit(),
        tos: ipv6.get_traffic_class(),
        fragment_offset: 0,
        transport: &bytes[IPV6_HEADER_LEN..],
    })
}

fn parse_transport(protocol: u8, bytes: &[u8]) -> Result<TransportLayer> {
    match protocol {
        p if p == IpNextHeaderProtocols::Tcp.0 => {
            let tcp = TcpPacket::new(bytes).ok_or_else(|| {
                EngineError::MalformedPacket(format!("en-tête TCP tronqué ({} octets)", bytes.len()))
            })?;
            Ok(TransportLayer {
                source_port: Some(tcp.get_source()),
                dest_port: Some(tcp.get_destination()),
                tcp_flags: Some(tcp.packet()[TCP_FLAGS_OFFSET]),
                window_size: Some(tcp.get_window()),
                urgent_ptr: Some(tcp.get_urgent_ptr()),
            })
        }
        p if p == IpNextHeaderProtocols::Udp.0 => {
            let udp = UdpPacket::new(bytes).ok_or_else(|| {
                EngineError::MalformedPacket(format!("en-tête UDP tronqué ({} octets)", bytes.len()))
            })?;
            Ok(TransportLayer {
                source_port: Some(udp.get_source()),
                dest_port: Some(udp.get_destination()),
                ..TransportLayer::default()
            })
        }
        // ICMP et autres : pas de ports
        _ => Ok(TransportLayer::default()),
    }
}
