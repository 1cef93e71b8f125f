use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

/// Protocole de transport d'un paquet
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PacketType {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl PacketType {
    /// Construit le type à partir du numéro de protocole IP
    pub fn from_ip_protocol(number: u8) -> Self {
        match number {
            6 => Self::Tcp,
            17 => Self::Udp,
            1 | 58 => Self::Icmp,
            other => Self::Other(other),
        }
    }
}

/// Trame brute telle que livrée par la source de capture.
///
/// Immuable une fois capturée ; elle est abandonnée dès que ses
/// caractéristiques ont été extraites.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub timestamp: SystemTime,
    pub data: Vec<u8>,
}

impl PacketRecord {
    pub fn new(timestamp: SystemTime, data: Vec<u8>) -> Self {
        Self { timestamp, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Informations d'en-tête d'un paquet, transmises au moteur de décision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PacketInfo {
    pub timestamp: SystemTime,
    pub source_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub source_port: Option<u16>,
    pub dest_port: Option<u16>,
    pub protocol: PacketType,
    pub size: usize,
    pub ttl: u8,
    pub tcp_flags: Option<u8>,
    pub window_size: Option<u16>,
    pub urgent_ptr: Option<u16>,
    pub fragment_offset: u16,
    pub tos: u8,
}

impl PacketInfo {
    /// Informations minimales pour une source donnée (utile pour les appels directs à `analyze`)
    pub fn from_source(source_ip: IpAddr) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_ip,
            dest_ip: source_ip,
            source_port: None,
            dest_port: None,
            protocol: PacketType::Other(0),
            size: 0,
            ttl: 0,
            tcp_flags: None,
            window_size: None,
            urgent_ptr: None,
            fragment_offset: 0,
            tos: 0,
        }
    }
}

/// Vecteur de caractéristiques de dimension fixe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn zeros(dim: usize) -> Self {
        Self(vec![0.0; dim])
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl From<Vec<f64>> for FeatureVector {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// Type de menace attribué par le classifieur
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ThreatType {
    Normal,
    PortScan,
    Ddos,
    Malware,
    BruteForce,
    Unknown,
}

impl ThreatType {
    /// Correspondance par défaut label -> type, dans l'ordre des classes d'entraînement
    pub fn from_label(label: usize) -> Self {
        match label {
            0 => Self::Normal,
            1 => Self::PortScan,
            2 => Self::Ddos,
            3 => Self::Malware,
            4 => Self::BruteForce,
            _ => Self::Unknown,
        }
    }

    /// Correspondance à partir du nom de classe d'un artefact de modèle
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace(['_', '-'], " ").as_str() {
            "normal" => Self::Normal,
            "port scan" | "portscan" => Self::PortScan,
            "ddos" => Self::Ddos,
            "malware" => Self::Malware,
            "brute force" | "bruteforce" => Self::BruteForce,
            _ => Self::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::PortScan => "Port Scan",
            Self::Ddos => "DDoS",
            Self::Malware => "Malware",
            Self::BruteForce => "Brute Force",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ThreatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Résultat de l'analyse d'un vecteur
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DetectionResult {
    pub is_anomaly: bool,
    pub threat_type: ThreatType,
    /// Confiance dans [0, 1]
    pub confidence: f64,
    /// Vrai si un modèle n'était pas prêt (aucune action n'est alors prise)
    pub degraded: bool,
}

impl DetectionResult {
    pub fn normal() -> Self {
        Self {
            is_anomaly: false,
            threat_type: ThreatType::Normal,
            confidence: 0.0,
            degraded: false,
        }
    }

    pub fn degraded() -> Self {
        Self {
            degraded: true,
            ..Self::normal()
        }
    }
}

/// Enregistrement d'un blocage actif
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockEntry {
    pub source_ip: IpAddr,
    pub threat_type: ThreatType,
    pub confidence: f64,
    pub blocked_at: SystemTime,
    pub expires_at: SystemTime,
    /// Faux tant que la règle n'a pas pu être posée par le mécanisme de blocage
    pub enforced: bool,
}

/// Durée de blocage maximale acceptée (10 ans)
pub const MAX_BLOCK_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Instant `start + duration`, plafonné si l'addition déborde
pub fn expiry_after(start: SystemTime, duration: Duration) -> SystemTime {
    start
        .checked_add(duration)
        .or_else(|| start.checked_add(MAX_BLOCK_DURATION))
        .unwrap_or(start)
}

impl BlockEntry {
    pub fn new(
        source_ip: IpAddr,
        threat_type: ThreatType,
        confidence: f64,
        blocked_at: SystemTime,
        duration: Duration,
    ) -> Self {
        Self {
            source_ip,
            threat_type,
            confidence,
            blocked_at,
            expires_at: expiry_after(blocked_at, duration),
            enforced: false,
        }
    }

    /// Le blocage est éligible au retrait dès que `now - blocked_at >= durée`
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

/// Source observée comme anormale mais sous le seuil de blocage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuspicionRecord {
    pub count: u32,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub last_threat: ThreatType,
    pub max_confidence: f64,
}

impl SuspicionRecord {
    pub fn new(now: SystemTime, threat_type: ThreatType, confidence: f64) -> Self {
        Self {
            count: 1,
            first_seen: now,
            last_seen: now,
            last_threat: threat_type,
            max_confidence: confidence,
        }
    }

    pub fn observe(&mut self, now: SystemTime, threat_type: ThreatType, confidence: f64) {
        self.count = self.count.saturating_add(1);
        self.last_seen = now;
        self.last_threat = threat_type;
        self.max_confidence = self.max_confidence.max(confidence);
    }
}

/// Type de rapport
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ReportType {
    /// Menace détectée
    Threat,
    /// Source bloquée
    Block,
    /// Source débloquée à expiration
    Unblock,
    /// Source libérée par un administrateur
    Release,
    /// Échec du mécanisme de blocage
    Failure,
    /// Information générale
    Info,
}

/// Rapport d'événement destiné au journal d'audit et aux alertes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub timestamp: SystemTime,
    pub report_type: ReportType,
    pub source_ip: Option<IpAddr>,
    pub message: String,
    pub details: Option<String>,
    pub severity: u8, // 0-10, 10 étant le plus sévère
}

impl Report {
    pub fn new(report_type: ReportType, message: String) -> Self {
        Self {
            timestamp: SystemTime::now(),
            report_type,
            source_ip: None,
            message,
            details: None,
            severity: 5,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = severity.min(10);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_threat_type_labels() {
        assert_eq!(ThreatType::from_label(0), ThreatType::Normal);
        assert_eq!(ThreatType::from_label(1), ThreatType::PortScan);
        assert_eq!(ThreatType::from_label(4), ThreatType::BruteForce);
        assert_eq!(ThreatType::from_label(9), ThreatType::Unknown);
        assert_eq!(ThreatType::from_name("Port Scan"), ThreatType::PortScan);
        assert_eq!(ThreatType::from_name("brute_force"), ThreatType::BruteForce);
        assert_eq!(ThreatType::PortScan.to_string(), "Port Scan");
    }

    #[test]
    fn test_block_entry_expiry_boundary() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let entry = BlockEntry::new(ip, ThreatType::Ddos, 0.9, start, Duration::from_secs(3600));

        assert!(!entry.is_expired_at(start));
        assert!(!entry.is_expired_at(start + Duration::from_secs(3599)));
        assert!(entry.is_expired_at(start + Duration::from_secs(3600)));
        assert!(!entry.enforced);
    }

    #[test]
    fn test_huge_duration_saturates_instead_of_overflowing() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6));
        let entry = BlockEntry::new(ip, ThreatType::PortScan, 0.95, start, Duration::from_secs(u64::MAX));

        assert!(entry.expires_at > start);
        assert!(!entry.is_expired_at(start + Duration::from_secs(365 * 24 * 3600)));
    }

    #[test]
    fn test_suspicion_record_observe() {
        let t0 = SystemTime::UNIX_EPOCH;
        let mut record = SuspicionRecord::new(t0, ThreatType::PortScan, 0.4);
        record.observe(t0 + Duration::from_secs(5), ThreatType::Ddos, 0.6);
        assert_eq!(record.count, 2);
        assert_eq!(record.last_threat, ThreatType::Ddos);
        assert_eq!(record.max_confidence, 0.6);
        assert_eq!(record.first_seen, t0);
    }

    #[test]
    fn test_report_severity_is_capped() {
        let report = Report::new(ReportType::Info, "test".into()).with_severity(42);
        assert_eq!(report.severity, 10);
    }
}
