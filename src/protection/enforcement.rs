//! Mécanismes d'application des blocages
//!
//! Le moteur n'émet que des intentions « bloquer » / « débloquer ». Les
//! implémentations de `Enforcer` les traduisent en règles de pare-feu. Les
//! appels doivent pouvoir être rejoués sans effet de bord (idempotents).

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::net::IpAddr;
use tokio::process::Command;

#[async_trait]
pub trait Enforcer: Send + Sync {
    /// Pose la règle de blocage pour la source
    async fn block(&self, ip: IpAddr) -> Result<()>;

    /// Retire la règle de blocage de la source
    async fn unblock(&self, ip: IpAddr) -> Result<()>;
}

/// Blocage par règles DROP iptables / ip6tables
#[derive(Debug, Clone)]
pub struct IptablesEnforcer {
    chain: String,
}

impl IptablesEnforcer {
    pub fn new(chain: impl Into<String>) -> Self {
        Self { chain: chain.into() }
    }

    fn binary(ip: IpAddr) -> &'static str {
        match ip {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        }
    }

    fn rule_args<'a>(&'a self, action: &'a str, source: &'a str) -> [&'a str; 6] {
        [action, self.chain.as_str(), "-s", source, "-j", "DROP"]
    }

    /// Vérifie la présence de la règle (`-C` : code 0 présente, 1 absente, autre = erreur)
    async fn rule_exists(&self, ip: IpAddr) -> Result<bool> {
        let source = ip.to_string();
        let output = Command::new(Self::binary(ip))
            .args(self.rule_args("-C", &source))
            .output()
            .await
            .map_err(|e| EngineError::EnforcementFailure {
                ip,
                message: format!("impossible d'exécuter {}: {}", Self::binary(ip), e),
            })?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(EngineError::EnforcementFailure {
                ip,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    async fn run(&self, ip: IpAddr, action: &str) -> Result<()> {
        let source = ip.to_string();
        let output = Command::new(Self::binary(ip))
            .args(self.rule_args(action, &source))
            .output()
            .await
            .map_err(|e| EngineError::EnforcementFailure {
                ip,
                message: format!("impossible d'exécuter {}: {}", Self::binary(ip), e),
            })?;

        if !output.status.success() {
            return Err(EngineError::EnforcementFailure {
                ip,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Enforcer for IptablesEnforcer {
    async fn block(&self, ip: IpAddr) -> Result<()> {
        if self.rule_exists(ip).await? {
            debug!("Règle DROP déjà présente pour {}", ip);
            return Ok(());
        }
        self.run(ip, "-I").await?;
        info!("Règle DROP ajoutée pour {} (chaîne {})", ip, self.chain);
        Ok(())
    }

    async fn unblock(&self, ip: IpAddr) -> Result<()> {
        if !self.rule_exists(ip).await? {
            debug!("Aucune règle DROP à retirer pour {}", ip);
            return Ok(());
        }
        self.run(ip, "-D").await?;
        info!("Règle DROP retirée pour {} (chaîne {})", ip, self.chain);
        Ok(())
    }
}

/// Journalise les intentions sans modifier le pare-feu
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunEnforcer;

#[async_trait]
impl Enforcer for DryRunEnforcer {
    async fn block(&self, ip: IpAddr) -> Result<()> {
        info!("[dry-run] blocage de {}", ip);
        Ok(())
    }

    async fn unblock(&self, ip: IpAddr) -> Result<()> {
        info!("[dry-run] déblocage de {}", ip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_binary_per_family() {
        assert_eq!(IptablesEnforcer::binary(IpAddr::V4(Ipv4Addr::LOCALHOST)), "iptables");
        assert_eq!(IptablesEnforcer::binary(IpAddr::V6(Ipv6Addr::LOCALHOST)), "ip6tables");
    }

    #[test]
    fn test_rule_args() {
        let enforcer = IptablesEnforcer::new("ZSENTINEL");
        assert_eq!(
            enforcer.rule_args("-I", "10.0.0.5"),
            ["-I", "ZSENTINEL", "-s", "10.0.0.5", "-j", "DROP"]
        );
    }

    #[tokio::test]
    async fn test_dry_run_never_fails() {
        let enforcer = DryRunEnforcer;
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        assert!(enforcer.block(ip).await.is_ok());
        assert!(enforcer.unblock(ip).await.is_ok());
    }
}
