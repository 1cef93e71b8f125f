//! Interface en ligne de commande

use crate::config::{Config, EnforcementMode};
use crate::error::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// ZSentinel - moteur de décision pour pare-feu
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "zsentinel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Démarre l'analyse du trafic et l'application des blocages
    Run(RunArgs),
    /// Affiche le dernier statut écrit par le service
    Status(ConfigArgs),
    /// Vérifie la configuration et les modèles
    CheckConfig(ConfigArgs),
}

#[derive(Args, Debug, Clone, PartialEq, Default)]
pub struct ConfigArgs {
    /// Fichier de configuration (défaut: /etc/zsentinel/config.json)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl ConfigArgs {
    /// Charge la configuration indiquée, ou celle par défaut
    pub fn load(&self) -> Result<Config> {
        match &self.config {
            Some(path) => Config::load_from(path),
            None => Config::load(),
        }
    }
}

#[derive(Args, Debug, Clone, PartialEq, Default)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Rejoue un fichier pcap au lieu de capturer en direct
    #[arg(long)]
    pub pcap: Option<PathBuf>,

    /// Journalise les blocages sans toucher au pare-feu
    #[arg(long)]
    pub dry_run: bool,

    /// Interface réseau à surveiller (remplace celle de la configuration)
    #[arg(short, long)]
    pub interface: Option<String>,
}

impl RunArgs {
    /// Applique les options de la ligne de commande à la configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(interface) = &self.interface {
            config.interface = interface.clone();
        }
        if self.dry_run {
            config.enforcement = EnforcementMode::DryRun;
        }
    }
}
