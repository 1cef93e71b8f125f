use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use zsentinel::capture::{CaptureSource, PcapCapture};
use zsentinel::cli::{Cli, Command, ConfigArgs, RunArgs};
use zsentinel::clock::SystemClock;
use zsentinel::detection::{load_anomaly_model, load_threat_model, verify_dimension, DetectionPipeline};
use zsentinel::features::{Normalizer, WINDOW_FEATURE_DIM};
use zsentinel::logger::AuditLogger;
use zsentinel::monitor::TrafficMonitor;
use zsentinel::protection::{
    DecisionEngine, DryRunEnforcer, Enforcer, EngineSettings, IptablesEnforcer, ReportAlerter,
};
use zsentinel::status::{read_status, StatusWriter};
use zsentinel::{Config, EnforcementMode, LogMode, Report};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Status(args) => show_status(&args),
        Command::CheckConfig(args) => check_config(&args),
    }
}

/// Initialise le logger selon le mode configuré
fn init_logging(config: &Config) {
    match config.log_mode {
        LogMode::File => init_file_logger(config),
        LogMode::SystemdJournal => {
            #[cfg(feature = "systemd")]
            {
                use systemd_journal_logger::JournalLog;

                match JournalLog::new() {
                    Ok(logger) => {
                        if let Err(e) = logger
                            .with_syslog_identifier("zsentinel".to_string())
                            .install()
                        {
                            eprintln!("Erreur lors de l'installation du logger systemd: {}", e);
                            init_file_logger(config);
                        } else {
                            log::set_max_level(config.level_filter());
                            info!("Logger systemd initialisé avec niveau: {}", config.log_level);
                        }
                    }
                    Err(e) => {
                        eprintln!("Erreur lors de l'initialisation du logger systemd: {}", e);
                        init_file_logger(config);
                    }
                }
            }

            // Fallback si la feature systemd n'est pas activée
            #[cfg(not(feature = "systemd"))]
            {
                eprintln!("AVERTISSEMENT: Le mode SystemdJournal n'est pas disponible (feature 'systemd' non activée). Utilisation du logger standard à la place.");
                init_file_logger(config);
            }
        }
    }
}

fn init_file_logger(config: &Config) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level));

    if !config.log_file.is_empty() {
        if let Some(parent) = Path::new(&config.log_file).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(&config.log_file) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!(
                    "Impossible d'ouvrir {} ({}), journalisation sur la sortie d'erreur",
                    config.log_file, e
                );
            }
        }
    }
    builder.init();
}

/// Charge les modèles ; une dimension incompatible est fatale
fn load_pipeline(config: &Config) -> Result<DetectionPipeline> {
    let anomaly_model = load_anomaly_model(Path::new(&config.anomaly_model_path))
        .context("chargement du modèle d'anomalie")?;
    let threat_model = load_threat_model(Path::new(&config.threat_model_path))
        .context("chargement du classifieur de menaces")?;

    verify_dimension("modèle d'anomalie", anomaly_model.dimension(), WINDOW_FEATURE_DIM)?;
    verify_dimension("classifieur de menaces", threat_model.dimension(), WINDOW_FEATURE_DIM)?;

    Ok(DetectionPipeline::new(anomaly_model, threat_model))
}

/// Calibre le normaliseur si un jeu de calibration est configuré
fn load_normalizer(config: &Config) -> Result<Option<Arc<Normalizer>>> {
    let Some(path) = &config.calibration_file else {
        return Ok(None);
    };
    let normalizer = Normalizer::new(WINDOW_FEATURE_DIM);
    normalizer
        .calibrate_from_file(Path::new(path))
        .with_context(|| format!("calibration du normaliseur depuis {}", path))?;
    Ok(Some(Arc::new(normalizer)))
}

fn open_capture(config: &Config, pcap: Option<&Path>) -> zsentinel::Result<Box<dyn CaptureSource>> {
    let capture = match pcap {
        Some(path) => PcapCapture::offline(path, config.packet_queue_size)?,
        None => PcapCapture::live(
            &config.interface,
            config.max_packets_per_second,
            config.packet_queue_size,
        )?,
    };
    Ok(Box::new(capture))
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = args.config.load().context("chargement de la configuration")?;
    args.apply(&mut config);
    init_logging(&config);
    config.validate().context("configuration invalide")?;

    info!("Démarrage de ZSentinel sur l'interface {}", config.interface);

    let pipeline = load_pipeline(&config)?;
    let normalizer = load_normalizer(&config)?;

    // Canal des rapports, vidé par le journal d'audit
    let (report_tx, report_rx) = mpsc::channel::<Report>(config.report_queue_size);
    let audit_logger = AuditLogger::new(config.audit_log_file.clone(), config.log_mode);
    let audit_task = tokio::spawn(audit_logger.drain(report_rx));

    let enforcer: Arc<dyn Enforcer> = match config.enforcement {
        EnforcementMode::Iptables => Arc::new(IptablesEnforcer::new(config.iptables_chain.clone())),
        EnforcementMode::DryRun => {
            warn!("Mode dry-run: aucune règle de pare-feu ne sera posée");
            Arc::new(DryRunEnforcer)
        }
    };

    let mut engine = DecisionEngine::new(
        EngineSettings::from_config(&config)?,
        pipeline,
        enforcer,
        Arc::new(ReportAlerter::new(report_tx)),
        Arc::new(SystemClock),
    );
    if let Some(normalizer) = normalizer {
        engine = engine.with_normalizer(normalizer);
    }
    let engine = Arc::new(engine);

    let reconciler = engine.spawn_reconciler(config.reconciliation_interval());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let status_writer = StatusWriter::new(config.status_path());
    let status_task = spawn_status_task(
        Arc::clone(&engine),
        StatusWriter::new(config.status_path()),
        config.status_interval(),
        shutdown_rx.clone(),
    );

    let monitor = Arc::new(
        TrafficMonitor::new(Arc::clone(&engine), config.window_size, config.analyzer_workers)
            .with_pending_limits(config.max_pending_sources, config.pending_idle_timeout()),
    );

    let mut monitor_task = match open_capture(&config, args.pcap.as_deref()) {
        Ok(mut source) => {
            let monitor = Arc::clone(&monitor);
            let mut shutdown_rx = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = monitor.run(source.as_mut(), &mut shutdown_rx).await {
                    error!("Arrêt de l'analyse du trafic: {}", e);
                }
            }))
        }
        Err(e) => {
            // Le service reste joignable et continue d'écrire son statut
            warn!("Capture indisponible ({}), fonctionnement en mode dégradé", e);
            None
        }
    };

    let mut monitor_done = false;
    match (monitor_task.as_mut(), args.pcap.is_some()) {
        (Some(task), true) => {
            tokio::select! {
                res = signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!("Erreur lors de l'attente du signal d'arrêt: {}", e);
                    }
                    info!("Signal d'arrêt reçu");
                }
                _ = task => {
                    info!("Relecture du fichier de capture terminée");
                    monitor_done = true;
                }
            }
        }
        _ => {
            signal::ctrl_c().await.context("attente du signal d'arrêt")?;
            info!("Signal d'arrêt reçu");
        }
    }

    // Arrêt ordonné
    let _ = shutdown_tx.send(true);
    if let Some(task) = monitor_task.take() {
        if !monitor_done {
            let _ = task.await;
        }
    }
    let _ = status_task.await;
    reconciler.shutdown().await;

    if config.release_on_shutdown {
        let released = engine.release_all().await;
        info!("{} blocage(s) retiré(s) à l'arrêt", released);
    }
    if let Err(e) = status_writer.write(&engine.status().await) {
        warn!("Écriture du statut final impossible: {}", e);
    }

    // Fermeture du canal de rapports : le journal d'audit se termine
    drop(monitor);
    drop(engine);
    let _ = audit_task.await;

    info!("ZSentinel arrêté");
    Ok(())
}

/// Écrit périodiquement le statut du moteur
fn spawn_status_task(
    engine: Arc<DecisionEngine>,
    writer: StatusWriter,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = writer.write(&engine.status().await) {
                        warn!("Écriture du statut dans {} impossible: {}", writer.path().display(), e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn show_status(args: &ConfigArgs) -> Result<()> {
    let config = args.load().context("chargement de la configuration")?;
    let path: PathBuf = config.status_path();
    let status = read_status(&path)
        .with_context(|| format!("lecture du statut {} (le service est-il démarré ?)", path.display()))?;
    print!("{}", status.summary());
    Ok(())
}

fn check_config(args: &ConfigArgs) -> Result<()> {
    let config = args.load().context("chargement de la configuration")?;
    config.validate().context("configuration invalide")?;
    println!("Configuration valide");

    let pipeline = load_pipeline(&config)?;
    println!(
        "Détecteur d'anomalies: {}",
        if pipeline.anomaly_model_trained() { "chargé" } else { "absent (mode dégradé)" }
    );
    println!(
        "Classifieur de menaces: {}",
        if pipeline.threat_model_trained() { "chargé" } else { "absent (mode dégradé)" }
    );

    match load_normalizer(&config)? {
        Some(_) => println!("Normaliseur: calibré"),
        None => println!("Normaliseur: non configuré"),
    }
    println!("Dimension attendue des vecteurs: {}", WINDOW_FEATURE_DIM);
    Ok(())
}
