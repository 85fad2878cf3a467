//! ppe_notify - realtime violation notifications.
//!
//! Keeps a notification socket open (reconnecting on a fixed interval), polls
//! the REST API as a fallback while the socket is down, and logs the inbox
//! badge as it changes. `--acknowledge ID` acknowledges one violation and
//! exits.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use ppe_monitor::alert::LogAlertSink;
use ppe_monitor::api::{ApiClient, ViolationFeed};
use ppe_monitor::config::MonitorConfig;
use ppe_monitor::inbox::NotificationCenter;
use ppe_monitor::notify::{DomainFilter, NotificationChannel, TungsteniteConnector};
use ppe_monitor::poller::FallbackPoller;
use ppe_monitor::roles::Capability;
use ppe_monitor::session::{
    FileTokenStore, MemoryTokenStore, SessionEvent, SessionEvents, TokenStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Follow PPE violation notifications")]
struct Args {
    /// Comma-separated domain ids to scope notifications to (default: all).
    #[arg(long)]
    domains: Option<String>,

    /// Seconds between fallback polls while the socket is down.
    #[arg(long)]
    poll_secs: Option<u64>,

    /// Do not reconnect after the socket drops.
    #[arg(long)]
    no_reconnect: bool,

    /// Ring the terminal bell for high and critical violations.
    #[arg(long)]
    bell: bool,

    /// Acknowledge this violation id and exit.
    #[arg(long)]
    acknowledge: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = MonitorConfig::load()?;
    if let Some(domains) = &args.domains {
        cfg.notifications.domains = DomainFilter::parse_csv(domains)?;
    }
    if let Some(secs) = args.poll_secs {
        if secs == 0 {
            return Err(anyhow!("--poll-secs must be greater than zero"));
        }
        cfg.notifications.poll_interval = Duration::from_secs(secs);
    }
    if args.no_reconnect {
        cfg.notifications.auto_reconnect = false;
    }
    if args.bell {
        cfg.notifications.alert_bell = true;
    }

    let tokens: Arc<dyn TokenStore> = match &cfg.token_path {
        Some(path) => Arc::new(FileTokenStore::new(path)),
        None => Arc::new(MemoryTokenStore::new()),
    };
    let session = SessionEvents::new();
    let logout = session.subscribe();
    let api = Arc::new(
        ApiClient::new(&cfg.api_url, tokens, session)?.with_timeout(cfg.request_timeout),
    );

    if let Some(id) = args.acknowledge {
        return acknowledge(&api, &id);
    }

    let center = NotificationCenter::new(
        cfg.notifications.capacity,
        Arc::new(LogAlertSink::new(cfg.notifications.alert_bell)),
    );
    let mut channel = NotificationChannel::spawn(
        cfg.channel_config(),
        cfg.notifications.domains.clone(),
        Arc::new(TungsteniteConnector::default().with_connect_timeout(cfg.request_timeout)),
        center.violation_handler(),
    )?;
    let feed: Arc<dyn ViolationFeed> = api;
    let poller = FallbackPoller::spawn(
        feed,
        channel.shared_status(),
        center.clone(),
        cfg.poller_options(),
    )?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!(
        "ppe_notify following {} (Ctrl-C to stop)",
        ppe_monitor::notify::endpoint_url(&cfg.ws_url, &cfg.notifications.domains)
    );
    let mut last_badge = 0;
    let mut last_status = channel.status();
    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, closing notification channel...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        if let Ok(SessionEvent::LoggedOut { redirect_to }) = logout.try_recv() {
            log::error!("session ended by server; sign in again at {}", redirect_to);
            break;
        }

        let status = channel.status();
        if status != last_status {
            match (status.is_connected, status.connection_error.as_deref()) {
                (true, _) => log::info!("live updates connected"),
                (false, Some(err)) => log::warn!("live updates offline: {}", err),
                (false, None) => log::info!("live updates offline"),
            }
            last_status = status;
        }
        let badge = center.unread_count();
        if badge != last_badge {
            log::info!("{} unread notifications", badge);
            last_badge = badge;
        }
    }

    channel.close();
    poller.stop()?;
    Ok(())
}

fn acknowledge(api: &ApiClient, id: &str) -> Result<()> {
    if api.tokens().token().is_some() {
        match api.current_user() {
            Ok(user) if !user.role.can(Capability::AcknowledgeViolations) => {
                return Err(anyhow!(
                    "You do not have permission to acknowledge violation."
                ));
            }
            Ok(_) => {}
            Err(e) => log::debug!("role lookup failed: {}", e),
        }
    }
    match api.acknowledge_violation(id) {
        Ok(()) => {
            log::info!("violation {} acknowledged", id);
            Ok(())
        }
        Err(e) => {
            let toast = e.user_message("acknowledge violation");
            log::error!("{}", toast);
            Err(anyhow!(toast))
        }
    }
}
