//! REST fallback for the notification channel.
//!
//! While the socket is down the poller re-fetches recent violations every
//! interval and merges them into the inbox, so the list is never stale for
//! longer than one poll interval. While the socket is connected it idles.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::api::ViolationFeed;
use crate::inbox::NotificationCenter;
use crate::notify::{DomainFilter, SharedStatus};

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct PollerOptions {
    pub interval: Duration,
    /// Page size per fetch; normally the inbox capacity.
    pub limit: u32,
    pub domains: DomainFilter,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            limit: crate::inbox::DEFAULT_CAPACITY as u32,
            domains: DomainFilter::all(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Socket connected; nothing fetched.
    Skipped,
    /// Fetch succeeded; this many new items were merged.
    Merged(usize),
    Failed,
}

/// One poll round.
pub fn poll_once(
    feed: &dyn ViolationFeed,
    status: &SharedStatus,
    center: &NotificationCenter,
    domains: &DomainFilter,
    limit: u32,
) -> PollOutcome {
    if status.is_connected() {
        return PollOutcome::Skipped;
    }
    match feed.recent_violations(domains, limit) {
        Ok(violations) => {
            let fetched = violations.len();
            let visible: Vec<_> = violations
                .into_iter()
                .filter(|v| domains.admits(v.domain_id.as_deref()))
                .collect();
            let merged = center.merge_violations(visible);
            log::debug!("fallback poll fetched {} violations, {} new", fetched, merged);
            PollOutcome::Merged(merged)
        }
        Err(e) => {
            log::warn!("fallback poll failed: {}", e);
            PollOutcome::Failed
        }
    }
}

pub struct FallbackPoller {
    domains: Arc<Mutex<DomainFilter>>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl FallbackPoller {
    /// Start polling. The first round runs immediately.
    pub fn spawn(
        feed: Arc<dyn ViolationFeed>,
        status: SharedStatus,
        center: NotificationCenter,
        options: PollerOptions,
    ) -> Result<Self> {
        if options.interval.is_zero() {
            return Err(anyhow!("poll interval must be non-zero"));
        }
        let domains = Arc::new(Mutex::new(options.domains.clone()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let domains_thread = domains.clone();
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("ppe-poller".to_string())
            .spawn(move || {
                let mut next_poll = Instant::now();
                while !shutdown_thread.load(Ordering::SeqCst) {
                    if Instant::now() >= next_poll {
                        let domains = domains_thread
                            .lock()
                            .map(|guard| guard.clone())
                            .unwrap_or_default();
                        poll_once(feed.as_ref(), &status, &center, &domains, options.limit);
                        next_poll = Instant::now() + options.interval;
                    }
                    std::thread::sleep(SHUTDOWN_POLL.min(options.interval));
                }
            })
            .context("spawn fallback poller thread")?;
        Ok(Self {
            domains,
            shutdown,
            join: Some(join),
        })
    }

    /// Scope later rounds to `domains`.
    pub fn set_domains(&self, domains: DomainFilter) {
        if let Ok(mut guard) = self.domains.lock() {
            *guard = domains;
        }
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("fallback poller thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::SilentAlertSink;
    use crate::api::{ApiError, Violation};
    use crate::Severity;
    use std::sync::atomic::AtomicUsize;

    struct FakeFeed {
        calls: AtomicUsize,
        fail: bool,
    }

    fn violation(id: &str, domain: &str) -> Violation {
        Violation {
            id: id.into(),
            violation_type: Some("no_vest".into()),
            camera_id: None,
            camera_name: Some("Gate".into()),
            domain_id: Some(domain.into()),
            severity: Severity::High,
            status: None,
            missing_ppe: vec![],
            confidence: None,
            timestamp: Some("2024-06-01T12:00:00Z".into()),
            message: None,
        }
    }

    impl ViolationFeed for FakeFeed {
        fn recent_violations(
            &self,
            _domains: &DomainFilter,
            _limit: u32,
        ) -> Result<Vec<Violation>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ApiError::Network("connection refused".into()));
            }
            Ok(vec![violation("1", "a"), violation("2", "b")])
        }
    }

    fn center() -> NotificationCenter {
        NotificationCenter::new(20, Arc::new(SilentAlertSink))
    }

    #[test]
    fn skips_while_connected() {
        let feed = FakeFeed { calls: AtomicUsize::new(0), fail: false };
        let status = SharedStatus::new();
        status.set_connected();
        let outcome = poll_once(&feed, &status, &center(), &DomainFilter::all(), 20);
        assert_eq!(outcome, PollOutcome::Skipped);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn merges_only_admitted_domains_and_dedupes() {
        let feed = FakeFeed { calls: AtomicUsize::new(0), fail: false };
        let status = SharedStatus::new();
        let center = center();
        let domains = DomainFilter::new(["a"]).unwrap();
        assert_eq!(poll_once(&feed, &status, &center, &domains, 20), PollOutcome::Merged(1));
        assert_eq!(poll_once(&feed, &status, &center, &domains, 20), PollOutcome::Merged(0));
        assert_eq!(center.items().len(), 1);
    }

    #[test]
    fn failures_are_contained() {
        let feed = FakeFeed { calls: AtomicUsize::new(0), fail: true };
        let outcome = poll_once(&feed, &SharedStatus::new(), &center(), &DomainFilter::all(), 20);
        assert_eq!(outcome, PollOutcome::Failed);
    }

    #[test]
    fn spawned_poller_fetches_immediately_and_stops() {
        let feed = Arc::new(FakeFeed { calls: AtomicUsize::new(0), fail: false });
        let center = center();
        let poller = FallbackPoller::spawn(
            feed.clone(),
            SharedStatus::new(),
            center.clone(),
            PollerOptions {
                interval: Duration::from_secs(60),
                ..PollerOptions::default()
            },
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while center.items().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        poller.stop().unwrap();
        assert_eq!(center.items().len(), 2);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    }
}
