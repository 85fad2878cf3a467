use anyhow::{Context, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::filter::DomainFilter;
use super::message::{ping_frame, ChannelMessage, ViolationEvent};
use super::socket::{Connector, SocketEvent, SocketStream};
use super::state::{
    ChannelStateMachine, ConnectionStatus, SharedStatus, ABNORMAL_CLOSE_CODE,
    INTENTIONAL_CLOSE_CODE,
};

pub const NOTIFICATIONS_PATH: &str = "/api/v1/ws/notifications";

pub type ViolationHandler = Box<dyn FnMut(ViolationEvent) + Send>;

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// `ws://host:port` or `wss://host:port`, without the endpoint path.
    pub ws_url: String,
    pub reconnect_interval: Duration,
    /// Pause between tearing down a connection and reopening it with a new
    /// domain filter.
    pub settle_delay: Duration,
    pub auto_reconnect: bool,
    pub ping_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8000".to_string(),
            reconnect_interval: Duration::from_secs(3),
            settle_delay: Duration::from_millis(250),
            auto_reconnect: true,
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Full socket URL for `filter`.
pub fn endpoint_url(ws_url: &str, filter: &DomainFilter) -> String {
    let base = format!("{}{}", ws_url.trim_end_matches('/'), NOTIFICATIONS_PATH);
    match filter.query_string() {
        Some(query) => format!("{}?{}", base, query),
        None => base,
    }
}

enum Control {
    Retarget(DomainFilter),
    Close,
}

/// Realtime violation feed over one reconnecting WebSocket.
pub struct NotificationChannel;

impl NotificationChannel {
    /// Start the connection loop on its own thread. `handler` receives every
    /// `violation` frame in arrival order.
    pub fn spawn(
        config: ChannelConfig,
        filter: DomainFilter,
        connector: Arc<dyn Connector>,
        handler: ViolationHandler,
    ) -> Result<ChannelHandle> {
        let status = SharedStatus::new();
        let (control_tx, control_rx) = mpsc::channel();
        let worker = ChannelWorker {
            machine: ChannelStateMachine::new(config.auto_reconnect, config.reconnect_interval),
            config,
            filter: filter.clone(),
            connector,
            handler,
            status: status.clone(),
            control: control_rx,
        };
        let thread = std::thread::Builder::new()
            .name("ppe-notify".to_string())
            .spawn(move || worker.run())
            .context("spawn notification channel thread")?;
        Ok(ChannelHandle {
            status,
            filter: Mutex::new(filter),
            control: control_tx,
            thread: Some(thread),
        })
    }
}

pub struct ChannelHandle {
    status: SharedStatus,
    filter: Mutex<DomainFilter>,
    control: Sender<Control>,
    thread: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn status(&self) -> ConnectionStatus {
        self.status.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Status view shared with the fallback poller.
    pub fn shared_status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn domains(&self) -> DomainFilter {
        self.filter
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Re-scope the connection. Returns false (and leaves the socket alone)
    /// when `filter` equals the current one by value.
    pub fn set_domains(&self, filter: DomainFilter) -> bool {
        let Ok(mut current) = self.filter.lock() else {
            return false;
        };
        if *current == filter {
            return false;
        }
        *current = filter.clone();
        self.control.send(Control::Retarget(filter)).is_ok()
    }

    /// Close with the intentional code and wait for the loop to exit.
    pub fn close(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.control.send(Control::Close);
        if thread.join().is_err() {
            log::error!("notification channel thread panicked");
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

enum Wake {
    Elapsed,
    Retarget,
    Close,
}

enum SessionEnd {
    Closed(u16, Option<String>),
    Retarget,
    Stop,
}

struct ChannelWorker {
    config: ChannelConfig,
    machine: ChannelStateMachine,
    filter: DomainFilter,
    connector: Arc<dyn Connector>,
    handler: ViolationHandler,
    status: SharedStatus,
    control: Receiver<Control>,
}

impl ChannelWorker {
    fn run(mut self) {
        let mut delay = Duration::ZERO;
        loop {
            if !delay.is_zero() {
                match self.wait(Some(delay)) {
                    Wake::Elapsed => {}
                    Wake::Retarget => {
                        delay = self.config.settle_delay;
                        continue;
                    }
                    Wake::Close => break,
                }
            }
            if !self.machine.begin_connect() {
                break;
            }

            let url = endpoint_url(&self.config.ws_url, &self.filter);
            log::info!(
                "notification channel connecting (attempt {}, domains: {})",
                self.machine.attempts(),
                describe(&self.filter)
            );
            let code = match self.connector.connect(&url) {
                Ok(socket) => {
                    self.machine.on_open();
                    self.status.set_connected();
                    log::info!("notification channel connected");
                    match self.session(socket) {
                        SessionEnd::Closed(code, error) => {
                            self.status.set_disconnected(error);
                            code
                        }
                        SessionEnd::Retarget => {
                            self.status.set_disconnected(None);
                            self.machine.on_close(INTENTIONAL_CLOSE_CODE);
                            log::info!("notification channel re-scoped to {}", describe(&self.filter));
                            delay = self.config.settle_delay;
                            continue;
                        }
                        SessionEnd::Stop => break,
                    }
                }
                Err(e) => {
                    log::warn!("notification channel connect failed: {:#}", e);
                    self.status.set_disconnected(Some(format!("{:#}", e)));
                    ABNORMAL_CLOSE_CODE
                }
            };

            match self.machine.on_close(code) {
                Some(interval) => {
                    log::info!(
                        "notification channel closed ({}); reconnecting in {:?}",
                        code,
                        interval
                    );
                    delay = interval;
                }
                None => {
                    log::info!("notification channel closed ({}); not reconnecting", code);
                    match self.wait(None) {
                        Wake::Retarget => delay = self.config.settle_delay,
                        Wake::Elapsed | Wake::Close => break,
                    }
                }
            }
        }
        self.machine.dispose();
        self.status.set_disconnected(None);
        log::info!("notification channel stopped");
    }

    /// Block for `timeout` (or until a control message when `None`).
    fn wait(&mut self, timeout: Option<Duration>) -> Wake {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let message = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Wake::Elapsed;
                    }
                    match self.control.recv_timeout(remaining) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => return Wake::Elapsed,
                        Err(RecvTimeoutError::Disconnected) => return Wake::Close,
                    }
                }
                None => match self.control.recv() {
                    Ok(message) => message,
                    Err(_) => return Wake::Close,
                },
            };
            match message {
                Control::Close => return Wake::Close,
                Control::Retarget(filter) => {
                    if self.apply_filter(filter) {
                        return Wake::Retarget;
                    }
                }
            }
        }
    }

    fn session(&mut self, mut socket: Box<dyn SocketStream>) -> SessionEnd {
        let mut last_ping = Instant::now();
        loop {
            match self.control.try_recv() {
                Ok(Control::Close) | Err(TryRecvError::Disconnected) => {
                    socket.close(INTENTIONAL_CLOSE_CODE);
                    return SessionEnd::Stop;
                }
                Ok(Control::Retarget(filter)) => {
                    if self.apply_filter(filter) {
                        socket.close(INTENTIONAL_CLOSE_CODE);
                        return SessionEnd::Retarget;
                    }
                }
                Err(TryRecvError::Empty) => {}
            }

            if last_ping.elapsed() >= self.config.ping_interval {
                if let Err(e) = socket.send_text(&ping_frame()) {
                    log::warn!("notification channel ping failed: {:#}", e);
                    return SessionEnd::Closed(ABNORMAL_CLOSE_CODE, Some(format!("{:#}", e)));
                }
                last_ping = Instant::now();
            }

            match socket.read_event() {
                Ok(SocketEvent::Text(text)) => self.dispatch(&text),
                Ok(SocketEvent::Idle) => {}
                Ok(SocketEvent::Closed(code)) => {
                    let error = (code != INTENTIONAL_CLOSE_CODE)
                        .then(|| format!("connection closed with code {}", code));
                    return SessionEnd::Closed(code, error);
                }
                Err(e) => {
                    log::warn!("notification channel read failed: {:#}", e);
                    return SessionEnd::Closed(ABNORMAL_CLOSE_CODE, Some(format!("{:#}", e)));
                }
            }
        }
    }

    fn apply_filter(&mut self, filter: DomainFilter) -> bool {
        if filter == self.filter {
            return false;
        }
        self.filter = filter;
        true
    }

    fn dispatch(&mut self, text: &str) {
        match ChannelMessage::parse(text) {
            Ok(ChannelMessage::Violation(event)) => (self.handler)(event),
            Ok(ChannelMessage::Connected { message }) => {
                log::debug!("notification handshake: {}", message.unwrap_or_default());
            }
            Ok(ChannelMessage::Keepalive | ChannelMessage::Pong) => {}
            Ok(ChannelMessage::Unrecognized(kind)) => {
                log::debug!("ignoring unrecognized notification type '{}'", kind);
            }
            Err(e) => log::warn!("dropping notification frame: {:#}", e),
        }
    }
}

fn describe(filter: &DomainFilter) -> String {
    if filter.is_empty() {
        "all".to_string()
    } else {
        filter.ids().join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed script, then idles until closed.
    struct ScriptedSocket {
        script: VecDeque<SocketEvent>,
        closed_with: Arc<Mutex<Vec<u16>>>,
    }

    impl SocketStream for ScriptedSocket {
        fn read_event(&mut self) -> Result<SocketEvent> {
            match self.script.pop_front() {
                Some(event) => Ok(event),
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(SocketEvent::Idle)
                }
            }
        }

        fn send_text(&mut self, _text: &str) -> Result<()> {
            Ok(())
        }

        fn close(&mut self, code: u16) {
            self.closed_with.lock().unwrap().push(code);
        }
    }

    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Vec<SocketEvent>>>,
        urls: Mutex<Vec<String>>,
        attempts: AtomicUsize,
        closed_with: Arc<Mutex<Vec<u16>>>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Vec<SocketEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                urls: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                closed_with: Arc::new(Mutex::new(Vec::new())),
            })
        }
    }

    impl Connector for ScriptedConnector {
        fn connect(&self, url: &str) -> Result<Box<dyn SocketStream>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedSocket {
                script: script.into(),
                closed_with: self.closed_with.clone(),
            }))
        }
    }

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            ws_url: "ws://test".into(),
            reconnect_interval: Duration::from_millis(50),
            settle_delay: Duration::from_millis(10),
            auto_reconnect: true,
            ping_interval: Duration::from_secs(30),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn endpoint_url_carries_filter() {
        let filter = DomainFilter::new(["2", "1"]).unwrap();
        assert_eq!(
            endpoint_url("ws://h:8000/", &filter),
            "ws://h:8000/api/v1/ws/notifications?domain_ids=1,2"
        );
        assert_eq!(
            endpoint_url("wss://h", &DomainFilter::all()),
            "wss://h/api/v1/ws/notifications"
        );
    }

    #[test]
    fn violations_reach_handler_and_noise_is_ignored() {
        let connector = ScriptedConnector::new(vec![vec![
            SocketEvent::Text(r#"{"type":"connected"}"#.into()),
            SocketEvent::Text("garbage".into()),
            SocketEvent::Text(r#"{"type":"keepalive"}"#.into()),
            SocketEvent::Text(r#"{"type":"mystery"}"#.into()),
            SocketEvent::Text(r#"{"type":"violation","data":{"id":5,"severity":"high"}}"#.into()),
        ]]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut handle = NotificationChannel::spawn(
            fast_config(),
            DomainFilter::all(),
            connector.clone(),
            Box::new(move |event| sink.lock().unwrap().push(event.violation.id)),
        )
        .unwrap();
        assert!(wait_for(|| seen.lock().unwrap().len() == 1));
        assert!(handle.is_connected());
        handle.close();
        assert_eq!(seen.lock().unwrap().as_slice(), ["5"]);
        assert!(!handle.status().is_connected);
        assert_eq!(
            connector.closed_with.lock().unwrap().as_slice(),
            [INTENTIONAL_CLOSE_CODE]
        );
    }

    #[test]
    fn server_intentional_close_does_not_reconnect() {
        let connector = ScriptedConnector::new(vec![vec![SocketEvent::Closed(
            INTENTIONAL_CLOSE_CODE,
        )]]);
        let mut handle = NotificationChannel::spawn(
            fast_config(),
            DomainFilter::all(),
            connector.clone(),
            Box::new(|_| {}),
        )
        .unwrap();
        assert!(wait_for(|| connector.attempts.load(Ordering::SeqCst) == 1));
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(handle.status().connection_error, None);
        handle.close();
    }

    #[test]
    fn abnormal_close_reconnects_after_interval() {
        let connector = ScriptedConnector::new(vec![vec![SocketEvent::Closed(
            ABNORMAL_CLOSE_CODE,
        )]]);
        let started = Instant::now();
        let mut handle = NotificationChannel::spawn(
            fast_config(),
            DomainFilter::all(),
            connector.clone(),
            Box::new(|_| {}),
        )
        .unwrap();
        assert!(wait_for(|| connector.attempts.load(Ordering::SeqCst) == 2));
        assert!(started.elapsed() >= Duration::from_millis(50));
        handle.close();
    }

    #[test]
    fn equal_filter_is_a_no_op_and_new_filter_reconnects() {
        let connector = ScriptedConnector::new(vec![]);
        let mut handle = NotificationChannel::spawn(
            fast_config(),
            DomainFilter::new(["1", "2"]).unwrap(),
            connector.clone(),
            Box::new(|_| {}),
        )
        .unwrap();
        assert!(wait_for(|| handle.is_connected()));
        assert!(!handle.set_domains(DomainFilter::new(["2", "1", "1"]).unwrap()));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        assert!(handle.set_domains(DomainFilter::new(["3"]).unwrap()));
        assert!(wait_for(|| connector.attempts.load(Ordering::SeqCst) == 2));
        handle.close();
        let urls = connector.urls.lock().unwrap();
        assert!(urls[0].ends_with("?domain_ids=1,2"));
        assert!(urls[1].ends_with("?domain_ids=3"));
    }
}
