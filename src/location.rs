//! Device location for the map view.
//!
//! A [`PositionProvider`] delivers a continuous stream of fixes (or errors)
//! to a callback until the watch is cleared. [`Subscription`] owns one such
//! watch and always clears it when dropped. The production provider,
//! [`GpsdProvider`], reads TPV reports from a gpsd daemon.

use crate::models::LocationFix;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PositionError {
    #[error("User denied geolocation: {0}")]
    PermissionDenied(String),
    #[error("Position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("Timeout expired")]
    Timeout,
    #[error("Geolocation is not supported by this device")]
    Unsupported,
}

pub type PositionUpdate = Result<LocationFix, PositionError>;

/// Invoked once per delivered fix or error, from the provider's task.
pub type PositionCallback = Arc<dyn Fn(PositionUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub enable_high_accuracy: bool,
    /// Longest wait for a fix before a [`PositionError::Timeout`] is delivered.
    pub timeout: Duration,
    /// Oldest cached fix a new watch may be seeded with. Zero means never.
    pub maximum_age: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            enable_high_accuracy: true,
            timeout: Duration::from_secs(30),
            maximum_age: Duration::ZERO,
        }
    }
}

pub trait PositionProvider: Send + Sync {
    fn is_supported(&self) -> bool;

    /// Starts delivering updates to `callback` until [`clear_watch`](Self::clear_watch).
    fn watch_position(&self, options: WatchOptions, callback: PositionCallback) -> WatchId;

    fn clear_watch(&self, id: WatchId);
}

/// An open watch on a provider.
///
/// The watch is released by [`stop`](Subscription::stop) or on drop,
/// whichever comes first, and never twice.
pub struct Subscription {
    provider: Arc<dyn PositionProvider>,
    watch: Option<WatchId>,
}

impl Subscription {
    pub fn start(
        provider: Arc<dyn PositionProvider>,
        options: WatchOptions,
        callback: PositionCallback,
    ) -> Result<Self, PositionError> {
        if !provider.is_supported() {
            return Err(PositionError::Unsupported);
        }

        let id = provider.watch_position(options, callback);
        info!("Location watch {} started ({:?})", id.0, options);

        Ok(Self {
            provider,
            watch: Some(id),
        })
    }

    pub fn is_active(&self) -> bool {
        self.watch.is_some()
    }

    pub fn stop(&mut self) {
        if let Some(id) = self.watch.take() {
            self.provider.clear_watch(id);
            info!("Location watch {} cleared", id.0);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reads fixes from gpsd's JSON protocol.
///
/// Every watch owns its own connection and task. Lost connections are
/// reported as [`PositionError::PositionUnavailable`] and retried while the
/// watch lives.
pub struct GpsdProvider {
    addr: Option<String>,
    next_id: AtomicU64,
    watches: Mutex<HashMap<WatchId, JoinHandle<()>>>,
    last_fix: Arc<Mutex<Option<(LocationFix, Instant)>>>,
}

impl GpsdProvider {
    pub fn new(addr: Option<String>) -> Self {
        Self {
            addr,
            next_id: AtomicU64::new(1),
            watches: Mutex::new(HashMap::new()),
            last_fix: Arc::new(Mutex::new(None)),
        }
    }

    fn cached_fix(&self, maximum_age: Duration) -> Option<LocationFix> {
        if maximum_age.is_zero() {
            return None;
        }
        let guard = self.last_fix.lock().ok()?;
        guard
            .as_ref()
            .filter(|(_, seen)| seen.elapsed() <= maximum_age)
            .map(|(fix, _)| fix.clone())
    }
}

impl PositionProvider for GpsdProvider {
    fn is_supported(&self) -> bool {
        self.addr.is_some()
    }

    fn watch_position(&self, options: WatchOptions, callback: PositionCallback) -> WatchId {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let Some(addr) = self.addr.clone() else {
            callback(Err(PositionError::Unsupported));
            return id;
        };

        if let Some(fix) = self.cached_fix(options.maximum_age) {
            debug!("Seeding watch {} with cached fix", id.0);
            callback(Ok(fix));
        }

        // gpsd has a single accuracy tier, so high accuracy is only recorded.
        debug!(
            "gpsd watch {} on {} (high accuracy: {})",
            id.0, addr, options.enable_high_accuracy
        );

        let last_fix = Arc::clone(&self.last_fix);
        let handle = tokio::spawn(run_watch(addr, options, callback, last_fix));

        if let Ok(mut watches) = self.watches.lock() {
            watches.insert(id, handle);
        }
        id
    }

    fn clear_watch(&self, id: WatchId) {
        let handle = self
            .watches
            .lock()
            .ok()
            .and_then(|mut watches| watches.remove(&id));
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for GpsdProvider {
    fn drop(&mut self) {
        if let Ok(mut watches) = self.watches.lock() {
            for (_, handle) in watches.drain() {
                handle.abort();
            }
        }
    }
}

async fn run_watch(
    addr: String,
    options: WatchOptions,
    callback: PositionCallback,
    last_fix: Arc<Mutex<Option<(LocationFix, Instant)>>>,
) {
    loop {
        let result = match TcpStream::connect(&addr).await {
            Ok(stream) => stream_fixes(stream, &options, &callback, &last_fix).await,
            Err(e) => Err(PositionError::PositionUnavailable(format!(
                "cannot reach gpsd at {}: {}",
                addr, e
            ))),
        };

        // Only a cleared watch ends this loop, by aborting the task
        if let Err(e) = result {
            warn!("{}. Retrying in {:?}.", e, RECONNECT_DELAY);
            callback(Err(e));
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

async fn stream_fixes(
    stream: TcpStream,
    options: &WatchOptions,
    callback: &PositionCallback,
    last_fix: &Mutex<Option<(LocationFix, Instant)>>,
) -> Result<(), PositionError> {
    let unavailable = |e: std::io::Error| PositionError::PositionUnavailable(e.to_string());

    let (reader, mut writer) = stream.into_split();
    writer.write_all(WATCH_COMMAND).await.map_err(unavailable)?;

    let mut lines = BufReader::new(reader).lines();
    let mut deadline = tokio::time::Instant::now() + options.timeout;

    loop {
        let line = match tokio::time::timeout_at(deadline, lines.next_line()).await {
            Err(_) => {
                callback(Err(PositionError::Timeout));
                deadline = tokio::time::Instant::now() + options.timeout;
                continue;
            }
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                return Err(PositionError::PositionUnavailable(
                    "gpsd closed the connection".to_string(),
                ))
            }
            Ok(Err(e)) => return Err(unavailable(e)),
        };

        match parse_report(&line) {
            Some(Ok(fix)) => {
                if let Ok(mut cached) = last_fix.lock() {
                    *cached = Some((fix.clone(), Instant::now()));
                }
                deadline = tokio::time::Instant::now() + options.timeout;
                callback(Ok(fix));
            }
            // gpsd keeps the socket open after an ERROR report
            Some(Err(e)) => {
                warn!("gpsd reported: {}", e);
                callback(Err(e));
            }
            None => {}
        }
    }
}

#[derive(Deserialize)]
struct GpsdReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    eph: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
    time: Option<String>,
    message: Option<String>,
}

/// Turns one gpsd line into a fix, an error, or nothing of interest.
fn parse_report(line: &str) -> Option<PositionUpdate> {
    let report: GpsdReport = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            debug!("Skipping unparseable gpsd line: {}", e);
            return None;
        }
    };

    match report.class.as_str() {
        // mode 0/1 means no fix yet
        "TPV" if report.mode >= 2 => {
            let (lat, lon) = (report.lat?, report.lon?);
            let accuracy = report
                .eph
                .or_else(|| Some(report.epx?.hypot(report.epy?)))
                .unwrap_or(f64::NAN);
            let timestamp = report
                .time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            Some(Ok(LocationFix {
                lat,
                lon,
                accuracy,
                timestamp,
            }))
        }
        "ERROR" => Some(Err(PositionError::PermissionDenied(
            report.message.unwrap_or_else(|| "gpsd refused the watch".to_string()),
        ))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CountingProvider {
        supported: bool,
        watches: AtomicU64,
        clears: AtomicU64,
    }

    impl PositionProvider for CountingProvider {
        fn is_supported(&self) -> bool {
            self.supported
        }

        fn watch_position(&self, _options: WatchOptions, _callback: PositionCallback) -> WatchId {
            WatchId(self.watches.fetch_add(1, Ordering::SeqCst))
        }

        fn clear_watch(&self, _id: WatchId) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn channel_callback() -> (PositionCallback, mpsc::UnboundedReceiver<PositionUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: PositionCallback = Arc::new(move |update| {
            let _ = tx.send(update);
        });
        (callback, rx)
    }

    #[test]
    fn subscription_releases_once() {
        let provider = Arc::new(CountingProvider {
            supported: true,
            ..Default::default()
        });
        let (callback, _rx) = channel_callback();

        let mut sub = Subscription::start(provider.clone(), WatchOptions::default(), callback)
            .unwrap();
        assert!(sub.is_active());
        sub.stop();
        sub.stop();
        drop(sub);

        assert_eq!(provider.watches.load(Ordering::SeqCst), 1);
        assert_eq!(provider.clears.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_releases_watch() {
        let provider = Arc::new(CountingProvider {
            supported: true,
            ..Default::default()
        });
        let (callback, _rx) = channel_callback();

        {
            let _sub = Subscription::start(provider.clone(), WatchOptions::default(), callback)
                .unwrap();
        }
        assert_eq!(provider.clears.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsupported_provider_never_watches() {
        let provider = Arc::new(CountingProvider::default());
        let (callback, _rx) = channel_callback();

        let result = Subscription::start(provider.clone(), WatchOptions::default(), callback);
        assert_eq!(result.err(), Some(PositionError::Unsupported));
        assert_eq!(provider.watches.load(Ordering::SeqCst), 0);
        assert_eq!(provider.clears.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tpv_with_fix_becomes_location() {
        let line = r#"{"class":"TPV","mode":3,"time":"2024-05-01T12:00:00.000Z","lat":52.52,"lon":13.405,"eph":4.2}"#;
        let fix = parse_report(line).unwrap().unwrap();
        assert_eq!(fix.lat, 52.52);
        assert_eq!(fix.lon, 13.405);
        assert_eq!(fix.accuracy, 4.2);
        assert_eq!(fix.epoch_millis(), 1_714_564_800_000);
    }

    #[test]
    fn tpv_accuracy_from_axis_errors() {
        let line = r#"{"class":"TPV","mode":2,"lat":1.0,"lon":2.0,"epx":3.0,"epy":4.0}"#;
        let fix = parse_report(line).unwrap().unwrap();
        assert_eq!(fix.accuracy, 5.0);
    }

    #[test]
    fn reports_without_fix_are_skipped() {
        assert!(parse_report(r#"{"class":"TPV","mode":1}"#).is_none());
        assert!(parse_report(r#"{"class":"SKY","satellites":[]}"#).is_none());
        assert!(parse_report(r#"{"class":"VERSION","release":"3.25"}"#).is_none());
        assert!(parse_report("not json").is_none());
    }

    #[test]
    fn error_report_is_denial() {
        let update = parse_report(r#"{"class":"ERROR","message":"Unrecognized request"}"#);
        assert_eq!(
            update,
            Some(Err(PositionError::PermissionDenied(
                "Unrecognized request".to_string()
            )))
        );
    }

    #[tokio::test]
    async fn gpsd_watch_streams_fixes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = socket.into_split();
            let mut lines = BufReader::new(reader).lines();
            let watch = lines.next_line().await.unwrap().unwrap();
            assert!(watch.starts_with("?WATCH="));

            writer
                .write_all(b"{\"class\":\"VERSION\",\"release\":\"3.25\"}\n")
                .await
                .unwrap();
            writer
                .write_all(b"{\"class\":\"TPV\",\"mode\":3,\"lat\":10.5,\"lon\":20.25,\"eph\":3.0}\n")
                .await
                .unwrap();
            writer
                .write_all(b"{\"class\":\"TPV\",\"mode\":3,\"lat\":10.6,\"lon\":20.35,\"eph\":2.0}\n")
                .await
                .unwrap();
            // Hold the connection open until the watch is cleared
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let provider = GpsdProvider::new(Some(addr.to_string()));
        let (callback, mut rx) = channel_callback();
        let id = provider.watch_position(WatchOptions::default(), callback);

        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!((first.lat, first.lon), (10.5, 20.25));
        assert_eq!((second.lat, second.lon), (10.6, 20.35));

        provider.clear_watch(id);
    }

    #[tokio::test]
    async fn silent_gpsd_times_out_and_keeps_watching() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
            socket
                .write_all(b"{\"class\":\"TPV\",\"mode\":2,\"lat\":1.0,\"lon\":1.0}\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let provider = GpsdProvider::new(Some(addr.to_string()));
        let (callback, mut rx) = channel_callback();
        let options = WatchOptions {
            timeout: Duration::from_millis(150),
            ..WatchOptions::default()
        };
        let id = provider.watch_position(options, callback);

        assert_eq!(rx.recv().await.unwrap(), Err(PositionError::Timeout));

        // A fix still arrives after the timeout was reported
        let fix = loop {
            match rx.recv().await.unwrap() {
                Ok(fix) => break fix,
                Err(e) => assert_eq!(e, PositionError::Timeout),
            }
        };
        assert_eq!(fix.lat, 1.0);
        assert!(fix.accuracy.is_nan());

        provider.clear_watch(id);
    }

    #[tokio::test]
    async fn gpsd_error_report_keeps_watch_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"{\"class\":\"ERROR\",\"message\":\"denied\"}\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            socket
                .write_all(b"{\"class\":\"TPV\",\"mode\":3,\"lat\":7.5,\"lon\":8.5,\"eph\":6.0}\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let provider = GpsdProvider::new(Some(addr.to_string()));
        let (callback, mut rx) = channel_callback();
        let id = provider.watch_position(WatchOptions::default(), callback);

        assert_eq!(
            rx.recv().await.unwrap(),
            Err(PositionError::PermissionDenied("denied".to_string()))
        );
        let fix = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no update after the error report")
            .expect("watch ended after the error report")
            .unwrap();
        assert_eq!((fix.lat, fix.lon), (7.5, 8.5));

        provider.clear_watch(id);
    }

    #[tokio::test]
    async fn unreachable_gpsd_reports_unavailable() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let provider = GpsdProvider::new(Some(addr.to_string()));
        let (callback, mut rx) = channel_callback();
        let id = provider.watch_position(WatchOptions::default(), callback);

        let update = rx.recv().await.unwrap();
        assert!(matches!(update, Err(PositionError::PositionUnavailable(_))));

        provider.clear_watch(id);
    }

    #[tokio::test]
    async fn cached_fix_requires_positive_maximum_age() {
        let provider = GpsdProvider::new(Some("127.0.0.1:1".to_string()));
        let fix = LocationFix {
            lat: 3.0,
            lon: 4.0,
            accuracy: 10.0,
            timestamp: Utc::now(),
        };
        *provider.last_fix.lock().unwrap() = Some((fix.clone(), Instant::now()));

        assert_eq!(provider.cached_fix(Duration::ZERO), None);
        assert_eq!(provider.cached_fix(Duration::from_secs(60)), Some(fix));
    }

    #[test]
    fn missing_address_is_unsupported() {
        assert!(!GpsdProvider::new(None).is_supported());
        assert!(GpsdProvider::new(Some("localhost:2947".into())).is_supported());
    }
}
