use crate::api::ProxyClient;
use crate::config::Config;
use crate::events::Event;
use crate::location::{PositionCallback, PositionProvider, Subscription, WatchOptions};
use crate::marker::{self, MarkerIcon};
use crate::tracker::Tracker;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

const ZOOM_STEP: f64 = 1.0;

pub struct App {
    pub tracker: Tracker,
    pub should_quit: bool,
    icon: MarkerIcon,
    watch_options: WatchOptions,
    subscription: Option<Subscription>,
}

impl App {
    pub fn new(config: &Config) -> Self {
        Self {
            tracker: Tracker::new(
                config.map.zoom,
                Duration::from_millis(config.map.fly_duration_ms),
                config.tracking.history_len,
            ),
            should_quit: false,
            icon: MarkerIcon {
                glyph: config.map.marker_glyph.clone(),
                retina_glyph: config.map.marker_retina_glyph.clone(),
                shadow_glyph: config.map.marker_shadow_glyph.clone(),
                anchor: config.map.marker_anchor,
            },
            watch_options: WatchOptions {
                enable_high_accuracy: config.tracking.high_accuracy,
                timeout: Duration::from_secs(config.tracking.timeout_secs),
                maximum_age: Duration::from_secs(config.tracking.maximum_age_secs),
            },
            subscription: None,
        }
    }

    /// Brings the view up: marker defaults, the one-shot IP lookup and the
    /// continuous location watch. Results arrive on `tx`.
    pub fn mount(
        &mut self,
        provider: Arc<dyn PositionProvider>,
        proxy: ProxyClient,
        tx: mpsc::UnboundedSender<Event>,
    ) {
        marker::install_defaults(self.icon.clone());

        let ip_tx = tx.clone();
        tokio::spawn(async move {
            let result = proxy.fetch_ip_location().await.map_err(|e| {
                warn!("{}", e);
                "Error fetching IP data".to_string()
            });
            // The view may already be gone; nobody to tell then.
            let _ = ip_tx.send(Event::IpLookup(result));
        });

        let callback: PositionCallback = Arc::new(move |update| {
            let _ = tx.send(Event::Position(update));
        });

        match Subscription::start(provider, self.watch_options, callback) {
            Ok(subscription) => {
                self.tracker.begin_tracking();
                self.subscription = Some(subscription);
            }
            Err(e) => {
                warn!("Location tracking unavailable: {}", e);
                self.tracker.unsupported(&e);
            }
        }
    }

    /// Releases the location watch. Safe to call more than once.
    pub fn unmount(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.stop();
            info!("Map view unmounted");
        }
    }

    pub fn is_watching(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    pub fn handle_event(&mut self, event: Event) {
        let now = Instant::now();
        match event {
            Event::Tick => self.on_tick(now),
            Event::Input(key) => self.handle_key(key),
            Event::IpLookup(Ok(lookup)) => {
                self.tracker.on_ip_lookup(&lookup, now);
            }
            Event::IpLookup(Err(message)) => self.tracker.on_ip_error(&message),
            Event::Position(Ok(fix)) => self.tracker.on_fix(fix, now),
            Event::Position(Err(e)) => {
                warn!("Location error: {}", e);
                self.tracker.on_position_error(&e);
            }
        }
    }

    pub fn on_tick(&mut self, now: Instant) {
        self.tracker.tick(now);
    }

    pub fn handle_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.should_quit = true
            }
            KeyCode::Char('+') | KeyCode::Char('=') => self.tracker.zoom_by(ZOOM_STEP),
            KeyCode::Char('-') => self.tracker.zoom_by(-ZOOM_STEP),
            KeyCode::Char('c') => {
                self.tracker.recenter(Instant::now());
            }
            _ => {}
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.unmount();
    }
}
