//! TUI rendering for the map view.
//!
//! One full-screen canvas world map centred on the viewport, a marker and
//! popup for the latest device fix, and a status panel drawn over the
//! top-left corner.

use crate::app::App;
use crate::marker;
use crate::models::LocationFix;
use crate::tracker::{CenterSource, Viewport};
use chrono::Local;
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        canvas::*,
        *,
    },
};

/// Approximate pixels covered by one terminal cell, for slippy-map scaling.
const CELL_WIDTH_PX: f64 = 8.0;
const CELL_HEIGHT_PX: f64 = 16.0;
const TILE_PX: f64 = 256.0;

/// Canvases at least this wide get the high-density marker glyph.
const RETINA_MIN_WIDTH: u16 = 120;

/// Renders one frame of the map view.
///
/// # Arguments
///
/// * `f` - The ratatui frame to draw into (from `terminal.draw()`).
/// * `app` - Current application state (tracker, viewport, latest fix).
pub fn render(f: &mut Frame, app: &App) {
    let area = f.size();

    render_map(f, app, area);

    if let Some(fix) = &app.tracker.latest_fix {
        render_popup(f, fix, area);
    }

    render_status_panel(f, app, area);
}

/// Longitude and latitude bounds visible in `area` at the viewport's zoom.
///
/// Uses web-map scaling: a 256 px tile spans `360 / 2^zoom` degrees of
/// longitude; latitude is compressed by `cos(lat)` like Mercator near the
/// centre.
pub fn viewport_bounds(viewport: &Viewport, area: Rect) -> ([f64; 2], [f64; 2]) {
    let deg_per_px = 360.0 / (TILE_PX * 2f64.powf(viewport.zoom));
    let half_w = f64::from(area.width) * CELL_WIDTH_PX * deg_per_px / 2.0;
    let half_h = f64::from(area.height) * CELL_HEIGHT_PX * deg_per_px / 2.0
        * viewport.center.lat.to_radians().cos().max(0.01);

    let c = viewport.center;
    ([c.lon - half_w, c.lon + half_w], [c.lat - half_h, c.lat + half_h])
}

fn render_map(f: &mut Frame, app: &App, area: Rect) {
    let viewport = &app.tracker.viewport;
    let (x_bounds, y_bounds) = viewport_bounds(viewport, area);

    let icon = marker::default_icon();
    let glyph = if area.width >= RETINA_MIN_WIDTH {
        icon.retina_glyph.clone()
    } else {
        icon.glyph.clone()
    };

    // Canvas units covered by one terminal cell, inside the border
    let cell = (
        (x_bounds[1] - x_bounds[0]) / f64::from(area.width.saturating_sub(2).max(1)),
        (y_bounds[1] - y_bounds[0]) / f64::from(area.height.saturating_sub(2).max(1)),
    );

    let source = match app.tracker.source {
        CenterSource::Unset => "waiting",
        CenterSource::IpDerived(_) => "ip",
        CenterSource::DeviceDerived(_) => "device",
    };
    let history = &app.tracker.history;
    let title = format!(
        " Pinpoint │ {:.4}, {:.4} │ z{:.1} │ {} │ trail {} ",
        viewport.center.lat,
        viewport.center.lon,
        viewport.zoom,
        source,
        history.len()
    );
    let trail: Vec<(f64, f64)> = history.iter().map(|fix| (fix.lon, fix.lat)).collect();

    let canvas = Canvas::default()
        .block(
            Block::bordered()
                .title(title)
                .title(
                    Title::from(" q quit  +/- zoom  c recenter ").position(Position::Bottom),
                )
                .border_type(BorderType::Rounded),
        )
        .marker(symbols::Marker::Braille)
        .x_bounds(x_bounds)
        .y_bounds(y_bounds)
        .paint(|ctx| {
            ctx.draw(&Map {
                color: Color::Rgb(60, 60, 60),
                resolution: MapResolution::High,
            });
            ctx.layer();

            if !history.is_empty() {
                ctx.draw(&Points {
                    coords: &trail,
                    color: Color::Yellow,
                });
            }

            // Only device fixes get a marker, never the IP estimate
            if let Some(fix) = &app.tracker.latest_fix {
                if fix.accuracy.is_finite() && fix.accuracy > 0.0 {
                    ctx.draw(&Circle {
                        x: fix.lon,
                        y: fix.lat,
                        radius: meters_to_degrees(fix.accuracy),
                        color: Color::Blue,
                    });
                }
                ctx.print(
                    fix.lon,
                    fix.lat,
                    Line::from(Span::styled(
                        icon.shadow_glyph.clone(),
                        Style::default().fg(Color::DarkGray),
                    )),
                );
                let (x, y) = icon.glyph_origin((fix.lon, fix.lat), cell);
                ctx.print(
                    x,
                    y,
                    Line::from(Span::styled(
                        glyph.clone(),
                        Style::default()
                            .fg(Color::Red)
                            .add_modifier(Modifier::BOLD),
                    )),
                );
            }
        });

    f.render_widget(canvas, area);
}

/// Rough equatorial conversion, good enough for drawing an accuracy ring.
fn meters_to_degrees(meters: f64) -> f64 {
    meters / 111_320.0
}

pub fn format_accuracy(accuracy: f64) -> String {
    if accuracy.is_finite() {
        format!("±{}m", accuracy.round())
    } else {
        "±?m".to_string()
    }
}

pub fn popup_lines(fix: &LocationFix) -> Vec<Line<'static>> {
    let label = Style::default().add_modifier(Modifier::BOLD);
    vec![
        Line::from(Span::styled(
            "📱 Live Location",
            label.fg(Color::Cyan),
        )),
        Line::from(vec![
            Span::styled("🛰 Lat: ", label),
            Span::raw(format!("{:.8}", fix.lat)),
        ]),
        Line::from(vec![
            Span::styled("🛰 Lon: ", label),
            Span::raw(format!("{:.8}", fix.lon)),
        ]),
        Line::from(vec![
            Span::styled("📊 Accuracy: ", label),
            Span::raw(format_accuracy(fix.accuracy)),
        ]),
        Line::from(vec![
            Span::styled("🕐 ", label),
            Span::raw(
                fix.timestamp
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            ),
        ]),
    ]
}

fn render_popup(f: &mut Frame, fix: &LocationFix, area: Rect) {
    let width = 34.min(area.width);
    let height = 7.min(area.height);
    let popup = Rect {
        x: area.right().saturating_sub(width + 1),
        y: area.bottom().saturating_sub(height + 1),
        width,
        height,
    };

    let p = Paragraph::new(popup_lines(fix)).block(
        Block::bordered()
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(Color::DarkGray)),
    );
    f.render_widget(Clear, popup);
    f.render_widget(p, popup);
}

pub fn status_lines(app: &App) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    if app.tracker.is_tracking {
        lines.push(Line::from(Span::styled(
            "🔄 Live tracking active...",
            Style::default().fg(Color::Green),
        )));
    }
    if !app.tracker.last_error.is_empty() {
        lines.push(Line::from(Span::styled(
            app.tracker.last_error.clone(),
            Style::default().fg(Color::Red),
        )));
    }
    lines
}

fn render_status_panel(f: &mut Frame, app: &App, area: Rect) {
    let lines = status_lines(app);
    if lines.is_empty() {
        return;
    }

    let width = lines
        .iter()
        .map(|l| l.width() as u16 + 4)
        .max()
        .unwrap_or(0)
        .min(area.width.saturating_sub(2));
    let height = (lines.len() as u16 + 2).min(area.height.saturating_sub(1));
    let panel = Rect {
        x: area.x + 1,
        y: area.y + 1,
        width,
        height,
    };

    let p = Paragraph::new(lines)
        .wrap(Wrap { trim: true })
        .block(
            Block::bordered()
                .border_type(BorderType::Rounded)
                .border_style(Style::default().fg(Color::Gray))
                .padding(Padding::horizontal(1)),
        );
    f.render_widget(Clear, panel);
    f.render_widget(p, panel);
}
