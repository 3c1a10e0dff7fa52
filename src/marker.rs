//! Process-wide default marker icon.
//!
//! The first view to mount installs the icon; every later call is a no-op,
//! however many views come and go.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tracing::debug;

static DEFAULTS: IconDefaults = IconDefaults::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerIcon {
    pub glyph: String,
    /// Used when the canvas has resolution to spare.
    pub retina_glyph: String,
    /// Drawn on the exact point, under the glyph.
    pub shadow_glyph: String,
    /// Cell of the glyph that points at the location: columns right and rows
    /// down from the glyph's own position.
    pub anchor: (u16, u16),
}

impl MarkerIcon {
    pub fn builtin() -> Self {
        Self {
            glyph: "📍".to_string(),
            retina_glyph: "⌖".to_string(),
            shadow_glyph: "·".to_string(),
            anchor: (0, 1),
        }
    }

    /// Where to print the glyph so its anchor cell lands on `(x, y)`, given
    /// the canvas size of one cell in each axis.
    pub fn glyph_origin(&self, (x, y): (f64, f64), (cell_w, cell_h): (f64, f64)) -> (f64, f64) {
        (
            x - f64::from(self.anchor.0) * cell_w,
            y + f64::from(self.anchor.1) * cell_h,
        )
    }
}

/// An install-once slot for the default icon.
pub struct IconDefaults {
    installed: AtomicBool,
    icon: OnceLock<MarkerIcon>,
}

impl IconDefaults {
    pub const fn new() -> Self {
        Self {
            installed: AtomicBool::new(false),
            icon: OnceLock::new(),
        }
    }

    /// Installs `icon`. Returns `false` if one was already set.
    pub fn install(&self, icon: MarkerIcon) -> bool {
        if self.installed.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("Installing default marker icon {:?}", icon);
        self.icon.get_or_init(|| icon);
        true
    }

    pub fn icon(&self) -> MarkerIcon {
        self.icon.get().cloned().unwrap_or_else(MarkerIcon::builtin)
    }
}

impl Default for IconDefaults {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs `icon` as the process default. Returns `false` if one was
/// already set.
pub fn install_defaults(icon: MarkerIcon) -> bool {
    DEFAULTS.install(icon)
}

pub fn default_icon() -> MarkerIcon {
    DEFAULTS.icon()
}
