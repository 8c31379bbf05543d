//! Ephemeral presence: remote cursors and who is looking where.
//!
//! Presence never touches the replicated document. Frames are relayed by the
//! server to the other members of a room and interpreted on the receiving
//! side, which smooths motion and evicts peers that went quiet.
//!
//! ```text
//! Local pointer move
//!       │
//!       ▼
//! PresenceEmitter::cursor()      (throttled to ~30 fps)
//!       │
//!       ▼   SyncMessage::Presence   (room relay, never echoed)
//! PresenceBoard::apply()         (stale frames dropped)
//!       │
//!       ▼
//! PresenceBoard::tick()          (interpolate, fade, evict)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Lerp factor applied per 60 Hz frame.
pub const SMOOTHING: f32 = 0.18;
/// Quiet period after which a cursor starts fading.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);
/// Fade duration before a quiet cursor is removed.
pub const DEFAULT_FADE_WINDOW: Duration = Duration::from_millis(400);
/// Minimum interval between outgoing cursor frames (30 fps).
pub const CURSOR_INTERVAL: Duration = Duration::from_millis(33);

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// 2D position in local surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Vec2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Linear interpolation toward `target` by factor `t` ∈ [0, 1].
    pub fn lerp(&self, target: &Vec2, t: f32) -> Vec2 {
        Vec2 {
            x: self.x + (target.x - self.x) * t,
            y: self.y + (target.y - self.y) * t,
        }
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// How the coordinates of a presence frame are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordsKind {
    /// Fractions of the sender's workspace surface, both in [0, 1].
    Normalized,
    /// Viewport pixels.
    Client,
}

/// One cursor frame as relayed between room members.
///
/// `user_id` and `display_name` are overwritten by the server with the
/// sender's verified identity before relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: String,
    pub display_name: String,
    /// CSS color; receivers derive one from `user_id` when absent.
    pub color: Option<String>,
    pub x: f32,
    pub y: f32,
    pub coords_kind: CoordsKind,
    /// Sender-monotonic timestamp (ms).
    pub timestamp: u64,
}

impl PresenceEvent {
    /// Interpret a loosely-shaped JSON cursor payload.
    ///
    /// Accepts wrapper objects (`data`, `payload`, `message`), several id
    /// and name keys, and the coordinate shapes handled by
    /// [`extract_coords`]. Returns `None` when no user id or coordinates
    /// can be found.
    pub fn from_json(raw: &Value) -> Option<PresenceEvent> {
        let p = unwrap_payload(raw);
        let obj = p.as_object()?;
        let user = obj.get("user").and_then(Value::as_object);

        let user_id = ["userId", "user_id", "id", "uid"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(scalar_string))
            .or_else(|| obj.get("user").and_then(scalar_string))
            .or_else(|| {
                user.and_then(|u| {
                    ["id", "userId"]
                        .iter()
                        .find_map(|k| u.get(*k).and_then(scalar_string))
                })
            })?;

        let display_name = ["name", "displayName"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .or_else(|| {
                user.and_then(|u| {
                    ["name", "username"]
                        .iter()
                        .find_map(|k| u.get(*k).and_then(Value::as_str))
                })
            })
            .map(str::to_string)
            .unwrap_or_else(|| user_id.clone());

        let color = obj
            .get("color")
            .and_then(Value::as_str)
            .or_else(|| user.and_then(|u| u.get("color")).and_then(Value::as_str))
            .map(str::to_string);

        let (x, y, coords_kind) = extract_coords(p)?;

        let timestamp = ["timestamp", "ts"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_u64))
            .unwrap_or(0);

        Some(PresenceEvent {
            user_id,
            display_name,
            color,
            x,
            y,
            coords_kind,
            timestamp,
        })
    }
}

fn unwrap_payload(raw: &Value) -> &Value {
    for key in ["data", "payload", "message"] {
        if let Some(inner) = raw.get(key) {
            if inner.is_object() {
                return inner;
            }
        }
    }
    raw
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(v: &Value) -> Option<f32> {
    match v {
        Value::Number(n) => n.as_f64().map(|f| f as f32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_number(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<f32> {
    keys.iter().find_map(|k| obj.get(*k).and_then(number))
}

/// Extract `(x, y, kind)` from a cursor payload.
///
/// Normalized keys (`nx/ny`, `normalizedX/normalizedY`,
/// `normalized_x/normalized_y`) win. Otherwise `x/y`, `clientX/clientY` or
/// `pageX/pageY` are read; an explicit `coordsKind: "normalized"` marks them
/// normalized, and with no explicit kind both values inside [0, 1] are taken
/// as normalized too. A nested `position` object is searched last.
pub fn extract_coords(v: &Value) -> Option<(f32, f32, CoordsKind)> {
    let obj = v.as_object()?;

    let nx = first_number(obj, &["nx", "normalizedX", "normalized_x"]);
    let ny = first_number(obj, &["ny", "normalizedY", "normalized_y"]);
    if let (Some(x), Some(y)) = (nx, ny) {
        return Some((x, y, CoordsKind::Normalized));
    }

    let x = first_number(obj, &["x", "clientX", "pageX"]);
    let y = first_number(obj, &["y", "clientY", "pageY"]);
    if let (Some(x), Some(y)) = (x, y) {
        let explicit = obj
            .get("coordsKind")
            .or_else(|| obj.get("coords_kind"))
            .and_then(Value::as_str);
        let kind = match explicit {
            Some(k) if k.eq_ignore_ascii_case("normalized") => CoordsKind::Normalized,
            Some(_) => CoordsKind::Client,
            None if (0.0..=1.0).contains(&x) && (0.0..=1.0).contains(&y) => {
                CoordsKind::Normalized
            }
            None => CoordsKind::Client,
        };
        return Some((x, y, kind));
    }

    obj.get("position").and_then(extract_coords)
}

/// Stable hue in [0, 360) derived from a user id.
pub fn hue_for_user(user_id: &str) -> u32 {
    user_id
        .chars()
        .fold(0u32, |h, c| (h * 31 + c as u32) % 360)
}

/// Default CSS color for a user without an explicit one.
pub fn color_for_user(user_id: &str) -> String {
    format!("hsl({}, 70%, 50%)", hue_for_user(user_id))
}

/// Receiver's workspace rectangle, in viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Surface {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl Surface {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Map frame coordinates onto this surface.
    pub fn map(&self, x: f32, y: f32, kind: CoordsKind) -> Vec2 {
        match kind {
            CoordsKind::Normalized => {
                Vec2::new(self.left + x * self.width, self.top + y * self.height)
            }
            CoordsKind::Client => Vec2::new(x, y),
        }
    }
}

impl Default for Surface {
    fn default() -> Self {
        Self::new(0.0, 0.0, 1920.0, 1080.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Receiver side
// ───────────────────────────────────────────────────────────────────

/// Remote peer's cursor as tracked locally.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    /// Rendered position (interpolated).
    current: Vec2,
    /// Latest network position.
    target: Vec2,
    last_seen: Instant,
    last_timestamp: u64,
}

impl PresenceEntry {
    pub fn current(&self) -> Vec2 {
        self.current
    }

    pub fn target(&self) -> Vec2 {
        self.target
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// One cursor ready to draw.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorFrame {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub position: Vec2,
    /// 1.0 while active, falling to 0.0 across the fade window.
    pub opacity: f32,
}

/// Tracks the remote cursors of one room on the receiving side.
pub struct PresenceBoard {
    local_user_id: Option<String>,
    surface: Surface,
    entries: HashMap<String, PresenceEntry>,
    inactivity_timeout: Duration,
    fade_window: Duration,
}

impl PresenceBoard {
    pub fn new(surface: Surface) -> Self {
        Self {
            local_user_id: None,
            surface,
            entries: HashMap::new(),
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            fade_window: DEFAULT_FADE_WINDOW,
        }
    }

    /// Ignore frames carrying this user id.
    pub fn with_local_user(mut self, user_id: impl Into<String>) -> Self {
        self.local_user_id = Some(user_id.into());
        self
    }

    pub fn with_timeouts(mut self, inactivity: Duration, fade: Duration) -> Self {
        self.inactivity_timeout = inactivity;
        self.fade_window = fade;
        self
    }

    pub fn set_surface(&mut self, surface: Surface) {
        self.surface = surface;
    }

    pub fn apply(&mut self, event: &PresenceEvent) -> bool {
        self.apply_at(event, Instant::now())
    }

    /// Record a frame received at `now`.
    ///
    /// Returns `false` for our own frames and for frames older than the
    /// last one seen from the same user.
    pub fn apply_at(&mut self, event: &PresenceEvent, now: Instant) -> bool {
        if self.local_user_id.as_deref() == Some(event.user_id.as_str()) {
            return false;
        }

        let position = self.surface.map(event.x, event.y, event.coords_kind);
        let color = event
            .color
            .clone()
            .unwrap_or_else(|| color_for_user(&event.user_id));

        match self.entries.get_mut(&event.user_id) {
            Some(entry) => {
                if event.timestamp < entry.last_timestamp {
                    log::trace!(
                        "Dropping stale cursor frame from {} ({} < {})",
                        event.user_id,
                        event.timestamp,
                        entry.last_timestamp
                    );
                    return false;
                }
                entry.target = position;
                entry.display_name = event.display_name.clone();
                entry.color = color;
                entry.last_seen = now;
                entry.last_timestamp = event.timestamp;
            }
            None => {
                // First sighting snaps to the target instead of sliding in
                self.entries.insert(
                    event.user_id.clone(),
                    PresenceEntry {
                        user_id: event.user_id.clone(),
                        display_name: event.display_name.clone(),
                        color,
                        current: position,
                        target: position,
                        last_seen: now,
                        last_timestamp: event.timestamp,
                    },
                );
            }
        }
        true
    }

    /// Forget a peer immediately (member left).
    pub fn remove(&mut self, user_id: &str) -> bool {
        self.entries.remove(user_id).is_some()
    }

    /// Advance one render frame of length `dt` ending at `now`.
    ///
    /// Active cursors move toward their targets at a frame-rate independent
    /// rate. Cursors quiet for longer than the inactivity timeout fade over
    /// the fade window and are removed once it elapses.
    pub fn tick(&mut self, now: Instant, dt: Duration) -> Vec<CursorFrame> {
        let timeout = self.inactivity_timeout;
        let fade = self.fade_window;
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_seen) <= timeout + fade);

        let t = 1.0 - (1.0 - SMOOTHING).powf(dt.as_secs_f32() * 60.0);
        let t = t.clamp(0.0, 1.0);

        self.entries
            .values_mut()
            .map(|e| {
                let idle = now.saturating_duration_since(e.last_seen);
                let opacity = if idle > timeout {
                    let faded = (idle - timeout).as_secs_f32() / fade.as_secs_f32().max(f32::EPSILON);
                    (1.0 - faded).max(0.0)
                } else {
                    e.current = e.current.lerp(&e.target, t);
                    1.0
                };
                CursorFrame {
                    user_id: e.user_id.clone(),
                    display_name: e.display_name.clone(),
                    color: e.color.clone(),
                    position: e.current,
                    opacity,
                }
            })
            .collect()
    }

    pub fn entry(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Sender side
// ───────────────────────────────────────────────────────────────────

/// Throttles and stamps the local user's cursor frames.
pub struct PresenceEmitter {
    user_id: String,
    display_name: String,
    color: Option<String>,
    interval: Duration,
    last_sent: Option<Instant>,
    last_timestamp: u64,
}

impl PresenceEmitter {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            color: None,
            interval: CURSOR_INTERVAL,
            last_sent: None,
            last_timestamp: 0,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    /// Create with a custom throttle interval (for testing).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Frame for a pointer move, or `None` when throttled.
    pub fn cursor(&mut self, x: f32, y: f32, kind: CoordsKind) -> Option<PresenceEvent> {
        if let Some(last) = self.last_sent {
            if last.elapsed() < self.interval {
                return None;
            }
        }
        Some(self.force(x, y, kind))
    }

    /// Frame regardless of throttling.
    pub fn force(&mut self, x: f32, y: f32, kind: CoordsKind) -> PresenceEvent {
        self.last_sent = Some(Instant::now());
        // Wall clock, bumped so frames stay strictly ordered
        self.last_timestamp = schemaflow_core::now_millis().max(self.last_timestamp + 1);
        PresenceEvent {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            color: self.color.clone(),
            x,
            y,
            coords_kind: kind,
            timestamp: self.last_timestamp,
        }
    }
}

// ===================================================================
// Tests
// ===================================================================
