use std::time::{Duration, Instant};

use crate::client::models::store::StoreChange;
use crate::common::models::MessageId;

/// Geometry reported by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportMetrics {
    pub scroll_offset: f64,
    pub viewport_height: f64,
    pub content_height: f64,
}

impl ViewportMetrics {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.content_height - self.viewport_height - self.scroll_offset).max(0.0)
    }
}

/// What the anchor manager needs from whatever draws the list.
pub trait Viewport {
    fn scroll_to_end(&mut self);
    fn scroll_by(&mut self, delta: f64);
    fn metrics(&self) -> ViewportMetrics;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorState {
    AtBottom,
    Anchored,
    /// User scroll input is ignored until `until`; `resume_at_bottom` is the
    /// state taken afterwards.
    Suppressed { until: Instant, resume_at_bottom: bool },
}

/// Decides how the viewport follows list mutations. Never touches data.
#[derive(Debug)]
pub struct AnchorManager {
    state: AnchorState,
    unseen_divider: Option<MessageId>,
    switch_suppression: Duration,
    prepend_suppression: Duration,
    bottom_threshold: f64,
    last_content_height: f64,
}

impl AnchorManager {
    pub fn new(switch_suppression: Duration) -> Self {
        Self {
            state: AnchorState::AtBottom,
            unseen_divider: None,
            switch_suppression,
            prepend_suppression: Duration::from_millis(150),
            bottom_threshold: 24.0,
            last_content_height: 0.0,
        }
    }

    pub fn with_bottom_threshold(mut self, threshold: f64) -> Self {
        self.bottom_threshold = threshold;
        self
    }

    pub fn state(&mut self, now: Instant) -> AnchorState {
        self.expire(now);
        self.state
    }

    /// First row that arrived while the user was reading older messages.
    pub fn unseen_divider(&self) -> Option<MessageId> {
        self.unseen_divider
    }

    pub fn on_user_scroll(&mut self, metrics: ViewportMetrics, now: Instant) {
        self.last_content_height = metrics.content_height;
        self.expire(now);
        if matches!(self.state, AnchorState::Suppressed { .. }) {
            return;
        }
        if metrics.distance_from_bottom() <= self.bottom_threshold {
            self.state = AnchorState::AtBottom;
            self.unseen_divider = None;
        } else {
            self.state = AnchorState::Anchored;
        }
    }

    pub fn on_append(&mut self, first_new: MessageId, viewport: &mut dyn Viewport, now: Instant) {
        self.expire(now);
        if self.follows_tail() {
            viewport.scroll_to_end();
        } else if self.unseen_divider.is_none() {
            self.unseen_divider = Some(first_new);
        }
        self.last_content_height = viewport.metrics().content_height;
    }

    /// The user's own send always brings the newest message into view.
    pub fn on_own_send(&mut self, viewport: &mut dyn Viewport, now: Instant) {
        self.expire(now);
        viewport.scroll_to_end();
        if !matches!(self.state, AnchorState::Suppressed { .. }) {
            self.state = AnchorState::AtBottom;
        }
        self.unseen_divider = None;
        self.last_content_height = viewport.metrics().content_height;
    }

    pub fn on_prepend(&mut self, height_added: f64, viewport: &mut dyn Viewport, now: Instant) {
        self.expire(now);
        if height_added > 0.0 {
            viewport.scroll_by(height_added);
        }
        self.state = AnchorState::Suppressed {
            until: now + self.prepend_suppression,
            resume_at_bottom: self.follows_tail(),
        };
        self.last_content_height = viewport.metrics().content_height;
    }

    pub fn on_thread_switch(&mut self, now: Instant) {
        self.unseen_divider = None;
        self.last_content_height = 0.0;
        self.state = AnchorState::Suppressed { until: now + self.switch_suppression, resume_at_bottom: true };
    }

    /// Feeds one store notification through the state machine.
    pub fn apply_change(&mut self, change: &StoreChange, viewport: &mut dyn Viewport, now: Instant) {
        match change {
            StoreChange::Opened { .. } => {
                self.on_thread_switch(now);
                viewport.scroll_to_end();
            }
            StoreChange::Merged { report, .. } => {
                if !report.removed.is_empty() {
                    self.last_content_height = viewport.metrics().content_height;
                }
                if report.prepended > 0 {
                    let added = viewport.metrics().content_height - self.last_content_height;
                    self.on_prepend(added.max(0.0), viewport, now);
                }
                match report.appended_from {
                    Some(first) if first.is_local() => self.on_own_send(viewport, now),
                    Some(first) => self.on_append(first, viewport, now),
                    None => {}
                }
            }
            _ => {}
        }
    }

    fn follows_tail(&self) -> bool {
        match self.state {
            AnchorState::AtBottom => true,
            AnchorState::Anchored => false,
            AnchorState::Suppressed { resume_at_bottom, .. } => resume_at_bottom,
        }
    }

    fn expire(&mut self, now: Instant) {
        if let AnchorState::Suppressed { until, resume_at_bottom } = self.state {
            if now >= until {
                self.state = if resume_at_bottom { AnchorState::AtBottom } else { AnchorState::Anchored };
            }
        }
    }
}
