//! Dedup and debounce filters
//!
//! Applied before events reach the sequencer, so suppressed input never consumes
//! a sequence number. State lives on the pipeline handle and survives UI remounts;
//! it resets when the section/page context changes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identity fragments of a clicked element
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

impl ClickTarget {
    pub fn with_test_id(test_id: impl Into<String>) -> Self {
        Self {
            test_id: Some(test_id.into()),
            ..Self::default()
        }
    }

    pub fn with_element_id(element_id: impl Into<String>) -> Self {
        Self {
            element_id: Some(element_id.into()),
            ..Self::default()
        }
    }

    /// Stable id: test id, then element id, then first class token
    pub fn resolve(&self) -> String {
        let non_empty = |s: &Option<String>| {
            s.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        non_empty(&self.test_id)
            .or_else(|| non_empty(&self.element_id))
            .or_else(|| {
                self.class_name
                    .as_deref()
                    .and_then(|c| c.split_whitespace().next())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Suppresses repeat clicks on one target inside the merge window
#[derive(Debug, Clone)]
pub struct ClickMerger {
    window: Duration,
    last_target: Option<String>,
    last_time: Option<DateTime<Utc>>,
}

impl ClickMerger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_target: None,
            last_time: None,
        }
    }

    /// Returns true when the click should be logged. A suppressed click does not
    /// extend the window.
    pub fn admit(&mut self, target: &str, now: DateTime<Utc>) -> bool {
        if let (Some(last_target), Some(last_time)) = (&self.last_target, self.last_time) {
            if last_target == target && now - last_time < self.window {
                return false;
            }
        }
        self.last_target = Some(target.to_string());
        self.last_time = Some(now);
        true
    }

    pub fn reset(&mut self) {
        self.last_target = None;
        self.last_time = None;
    }
}

/// Emits scroll depth only when it crosses into a new bucket
#[derive(Debug, Clone)]
pub struct ScrollQuantizer {
    threshold: u32,
    last_bucket: u32,
}

impl ScrollQuantizer {
    pub fn new(threshold_pct: u32) -> Self {
        Self {
            threshold: threshold_pct.max(1),
            last_bucket: 0,
        }
    }

    /// Floor a depth to its bucket. Depth is clamped to 0..=100.
    pub fn bucket(&self, depth_pct: f64) -> u32 {
        let depth = if depth_pct.is_finite() {
            depth_pct.clamp(0.0, 100.0)
        } else {
            0.0
        };
        ((depth / self.threshold as f64).floor() as u32) * self.threshold
    }

    /// Returns the bucket to emit, or `None` when it matches the last one.
    /// Direction does not matter.
    pub fn admit(&mut self, depth_pct: f64) -> Option<u32> {
        let bucket = self.bucket(depth_pct);
        if bucket == self.last_bucket {
            return None;
        }
        self.last_bucket = bucket;
        Some(bucket)
    }

    pub fn reset(&mut self) {
        self.last_bucket = 0;
    }
}

/// Per-event-type filters bound to the current section context
#[derive(Debug, Clone)]
pub struct DedupLayer {
    section: Option<String>,
    clicks: ClickMerger,
    scroll: ScrollQuantizer,
}

impl DedupLayer {
    pub fn new(click_window: Duration, scroll_threshold_pct: u32) -> Self {
        Self {
            section: None,
            clicks: ClickMerger::new(click_window),
            scroll: ScrollQuantizer::new(scroll_threshold_pct),
        }
    }

    /// Move to a section context. Filters reset when it differs from the
    /// current one; `None` means the caller did not say and keeps the current
    /// context.
    pub fn enter_section(&mut self, section: Option<&str>) {
        let Some(section) = section else {
            return;
        };
        if self.section.as_deref() != Some(section) {
            self.section = Some(section.to_string());
            self.reset();
        }
    }

    /// Forget the section context and all filter state
    pub fn clear(&mut self) {
        self.section = None;
        self.reset();
    }

    pub fn admit_click(
        &mut self,
        target: &str,
        section: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        self.enter_section(section);
        self.clicks.admit(target, now)
    }

    pub fn admit_scroll(&mut self, depth_pct: f64, section: Option<&str>) -> Option<u32> {
        self.enter_section(section);
        self.scroll.admit(depth_pct)
    }

    pub fn reset(&mut self) {
        self.clicks.reset();
        self.scroll.reset();
    }

    pub fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()
    }

    #[test]
    fn test_target_resolution_order() {
        let full = ClickTarget {
            test_id: Some("submit-btn".into()),
            element_id: Some("submit".into()),
            class_name: Some("btn primary".into()),
        };
        assert_eq!(full.resolve(), "submit-btn");

        let no_test_id = ClickTarget {
            test_id: Some("  ".into()),
            ..full.clone()
        };
        assert_eq!(no_test_id.resolve(), "submit");

        let class_only = ClickTarget {
            class_name: Some("  btn primary".into()),
            ..ClickTarget::default()
        };
        assert_eq!(class_only.resolve(), "btn");

        assert_eq!(ClickTarget::default().resolve(), "unknown");
    }

    #[test]
    fn test_click_merge_window() {
        let mut merger = ClickMerger::new(Duration::milliseconds(500));
        assert!(merger.admit("a", t0()));
        assert!(!merger.admit("a", t0() + Duration::milliseconds(100)));
        assert!(merger.admit("a", t0() + Duration::milliseconds(600)));
    }

    #[test]
    fn test_suppressed_click_does_not_extend_window() {
        let mut merger = ClickMerger::new(Duration::milliseconds(500));
        assert!(merger.admit("a", t0()));
        assert!(!merger.admit("a", t0() + Duration::milliseconds(400)));
        assert!(merger.admit("a", t0() + Duration::milliseconds(500)));
    }

    #[test]
    fn test_different_target_is_admitted() {
        let mut merger = ClickMerger::new(Duration::milliseconds(500));
        assert!(merger.admit("a", t0()));
        assert!(merger.admit("b", t0() + Duration::milliseconds(10)));
        assert!(merger.admit("a", t0() + Duration::milliseconds(20)));
    }

    #[test]
    fn test_scroll_buckets() {
        let mut quantizer = ScrollQuantizer::new(10);
        let emitted: Vec<u32> = [3.0, 12.0, 19.0, 25.0]
            .iter()
            .filter_map(|d| quantizer.admit(*d))
            .collect();
        assert_eq!(emitted, vec![10, 20]);
    }

    #[test]
    fn test_scroll_is_direction_agnostic() {
        let mut quantizer = ScrollQuantizer::new(10);
        assert_eq!(quantizer.admit(45.0), Some(40));
        assert_eq!(quantizer.admit(31.0), Some(30));
        assert_eq!(quantizer.admit(39.9), None);
        assert_eq!(quantizer.admit(100.0), Some(100));
        assert_eq!(quantizer.admit(250.0), None);
    }

    #[test]
    fn test_section_change_resets_filters() {
        let mut layer = DedupLayer::new(Duration::milliseconds(500), 10);
        assert!(layer.admit_click("a", Some("s1"), t0()));
        assert_eq!(layer.admit_scroll(35.0, Some("s1")), Some(30));

        // Same section keeps state
        assert!(!layer.admit_click("a", Some("s1"), t0() + Duration::milliseconds(50)));
        assert_eq!(layer.admit_scroll(36.0, Some("s1")), None);

        // New section resets
        assert!(layer.admit_click("a", Some("s2"), t0() + Duration::milliseconds(60)));
        assert_eq!(layer.admit_scroll(36.0, Some("s2")), Some(30));
        assert_eq!(layer.section(), Some("s2"));

        // Unspecified context keeps state
        assert_eq!(layer.admit_scroll(37.0, None), None);
        assert_eq!(layer.section(), Some("s2"));

        layer.clear();
        assert_eq!(layer.section(), None);
        assert_eq!(layer.admit_scroll(37.0, None), Some(30));
    }
}
