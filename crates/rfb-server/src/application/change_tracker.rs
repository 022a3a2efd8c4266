//! Change tracking: which parts of the framebuffer need to be sent again.
//!
//! Two kinds of change are recorded:
//!
//! - **changed** – pixels that must be redrawn from the framebuffer;
//! - **copied** – pixels that moved by a fixed `copy_delta` and can be
//!   reproduced on the viewer by copying its own earlier content.
//!
//! A consumer applies the copy first and the changes second; a pixel that is
//! both copied and changed is sent as changed.
//!
//! [`SimpleUpdateTracker`] just accumulates.  [`ComparingUpdateTracker`] adds
//! an optional pass that re-reads the framebuffer and drops blocks whose
//! pixels did not actually change since the previous pass.

use rfb_core::{ManagedPixelBuffer, PixelBuffer, Point, Rect, Region};
use tracing::info;

/// Edge length of the square blocks compared by [`ComparingUpdateTracker`].
pub const BLOCK_SIZE: i32 = 64;

/// A snapshot of pending changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateInfo {
    pub changed: Region,
    pub copied: Region,
    pub copy_delta: Point,
}

impl UpdateInfo {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.copied.is_empty()
    }

    /// Every pixel touched by either kind of change.
    pub fn touched(&self) -> Region {
        self.changed.union(&self.copied)
    }
}

// ── SimpleUpdateTracker ───────────────────────────────────────────────────────

/// Accumulates changed and copied regions.
#[derive(Debug, Clone)]
pub struct SimpleUpdateTracker {
    changed: Region,
    copied: Region,
    copy_delta: Point,
    copy_enabled: bool,
}

impl Default for SimpleUpdateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleUpdateTracker {
    pub fn new() -> Self {
        Self {
            changed: Region::new(),
            copied: Region::new(),
            copy_delta: Point::default(),
            copy_enabled: true,
        }
    }

    /// With copies disabled every copy is recorded as a plain change.
    pub fn set_copy_enabled(&mut self, enabled: bool) {
        self.copy_enabled = enabled;
    }

    pub fn add_changed(&mut self, region: &Region) {
        self.changed.assign_union(region);
    }

    /// Records that `dest` now holds what was at `dest - delta`.
    ///
    /// Only one copy delta can be pending.  A copy continuing the previous one
    /// (its source overlaps the previous destination) composes the deltas;
    /// otherwise the larger of the two copies is kept and the other is
    /// downgraded to a change.
    pub fn add_copied(&mut self, dest: &Region, delta: Point) {
        if !self.copy_enabled {
            self.add_changed(dest);
            return;
        }
        if dest.is_empty() {
            return;
        }

        let src = dest.translate(-delta);
        let overlap = src.intersect(&self.copied);

        if overlap.is_empty() {
            let new_area = dest.bounding_rect().area();
            let old_area = self.copied.bounding_rect().area();
            if old_area > new_area {
                // The pending copy is bigger; keep it.
                self.changed.assign_union(dest);
            } else {
                // Anything still waiting to be redrawn inside the source
                // moves along with the copy.
                let invalid_src = src.intersect(&self.changed).translate(delta);
                self.changed.assign_union(&invalid_src);
                let previous = std::mem::take(&mut self.copied);
                self.changed.assign_union(&previous);
                self.copied = dest.clone();
                self.copy_delta = delta;
            }
            return;
        }

        let invalid_src = overlap.intersect(&self.changed).translate(delta);
        self.changed.assign_union(&invalid_src);

        let overlap = overlap.translate(delta);
        let non_overlapped = dest.union(&self.copied).subtract(&overlap);
        self.changed.assign_union(&non_overlapped);

        self.copied = overlap;
        self.copy_delta = self.copy_delta + delta;
    }

    /// Removes `region` from everything pending.
    pub fn subtract(&mut self, region: &Region) {
        self.changed.assign_subtract(region);
        self.copied.assign_subtract(region);
    }

    pub fn clear(&mut self) {
        self.changed.clear();
        self.copied.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.copied.is_empty()
    }

    /// Pending changes clipped to `clip`.  Changed area wins over copied area.
    pub fn update_info(&self, clip: &Region) -> UpdateInfo {
        UpdateInfo {
            changed: self.changed.intersect(clip),
            copied: self.copied.subtract(&self.changed).intersect(clip),
            copy_delta: self.copy_delta,
        }
    }

    pub fn changed(&self) -> &Region {
        &self.changed
    }

    pub fn copied(&self) -> &Region {
        &self.copied
    }

    pub fn copy_delta(&self) -> Point {
        self.copy_delta
    }

    fn replace_changed(&mut self, changed: Region) {
        self.changed = changed;
    }
}

// ── ComparingUpdateTracker ────────────────────────────────────────────────────

/// An update tracker that can filter out changes which did not alter pixels.
///
/// Comparison keeps a private copy of the framebuffer.  The first pass after
/// enabling only takes that copy and removes nothing.
#[derive(Debug)]
pub struct ComparingUpdateTracker {
    updates: SimpleUpdateTracker,
    snapshot: ManagedPixelBuffer,
    enabled: bool,
    first_compare: bool,
    total_pixels: u64,
    missed_pixels: u64,
}

impl Default for ComparingUpdateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ComparingUpdateTracker {
    pub fn new() -> Self {
        Self {
            updates: SimpleUpdateTracker::new(),
            snapshot: ManagedPixelBuffer::new(0, 0),
            enabled: true,
            first_compare: true,
            total_pixels: 0,
            missed_pixels: 0,
        }
    }

    pub fn add_changed(&mut self, region: &Region) {
        self.updates.add_changed(region);
    }

    pub fn add_copied(&mut self, dest: &Region, delta: Point) {
        self.updates.add_copied(dest, delta);
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn update_info(&self, clip: &Region) -> UpdateInfo {
        self.updates.update_info(clip)
    }

    pub fn clear(&mut self) {
        self.updates.clear();
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Turns comparison off.  The snapshot is retaken when re-enabled.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.first_compare = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Drops changed blocks whose pixels match the snapshot.
    ///
    /// Returns `true` if anything is still pending afterwards.  Never adds
    /// area: the new changed region is a subset of the old one.
    pub fn compare(&mut self, framebuffer: &dyn PixelBuffer) -> bool {
        if !self.enabled {
            return !self.is_empty();
        }

        let size_changed = self.snapshot.width() != framebuffer.width()
            || self.snapshot.height() != framebuffer.height();
        if self.first_compare || size_changed {
            self.snapshot = ManagedPixelBuffer::snapshot_of(framebuffer);
            self.first_compare = false;
            return !self.is_empty();
        }

        // Mirror pending copies in the snapshot so it matches what viewers
        // will hold once the copy has been applied.
        let delta = self.updates.copy_delta();
        for rect in self.updates.copied().rects() {
            self.snapshot.copy_rect(rect, delta);
        }

        let mut blocks = Vec::new();
        for rect in self.updates.changed().rects() {
            Self::compare_rect(&mut self.snapshot, rect, framebuffer, &mut blocks);
        }
        let new_changed = Region::from_rects(blocks);

        self.total_pixels += self.updates.changed().area();
        self.missed_pixels += new_changed.area();
        self.updates.replace_changed(new_changed);

        !self.is_empty()
    }

    /// Compares `rect` block by block, refreshing the snapshot and collecting
    /// the blocks that differ.
    fn compare_rect(
        snapshot: &mut ManagedPixelBuffer,
        rect: &Rect,
        framebuffer: &dyn PixelBuffer,
        blocks: &mut Vec<Rect>,
    ) {
        for y in (rect.tl.y..rect.br.y).step_by(BLOCK_SIZE as usize) {
            let bottom = (y + BLOCK_SIZE).min(rect.br.y);
            for x in (rect.tl.x..rect.br.x).step_by(BLOCK_SIZE as usize) {
                let right = (x + BLOCK_SIZE).min(rect.br.x);
                let block = Rect::new(x, y, right, bottom);
                if !snapshot.rect_matches(framebuffer, &block) {
                    snapshot.image_rect(framebuffer, &block);
                    blocks.push(block);
                }
            }
        }
    }

    /// Logs how much work the comparison pass saved.
    pub fn log_stats(&self) {
        if self.total_pixels == 0 {
            return;
        }
        let ratio = self.missed_pixels as f64 / self.total_pixels as f64;
        info!(
            "Framebuffer updates: {} pixels compared, {} changed ({:.1}% sent)",
            self.total_pixels,
            self.missed_pixels,
            ratio * 100.0
        );
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x1: i32, y1: i32, x2: i32, y2: i32) -> Region {
        Region::from_rect(Rect::new(x1, y1, x2, y2))
    }

    fn everything() -> Region {
        region(-10_000, -10_000, 10_000, 10_000)
    }

    // ── SimpleUpdateTracker ───────────────────────────────────────────────────

    #[test]
    fn test_add_changed_coalesces_overlapping_regions() {
        // Arrange
        let mut tracker = SimpleUpdateTracker::new();

        // Act
        tracker.add_changed(&Region::from_rect(Rect::from_size(0, 0, 10, 10)));
        tracker.add_changed(&Region::from_rect(Rect::from_size(5, 5, 10, 10)));

        // Assert
        let info = tracker.update_info(&everything());
        assert_eq!(info.changed.area(), 175);
        assert!(info.copied.is_empty());
    }

    #[test]
    fn test_changed_wins_over_copied() {
        let mut tracker = SimpleUpdateTracker::new();
        tracker.add_copied(&region(0, 0, 100, 100), Point::new(10, 0));
        tracker.add_changed(&region(0, 0, 50, 100));

        let info = tracker.update_info(&everything());

        assert_eq!(info.changed, region(0, 0, 50, 100));
        assert_eq!(info.copied, region(50, 0, 100, 100));
        assert_eq!(info.copy_delta, Point::new(10, 0));
    }

    #[test]
    fn test_update_info_is_clipped() {
        let mut tracker = SimpleUpdateTracker::new();
        tracker.add_changed(&region(0, 0, 100, 100));
        let info = tracker.update_info(&region(0, 0, 10, 10));
        assert_eq!(info.changed, region(0, 0, 10, 10));
    }

    #[test]
    fn test_copy_disabled_records_change() {
        let mut tracker = SimpleUpdateTracker::new();
        tracker.set_copy_enabled(false);
        tracker.add_copied(&region(0, 0, 10, 10), Point::new(5, 5));
        assert!(tracker.copied().is_empty());
        assert_eq!(tracker.changed(), &region(0, 0, 10, 10));
    }

    #[test]
    fn test_continuing_copy_composes_deltas() {
        // Arrange: a window scrolled down twice by 10 pixels
        let mut tracker = SimpleUpdateTracker::new();
        tracker.add_copied(&region(0, 10, 100, 110), Point::new(0, 10));

        // Act
        tracker.add_copied(&region(0, 20, 100, 120), Point::new(0, 10));

        // Assert
        // One copy of the original content by 20 pixels...
        assert_eq!(tracker.copy_delta(), Point::new(0, 20));
        assert_eq!(tracker.copied(), &region(0, 20, 100, 120));
        // ...and the strip uncovered by the first copy is redrawn.
        assert_eq!(tracker.changed(), &region(0, 10, 100, 20));
    }

    #[test]
    fn test_unrelated_smaller_copy_becomes_change() {
        let mut tracker = SimpleUpdateTracker::new();
        tracker.add_copied(&region(0, 0, 200, 200), Point::new(5, 0));
        tracker.add_copied(&region(500, 500, 510, 510), Point::new(0, 5));

        assert_eq!(tracker.copy_delta(), Point::new(5, 0));
        assert_eq!(tracker.changed(), &region(500, 500, 510, 510));
    }

    #[test]
    fn test_pending_change_in_copy_source_follows_copy() {
        let mut tracker = SimpleUpdateTracker::new();
        tracker.add_changed(&region(0, 0, 10, 10));
        tracker.add_copied(&region(100, 100, 200, 200), Point::new(100, 100));
        assert!(region(100, 100, 110, 110).enclosed_by(tracker.changed()));
    }

    #[test]
    fn test_subtract_and_clear_empty_tracker() {
        let mut tracker = SimpleUpdateTracker::new();
        tracker.add_changed(&region(0, 0, 10, 10));
        tracker.subtract(&region(0, 0, 10, 10));
        assert!(tracker.is_empty());

        tracker.add_copied(&region(0, 0, 10, 10), Point::new(1, 1));
        tracker.clear();
        assert!(tracker.is_empty());
    }

    // ── ComparingUpdateTracker ────────────────────────────────────────────────

    #[test]
    fn test_first_compare_keeps_everything() {
        let fb = ManagedPixelBuffer::new(128, 128);
        let mut tracker = ComparingUpdateTracker::new();
        tracker.add_changed(&region(0, 0, 128, 128));

        assert!(tracker.compare(&fb));
        assert_eq!(tracker.update_info(&everything()).changed.area(), 128 * 128);
    }

    #[test]
    fn test_compare_drops_unchanged_blocks() {
        // Arrange: take the snapshot on a first pass
        let mut fb = ManagedPixelBuffer::new(128, 128);
        let mut tracker = ComparingUpdateTracker::new();
        tracker.add_changed(&region(0, 0, 128, 128));
        tracker.compare(&fb);
        tracker.clear();

        // Act: report the whole screen damaged, but only touch one pixel
        fb.fill_rect(&Rect::new(70, 70, 71, 71), [9, 9, 9, 0]);
        tracker.add_changed(&region(0, 0, 128, 128));
        let survived = tracker.compare(&fb);

        // Assert: only the 64x64 block holding that pixel is left
        assert!(survived);
        assert_eq!(tracker.update_info(&everything()).changed, region(64, 64, 128, 128));
    }

    #[test]
    fn test_compare_walks_every_changed_rect() {
        // Arrange
        let mut fb = ManagedPixelBuffer::new(256, 64);
        let mut tracker = ComparingUpdateTracker::new();
        tracker.add_changed(&region(0, 0, 256, 64));
        tracker.compare(&fb);
        tracker.clear();

        // Act: two disjoint damaged rects, pixels only differ in the second
        fb.fill_rect(&Rect::new(200, 10, 201, 11), [1, 2, 3, 0]);
        tracker.add_changed(&region(0, 0, 64, 64));
        tracker.add_changed(&region(192, 0, 256, 64));
        let survived = tracker.compare(&fb);

        // Assert
        assert!(survived);
        assert_eq!(tracker.update_info(&everything()).changed, region(192, 0, 256, 64));
    }

    #[test]
    fn test_compare_reports_nothing_left_for_identical_pixels() {
        let fb = ManagedPixelBuffer::new(64, 64);
        let mut tracker = ComparingUpdateTracker::new();
        tracker.add_changed(&region(0, 0, 64, 64));
        tracker.compare(&fb);
        tracker.clear();

        tracker.add_changed(&region(0, 0, 32, 32));

        assert!(!tracker.compare(&fb));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_disabled_compare_is_pass_through() {
        let fb = ManagedPixelBuffer::new(64, 64);
        let mut tracker = ComparingUpdateTracker::new();
        tracker.disable();
        tracker.add_changed(&region(0, 0, 64, 64));

        assert!(tracker.compare(&fb));
        assert_eq!(tracker.update_info(&everything()).changed, region(0, 0, 64, 64));
        assert!(!tracker.is_enabled());
    }
}
