//! Viewport geometry: rectangles, root margins and intersection ratios.

use core::fmt;
use core::str::FromStr;

use anyhow::{Error, anyhow, bail};
use serde::Serialize;

/// Axis-aligned rectangle in document coordinates (CSS pixels).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    #[inline]
    #[must_use]
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[inline]
    #[must_use]
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    #[inline]
    #[must_use]
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    #[inline]
    #[must_use]
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Overlap of two rectangles. Edge-adjacent rectangles yield a
    /// zero-area intersection rather than `None`.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        (right >= left && bottom >= top).then(|| Self::new(left, top, right - left, bottom - top))
    }

    /// Grows the rectangle by `margin` on every side.
    #[must_use]
    pub fn inflate(&self, margin: &RootMargin) -> Self {
        Self::new(
            self.x - margin.left,
            self.y - margin.top,
            (self.width + margin.left + margin.right).max(0.0),
            (self.height + margin.top + margin.bottom).max(0.0),
        )
    }
}

/// Margin applied around the viewport before visibility tests, in pixels.
///
/// Parsed from CSS margin shorthand with one to four `px` (or unitless
/// zero) values, e.g. `"50px 0px"`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RootMargin {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl RootMargin {
    #[inline]
    #[must_use]
    pub const fn new(top: f32, right: f32, bottom: f32, left: f32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }
}

fn parse_length(token: &str) -> Result<f32, Error> {
    let number = token.strip_suffix("px").unwrap_or(token);
    let value: f32 = number
        .parse()
        .map_err(|err| anyhow!("Invalid margin length {token:?}: {err}"))?;
    if number.len() == token.len() && value.abs() > f32::EPSILON {
        bail!("Margin length {token:?} needs a px unit");
    }
    if !value.is_finite() {
        bail!("Margin length {token:?} is not finite");
    }
    Ok(value)
}

impl FromStr for RootMargin {
    type Err = Error;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let values = source
            .split_ascii_whitespace()
            .map(parse_length)
            .collect::<Result<Vec<f32>, Error>>()?;
        match values.as_slice() {
            [all] => Ok(Self::new(*all, *all, *all, *all)),
            [vertical, horizontal] => Ok(Self::new(*vertical, *horizontal, *vertical, *horizontal)),
            [top, horizontal, bottom] => Ok(Self::new(*top, *horizontal, *bottom, *horizontal)),
            [top, right, bottom, left] => Ok(Self::new(*top, *right, *bottom, *left)),
            _ => Err(anyhow!("Expected 1 to 4 margin values in {source:?}")),
        }
    }
}

impl fmt::Display for RootMargin {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{}px {}px {}px {}px",
            self.top, self.right, self.bottom, self.left
        )
    }
}

/// The visible region of the document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Viewport {
    pub scroll_x: f32,
    pub scroll_y: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1280.0, 800.0)
    }
}

impl Viewport {
    /// A viewport of the given size scrolled to the top of the document.
    #[inline]
    #[must_use]
    pub const fn new(width: f32, height: f32) -> Self {
        Self {
            scroll_x: 0.0,
            scroll_y: 0.0,
            width,
            height,
        }
    }

    #[inline]
    #[must_use]
    pub const fn scrolled_to(mut self, scroll_y: f32) -> Self {
        self.scroll_y = scroll_y;
        self
    }

    #[inline]
    #[must_use]
    pub const fn rect(&self) -> Rect {
        Rect::new(self.scroll_x, self.scroll_y, self.width, self.height)
    }

    /// Viewport rectangle grown by the root margin.
    #[must_use]
    pub fn root_rect(&self, margin: &RootMargin) -> Rect {
        self.rect().inflate(margin)
    }
}

/// Fraction of `target` inside `root`, in `[0, 1]`.
///
/// Zero-area targets report `1.0` when they touch the root and `0.0`
/// otherwise.
#[must_use]
pub fn intersection_ratio(target: &Rect, root: &Rect) -> f32 {
    let Some(overlap) = target.intersection(root) else {
        return 0.0;
    };
    let area = target.area();
    if area <= 0.0 {
        return 1.0;
    }
    (overlap.area() / area).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_shorthand_expands_like_css() -> Result<(), Error> {
        assert_eq!("50px 0px".parse::<RootMargin>()?, RootMargin::new(50.0, 0.0, 50.0, 0.0));
        assert_eq!("1px 2px 3px".parse::<RootMargin>()?, RootMargin::new(1.0, 2.0, 3.0, 2.0));
        assert_eq!("0".parse::<RootMargin>()?, RootMargin::default());
        assert!("10".parse::<RootMargin>().is_err());
        assert!("1px 2px 3px 4px 5px".parse::<RootMargin>().is_err());
        assert!("".parse::<RootMargin>().is_err());
        Ok(())
    }

    #[test]
    fn ratio_accounts_for_root_margin() {
        let viewport = Viewport::new(1000.0, 800.0);
        let root = viewport.root_rect(&RootMargin::new(50.0, 0.0, 50.0, 0.0));
        let just_below = Rect::new(0.0, 820.0, 100.0, 100.0);
        assert!((intersection_ratio(&just_below, &root) - 0.3).abs() < 1e-4);
        let far_below = Rect::new(0.0, 900.0, 100.0, 100.0);
        assert!(intersection_ratio(&far_below, &root).abs() < f32::EPSILON);
    }

    #[test]
    fn zero_area_targets_touching_root_are_fully_visible() {
        let root = Rect::new(0.0, 0.0, 100.0, 100.0);
        assert!((intersection_ratio(&Rect::new(10.0, 100.0, 0.0, 0.0), &root) - 1.0).abs() < f32::EPSILON);
        assert!(intersection_ratio(&Rect::new(10.0, 101.0, 0.0, 0.0), &root).abs() < f32::EPSILON);
    }
}
