//! tmux layout-string parsing.
//!
//! `%layout-change` notifications carry the window's full layout as a
//! string of the form `<checksum>,<description>` where:
//!
//! - **Single pane**: `WxH,L,T,ID`
//! - **Horizontal split** (side by side): `WxH,L,T{child1,child2,...}`
//! - **Vertical split** (top/bottom): `WxH,L,T[child1,child2,...]`
//!
//! The checksum is a 16-bit rotating checksum over the description,
//! rendered as four lowercase hex digits. Adjacent siblings inside a split
//! are separated by a one-cell border line, so a 160-cell-wide horizontal
//! split holds an 80-cell and a 79-cell pane.
//!
//! Geometry is taken from this description verbatim rather than being
//! reconstructed by diffing, so pane rectangles always tile their window
//! exactly.

use thiserror::Error;

use crate::model::{PaneId, PaneRect};

/// A parsed layout tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutNode {
    /// A single terminal pane.
    Pane { id: u64, rect: PaneRect },
    /// Children arranged side by side (`{...}`).
    HorizontalSplit {
        rect: PaneRect,
        children: Vec<LayoutNode>,
    },
    /// Children stacked top to bottom (`[...]`).
    VerticalSplit {
        rect: PaneRect,
        children: Vec<LayoutNode>,
    },
}

impl LayoutNode {
    pub fn rect(&self) -> PaneRect {
        match self {
            Self::Pane { rect, .. }
            | Self::HorizontalSplit { rect, .. }
            | Self::VerticalSplit { rect, .. } => *rect,
        }
    }

    /// Collect the leaf panes in layout order.
    pub fn panes(&self) -> Vec<(PaneId, PaneRect)> {
        let mut out = Vec::new();
        self.collect_panes(&mut out);
        out
    }

    fn collect_panes(&self, out: &mut Vec<(PaneId, PaneRect)>) {
        match self {
            Self::Pane { id, rect } => out.push((PaneId::new(format!("%{id}")), *rect)),
            Self::HorizontalSplit { children, .. } | Self::VerticalSplit { children, .. } => {
                for child in children {
                    child.collect_panes(out);
                }
            }
        }
    }

    /// Verify that every split's children exactly cover their parent with
    /// one-cell separators between adjacent siblings and no overlap.
    pub fn verify_tiling(&self) -> Result<(), LayoutError> {
        match self {
            Self::Pane { .. } => Ok(()),
            Self::HorizontalSplit { rect, children } => {
                verify_axis(rect, children, Axis::Horizontal)?;
                children.iter().try_for_each(LayoutNode::verify_tiling)
            }
            Self::VerticalSplit { rect, children } => {
                verify_axis(rect, children, Axis::Vertical)?;
                children.iter().try_for_each(LayoutNode::verify_tiling)
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Axis {
    Horizontal,
    Vertical,
}

fn verify_axis(parent: &PaneRect, children: &[LayoutNode], axis: Axis) -> Result<(), LayoutError> {
    if children.is_empty() {
        return Err(LayoutError::BrokenTiling {
            detail: "split with no children".to_string(),
        });
    }
    let mut expected_start = match axis {
        Axis::Horizontal => parent.left,
        Axis::Vertical => parent.top,
    };
    for child in children {
        let rect = child.rect();
        let (start, extent, cross_start, cross_extent) = match axis {
            Axis::Horizontal => (rect.left, rect.width, rect.top, rect.height),
            Axis::Vertical => (rect.top, rect.height, rect.left, rect.width),
        };
        let (parent_cross_start, parent_cross_extent) = match axis {
            Axis::Horizontal => (parent.top, parent.height),
            Axis::Vertical => (parent.left, parent.width),
        };
        if start != expected_start {
            return Err(LayoutError::BrokenTiling {
                detail: format!("child starts at {start}, expected {expected_start}"),
            });
        }
        if cross_start != parent_cross_start || cross_extent != parent_cross_extent {
            return Err(LayoutError::BrokenTiling {
                detail: "child does not span its parent's cross axis".to_string(),
            });
        }
        // One separator cell between adjacent siblings.
        expected_start = start + extent + 1;
    }
    let parent_end = match axis {
        Axis::Horizontal => parent.left + parent.width,
        Axis::Vertical => parent.top + parent.height,
    };
    // The final sibling has no trailing separator.
    if expected_start - 1 != parent_end {
        return Err(LayoutError::BrokenTiling {
            detail: format!(
                "children end at {}, parent ends at {parent_end}",
                expected_start - 1
            ),
        });
    }
    Ok(())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("layout string truncated")]
    Truncated,
    #[error("unexpected character at offset {offset}")]
    UnexpectedChar { offset: usize },
    #[error("layout checksum mismatch: header {header:04x}, computed {computed:04x}")]
    ChecksumMismatch { header: u16, computed: u16 },
    #[error("pane rectangles do not tile the window: {detail}")]
    BrokenTiling { detail: String },
}

/// Compute the tmux layout checksum over a description string: a 16-bit
/// rotating checksum, one right-rotation of the accumulator per byte.
pub fn checksum(description: &str) -> u16 {
    let mut csum: u32 = 0;
    for &b in description.as_bytes() {
        csum = (csum >> 1) + ((csum & 1) << 15);
        csum += b as u32;
    }
    (csum & 0xffff) as u16
}

/// Parse a full `<checksum>,<description>` layout string and validate the
/// checksum and the tiling invariant.
pub fn parse_layout(input: &str) -> Result<LayoutNode, LayoutError> {
    let (header, description) = input.split_once(',').ok_or(LayoutError::Truncated)?;
    let header = u16::from_str_radix(header, 16)
        .map_err(|_| LayoutError::UnexpectedChar { offset: 0 })?;
    let computed = checksum(description);
    if header != computed {
        return Err(LayoutError::ChecksumMismatch { header, computed });
    }

    let mut parser = Parser {
        bytes: description.as_bytes(),
        pos: 0,
        base: input.len() - description.len(),
    };
    let node = parser.node()?;
    if parser.pos != parser.bytes.len() {
        return Err(LayoutError::UnexpectedChar {
            offset: parser.base + parser.pos,
        });
    }
    node.verify_tiling()?;
    Ok(node)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Offset of the description within the full input, for error offsets.
    base: usize,
}

impl<'a> Parser<'a> {
    fn node(&mut self) -> Result<LayoutNode, LayoutError> {
        let width = self.number()?;
        self.expect(b'x')?;
        let height = self.number()?;
        self.expect(b',')?;
        let left = self.number()?;
        self.expect(b',')?;
        let top = self.number()?;
        let rect = PaneRect {
            left,
            top,
            width,
            height,
        };

        match self.peek() {
            Some(b',') => {
                self.pos += 1;
                let id = self.number_u64()?;
                Ok(LayoutNode::Pane { id, rect })
            }
            Some(b'{') => {
                let children = self.children(b'{', b'}')?;
                Ok(LayoutNode::HorizontalSplit { rect, children })
            }
            Some(b'[') => {
                let children = self.children(b'[', b']')?;
                Ok(LayoutNode::VerticalSplit { rect, children })
            }
            Some(_) => Err(self.unexpected()),
            None => Err(LayoutError::Truncated),
        }
    }

    fn children(&mut self, open: u8, close: u8) -> Result<Vec<LayoutNode>, LayoutError> {
        self.expect(open)?;
        let mut children = vec![self.node()?];
        loop {
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                    children.push(self.node()?);
                }
                Some(ch) if ch == close => {
                    self.pos += 1;
                    return Ok(children);
                }
                Some(_) => return Err(self.unexpected()),
                None => return Err(LayoutError::Truncated),
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), LayoutError> {
        match self.peek() {
            Some(found) if found == byte => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(self.unexpected()),
            None => Err(LayoutError::Truncated),
        }
    }

    fn number(&mut self) -> Result<u16, LayoutError> {
        let value = self.number_u64()?;
        u16::try_from(value).map_err(|_| self.unexpected())
    }

    fn number_u64(&mut self) -> Result<u64, LayoutError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.pos == start {
            return match self.peek() {
                Some(_) => Err(self.unexpected()),
                None => Err(LayoutError::Truncated),
            };
        }
        // Digits only, so the parse cannot fail except by overflow.
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| self.unexpected())
    }

    fn unexpected(&self) -> LayoutError {
        LayoutError::UnexpectedChar {
            offset: self.base + self.pos,
        }
    }
}
