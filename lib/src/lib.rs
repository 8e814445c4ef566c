//! This library implements a buffer queue: a fixed set of graphics buffer
//! slots exchanged between a single producer (typically a rendering client)
//! and a single consumer (typically a compositor or a video encoder).
//!
//! It is split into the following parts:
//!
//! * The `queue` module contains the queue itself, i.e. the slot table and
//!   the lock and condition variable that serialize all slot state changes.
//!   The producer side of the queue is exposed through the
//!   `queue::producer::Producer` trait, and the consumer side through the
//!   `queue::consumer::Consumer` trait. A single `BufferQueue` object
//!   implements both.
//!
//! * The `memory` module defines how buffers are obtained. The queue never
//!   allocates graphics memory by itself and relies on a `BufferAllocator`
//!   provided at construction time instead. A simple heap-backed allocator is
//!   included.
//!
//! * The `fence` module provides the fence type used to delay the reuse of
//!   a buffer until the consumer is done reading it, when the queue is
//!   configured to use fences.
//!
//! The queue only does bookkeeping: it never touches the content of the
//! buffers it manages, and moving buffers across process boundaries is left
//! to the user.
//!
pub mod fence;
pub mod memory;
pub mod queue;

pub use fence::{Fence, SyncMode};
pub use queue::{
    consumer::{BufferItem, Consumer, ConsumerListener},
    producer::{DequeueFlags, DequeueOutput, Producer, QueryKind, QueueBufferInput},
    BufferQueue, NotInitializedReason, QueueBufferOutput, QueueConfig, QueueError, QueueResult,
    SlotState, NUM_BUFFER_SLOTS,
};

use std::fmt;
use std::fmt::{Debug, Display};

use bitflags::bitflags;
use enumn::N;

/// Pixel format of a graphics buffer.
///
/// Formats are either small integers inherited from the graphics HAL (e.g.
/// `RGBA_8888`) or Fourcc codes for YUV formats (e.g. `YV12`). The special
/// value `NONE` is used in requests to mean "use the queue's default format".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct PixelFormat(u32);

impl PixelFormat {
    pub const NONE: PixelFormat = PixelFormat(0);
    pub const RGBA_8888: PixelFormat = PixelFormat(1);
    pub const RGBX_8888: PixelFormat = PixelFormat(2);
    pub const RGB_888: PixelFormat = PixelFormat(3);
    pub const RGB_565: PixelFormat = PixelFormat(4);
    pub const BGRA_8888: PixelFormat = PixelFormat(5);
    pub const NV21: PixelFormat = PixelFormat(0x11);
    pub const YV12: PixelFormat = PixelFormat::from_fourcc(b"YV12");

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns the number of bytes needed to store a `width`x`height` frame
    /// in this format, or `None` if the layout of the format is not known.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bufferqueue::PixelFormat;
    /// assert_eq!(PixelFormat::RGBA_8888.frame_size(4, 2), Some(32));
    /// assert_eq!(PixelFormat::YV12.frame_size(4, 2), Some(12));
    /// assert_eq!(PixelFormat::NONE.frame_size(4, 2), None);
    /// ```
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let (width, height) = (width as usize, height as usize);
        match self {
            Self::RGBA_8888 | Self::RGBX_8888 | Self::BGRA_8888 => Some(width * height * 4),
            Self::RGB_888 => Some(width * height * 3),
            Self::RGB_565 => Some(width * height * 2),
            // Full luma plane followed by two subsampled chroma planes.
            Self::YV12 | Self::NV21 => {
                Some(width * height + 2 * (width.div_ceil(2) * height.div_ceil(2)))
            }
            _ => None,
        }
    }

    fn name(self) -> Option<&'static str> {
        match self {
            Self::NONE => Some("NONE"),
            Self::RGBA_8888 => Some("RGBA_8888"),
            Self::RGBX_8888 => Some("RGBX_8888"),
            Self::RGB_888 => Some("RGB_888"),
            Self::RGB_565 => Some("RGB_565"),
            Self::BGRA_8888 => Some("BGRA_8888"),
            Self::NV21 => Some("NV21"),
            Self::YV12 => Some("YV12"),
            _ => None,
        }
    }
}

impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Build a pixel format from its Fourcc code.
///
/// # Examples
///
/// ```
/// # use bufferqueue::PixelFormat;
/// let f = PixelFormat::from(b"YV12");
/// assert_eq!(f, PixelFormat::YV12);
/// assert_eq!(u32::from(f), 0x32315659);
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and string representation.
///
/// # Examples
///
/// ```
/// # use bufferqueue::PixelFormat;
/// assert_eq!(format!("{:?}", PixelFormat::RGB_565), "0x00000004 (RGB_565)");
/// ```
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

/// Known formats are displayed by name, unknown ones as a Fourcc if they look
/// like one, and in hexadecimal otherwise.
///
/// # Examples
///
/// ```
/// # use bufferqueue::PixelFormat;
/// assert_eq!(PixelFormat::RGBA_8888.to_string(), "RGBA_8888");
/// assert_eq!(PixelFormat::from(b"AB24").to_string(), "AB24");
/// assert_eq!(PixelFormat::from(0x108).to_string(), "0x00000108");
/// ```
impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(name) = self.name() {
            return f.write_str(name);
        }

        let bytes = self.0.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
            let fourcc = bytes.iter().map(|&x| x as char).collect::<String>();
            f.write_str(fourcc.as_str())
        } else {
            write!(f, "0x{:08x}", self.0)
        }
    }
}

/// A rectangle, used to describe the crop region of a queued buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Rect {
        Rect {
            left,
            top,
            width,
            height,
        }
    }

    /// Rectangle covering a whole `width`x`height` buffer.
    pub fn from_size(width: u32, height: u32) -> Rect {
        Rect::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> i64 {
        self.left as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.top as i64 + self.height as i64
    }

    /// Returns whether `other` lies entirely within this rectangle.
    pub fn contains(&self, other: &Rect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Returns the intersection of both rectangles, or `None` if they do not
    /// overlap.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bufferqueue::Rect;
    /// let a = Rect::new(0, 0, 640, 480);
    /// let b = Rect::new(600, 400, 100, 100);
    /// assert_eq!(a.intersect(&b), Some(Rect::new(600, 400, 40, 80)));
    /// assert_eq!(a.intersect(&Rect::new(640, 0, 10, 10)), None);
    /// ```
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        if right <= left as i64 || bottom <= top as i64 {
            return None;
        }

        Some(Rect::new(
            left,
            top,
            (right - left as i64) as u32,
            (bottom - top as i64) as u32,
        ))
    }
}

impl Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}), {}x{}",
            self.left, self.top, self.width, self.height
        )
    }
}

bitflags! {
    /// Transform to apply to a buffer's content when it is displayed.
    /// Rotations are clockwise and applied after the flips.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Transform: u32 {
        const FLIP_H = 0x01;
        const FLIP_V = 0x02;
        const ROT_90 = 0x04;
        const ROT_180 = 0x03;
        const ROT_270 = 0x07;
    }
}

impl Default for Transform {
    fn default() -> Self {
        Transform::empty()
    }
}

/// How the content of a buffer is scaled to the window it is displayed in.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, N)]
pub enum ScalingMode {
    /// The window size freezes until a buffer of the right size is queued.
    #[default]
    Freeze = 0,
    /// The buffer is scaled in both dimensions to match the window.
    ScaleToWindow = 1,
    /// The buffer is scaled uniformly and cropped to fill the window.
    ScaleCrop = 2,
}

/// Producer APIs that can connect to a queue. Only one of them can be
/// connected at a given time.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum NativeWindowApi {
    Egl = 1,
    Cpu = 2,
    Media = 3,
    Camera = 4,
}

impl Display for NativeWindowApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}
