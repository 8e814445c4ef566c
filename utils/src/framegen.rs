//! Generates a moving test pattern into RGB frames.
use bufferqueue::PixelFormat;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NewFrameGeneratorError {
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(PixelFormat),
    #[error("invalid frame size {0}x{1}")]
    InvalidSize(u32, u32),
}

#[derive(Debug, Error)]
pub enum GenerateFrameError {
    #[error("provided buffer is too small ({0} < {1})")]
    BufferTooSmall(usize, usize),
}

/// Order of the color components of a pixel in memory.
#[derive(Debug, Clone, Copy)]
struct Layout {
    bytes_per_pixel: usize,
    red: usize,
    green: usize,
    blue: usize,
    alpha: Option<usize>,
}

impl Layout {
    fn of(format: PixelFormat) -> Option<Layout> {
        let layout = |bytes_per_pixel, red, green, blue, alpha| Layout {
            bytes_per_pixel,
            red,
            green,
            blue,
            alpha,
        };

        match format {
            PixelFormat::RGBA_8888 => Some(layout(4, 0, 1, 2, Some(3))),
            PixelFormat::RGBX_8888 => Some(layout(4, 0, 1, 2, None)),
            PixelFormat::BGRA_8888 => Some(layout(4, 2, 1, 0, Some(3))),
            PixelFormat::RGB_888 => Some(layout(3, 0, 1, 2, None)),
            _ => None,
        }
    }
}

/// Fills frames with a pattern that changes with every frame, so a consumer
/// can tell frames apart.
///
/// The red component of the top-left pixel is always the low byte of the
/// index of the frame, see `frame_index`.
pub struct FrameGenerator {
    width: usize,
    height: usize,
    format: PixelFormat,
    layout: Layout,
    step: u32,
}

impl FrameGenerator {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, NewFrameGeneratorError> {
        let layout =
            Layout::of(format).ok_or(NewFrameGeneratorError::UnsupportedFormat(format))?;
        if width == 0 || height == 0 {
            return Err(NewFrameGeneratorError::InvalidSize(width, height));
        }

        Ok(FrameGenerator {
            width: width as usize,
            height: height as usize,
            format,
            layout,
            step: 0,
        })
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn frame_size(&self) -> usize {
        self.width * self.height * self.layout.bytes_per_pixel
    }

    /// Number of frames generated so far.
    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn next_frame<S: AsMut<[u8]>>(&mut self, frame: &mut S) -> Result<(), GenerateFrameError> {
        let frame = frame.as_mut();

        if frame.len() < self.frame_size() {
            return Err(GenerateFrameError::BufferTooSmall(
                frame.len(),
                self.frame_size(),
            ));
        }

        self.gen_pattern(frame);
        self.step = self.step.wrapping_add(1);

        Ok(())
    }

    /// Low byte of the index of the frame `frame` was generated as.
    pub fn frame_index(&self, frame: &[u8]) -> Option<u8> {
        frame.get(self.layout.red).copied()
    }

    fn gen_pattern(&self, frame: &mut [u8]) {
        let layout = self.layout;
        let line_size = self.width * layout.bytes_per_pixel;

        frame
            .chunks_exact_mut(line_size)
            .take(self.height)
            .enumerate()
            .for_each(|(y, line)| {
                line.chunks_exact_mut(layout.bytes_per_pixel)
                    .enumerate()
                    .for_each(|(x, pixel)| {
                        let rgb = self.step.wrapping_add((x ^ y) as u32).to_le_bytes();
                        pixel[layout.red] = rgb[0];
                        pixel[layout.green] = rgb[1].wrapping_add(x as u8);
                        pixel[layout.blue] = rgb[2].wrapping_add(y as u8);
                        if let Some(alpha) = layout.alpha {
                            pixel[alpha] = 0xff;
                        }
                    });
            });
    }
}
