//! Framebuffer text console.
//!
//! Renders characters into the boot-protocol framebuffer one codepoint at a
//! time; the logger feeds it whole lines. Only the character-output contract
//! matters to the rest of the kernel.

use conquer_once::spin::OnceCell;
use noto_sans_mono_bitmap::{
    get_raster, get_raster_width, FontWeight, RasterHeight, RasterizedChar,
};
use spin::Mutex;

use crate::boot::FramebufferFormat;

const CHAR_HEIGHT: RasterHeight = RasterHeight::Size16;
const CHAR_WIDTH: usize = get_raster_width(FontWeight::Regular, CHAR_HEIGHT);
const LINE_SPACING: usize = 2;
const BORDER_PADDING: usize = 1;
const BACKUP_CHAR: char = '?';

static CONSOLE: OnceCell<Mutex<Console>> = OnceCell::uninit();

fn char_raster(c: char) -> RasterizedChar {
    get_raster(c, FontWeight::Regular, CHAR_HEIGHT)
        .unwrap_or_else(|| get_raster(BACKUP_CHAR, FontWeight::Regular, CHAR_HEIGHT).unwrap())
}

struct Console {
    buffer: *mut u8,
    width: usize,
    height: usize,
    /// Bytes per scanline (may exceed `width * 4`).
    stride: usize,
    format: FramebufferFormat,
    x: usize,
    y: usize,
}

unsafe impl Send for Console {}

impl Console {
    fn clear(&mut self) {
        unsafe {
            core::ptr::write_bytes(self.buffer, 0, self.stride * self.height);
        }
        self.x = BORDER_PADDING;
        self.y = BORDER_PADDING;
    }

    fn newline(&mut self) {
        self.y += CHAR_HEIGHT.val() + LINE_SPACING;
        self.x = BORDER_PADDING;
        if self.y + CHAR_HEIGHT.val() >= self.height {
            self.scroll();
        }
    }

    fn scroll(&mut self) {
        let row_bytes = CHAR_HEIGHT.val() + LINE_SPACING;
        let shift = row_bytes * self.stride;
        let total = self.stride * self.height;
        unsafe {
            core::ptr::copy(self.buffer.add(shift), self.buffer, total - shift);
            core::ptr::write_bytes(self.buffer.add(total - shift), 0, shift);
        }
        self.y -= row_bytes;
    }

    fn write_char(&mut self, c: char) {
        match c {
            '\n' => self.newline(),
            '\r' => self.x = BORDER_PADDING,
            c => {
                if self.x + CHAR_WIDTH >= self.width {
                    self.newline();
                }
                self.render(char_raster(c));
                self.x += CHAR_WIDTH;
            }
        }
    }

    fn render(&mut self, raster: RasterizedChar) {
        for (dy, row) in raster.raster().iter().enumerate() {
            for (dx, intensity) in row.iter().enumerate() {
                self.put_pixel(self.x + dx, self.y + dy, *intensity);
            }
        }
    }

    fn put_pixel(&mut self, x: usize, y: usize, intensity: u8) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = y * self.stride + x * 4;
        let pixel: [u8; 4] = match self.format {
            FramebufferFormat::Argb | FramebufferFormat::Abgr => {
                [intensity, intensity, intensity, 0]
            }
            FramebufferFormat::Rgba | FramebufferFormat::Bgra => {
                [0, intensity, intensity, intensity]
            }
        };
        unsafe {
            let dst = self.buffer.add(offset) as *mut [u8; 4];
            core::ptr::write_volatile(dst, pixel);
        }
    }
}

/// Bring up the console over the boot framebuffer.
pub fn init() {
    let info = crate::boot::info();
    let mut console = Console {
        buffer: info.framebuffer_ptr as *mut u8,
        width: info.framebuffer_width as usize,
        height: info.framebuffer_height as usize,
        stride: info.framebuffer_scanline as usize,
        format: FramebufferFormat::from_u8(info.framebuffer_type),
        x: BORDER_PADDING,
        y: BORDER_PADDING,
    };
    console.clear();
    CONSOLE.init_once(|| Mutex::new(console));
    log::info!(
        "[fb] console {}x{} ({:?})",
        info.framebuffer_width,
        info.framebuffer_height,
        FramebufferFormat::from_u8(info.framebuffer_type)
    );
}

/// Write a single codepoint to the console.
pub fn output_char(c: char) {
    if let Ok(console) = CONSOLE.try_get() {
        let _critical = crate::cpu::ScopedCritical::new();
        console.lock().write_char(c);
    }
}

pub fn write_fmt(args: core::fmt::Arguments) {
    use core::fmt::Write;

    struct Sink;
    impl core::fmt::Write for Sink {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            for c in s.chars() {
                output_char(c);
            }
            Ok(())
        }
    }

    let _ = Sink.write_fmt(args);
}
