//! SSD1306 monochrome OLED driver (128×64 and 128×32, I2C)
//!
//! Drawing goes to an in-memory frame buffer through `embedded-graphics`;
//! [`Ssd1306::flush`] copies it to display RAM. The buffer is page-major:
//! each byte is a vertical strip of eight pixels, LSB on top, which is the
//! controller's own layout, so a flush is a straight copy.
//!
//! Datasheet: <https://cdn-shop.adafruit.com/datasheets/SSD1306.pdf>

use anyhow::Result;
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use std::convert::Infallible;
use tracing::{debug, trace};

use crate::comms::I2cRegisters;
use crate::hw_trait::I2c;
use crate::registry::{Category, DriverDescriptor, Interface};

pub const DEFAULT_ADDRESS: u8 = 0x3C;
pub const ALT_ADDRESS: u8 = 0x3D;

inventory::submit! {
    DriverDescriptor {
        name: "ssd1306",
        part: "SSD1306",
        category: Category::Display,
        interface: Interface::I2c,
        addresses: &[DEFAULT_ADDRESS, ALT_ADDRESS],
        description: "128x64 or 128x32 monochrome OLED controller",
    }
}

/// Control byte: the rest of the write is a command stream.
pub const CONTROL_COMMAND: u8 = 0x00;
/// Control byte: the rest of the write is display RAM data.
pub const CONTROL_DATA: u8 = 0x40;

/// Fundamental and addressing commands
pub mod commands {
    pub const SET_CONTRAST: u8 = 0x81;
    pub const RESUME_FROM_RAM: u8 = 0xA4;
    pub const NORMAL_DISPLAY: u8 = 0xA6;
    pub const INVERT_DISPLAY: u8 = 0xA7;
    pub const DISPLAY_OFF: u8 = 0xAE;
    pub const DISPLAY_ON: u8 = 0xAF;
    pub const MEMORY_MODE: u8 = 0x20;
    pub const COLUMN_ADDRESS: u8 = 0x21;
    pub const PAGE_ADDRESS: u8 = 0x22;
    pub const START_LINE: u8 = 0x40;
    pub const SEGMENT_REMAP: u8 = 0xA1;
    pub const MULTIPLEX: u8 = 0xA8;
    pub const COM_SCAN_DEC: u8 = 0xC8;
    pub const DISPLAY_OFFSET: u8 = 0xD3;
    pub const COM_PINS: u8 = 0xDA;
    pub const CLOCK_DIV: u8 = 0xD5;
    pub const PRECHARGE: u8 = 0xD9;
    pub const VCOM_DETECT: u8 = 0xDB;
    pub const CHARGE_PUMP: u8 = 0x8D;
}

/// Bytes of display RAM sent per I2C write.
const DATA_CHUNK: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplaySize {
    #[default]
    Size128x64,
    Size128x32,
}

impl DisplaySize {
    pub fn width(self) -> u32 {
        128
    }

    pub fn height(self) -> u32 {
        match self {
            DisplaySize::Size128x64 => 64,
            DisplaySize::Size128x32 => 32,
        }
    }

    fn com_pins(self) -> u8 {
        match self {
            DisplaySize::Size128x64 => 0x12,
            DisplaySize::Size128x32 => 0x02,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

pub struct Ssd1306<I2C> {
    regs: I2cRegisters<I2C>,
    size: DisplaySize,
    rotation: Rotation,
    buffer: Vec<u8>,
}

impl<I2C: I2c> Ssd1306<I2C> {
    pub fn new(i2c: I2C, address: u8, size: DisplaySize) -> Self {
        let pages = size.height() / 8;
        Self {
            regs: I2cRegisters::new(i2c, address),
            size,
            rotation: Rotation::default(),
            buffer: vec![0; (size.width() * pages) as usize],
        }
    }

    pub fn display_size(&self) -> DisplaySize {
        self.size
    }

    fn pages(&self) -> u32 {
        self.size.height() / 8
    }

    async fn commands(&mut self, commands: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(commands.len() + 1);
        frame.push(CONTROL_COMMAND);
        frame.extend_from_slice(commands);
        self.regs.write_raw(&frame).await
    }

    /// Run the power-up sequence, clear display RAM and turn the panel on.
    pub async fn init(&mut self) -> Result<()> {
        use commands::*;
        let height = self.size.height() as u8;
        self.commands(&[
            DISPLAY_OFF,
            CLOCK_DIV,
            0x80,
            MULTIPLEX,
            height - 1,
            DISPLAY_OFFSET,
            0x00,
            START_LINE,
            CHARGE_PUMP,
            0x14,
            MEMORY_MODE,
            0x00,
            SEGMENT_REMAP,
            COM_SCAN_DEC,
            COM_PINS,
            self.size.com_pins(),
            SET_CONTRAST,
            0xCF,
            PRECHARGE,
            0xF1,
            VCOM_DETECT,
            0x40,
            RESUME_FROM_RAM,
            NORMAL_DISPLAY,
        ])
        .await?;
        self.clear_buffer();
        self.flush().await?;
        self.set_display_on(true).await?;
        debug!(address = self.regs.address(), size = ?self.size, "SSD1306 initialized");
        Ok(())
    }

    pub async fn set_display_on(&mut self, on: bool) -> Result<()> {
        let command = if on {
            commands::DISPLAY_ON
        } else {
            commands::DISPLAY_OFF
        };
        self.commands(&[command]).await
    }

    pub async fn set_contrast(&mut self, contrast: u8) -> Result<()> {
        self.commands(&[commands::SET_CONTRAST, contrast]).await
    }

    /// Invert in hardware; the frame buffer is unchanged.
    pub async fn set_inverted(&mut self, inverted: bool) -> Result<()> {
        let command = if inverted {
            commands::INVERT_DISPLAY
        } else {
            commands::NORMAL_DISPLAY
        };
        self.commands(&[command]).await
    }

    /// Rotate subsequent drawing. Already-drawn pixels stay where they are.
    pub fn set_rotation(&mut self, rotation: Rotation) {
        self.rotation = rotation;
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn clear_buffer(&mut self) {
        self.buffer.fill(0);
    }

    /// The page-major frame buffer.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Map logical coordinates to a physical pixel, if on screen.
    fn physical(&self, x: i32, y: i32) -> Option<(u32, u32)> {
        let (w, h) = (self.size.width() as i32, self.size.height() as i32);
        let (px, py) = match self.rotation {
            Rotation::Deg0 => (x, y),
            Rotation::Deg90 => (w - 1 - y, x),
            Rotation::Deg180 => (w - 1 - x, h - 1 - y),
            Rotation::Deg270 => (y, h - 1 - x),
        };
        ((0..w).contains(&px) && (0..h).contains(&py)).then_some((px as u32, py as u32))
    }

    pub fn set_pixel(&mut self, x: i32, y: i32, on: bool) {
        if let Some((px, py)) = self.physical(x, y) {
            let index = (px + (py / 8) * self.size.width()) as usize;
            let bit = 1 << (py % 8);
            if on {
                self.buffer[index] |= bit;
            } else {
                self.buffer[index] &= !bit;
            }
        }
    }

    pub fn pixel(&self, x: i32, y: i32) -> bool {
        self.physical(x, y).is_some_and(|(px, py)| {
            self.buffer[(px + (py / 8) * self.size.width()) as usize] & (1 << (py % 8)) != 0
        })
    }

    /// Copy the whole frame buffer to display RAM.
    pub async fn flush(&mut self) -> Result<()> {
        let last_column = (self.size.width() - 1) as u8;
        let last_page = (self.pages() - 1) as u8;
        self.commands(&[
            commands::COLUMN_ADDRESS,
            0,
            last_column,
            commands::PAGE_ADDRESS,
            0,
            last_page,
        ])
        .await?;

        let buffer = self.buffer.clone();
        for chunk in buffer.chunks(DATA_CHUNK) {
            let mut frame = Vec::with_capacity(chunk.len() + 1);
            frame.push(CONTROL_DATA);
            frame.extend_from_slice(chunk);
            self.regs.write_raw(&frame).await?;
        }
        trace!(bytes = buffer.len(), "SSD1306 flushed");
        Ok(())
    }
}

impl<I2C: I2c> OriginDimensions for Ssd1306<I2C> {
    fn size(&self) -> Size {
        let (w, h) = (self.size.width(), self.size.height());
        match self.rotation {
            Rotation::Deg0 | Rotation::Deg180 => Size::new(w, h),
            Rotation::Deg90 | Rotation::Deg270 => Size::new(h, w),
        }
    }
}

impl<I2C: I2c> DrawTarget for Ssd1306<I2C> {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> std::result::Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            self.set_pixel(point.x, point.y, color.is_on());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{chips::Ssd1306Sim, SimI2cBus};
    use embedded_graphics::mono_font::{ascii::FONT_6X10, MonoTextStyle};
    use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};
    use embedded_graphics::text::Text;

    fn setup(size: DisplaySize) -> (std::sync::Arc<parking_lot::Mutex<Ssd1306Sim>>, Ssd1306<SimI2cBus>) {
        let bus = SimI2cBus::new();
        let sim = bus.attach(DEFAULT_ADDRESS, Ssd1306Sim::new(size.height()));
        (sim, Ssd1306::new(bus, DEFAULT_ADDRESS, size))
    }

    #[tokio::test]
    async fn test_init_turns_display_on() {
        let (sim, mut display) = setup(DisplaySize::Size128x64);
        display.init().await.unwrap();
        let sim = sim.lock();
        assert!(sim.display_on());
        assert_eq!(sim.multiplex(), 63);
        assert_eq!(sim.contrast(), 0xCF);
    }

    #[tokio::test]
    async fn test_drawing_reaches_display_ram() {
        let (sim, mut display) = setup(DisplaySize::Size128x64);
        display.init().await.unwrap();

        Rectangle::new(Point::new(10, 20), Size::new(4, 3))
            .into_styled(PrimitiveStyle::with_fill(BinaryColor::On))
            .draw(&mut display)
            .unwrap();
        Text::new("Hi", Point::new(0, 50), MonoTextStyle::new(&FONT_6X10, BinaryColor::On))
            .draw(&mut display)
            .unwrap();
        display.flush().await.unwrap();

        let sim = sim.lock();
        assert!(sim.pixel(10, 20));
        assert!(sim.pixel(13, 22));
        assert!(!sim.pixel(14, 22));
        assert!(!sim.pixel(10, 23));
        let text_pixels = (0..12)
            .flat_map(|x| (40..52).map(move |y| (x, y)))
            .filter(|&(x, y)| sim.pixel(x, y))
            .count();
        assert!(text_pixels > 10);
    }

    #[tokio::test]
    async fn test_rotation_maps_pixels() {
        let (sim, mut display) = setup(DisplaySize::Size128x32);
        display.set_rotation(Rotation::Deg90);
        assert_eq!(display.size(), Size::new(32, 128));

        Pixel(Point::new(0, 0), BinaryColor::On).draw(&mut display).unwrap();
        display.set_rotation(Rotation::Deg180);
        Pixel(Point::new(0, 0), BinaryColor::On).draw(&mut display).unwrap();
        // Off-screen pixels are ignored.
        Pixel(Point::new(200, 5), BinaryColor::On).draw(&mut display).unwrap();
        display.flush().await.unwrap();

        let sim = sim.lock();
        assert!(sim.pixel(127, 0));
        assert!(sim.pixel(127, 31));
        assert_eq!(sim.lit_pixels(), 2);
    }

    #[tokio::test]
    async fn test_contrast_and_invert_commands() {
        let (sim, mut display) = setup(DisplaySize::Size128x64);
        display.set_contrast(0x10).await.unwrap();
        display.set_inverted(true).await.unwrap();
        display.set_display_on(false).await.unwrap();

        let sim = sim.lock();
        assert_eq!(sim.contrast(), 0x10);
        assert!(sim.inverted());
        assert!(!sim.display_on());
    }
}
