//! USB driver for IT8951-based e-paper display controllers.
//!
//! The IT8951 shows up as a USB mass-storage device and speaks a vendor
//! command set framed in standard Bulk-Only Transport CBW/CSW envelopes.
//! This crate owns that whole path: the bulk transport, the register
//! protocol, per-panel session state, pixel packing for the controller's
//! 1bpp and 8bpp image-memory layouts, and the strip-by-strip draw loop
//! that keeps every transfer under the link's size ceiling.
//!
//! Rendering is out of scope: callers bring finished pixel buffers (one byte
//! per pixel) wrapped in a [`Frame`] and get a refreshed panel back.
//!
//! ```no_run
//! use it8951_usb::{BitDepth, Frame, It8951};
//!
//! let mut panel = It8951::open_default()?;
//! panel.set_bit_depth(BitDepth::One)?;
//! let pixels = vec![0u8; (panel.width() * panel.height()) as usize];
//! let frame = Frame::new(panel.width(), panel.height(), &pixels)?;
//! panel.draw(&frame, 0, 0)?;
//! panel.close()?;
//! # Ok::<(), it8951_usb::Error>(())
//! ```

pub mod command;
pub mod display;
pub mod interface;

use std::thread;
use std::time::Duration;

use thiserror::Error as ThisError;

use command::{reg, MAX_TRANSFER};
pub use command::{DisplayMode, Inquiry, SystemInfo};
pub use display::{BitDepth, Frame};
pub use interface::{Transport, UsbTransport};

/// ITE's USB vendor ID.
pub const VENDOR_ID: u16 = 0x048d;
/// Product ID of the IT8951 mass-storage personality.
pub const PRODUCT_ID: u16 = 0x8951;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READY_POLL_LIMIT: u32 = 300;

/// Everything that can go wrong between [`It8951::open`] and a refreshed
/// panel. Nothing is retried internally; retry policy belongs to the caller.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("no USB device matching {vid:04x}:{pid:04x}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("could not claim USB interface: {0}")]
    DeviceBusy(#[source] rusb::Error),

    #[error("USB transfer failed: {0}")]
    Transport(#[from] rusb::Error),

    #[error("short {phase} transfer: {actual} of {expected} bytes")]
    ShortTransfer {
        phase: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("pixel buffer is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("fast image load needs a full-width buffer ({width} px, panel is {panel_width})")]
    UnsupportedGeometry { width: u32, panel_width: u32 },

    #[error("unusable panel row pitch of {pitch} bytes (single-transfer limit is {max} bytes)")]
    Configuration { pitch: u32, max: usize },

    #[error("packed strip of {len} bytes exceeds the {max}-byte transfer limit")]
    BufferTooLarge { len: usize, max: usize },

    #[error("timed out waiting for the display to become ready")]
    Timeout,
}

/// One open IT8951 panel session.
///
/// Owns the transport exclusively for its lifetime; the device is reset and
/// released by [`close`](Self::close) or on drop. Pitch, chunk height and the
/// default refresh mode are derived from the panel metadata and re-derived on
/// every [`set_bit_depth`](Self::set_bit_depth).
#[derive(Debug)]
pub struct It8951<T: Transport> {
    transport: T,
    info: SystemInfo,
    depth: BitDepth,
    pitch: u32,
    max_chunk_height: u32,
    mode: DisplayMode,
    ready_poll_interval: Duration,
    ready_poll_limit: u32,
}

impl It8951<UsbTransport> {
    /// Open the panel at the well-known IT8951 VID/PID.
    pub fn open_default() -> Result<Self, Error> {
        Self::open(VENDOR_ID, PRODUCT_ID)
    }

    /// Open the panel behind the given USB identifiers.
    pub fn open(vid: u16, pid: u16) -> Result<Self, Error> {
        Self::with_transport(UsbTransport::open(vid, pid)?)
    }
}

impl<T: Transport> It8951<T> {
    /// Start a session over an already-open transport.
    ///
    /// Queries the panel metadata, then applies the 8bpp default so that
    /// pitch and chunk sizing are always valid.
    pub fn with_transport(mut transport: T) -> Result<Self, Error> {
        let raw = transport.read_command(&command::GET_SYS_CMD, command::SYS_INFO_LEN)?;
        let info = SystemInfo::decode(&raw)?;
        log::info!(
            "IT8951 panel {}x{}, image memory at {:#010x}, command table v{}",
            info.width,
            info.height,
            info.image_buf_base,
            info.version
        );

        let mut session = It8951 {
            transport,
            info,
            depth: BitDepth::Eight,
            pitch: 0,
            max_chunk_height: 0,
            mode: DisplayMode::Du4,
            ready_poll_interval: READY_POLL_INTERVAL,
            ready_poll_limit: READY_POLL_LIMIT,
        };
        session.set_bit_depth(BitDepth::Eight)?;
        Ok(session)
    }

    pub fn system_info(&self) -> &SystemInfo {
        &self.info
    }

    /// Panel width in pixels.
    pub fn width(&self) -> u32 {
        self.info.width
    }

    /// Panel height in pixels.
    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn bit_depth(&self) -> BitDepth {
        self.depth
    }

    /// Bytes per full panel row at the active bit depth.
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    /// Rows per strip that keep one packed transfer under the size ceiling.
    pub fn max_chunk_height(&self) -> u32 {
        self.max_chunk_height
    }

    /// Waveform used by [`draw`](Self::draw) at the active bit depth.
    pub fn refresh_mode(&self) -> DisplayMode {
        self.mode
    }

    /// Adjust how long [`clear`](Self::clear) waits for the LUT engines to
    /// go idle: `limit` polls spaced `interval` apart, then
    /// [`Error::Timeout`]. Defaults to 300 polls at 100 ms.
    pub fn set_ready_poll(&mut self, interval: Duration, limit: u32) {
        self.ready_poll_interval = interval;
        self.ready_poll_limit = limit;
    }

    /// Vendor/product/revision strings from a SCSI INQUIRY.
    pub fn inquiry(&mut self) -> Result<Inquiry, Error> {
        let raw = self
            .transport
            .read_command(&command::INQUIRY_CMD, command::INQUIRY_LEN)?;
        Inquiry::decode(&raw)
    }

    /// Read `len` bytes from a controller register. `len` is small in
    /// practice, 2 or 4 bytes.
    pub fn read_register(&mut self, address: u32, len: u16) -> Result<Vec<u8>, Error> {
        let cmd = command::register_command(address, command::OP_REG_READ, len);
        self.transport.read_command(&cmd, len as usize)
    }

    /// Write bytes to a controller register.
    pub fn write_register(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.write_register_generic(address, command::OP_REG_WRITE, data)
    }

    /// Fast-path register write straight into image memory.
    ///
    /// Only meaningful for full-panel-width row-aligned buffers; the draw
    /// loop guards that precondition, direct callers must do the same.
    pub fn write_register_fast(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.write_register_generic(address, command::OP_REG_WRITE_FAST, data)
    }

    fn write_register_generic(
        &mut self,
        address: u32,
        opcode: u8,
        data: &[u8],
    ) -> Result<(), Error> {
        if data.len() > MAX_TRANSFER {
            return Err(Error::BufferTooLarge {
                len: data.len(),
                max: MAX_TRANSFER,
            });
        }
        let cmd = command::register_command(address, opcode, data.len() as u16);
        self.transport.write_command(&cmd, data)
    }

    /// Set the panel VCOM voltage in millivolts, e.g. `2000` for -2.0V.
    pub fn set_vcom(&mut self, millivolts: u16) -> Result<(), Error> {
        self.transport
            .write_command(&command::vcom_command(millivolts), &[])
    }

    /// Switch image memory between 1bpp and 8bpp and re-derive pitch, chunk
    /// height and the default refresh mode.
    pub fn set_bit_depth(&mut self, depth: BitDepth) -> Result<(), Error> {
        let pitch = depth.pitch(self.info.width);
        if pitch == 0 || pitch as usize > MAX_TRANSFER {
            return Err(Error::Configuration {
                pitch,
                max: MAX_TRANSFER,
            });
        }

        // The bpp control bits live in byte 2 of UP1SR; read-modify-write so
        // the unrelated bits survive.
        let mut up1sr = self.read_register(reg::UP1SR, 4)?;
        match depth {
            BitDepth::One => up1sr[2] |= command::UP1SR_1BPP_BITS,
            BitDepth::Eight => up1sr[2] &= !command::UP1SR_1BPP_BITS,
        }
        self.write_register(reg::UP1SR, &up1sr)?;

        // 1bpp color table; harmless when 8bpp is active.
        self.write_register(reg::BGVR, &[command::BACK_GRAY, command::FRONT_GRAY])?;

        let row_dwords = ((pitch + 3) / 4) as u16;
        self.write_register(reg::WIDTH, &row_dwords.to_le_bytes())?;

        self.depth = depth;
        self.pitch = pitch;
        self.max_chunk_height = display::max_chunk_height(pitch);
        self.mode = depth.default_mode();
        log::debug!(
            "bit depth {depth:?}: pitch {pitch} bytes, {} rows per chunk",
            self.max_chunk_height
        );
        Ok(())
    }

    /// Load a packed area into image memory at panel coordinates, without
    /// refreshing.
    pub fn load_image_area(&mut self, x: u32, y: u32, frame: &Frame) -> Result<(), Error> {
        let packed = frame.pack(self.depth);
        if packed.len() > MAX_TRANSFER {
            return Err(Error::BufferTooLarge {
                len: packed.len(),
                max: MAX_TRANSFER,
            });
        }
        let header = command::image_area_header(
            self.info.image_buf_base,
            x,
            y,
            frame.width(),
            frame.height(),
        );
        let mut data = Vec::with_capacity(header.len() + packed.len());
        data.extend_from_slice(&header);
        data.extend_from_slice(&packed);
        self.transport.write_command(&command::LD_IMAGE_AREA_CMD, &data)
    }

    /// Load a full-width strip straight into image memory at row `y` via the
    /// fast register path.
    ///
    /// Fails with [`Error::UnsupportedGeometry`] for anything narrower than
    /// the panel; a partial-width buffer written this way would smear across
    /// row boundaries.
    pub fn load_image_fast(&mut self, y: u32, frame: &Frame) -> Result<(), Error> {
        if frame.width() != self.info.width {
            return Err(Error::UnsupportedGeometry {
                width: frame.width(),
                panel_width: self.info.width,
            });
        }
        let packed = frame.pack(self.depth);
        if packed.len() > MAX_TRANSFER {
            return Err(Error::BufferTooLarge {
                len: packed.len(),
                max: MAX_TRANSFER,
            });
        }
        let address = self
            .info
            .image_buf_base
            .wrapping_sub(command::REG_ADJUST)
            .wrapping_add(self.pitch * y);
        self.write_register_fast(address, &packed)
    }

    /// Refresh a panel rectangle from image memory with the given waveform.
    pub fn display_area(
        &mut self,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        mode: DisplayMode,
    ) -> Result<(), Error> {
        let payload =
            command::display_area_payload(self.info.image_buf_base, mode, x, y, w, h);
        self.transport.write_command(&command::DPY_AREA_CMD, &payload)
    }

    /// Draw a frame at panel coordinates with the default refresh mode.
    pub fn draw(&mut self, frame: &Frame, x: u32, y: u32) -> Result<(), Error> {
        self.draw_with(frame, x, y, self.mode, true)
    }

    /// Draw a frame at panel coordinates.
    ///
    /// The frame is split into horizontal strips that each fit one transfer,
    /// loaded top to bottom, and then refreshed with a single display-area
    /// command. No strip triggers a partial refresh, so the panel never shows
    /// a torn intermediate frame; on error the visible display is unchanged.
    pub fn draw_with(
        &mut self,
        frame: &Frame,
        x: u32,
        y: u32,
        mode: DisplayMode,
        refresh: bool,
    ) -> Result<(), Error> {
        let mut row = 0;
        while row < frame.height() {
            let rows = (frame.height() - row).min(self.max_chunk_height);
            let strip = frame.strip(row, rows);
            log::trace!("loading strip at row {row}, {rows} rows");
            if strip.width() == self.info.width {
                self.load_image_fast(y + row, &strip)?;
            } else {
                self.load_image_area(x, y + row, &strip)?;
            }
            row += rows;
        }
        if refresh {
            self.display_area(x, y, frame.width(), frame.height(), mode)?;
        }
        Ok(())
    }

    /// Clear the whole panel with the init waveform and wait for the (slow)
    /// clear to finish before returning.
    pub fn clear(&mut self) -> Result<(), Error> {
        let white = match self.depth {
            BitDepth::One => 0x00,
            BitDepth::Eight => 0xff,
        };
        let pixels = vec![white; (self.info.width * self.info.height) as usize];
        let frame = Frame::new(self.info.width, self.info.height, &pixels)?;
        self.draw_with(&frame, 0, 0, DisplayMode::Init, true)?;
        self.wait_display_ready()
    }

    /// Poll the LUT status register until every engine is idle.
    fn wait_display_ready(&mut self) -> Result<(), Error> {
        for _ in 0..self.ready_poll_limit {
            let status = self.read_register(reg::LUTAFSR, 4)?;
            if status.iter().all(|&b| b == 0) {
                return Ok(());
            }
            thread::sleep(self.ready_poll_interval);
        }
        Err(Error::Timeout)
    }

    /// Reset the device and release the interface. Safe to call twice.
    pub fn close(&mut self) -> Result<(), Error> {
        self.transport.close()
    }
}
