//! IT8951 vendor command table.
//!
//! All commands are fixed 16-byte blocks carried in the CBW of a mass-storage
//! exchange. Multi-byte fields inside a command block and inside command
//! payloads are big-endian; the CBW/CSW envelope itself is little-endian.

use crate::Error;

/// Leading byte of every vendor-specific command block.
pub const CUSTOMER_CMD: u8 = 0xfe;

/// SCSI INQUIRY. 40-byte response with vendor/product/revision strings.
pub const INQUIRY_CMD: [u8; 16] = [0x12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// Query controller/panel metadata. 116-byte response, see [`SystemInfo`].
pub const GET_SYS_CMD: [u8; 16] = [
    0xfe, 0x00, 0x38, 0x39, 0x35, 0x31, 0x80, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Load a packed pixel area into image memory.
///
/// Payload: `<<address:u32, x:u32, y:u32, w:u32, h:u32>>` followed by
/// `pitch(w) * h` packed pixel bytes.
pub const LD_IMAGE_AREA_CMD: [u8; 16] = [0xfe, 0, 0, 0, 0, 0, 0xa2, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// Refresh a panel area from image memory.
///
/// Payload: `<<address:u32, mode:u32, x:u32, y:u32, w:u32, h:u32, wait:u32>>`.
pub const DPY_AREA_CMD: [u8; 16] = [0xfe, 0, 0, 0, 0, 0, 0x94, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// Register read opcode, byte 6 of a register command block.
pub const OP_REG_READ: u8 = 0x81;
/// Register write opcode.
pub const OP_REG_WRITE: u8 = 0x82;
/// Fast register write opcode. Only valid for full-panel-width row-aligned
/// buffers written straight into image memory.
pub const OP_REG_WRITE_FAST: u8 = 0xa5;
/// VCOM / power control opcode.
pub const OP_VCOM: u8 = 0xa3;

/// Added to every register address before it goes on the wire.
pub const REG_ADJUST: u32 = 0x1800_0000;

/// Register map, addresses relative to [`REG_ADJUST`].
pub mod reg {
    /// LUT status of all engines; reads all-zero once every waveform is done.
    pub const LUTAFSR: u32 = 0x1224;
    /// Update parameter 1. Byte 2 carries the 1bpp/pitch-mode control bits.
    pub const UP1SR: u32 = 0x1138;
    /// Bitmap (1bpp) image color table: back and front gray levels.
    pub const BGVR: u32 = 0x1250;
    /// Panel row width, in double words.
    pub const WIDTH: u32 = 0x124c;
}

/// Bits of UP1SR byte 2 selecting 1bpp packed mode.
pub const UP1SR_1BPP_BITS: u8 = 0x06;
/// Gray level driven for 1-bits in 1bpp mode.
pub const FRONT_GRAY: u8 = 0x00;
/// Gray level driven for 0-bits in 1bpp mode.
pub const BACK_GRAY: u8 = 0xf0;

/// Largest data phase the link accepts: 60 KiB minus the 20-byte area header.
pub const MAX_TRANSFER: usize = 60 * 1024 - 20;

/// Build a register command block for `opcode` at `address`.
pub fn register_command(address: u32, opcode: u8, len: u16) -> [u8; 16] {
    let mut cmd = [0u8; 16];
    cmd[0] = CUSTOMER_CMD;
    cmd[2..6].copy_from_slice(&address.wrapping_add(REG_ADJUST).to_be_bytes());
    cmd[6] = opcode;
    cmd[7..9].copy_from_slice(&len.to_be_bytes());
    cmd
}

/// Header prepended to the packed pixels of an image-area load.
pub fn image_area_header(address: u32, x: u32, y: u32, w: u32, h: u32) -> [u8; 20] {
    let mut header = [0u8; 20];
    for (slot, word) in header.chunks_exact_mut(4).zip([address, x, y, w, h]) {
        slot.copy_from_slice(&word.to_be_bytes());
    }
    header
}

/// Payload of a display-area refresh.
pub fn display_area_payload(
    address: u32,
    mode: DisplayMode,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
) -> [u8; 28] {
    let wait_ready = 1;
    let mut payload = [0u8; 28];
    let words = [address, mode as u32, x, y, w, h, wait_ready];
    for (slot, word) in payload.chunks_exact_mut(4).zip(words) {
        slot.copy_from_slice(&word.to_be_bytes());
    }
    payload
}

/// VCOM set command. `vcom` is in millivolts, e.g. 2000 for -2.0V.
pub fn vcom_command(vcom: u16) -> [u8; 16] {
    let mut cmd = [0u8; 16];
    cmd[0] = CUSTOMER_CMD;
    cmd[6] = OP_VCOM;
    cmd[7..9].copy_from_slice(&vcom.to_be_bytes());
    cmd[9] = 1; // set vcom
    cmd
}

/// Refresh waveform modes of the IT8951 firmware table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DisplayMode {
    /// Full init/clear waveform. Slow, flashes the panel.
    Init = 0,
    /// Direct update, 2 levels.
    Du = 1,
    /// 16 gray levels, best fidelity.
    Gc16 = 2,
    Gl16 = 3,
    Glr16 = 4,
    Gld16 = 5,
    /// Fast 2-level update, the default for 1bpp.
    A2 = 6,
    /// 4-level direct update, the default for 8bpp.
    Du4 = 7,
}

/// Expected value of the [`SystemInfo`] signature word: `"8951"`.
pub const CONTROLLER_SIGNATURE: u32 = 0x3839_3531;

/// Length of a GET_SYS response: 29 big-endian 32-bit words.
pub const SYS_INFO_LEN: usize = 29 * 4;

/// Controller and panel metadata, queried once at session start.
#[derive(Clone, Debug)]
pub struct SystemInfo {
    pub standard_cmd_no: u32,
    pub extended_cmd_no: u32,
    /// Always `"8951"` for this controller family.
    pub signature: u32,
    /// Command table version.
    pub version: u32,
    /// Panel width in pixels.
    pub width: u32,
    /// Panel height in pixels.
    pub height: u32,
    pub update_buf_base: u32,
    /// Base address of image memory; image loads and refreshes target this.
    pub image_buf_base: u32,
    pub temperature_no: u32,
    /// Current display mode.
    pub mode: u32,
    /// Frame count per LUT engine.
    pub frame_count: [u32; 8],
    pub num_img_buf: u32,
}

impl SystemInfo {
    /// Decode a GET_SYS response, rejecting anything that does not carry the
    /// controller signature.
    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() != SYS_INFO_LEN {
            return Err(Error::Protocol(format!(
                "system info response is {} bytes, expected {}",
                raw.len(),
                SYS_INFO_LEN
            )));
        }
        let word = |i: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&raw[i * 4..i * 4 + 4]);
            u32::from_be_bytes(buf)
        };

        let signature = word(2);
        if signature != CONTROLLER_SIGNATURE {
            return Err(Error::Protocol(format!(
                "controller signature {signature:#010x} is not {CONTROLLER_SIGNATURE:#010x}"
            )));
        }

        let mut frame_count = [0u32; 8];
        for (i, count) in frame_count.iter_mut().enumerate() {
            *count = word(10 + i);
        }

        Ok(SystemInfo {
            standard_cmd_no: word(0),
            extended_cmd_no: word(1),
            signature,
            version: word(3),
            width: word(4),
            height: word(5),
            update_buf_base: word(6),
            image_buf_base: word(7),
            temperature_no: word(8),
            mode: word(9),
            frame_count,
            num_img_buf: word(18),
        })
    }
}

/// INQUIRY response fields.
#[derive(Clone, Debug)]
pub struct Inquiry {
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

/// Length of an INQUIRY response.
pub const INQUIRY_LEN: usize = 40;

impl Inquiry {
    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() != INQUIRY_LEN {
            return Err(Error::Protocol(format!(
                "inquiry response is {} bytes, expected {INQUIRY_LEN}",
                raw.len()
            )));
        }
        let field = |range: core::ops::Range<usize>| {
            String::from_utf8_lossy(&raw[range]).trim_end().to_string()
        };
        Ok(Inquiry {
            vendor: field(8..16),
            product: field(16..32),
            revision: field(32..36),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_command_layout() {
        let cmd = register_command(reg::UP1SR, OP_REG_READ, 4);
        assert_eq!(cmd[0], 0xfe);
        assert_eq!(cmd[1], 0);
        // 0x1138 + 0x1800_0000, big-endian
        assert_eq!(&cmd[2..6], &[0x18, 0x00, 0x11, 0x38]);
        assert_eq!(cmd[6], 0x81);
        assert_eq!(&cmd[7..9], &[0x00, 0x04]);
        assert_eq!(&cmd[9..], &[0u8; 7]);
    }

    #[test]
    fn vcom_command_layout() {
        // -2.0V
        let cmd = vcom_command(2000);
        assert_eq!(cmd[0], 0xfe);
        assert_eq!(&cmd[1..6], &[0u8; 5]);
        assert_eq!(cmd[6], 0xa3);
        // millivolts, big-endian
        assert_eq!(&cmd[7..9], &[0x07, 0xd0]);
        assert_eq!(cmd[9], 1);
        assert_eq!(&cmd[10..], &[0u8; 6]);
    }

    #[test]
    fn image_area_header_is_big_endian_words() {
        let header = image_area_header(0x0011_2398, 8, 16, 600, 60);
        assert_eq!(&header[0..4], &[0x00, 0x11, 0x23, 0x98]);
        assert_eq!(&header[4..8], &[0, 0, 0, 8]);
        assert_eq!(&header[8..12], &[0, 0, 0, 16]);
        assert_eq!(&header[12..16], &[0, 0, 0x02, 0x58]);
        assert_eq!(&header[16..20], &[0, 0, 0, 60]);
    }

    #[test]
    fn display_area_sets_wait_ready() {
        let payload = display_area_payload(0x0011_2398, DisplayMode::A2, 0, 0, 1872, 1404);
        assert_eq!(&payload[4..8], &[0, 0, 0, 6]);
        assert_eq!(&payload[24..28], &[0, 0, 0, 1]);
    }

    fn sys_info_words(signature: u32) -> Vec<u8> {
        let mut words = [0u32; 29];
        words[2] = signature;
        words[4] = 1872;
        words[5] = 1404;
        words[7] = 0x0011_2398;
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    #[test]
    fn system_info_decodes_panel_shape() {
        let info = SystemInfo::decode(&sys_info_words(CONTROLLER_SIGNATURE)).unwrap();
        assert_eq!(info.width, 1872);
        assert_eq!(info.height, 1404);
        assert_eq!(info.image_buf_base, 0x0011_2398);
    }

    #[test]
    fn system_info_rejects_foreign_signature() {
        let err = SystemInfo::decode(&sys_info_words(0xdead_beef)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn inquiry_slices_fixed_offsets() {
        let mut raw = vec![b' '; INQUIRY_LEN];
        raw[8..16].copy_from_slice(b"Generic ");
        raw[16..32].copy_from_slice(b"Storage RamDisc ");
        raw[32..36].copy_from_slice(b"1.00");
        let inquiry = Inquiry::decode(&raw).unwrap();
        assert_eq!(inquiry.vendor, "Generic");
        assert_eq!(inquiry.product, "Storage RamDisc");
        assert_eq!(inquiry.revision, "1.00");
    }
}
