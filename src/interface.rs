//! USB Bulk-Only Transport framing for the IT8951 command set.
//!
//! Every exchange is CBW, then the data phase, then the CSW. The protocol is
//! strictly one command outstanding per device handle; there is no pipelining
//! and no automatic retry, callers decide what a failed exchange means.

use std::time::Duration;

use rusb::{Context, DeviceHandle, TransferType, UsbContext};

use crate::Error;

const CBW_SIGNATURE: [u8; 4] = *b"USBC";
const CSW_SIGNATURE: [u8; 4] = *b"USBS";
const CSW_LEN: usize = 13;

/// The vendor command set lives on interface 0.
const INTERFACE: u8 = 0;

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
// Panel refreshes can hold off the status phase for a long time; keep reads
// generous rather than racing the waveform.
const READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Direction of the data phase, as seen from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Trait implemented by transports that can carry the 16-byte command blocks
/// of [`crate::command`]. [`UsbTransport`] is the real one; tests substitute
/// their own.
pub trait Transport {
    /// Issue a command and read exactly `len` response bytes.
    fn read_command(&mut self, command: &[u8; 16], len: usize) -> Result<Vec<u8>, Error>;

    /// Issue a command with an outbound data phase (possibly empty).
    fn write_command(&mut self, command: &[u8; 16], data: &[u8]) -> Result<(), Error>;

    /// Release the device. Idempotent.
    fn close(&mut self) -> Result<(), Error>;
}

/// 31-byte Command Block Wrapper.
struct Cbw {
    tag: u32,
    data_transfer_length: u32,
    direction: Direction,
    command: [u8; 16],
}

impl Cbw {
    fn to_bytes(&self) -> [u8; 31] {
        let mut buf = [0u8; 31];
        buf[0..4].copy_from_slice(&CBW_SIGNATURE);
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        buf[12] = match self.direction {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        buf[13] = 0; // LUN
        buf[14] = 16; // command length
        buf[15..31].copy_from_slice(&self.command);
        buf
    }
}

/// 13-byte Command Status Wrapper.
struct Csw {
    tag: u32,
    data_residue: u32,
    status: u8,
}

impl Csw {
    fn parse(raw: &[u8; CSW_LEN]) -> Result<Self, Error> {
        if raw[0..4] != CSW_SIGNATURE {
            return Err(Error::Protocol(format!(
                "bad status signature {:02x?}",
                &raw[0..4]
            )));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&raw[4..8]);
        let tag = u32::from_le_bytes(word);
        word.copy_from_slice(&raw[8..12]);
        let data_residue = u32::from_le_bytes(word);
        Ok(Csw {
            tag,
            data_residue,
            status: raw[12],
        })
    }
}

/// Exclusively-owned bulk pipe to one IT8951 device.
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    ep_in: u8,
    ep_out: u8,
    tag: u32,
    closed: bool,
}

impl UsbTransport {
    /// Open the device with the given VID/PID, claiming interface 0.
    ///
    /// Resets the device and detaches a bound kernel driver first, the same
    /// dance a mass-storage device needs before vendor commands get through.
    pub fn open(vid: u16, pid: u16) -> Result<Self, Error> {
        let context = Context::new()?;
        let mut handle = context
            .open_device_with_vid_pid(vid, pid)
            .ok_or(Error::DeviceNotFound { vid, pid })?;
        let device = handle.device();

        handle.reset()?;
        if handle.kernel_driver_active(INTERFACE).unwrap_or(false) {
            handle.detach_kernel_driver(INTERFACE)?;
        }

        let config = device.config_descriptor(0)?;
        handle.set_active_configuration(config.number())?;
        handle
            .claim_interface(INTERFACE)
            .map_err(Error::DeviceBusy)?;

        let mut ep_in = None;
        let mut ep_out = None;
        for interface in config.interfaces().filter(|i| i.number() == INTERFACE) {
            for descriptor in interface.descriptors() {
                for endpoint in descriptor.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match endpoint.direction() {
                        rusb::Direction::In => ep_in = Some(endpoint.address()),
                        rusb::Direction::Out => ep_out = Some(endpoint.address()),
                    }
                }
            }
        }
        let (ep_in, ep_out) = ep_in
            .zip(ep_out)
            .ok_or_else(|| Error::Protocol("no bulk endpoint pair on interface 0".into()))?;

        log::debug!("opened {vid:04x}:{pid:04x}, bulk in {ep_in:#04x} out {ep_out:#04x}");

        Ok(UsbTransport {
            handle,
            ep_in,
            ep_out,
            tag: 0,
            closed: false,
        })
    }

    /// Next CBW tag. Wraps on `u32` overflow; BOT only needs the tag to be
    /// unique for in-flight correlation and there is exactly one command
    /// outstanding at a time.
    fn next_tag(&mut self) -> u32 {
        self.tag = self.tag.wrapping_add(1);
        self.tag
    }

    fn send_cbw(
        &mut self,
        command: &[u8; 16],
        data_transfer_length: u32,
        direction: Direction,
    ) -> Result<u32, Error> {
        let cbw = Cbw {
            tag: self.next_tag(),
            data_transfer_length,
            direction,
            command: *command,
        };
        let raw = cbw.to_bytes();
        let written = self.handle.write_bulk(self.ep_out, &raw, WRITE_TIMEOUT)?;
        if written != raw.len() {
            return Err(Error::ShortTransfer {
                phase: "command",
                expected: raw.len(),
                actual: written,
            });
        }
        Ok(cbw.tag)
    }

    /// Consume the CSW that ends every exchange. A failed or mismatched CSW
    /// is fatal to the exchange; skipping it would desync the state machine.
    fn read_csw(&mut self, tag: u32) -> Result<(), Error> {
        let mut raw = [0u8; CSW_LEN];
        let read = self.handle.read_bulk(self.ep_in, &mut raw, READ_TIMEOUT)?;
        if read != CSW_LEN {
            return Err(Error::ShortTransfer {
                phase: "status",
                expected: CSW_LEN,
                actual: read,
            });
        }
        let csw = Csw::parse(&raw)?;
        if csw.tag != tag {
            return Err(Error::Protocol(format!(
                "status tag {:#010x} does not echo command tag {tag:#010x}",
                csw.tag
            )));
        }
        if csw.status != 0 {
            return Err(Error::Protocol(format!(
                "command failed with status {}",
                csw.status
            )));
        }
        if csw.data_residue != 0 {
            log::debug!("device reported {} bytes of residue", csw.data_residue);
        }
        Ok(())
    }
}

impl Transport for UsbTransport {
    fn read_command(&mut self, command: &[u8; 16], len: usize) -> Result<Vec<u8>, Error> {
        let tag = self.send_cbw(command, len as u32, Direction::In)?;
        let mut data = vec![0u8; len];
        let read = self.handle.read_bulk(self.ep_in, &mut data, READ_TIMEOUT)?;
        if read != len {
            return Err(Error::ShortTransfer {
                phase: "data",
                expected: len,
                actual: read,
            });
        }
        self.read_csw(tag)?;
        Ok(data)
    }

    fn write_command(&mut self, command: &[u8; 16], data: &[u8]) -> Result<(), Error> {
        let tag = self.send_cbw(command, data.len() as u32, Direction::Out)?;
        if !data.is_empty() {
            let written = self.handle.write_bulk(self.ep_out, data, WRITE_TIMEOUT)?;
            if written != data.len() {
                return Err(Error::ShortTransfer {
                    phase: "data",
                    expected: data.len(),
                    actual: written,
                });
            }
        }
        self.read_csw(tag)
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.handle.release_interface(INTERFACE);
        self.handle.reset()?;
        Ok(())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
