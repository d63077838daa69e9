//! Flash driver implementation over the Linux MTD subsystem

use super::{FlashDriver, FlashError};

use anyhow::{bail, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// Flash that wraps an open /dev/mtdX file. MTD reports a single erase size for the whole device.
#[derive(Debug)]
pub struct MtdFlash {
    file: File,
    size: u32,
    erase_size: u32,
    write_size: u32,
}

impl MtdFlash {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let mut info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        };

        if info.writesize == 1 {
            // NOR and mtdram devices are bit-writable; use a small page so programs stay cheap
            info.writesize = 16;
        }

        ensure!(
            info.erasesize > 0 && info.size % info.erasesize == 0,
            "MTD size not multiple of erasesize"
        );
        ensure!(
            info.erasesize % info.writesize == 0,
            "MTD erasesize not multiple of writesize"
        );

        Ok(Self {
            file,
            size: info.size,
            erase_size: info.erasesize,
            write_size: info.writesize,
        })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Ensure that the byte range lies within the device, and compute its file offset
    fn offset_for(&self, addr: u32, len: usize) -> Result<u64, FlashError> {
        let end = addr as u64 + len as u64;
        if end > self.size as u64 {
            return Err(FlashError::OutOfBounds(format!(
                "{addr:#x}..{end:#x} past end of {:#x}-byte device",
                self.size
            )));
        }
        Ok(addr as u64)
    }
}

impl FlashDriver for MtdFlash {
    fn init(&mut self) -> Result<(), FlashError> {
        Ok(())
    }

    fn deinit(&mut self) {
        if let Err(err) = self.file.sync_all() {
            log::warn!("could not sync MTD device: {err}");
        }
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let offset = self.offset_for(addr, buf.len())?;
        Ok(self.file.read_exact_at(buf, offset)?)
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let offset = self.offset_for(addr, data.len())?;
        Ok(self.file.write_all_at(data, offset)?)
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        self.offset_for(addr, len as usize)?;
        if addr % self.erase_size != 0 || len % self.erase_size != 0 {
            return Err(FlashError::Misaligned(format!(
                "erase {addr:#x}+{len:#x} not on {:#x} boundaries",
                self.erase_size
            )));
        }

        let erase_info = ioctl::erase_info_user {
            start: addr,
            length: len,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info).map_err(std::io::Error::from)?;
        }
        Ok(())
    }

    fn page_size(&self) -> u32 {
        self.write_size
    }

    fn sector_size(&self, addr: u32) -> u32 {
        if addr < self.size {
            self.erase_size
        } else {
            0
        }
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);
}
