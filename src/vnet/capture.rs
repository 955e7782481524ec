//! Frame capture in libpcap format.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const LINKTYPE_ETHERNET: u32 = 1;

/// Appends every frame to a pcap file readable by tcpdump and wireshark.
#[derive(Debug)]
pub struct Capture {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl Capture {
    /// Create `path` and write the pcap global header.
    pub fn create(path: &Path, snaplen: u32) -> io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&PCAP_MAGIC.to_le_bytes())?;
        writer.write_all(&2u16.to_le_bytes())?;
        writer.write_all(&4u16.to_le_bytes())?;
        writer.write_all(&0i32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&snaplen.to_le_bytes())?;
        writer.write_all(&LINKTYPE_ETHERNET.to_le_bytes())?;
        writer.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one frame stamped with the current time.
    pub fn record(&self, frame: &[u8]) -> io::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let len = u32::try_from(frame.len()).unwrap_or(u32::MAX);

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("capture writer poisoned"))?;
        writer.write_all(&(now.as_secs() as u32).to_le_bytes())?;
        writer.write_all(&now.subsec_micros().to_le_bytes())?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(frame)?;
        writer.flush()
    }
}
