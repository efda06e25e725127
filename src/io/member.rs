//! File-backed member device.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::io::child::{ChildIo, MemberDevice};
use crate::io::{Direction, SECTOR_SHIFT};

/// A member backed by an ordinary file or block device node.
///
/// I/O runs synchronously on the submitting thread and completes inline;
/// the data path already tolerates submission re-entering completion.
pub struct FileMember {
    file: File,
}

impl FileMember {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl MemberDevice for FileMember {
    fn submit(&self, io: ChildIo) {
        let offset = io.sector() << SECTOR_SHIFT;
        let result = match io.direction() {
            Direction::Write => self.file.write_all_at(&io.payload(), offset),
            Direction::Read => {
                let mut buf = vec![0u8; io.len()];
                self.file.read_exact_at(&mut buf, offset).map(|()| io.fill(&buf))
            }
        };
        io.complete(result);
    }
}

