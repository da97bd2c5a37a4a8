//! The per-process open-file table.
//!
//! A descriptor is a capability sum: stdin, stdout, the RTC device, the
//! directory, or a regular file. Operations a kind does not support are
//! explicit match arms in the syscall layer rather than null entries in
//! a function table. The `pos` field is the read offset for regular
//! files, the next entry index for the directory, and the
//! ticks-per-read count for the RTC.

/// Entries in a process's file table.
pub const MAX_OPEN_FILES: usize = 8;

/// Descriptor index pre-bound to the terminal reader.
pub const STDIN: usize = 0;

/// Descriptor index pre-bound to the terminal writer.
pub const STDOUT: usize = 1;

/// What a descriptor is capable of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOps {
    /// Terminal input; readable only.
    Stdin,
    /// Terminal output; writable only.
    Stdout,
    /// The virtualised RTC; read blocks, write sets the rate.
    Rtc,
    /// The directory; reads enumerate file names.
    Directory,
    /// A regular file in the read-only file system.
    Regular,
}

/// One open descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    /// Capability kind.
    pub ops: FileOps,
    /// Backing inode; meaningful only for [`FileOps::Regular`].
    pub inode: u32,
    /// Position counter; meaning depends on `ops`.
    pub pos: u32,
}

impl OpenFile {
    /// A descriptor of `ops` kind with zeroed bookkeeping.
    #[must_use]
    pub const fn new(ops: FileOps) -> Self {
        Self {
            ops,
            inode: 0,
            pos: 0,
        }
    }
}

/// The eight-slot descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdTable {
    entries: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl FdTable {
    /// A table with stdin and stdout bound and everything else free.
    #[must_use]
    pub const fn with_std() -> Self {
        let mut entries = [None; MAX_OPEN_FILES];
        entries[STDIN] = Some(OpenFile::new(FileOps::Stdin));
        entries[STDOUT] = Some(OpenFile::new(FileOps::Stdout));
        Self { entries }
    }

    /// Bind `file` to the lowest free slot at or above 2.
    pub fn open(&mut self, file: OpenFile) -> Option<usize> {
        for (fd, slot) in self.entries.iter_mut().enumerate().skip(2) {
            if slot.is_none() {
                *slot = Some(file);
                return Some(fd);
            }
        }
        None
    }

    /// Release slot `fd`. The std descriptors stay bound for the whole
    /// process lifetime, so closing 0 or 1 fails.
    ///
    /// # Errors
    /// Returns `Err(())` for std descriptors, out-of-range indices and
    /// slots that are already free.
    pub fn close(&mut self, fd: usize) -> Result<(), ()> {
        if !(2..MAX_OPEN_FILES).contains(&fd) {
            return Err(());
        }
        if self.entries[fd].take().is_none() {
            return Err(());
        }
        Ok(())
    }

    /// Release every slot, std descriptors included. Process teardown
    /// only.
    pub fn close_all(&mut self) {
        self.entries = [None; MAX_OPEN_FILES];
    }

    /// The descriptor in slot `fd`, if any.
    #[must_use]
    pub fn get(&self, fd: usize) -> Option<&OpenFile> {
        self.entries.get(fd)?.as_ref()
    }

    /// Mutable access to the descriptor in slot `fd`, if any.
    pub fn get_mut(&mut self, fd: usize) -> Option<&mut OpenFile> {
        self.entries.get_mut(fd)?.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_std_descriptors_are_prebound() {
        let table = FdTable::with_std();

        assert_eq!(
            table.get(STDIN).map(|file| file.ops),
            Some(FileOps::Stdin),
            "fd 0 must be stdin",
        );
        assert_eq!(
            table.get(STDOUT).map(|file| file.ops),
            Some(FileOps::Stdout),
            "fd 1 must be stdout",
        );
        assert!(table.get(2).is_none(), "fd 2 starts free");
    }

    #[test_case]
    fn test_open_close_round_trip_restores_table() {
        let mut table = FdTable::with_std();
        let pristine = table;

        let fd = table
            .open(OpenFile::new(FileOps::Rtc))
            .expect("a slot is free");
        assert!(fd >= 2, "allocated descriptors start at 2");

        table.close(fd).expect("closing an open fd succeeds");
        assert_eq!(table, pristine, "open then close must restore the table");
    }

    #[test_case]
    fn test_table_exhaustion_and_reuse() {
        let mut table = FdTable::with_std();

        for _ in 2..MAX_OPEN_FILES {
            assert!(
                table.open(OpenFile::new(FileOps::Regular)).is_some(),
                "six user slots should bind",
            );
        }
        assert!(
            table.open(OpenFile::new(FileOps::Regular)).is_none(),
            "a full table rejects further opens",
        );

        table.close(4).expect("closing frees a slot");
        assert_eq!(
            table.open(OpenFile::new(FileOps::Directory)),
            Some(4),
            "the freed slot is the first handed out again",
        );
    }

    #[test_case]
    fn test_std_descriptors_cannot_close() {
        let mut table = FdTable::with_std();

        assert!(table.close(STDIN).is_err(), "fd 0 must refuse to close");
        assert!(table.close(STDOUT).is_err(), "fd 1 must refuse to close");
        assert!(table.close(MAX_OPEN_FILES).is_err(), "fd 8 is out of range");
        assert!(table.close(5).is_err(), "closing a free slot fails");
    }
}
