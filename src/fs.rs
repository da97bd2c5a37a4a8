//! Read-only indexed file system, as consumed by the syscall layer.
//!
//! The on-disk format is flat and block-structured: one boot block with
//! the object counts and up to 63 directory entries, then one block per
//! inode (length plus data-block indices), then the data blocks. The
//! image is memory-resident and handed to [`init`] once at boot; the
//! parser never writes.

use conquer_once::spin::OnceCell;

/// Maximum length of a file name, not necessarily null-terminated.
pub const FILENAME_SIZE: usize = 32;

/// Size of every block in the image.
pub const BLOCK_SIZE: usize = 4096;

/// Directory entries the boot block can hold.
pub const MAX_DENTRIES: usize = 63;

const DENTRY_SIZE: usize = 64;
const DENTRY_TYPE_OFFSET: usize = 32;
const DENTRY_INODE_OFFSET: usize = 36;

/// What a directory entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// The RTC device node.
    Rtc,
    /// The directory itself.
    Directory,
    /// A regular file backed by an inode.
    Regular,
}

impl FileType {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Rtc),
            1 => Some(Self::Directory),
            2 => Some(Self::Regular),
            _ => None,
        }
    }
}

/// One directory entry.
#[derive(Debug, Clone, Copy)]
pub struct Dentry {
    name: [u8; FILENAME_SIZE],
    /// What the entry names.
    pub file_type: FileType,
    /// Index of the backing inode (meaningful for regular files).
    pub inode: u32,
}

impl Dentry {
    /// The name bytes, trimmed of trailing padding.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(FILENAME_SIZE);
        &self.name[..end]
    }
}

/// Errors surfaced by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The image is too small for what its counts claim.
    Truncated,
    /// An inode index is out of range.
    BadInode,
    /// A data block index is out of range.
    BadBlock,
}

/// A parsed view over one file-system image.
pub struct FileSystem<'a> {
    image: &'a [u8],
    num_dentries: u32,
    num_inodes: u32,
    num_data_blocks: u32,
}

impl<'a> FileSystem<'a> {
    /// Parse the boot block of `image`.
    ///
    /// # Errors
    /// Fails when the image cannot hold the blocks its counts promise.
    pub fn new(image: &'a [u8]) -> Result<Self, FsError> {
        if image.len() < BLOCK_SIZE {
            return Err(FsError::Truncated);
        }

        let num_dentries = read_u32(image, 0);
        let num_inodes = read_u32(image, 4);
        let num_data_blocks = read_u32(image, 8);

        let blocks_needed = 1 + num_inodes as usize + num_data_blocks as usize;
        if image.len() < blocks_needed * BLOCK_SIZE || num_dentries as usize > MAX_DENTRIES {
            return Err(FsError::Truncated);
        }

        Ok(Self {
            image,
            num_dentries,
            num_inodes,
            num_data_blocks,
        })
    }

    /// Number of directory entries in the image.
    #[must_use]
    pub const fn dentry_count(&self) -> u32 {
        self.num_dentries
    }

    /// Look a file up by name. Names longer than [`FILENAME_SIZE`] can
    /// never match.
    #[must_use]
    pub fn read_dentry_by_name(&self, name: &[u8]) -> Option<Dentry> {
        if name.is_empty() || name.len() > FILENAME_SIZE {
            return None;
        }

        (0..self.num_dentries)
            .filter_map(|index| self.read_dentry_by_index(index))
            .find(|dentry| dentry.name() == name)
    }

    /// The `index`th directory entry, in image order.
    #[must_use]
    pub fn read_dentry_by_index(&self, index: u32) -> Option<Dentry> {
        if index >= self.num_dentries {
            return None;
        }

        let offset = (1 + index as usize) * DENTRY_SIZE;
        let raw = &self.image[offset..offset + DENTRY_SIZE];

        let mut name = [0u8; FILENAME_SIZE];
        name.copy_from_slice(&raw[..FILENAME_SIZE]);

        Some(Dentry {
            name,
            file_type: FileType::from_raw(read_u32(raw, DENTRY_TYPE_OFFSET))?,
            inode: read_u32(raw, DENTRY_INODE_OFFSET),
        })
    }

    /// Byte length of the file behind `inode`.
    ///
    /// # Errors
    /// Fails when `inode` is out of range.
    pub fn file_length(&self, inode: u32) -> Result<usize, FsError> {
        if inode >= self.num_inodes {
            return Err(FsError::BadInode);
        }

        let block = self.inode_block(inode);
        Ok(read_u32(block, 0) as usize)
    }

    /// Copy file bytes starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied; 0 at or past end of file.
    ///
    /// # Errors
    /// Fails for an out-of-range inode or a corrupt data-block index.
    pub fn read_data(&self, inode: u32, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let length = self.file_length(inode)?;

        if offset >= length || buf.is_empty() {
            return Ok(0);
        }

        let inode_block = self.inode_block(inode);
        let to_copy = core::cmp::min(buf.len(), length - offset);

        let mut copied = 0;
        while copied < to_copy {
            let position = offset + copied;
            let block_index = position / BLOCK_SIZE;
            let block_offset = position % BLOCK_SIZE;

            let data_block = read_u32(inode_block, 4 + block_index * 4);
            if data_block >= self.num_data_blocks {
                return Err(FsError::BadBlock);
            }

            let block_start =
                (1 + self.num_inodes as usize + data_block as usize) * BLOCK_SIZE;
            let chunk = core::cmp::min(to_copy - copied, BLOCK_SIZE - block_offset);

            buf[copied..copied + chunk].copy_from_slice(
                &self.image[block_start + block_offset..block_start + block_offset + chunk],
            );
            copied += chunk;
        }

        Ok(copied)
    }

    fn inode_block(&self, inode: u32) -> &[u8] {
        let start = (1 + inode as usize) * BLOCK_SIZE;
        &self.image[start..start + BLOCK_SIZE]
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(
        bytes[offset..offset + 4]
            .try_into()
            .expect("four bytes available by construction"),
    )
}

static SYSTEM: OnceCell<FileSystem<'static>> = OnceCell::uninit();

/// Parse the boot image and publish it as the mounted file system.
///
/// # Errors
/// Fails when the image does not parse; the kernel then runs without a
/// file system and `execute` cannot resolve programs.
pub fn init(image: &'static [u8]) -> Result<(), FsError> {
    let parsed = FileSystem::new(image)?;
    SYSTEM.init_once(|| parsed);
    Ok(())
}

/// The mounted file system, when [`init`] succeeded.
pub fn system() -> Option<&'static FileSystem<'static>> {
    SYSTEM.get()
}

#[cfg(test)]
pub mod testing {
    //! Builder for synthetic images, shared by unit and integration
    //! tests.

    use alloc::vec;
    use alloc::vec::Vec;

    use super::{BLOCK_SIZE, DENTRY_SIZE, FILENAME_SIZE};

    /// Build a valid image from `(name, type, content)` triples. Every
    /// regular file gets one inode and as many data blocks as needed.
    #[must_use]
    pub fn build_image(entries: &[(&[u8], u32, &[u8])]) -> Vec<u8> {
        let files: Vec<&(&[u8], u32, &[u8])> =
            entries.iter().filter(|(_, ftype, _)| *ftype == 2).collect();

        let num_inodes = files.len();
        let num_data_blocks: usize = files
            .iter()
            .map(|(_, _, content)| content.len().div_ceil(BLOCK_SIZE).max(1))
            .sum();

        let total_blocks = 1 + num_inodes + num_data_blocks;
        let mut image = vec![0u8; total_blocks * BLOCK_SIZE];

        image[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        image[4..8].copy_from_slice(&(num_inodes as u32).to_le_bytes());
        image[8..12].copy_from_slice(&(num_data_blocks as u32).to_le_bytes());

        let mut next_inode = 0u32;
        let mut next_block = 0u32;

        for (index, (name, ftype, content)) in entries.iter().enumerate() {
            let offset = (1 + index) * DENTRY_SIZE;
            let name_len = name.len().min(FILENAME_SIZE);
            image[offset..offset + name_len].copy_from_slice(&name[..name_len]);
            image[offset + 32..offset + 36].copy_from_slice(&ftype.to_le_bytes());

            if *ftype != 2 {
                continue;
            }

            image[offset + 36..offset + 40].copy_from_slice(&next_inode.to_le_bytes());

            let inode_start = (1 + next_inode as usize) * BLOCK_SIZE;
            image[inode_start..inode_start + 4]
                .copy_from_slice(&(content.len() as u32).to_le_bytes());

            let blocks = content.len().div_ceil(BLOCK_SIZE).max(1);
            for chunk_index in 0..blocks {
                image[inode_start + 4 + chunk_index * 4..inode_start + 8 + chunk_index * 4]
                    .copy_from_slice(&next_block.to_le_bytes());

                let data_start = (1 + num_inodes + next_block as usize) * BLOCK_SIZE;
                let lo = chunk_index * BLOCK_SIZE;
                let hi = ((chunk_index + 1) * BLOCK_SIZE).min(content.len());
                image[data_start..data_start + (hi - lo)].copy_from_slice(&content[lo..hi]);

                next_block += 1;
            }

            next_inode += 1;
        }

        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_lookup_by_name_and_read_back() {
        let image = testing::build_image(&[
            (b".", 1, b""),
            (b"hello.txt", 2, b"greetings from the file system"),
        ]);
        let fs = FileSystem::new(&image).expect("image parses");

        let dentry = fs.read_dentry_by_name(b"hello.txt").expect("file exists");
        assert_eq!(dentry.file_type, FileType::Regular, "type survives lookup");

        let mut buf = [0u8; 64];
        let count = fs.read_data(dentry.inode, 0, &mut buf).expect("read ok");
        assert_eq!(
            &buf[..count],
            b"greetings from the file system",
            "content round-trips",
        );
    }

    #[test_case]
    fn test_missing_name_not_found() {
        let image = testing::build_image(&[(b".", 1, b"")]);
        let fs = FileSystem::new(&image).expect("image parses");

        assert!(
            fs.read_dentry_by_name(b"doesnotexist").is_none(),
            "lookup of an absent name must fail",
        );
        assert!(
            fs.read_dentry_by_name(b"").is_none(),
            "the empty name never matches",
        );
    }

    #[test_case]
    fn test_read_past_end_returns_zero() {
        let image = testing::build_image(&[(b"short", 2, b"abc")]);
        let fs = FileSystem::new(&image).expect("image parses");
        let dentry = fs.read_dentry_by_name(b"short").expect("file exists");

        let mut buf = [0u8; 8];
        assert_eq!(
            fs.read_data(dentry.inode, 3, &mut buf),
            Ok(0),
            "offset at EOF yields zero bytes",
        );
        assert_eq!(
            fs.read_data(dentry.inode, 100, &mut buf),
            Ok(0),
            "offset past EOF yields zero bytes",
        );
    }

    #[test_case]
    fn test_read_spans_block_boundary() {
        let mut content = alloc::vec::Vec::new();
        for index in 0..6000usize {
            content.push((index % 251) as u8);
        }

        let image = testing::build_image(&[(b"big", 2, &content)]);
        let fs = FileSystem::new(&image).expect("image parses");
        let dentry = fs.read_dentry_by_name(b"big").expect("file exists");

        let mut buf = alloc::vec![0u8; 6000];
        let count = fs.read_data(dentry.inode, 0, &mut buf).expect("read ok");
        assert_eq!(count, 6000, "whole file should be readable in one call");
        assert_eq!(buf, content, "bytes must survive the block walk");
    }

    #[test_case]
    fn test_bad_inode_rejected() {
        let image = testing::build_image(&[(b".", 1, b"")]);
        let fs = FileSystem::new(&image).expect("image parses");

        let mut buf = [0u8; 4];
        assert_eq!(
            fs.read_data(99, 0, &mut buf),
            Err(FsError::BadInode),
            "out-of-range inode must be rejected",
        );
    }
}
