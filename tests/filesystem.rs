//! File-system contract and executable-validation tests, run against a
//! synthetic image mounted at test startup.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(trios::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use trios::fs::{self, FileType, BLOCK_SIZE};
use trios::paging;
use trios::userspace::process::execute;
use trios::userspace::syscall::SyscallError;
use trios::{allocator, memory};
use x86_64::structures::paging::Translate;
use x86_64::VirtAddr;

entry_point!(main);

fn main(boot_info: &'static BootInfo) -> ! {
    trios::init();
    memory::init(boot_info);
    allocator::init_heap().expect("heap initialization failed");

    let image = build_image(&[
        (b".", 1, b""),
        (b"rtc", 0, b""),
        (b"notelf", 2, b"this file is long enough for a header but is no executable"),
        (b"frame0.txt", 2, b"ascii art would go here\n"),
    ]);
    fs::init(Vec::leak(image)).expect("synthetic image parses");

    test_main();

    trios::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    trios::test_panic_handler(info)
}

/// Build a valid image from `(name, type, content)` triples.
fn build_image(entries: &[(&[u8], u32, &[u8])]) -> Vec<u8> {
    let files: Vec<&(&[u8], u32, &[u8])> =
        entries.iter().filter(|(_, ftype, _)| *ftype == 2).collect();

    let num_inodes = files.len();
    let num_data_blocks: usize = files
        .iter()
        .map(|(_, _, content)| content.len().div_ceil(BLOCK_SIZE).max(1))
        .sum();

    let mut image = vec![0u8; (1 + num_inodes + num_data_blocks) * BLOCK_SIZE];

    image[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    image[4..8].copy_from_slice(&(num_inodes as u32).to_le_bytes());
    image[8..12].copy_from_slice(&(num_data_blocks as u32).to_le_bytes());

    let mut next_inode = 0u32;
    let mut next_block = 0u32;

    for (index, (name, ftype, content)) in entries.iter().enumerate() {
        let offset = (1 + index) * 64;
        image[offset..offset + name.len()].copy_from_slice(name);
        image[offset + 32..offset + 36].copy_from_slice(&ftype.to_le_bytes());

        if *ftype != 2 {
            continue;
        }

        image[offset + 36..offset + 40].copy_from_slice(&next_inode.to_le_bytes());

        let inode_start = (1 + next_inode as usize) * BLOCK_SIZE;
        image[inode_start..inode_start + 4]
            .copy_from_slice(&(content.len() as u32).to_le_bytes());

        for chunk_index in 0..content.len().div_ceil(BLOCK_SIZE).max(1) {
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

#[test_case]
fn test_mounted_image_resolves_names() {
    let fs = fs::system().expect("image is mounted");

    let dentry = fs.read_dentry_by_name(b"frame0.txt").expect("file exists");
    assert_eq!(dentry.file_type, FileType::Regular, "text file is regular");

    let rtc = fs.read_dentry_by_name(b"rtc").expect("device node exists");
    assert_eq!(rtc.file_type, FileType::Rtc, "rtc node has device type");
}

#[test_case]
fn test_directory_enumeration_order() {
    let fs = fs::system().expect("image is mounted");

    let names: Vec<&[u8]> = (0..fs.dentry_count())
        .map(|index| {
            // Dentries keep their image order, which is what directory
            // reads deliver one name at a time.
            fs.read_dentry_by_index(index).expect("index in range")
        })
        .map(|dentry| {
            let name = dentry.name();
            let owned: &[u8] = Vec::leak(name.to_vec());
            owned
        })
        .collect();

    assert_eq!(names[0], b".", "the directory itself comes first");
    assert_eq!(names[3], b"frame0.txt", "entries keep image order");
    assert!(
        fs.read_dentry_by_index(fs.dentry_count()).is_none(),
        "enumeration ends after the last entry",
    );
}

#[test_case]
fn test_file_content_round_trip() {
    let fs = fs::system().expect("image is mounted");
    let dentry = fs.read_dentry_by_name(b"frame0.txt").expect("file exists");

    let mut buf = [0u8; 64];
    let count = fs.read_data(dentry.inode, 0, &mut buf).expect("read ok");
    assert_eq!(
        &buf[..count],
        b"ascii art would go here\n",
        "content must round-trip through the block walk",
    );

    assert_eq!(
        fs.file_length(dentry.inode),
        Ok(count),
        "file length matches what a full read returns",
    );
}

#[test_case]
fn test_execute_rejects_bad_commands() {
    assert_eq!(
        execute(b""),
        Err(SyscallError::BadArgument),
        "an empty command has no program name",
    );
    assert_eq!(
        execute(b"doesnotexist"),
        Err(SyscallError::NotFound),
        "unknown names must not launch",
    );
    assert_eq!(
        execute(b"notelf"),
        Err(SyscallError::BadExecutable),
        "a file without the ELF magic must not launch",
    );
    assert_eq!(
        execute(b"rtc"),
        Err(SyscallError::BadExecutable),
        "device nodes are not executable",
    );
}

#[test_case]
fn test_user_video_map_round_trip() {
    let probe = VirtAddr::new(paging::USER_VIDEO_VIRT);

    paging::map_user_video(paging::vram_frame());
    let mapped = memory::mapper().lock().translate_addr(probe);
    assert_eq!(
        mapped,
        Some(x86_64::PhysAddr::new(paging::VRAM_PHYS)),
        "the vidmap page must point at VRAM after mapping",
    );

    paging::unmap_user_video();
    let unmapped = memory::mapper().lock().translate_addr(probe);
    assert_eq!(unmapped, None, "the vidmap page must vanish after unmapping");
}
