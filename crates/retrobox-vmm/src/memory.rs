//! Guest physical memory, boot GDT, and identity page directory.
//!
//! The guest sees a single contiguous RAM region starting at physical 0.
//! Before the first VCPU run the VM writes three boot-time structures into
//! it:
//!
//! ```text
//! 0x0000_0000  ┌───────────────────────────┐
//!              │  Boot image (byte-exact)   │
//! 0x0000_0500  ├───────────────────────────┤
//!              │  GDT (3 × 8-byte entries)  │
//! 0x0000_1000  ├───────────────────────────┤
//!              │  Page directory (4 KiB)    │
//! 0x0000_2000  ├───────────────────────────┤
//!              │  ...                       │
//!              └───────────────────────────┘
//! ```
//!
//! The page directory's first entry identity-maps the first 4 MiB with a
//! large page; the guest enables paging itself if it wants it, `CR3`
//! already points here.

use kvm_bindings::kvm_segment;
use log::info;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

// ═══════════════════════════════════════════════════════════════════════
//  Memory layout constants
// ═══════════════════════════════════════════════════════════════════════

/// Smallest supported guest memory size (1 MiB).
pub const MIN_MEMORY_SIZE: usize = 0x10_0000;

/// Offset of the boot GDT in guest physical memory.
pub const BOOT_GDT_OFFSET: u64 = 0x500;

/// Number of boot GDT entries: NULL, 32-bit code, 32-bit data.
pub const GDT_ENTRY_COUNT: usize = 3;

/// GDT limit loaded into `sregs.gdt.limit` (3 entries × 8 bytes − 1).
pub const BOOT_GDT_LIMIT: u16 = (GDT_ENTRY_COUNT as u16) * 8 - 1;

/// Offset of the boot page directory (one 4 KiB page).
pub const PAGE_DIR_OFFSET: u64 = 0x1000;

/// Number of 32-bit entries in the page directory.
const PAGE_DIR_ENTRY_COUNT: usize = 1024;

/// GDT table index for the 32-bit code segment (selector `0x08`).
pub const GDT_INDEX_CODE: u8 = 1;

/// GDT table index for the 32-bit data segment (selector `0x10`).
pub const GDT_INDEX_DATA: u8 = 2;

/// Flags for the 32-bit code segment (ring 0, execute-read).
///
/// - Access byte `0x9A`: present, DPL=0, code/data (S=1), type=1010
///   (code, conforming=0, readable=1).
/// - Flags nibble `0xC`: granularity=1, D/B=1 (32-bit), L=0, AVL=0.
pub const GDT_FLAGS_CODE32: u16 = 0xc09a;

/// Flags for the 32-bit data segment (ring 0, read-write).
///
/// - Access byte `0x92`: present, DPL=0, code/data (S=1), type=0010
///   (data, expand-up, writable).
/// - Flags nibble `0xC`: granularity=1, D/B=1 (32-bit), L=0, AVL=0.
pub const GDT_FLAGS_DATA32: u16 = 0xc092;

// Page-directory entry bits (32-bit paging).
const PDE_PRESENT: u32 = 1 << 0;
const PDE_WRITABLE: u32 = 1 << 1;
const PDE_USER: u32 = 1 << 2;
const PDE_PAGE_SIZE: u32 = 1 << 7;

/// Entry 0 of the boot page directory: a 4 MiB page at physical 0,
/// present, writable, user-accessible.
pub const BOOT_PDE: u32 = PDE_PRESENT | PDE_WRITABLE | PDE_USER | PDE_PAGE_SIZE;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors from guest memory setup.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("guest memory size {size:#x} is below the {MIN_MEMORY_SIZE:#x} byte minimum")]
    TooSmall { size: usize },

    #[error("failed to create guest memory region of {size} bytes")]
    Create { size: usize },

    #[error("failed to write to guest memory at {address:#x}")]
    Write { address: u64 },

    #[error("boot image of {len} bytes does not fit in {size} bytes of guest memory")]
    ImageTooLarge { len: usize, size: usize },
}

// ═══════════════════════════════════════════════════════════════════════
//  GuestRam
// ═══════════════════════════════════════════════════════════════════════

/// The guest's RAM: one anonymous, read/write mapping registered with KVM
/// at guest physical 0.
///
/// The underlying mapping uses interior mutability, so the setup methods
/// take `&self`, matching the `vm-memory` API.
#[derive(Debug)]
pub struct GuestRam {
    memory: GuestMemoryMmap,
    size: usize,
}

impl GuestRam {
    /// Allocate `size` bytes of zeroed guest memory.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size < MIN_MEMORY_SIZE {
            return Err(MemoryError::TooSmall { size });
        }
        let memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size)])
            .map_err(|_| MemoryError::Create { size })?;

        info!("guest memory created: {} MiB", size / (1024 * 1024));
        Ok(Self { memory, size })
    }

    /// Copy the boot image to guest physical 0, byte for byte.
    pub fn load_image(&self, image: &[u8]) -> Result<(), MemoryError> {
        if image.len() > self.size {
            return Err(MemoryError::ImageTooLarge {
                len: image.len(),
                size: self.size,
            });
        }
        self.memory
            .write_slice(image, GuestAddress(0))
            .map_err(|_| MemoryError::Write { address: 0 })?;
        info!("boot image loaded: {} bytes at 0x0", image.len());
        Ok(())
    }

    /// Write the three-entry boot GDT at [`BOOT_GDT_OFFSET`].
    pub fn setup_gdt(&self) -> Result<(), MemoryError> {
        let gdt_table: [u64; GDT_ENTRY_COUNT] = [
            0,                                        // NULL descriptor
            gdt_entry(GDT_FLAGS_CODE32, 0, 0xfffff),  // flat code
            gdt_entry(GDT_FLAGS_DATA32, 0, 0xfffff),  // flat data
        ];
        for (i, entry) in gdt_table.iter().enumerate() {
            let addr = BOOT_GDT_OFFSET + (i as u64 * 8);
            self.memory
                .write_obj(*entry, GuestAddress(addr))
                .map_err(|_| MemoryError::Write { address: addr })?;
        }
        info!("GDT written at {BOOT_GDT_OFFSET:#x} ({GDT_ENTRY_COUNT} entries)");
        Ok(())
    }

    /// Write the boot page directory at [`PAGE_DIR_OFFSET`]: entry 0
    /// identity-maps the first 4 MiB, entries 1..1023 are zero.
    pub fn setup_page_directory(&self) -> Result<(), MemoryError> {
        let zeroes = [0u8; PAGE_DIR_ENTRY_COUNT * 4];
        self.memory
            .write_slice(&zeroes, GuestAddress(PAGE_DIR_OFFSET))
            .map_err(|_| MemoryError::Write {
                address: PAGE_DIR_OFFSET,
            })?;
        self.memory
            .write_obj(BOOT_PDE, GuestAddress(PAGE_DIR_OFFSET))
            .map_err(|_| MemoryError::Write {
                address: PAGE_DIR_OFFSET,
            })?;
        info!("page directory written at {PAGE_DIR_OFFSET:#x} (4 MiB identity map)");
        Ok(())
    }

    /// The underlying [`GuestMemoryMmap`].
    #[inline]
    pub fn inner(&self) -> &GuestMemoryMmap {
        &self.memory
    }

    /// Host virtual address of guest physical 0, for
    /// `kvm_userspace_memory_region.userspace_addr`.
    pub fn host_address(&self) -> u64 {
        self.memory
            .get_host_address(GuestAddress(0))
            .expect("failed to resolve host address for guest memory") as u64
    }

    /// Total guest memory size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  GDT helpers
// ═══════════════════════════════════════════════════════════════════════

/// Construct a raw 8-byte GDT descriptor from flags, base, and limit.
///
/// `flags[7:0]` is the access byte (descriptor byte 5); `flags[15:12]` is
/// the flags nibble (G, D/B, L, AVL) of descriptor byte 6.
pub fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((u64::from(base) & 0xff00_0000u64) << (56 - 24))
        | ((u64::from(flags) & 0x0000_f0ffu64) << 40)
        | ((u64::from(limit) & 0x000f_0000u64) << (48 - 16))
        | ((u64::from(base) & 0x00ff_ffffu64) << 16)
        | (u64::from(limit) & 0x0000_ffffu64)
}

/// Convert a raw GDT descriptor into a KVM segment register.
///
/// `table_index` is the GDT entry number; the selector is `index * 8`.
/// A descriptor without the Present bit is marked unusable.
pub fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    kvm_segment {
        base: get_base(entry),
        limit: get_limit(entry),
        selector: u16::from(table_index) * 8,
        type_: get_type(entry),
        present: get_p(entry),
        dpl: get_dpl(entry),
        db: get_db(entry),
        s: get_s(entry),
        l: get_l(entry),
        g: get_g(entry),
        avl: get_avl(entry),
        padding: 0,
        unusable: if get_p(entry) == 0 { 1 } else { 0 },
    }
}

/// The flat 32-bit code segment (GDT index 1, selector `0x08`).
pub fn code32_segment() -> kvm_segment {
    kvm_segment_from_gdt(gdt_entry(GDT_FLAGS_CODE32, 0, 0xfffff), GDT_INDEX_CODE)
}

/// The flat 32-bit data segment (GDT index 2, selector `0x10`).
pub fn data32_segment() -> kvm_segment {
    kvm_segment_from_gdt(gdt_entry(GDT_FLAGS_DATA32, 0, 0xfffff), GDT_INDEX_DATA)
}

// ─── GDT field extraction ────────────────────────────────────────────
//
// Bit layout of an 8-byte x86 segment descriptor:
//
//   Bits 63:56 — Base [31:24]
//   Bit  55    — Granularity (G)
//   Bit  54    — Default operation size (D/B)
//   Bit  53    — 64-bit code segment (L)
//   Bit  52    — Available (AVL)
//   Bits 51:48 — Limit [19:16]
//   Bit  47    — Present (P)
//   Bits 46:45 — DPL
//   Bit  44    — Descriptor type (S)
//   Bits 43:40 — Type
//   Bits 39:16 — Base [23:0]
//   Bits 15:0  — Limit [15:0]

fn get_base(entry: u64) -> u64 {
    ((entry & 0xff00_0000_0000_0000) >> 32)
        | ((entry & 0x0000_00ff_0000_0000) >> 16)
        | ((entry & 0x0000_0000_ffff_0000) >> 16)
}

/// When the granularity bit is set the 20-bit limit counts 4 KiB units;
/// the low 12 bits of the effective limit read back as 1s.
fn get_limit(entry: u64) -> u32 {
    let raw = (((entry & 0x000f_0000_0000_0000) >> 32) | (entry & 0x0000_0000_0000_ffff)) as u32;
    match get_g(entry) {
        0 => raw,
        _ => (raw << 12) | 0xfff,
    }
}

fn get_g(entry: u64) -> u8 {
    ((entry & 0x0080_0000_0000_0000) >> 55) as u8
}

fn get_db(entry: u64) -> u8 {
    ((entry & 0x0040_0000_0000_0000) >> 54) as u8
}

fn get_l(entry: u64) -> u8 {
    ((entry & 0x0020_0000_0000_0000) >> 53) as u8
}

fn get_avl(entry: u64) -> u8 {
    ((entry & 0x0010_0000_0000_0000) >> 52) as u8
}

fn get_p(entry: u64) -> u8 {
    ((entry & 0x0000_8000_0000_0000) >> 47) as u8
}

fn get_dpl(entry: u64) -> u8 {
    ((entry & 0x0000_6000_0000_0000) >> 45) as u8
}

fn get_s(entry: u64) -> u8 {
    ((entry & 0x0000_1000_0000_0000) >> 44) as u8
}

fn get_type(entry: u64) -> u8 {
    ((entry & 0x0000_0f00_0000_0000) >> 40) as u8
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants_are_ordered() {
        const {
            assert!(BOOT_GDT_OFFSET + (GDT_ENTRY_COUNT as u64) * 8 <= PAGE_DIR_OFFSET);
            assert!(PAGE_DIR_OFFSET + (PAGE_DIR_ENTRY_COUNT as u64) * 4 <= MIN_MEMORY_SIZE as u64);
        }
    }

    #[test]
    fn gdt_limit_covers_three_entries() {
        assert_eq!(BOOT_GDT_LIMIT, 23);
    }

    #[test]
    fn gdt_null_entry_is_zero() {
        assert_eq!(gdt_entry(0, 0, 0), 0);
    }

    #[test]
    fn gdt_code32_properties() {
        let entry = gdt_entry(GDT_FLAGS_CODE32, 0, 0xfffff);
        assert_eq!(get_p(entry), 1);
        assert_eq!(get_dpl(entry), 0);
        assert_eq!(get_s(entry), 1);
        assert_eq!(get_l(entry), 0, "not long mode");
        assert_eq!(get_db(entry), 1, "32-bit default size");
        assert_eq!(get_g(entry), 1);
        assert_eq!(get_type(entry) & 0x8, 0x8, "executable");
        assert_eq!(get_type(entry) & 0x2, 0x2, "readable");
    }

    #[test]
    fn gdt_data32_properties() {
        let entry = gdt_entry(GDT_FLAGS_DATA32, 0, 0xfffff);
        assert_eq!(get_p(entry), 1);
        assert_eq!(get_s(entry), 1);
        assert_eq!(get_type(entry) & 0x8, 0, "not executable");
        assert_eq!(get_type(entry) & 0x2, 0x2, "writable");
    }

    #[test]
    fn gdt_limit_is_four_gib_with_granularity() {
        let entry = gdt_entry(GDT_FLAGS_DATA32, 0, 0xfffff);
        assert_eq!(get_limit(entry), 0xffff_ffff);
    }

    #[test]
    fn gdt_base_roundtrip() {
        let entry = gdt_entry(GDT_FLAGS_DATA32, 0x1234_5678, 0xfffff);
        assert_eq!(get_base(entry), 0x1234_5678);
    }

    #[test]
    fn segment_selectors() {
        assert_eq!(code32_segment().selector, 0x08);
        assert_eq!(data32_segment().selector, 0x10);
    }

    #[test]
    fn code_segment_is_usable_and_executable() {
        let cs = code32_segment();
        assert_eq!(cs.present, 1);
        assert_eq!(cs.unusable, 0);
        assert_eq!(cs.db, 1);
        assert_eq!(cs.l, 0);
        assert_ne!(cs.type_ & 0x8, 0);
    }

    #[test]
    fn null_descriptor_is_unusable() {
        let seg = kvm_segment_from_gdt(0, 0);
        assert_eq!(seg.present, 0);
        assert_eq!(seg.unusable, 1);
    }

    #[test]
    fn boot_pde_flags() {
        assert_eq!(BOOT_PDE, 0x87);
        assert_eq!(BOOT_PDE & 0xffc0_0000, 0, "maps physical 0");
    }

    #[test]
    fn rejects_sub_megabyte_memory() {
        let err = GuestRam::new(0x8_0000).unwrap_err();
        assert!(matches!(err, MemoryError::TooSmall { .. }));
    }

    #[test]
    fn create_and_query_guest_ram() {
        let ram = GuestRam::new(2 * 1024 * 1024).unwrap();
        assert_eq!(ram.size(), 2 * 1024 * 1024);
        assert_ne!(ram.host_address(), 0);
    }

    #[test]
    fn load_image_writes_bytes_at_zero() {
        let ram = GuestRam::new(MIN_MEMORY_SIZE).unwrap();
        let image = [0xea, 0x05, 0x00, 0x08, 0x00];
        ram.load_image(&image).unwrap();

        let mut readback = [0u8; 5];
        ram.inner()
            .read_slice(&mut readback, GuestAddress(0))
            .unwrap();
        assert_eq!(readback, image);
    }

    #[test]
    fn load_image_rejects_oversized() {
        let ram = GuestRam::new(MIN_MEMORY_SIZE).unwrap();
        let image = vec![0u8; MIN_MEMORY_SIZE + 1];
        let err = ram.load_image(&image).unwrap_err();
        assert!(matches!(err, MemoryError::ImageTooLarge { .. }));
    }

    #[test]
    fn setup_gdt_writes_descriptors() {
        let ram = GuestRam::new(MIN_MEMORY_SIZE).unwrap();
        ram.setup_gdt().unwrap();

        let null: u64 = ram.inner().read_obj(GuestAddress(BOOT_GDT_OFFSET)).unwrap();
        assert_eq!(null, 0);

        let code: u64 = ram
            .inner()
            .read_obj(GuestAddress(BOOT_GDT_OFFSET + 8))
            .unwrap();
        assert_eq!(code, gdt_entry(GDT_FLAGS_CODE32, 0, 0xfffff));

        let data: u64 = ram
            .inner()
            .read_obj(GuestAddress(BOOT_GDT_OFFSET + 16))
            .unwrap();
        assert_eq!(data, gdt_entry(GDT_FLAGS_DATA32, 0, 0xfffff));
    }

    #[test]
    fn setup_page_directory_identity_maps_first_entry() {
        let ram = GuestRam::new(MIN_MEMORY_SIZE).unwrap();
        ram.setup_page_directory().unwrap();

        let pde0: u32 = ram.inner().read_obj(GuestAddress(PAGE_DIR_OFFSET)).unwrap();
        assert_eq!(pde0, BOOT_PDE);

        for i in [1u64, 511, 1023] {
            let pde: u32 = ram
                .inner()
                .read_obj(GuestAddress(PAGE_DIR_OFFSET + i * 4))
                .unwrap();
            assert_eq!(pde, 0, "entry {i} must be zero");
        }
    }
}
