//! Program images: where first-touch pages come from.
//!
//! The pager only asks two things of an image: which section (if any) backs
//! a virtual page, and to copy one page of a section into a frame.
//! [`SectionImage`] holds sections built in memory, [`ElfImage`] takes the
//! loadable segments of an ELF file.

use alloc::{format, string::String, vec::Vec};

use super::{VPNRange, VirtAddr, VirtPageNum};
use crate::{
    config::PAGE_SIZE,
    error::{VmError, VmResult},
    machine::MAX_USER_ADDR,
};

/// A run of pages of the image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSection {
    /// section name, for logs
    pub name:       String,
    /// first page of the section
    pub first_vpn:  VirtPageNum,
    /// number of pages
    pub page_count: usize,
    /// pages may not be written by the process
    pub read_only:  bool,
}

impl ImageSection {
    /// Pages covered by the section
    pub fn vpn_range(&self) -> VPNRange {
        VPNRange::new(
            self.first_vpn,
            VirtPageNum(self.first_vpn.0 + self.page_count),
        )
    }
    /// `vpn` lies in the section
    pub fn contains(&self, vpn: VirtPageNum) -> bool {
        self.vpn_range().contains(vpn)
    }
}

/// Read-only view of an executable
pub trait ProgramImage: Send + Sync {
    /// Sections, in no particular order
    fn sections(&self) -> &[ImageSection];
    /// Address of the first instruction
    fn entry_point(&self) -> usize;
    /// Copy page `page` of section `section` into `frame`; bytes the image
    /// does not supply are zeroed.
    fn load_page(&self, section: usize, page: usize, frame: &mut [u8]);

    /// The section backing `vpn`
    fn section_of(&self, vpn: VirtPageNum) -> Option<(usize, &ImageSection)> {
        self.sections()
            .iter()
            .enumerate()
            .find(|(_, section)| section.contains(vpn))
    }
    /// Pages from 0 up to the end of the last section
    fn page_count(&self) -> usize {
        self.sections()
            .iter()
            .map(|section| section.first_vpn.0 + section.page_count)
            .max()
            .unwrap_or(0)
    }
}

/// Check that no two sections share a page.
pub fn check_sections(sections: &[ImageSection]) -> VmResult<()> {
    let mut ranges: Vec<(usize, usize)> = sections
        .iter()
        .filter(|section| section.page_count > 0)
        .map(|section| (section.first_vpn.0, section.first_vpn.0 + section.page_count))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(VmError::OverlappingSections);
        }
    }
    Ok(())
}

/// An image assembled from in-memory sections
#[derive(Default)]
pub struct SectionImage {
    sections: Vec<ImageSection>,
    contents: Vec<Vec<u8>>,
    entry:    usize,
}

impl SectionImage {
    /// An image with no sections starting at `entry`
    pub fn new(entry: usize) -> Self {
        Self {
            sections: Vec::new(),
            contents: Vec::new(),
            entry,
        }
    }
    /// Append a section of `page_count` pages starting at `first_vpn`.
    ///
    /// `data` is truncated to the section and padded with zeros.
    pub fn with_section(
        mut self,
        name: &str,
        first_vpn: usize,
        page_count: usize,
        read_only: bool,
        data: &[u8],
    ) -> Self {
        let len = data.len().min(page_count * PAGE_SIZE);
        self.sections.push(ImageSection {
            name: String::from(name),
            first_vpn: VirtPageNum(first_vpn),
            page_count,
            read_only,
        });
        self.contents.push(data[..len].to_vec());
        self
    }
}

impl ProgramImage for SectionImage {
    fn sections(&self) -> &[ImageSection] {
        &self.sections
    }
    fn entry_point(&self) -> usize {
        self.entry
    }
    fn load_page(&self, section: usize, page: usize, frame: &mut [u8]) {
        let data = &self.contents[section];
        let start = (page * PAGE_SIZE).min(data.len());
        let end = (start + PAGE_SIZE).min(data.len());
        let n = end - start;
        frame[..n].copy_from_slice(&data[start..end]);
        frame[n..].fill(0);
    }
}

/// File bytes of one loadable segment
struct Segment {
    vaddr:       usize,
    file_offset: usize,
    file_size:   usize,
}

/// An image made of the `PT_LOAD` segments of an ELF file
pub struct ElfImage {
    sections: Vec<ImageSection>,
    segments: Vec<Segment>,
    data:     Vec<u8>,
    entry:    usize,
}

impl ElfImage {
    /// Parse `elf_data`, keeping a copy of it.
    pub fn new(elf_data: &[u8]) -> VmResult<Self> {
        let elf = xmas_elf::ElfFile::new(elf_data).map_err(VmError::BadImage)?;
        let elf_header = elf.header;
        if elf_header.pt1.magic != [0x7f, 0x45, 0x4c, 0x46] {
            return Err(VmError::BadImage("invalid elf!"));
        }
        let ph_count = elf_header.pt2.ph_count();
        let mut sections = Vec::new();
        let mut segments = Vec::new();
        for i in 0..ph_count {
            let ph = elf.program_header(i).map_err(VmError::BadImage)?;
            if ph.get_type().map_err(VmError::BadImage)? != xmas_elf::program::Type::Load {
                continue;
            }
            if ph.mem_size() == 0 {
                continue;
            }
            let file_offset = ph.offset() as usize;
            let file_size = ph.file_size() as usize;
            let file_end = file_offset.checked_add(file_size);
            if ph.file_size() > ph.mem_size() || file_end.map_or(true, |end| end > elf_data.len()) {
                return Err(VmError::BadImage("segment outside the file"));
            }
            let end = ph
                .virtual_addr()
                .checked_add(ph.mem_size())
                .filter(|end| *end <= MAX_USER_ADDR as u64 + 1)
                .ok_or(VmError::BadImage("segment outside the address space"))?;
            let start_va: VirtAddr = (ph.virtual_addr() as usize).into();
            let end_va: VirtAddr = (end as usize).into();
            let ph_flags = ph.flags();
            let section = ImageSection {
                name:       format!("segment{}", i),
                first_vpn:  start_va.floor(),
                page_count: end_va.ceil().0 - start_va.floor().0,
                read_only:  !ph_flags.is_write(),
            };
            debug!(
                "elf: {} [{:#x}, {:#x}) read_only={}",
                section.name, start_va.0, end_va.0, section.read_only
            );
            sections.push(section);
            segments.push(Segment {
                vaddr: start_va.0,
                file_offset,
                file_size,
            });
        }
        check_sections(&sections)?;
        Ok(Self {
            sections,
            segments,
            data: elf_data.to_vec(),
            entry: elf_header.pt2.entry_point() as usize,
        })
    }
}

impl ProgramImage for ElfImage {
    fn sections(&self) -> &[ImageSection] {
        &self.sections
    }
    fn entry_point(&self) -> usize {
        self.entry
    }
    fn load_page(&self, section: usize, page: usize, frame: &mut [u8]) {
        frame.fill(0);
        let segment = &self.segments[section];
        let page_va = VirtAddr::from(VirtPageNum(self.sections[section].first_vpn.0 + page)).0;
        let lo = page_va.max(segment.vaddr);
        let hi = (page_va + PAGE_SIZE).min(segment.vaddr + segment.file_size);
        if lo < hi {
            let src = segment.file_offset + (lo - segment.vaddr);
            frame[lo - page_va..hi - page_va].copy_from_slice(&self.data[src..src + (hi - lo)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn section_image_pads_with_zeros() {
        let mut code = vec![0xaa; PAGE_SIZE];
        code.extend_from_slice(&[0xbb; 10]);
        let image = SectionImage::new(0)
            .with_section(".text", 0, 2, true, &code)
            .with_section(".data", 2, 1, false, b"hello");
        assert_eq!(image.page_count(), 3);
        assert_eq!(image.section_of(VirtPageNum(1)).unwrap().0, 0);
        assert_eq!(image.section_of(VirtPageNum(2)).unwrap().1.name, ".data");
        assert!(image.section_of(VirtPageNum(3)).is_none());

        let mut frame = vec![0xff; PAGE_SIZE];
        image.load_page(0, 1, &mut frame);
        assert_eq!(&frame[..10], &[0xbb; 10]);
        assert!(frame[10..].iter().all(|b| *b == 0));
        image.load_page(1, 0, &mut frame);
        assert_eq!(&frame[..5], b"hello");
        assert!(frame[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn overlapping_sections_are_rejected() {
        let image = SectionImage::new(0)
            .with_section(".text", 0, 2, true, &[])
            .with_section(".data", 1, 1, false, &[]);
        assert_eq!(check_sections(image.sections()), Err(VmError::OverlappingSections));
        let image = SectionImage::new(0)
            .with_section(".data", 4, 1, false, &[])
            .with_section(".text", 0, 4, true, &[]);
        assert_eq!(check_sections(image.sections()), Ok(()));
    }

    /// A little-endian ELF64 file with one `PT_LOAD` segment.
    fn elf_with_segment(vaddr: u64, flags: u32, payload: &[u8], mem_size: u64) -> Vec<u8> {
        const EHDR: usize = 64;
        const PHDR: usize = 56;
        let mut elf = vec![0u8; EHDR + PHDR];
        elf[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        elf[4] = 2; // 64-bit
        elf[5] = 1; // little endian
        elf[6] = 1; // version
        elf[16..18].copy_from_slice(&2u16.to_le_bytes()); // executable
        elf[18..20].copy_from_slice(&0xf3u16.to_le_bytes()); // RISC-V
        elf[20..24].copy_from_slice(&1u32.to_le_bytes());
        elf[24..32].copy_from_slice(&(vaddr + 4).to_le_bytes()); // entry
        elf[32..40].copy_from_slice(&(EHDR as u64).to_le_bytes()); // phoff
        elf[52..54].copy_from_slice(&(EHDR as u16).to_le_bytes());
        elf[54..56].copy_from_slice(&(PHDR as u16).to_le_bytes());
        elf[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum
        elf[58..60].copy_from_slice(&64u16.to_le_bytes());
        let ph = EHDR;
        let offset = (EHDR + PHDR) as u64;
        elf[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        elf[ph + 4..ph + 8].copy_from_slice(&flags.to_le_bytes());
        elf[ph + 8..ph + 16].copy_from_slice(&offset.to_le_bytes());
        elf[ph + 16..ph + 24].copy_from_slice(&vaddr.to_le_bytes());
        elf[ph + 24..ph + 32].copy_from_slice(&vaddr.to_le_bytes());
        elf[ph + 32..ph + 40].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        elf[ph + 40..ph + 48].copy_from_slice(&mem_size.to_le_bytes());
        elf[ph + 48..ph + 56].copy_from_slice(&(PAGE_SIZE as u64).to_le_bytes());
        elf.extend_from_slice(payload);
        elf
    }

    #[test]
    fn elf_segments_become_sections() {
        // R+W data segment starting mid-page, with a bss tail
        let vaddr = (2 * PAGE_SIZE + 16) as u64;
        let payload: Vec<u8> = (0..PAGE_SIZE as u32).map(|i| i as u8).collect();
        let elf = elf_with_segment(vaddr, 0b110, &payload, 2 * PAGE_SIZE as u64);
        let image = ElfImage::new(&elf).unwrap();
        assert_eq!(image.entry_point(), vaddr as usize + 4);
        assert_eq!(image.sections().len(), 1);
        let section = &image.sections()[0];
        assert_eq!(section.first_vpn, VirtPageNum(2));
        assert_eq!(section.page_count, 3);
        assert!(!section.read_only);

        let mut frame = vec![0xff; PAGE_SIZE];
        image.load_page(0, 0, &mut frame);
        assert!(frame[..16].iter().all(|b| *b == 0));
        assert_eq!(&frame[16..], &payload[..PAGE_SIZE - 16]);
        image.load_page(0, 1, &mut frame);
        assert_eq!(&frame[..16], &payload[PAGE_SIZE - 16..]);
        assert!(frame[16..].iter().all(|b| *b == 0));
        image.load_page(0, 2, &mut frame);
        assert!(frame.iter().all(|b| *b == 0));
    }

    #[test]
    fn elf_text_is_read_only() {
        let elf = elf_with_segment(0, 0b101, b"code", PAGE_SIZE as u64);
        let image = ElfImage::new(&elf).unwrap();
        assert!(image.sections()[0].read_only);
    }

    #[test]
    fn garbage_is_not_an_elf() {
        assert!(matches!(
            ElfImage::new(&[0u8; 128]),
            Err(VmError::BadImage(_))
        ));
    }

    #[test]
    fn segments_past_the_address_space_are_rejected() {
        let elf = elf_with_segment(0xffff_ffff_ffff_f000, 0b110, b"data", 0x2000);
        assert!(matches!(
            ElfImage::new(&elf),
            Err(VmError::BadImage("segment outside the address space"))
        ));
        let high = elf_with_segment(0x8000_0000, 0b110, b"data", PAGE_SIZE as u64);
        assert!(ElfImage::new(&high).is_err());
    }

    #[test]
    fn file_offsets_that_wrap_are_rejected() {
        let mut elf = elf_with_segment(0, 0b110, b"data", PAGE_SIZE as u64);
        // p_offset of the only program header
        elf[64 + 8..64 + 16].copy_from_slice(&(u64::MAX - 1).to_le_bytes());
        assert!(matches!(
            ElfImage::new(&elf),
            Err(VmError::BadImage("segment outside the file"))
        ));
    }
}
