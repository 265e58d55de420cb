use goblin::elf::program_header::PT_LOAD;
use log::debug;

/// A contiguous piece of an image and the target address it belongs at.
#[derive(Debug)]
pub struct Segment<'a> {
    pub address: u32,
    pub data: &'a [u8],
}

/// Split an ELF file into its loadable segments.
pub fn elf_segments(elf: &[u8]) -> Result<Vec<Segment<'_>>, goblin::error::Error> {
    let header = goblin::elf::Elf::parse(elf)?;

    let mut segments = Vec::new();
    for h in header
        .program_headers
        .iter()
        .filter(|h| h.p_type == PT_LOAD && h.p_filesz > 0)
    {
        let Some(data) = elf.get(h.file_range()) else {
            return Err(goblin::error::Error::Malformed(format!(
                "segment at {:#010x} extends past the end of the file",
                h.p_paddr
            )));
        };
        debug!(
            "Segment [{:#010x?}..{:#010x?}] from file offset {:#x}",
            h.p_paddr,
            h.p_paddr + h.p_filesz,
            h.p_offset,
        );
        segments.push(Segment {
            address: h.p_paddr as u32,
            data,
        });
    }
    Ok(segments)
}

/// A raw image is a single segment.
pub fn raw_segments(image: &[u8], base: u32) -> Vec<Segment<'_>> {
    vec![Segment {
        address: base,
        data: image,
    }]
}
