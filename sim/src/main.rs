use std::fs;

use clap::Parser;
use goblin::elf::{program_header::PT_LOAD, Elf};
use zamlet_sim::address::{GlobalAddress, Ordering, WordOrder};
use zamlet_sim::tlb::MemoryType;
use zamlet_sim::{Lamlet, MemoryError, Params};

/// Loads an ELF image's PT_LOAD segments into a lamlet's scalar memory and
/// exercises the vector-memory-subsystem simulator against it.
///
/// Real RISC-V fetch/decode is out of scope (see the crate's docs); this
/// only drives address translation, cache, and memlet wiring end to end
/// against a real binary's segment layout, then watches `tohost` for an
/// HTIF exit if asked to.
#[derive(Parser, Debug)]
#[command(name = "zamlet-sim")]
struct Cli {
    /// ELF binary whose PT_LOAD segments get staged into scalar memory.
    elf: String,

    /// Byte address of the HTIF `tohost` magic_mem block, if the image wants
    /// its writes to stdout/stderr observed.
    #[arg(long, value_parser = parse_hex)]
    tohost: Option<u64>,

    /// Emit debug-level logging in addition to info.
    #[arg(short, long)]
    verbose: bool,
}

fn parse_hex(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Stages every `PT_LOAD` segment of `image` into `lamlet`'s scalar memory,
/// returning the page-rounded `[start, start + len)` region that was
/// allocated to hold them.
fn load_elf_segments(lamlet: &mut Lamlet, image: &[u8]) -> Result<(u64, u64), Box<dyn std::error::Error>> {
    let elf = Elf::parse(image)?;
    let page_bytes = lamlet.params().page_bytes as u64;
    let mut lo = u64::MAX;
    let mut hi = 0u64;

    for phdr in elf.program_headers.iter().filter(|p| p.p_type == PT_LOAD) {
        let load_addr = if phdr.p_paddr != 0 { phdr.p_paddr } else { phdr.p_vaddr };
        lo = lo.min(load_addr);
        hi = hi.max(load_addr + phdr.p_memsz);
    }
    if hi <= lo {
        return Err("ELF file has no PT_LOAD segments".into());
    }

    let region_start = (lo / page_bytes) * page_bytes;
    let region_len = ((hi - region_start) + page_bytes - 1) / page_bytes * page_bytes;
    lamlet.allocate_memory(
        GlobalAddress::from_byte_addr(region_start),
        region_len,
        MemoryType::ScalarIdempotent,
        Some(Ordering { word_order: WordOrder::Standard, ew: 8 }),
        true,
        true,
    )?;

    for phdr in elf.program_headers.iter().filter(|p| p.p_type == PT_LOAD) {
        let load_addr = if phdr.p_paddr != 0 { phdr.p_paddr } else { phdr.p_vaddr };
        let start = phdr.p_offset as usize;
        let end = start + phdr.p_filesz as usize;
        let segment = &image[start..end];
        if !segment.is_empty() {
            lamlet.set_memory(GlobalAddress::from_byte_addr(load_addr), segment)?;
        }
        if phdr.p_memsz > phdr.p_filesz {
            let zero_len = (phdr.p_memsz - phdr.p_filesz) as usize;
            let zero_base = load_addr + phdr.p_filesz;
            lamlet.set_memory(GlobalAddress::from_byte_addr(zero_base), &vec![0u8; zero_len])?;
        }
    }

    Ok((region_start, region_len))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let params = Params::toy();
    log::info!(
        "starting simulation: elf={}, j_in_l={}, k_in_l={}",
        cli.elf,
        params.j_in_l(),
        params.k_in_l
    );

    let mut lamlet = Lamlet::new(params);
    let image = fs::read(&cli.elf)?;
    let (region_start, region_len) = load_elf_segments(&mut lamlet, &image)?;
    log::info!(
        "staged ELF segments into scalar memory [{:#x}, {:#x})",
        region_start,
        region_start + region_len
    );

    if let Some(tohost) = cli.tohost {
        match lamlet.handle_tohost(GlobalAddress::from_byte_addr(tohost)) {
            Ok(Some(exit)) => {
                log::info!("htif exit: {}", exit);
                std::process::exit(exit.exit_code as i32);
            }
            Ok(None) => log::info!("tohost write observed, no exit requested"),
            Err(MemoryError::PageFault(addr)) => {
                log::warn!("tohost magic_mem at {:#x} is unmapped; nothing to observe yet", addr);
            }
            Err(err) => return Err(Box::new(err)),
        }
    } else {
        log::info!("no --tohost address given; exiting after staging the image");
    }

    Ok(())
}
